/// Path component of an `http(s)://host[:port]/a/b` base URL, split into segments.
fn base_path_segments(base: &str) -> Vec<&str> {
    let after_scheme = base.split_once("://").map(|(_, rest)| rest).unwrap_or(base);
    let path = after_scheme
        .find('/')
        .map(|idx| &after_scheme[idx..])
        .unwrap_or("");
    path.split('/').filter(|s| !s.is_empty()).collect()
}

/// Ollama-style clients send `api/tags` to a base that already ends in
/// `/api/v1`. When the first segment names one of the base path's trailing
/// namespace segments (its last, or the one before it), drop that segment
/// once. At least one segment must remain.
fn strip_duplicated_base_segment<'a>(base: &str, path: &'a str) -> &'a str {
    let base_segments = base_path_segments(base);
    let tail = &base_segments[base_segments.len().saturating_sub(2)..];
    match path.split_once('/') {
        Some((first, rest)) if !rest.is_empty() && tail.contains(&first) => rest,
        _ => path,
    }
}

/// Build `<base>/<path>[?query]`.
///
/// `base` must not end with `/`; `path` is relative to the mount prefix and
/// may start with `/`.
pub fn map_target(base: &str, path: &str, query: Option<&str>) -> String {
    let path = path.trim_start_matches('/');
    let path = strip_duplicated_base_segment(base, path);
    let mut url = format!("{base}/{path}");
    if let Some(q) = query
        && !q.is_empty()
    {
        url.push('?');
        url.push_str(q);
    }
    url
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;

    const BASE: &str = "https://api.venice.ai/api/v1";

    #[test]
    fn plain_paths_are_appended() {
        assert_eq!(
            map_target(BASE, "chat/completions", None),
            "https://api.venice.ai/api/v1/chat/completions"
        );
        assert_eq!(
            map_target(BASE, "/models", Some("")),
            "https://api.venice.ai/api/v1/models"
        );
    }

    #[test]
    fn duplicated_namespace_is_removed_once() {
        assert_eq!(
            map_target(BASE, "api/tags", None),
            "https://api.venice.ai/api/v1/tags"
        );
        assert_eq!(
            map_target(BASE, "api/v1/models", None),
            "https://api.venice.ai/api/v1/v1/models"
        );
        assert_eq!(
            map_target(BASE, "api/api/tags", None),
            "https://api.venice.ai/api/v1/api/tags"
        );
    }

    #[test]
    fn namespace_matches_the_end_of_a_prefixed_base() {
        let base = "https://gw.example/venice/api/v1";
        assert_eq!(
            map_target(base, "api/tags", None),
            "https://gw.example/venice/api/v1/tags"
        );
        assert_eq!(
            map_target(base, "venice/models", None),
            "https://gw.example/venice/api/v1/venice/models"
        );
    }

    #[test]
    fn single_segment_base_strips_its_own_name() {
        assert_eq!(
            map_target("http://127.0.0.1:11434/api", "api/tags", None),
            "http://127.0.0.1:11434/api/tags"
        );
    }

    #[test]
    fn lone_namespace_segment_is_kept() {
        assert_eq!(map_target(BASE, "api", None), "https://api.venice.ai/api/v1/api");
    }

    #[test]
    fn bases_without_a_path_never_strip() {
        assert_eq!(
            map_target("http://127.0.0.1:8080", "api/tags", None),
            "http://127.0.0.1:8080/api/tags"
        );
    }

    #[test]
    fn query_is_appended_unchanged() {
        assert_eq!(
            map_target(BASE, "models", Some("type=text&limit=5")),
            "https://api.venice.ai/api/v1/models?type=text&limit=5"
        );
    }
}
