use std::sync::OnceLock;

use axum::http::HeaderMap;
use base64::Engine;
use serde::Serialize;
use tracing::warn;

const DEFAULT_BODY_MAX: usize = 2048;

/// Byte cap for bodies quoted in diagnostics (`VENICE_PROXY_LOG_BODY_MAX`).
pub fn log_body_max() -> usize {
    static MAX: OnceLock<usize> = OnceLock::new();
    *MAX.get_or_init(|| {
        std::env::var("VENICE_PROXY_LOG_BODY_MAX")
            .ok()
            .and_then(|s| s.trim().parse::<usize>().ok())
            .filter(|&n| n > 0)
            .unwrap_or(DEFAULT_BODY_MAX)
    })
}

#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct HeaderEntry {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct BodyPreview {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    pub encoding: String,
    pub data: String,
    pub truncated: bool,
    pub original_len: usize,
}

fn normalize_content_type(content_type: Option<&str>) -> Option<&str> {
    let ct = content_type?.trim();
    let (base, _) = ct.split_once(';').unwrap_or((ct, ""));
    let base = base.trim();
    if base.is_empty() { None } else { Some(base) }
}

/// Quote at most `max` bytes of a body: as text when they decode as UTF-8,
/// otherwise base64. A cut through a multi-byte character still counts as
/// text; only the incomplete tail is dropped.
pub fn make_body_preview(bytes: &[u8], content_type: Option<&str>, max: usize) -> BodyPreview {
    let original_len = bytes.len();
    let take = original_len.min(max);
    let truncated = original_len > take;
    let slice = &bytes[..take];
    let content_type = normalize_content_type(content_type).map(|s| s.to_string());

    let text = match std::str::from_utf8(slice) {
        Ok(s) => Some(s),
        Err(e) if truncated && e.error_len().is_none() => {
            std::str::from_utf8(&slice[..e.valid_up_to()]).ok()
        }
        Err(_) => None,
    };

    match text {
        Some(text) => BodyPreview {
            content_type,
            encoding: "utf8".to_string(),
            data: text.to_string(),
            truncated,
            original_len,
        },
        None => BodyPreview {
            content_type,
            encoding: "base64".to_string(),
            data: base64::engine::general_purpose::STANDARD.encode(slice),
            truncated,
            original_len,
        },
    }
}

/// Every `x-ratelimit-*` header that is present, in header order.
pub fn rate_limit_headers(headers: &HeaderMap) -> Vec<HeaderEntry> {
    headers
        .iter()
        .filter(|(name, _)| name.as_str().starts_with("x-ratelimit-"))
        .map(|(name, value)| HeaderEntry {
            name: name.as_str().to_string(),
            value: String::from_utf8_lossy(value.as_bytes()).into_owned(),
        })
        .collect()
}

#[derive(Debug, Serialize)]
pub struct UpstreamErrorReport<'a> {
    pub method: &'a str,
    pub url: &'a str,
    pub status: u16,
    pub rate_limit_headers: Vec<HeaderEntry>,
    pub response_body: BodyPreview,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_body: Option<BodyPreview>,
}

/// Emit the diagnostic for an upstream reply with status >= 400.
pub fn log_upstream_error(
    method: &str,
    url: &str,
    status: u16,
    response_headers: &HeaderMap,
    response_body: &[u8],
    request_body: &[u8],
) {
    let max = log_body_max();
    let content_type = response_headers
        .get("content-type")
        .and_then(|v| v.to_str().ok());
    let report = UpstreamErrorReport {
        method,
        url,
        status,
        rate_limit_headers: rate_limit_headers(response_headers),
        response_body: make_body_preview(response_body, content_type, max),
        request_body: (!request_body.is_empty())
            .then(|| make_body_preview(request_body, Some("application/json"), max)),
    };
    let encoded = serde_json::to_string(&report).unwrap_or_else(|e| e.to_string());
    warn!(status, url, report = %encoded, "upstream returned an error");
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;

    #[test]
    fn text_preview_is_truncated_at_max() {
        let p = make_body_preview(b"rate limited, retry later", Some("text/plain; charset=utf-8"), 12);
        assert_eq!(p.encoding, "utf8");
        assert_eq!(p.data, "rate limited");
        assert!(p.truncated);
        assert_eq!(p.original_len, 25);
        assert_eq!(p.content_type.as_deref(), Some("text/plain"));
    }

    #[test]
    fn cut_through_multibyte_char_stays_text() {
        let body = "ab\u{00e9}".as_bytes();
        let p = make_body_preview(body, None, 3);
        assert_eq!(p.encoding, "utf8");
        assert_eq!(p.data, "ab");
    }

    #[test]
    fn binary_preview_is_base64() {
        let p = make_body_preview(&[0xff, 0x00, 0x10], Some("application/octet-stream"), 64);
        assert_eq!(p.encoding, "base64");
        assert_eq!(p.data, "/wAQ");
        assert!(!p.truncated);
    }

    #[test]
    fn only_rate_limit_headers_are_collected() {
        let mut h = HeaderMap::new();
        h.insert("content-type", "application/json".parse().unwrap());
        h.insert("x-ratelimit-remaining-requests", "0".parse().unwrap());
        h.insert("x-ratelimit-reset-requests", "30".parse().unwrap());
        let names: Vec<_> = rate_limit_headers(&h).into_iter().map(|e| e.name).collect();
        assert_eq!(
            names,
            vec!["x-ratelimit-remaining-requests", "x-ratelimit-reset-requests"]
        );
    }
}
