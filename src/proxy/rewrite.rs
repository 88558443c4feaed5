use std::collections::HashSet;

use axum::body::Bytes;
use axum::http::{HeaderMap, HeaderValue};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::tool_args::coerce_tool_calls;

/// Parameters the upstream dialect rejects on chat completions.
const UNSUPPORTED_CHAT_PARAMS: [&str; 3] = ["prompt_cache_key", "logprobs", "top_logprobs"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteKind {
    ChatCompletions,
    Embeddings,
    Other,
}

impl RouteKind {
    /// `path` is the inbound path with the mount prefix already removed.
    pub fn from_path(path: &str) -> Self {
        let path = path.trim_start_matches('/');
        if path.contains("chat/completions") {
            RouteKind::ChatCompletions
        } else if path == "embeddings" {
            RouteKind::Embeddings
        } else {
            RouteKind::Other
        }
    }
}

fn parse_object(body: &[u8]) -> Result<Map<String, Value>, String> {
    match serde_json::from_slice::<Value>(body) {
        Ok(Value::Object(obj)) => Ok(obj),
        Ok(_) => Err("request body is not a JSON object".to_string()),
        Err(e) => Err(e.to_string()),
    }
}

fn rewrite_chat_completion(body: &mut Map<String, Value>) -> bool {
    let mut changed = false;
    for param in UNSUPPORTED_CHAT_PARAMS {
        if body.shift_remove(param).is_some() {
            debug!(param, "removed unsupported parameter");
            changed = true;
        }
    }

    // A boolean is accepted upstream; anything else is malformed input.
    if body
        .get("parallel_tool_calls")
        .is_some_and(|v| !v.is_boolean())
    {
        body.shift_remove("parallel_tool_calls");
        debug!("removed non-boolean parallel_tool_calls");
        changed = true;
    }

    if let Some(tools) = body.get("tools").and_then(|t| t.as_array()) {
        let names: Vec<&str> = tools
            .iter()
            .filter_map(|t| t.get("function")?.get("name")?.as_str())
            .collect();
        debug!(count = tools.len(), tools = ?names, "request declares tools");
    }

    let Some(Value::Array(messages)) = body.get_mut("messages") else {
        return changed;
    };

    warn_on_dangling_tool_results(messages);

    for (idx, msg) in messages.iter_mut().enumerate() {
        let Some(obj) = msg.as_object_mut() else {
            continue;
        };
        if obj.get("role").and_then(|r| r.as_str()) == Some("tool") {
            let id = obj
                .get("tool_call_id")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown");
            let len = obj
                .get("content")
                .and_then(|c| c.as_str())
                .map(str::len)
                .unwrap_or(0);
            debug!(message = idx, tool_call_id = id, content_len = len, "tool result message");
        }
        if let Some(calls) = obj.get("tool_calls").and_then(|c| c.as_array()) {
            debug!(message = idx, count = calls.len(), "message carries tool calls");
        }
        changed |= coerce_tool_calls(obj.get_mut("tool_calls"));
    }
    changed
}

/// Observe, never repair: a `tool_result` naming an id no message declared
/// is the client's problem, but worth a warning.
fn warn_on_dangling_tool_results(messages: &[Value]) {
    let known: HashSet<&str> = messages
        .iter()
        .filter_map(|m| m.get("tool_calls")?.as_array())
        .flatten()
        .filter_map(|tc| tc.get("id")?.as_str())
        .collect();

    for item in messages
        .iter()
        .filter_map(|m| m.get("content")?.as_array())
        .flatten()
    {
        if item.get("type").and_then(|t| t.as_str()) != Some("tool_result") {
            continue;
        }
        if let Some(id) = item.get("tool_use_id").and_then(|v| v.as_str())
            && !id.is_empty()
            && !known.contains(id)
        {
            warn!(tool_use_id = id, "tool_result references unknown tool_use_id");
        }
    }
}

fn rewrite_embeddings(body: &mut Map<String, Value>) -> bool {
    if body.get("encoding_format").and_then(|v| v.as_str()) == Some("base64") {
        body.insert(
            "encoding_format".to_string(),
            Value::String("float".to_string()),
        );
        debug!("rewrote embeddings encoding_format base64 -> float");
        return true;
    }
    false
}

fn set_content_length(headers: &mut HeaderMap, len: usize) {
    headers.insert("content-length", HeaderValue::from(len));
}

/// Adapt an inbound body to the upstream dialect.
///
/// Returns the body to send. On any parse failure the original bytes are
/// returned and the failure is only logged.
pub fn rewrite_request_body(route: RouteKind, headers: &mut HeaderMap, body: Bytes) -> Bytes {
    if body.is_empty() || route == RouteKind::Other {
        return body;
    }
    let mut obj = match parse_object(&body) {
        Ok(obj) => obj,
        Err(e) => {
            warn!(route = ?route, error = %e, "failed to parse request body, forwarding unmodified");
            return body;
        }
    };

    let changed = match route {
        RouteKind::ChatCompletions => rewrite_chat_completion(&mut obj),
        RouteKind::Embeddings => rewrite_embeddings(&mut obj),
        RouteKind::Other => false,
    };
    if !changed {
        return body;
    }

    match serde_json::to_vec(&obj) {
        Ok(rewritten) => {
            match route {
                RouteKind::Embeddings if !headers.contains_key("content-length") => {}
                _ => set_content_length(headers, rewritten.len()),
            }
            debug!(
                original_len = body.len(),
                rewritten_len = rewritten.len(),
                "rewrote request body"
            );
            Bytes::from(rewritten)
        }
        Err(e) => {
            warn!(error = %e, "failed to re-encode request body, forwarding unmodified");
            body
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn rewrite_json(route: RouteKind, headers: &mut HeaderMap, v: Value) -> Value {
        let out = rewrite_request_body(route, headers, Bytes::from(v.to_string()));
        serde_json::from_slice(&out).unwrap()
    }

    #[test]
    fn route_kinds() {
        assert_eq!(RouteKind::from_path("chat/completions"), RouteKind::ChatCompletions);
        assert_eq!(RouteKind::from_path("/v1/chat/completions"), RouteKind::ChatCompletions);
        assert_eq!(RouteKind::from_path("embeddings"), RouteKind::Embeddings);
        assert_eq!(RouteKind::from_path("v1/embeddings"), RouteKind::Other);
        assert_eq!(RouteKind::from_path("models"), RouteKind::Other);
    }

    #[test]
    fn strips_unsupported_chat_params_and_keeps_the_rest() {
        let mut headers = HeaderMap::new();
        let out = rewrite_json(
            RouteKind::ChatCompletions,
            &mut headers,
            json!({
                "model": "llama",
                "prompt_cache_key": "k",
                "logprobs": true,
                "top_logprobs": 3,
                "temperature": 0.7,
                "messages": [{"role": "user", "content": "hi"}]
            }),
        );
        assert_eq!(
            out,
            json!({
                "model": "llama",
                "temperature": 0.7,
                "messages": [{"role": "user", "content": "hi"}]
            })
        );
        let len: usize = headers["content-length"].to_str().unwrap().parse().unwrap();
        assert_eq!(len, out.to_string().len());
    }

    #[test]
    fn parallel_tool_calls_kept_only_when_boolean() {
        let mut headers = HeaderMap::new();
        let kept = rewrite_json(
            RouteKind::ChatCompletions,
            &mut headers,
            json!({"parallel_tool_calls": false, "logprobs": true}),
        );
        assert_eq!(kept, json!({"parallel_tool_calls": false}));

        let dropped = rewrite_json(
            RouteKind::ChatCompletions,
            &mut headers,
            json!({"model": "m", "parallel_tool_calls": "yes"}),
        );
        assert_eq!(dropped, json!({"model": "m"}));
    }

    #[test]
    fn coerces_tool_calls_in_messages() {
        let mut headers = HeaderMap::new();
        let out = rewrite_json(
            RouteKind::ChatCompletions,
            &mut headers,
            json!({
                "messages": [{
                    "role": "assistant",
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": {"name": "read_file", "arguments": "{\"start_line\":\"5\",\"end_line\":\"10\"}"}
                    }]
                }]
            }),
        );
        assert_eq!(
            out["messages"][0]["tool_calls"][0]["function"]["arguments"],
            json!("{\"start_line\":5,\"end_line\":10}")
        );
    }

    #[test]
    fn dangling_tool_result_is_forwarded_untouched() {
        let body = json!({
            "messages": [
                {"role": "assistant", "tool_calls": [{"id": "known", "function": {"name": "x", "arguments": "{}"}}]},
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "known"},
                    {"type": "tool_result", "tool_use_id": "missing"}
                ]}
            ]
        })
        .to_string();
        let mut headers = HeaderMap::new();
        let out = rewrite_request_body(
            RouteKind::ChatCompletions,
            &mut headers,
            Bytes::from(body.clone()),
        );
        assert_eq!(out, Bytes::from(body));
        assert!(!headers.contains_key("content-length"));
    }

    #[test]
    fn embeddings_base64_becomes_float() {
        let mut headers = HeaderMap::new();
        headers.insert("content-length", HeaderValue::from(999usize));
        let out = rewrite_json(
            RouteKind::Embeddings,
            &mut headers,
            json!({"input": "x", "encoding_format": "base64"}),
        );
        assert_eq!(out, json!({"input": "x", "encoding_format": "float"}));
        assert_eq!(
            headers["content-length"],
            HeaderValue::from(out.to_string().len())
        );
    }

    #[test]
    fn embeddings_rewrite_leaves_absent_content_length_absent() {
        let mut headers = HeaderMap::new();
        let out = rewrite_json(
            RouteKind::Embeddings,
            &mut headers,
            json!({"input": "x", "encoding_format": "base64"}),
        );
        assert_eq!(out, json!({"input": "x", "encoding_format": "float"}));
        assert!(!headers.contains_key("content-length"));
    }

    #[test]
    fn embeddings_other_formats_pass_through() {
        let body = Bytes::from_static(br#"{"input":"x","encoding_format":"float"}"#);
        let mut headers = HeaderMap::new();
        let out = rewrite_request_body(RouteKind::Embeddings, &mut headers, body.clone());
        assert_eq!(out, body);
        assert!(!headers.contains_key("content-length"));
    }

    #[test]
    fn malformed_json_is_forwarded_unmodified() {
        let body = Bytes::from_static(b"{not json");
        let mut headers = HeaderMap::new();
        let out = rewrite_request_body(RouteKind::ChatCompletions, &mut headers, body.clone());
        assert_eq!(out, body);
    }

    #[test]
    fn other_routes_are_never_parsed() {
        let body = Bytes::from_static(br#"{"logprobs":true}"#);
        let mut headers = HeaderMap::new();
        assert_eq!(
            rewrite_request_body(RouteKind::Other, &mut headers, body.clone()),
            body
        );
    }
}
