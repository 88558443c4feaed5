use axum::body::Bytes;
use axum::http::StatusCode;
use serde_json::Value;
use tracing::{debug, warn};

use super::rewrite::RouteKind;
use super::tool_args::coerce_tool_calls;

/// Coerce `choices[].message.tool_calls` in a buffered completion.
///
/// The body comes back unchanged (the same bytes) unless a tool call was
/// actually rewritten.
pub fn rewrite_completion_body(body: Bytes) -> Bytes {
    let mut doc: Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => {
            debug!(error = %e, "completion body is not JSON, relaying as-is");
            return body;
        }
    };
    let Some(choices) = doc.get_mut("choices").and_then(|c| c.as_array_mut()) else {
        return body;
    };

    let mut changed = false;
    for choice in choices.iter_mut() {
        let Some(message) = choice.get_mut("message") else {
            continue;
        };
        changed |= coerce_tool_calls(message.get_mut("tool_calls"));
    }
    if !changed {
        return body;
    }
    match serde_json::to_vec(&doc) {
        Ok(out) => Bytes::from(out),
        Err(e) => {
            warn!(error = %e, "failed to re-encode completion body, relaying as-is");
            body
        }
    }
}

/// Body transform for a fully buffered upstream reply.
pub fn relay_buffered_body(route: RouteKind, status: StatusCode, body: Bytes) -> Bytes {
    if route == RouteKind::ChatCompletions && status == StatusCode::OK {
        rewrite_completion_body(body)
    } else {
        body
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn completion(arguments: &str) -> Bytes {
        Bytes::from(
            json!({
                "id": "chatcmpl-1",
                "object": "chat.completion",
                "choices": [{
                    "index": 0,
                    "message": {
                        "role": "assistant",
                        "content": null,
                        "tool_calls": [{
                            "id": "call_1",
                            "type": "function",
                            "function": {"name": "read_file", "arguments": arguments}
                        }]
                    },
                    "finish_reason": "tool_calls"
                }]
            })
            .to_string(),
        )
    }

    #[test]
    fn tool_call_arguments_are_coerced() {
        let out = relay_buffered_body(
            RouteKind::ChatCompletions,
            StatusCode::OK,
            completion(r#"{"start_line":"5","end_line":"10"}"#),
        );
        let v: Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(
            v["choices"][0]["message"]["tool_calls"][0]["function"]["arguments"],
            json!(r#"{"start_line":5,"end_line":10}"#)
        );
        assert_eq!(v["choices"][0]["finish_reason"], json!("tool_calls"));
    }

    #[test]
    fn untouched_completion_keeps_its_bytes() {
        let raw = Bytes::from_static(
            br#"{ "choices": [ { "message": { "role": "assistant", "content": "hi" } } ] }"#,
        );
        let out = relay_buffered_body(RouteKind::ChatCompletions, StatusCode::OK, raw.clone());
        assert_eq!(out, raw);
    }

    #[test]
    fn non_200_and_other_routes_are_not_inspected() {
        let body = completion(r#"{"start_line":"5"}"#);
        assert_eq!(
            relay_buffered_body(RouteKind::ChatCompletions, StatusCode::CREATED, body.clone()),
            body
        );
        assert_eq!(
            relay_buffered_body(RouteKind::Other, StatusCode::OK, body.clone()),
            body
        );
    }

    #[test]
    fn invalid_json_is_relayed_as_is() {
        let raw = Bytes::from_static(b"<html>bad gateway</html>");
        assert_eq!(rewrite_completion_body(raw.clone()), raw);
    }
}
