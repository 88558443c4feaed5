//! Tool-call argument repair shared by the request rewriter and both relays.
//!
//! The upstream dialect sometimes encodes `start_line`/`end_line` as strings
//! (`"5"`) where clients expect integers. The arguments are a JSON document
//! embedded as a string inside the tool call, so the fix is: parse, retype,
//! re-encode. Everything else in the document keeps its key order.

use serde_json::{Map, Value};
use tracing::{debug, warn};

const INTEGER_FIELDS: [&str; 2] = ["start_line", "end_line"];

#[derive(Debug, PartialEq, Eq)]
enum Coercion {
    Unchanged,
    Changed(String),
}

fn coerce_arguments_doc(doc: &mut Map<String, Value>) -> Result<bool, String> {
    // Validate first so a bad field leaves the whole document untouched.
    let mut replacements = Vec::new();
    for field in INTEGER_FIELDS {
        if let Some(Value::String(s)) = doc.get(field) {
            let n = s
                .trim()
                .parse::<i64>()
                .map_err(|e| format!("{field}={s:?}: {e}"))?;
            replacements.push((field, n));
        }
    }
    let changed = !replacements.is_empty();
    for (field, n) in replacements {
        doc.insert(field.to_string(), Value::from(n));
    }
    Ok(changed)
}

fn coerce_arguments_str(arguments: &str) -> Coercion {
    if arguments.is_empty() {
        return Coercion::Unchanged;
    }
    // Streaming deltas usually carry partial JSON; those are left alone.
    let Ok(Value::Object(mut doc)) = serde_json::from_str::<Value>(arguments) else {
        return Coercion::Unchanged;
    };
    match coerce_arguments_doc(&mut doc) {
        Ok(true) => match serde_json::to_string(&doc) {
            Ok(s) => Coercion::Changed(s),
            Err(e) => {
                warn!(error = %e, "failed to re-encode tool call arguments");
                Coercion::Unchanged
            }
        },
        Ok(false) => Coercion::Unchanged,
        Err(e) => {
            warn!(error = %e, "failed to coerce tool call arguments");
            Coercion::Unchanged
        }
    }
}

/// Repair one tool call frame (`{id, type, function: {name, arguments}}`)
/// in place. Returns whether `arguments` was rewritten.
pub fn coerce_tool_call(tool_call: &mut Value) -> bool {
    let Some(function) = tool_call
        .get_mut("function")
        .and_then(|f| f.as_object_mut())
    else {
        return false;
    };
    let Some(Value::String(arguments)) = function.get("arguments") else {
        return false;
    };
    match coerce_arguments_str(arguments) {
        Coercion::Changed(rewritten) => {
            let name = function
                .get("name")
                .and_then(|n| n.as_str())
                .unwrap_or("unknown");
            debug!(tool = name, arguments = %rewritten, "coerced tool call arguments");
            function.insert("arguments".to_string(), Value::String(rewritten));
            true
        }
        Coercion::Unchanged => false,
    }
}

/// Apply [`coerce_tool_call`] to every element of a `tool_calls` array.
pub fn coerce_tool_calls(tool_calls: Option<&mut Value>) -> bool {
    let Some(Value::Array(calls)) = tool_calls else {
        return false;
    };
    let mut changed = false;
    for call in calls.iter_mut() {
        changed |= coerce_tool_call(call);
    }
    changed
}
