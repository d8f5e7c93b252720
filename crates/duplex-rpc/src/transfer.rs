//! Transferable detection.
//!
//! Walks a [`Value`] and collects the raw buffers inside it, so the channel
//! can move them instead of copying. Only `Value::Buffer` is picked up;
//! typed views are left for the channel to clone.

use crate::value::{ArrayBuffer, Value};

/// Check if a value is itself transferable.
pub fn is_transferable(value: &Value) -> bool {
    matches!(value, Value::Buffer(_))
}

/// Collect every buffer reachable from `data`, depth first, in member
/// insertion order.
///
/// A buffer referenced more than once appears once, at its first
/// discovery: a transfer list may not name the same buffer twice.
/// Identity is [`ArrayBuffer::same_buffer`], under which all zero-length
/// buffers are one buffer, so several empty buffers yield a single entry.
/// They have no bytes to move, and the channel delivers each of them.
pub fn peek_transferables(data: &Value) -> Vec<ArrayBuffer> {
    let mut result = Vec::new();
    collect(data, &mut result);
    result
}

fn collect(value: &Value, result: &mut Vec<ArrayBuffer>) {
    match value {
        Value::Buffer(buffer) => {
            if !result.iter().any(|seen| seen.same_buffer(buffer)) {
                result.push(buffer.clone());
            }
        }
        Value::Array(items) => {
            for item in items {
                collect(item, result);
            }
        }
        Value::Object(map) => {
            for member in map.values() {
                collect(member, result);
            }
        }
        Value::Null
        | Value::Bool(_)
        | Value::Number(_)
        | Value::String(_)
        | Value::View(_) => {}
    }
}
