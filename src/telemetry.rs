//! JSON telemetry value handling: the multipart wrapper shape and the
//! liveness fields every outgoing telemetry object is augmented with.

extern crate alloc;
use alloc::string::{String, ToString};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::reassembly::Chunk;

/// `{"_part": p, "_total": t, "data": "<chunk>"}`, spec.md §3.
#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct MultipartWrapper {
    #[serde(rename = "_part")]
    pub part: u8,
    #[serde(rename = "_total")]
    pub total: u8,
    pub data: Chunk,
}

/// `true` iff `value` is a JSON object carrying `_part`/`_total` keys —
/// the signal that this telemetry payload is one fragment of a larger
/// message rather than a complete, single-part reading.
pub fn is_multipart_wrapper(value: &Value) -> bool {
    matches!(value, Value::Object(map) if map.contains_key("_part") && map.contains_key("_total"))
}

/// Augment a telemetry object with the liveness fields spec.md §4.4
/// leaves to the implementer: `ts` (monotonic ms) and `lpm` (current
/// low-power-mode flag). Errors if `obj` does not serialize to a JSON
/// object (spec.md: "schema check ... at the boundary only").
pub fn with_liveness_fields(
    mut obj: Value,
    now_ms: u32,
    low_power: bool,
) -> Result<Value, crate::error::LinkError> {
    let Value::Object(ref mut map) = obj else {
        return Err(crate::error::LinkError::NotAnObject);
    };
    map.insert("ts".to_string(), Value::from(now_ms));
    map.insert("lpm".to_string(), Value::from(low_power));
    Ok(obj)
}

/// Split `json_text` into `ceil(len / chunk_size)` byte-oriented chunks.
///
/// This mirrors `original_source`'s plain `json_str[start:end]`
/// slicing: splits occur on *byte* boundaries of the serialized JSON
/// text, not UTF-8 code-point boundaries. Per spec.md §9 this is
/// flagged rather than silently changed — a chunk can in principle end
/// mid-code-point for telemetry values containing multi-byte UTF-8
/// characters (field names/string values outside ASCII). This is safe
/// for correctness because the *concatenation* of all chunks is parsed
/// as JSON only after every part has arrived; no single chunk is ever
/// decoded as UTF-8 on its own.
pub fn chunk_bytes(json_text: &str, chunk_size: usize) -> alloc::vec::Vec<&str> {
    let bytes = json_text.as_bytes();
    let mut out = alloc::vec::Vec::new();
    let mut start = 0;
    while start < bytes.len() {
        let end = (start + chunk_size).min(bytes.len());
        // SAFETY net: `json_text` is ASCII per spec.md §3 ("`data` is an
        // ASCII substring"), so any byte offset is also a valid `str`
        // boundary. `from_utf8` is used (not unchecked) in case a
        // caller's telemetry values contain non-ASCII text despite the
        // spec's stated assumption.
        match core::str::from_utf8(&bytes[start..end]) {
            Ok(s) => out.push(s),
            Err(e) => {
                let valid_end = start + e.valid_up_to();
                if valid_end == start {
                    break;
                }
                out.push(core::str::from_utf8(&bytes[start..valid_end]).unwrap());
                start = valid_end;
                continue;
            }
        }
        start = end;
    }
    out
}
