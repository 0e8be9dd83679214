//! Integrity layer: canonical JSON encoding and the store checksum
//!
//! The checksum is SHA-256 over the canonical encoding of the `tasks` array,
//! truncated to 16 hex characters. Canonical means object keys sorted by UTF-8
//! byte order at every level and no insignificant whitespace.

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::Result;

/// Length of a stored checksum in hex characters
pub const CHECKSUM_HEX_LEN: usize = 16;

/// Serialize a JSON value to canonical bytes
pub fn to_canonical_json(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push(b'{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_scalar(&Value::String(key.clone()), out);
                out.push(b':');
                write_canonical(&map[key], out);
            }
            out.push(b'}');
        }
        Value::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_canonical(item, out);
            }
            out.push(b']');
        }
        scalar => write_scalar(scalar, out),
    }
}

fn write_scalar(value: &Value, out: &mut Vec<u8>) {
    // Scalars never fail to encode: strings, numbers (always finite in a Value), bools, null
    if let Ok(bytes) = serde_json::to_vec(value) {
        out.extend_from_slice(&bytes);
    }
}

/// SHA-256 truncated to 16 hex chars
pub fn digest_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let hash = hasher.finalize();

    // Truncate to 16 hex chars
    hex::encode(&hash[..CHECKSUM_HEX_LEN / 2])
}

/// Checksum of a raw `tasks` array as read from disk
pub fn checksum_value(tasks: &Value) -> String {
    digest_hex(&to_canonical_json(tasks))
}

/// Checksum of typed tasks, identical to [`checksum_value`] on their JSON form
pub fn checksum_tasks<T: Serialize>(tasks: &[T]) -> Result<String> {
    let value = serde_json::to_value(tasks)?;
    Ok(checksum_value(&value))
}

/// Result of comparing a document's recorded checksum with its content
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntegrityStatus {
    /// Recorded checksum matches the tasks array
    Valid { checksum: String },
    /// The document has no `_meta.checksum` (legacy or hand-made file)
    Missing { actual: String },
    /// The file was edited outside the engine
    Mismatch { recorded: String, actual: String },
}

impl IntegrityStatus {
    pub fn is_valid(&self) -> bool {
        matches!(self, IntegrityStatus::Valid { .. })
    }

    /// Checksum computed from actual content
    pub fn actual(&self) -> &str {
        match self {
            IntegrityStatus::Valid { checksum } => checksum,
            IntegrityStatus::Missing { actual } | IntegrityStatus::Mismatch { actual, .. } => {
                actual
            }
        }
    }
}

/// Verify `_meta.checksum` of a raw store or archive document
pub fn verify_document(doc: &Value) -> IntegrityStatus {
    let empty = Value::Array(Vec::new());
    let tasks = doc.get("tasks").unwrap_or(&empty);
    let actual = checksum_value(tasks);

    match doc
        .get("_meta")
        .and_then(|m| m.get("checksum"))
        .and_then(Value::as_str)
    {
        None | Some("") => IntegrityStatus::Missing { actual },
        Some(recorded) if recorded == actual => IntegrityStatus::Valid { checksum: actual },
        Some(recorded) => IntegrityStatus::Mismatch {
            recorded: recorded.to_string(),
            actual,
        },
    }
}
