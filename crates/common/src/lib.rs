//! Canonical JSON serialization, SHA-256 hashing, ISO timestamps, and
//! write-temp-then-rename file persistence shared by every crate in the
//! review pipeline.
//!
//! Hashes are computed over canonical bytes (sorted object keys, no
//! whitespace) so that two structurally-equal values always hash the same
//! regardless of field declaration order.

use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fs;
use std::io;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CanonError {
    #[error("failed to serialize json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Serialize to canonical JSON bytes: stable key ordering, no whitespace, UTF-8.
pub fn canonical_json_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, CanonError> {
    let v = serde_json::to_value(value)?;
    let sorted = sort_json_value(v);
    Ok(serde_json::to_vec(&sorted)?)
}

/// Hex-encoded SHA-256 digest of the canonical JSON encoding of `value`.
pub fn sha256_canonical_json<T: Serialize>(value: &T) -> Result<String, CanonError> {
    let bytes = canonical_json_bytes(value)?;
    Ok(sha256_hex(&bytes))
}

/// Hex-encoded SHA-256 digest of raw bytes.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Hex-encoded SHA-256 digest over the UTF-8 concatenation of `parts`
/// joined by `\n`. Used for composite keys such as the review-item hash
/// (`headSha + "\n" + sorted(filenames)`) and the Pass-1 cache key
/// (`headSha || truncationLevel || promptHash`).
pub fn sha256_of_parts(parts: &[&str]) -> String {
    let joined = parts.join("\n");
    sha256_hex(joined.as_bytes())
}

fn sort_json_value(v: serde_json::Value) -> serde_json::Value {
    use serde_json::Value;
    match v {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            let mut out = serde_json::Map::new();
            for (k, v) in entries {
                out.insert(k, sort_json_value(v));
            }
            Value::Object(out)
        }
        Value::Array(arr) => Value::Array(arr.into_iter().map(sort_json_value).collect()),
        other => other,
    }
}

/// Current instant as an RFC 3339 / ISO-8601 timestamp, e.g. `2026-07-28T00:00:00Z`.
pub fn now_iso8601() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Write `bytes` to `path` atomically: write to a temp file in the same
/// directory, then rename over the destination. Creates parent directories
/// as needed.
pub fn atomic_write(path: impl AsRef<Path>, bytes: &[u8]) -> io::Result<()> {
    let path = path.as_ref();
    let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    use std::io::Write as _;
    tmp.write_all(bytes)?;
    tmp.flush()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
