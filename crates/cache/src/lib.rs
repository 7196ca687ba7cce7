//! Pass-1 cache: a content-addressed, file-per-key store of convergence
//! findings, keyed by `SHA-256(headSha ++ truncationLevel ++ promptHash)`.
//!
//! Advisory only — `get` returns `None` on any I/O or parse error, and
//! `set` swallows write errors (logged, not propagated), matching the
//! corpus's "never let an optional cache break the run" posture.

use revbot_common::sha256_of_parts;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheFindings {
    pub raw: String,
    pub parsed: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub findings: CacheFindings,
    pub tokens: u64,
    pub timestamp: String,
    pub hit_count: u64,
}

pub fn cache_key(head_sha: &str, truncation_level: u8, prompt_hash: &str) -> String {
    sha256_of_parts(&[head_sha, &truncation_level.to_string(), prompt_hash])
}

pub struct FileCache {
    dir: PathBuf,
}

impl FileCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.dir.join(key)
    }

    /// Returns `None` on miss, and on any I/O or JSON error (treated as
    /// a miss rather than a hard failure). Increments `hitCount` and
    /// rewrites the entry on a hit.
    pub fn get(&self, key: &str) -> Option<CacheEntry> {
        let path = self.entry_path(key);
        let contents = fs::read_to_string(&path).ok()?;
        let mut entry: CacheEntry = serde_json::from_str(&contents).ok()?;
        entry.hit_count += 1;
        if let Ok(bytes) = serde_json::to_vec_pretty(&entry) {
            let _ = fs::write(&path, bytes);
        }
        Some(entry)
    }

    /// Lazily creates the cache directory. Write failures are logged
    /// and swallowed; the cache is never load-bearing for correctness.
    pub fn set(&self, key: &str, entry: &CacheEntry) {
        if let Err(e) = fs::create_dir_all(&self.dir) {
            tracing::warn!(error = %e, "failed to create pass-1 cache directory");
            return;
        }
        match serde_json::to_vec_pretty(entry) {
            Ok(bytes) => {
                if let Err(e) = fs::write(self.entry_path(key), bytes) {
                    tracing::warn!(error = %e, key, "failed to write pass-1 cache entry");
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to serialize pass-1 cache entry"),
        }
    }
}
