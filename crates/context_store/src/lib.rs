//! Per-PR idempotency state: last-reviewed hash, last-reviewed SHA, and
//! a claim flag preventing two concurrent runs from posting the same
//! review twice.
//!
//! Single JSON file keyed by `"owner/repo#pr"`, rewritten atomically —
//! the same write-temp-then-rename idiom the write-ahead log uses.

use revbot_common::atomic_write;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ContextStoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ItemState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reviewed_sha: Option<String>,
    #[serde(default)]
    pub claimed: bool,
}

fn key(owner: &str, repo: &str, pr: u64) -> String {
    format!("{owner}/{repo}#{pr}")
}

pub struct JsonContextStore {
    path: PathBuf,
    state: HashMap<String, ItemState>,
}

impl JsonContextStore {
    /// Loads the store from `path`, or starts empty if the file is
    /// absent or unreadable.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, ContextStoreError> {
        let path = path.into();
        let state = match fs::read_to_string(&path) {
            Ok(contents) => serde_json::from_str(&contents)?,
            Err(_) => HashMap::new(),
        };
        Ok(Self { path, state })
    }

    fn save(&self) -> Result<(), ContextStoreError> {
        let bytes = serde_json::to_vec_pretty(&self.state)?;
        atomic_write(&self.path, &bytes)?;
        Ok(())
    }

    pub fn get_last_hash(&self, owner: &str, repo: &str, pr: u64) -> Option<String> {
        self.state.get(&key(owner, repo, pr)).and_then(|s| s.last_hash.clone())
    }

    pub fn set_last_hash(&mut self, owner: &str, repo: &str, pr: u64, hash: String) -> Result<(), ContextStoreError> {
        self.state.entry(key(owner, repo, pr)).or_default().last_hash = Some(hash);
        self.save()
    }

    pub fn get_last_reviewed_sha(&self, owner: &str, repo: &str, pr: u64) -> Option<String> {
        self.state.get(&key(owner, repo, pr)).and_then(|s| s.last_reviewed_sha.clone())
    }

    pub fn set_last_reviewed_sha(&mut self, owner: &str, repo: &str, pr: u64, sha: String) -> Result<(), ContextStoreError> {
        self.state.entry(key(owner, repo, pr)).or_default().last_reviewed_sha = Some(sha);
        self.save()
    }

    /// At-most-once flip to claimed. Returns `true` only the first time
    /// for a given item; subsequent calls return `false` until the item
    /// state is reset.
    pub fn claim_review(&mut self, owner: &str, repo: &str, pr: u64, _hash: &str) -> Result<bool, ContextStoreError> {
        let entry = self.state.entry(key(owner, repo, pr)).or_default();
        if entry.claimed {
            return Ok(false);
        }
        entry.claimed = true;
        self.save()?;
        Ok(true)
    }

    /// Called last in the finalize sequence. Currently a no-op besides
    /// persistence, since `claimed`/`lastHash`/`lastReviewedSha` are the
    /// whole of the finalized state.
    pub fn finalize_review(&mut self, owner: &str, repo: &str, pr: u64) -> Result<(), ContextStoreError> {
        let _ = self.state.entry(key(owner, repo, pr)).or_default();
        self.save()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonContextStore::load(dir.path().join("ctx.json")).unwrap();
        assert_eq!(store.get_last_hash("o", "r", 1), None);
    }

    #[test]
    fn claim_review_is_at_most_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = JsonContextStore::load(dir.path().join("ctx.json")).unwrap();
        assert!(store.claim_review("o", "r", 1, "h").unwrap());
        assert!(!store.claim_review("o", "r", 1, "h").unwrap());
    }

    #[test]
    fn round_trips_through_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ctx.json");
        {
            let mut store = JsonContextStore::load(&path).unwrap();
            store.set_last_hash("o", "r", 1, "abc".to_string()).unwrap();
            store.set_last_reviewed_sha("o", "r", 1, "sha1".to_string()).unwrap();
        }
        let reloaded = JsonContextStore::load(&path).unwrap();
        assert_eq!(reloaded.get_last_hash("o", "r", 1), Some("abc".to_string()));
        assert_eq!(reloaded.get_last_reviewed_sha("o", "r", 1), Some("sha1".to_string()));
    }

    #[test]
    fn distinct_items_are_independent() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = JsonContextStore::load(dir.path().join("ctx.json")).unwrap();
        store.set_last_hash("o", "r", 1, "a".to_string()).unwrap();
        store.set_last_hash("o", "r", 2, "b".to_string()).unwrap();
        assert_eq!(store.get_last_hash("o", "r", 1), Some("a".to_string()));
        assert_eq!(store.get_last_hash("o", "r", 2), Some("b".to_string()));
    }
}
