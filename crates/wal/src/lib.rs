//! Append-only write-ahead log: a newline-delimited JSON file where each
//! line is either a full [`WalEntry`] or a [`WalDelta`] mutating one by
//! id. Mutation is O(1) (one delta line appended); reading the resolved
//! state is O(n) (materialize by folding deltas over entries in file
//! order). Compaction rewrites the file in materialized form.
//!
//! Rewrites (`compact`/`truncate`) use write-temp-then-rename via
//! `revbot_common::atomic_write`, upgrading the reference model's
//! documented non-atomic rewrite without changing observable semantics.

use revbot_common::{atomic_write, now_iso8601};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WalError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WalStatus {
    Pending,
    Applied,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalEntry {
    pub id: String,
    pub timestamp: String,
    pub operation: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bead_id: Option<String>,
    pub payload: serde_json::Value,
    pub status: WalStatus,
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WalDeltaUpdates {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<WalStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalDelta {
    pub entry_id: String,
    pub updates: WalDeltaUpdates,
}

enum RawRecord {
    Entry(WalEntry),
    Delta(WalDelta),
}

fn parse_record(line: &str) -> Result<RawRecord, WalError> {
    let value: serde_json::Value = serde_json::from_str(line)?;
    let is_delta = value.get("_delta").and_then(serde_json::Value::as_bool).unwrap_or(false);
    if is_delta {
        Ok(RawRecord::Delta(serde_json::from_value(value)?))
    } else {
        Ok(RawRecord::Entry(serde_json::from_value(value)?))
    }
}

fn read_records(path: &Path) -> Result<Vec<RawRecord>, WalError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let file = fs::File::open(path)?;
    let reader = BufReader::new(file);
    let mut records = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        records.push(parse_record(&line)?);
    }
    Ok(records)
}

/// Fold raw records into their resolved `WalEntry` sequence, preserving
/// first-seen insertion order. A delta whose `entry_id` has not yet
/// appeared as an entry is silently ignored.
fn materialize(records: &[RawRecord]) -> (Vec<WalEntry>, bool) {
    let mut order: Vec<String> = Vec::new();
    let mut by_id: std::collections::HashMap<String, WalEntry> = std::collections::HashMap::new();
    let mut had_delta = false;

    for record in records {
        match record {
            RawRecord::Entry(entry) => {
                if !by_id.contains_key(&entry.id) {
                    order.push(entry.id.clone());
                }
                by_id.insert(entry.id.clone(), entry.clone());
            }
            RawRecord::Delta(delta) => {
                had_delta = true;
                if let Some(entry) = by_id.get_mut(&delta.entry_id) {
                    if let Some(status) = delta.updates.status {
                        entry.status = status;
                    }
                    if let Some(error) = &delta.updates.error {
                        entry.error = Some(error.clone());
                    }
                    if let Some(retry_count) = delta.updates.retry_count {
                        entry.retry_count = retry_count;
                    }
                }
            }
        }
    }

    let entries = order.into_iter().filter_map(|id| by_id.remove(&id)).collect();
    (entries, had_delta)
}

fn serialize_record_line(value: &impl Serialize) -> Result<String, WalError> {
    Ok(serde_json::to_string(value)?)
}

fn append_line(path: &Path, line: &str) -> Result<(), WalError> {
    if let Some(dir) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(dir)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(line.as_bytes())?;
    file.write_all(b"\n")?;
    file.flush()?;
    Ok(())
}

pub struct FileWal {
    path: PathBuf,
    pub max_retries: u32,
}

impl FileWal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), max_retries: 3 }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Appends a new full entry with `status = pending, retryCount = 0`.
    /// O(1): a single line append, no read.
    pub fn append(
        &self,
        operation: impl Into<String>,
        bead_id: Option<String>,
        payload: serde_json::Value,
    ) -> Result<WalEntry, WalError> {
        let entry = WalEntry {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: now_iso8601(),
            operation: operation.into(),
            bead_id,
            payload,
            status: WalStatus::Pending,
            retry_count: 0,
            error: None,
        };
        append_line(&self.path, &serialize_record_line(&entry)?)?;
        Ok(entry)
    }

    /// O(n): streams and materializes all records, returns pending ones.
    pub fn get_pending(&self) -> Result<Vec<WalEntry>, WalError> {
        let (entries, _) = materialize(&read_records(&self.path)?);
        Ok(entries.into_iter().filter(|e| e.status == WalStatus::Pending).collect())
    }

    /// O(n): streams and materializes all records regardless of status,
    /// for inspection tooling.
    pub fn materialized_entries(&self) -> Result<Vec<WalEntry>, WalError> {
        let (entries, _) = materialize(&read_records(&self.path)?);
        Ok(entries)
    }

    /// O(1): appends a delta flipping `status` to applied.
    pub fn mark_applied(&self, id: &str) -> Result<(), WalError> {
        let delta = WalDelta {
            entry_id: id.to_string(),
            updates: WalDeltaUpdates { status: Some(WalStatus::Applied), error: None, retry_count: None },
        };
        let mut value = serde_json::to_value(&delta)?;
        value.as_object_mut().unwrap().insert("_delta".to_string(), serde_json::Value::Bool(true));
        append_line(&self.path, &serde_json::to_string(&value)?)?;
        Ok(())
    }

    /// O(n) read (to learn the current `retryCount`) + O(1) append. A
    /// missing id is a no-op, matching the spec's lenient semantics.
    pub fn mark_failed(&self, id: &str, error: impl Into<String>) -> Result<(), WalError> {
        let (entries, _) = materialize(&read_records(&self.path)?);
        let Some(current) = entries.iter().find(|e| e.id == id) else {
            return Ok(());
        };
        let next_retry = current.retry_count + 1;
        let status = if next_retry >= self.max_retries { WalStatus::Failed } else { WalStatus::Pending };
        let delta = WalDelta {
            entry_id: id.to_string(),
            updates: WalDeltaUpdates {
                status: Some(status),
                error: Some(error.into()),
                retry_count: Some(next_retry),
            },
        };
        let mut value = serde_json::to_value(&delta)?;
        value.as_object_mut().unwrap().insert("_delta".to_string(), serde_json::Value::Bool(true));
        append_line(&self.path, &serde_json::to_string(&value)?)?;
        Ok(())
    }

    /// Runs `exec` over every pending entry, marking applied on success
    /// and failed (with the stringified error) on failure. Returns the
    /// count of entries that succeeded.
    pub fn replay<F>(&self, mut exec: F) -> Result<usize, WalError>
    where
        F: FnMut(&WalEntry) -> Result<(), String>,
    {
        let pending = self.get_pending()?;
        let mut succeeded = 0;
        for entry in &pending {
            match exec(entry) {
                Ok(()) => {
                    self.mark_applied(&entry.id)?;
                    succeeded += 1;
                }
                Err(msg) => {
                    self.mark_failed(&entry.id, msg)?;
                }
            }
        }
        Ok(succeeded)
    }

    /// Drops applied entries older than `older_than_iso` and rewrites the
    /// file compacted (materialized entries only, no deltas).
    pub fn truncate(&self, older_than_iso: &str) -> Result<(), WalError> {
        let (entries, _) = materialize(&read_records(&self.path)?);
        let kept: Vec<&WalEntry> = entries
            .iter()
            .filter(|e| !(e.status == WalStatus::Applied && e.timestamp.as_str() < older_than_iso))
            .collect();
        self.rewrite(&kept)
    }

    /// Unconditionally rewrites the file in materialized form. Returns
    /// `true` if any delta records existed (i.e. the rewrite actually
    /// compacted something).
    pub fn compact(&self) -> Result<bool, WalError> {
        let (entries, had_delta) = materialize(&read_records(&self.path)?);
        let refs: Vec<&WalEntry> = entries.iter().collect();
        self.rewrite(&refs)?;
        Ok(had_delta)
    }

    /// No-op unless the raw record count has grown past `min_entries`
    /// and the applied fraction has passed `threshold`.
    pub fn maybe_compact(&self, min_entries: usize, threshold: f64) -> Result<bool, WalError> {
        let records = read_records(&self.path)?;
        if records.len() < min_entries {
            return Ok(false);
        }
        let (entries, _) = materialize(&records);
        if entries.is_empty() {
            return Ok(false);
        }
        let applied = entries.iter().filter(|e| e.status == WalStatus::Applied).count();
        let fraction = applied as f64 / entries.len() as f64;
        if fraction < threshold {
            return Ok(false);
        }
        self.compact()
    }

    fn rewrite(&self, entries: &[&WalEntry]) -> Result<(), WalError> {
        let mut buf = String::new();
        for entry in entries {
            buf.push_str(&serialize_record_line(entry)?);
            buf.push('\n');
        }
        atomic_write(&self.path, buf.as_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wal_at(dir: &tempfile::TempDir) -> FileWal {
        FileWal::new(dir.path().join("wal.jsonl"))
    }

    #[test]
    fn append_creates_pending_entry_with_zero_retries() {
        let dir = tempfile::tempdir().unwrap();
        let wal = wal_at(&dir);
        let entry = wal.append("post_review", None, serde_json::json!({"pr": 1})).unwrap();
        assert_eq!(entry.status, WalStatus::Pending);
        assert_eq!(entry.retry_count, 0);
        assert_eq!(wal.get_pending().unwrap().len(), 1);
    }

    #[test]
    fn mark_applied_removes_entry_from_pending() {
        let dir = tempfile::tempdir().unwrap();
        let wal = wal_at(&dir);
        let entry = wal.append("op", None, serde_json::json!({})).unwrap();
        wal.mark_applied(&entry.id).unwrap();
        assert!(wal.get_pending().unwrap().is_empty());
    }

    #[test]
    fn mark_failed_increments_retry_and_stays_pending_under_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let wal = FileWal::new(dir.path().join("wal.jsonl")).with_max_retries(3);
        let entry = wal.append("op", None, serde_json::json!({})).unwrap();
        wal.mark_failed(&entry.id, "boom").unwrap();
        let pending = wal.get_pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].retry_count, 1);
        assert_eq!(pending[0].status, WalStatus::Pending);
    }

    #[test]
    fn mark_failed_flips_to_failed_at_max_retries() {
        let dir = tempfile::tempdir().unwrap();
        let wal = FileWal::new(dir.path().join("wal.jsonl")).with_max_retries(2);
        let entry = wal.append("op", None, serde_json::json!({})).unwrap();
        wal.mark_failed(&entry.id, "e1").unwrap();
        wal.mark_failed(&entry.id, "e2").unwrap();
        assert!(wal.get_pending().unwrap().is_empty());
    }

    #[test]
    fn mark_failed_missing_id_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let wal = wal_at(&dir);
        assert!(wal.mark_failed("does-not-exist", "e").is_ok());
    }

    #[test]
    fn scenario_twenty_entries_compaction_leaves_exact_pending_set() {
        let dir = tempfile::tempdir().unwrap();
        let wal = FileWal::new(dir.path().join("wal.jsonl")).with_max_retries(3);
        let mut ids = Vec::new();
        for i in 0..20 {
            let e = wal.append("op", None, serde_json::json!({"i": i})).unwrap();
            ids.push(e.id);
        }
        for id in &ids[0..15] {
            wal.mark_applied(id).unwrap();
        }
        wal.mark_failed(&ids[15], "e1").unwrap();
        wal.mark_failed(&ids[15], "e2").unwrap();

        let had_deltas = wal.compact().unwrap();
        assert!(had_deltas);

        let (entries, had_delta_after) = materialize(&read_records(&dir.path().join("wal.jsonl")).unwrap());
        assert_eq!(entries.len(), 20);
        assert!(!had_delta_after);

        let pending = wal.get_pending().unwrap();
        assert_eq!(pending.len(), 5);
        let entry16 = pending.iter().find(|e| e.id == ids[15]).unwrap();
        assert_eq!(entry16.retry_count, 2);
        assert_eq!(entry16.status, WalStatus::Pending);
    }

    #[test]
    fn isomorphism_materialize_of_compact_equals_materialize() {
        let dir = tempfile::tempdir().unwrap();
        let wal = wal_at(&dir);
        let e1 = wal.append("a", None, serde_json::json!({})).unwrap();
        let e2 = wal.append("b", None, serde_json::json!({})).unwrap();
        wal.mark_applied(&e1.id).unwrap();
        wal.mark_failed(&e2.id, "x").unwrap();

        let before = materialize(&read_records(&dir.path().join("wal.jsonl")).unwrap()).0;
        wal.compact().unwrap();
        let after = materialize(&read_records(&dir.path().join("wal.jsonl")).unwrap()).0;
        assert_eq!(before, after);
    }

    #[test]
    fn missing_file_reads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let wal = FileWal::new(dir.path().join("does-not-exist.jsonl"));
        assert!(wal.get_pending().unwrap().is_empty());
    }

    #[test]
    fn maybe_compact_respects_threshold_and_min_entries() {
        let dir = tempfile::tempdir().unwrap();
        let wal = wal_at(&dir);
        let e1 = wal.append("a", None, serde_json::json!({})).unwrap();
        assert_eq!(wal.maybe_compact(10, 0.5).unwrap(), false);
        wal.mark_applied(&e1.id).unwrap();
        assert_eq!(wal.maybe_compact(1, 0.5).unwrap(), true);
    }

    #[test]
    fn replay_marks_success_applied_and_failure_pending_or_failed() {
        let dir = tempfile::tempdir().unwrap();
        let wal = FileWal::new(dir.path().join("wal.jsonl")).with_max_retries(5);
        let ok_entry = wal.append("ok", None, serde_json::json!({})).unwrap();
        let err_entry = wal.append("err", None, serde_json::json!({})).unwrap();

        let ok_id = ok_entry.id.clone();
        let succeeded = wal
            .replay(|entry| {
                if entry.id == ok_id {
                    Ok(())
                } else {
                    Err("boom".to_string())
                }
            })
            .unwrap();

        assert_eq!(succeeded, 1);
        let pending = wal.get_pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, err_entry.id);
        assert_eq!(pending[0].retry_count, 1);
    }
}
