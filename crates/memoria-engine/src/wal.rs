//! Write-ahead log for pending fact mutations.
//!
//! The log is newline-delimited JSON. Each line is either a full entry or a
//! removal marker:
//!
//! ```text
//! {"id":"…","readyAt":"…","operation":"store","payload":{…}}
//! {"op":"remove","id":"…"}
//! ```
//!
//! Appends are followed by `fsync` before the caller continues. Committing an
//! entry appends a removal marker instead of rewriting the file; [`compact`]
//! periodically rewrites the log with only the entries still pending.
//!
//! Logs written by older versions as a single JSON array are converted to
//! the line format on open.
//!
//! [`compact`]: WriteAheadLog::compact

use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::types::{Fact, FactId};

/// File name of the log inside the data directory.
pub const WAL_FILE: &str = "wal.jsonl";

/// Format marker recorded in the fact store's meta table.
pub const WAL_FORMAT: &str = "ndjson-v1";

// ─────────────────────────────────────────────────────────────────────────────
// Entries
// ─────────────────────────────────────────────────────────────────────────────

/// The mutation an entry describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WalOperation {
    Store,
    Update,
    Delete,
}

/// Everything needed to replay an operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalPayload {
    pub fact_id: FactId,
    /// The full fact for store and update.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fact: Option<Fact>,
    /// Precomputed embedding, when one was available.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

/// A pending mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalEntry {
    pub id: Uuid,
    /// Captured after any embedding was computed.
    pub ready_at: DateTime<Utc>,
    pub operation: WalOperation,
    pub payload: WalPayload,
}

impl WalEntry {
    pub fn store(fact: Fact, embedding: Option<Vec<f32>>) -> Self {
        Self::new(WalOperation::Store, fact.id, Some(fact), embedding)
    }

    pub fn update(fact: Fact, embedding: Option<Vec<f32>>) -> Self {
        Self::new(WalOperation::Update, fact.id, Some(fact), embedding)
    }

    pub fn delete(fact_id: FactId) -> Self {
        Self::new(WalOperation::Delete, fact_id, None, None)
    }

    fn new(
        operation: WalOperation,
        fact_id: FactId,
        fact: Option<Fact>,
        embedding: Option<Vec<f32>>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            ready_at: Utc::now(),
            operation,
            payload: WalPayload {
                fact_id,
                fact,
                embedding,
            },
        }
    }
}

#[derive(Serialize)]
struct RemovalMarker<'a> {
    op: &'a str,
    id: Uuid,
}

/// One parsed line.
enum Record {
    Entry(Box<WalEntry>),
    Remove(Uuid),
}

fn parse_line(line: &str) -> serde_json::Result<Record> {
    let value: serde_json::Value = serde_json::from_str(line)?;
    if value.get("op").and_then(|v| v.as_str()) == Some("remove") {
        let id = serde_json::from_value(value["id"].clone())?;
        return Ok(Record::Remove(id));
    }
    Ok(Record::Entry(Box::new(serde_json::from_value(value)?)))
}

// ─────────────────────────────────────────────────────────────────────────────
// Log
// ─────────────────────────────────────────────────────────────────────────────

/// Outcome of a compaction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CompactReport {
    /// Entries still pending after compaction.
    pub kept: usize,
    /// Lines dropped (committed entries, their markers, corrupt lines).
    pub dropped: usize,
}

/// Append-only NDJSON write-ahead log.
pub struct WriteAheadLog {
    path: PathBuf,
    file: Mutex<File>,
    /// Pending entry ids and the fact each one touches. Taken after `file`.
    pending: Mutex<HashMap<Uuid, FactId>>,
}

impl WriteAheadLog {
    /// Open or create the log at `path`, converting a legacy JSON-array log.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }

        if path.exists() {
            convert_legacy(&path)?;
        }

        let pending = index_pending(&read_pending_at(&path)?.0);
        let file = open_append(&path)?;
        debug!(path = %path.display(), pending = pending.len(), "Write-ahead log opened");
        Ok(Self {
            path,
            file: Mutex::new(file),
            pending: Mutex::new(pending),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one entry and flush it to disk.
    pub fn append(&self, entry: &WalEntry) -> Result<()> {
        self.append_batch(std::slice::from_ref(entry))
    }

    /// Append several entries with a single flush.
    pub fn append_batch(&self, entries: &[WalEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut buf = Vec::new();
        for entry in entries {
            serde_json::to_writer(&mut buf, entry)?;
            buf.push(b'\n');
        }
        self.write_synced(&buf)?;
        self.pending
            .lock()
            .extend(entries.iter().map(|e| (e.id, e.payload.fact_id)));
        debug!(count = entries.len(), "Appended WAL entries");
        Ok(())
    }

    /// Mark an entry committed.
    pub fn remove(&self, id: Uuid) -> Result<()> {
        self.remove_batch(&[id])
    }

    /// Mark several entries committed with a single flush.
    pub fn remove_batch(&self, ids: &[Uuid]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut buf = Vec::new();
        for id in ids {
            serde_json::to_writer(&mut buf, &RemovalMarker { op: "remove", id: *id })?;
            buf.push(b'\n');
        }
        self.write_synced(&buf)?;
        let mut pending = self.pending.lock();
        for id in ids {
            pending.remove(id);
        }
        Ok(())
    }

    /// Ids of pending entries touching any of `facts`.
    pub fn pending_for(&self, facts: &[FactId]) -> Vec<Uuid> {
        self.pending
            .lock()
            .iter()
            .filter(|(_, fact)| facts.contains(fact))
            .map(|(id, _)| *id)
            .collect()
    }

    fn write_synced(&self, buf: &[u8]) -> Result<()> {
        let mut file = self.file.lock();
        file.write_all(buf)?;
        file.sync_data()?;
        Ok(())
    }

    /// Entries without a removal marker, in append order.
    pub fn read_pending(&self) -> Result<Vec<WalEntry>> {
        let _guard = self.file.lock();
        Ok(read_pending_at(&self.path)?.0)
    }

    pub fn pending_count(&self) -> Result<usize> {
        Ok(self.read_pending()?.len())
    }

    /// Rewrite the log keeping only pending entries.
    ///
    /// The new log is written to a temporary file, synced and renamed over
    /// the old one, so an interrupted compaction leaves the old log intact.
    pub fn compact(&self) -> Result<CompactReport> {
        let mut file = self.file.lock();
        let (pending, lines) = read_pending_at(&self.path)?;

        let tmp = self.path.with_extension("jsonl.tmp");
        {
            let mut out = File::create(&tmp)?;
            for entry in &pending {
                serde_json::to_writer(&mut out, entry)?;
                out.write_all(b"\n")?;
            }
            out.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        *file = open_append(&self.path)?;
        *self.pending.lock() = index_pending(&pending);

        let report = CompactReport {
            kept: pending.len(),
            dropped: lines.saturating_sub(pending.len()),
        };
        if report.dropped > 0 {
            debug!(kept = report.kept, dropped = report.dropped, "Compacted WAL");
        }
        Ok(report)
    }
}

fn index_pending(entries: &[WalEntry]) -> HashMap<Uuid, FactId> {
    entries.iter().map(|e| (e.id, e.payload.fact_id)).collect()
}

fn open_append(path: &Path) -> Result<File> {
    Ok(OpenOptions::new().create(true).append(true).open(path)?)
}

/// Returns the pending entries and the number of non-blank lines read.
fn read_pending_at(path: &Path) -> Result<(Vec<WalEntry>, usize)> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
        Err(e) => return Err(e.into()),
    };

    let mut entries = Vec::new();
    let mut removed = HashSet::new();
    let mut lines = 0;

    for (lineno, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        lines += 1;
        match parse_line(line) {
            Ok(Record::Entry(entry)) => entries.push(*entry),
            Ok(Record::Remove(id)) => {
                removed.insert(id);
            }
            Err(e) => {
                // A torn final write after a crash lands here.
                warn!(line = lineno + 1, error = %e, "Skipping corrupt WAL line");
            }
        }
    }

    let mut seen = HashSet::new();
    let pending = entries
        .into_iter()
        .filter(|e| !removed.contains(&e.id) && seen.insert(e.id))
        .collect();
    Ok((pending, lines))
}

/// Rewrite a JSON-array log as NDJSON in place.
fn convert_legacy(path: &Path) -> Result<()> {
    let mut content = String::new();
    File::open(path)?.read_to_string(&mut content)?;
    if !content.trim_start().starts_with('[') {
        return Ok(());
    }

    let entries: Vec<WalEntry> = serde_json::from_str(&content)?;
    let tmp = path.with_extension("jsonl.tmp");
    {
        let mut out = File::create(&tmp)?;
        for entry in &entries {
            serde_json::to_writer(&mut out, entry)?;
            out.write_all(b"\n")?;
        }
        out.sync_all()?;
    }
    fs::rename(&tmp, path)?;

    info!(
        path = %path.display(),
        entries = entries.len(),
        "Converted legacy JSON-array WAL"
    );
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn wal() -> (tempfile::TempDir, WriteAheadLog) {
        let dir = tempfile::tempdir().unwrap();
        let wal = WriteAheadLog::open(dir.path().join(WAL_FILE)).unwrap();
        (dir, wal)
    }

    #[test]
    fn test_append_and_read_pending() {
        let (_dir, wal) = wal();
        let fact = Fact::new("User prefers dark mode");
        let entry = WalEntry::store(fact.clone(), Some(vec![0.5, 0.5]));
        wal.append(&entry).unwrap();

        let pending = wal.read_pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].operation, WalOperation::Store);
        assert_eq!(pending[0].payload.fact.as_ref().unwrap().text, fact.text);
        assert_eq!(pending[0].payload.embedding, Some(vec![0.5, 0.5]));
    }

    #[test]
    fn test_remove_marker_hides_entry() {
        let (_dir, wal) = wal();
        let a = WalEntry::store(Fact::new("a"), None);
        let b = WalEntry::delete(FactId::new());
        wal.append_batch(&[a.clone(), b.clone()]).unwrap();
        wal.remove(a.id).unwrap();

        let pending = wal.read_pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, b.id);

        let raw = fs::read_to_string(wal.path()).unwrap();
        assert_eq!(raw.lines().count(), 3);
        assert!(raw.lines().last().unwrap().contains("\"op\":\"remove\""));
    }

    #[test]
    fn test_compact_keeps_only_pending() {
        let (_dir, wal) = wal();
        let entries: Vec<_> = (0..4)
            .map(|i| WalEntry::store(Fact::new(format!("fact {i}")), None))
            .collect();
        wal.append_batch(&entries).unwrap();
        wal.remove_batch(&[entries[0].id, entries[2].id]).unwrap();

        let report = wal.compact().unwrap();
        assert_eq!(report.kept, 2);
        assert_eq!(report.dropped, 4);

        let raw = fs::read_to_string(wal.path()).unwrap();
        assert_eq!(raw.lines().count(), 2);

        // Appends continue after compaction
        wal.append(&WalEntry::delete(FactId::new())).unwrap();
        assert_eq!(wal.pending_count().unwrap(), 3);
    }

    #[test]
    fn test_pending_for_tracks_facts_across_reopen() {
        let (dir, wal) = wal();
        let (a, b) = (Fact::new("a"), Fact::new("b"));
        let first = WalEntry::store(a.clone(), None);
        let second = WalEntry::update(a.clone(), Some(vec![1.0]));
        let other = WalEntry::store(b.clone(), None);
        wal.append_batch(&[first.clone(), second.clone(), other.clone()]).unwrap();

        let mut for_a = wal.pending_for(&[a.id]);
        for_a.sort();
        let mut expected = vec![first.id, second.id];
        expected.sort();
        assert_eq!(for_a, expected);

        wal.remove(first.id).unwrap();
        assert_eq!(wal.pending_for(&[a.id]), vec![second.id]);

        drop(wal);
        let reopened = WriteAheadLog::open(dir.path().join(WAL_FILE)).unwrap();
        assert_eq!(reopened.pending_for(&[a.id]), vec![second.id]);
        assert_eq!(reopened.pending_for(&[b.id]), vec![other.id]);
        assert!(reopened.pending_for(&[FactId::new()]).is_empty());
    }

    #[test]
    fn test_corrupt_line_skipped() {
        let (_dir, wal) = wal();
        let entry = WalEntry::store(Fact::new("survives"), None);
        wal.append(&entry).unwrap();
        {
            let mut f = OpenOptions::new().append(true).open(wal.path()).unwrap();
            f.write_all(b"{\"id\":\"trunc").unwrap();
        }
        let pending = wal.read_pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, entry.id);
    }

    #[test]
    fn test_legacy_array_converted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(WAL_FILE);
        let entries = vec![
            WalEntry::store(Fact::new("legacy one"), None),
            WalEntry::update(Fact::new("legacy two"), Some(vec![1.0])),
        ];
        fs::write(&path, serde_json::to_string_pretty(&entries).unwrap()).unwrap();

        let wal = WriteAheadLog::open(&path).unwrap();
        let pending = wal.read_pending().unwrap();
        assert_eq!(pending, entries);

        let raw = fs::read_to_string(&path).unwrap();
        assert!(!raw.trim_start().starts_with('['));
        assert_eq!(raw.lines().count(), 2);
    }

    #[test]
    fn test_missing_file_reads_empty() {
        let (_dir, wal) = wal();
        fs::remove_file(wal.path()).unwrap();
        assert!(wal.read_pending().unwrap().is_empty());
    }
}
