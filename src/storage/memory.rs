//! In-memory store with optimistic transactions and a watch log.
//!
//! Reads are pure in-memory lookups; transactions buffer writes and validate
//! their read set at commit against a global commit counter, surfacing
//! `ConcurrentTransaction` on overlap. The watch log is an append-only
//! vector of committed entries.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;

use crate::error::{Result, SyncError};

use super::watch::{WatchEvent, WatchLogEntry, WatchOp};
use super::{Store, StoreRead, StoreTx};

/// Generate a fresh opaque row version.
fn new_version() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

// ============================================================================
// Inner state
// ============================================================================

#[derive(Debug, Clone, Default)]
struct RowState {
    /// Current version. `None` while only staged values exist.
    version: Option<String>,
    deleted: bool,
    /// All values ever stored, keyed by version. Versions are immutable.
    versions: HashMap<String, Vec<u8>>,
}

impl RowState {
    fn current(&self) -> Result<&String> {
        self.version
            .as_ref()
            .ok_or_else(|| SyncError::NoExist("row has no current version".to_string()))
    }
}

#[derive(Default)]
struct MemInner {
    meta: BTreeMap<String, Vec<u8>>,
    rows: HashMap<String, RowState>,
    log: Vec<WatchEvent>,
    next_log_seq: u64,
    /// Global optimistic-concurrency clock.
    commit_seq: u64,
    /// Tagged key → commit_seq of its last modification.
    last_mod: HashMap<String, u64>,
}

impl MemInner {
    fn row_value(&self, key: &str) -> Result<Vec<u8>> {
        let row = self
            .rows
            .get(key)
            .filter(|r| !r.deleted)
            .ok_or_else(|| SyncError::NoExist(key.to_string()))?;
        row.versions
            .get(row.current()?)
            .cloned()
            .ok_or_else(|| SyncError::NoExist(key.to_string()))
    }

    fn row_version(&self, key: &str) -> Result<String> {
        self.rows
            .get(key)
            .ok_or_else(|| SyncError::NoExist(key.to_string()))?
            .current()
            .cloned()
    }

    fn scan_meta(&self, prefix: &str) -> Vec<(String, Vec<u8>)> {
        self.meta
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

fn meta_tag(key: &str) -> String {
    format!("m:{key}")
}

fn row_tag(key: &str) -> String {
    format!("v:{key}")
}

// ============================================================================
// MemStore
// ============================================================================

/// Shared in-memory store handle.
#[derive(Clone, Default)]
pub struct MemStore {
    inner: Arc<Mutex<MemInner>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StoreRead for MemStore {
    fn get_meta(&self, key: &str) -> Result<Vec<u8>> {
        self.inner
            .lock()
            .meta
            .get(key)
            .cloned()
            .ok_or_else(|| SyncError::NoExist(key.to_string()))
    }

    fn scan_meta_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        Ok(self.inner.lock().scan_meta(prefix))
    }

    fn get_row(&self, key: &str) -> Result<Vec<u8>> {
        self.inner.lock().row_value(key)
    }

    fn get_version(&self, key: &str) -> Result<String> {
        self.inner.lock().row_version(key)
    }

    fn get_at_version(&self, key: &str, version: &str) -> Result<Vec<u8>> {
        self.inner
            .lock()
            .rows
            .get(key)
            .and_then(|r| r.versions.get(version))
            .cloned()
            .ok_or_else(|| SyncError::NoExist(format!("{key}@{version}")))
    }
}

impl Store for MemStore {
    fn begin(&self) -> Result<Box<dyn StoreTx>> {
        let start_seq = self.inner.lock().commit_seq;
        Ok(Box::new(MemTx {
            inner: Arc::clone(&self.inner),
            start_seq,
            reads: HashSet::new(),
            read_prefixes: Vec::new(),
            meta_writes: BTreeMap::new(),
            staged: Vec::new(),
            version_moves: Vec::new(),
            row_ops: Vec::new(),
            virtual_ops: Vec::new(),
        }))
    }

    fn snapshot(&self) -> Result<Box<dyn StoreRead>> {
        let inner = self.inner.lock();
        Ok(Box::new(MemSnapshot {
            meta: inner.meta.clone(),
            rows: inner.rows.clone(),
        }))
    }

    fn read_watch_log(&self, from_seq: u64, max: usize) -> Result<Vec<WatchEvent>> {
        let inner = self.inner.lock();
        Ok(inner
            .log
            .iter()
            .filter(|e| e.seq > from_seq)
            .take(max)
            .cloned()
            .collect())
    }
}

// ============================================================================
// Snapshot
// ============================================================================

struct MemSnapshot {
    meta: BTreeMap<String, Vec<u8>>,
    rows: HashMap<String, RowState>,
}

impl StoreRead for MemSnapshot {
    fn get_meta(&self, key: &str) -> Result<Vec<u8>> {
        self.meta
            .get(key)
            .cloned()
            .ok_or_else(|| SyncError::NoExist(key.to_string()))
    }

    fn scan_meta_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        Ok(self
            .meta
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn get_row(&self, key: &str) -> Result<Vec<u8>> {
        let row = self
            .rows
            .get(key)
            .filter(|r| !r.deleted)
            .ok_or_else(|| SyncError::NoExist(key.to_string()))?;
        row.versions
            .get(row.current()?)
            .cloned()
            .ok_or_else(|| SyncError::NoExist(key.to_string()))
    }

    fn get_version(&self, key: &str) -> Result<String> {
        self.rows
            .get(key)
            .ok_or_else(|| SyncError::NoExist(key.to_string()))?
            .current()
            .cloned()
    }

    fn get_at_version(&self, key: &str, version: &str) -> Result<Vec<u8>> {
        self.rows
            .get(key)
            .and_then(|r| r.versions.get(version))
            .cloned()
            .ok_or_else(|| SyncError::NoExist(format!("{key}@{version}")))
    }
}

// ============================================================================
// Transaction
// ============================================================================

enum RowOp {
    Put {
        key: String,
        version: String,
        value: Vec<u8>,
    },
    Delete {
        key: String,
        version: String,
    },
}

enum VirtualOp {
    SyncgroupChange { prefixes: Vec<String>, remove: bool },
    Snapshot { prefix: String },
}

struct MemTx {
    inner: Arc<Mutex<MemInner>>,
    start_seq: u64,
    reads: HashSet<String>,
    read_prefixes: Vec<String>,
    /// key → Some(value) for put, None for delete.
    meta_writes: BTreeMap<String, Option<Vec<u8>>>,
    /// (key, version, value) staged without moving the current pointer.
    staged: Vec<(String, String, Vec<u8>)>,
    /// (key, version, deleted) current-pointer moves from sync.
    version_moves: Vec<(String, String, bool)>,
    row_ops: Vec<RowOp>,
    virtual_ops: Vec<VirtualOp>,
}

impl StoreTx for MemTx {
    fn get_meta(&mut self, key: &str) -> Result<Vec<u8>> {
        if let Some(w) = self.meta_writes.get(key) {
            return w
                .clone()
                .ok_or_else(|| SyncError::NoExist(key.to_string()));
        }
        self.reads.insert(meta_tag(key));
        self.inner
            .lock()
            .meta
            .get(key)
            .cloned()
            .ok_or_else(|| SyncError::NoExist(key.to_string()))
    }

    fn scan_meta_prefix(&mut self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        self.read_prefixes.push(meta_tag(prefix));
        let mut merged: BTreeMap<String, Vec<u8>> =
            self.inner.lock().scan_meta(prefix).into_iter().collect();
        for (k, w) in self.meta_writes.range(prefix.to_string()..) {
            if !k.starts_with(prefix) {
                break;
            }
            match w {
                Some(v) => {
                    merged.insert(k.clone(), v.clone());
                }
                None => {
                    merged.remove(k);
                }
            }
        }
        Ok(merged.into_iter().collect())
    }

    fn get_version(&mut self, key: &str) -> Result<String> {
        // Later buffered writes in this tx win over committed state.
        if let Some((_, v, _)) = self
            .version_moves
            .iter()
            .rev()
            .find(|(k, _, _)| k == key)
        {
            return Ok(v.clone());
        }
        if let Some(op) = self.row_ops.iter().rev().find(|op| match op {
            RowOp::Put { key: k, .. } | RowOp::Delete { key: k, .. } => k == key,
        }) {
            return Ok(match op {
                RowOp::Put { version, .. } | RowOp::Delete { version, .. } => version.clone(),
            });
        }
        self.reads.insert(row_tag(key));
        self.inner.lock().row_version(key)
    }

    fn get_at_version(&mut self, key: &str, version: &str) -> Result<Vec<u8>> {
        if let Some((_, _, v)) = self
            .staged
            .iter()
            .find(|(k, ver, _)| k == key && ver == version)
        {
            return Ok(v.clone());
        }
        self.inner
            .lock()
            .rows
            .get(key)
            .and_then(|r| r.versions.get(version))
            .cloned()
            .ok_or_else(|| SyncError::NoExist(format!("{key}@{version}")))
    }

    fn put_meta(&mut self, key: &str, value: &[u8]) -> Result<()> {
        self.meta_writes.insert(key.to_string(), Some(value.to_vec()));
        Ok(())
    }

    fn delete_meta(&mut self, key: &str) -> Result<()> {
        self.meta_writes.insert(key.to_string(), None);
        Ok(())
    }

    fn put_row(&mut self, key: &str, value: &[u8]) -> Result<String> {
        let version = new_version();
        self.row_ops.push(RowOp::Put {
            key: key.to_string(),
            version: version.clone(),
            value: value.to_vec(),
        });
        Ok(version)
    }

    fn delete_row(&mut self, key: &str) -> Result<String> {
        let version = new_version();
        self.row_ops.push(RowOp::Delete {
            key: key.to_string(),
            version: version.clone(),
        });
        Ok(version)
    }

    fn put_at_version(&mut self, key: &str, version: &str, value: &[u8]) -> Result<()> {
        self.staged
            .push((key.to_string(), version.to_string(), value.to_vec()));
        Ok(())
    }

    fn put_version(&mut self, key: &str, version: &str, deleted: bool) -> Result<()> {
        self.version_moves
            .push((key.to_string(), version.to_string(), deleted));
        Ok(())
    }

    fn append_syncgroup_op(&mut self, prefixes: &[String], remove: bool) -> Result<()> {
        self.virtual_ops.push(VirtualOp::SyncgroupChange {
            prefixes: prefixes.to_vec(),
            remove,
        });
        Ok(())
    }

    fn append_snapshot(&mut self, prefix: &str) -> Result<()> {
        self.virtual_ops.push(VirtualOp::Snapshot {
            prefix: prefix.to_string(),
        });
        Ok(())
    }

    fn commit(self: Box<Self>) -> Result<()> {
        let mut inner = self.inner.lock();

        for tag in &self.reads {
            if inner.last_mod.get(tag).copied().unwrap_or(0) > self.start_seq {
                return Err(SyncError::ConcurrentTransaction);
            }
        }
        for prefix in &self.read_prefixes {
            let conflict = inner
                .last_mod
                .iter()
                .any(|(tag, seq)| tag.starts_with(prefix.as_str()) && *seq > self.start_seq);
            if conflict {
                return Err(SyncError::ConcurrentTransaction);
            }
        }

        inner.commit_seq += 1;
        let commit_seq = inner.commit_seq;
        let commit_ts = Utc::now();

        for (key, write) in &self.meta_writes {
            match write {
                Some(v) => {
                    inner.meta.insert(key.clone(), v.clone());
                }
                None => {
                    inner.meta.remove(key);
                }
            }
            inner.last_mod.insert(meta_tag(key), commit_seq);
        }

        for (key, version, value) in &self.staged {
            inner
                .rows
                .entry(key.clone())
                .or_default()
                .versions
                .insert(version.clone(), value.clone());
        }

        for (key, version, deleted) in &self.version_moves {
            let row = inner.rows.entry(key.clone()).or_default();
            row.version = Some(version.clone());
            row.deleted = *deleted;
            inner.last_mod.insert(row_tag(key), commit_seq);
        }

        // Application row ops become one watch-log chain.
        let mut entries: Vec<WatchLogEntry> = Vec::new();
        for op in &self.row_ops {
            match op {
                RowOp::Put {
                    key,
                    version,
                    value,
                } => {
                    let row = inner.rows.entry(key.clone()).or_default();
                    row.versions.insert(version.clone(), value.clone());
                    row.version = Some(version.clone());
                    row.deleted = false;
                    inner.last_mod.insert(row_tag(key), commit_seq);
                    entries.push(WatchLogEntry {
                        op: WatchOp::Put {
                            key: key.clone(),
                            version: version.clone(),
                        },
                        commit_ts,
                        continued: true,
                    });
                }
                RowOp::Delete { key, version } => {
                    let row = inner.rows.entry(key.clone()).or_default();
                    row.version = Some(version.clone());
                    row.deleted = true;
                    inner.last_mod.insert(row_tag(key), commit_seq);
                    entries.push(WatchLogEntry {
                        op: WatchOp::Delete {
                            key: key.clone(),
                            version: version.clone(),
                        },
                        commit_ts,
                        continued: true,
                    });
                }
            }
        }
        if let Some(last) = entries.last_mut() {
            last.continued = false;
        }

        for vop in &self.virtual_ops {
            match vop {
                VirtualOp::SyncgroupChange { prefixes, remove } => {
                    entries.push(WatchLogEntry {
                        op: WatchOp::SyncgroupChange {
                            prefixes: prefixes.clone(),
                            remove: *remove,
                        },
                        commit_ts,
                        continued: false,
                    });
                }
                VirtualOp::Snapshot { prefix } => {
                    let mut rows: Vec<(String, String)> = inner
                        .rows
                        .iter()
                        .filter(|(k, r)| k.starts_with(prefix.as_str()) && !r.deleted)
                        .filter_map(|(k, r)| {
                            r.version.as_ref().map(|v| (k.clone(), v.clone()))
                        })
                        .collect();
                    rows.sort();
                    let n = rows.len();
                    for (i, (key, version)) in rows.into_iter().enumerate() {
                        entries.push(WatchLogEntry {
                            op: WatchOp::SnapshotRow { key, version },
                            commit_ts,
                            continued: i + 1 < n,
                        });
                    }
                }
            }
        }

        for entry in entries {
            inner.next_log_seq += 1;
            let seq = inner.next_log_seq;
            inner.log.push(WatchEvent { seq, entry });
        }

        Ok(())
    }

    fn abort(self: Box<Self>) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_put_get_delete() {
        let store = MemStore::new();
        let mut tx = store.begin().unwrap();
        let v1 = tx.put_row("/r/x", b"one").unwrap();
        tx.commit().unwrap();

        assert_eq!(store.get_row("/r/x").unwrap(), b"one");
        assert_eq!(store.get_version("/r/x").unwrap(), v1);
        assert_eq!(store.get_at_version("/r/x", &v1).unwrap(), b"one");

        let mut tx = store.begin().unwrap();
        let v2 = tx.delete_row("/r/x").unwrap();
        tx.commit().unwrap();

        assert!(matches!(store.get_row("/r/x"), Err(SyncError::NoExist(_))));
        assert_eq!(store.get_version("/r/x").unwrap(), v2);
        // Earlier versions stay readable.
        assert_eq!(store.get_at_version("/r/x", &v1).unwrap(), b"one");
    }

    #[test]
    fn watch_log_batch_framing() {
        let store = MemStore::new();
        let mut tx = store.begin().unwrap();
        tx.put_row("/r/a", b"1").unwrap();
        tx.put_row("/r/b", b"2").unwrap();
        tx.put_row("/r/c", b"3").unwrap();
        tx.commit().unwrap();

        let events = store.read_watch_log(0, 10).unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].seq, 1);
        assert!(events[0].entry.continued);
        assert!(events[1].entry.continued);
        assert!(!events[2].entry.continued);
    }

    #[test]
    fn sync_writes_skip_watch_log() {
        let store = MemStore::new();
        let mut tx = store.begin().unwrap();
        tx.put_at_version("/r/x", "ver1", b"remote").unwrap();
        tx.put_version("/r/x", "ver1", false).unwrap();
        tx.commit().unwrap();

        assert!(store.read_watch_log(0, 10).unwrap().is_empty());
        assert_eq!(store.get_row("/r/x").unwrap(), b"remote");
    }

    #[test]
    fn concurrent_version_read_conflicts() {
        let store = MemStore::new();
        let mut tx = store.begin().unwrap();
        tx.put_row("/r/x", b"one").unwrap();
        tx.commit().unwrap();

        let mut tx1 = store.begin().unwrap();
        tx1.get_version("/r/x").unwrap();

        let mut tx2 = store.begin().unwrap();
        tx2.put_row("/r/x", b"two").unwrap();
        tx2.commit().unwrap();

        tx1.put_meta("ss/probe", b"x").unwrap();
        assert!(matches!(
            tx1.commit(),
            Err(SyncError::ConcurrentTransaction)
        ));
    }

    #[test]
    fn meta_scan_sees_buffered_writes() {
        let store = MemStore::new();
        let mut tx = store.begin().unwrap();
        tx.put_meta("log/data/a", b"1").unwrap();
        tx.commit().unwrap();

        let mut tx = store.begin().unwrap();
        tx.put_meta("log/data/b", b"2").unwrap();
        tx.delete_meta("log/data/a").unwrap();
        let scan = tx.scan_meta_prefix("log/data/").unwrap();
        assert_eq!(scan.len(), 1);
        assert_eq!(scan[0].0, "log/data/b");
        tx.abort();
    }

    #[test]
    fn snapshot_entries_cover_live_rows() {
        let store = MemStore::new();
        let mut tx = store.begin().unwrap();
        tx.put_row("/r/a", b"1").unwrap();
        tx.put_row("/r/b", b"2").unwrap();
        tx.commit().unwrap();
        let mut tx = store.begin().unwrap();
        tx.delete_row("/r/b").unwrap();
        tx.commit().unwrap();

        let mut tx = store.begin().unwrap();
        tx.append_snapshot("/r").unwrap();
        tx.commit().unwrap();

        let events = store.read_watch_log(3, 10).unwrap();
        assert_eq!(events.len(), 1);
        match &events[0].entry.op {
            WatchOp::SnapshotRow { key, .. } => assert_eq!(key, "/r/a"),
            other => panic!("unexpected op: {other:?}"),
        }
    }
}
