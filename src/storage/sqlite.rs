//! SQLite-backed store.
//!
//! Same transaction discipline as the in-memory store: reads are tracked in
//! the transaction buffer and validated at commit against an in-process
//! commit counter, writes are applied in one SQLite transaction. The watch
//! log is a rowid table of CBOR-encoded entries.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{Result, SyncError};

use super::watch::{WatchEvent, WatchLogEntry, WatchOp};
use super::{Store, StoreRead, StoreTx};

fn store_err(e: rusqlite::Error) -> SyncError {
    SyncError::Store(e.to_string())
}

fn encode_entry(entry: &WatchLogEntry) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(entry, &mut buf).map_err(|e| SyncError::Encode(e.to_string()))?;
    Ok(buf)
}

fn decode_entry(data: &[u8]) -> Result<WatchLogEntry> {
    ciborium::from_reader(data).map_err(|e| SyncError::Decode(e.to_string()))
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS meta (
    k TEXT PRIMARY KEY,
    v BLOB NOT NULL
);
CREATE TABLE IF NOT EXISTS rows (
    k TEXT PRIMARY KEY,
    version TEXT NOT NULL,
    deleted INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS row_versions (
    k TEXT NOT NULL,
    version TEXT NOT NULL,
    v BLOB NOT NULL,
    PRIMARY KEY (k, version)
);
CREATE TABLE IF NOT EXISTS watch_log (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    entry BLOB NOT NULL
);
";

// ============================================================================
// Store handle
// ============================================================================

struct Ctl {
    commit_seq: u64,
    last_mod: HashMap<String, u64>,
}

struct SqliteInner {
    conn: Mutex<Connection>,
    ctl: Mutex<Ctl>,
}

/// SQLite implementation of the store traits.
#[derive(Clone)]
pub struct SqliteStore {
    inner: Arc<SqliteInner>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        Self::from_conn(Connection::open(path).map_err(store_err)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_conn(Connection::open_in_memory().map_err(store_err)?)
    }

    fn from_conn(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA).map_err(store_err)?;
        Ok(Self {
            inner: Arc::new(SqliteInner {
                conn: Mutex::new(conn),
                ctl: Mutex::new(Ctl {
                    commit_seq: 0,
                    last_mod: HashMap::new(),
                }),
            }),
        })
    }
}

fn meta_tag(key: &str) -> String {
    format!("m:{key}")
}

fn row_tag(key: &str) -> String {
    format!("v:{key}")
}

fn query_meta(conn: &Connection, key: &str) -> Result<Vec<u8>> {
    conn.query_row("SELECT v FROM meta WHERE k = ?1", params![key], |r| {
        r.get::<_, Vec<u8>>(0)
    })
    .optional()
    .map_err(store_err)?
    .ok_or_else(|| SyncError::NoExist(key.to_string()))
}

fn query_meta_prefix(conn: &Connection, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
    let mut stmt = conn
        .prepare("SELECT k, v FROM meta WHERE k >= ?1 ORDER BY k")
        .map_err(store_err)?;
    let rows = stmt
        .query_map(params![prefix], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, Vec<u8>>(1)?))
        })
        .map_err(store_err)?;
    let mut out = Vec::new();
    for row in rows {
        let (k, v) = row.map_err(store_err)?;
        if !k.starts_with(prefix) {
            break;
        }
        out.push((k, v));
    }
    Ok(out)
}

fn query_version(conn: &Connection, key: &str) -> Result<String> {
    conn.query_row("SELECT version FROM rows WHERE k = ?1", params![key], |r| {
        r.get::<_, String>(0)
    })
    .optional()
    .map_err(store_err)?
    .ok_or_else(|| SyncError::NoExist(key.to_string()))
}

fn query_at_version(conn: &Connection, key: &str, version: &str) -> Result<Vec<u8>> {
    conn.query_row(
        "SELECT v FROM row_versions WHERE k = ?1 AND version = ?2",
        params![key, version],
        |r| r.get::<_, Vec<u8>>(0),
    )
    .optional()
    .map_err(store_err)?
    .ok_or_else(|| SyncError::NoExist(format!("{key}@{version}")))
}

impl StoreRead for SqliteStore {
    fn get_meta(&self, key: &str) -> Result<Vec<u8>> {
        query_meta(&self.inner.conn.lock(), key)
    }

    fn scan_meta_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        query_meta_prefix(&self.inner.conn.lock(), prefix)
    }

    fn get_row(&self, key: &str) -> Result<Vec<u8>> {
        let conn = self.inner.conn.lock();
        let (version, deleted) = conn
            .query_row(
                "SELECT version, deleted FROM rows WHERE k = ?1",
                params![key],
                |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)? != 0)),
            )
            .optional()
            .map_err(store_err)?
            .ok_or_else(|| SyncError::NoExist(key.to_string()))?;
        if deleted {
            return Err(SyncError::NoExist(key.to_string()));
        }
        query_at_version(&conn, key, &version)
    }

    fn get_version(&self, key: &str) -> Result<String> {
        query_version(&self.inner.conn.lock(), key)
    }

    fn get_at_version(&self, key: &str, version: &str) -> Result<Vec<u8>> {
        query_at_version(&self.inner.conn.lock(), key, version)
    }
}

impl Store for SqliteStore {
    fn begin(&self) -> Result<Box<dyn StoreTx>> {
        let start_seq = self.inner.ctl.lock().commit_seq;
        Ok(Box::new(SqliteTx {
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

    /// Log records, DAG nodes, and versioned values are immutable once
    /// written, which is what the engine reads through snapshots; the view
    /// reads live through the shared connection.
    fn snapshot(&self) -> Result<Box<dyn StoreRead>> {
        Ok(Box::new(self.clone()))
    }

    fn read_watch_log(&self, from_seq: u64, max: usize) -> Result<Vec<WatchEvent>> {
        let conn = self.inner.conn.lock();
        let mut stmt = conn
            .prepare("SELECT seq, entry FROM watch_log WHERE seq > ?1 ORDER BY seq LIMIT ?2")
            .map_err(store_err)?;
        let rows = stmt
            .query_map(params![from_seq as i64, max as i64], |r| {
                Ok((r.get::<_, i64>(0)?, r.get::<_, Vec<u8>>(1)?))
            })
            .map_err(store_err)?;
        let mut out = Vec::new();
        for row in rows {
            let (seq, raw) = row.map_err(store_err)?;
            out.push(WatchEvent {
                seq: seq as u64,
                entry: decode_entry(&raw)?,
            });
        }
        Ok(out)
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

struct SqliteTx {
    inner: Arc<SqliteInner>,
    start_seq: u64,
    reads: HashSet<String>,
    read_prefixes: Vec<String>,
    meta_writes: BTreeMap<String, Option<Vec<u8>>>,
    staged: Vec<(String, String, Vec<u8>)>,
    version_moves: Vec<(String, String, bool)>,
    row_ops: Vec<RowOp>,
    virtual_ops: Vec<VirtualOp>,
}

impl StoreTx for SqliteTx {
    fn get_meta(&mut self, key: &str) -> Result<Vec<u8>> {
        if let Some(w) = self.meta_writes.get(key) {
            return w.clone().ok_or_else(|| SyncError::NoExist(key.to_string()));
        }
        self.reads.insert(meta_tag(key));
        query_meta(&self.inner.conn.lock(), key)
    }

    fn scan_meta_prefix(&mut self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        self.read_prefixes.push(meta_tag(prefix));
        let mut merged: BTreeMap<String, Vec<u8>> =
            query_meta_prefix(&self.inner.conn.lock(), prefix)?
                .into_iter()
                .collect();
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
        if let Some((_, v, _)) = self.version_moves.iter().rev().find(|(k, _, _)| k == key) {
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
        query_version(&self.inner.conn.lock(), key)
    }

    fn get_at_version(&mut self, key: &str, version: &str) -> Result<Vec<u8>> {
        if let Some((_, _, v)) = self
            .staged
            .iter()
            .find(|(k, ver, _)| k == key && ver == version)
        {
            return Ok(v.clone());
        }
        query_at_version(&self.inner.conn.lock(), key, version)
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
        let version = uuid::Uuid::new_v4().simple().to_string();
        self.row_ops.push(RowOp::Put {
            key: key.to_string(),
            version: version.clone(),
            value: value.to_vec(),
        });
        Ok(version)
    }

    fn delete_row(&mut self, key: &str) -> Result<String> {
        let version = uuid::Uuid::new_v4().simple().to_string();
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
        let mut ctl = self.inner.ctl.lock();

        for tag in &self.reads {
            if ctl.last_mod.get(tag).copied().unwrap_or(0) > self.start_seq {
                return Err(SyncError::ConcurrentTransaction);
            }
        }
        for prefix in &self.read_prefixes {
            let conflict = ctl
                .last_mod
                .iter()
                .any(|(tag, seq)| tag.starts_with(prefix.as_str()) && *seq > self.start_seq);
            if conflict {
                return Err(SyncError::ConcurrentTransaction);
            }
        }

        ctl.commit_seq += 1;
        let commit_seq = ctl.commit_seq;
        let commit_ts = Utc::now();

        let mut conn = self.inner.conn.lock();
        let tx = conn.transaction().map_err(store_err)?;

        for (key, write) in &self.meta_writes {
            match write {
                Some(v) => {
                    tx.execute(
                        "INSERT OR REPLACE INTO meta (k, v) VALUES (?1, ?2)",
                        params![key, v],
                    )
                    .map_err(store_err)?;
                }
                None => {
                    tx.execute("DELETE FROM meta WHERE k = ?1", params![key])
                        .map_err(store_err)?;
                }
            }
            ctl.last_mod.insert(meta_tag(key), commit_seq);
        }

        for (key, version, value) in &self.staged {
            tx.execute(
                "INSERT OR REPLACE INTO row_versions (k, version, v) VALUES (?1, ?2, ?3)",
                params![key, version, value],
            )
            .map_err(store_err)?;
        }

        for (key, version, deleted) in &self.version_moves {
            tx.execute(
                "INSERT OR REPLACE INTO rows (k, version, deleted) VALUES (?1, ?2, ?3)",
                params![key, version, *deleted as i64],
            )
            .map_err(store_err)?;
            ctl.last_mod.insert(row_tag(key), commit_seq);
        }

        let mut entries: Vec<WatchLogEntry> = Vec::new();
        for op in &self.row_ops {
            match op {
                RowOp::Put {
                    key,
                    version,
                    value,
                } => {
                    tx.execute(
                        "INSERT OR REPLACE INTO row_versions (k, version, v) VALUES (?1, ?2, ?3)",
                        params![key, version, value],
                    )
                    .map_err(store_err)?;
                    tx.execute(
                        "INSERT OR REPLACE INTO rows (k, version, deleted) VALUES (?1, ?2, 0)",
                        params![key, version],
                    )
                    .map_err(store_err)?;
                    ctl.last_mod.insert(row_tag(key), commit_seq);
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
                    tx.execute(
                        "INSERT OR REPLACE INTO rows (k, version, deleted) VALUES (?1, ?2, 1)",
                        params![key, version],
                    )
                    .map_err(store_err)?;
                    ctl.last_mod.insert(row_tag(key), commit_seq);
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
                    let mut stmt = tx
                        .prepare(
                            "SELECT k, version FROM rows WHERE k >= ?1 AND deleted = 0 ORDER BY k",
                        )
                        .map_err(store_err)?;
                    let rows = stmt
                        .query_map(params![prefix], |r| {
                            Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
                        })
                        .map_err(store_err)?;
                    let mut snap: Vec<(String, String)> = Vec::new();
                    for row in rows {
                        let (k, v) = row.map_err(store_err)?;
                        if !k.starts_with(prefix.as_str()) {
                            break;
                        }
                        snap.push((k, v));
                    }
                    drop(stmt);
                    let n = snap.len();
                    for (i, (key, version)) in snap.into_iter().enumerate() {
                        entries.push(WatchLogEntry {
                            op: WatchOp::SnapshotRow { key, version },
                            commit_ts,
                            continued: i + 1 < n,
                        });
                    }
                }
            }
        }

        for entry in &entries {
            tx.execute(
                "INSERT INTO watch_log (entry) VALUES (?1)",
                params![encode_entry(entry)?],
            )
            .map_err(store_err)?;
        }

        tx.commit().map_err(store_err)
    }

    fn abort(self: Box<Self>) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync.db");

        {
            let store = SqliteStore::open(&path).unwrap();
            let mut tx = store.begin().unwrap();
            tx.put_row("/r/x", b"v1").unwrap();
            tx.put_meta("ss/state", b"state").unwrap();
            tx.commit().unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.get_row("/r/x").unwrap(), b"v1");
        assert_eq!(store.get_meta("ss/state").unwrap(), b"state");
        assert_eq!(store.read_watch_log(0, 10).unwrap().len(), 1);
    }

    #[test]
    fn watch_log_round_trips_entries() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut tx = store.begin().unwrap();
        tx.put_row("/r/a", b"1").unwrap();
        tx.delete_row("/r/a").unwrap();
        tx.append_syncgroup_op(&["/r".to_string()], false).unwrap();
        tx.commit().unwrap();

        let events = store.read_watch_log(0, 10).unwrap();
        assert_eq!(events.len(), 3);
        assert!(matches!(events[0].entry.op, WatchOp::Put { .. }));
        assert!(matches!(events[1].entry.op, WatchOp::Delete { .. }));
        assert!(matches!(
            events[2].entry.op,
            WatchOp::SyncgroupChange { .. }
        ));
        assert!(events[0].entry.continued);
        assert!(!events[1].entry.continued);
    }
}
