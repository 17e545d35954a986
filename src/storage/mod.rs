//! Storage engine interface consumed by the sync engine.
//!
//! The engine never talks to a concrete store: it needs an ordered key-value
//! store with optimistic transactions, point-in-time reads, versioned row
//! values, and a watchable mutation log. Two implementations ship here — an
//! in-memory store and a SQLite-backed store behind the `sqlite` feature.

pub mod memory;
#[cfg(feature = "sqlite")]
pub mod sqlite;
pub mod watch;

pub use memory::MemStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;
pub use watch::{WatchEvent, WatchLogEntry, WatchOp};

use crate::error::Result;

/// Read-only view of a store. Log records, DAG nodes, and versioned values
/// are written once and never mutated, so implementations may serve these
/// reads live as long as `snapshot()` still observes a committed state.
pub trait StoreRead: Send {
    /// Read a metadata key (`log/`, `dag/`, `ss/`, `sg/` spaces).
    fn get_meta(&self, key: &str) -> Result<Vec<u8>>;

    /// Scan metadata keys under a prefix in lexicographic order.
    fn scan_meta_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>>;

    /// Current application-visible value of a row. `NoExist` for absent or
    /// deleted rows.
    fn get_row(&self, key: &str) -> Result<Vec<u8>>;

    /// Current version of a row, including tombstone versions.
    fn get_version(&self, key: &str) -> Result<String>;

    /// Value stored at a specific (row, version) pair.
    fn get_at_version(&self, key: &str, version: &str) -> Result<Vec<u8>>;
}

/// A read-write transaction. Reads are tracked; `commit` fails with
/// `ConcurrentTransaction` when any key read here was modified by another
/// transaction committed in between.
pub trait StoreTx: Send {
    fn get_meta(&mut self, key: &str) -> Result<Vec<u8>>;
    fn scan_meta_prefix(&mut self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>>;
    fn get_version(&mut self, key: &str) -> Result<String>;
    fn get_at_version(&mut self, key: &str, version: &str) -> Result<Vec<u8>>;

    fn put_meta(&mut self, key: &str, value: &[u8]) -> Result<()>;
    fn delete_meta(&mut self, key: &str) -> Result<()>;

    /// Application write: assigns a fresh version, makes it current, and
    /// appends a `Put` to the watch log at commit. Returns the version.
    fn put_row(&mut self, key: &str, value: &[u8]) -> Result<String>;

    /// Application delete: assigns a fresh tombstone version and appends a
    /// `Delete` to the watch log at commit. Returns the tombstone version.
    fn delete_row(&mut self, key: &str) -> Result<String>;

    /// Sync write: stage a value at an explicit version without exposing it
    /// and without touching the watch log.
    fn put_at_version(&mut self, key: &str, version: &str, value: &[u8]) -> Result<()>;

    /// Sync write: move the row's current pointer to `version`. Tombstone if
    /// `deleted`. Never appears in the watch log.
    fn put_version(&mut self, key: &str, version: &str, deleted: bool) -> Result<()>;

    /// Append a virtual syncgroup entry marking prefixes watched/unwatched.
    /// Processed by the watcher in log order.
    fn append_syncgroup_op(&mut self, prefixes: &[String], remove: bool) -> Result<()>;

    /// Append virtual snapshot entries for every live row under `prefix`,
    /// so a newly watched prefix bootstraps its pre-existing rows.
    fn append_snapshot(&mut self, prefix: &str) -> Result<()>;

    fn commit(self: Box<Self>) -> Result<()>;
    fn abort(self: Box<Self>);
}

/// The store handle held by each database.
pub trait Store: StoreRead + Send + Sync {
    fn begin(&self) -> Result<Box<dyn StoreTx>>;

    /// Point-in-time read view.
    fn snapshot(&self) -> Result<Box<dyn StoreRead>>;

    /// Read committed watch-log entries with sequence numbers greater than
    /// `from_seq`, up to `max` entries.
    fn read_watch_log(&self, from_seq: u64, max: usize) -> Result<Vec<WatchEvent>>;
}
