//! Watch-log entry types.
//!
//! Every committed transaction with application-visible row mutations
//! appends one chain of entries; `continued = true` on all but the last
//! entry of a chain delimits one application batch. Virtual entries
//! (syncgroup watch changes, snapshot bootstraps) flow through the same log
//! so the watcher observes them in commit order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One committed mutation or virtual operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WatchOp {
    /// A row was written; `version` is the newly assigned current version.
    Put { key: String, version: String },
    /// A row was deleted; `version` is the tombstone version.
    Delete { key: String, version: String },
    /// Prefixes became watched (`remove = false`) or unwatched.
    SyncgroupChange { prefixes: Vec<String>, remove: bool },
    /// Bootstrap entry for a pre-existing row under a newly watched prefix.
    SnapshotRow { key: String, version: String },
}

impl WatchOp {
    /// Row key touched by this op, if it is a row-level op.
    pub fn key(&self) -> Option<&str> {
        match self {
            WatchOp::Put { key, .. }
            | WatchOp::Delete { key, .. }
            | WatchOp::SnapshotRow { key, .. } => Some(key),
            WatchOp::SyncgroupChange { .. } => None,
        }
    }
}

/// A watch-log entry as persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchLogEntry {
    pub op: WatchOp,
    pub commit_ts: DateTime<Utc>,
    /// More entries of the same application batch follow.
    pub continued: bool,
}

/// A watch-log entry with its log sequence number (starts at 1).
#[derive(Debug, Clone, PartialEq)]
pub struct WatchEvent {
    pub seq: u64,
    pub entry: WatchLogEntry,
}
