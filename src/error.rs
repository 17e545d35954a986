//! Error kinds surfaced by the sync engine.
//!
//! Callers match on kinds, not on implementation details: `NoExist` doubles
//! as the idempotent-delete signal, `ConcurrentTransaction` is retried by the
//! initiator, and `DupSyncgroupPublish` is treated as success by the
//! publisher.

use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum SyncError {
    #[error("does not exist: {0}")]
    NoExist(String),

    #[error("already exists: {0}")]
    Exist(String),

    #[error("concurrent transaction")]
    ConcurrentTransaction,

    #[error("access denied: {0}")]
    NoAccess(String),

    #[error("syncgroup already published: {0}")]
    DupSyncgroupPublish(String),

    #[error("conflict resolver connection broken: {0}")]
    BrokenCrConnection(String),

    #[error("database offline: {0}")]
    DbOffline(String),

    #[error("connection failed: {0}")]
    ConnFail(String),

    #[error("time request failed: {0}")]
    GetTimeFailed(String),

    #[error("bad advertisement: {0}")]
    BadAdvertisement(String),

    #[error("bad query: {0}")]
    BadQuery(String),

    #[error("encode error: {0}")]
    Encode(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("corrupt sync state: {0}")]
    Corrupt(String),
}

impl SyncError {
    /// Transient errors are worth retrying within the same round.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SyncError::ConcurrentTransaction | SyncError::ConnFail(_) | SyncError::DbOffline(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
