//! Syncbase sync engine: peer-to-peer synchronization for a distributed,
//! eventually-consistent key-value store.
//!
//! Devices host databases of rows grouped under collection prefixes;
//! applications form syncgroups over those prefixes and the engine
//! propagates every member's writes to every other member, detects
//! concurrent edits through per-object version DAGs, and resolves them into
//! one converged history. Storage, transport, credentials, and clocks are
//! external collaborators behind the traits in [`storage`], [`rpc`], and
//! [`types`].

pub mod discovery;
pub mod error;
pub mod rpc;
pub mod storage;
pub mod sync;
pub mod types;
pub mod wire;

pub use error::{Result, SyncError};
pub use rpc::{DeltaReq, DeltaResp, DeltaStream, LoopbackNetwork, PeerTransport};
pub use storage::{MemStore, Store, StoreRead, StoreTx};
pub use sync::resolver::{Conflict, ConflictResolver, ConflictSide, Resolution};
pub use sync::types::{
    GenVector, LogRecMetadata, LogRecord, MemberInfo, PrefixGenVector, RecType, Syncgroup,
    SyncgroupSpec, SyncgroupStatus,
};
pub use sync::{Database, SyncEngine, SyncEngineOptions, SyncScheduler};
pub use types::{AccessChecker, AccessTag, Clock, DbId, DeviceId, GroupId, Permissions};
