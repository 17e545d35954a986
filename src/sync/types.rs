//! Sync data model: log records, generation vectors, syncgroups, and the
//! in-memory per-database sync state.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};
use crate::types::{DeviceId, Gen, GroupId, Pos};

// ============================================================================
// CBOR helpers
// ============================================================================

/// Encode a persisted record as CBOR bytes.
pub(crate) fn encode_cbor<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| SyncError::Encode(e.to_string()))?;
    Ok(buf)
}

/// Decode a persisted CBOR record.
pub(crate) fn decode_cbor<T: for<'de> Deserialize<'de>>(data: &[u8]) -> Result<T> {
    ciborium::from_reader(data).map_err(|e| SyncError::Decode(e.to_string()))
}

// ============================================================================
// Generation vectors
// ============================================================================

/// Highest gen from each device known locally for one prefix.
pub type PrefixGenVector = BTreeMap<DeviceId, Gen>;

/// Map from prefix (or syncgroup oid) to its prefix generation vector.
pub type GenVector = BTreeMap<String, PrefixGenVector>;

/// `a >= b` iff for every device, `a[dev] >= b[dev]` (unlisted = 0).
pub fn pgv_dominates(a: &PrefixGenVector, b: &PrefixGenVector) -> bool {
    b.iter()
        .all(|(dev, gen)| a.get(dev).copied().unwrap_or(0) >= *gen)
}

/// Per-device max merge of `src` into `dst`.
pub fn merge_pgv(dst: &mut PrefixGenVector, src: &PrefixGenVector) {
    for (dev, gen) in src {
        let e = dst.entry(*dev).or_insert(0);
        if *gen > *e {
            *e = *gen;
        }
    }
}

// ============================================================================
// Log records
// ============================================================================

/// Kind of a log record. A Node carries a new version; a Link records that
/// an existing version adopts a new parent, produced by conflict resolution
/// that picked an existing side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecType {
    Node,
    Link,
}

/// Immutable unit of propagation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecMetadata {
    /// Device id of the record's creator.
    pub id: DeviceId,
    /// Per-(device, space) generation, starting at 1.
    pub gen: Gen,
    pub rec_type: RecType,
    /// Fully-qualified object key inside a managed namespace.
    pub obj_id: String,
    /// Globally unique version introduced (Node) or re-parented (Link).
    pub cur_vers: String,
    /// 0–2 parent versions.
    pub parents: Vec<String>,
    pub upd_time: DateTime<Utc>,
    pub delete: bool,
    /// 0 = not part of an application batch.
    pub batch_id: u64,
    pub batch_count: u64,
    /// Local-log position, assigned at insertion time.
    pub pos: Pos,
}

/// A log record with its optional value payload as shipped on the wire.
/// The value is omitted for deletions and for Link records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub metadata: LogRecMetadata,
    #[serde(with = "serde_bytes")]
    pub value: Option<Vec<u8>>,
}

// ============================================================================
// Syncgroups
// ============================================================================

/// What to sync and who may sync it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncgroupSpec {
    pub description: String,
    /// Collection/row prefixes covered by this syncgroup.
    pub prefixes: Vec<String>,
    pub perms: crate::types::Permissions,
    /// Rendezvous points tried in order when dialing peers.
    pub mount_tables: Vec<String>,
}

/// Per-member metadata carried in the joiner list.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemberInfo {
    pub sync_priority: u8,
    pub meta: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncgroupStatus {
    PublishPending,
    PublishRejected,
    Running,
}

/// A syncgroup as stored in its versioned data entry. Mutations flow through
/// the same log/DAG machinery as data rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Syncgroup {
    pub id: GroupId,
    /// Globally unique name; the component before the first `/` names the
    /// admin peer that publishes the group.
    pub name: String,
    pub spec_version: String,
    pub spec: SyncgroupSpec,
    pub creator: String,
    pub app_name: String,
    pub db_name: String,
    pub status: SyncgroupStatus,
    pub joiners: BTreeMap<String, MemberInfo>,
}

/// Local, unsynced admission state of a syncgroup, kept in the id index.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SgLocalState {
    pub num_local_joiners: u32,
    /// Whether this database currently watches the group's prefixes.
    pub watched: bool,
    /// Set at join time until the local vector catches up with the admin.
    pub sync_pending: bool,
    pub pending_genvec: PrefixGenVector,
    /// Set on the side that received the group via publish rather than
    /// creating or joining it.
    pub remote_publisher: bool,
}

// ============================================================================
// Sync state
// ============================================================================

/// Database-wide vectors persisted at `ss/`; they carry only remote
/// knowledge. Local knowledge lives in the in-memory counters and is added
/// to outbound vectors at send time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistedSyncState {
    pub genvec: GenVector,
    pub sggenvec: GenVector,
}

/// In-memory generation counters for one object space. Positions are not
/// here: they are a single per-database sequence.
#[derive(Debug, Clone)]
pub struct SpaceCounters {
    /// Next unassigned generation; assigned gens are `1..gen`.
    pub gen: Gen,
    /// Last gen frozen by `checkpoint_local_gen`; responders never ship
    /// beyond this while an initiator round is in flight.
    pub checkpt_gen: Gen,
}

impl Default for SpaceCounters {
    fn default() -> Self {
        // Generations start at 1; gen 0 is never assigned.
        Self {
            gen: 1,
            checkpt_gen: 0,
        }
    }
}

impl SpaceCounters {
    /// Knowledge of this device in the space: the last assigned gen.
    pub fn known_gen(&self) -> Gen {
        self.gen - 1
    }
}

/// In-memory sync state of one database.
#[derive(Debug)]
pub struct DbSyncState {
    /// Next unassigned log position, shared by every space so `Pos` orders
    /// and uniquely identifies insertions database-wide.
    pub pos: Pos,
    pub data: SpaceCounters,
    /// Per-syncgroup-space counters.
    pub sgs: HashMap<String, SpaceCounters>,
    pub genvec: GenVector,
    pub sggenvec: GenVector,
}

impl Default for DbSyncState {
    fn default() -> Self {
        Self {
            pos: 1,
            data: SpaceCounters::default(),
            sgs: HashMap::new(),
            genvec: GenVector::new(),
            sggenvec: GenVector::new(),
        }
    }
}

impl DbSyncState {
    pub fn counters_mut(&mut self, space: &str) -> &mut SpaceCounters {
        if space == crate::types::DATA_SPACE {
            &mut self.data
        } else {
            self.sgs.entry(space.to_string()).or_default()
        }
    }

    pub fn counters(&self, space: &str) -> Option<&SpaceCounters> {
        if space == crate::types::DATA_SPACE {
            Some(&self.data)
        } else {
            self.sgs.get(space)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pgv(entries: &[(DeviceId, Gen)]) -> PrefixGenVector {
        entries.iter().copied().collect()
    }

    #[test]
    fn pgv_compare_is_reflexive() {
        let a = pgv(&[(1, 3), (2, 5)]);
        assert!(pgv_dominates(&a, &a));
    }

    #[test]
    fn pgv_compare_is_antisymmetric() {
        let a = pgv(&[(1, 3), (2, 5)]);
        let b = pgv(&[(1, 2), (2, 5)]);
        assert!(pgv_dominates(&a, &b));
        assert!(!pgv_dominates(&b, &a));

        // Mutual domination only when equal up to zero entries.
        let c = pgv(&[(1, 3), (2, 5), (3, 0)]);
        assert!(pgv_dominates(&a, &c) && pgv_dominates(&c, &a));
    }

    #[test]
    fn pgv_compare_is_transitive() {
        let a = pgv(&[(1, 5), (2, 5)]);
        let b = pgv(&[(1, 4), (2, 3)]);
        let c = pgv(&[(1, 1)]);
        assert!(pgv_dominates(&a, &b));
        assert!(pgv_dominates(&b, &c));
        assert!(pgv_dominates(&a, &c));
    }

    #[test]
    fn pgv_incomparable_pair() {
        let a = pgv(&[(1, 5)]);
        let b = pgv(&[(2, 5)]);
        assert!(!pgv_dominates(&a, &b));
        assert!(!pgv_dominates(&b, &a));
    }

    #[test]
    fn merge_takes_per_device_max() {
        let mut a = pgv(&[(1, 3), (2, 5)]);
        merge_pgv(&mut a, &pgv(&[(1, 7), (3, 2)]));
        assert_eq!(a, pgv(&[(1, 7), (2, 5), (3, 2)]));
    }

    #[test]
    fn log_record_cbor_round_trip() {
        let rec = LogRecord {
            metadata: LogRecMetadata {
                id: 7,
                gen: 3,
                rec_type: RecType::Node,
                obj_id: "/r/x".to_string(),
                cur_vers: "v1".to_string(),
                parents: vec![],
                upd_time: Utc::now(),
                delete: false,
                batch_id: 0,
                batch_count: 0,
                pos: 12,
            },
            value: Some(b"payload".to_vec()),
        };
        let bytes = encode_cbor(&rec).unwrap();
        let back: LogRecord = decode_cbor(&bytes).unwrap();
        assert_eq!(back, rec);
    }
}
