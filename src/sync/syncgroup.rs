//! Syncgroup registry.
//!
//! Two indexes — by name (globally unique per database) and by 64-bit id —
//! plus versioned data entries that flow through the same log/DAG machinery
//! as ordinary rows. Local admission state (join counts, pending flags)
//! lives in the id index and never syncs.

use crate::error::{Result, SyncError};
use crate::storage::{StoreRead, StoreTx};
use crate::types::{sg_oid, sg_space, DeviceId, Gen, GroupId, Pos};

use super::dag;
use super::logstore;
use super::types::{
    decode_cbor, encode_cbor, LogRecMetadata, LogRecord, RecType, SgLocalState, Syncgroup,
};

pub fn name_key(name: &str) -> String {
    format!("sg/name/{name}")
}

pub fn id_key(gid: GroupId) -> String {
    format!("sg/id/{gid:016x}")
}

/// Key of one versioned syncgroup data entry.
pub fn data_key(gid: GroupId, version: &str) -> String {
    format!("{}/{version}", sg_oid(gid))
}

/// Fresh version string for a syncgroup data entry.
pub fn new_version() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Random nonzero group id.
pub fn new_group_id() -> Result<GroupId> {
    loop {
        let mut bytes = [0u8; 8];
        getrandom::getrandom(&mut bytes).map_err(|e| SyncError::Store(format!("rng: {e}")))?;
        let gid = GroupId::from_le_bytes(bytes);
        if gid != 0 {
            return Ok(gid);
        }
    }
}

// ============================================================================
// Indexes
// ============================================================================

pub fn put_name_index(tx: &mut dyn StoreTx, name: &str, gid: GroupId) -> Result<()> {
    tx.put_meta(&name_key(name), &encode_cbor(&gid)?)
}

pub fn get_id_by_name(tx: &mut dyn StoreTx, name: &str) -> Result<GroupId> {
    decode_cbor(&tx.get_meta(&name_key(name))?)
}

pub fn get_local_state(tx: &mut dyn StoreTx, gid: GroupId) -> Result<SgLocalState> {
    decode_cbor(&tx.get_meta(&id_key(gid))?)
}

pub fn set_local_state(tx: &mut dyn StoreTx, gid: GroupId, state: &SgLocalState) -> Result<()> {
    tx.put_meta(&id_key(gid), &encode_cbor(state)?)
}

/// Group ids with local state, i.e. every syncgroup this database hosts.
pub fn list_group_ids(read: &dyn StoreRead) -> Result<Vec<GroupId>> {
    let mut out = Vec::new();
    for (key, _) in read.scan_meta_prefix("sg/id/")? {
        let hex = key.trim_start_matches("sg/id/");
        let gid = GroupId::from_str_radix(hex, 16)
            .map_err(|_| SyncError::Corrupt(format!("malformed syncgroup id key: {key}")))?;
        out.push(gid);
    }
    Ok(out)
}

// ============================================================================
// Versioned data entries
// ============================================================================

pub fn get_data(tx: &mut dyn StoreTx, gid: GroupId, version: &str) -> Result<Syncgroup> {
    decode_cbor(&tx.get_meta(&data_key(gid, version))?)
}

pub fn get_data_read(read: &dyn StoreRead, gid: GroupId, version: &str) -> Result<Syncgroup> {
    decode_cbor(&read.get_meta(&data_key(gid, version))?)
}

pub fn put_data(tx: &mut dyn StoreTx, gid: GroupId, version: &str, sg: &Syncgroup) -> Result<()> {
    tx.put_meta(&data_key(gid, version), &encode_cbor(sg)?)
}

/// Current syncgroup data, addressed through the DAG head.
pub fn get_current(tx: &mut dyn StoreTx, gid: GroupId) -> Result<(Syncgroup, String)> {
    let oid = sg_oid(gid);
    let head = dag::get_head(tx, &oid)?;
    Ok((get_data(tx, gid, &head)?, head))
}

/// Current syncgroup data through a read-only view.
pub fn get_current_read(read: &dyn StoreRead, gid: GroupId) -> Result<(Syncgroup, String)> {
    let oid = sg_oid(gid);
    let raw = read.get_meta(&dag::head_key(&oid))?;
    let head = String::from_utf8(raw)
        .map_err(|e| SyncError::Corrupt(format!("head of {oid}: {e}")))?;
    Ok((get_data_read(read, gid, &head)?, head))
}

/// Authorship of a versioned syncgroup write: a plain local mutation, a
/// logged local mutation (with reserved gen/pos), or a seed copied from a
/// remote peer at a fixed version.
pub enum SgWrite {
    Local,
    Logged { dev: DeviceId, gen: Gen, pos: Pos },
    Seed { version: String },
}

/// Store a new version of a syncgroup: write the data entry, add a DAG node
/// whose parent is the current head, optionally append a log record, and
/// move the head. Returns the new entry version.
pub fn update_versioning(
    tx: &mut dyn StoreTx,
    sg: &mut Syncgroup,
    write: SgWrite,
    upd_time: chrono::DateTime<chrono::Utc>,
) -> Result<String> {
    let gid = sg.id;
    let oid = sg_oid(gid);
    let version = match &write {
        SgWrite::Seed { version } => version.clone(),
        _ => new_version(),
    };
    sg.spec_version = version.clone();

    let parents = match dag::get_head(tx, &oid) {
        Ok(head) => vec![head],
        Err(SyncError::NoExist(_)) => vec![],
        Err(e) => return Err(e),
    };

    put_data(tx, gid, &version, sg)?;

    let log_key = match write {
        SgWrite::Logged { dev, gen, pos } => {
            let rec = LogRecord {
                metadata: LogRecMetadata {
                    id: dev,
                    gen,
                    rec_type: RecType::Node,
                    obj_id: oid.clone(),
                    cur_vers: version.clone(),
                    parents: parents.clone(),
                    upd_time,
                    delete: false,
                    batch_id: 0,
                    batch_count: 0,
                    pos,
                },
                value: None,
            };
            logstore::put_log_rec(tx, &sg_space(gid), &rec)?
        }
        // Seeds and plain local updates have no local log record.
        SgWrite::Local | SgWrite::Seed { .. } => String::new(),
    };

    dag::add_node(tx, &oid, &version, &log_key, false, &parents, 0, 0, None)?;
    dag::move_head(tx, &oid, &version)?;
    Ok(version)
}

// ============================================================================
// Deletion cascade
// ============================================================================

/// Remove a syncgroup entirely: every data version along the ancestor walk,
/// the DAG and its log records, and both index entries.
pub fn delete_syncgroup(tx: &mut dyn StoreTx, name: &str, gid: GroupId) -> Result<()> {
    let oid = sg_oid(gid);

    if let Ok(head) = dag::get_head(tx, &oid) {
        let mut versions = Vec::new();
        dag::for_each_ancestor(tx, &oid, &[head], &mut |v, _| {
            versions.push(v.to_string());
            Ok(true)
        })?;
        for version in versions {
            tx.delete_meta(&data_key(gid, &version))?;
        }
    }

    let mut batches = dag::BatchSet::new();
    dag::prune_all(tx, &oid, &mut batches, &mut |tx, log_key| {
        tx.delete_meta(log_key)
    })?;
    dag::prune_done(tx, &batches)?;

    tx.delete_meta(&name_key(name))?;
    tx.delete_meta(&id_key(gid))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemStore, Store};
    use crate::sync::types::{SyncgroupSpec, SyncgroupStatus};
    use crate::types::Permissions;
    use chrono::Utc;

    fn sample_sg(gid: GroupId) -> Syncgroup {
        Syncgroup {
            id: gid,
            name: "b/sg1".to_string(),
            spec_version: String::new(),
            spec: SyncgroupSpec {
                description: "test group".to_string(),
                prefixes: vec!["/r".to_string()],
                perms: Permissions::allow_all(&["root"]),
                mount_tables: vec!["mt1".to_string()],
            },
            creator: "root:a".to_string(),
            app_name: "app".to_string(),
            db_name: "db".to_string(),
            status: SyncgroupStatus::PublishPending,
            joiners: Default::default(),
        }
    }

    #[test]
    fn versioned_updates_chain_through_the_dag() {
        let store = MemStore::new();
        let mut tx = store.begin().unwrap();
        let gid = 7;
        let mut sg = sample_sg(gid);

        let v1 = update_versioning(tx.as_mut(), &mut sg, SgWrite::Local, Utc::now()).unwrap();
        sg.status = SyncgroupStatus::Running;
        let v2 = update_versioning(tx.as_mut(), &mut sg, SgWrite::Local, Utc::now()).unwrap();

        let (current, head) = get_current(tx.as_mut(), gid).unwrap();
        assert_eq!(head, v2);
        assert_eq!(current.status, SyncgroupStatus::Running);

        let node = dag::get_node(tx.as_mut(), &sg_oid(gid), &v2).unwrap();
        assert_eq!(node.parents, vec![v1.clone()]);

        // Both versions stay readable.
        assert_eq!(
            get_data(tx.as_mut(), gid, &v1).unwrap().status,
            SyncgroupStatus::PublishPending
        );
    }

    #[test]
    fn logged_update_writes_log_record() {
        let store = MemStore::new();
        let mut tx = store.begin().unwrap();
        let gid = 9;
        let mut sg = sample_sg(gid);

        let v1 = update_versioning(
            tx.as_mut(),
            &mut sg,
            SgWrite::Logged {
                dev: 3,
                gen: 1,
                pos: 1,
            },
            Utc::now(),
        )
        .unwrap();

        let rec = logstore::get_log_rec_tx(tx.as_mut(), &sg_space(gid), 3, 1).unwrap();
        assert_eq!(rec.metadata.cur_vers, v1);
        assert_eq!(rec.metadata.obj_id, sg_oid(gid));
    }

    #[test]
    fn seed_uses_fixed_version() {
        let store = MemStore::new();
        let mut tx = store.begin().unwrap();
        let gid = 11;
        let mut sg = sample_sg(gid);

        let v = update_versioning(
            tx.as_mut(),
            &mut sg,
            SgWrite::Seed {
                version: "admin-version-1".to_string(),
            },
            Utc::now(),
        )
        .unwrap();
        assert_eq!(v, "admin-version-1");
        assert_eq!(
            dag::get_head(tx.as_mut(), &sg_oid(gid)).unwrap(),
            "admin-version-1"
        );
    }

    #[test]
    fn delete_cascades_everything() {
        let store = MemStore::new();
        let mut tx = store.begin().unwrap();
        let gid = 13;
        let mut sg = sample_sg(gid);

        put_name_index(tx.as_mut(), &sg.name.clone(), gid).unwrap();
        set_local_state(tx.as_mut(), gid, &SgLocalState::default()).unwrap();
        update_versioning(
            tx.as_mut(),
            &mut sg,
            SgWrite::Logged {
                dev: 1,
                gen: 1,
                pos: 1,
            },
            Utc::now(),
        )
        .unwrap();
        sg.status = SyncgroupStatus::Running;
        update_versioning(
            tx.as_mut(),
            &mut sg,
            SgWrite::Logged {
                dev: 1,
                gen: 2,
                pos: 2,
            },
            Utc::now(),
        )
        .unwrap();

        delete_syncgroup(tx.as_mut(), "b/sg1", gid).unwrap();
        tx.commit().unwrap();

        assert!(store.scan_meta_prefix(&sg_oid(gid)).unwrap().is_empty());
        assert!(store.scan_meta_prefix("dag/").unwrap().is_empty());
        assert!(store.scan_meta_prefix("log/").unwrap().is_empty());
        assert!(store.scan_meta_prefix("sg/").unwrap().is_empty());
    }

    #[test]
    fn name_index_round_trip() {
        let store = MemStore::new();
        let mut tx = store.begin().unwrap();
        put_name_index(tx.as_mut(), "b/sg1", 42).unwrap();
        assert_eq!(get_id_by_name(tx.as_mut(), "b/sg1").unwrap(), 42);
        tx.commit().unwrap();
        assert_eq!(list_group_ids(&store).unwrap(), vec![] as Vec<GroupId>);
    }
}
