//! Initiator: the pull side of a sync round.
//!
//! One round runs syncgroup metadata first and data second (data depends on
//! just-received membership updates), under the engine's round guard so no
//! new local generation is exposed while the checkpointed vector is on the
//! wire. The received stream is buffered, replayed into one transaction,
//! and the conflict pass commits its decisions in a second transaction with
//! read-checks against racing watcher writes; `ConcurrentTransaction`
//! aborts and retries the whole replay with a back-off.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, TimeZone, Utc};

use crate::error::{Result, SyncError};
use crate::rpc::{DeltaReq, DeltaResp, DeltaStream};
use crate::storage::StoreTx;
use crate::types::{
    group_id_of_oid, is_sg_oid, prefix_covers, sg_oid, sg_space, DeviceId, GroupId, DATA_SPACE,
};

use super::dag::{self, GraftMap};
use super::logstore;
use super::resolver::{Conflict, ConflictSide, Resolution};
use super::syncgroup;
use super::types::{
    decode_cbor, pgv_dominates, GenVector, LogRecMetadata, LogRecord, PersistedSyncState,
    RecType, SgLocalState,
};
use super::{Database, SyncEngine};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Round {
    SgMeta,
    Data,
}

/// Run one full round against `peer`: syncgroup metadata, then data. A
/// failed metadata round skips the data round.
pub async fn sync_once(engine: &SyncEngine, path: &str, peer: &str) -> Result<()> {
    let db = engine.db(path)?;
    let _round = engine.round_guard().await;
    run_round(engine, &db, path, peer, Round::SgMeta).await?;
    run_round(engine, &db, path, peer, Round::Data).await
}

async fn run_round(
    engine: &SyncEngine,
    db: &std::sync::Arc<Database>,
    path: &str,
    peer: &str,
    round: Round,
) -> Result<()> {
    let dev = engine.device_id()?;
    let groups = load_groups(db)?;
    if groups.is_empty() {
        return Ok(());
    }

    // Freeze outbound knowledge and build the request vector.
    let init_vec = match round {
        Round::SgMeta => engine.with_state(path, |s| {
            let mut iv = GenVector::new();
            for (gid, _, _) in &groups {
                let checkpt = logstore::checkpoint_local_gen(s, &sg_space(*gid));
                let oid = sg_oid(*gid);
                let mut pgv = s.sggenvec.get(&oid).cloned().unwrap_or_default();
                if checkpt > 0 {
                    pgv.insert(dev, checkpt);
                }
                iv.insert(oid, pgv);
            }
            iv
        })?,
        Round::Data => engine.with_state(path, |s| {
            let checkpt = logstore::checkpoint_local_gen(s, DATA_SPACE);
            let mut prefixes: BTreeSet<String> = BTreeSet::new();
            for (_, sg, _) in &groups {
                prefixes.extend(sg.spec.prefixes.iter().cloned());
            }
            let mut iv = GenVector::new();
            for prefix in prefixes {
                // Longest local prefix that is an ancestor of this one.
                let mut pgv = s
                    .genvec
                    .iter()
                    .filter(|(lp, _)| prefix_covers(lp, &prefix))
                    .max_by_key(|(lp, _)| lp.len())
                    .map(|(_, pgv)| pgv.clone())
                    .unwrap_or_default();
                if checkpt > 0 {
                    pgv.insert(dev, checkpt);
                }
                iv.insert(prefix, pgv);
            }
            iv
        })?,
    };
    if init_vec.is_empty() {
        return Ok(());
    }

    let req = match round {
        Round::SgMeta => DeltaReq::Sg {
            app: db.id.app.clone(),
            db: db.id.name.clone(),
            init_vec,
        },
        Round::Data => DeltaReq::Data {
            app: db.id.app.clone(),
            db: db.id.name.clone(),
            sg_ids: groups.iter().map(|(gid, _, _)| *gid).collect(),
            init_vec,
        },
    };

    let sg_tables: Vec<String> = groups
        .iter()
        .flat_map(|(_, sg, _)| sg.spec.mount_tables.iter().cloned())
        .collect();
    let stream = dial(engine, db, peer, &sg_tables, req).await?;
    let (records, resp_vec) = collect_stream(stream).await?;
    verify_batches(&records)?;

    let mut attempts = 0;
    loop {
        match replay(engine, db, path, round, dev, &records, &resp_vec).await {
            Ok(()) => break,
            Err(SyncError::ConcurrentTransaction)
                if attempts < engine.cfg().replay_retries() =>
            {
                attempts += 1;
                tracing::debug!(db = %path, peer, attempts, "replay raced, backing off");
                tokio::time::sleep(engine.cfg().replay_backoff()).await;
            }
            Err(e) => return Err(e),
        }
    }

    if round == Round::SgMeta {
        clear_caught_up_pendings(engine, db, path)?;
    }
    Ok(())
}

fn load_groups(
    db: &Database,
) -> Result<Vec<(GroupId, super::types::Syncgroup, SgLocalState)>> {
    let mut out = Vec::new();
    for gid in syncgroup::list_group_ids(db.store.as_ref())? {
        let mut tx = db.store.begin()?;
        let local = syncgroup::get_local_state(tx.as_mut(), gid)?;
        if let Ok((sg, _)) = syncgroup::get_current(tx.as_mut(), gid) {
            out.push((gid, sg, local));
        }
        tx.abort();
    }
    Ok(out)
}

// ============================================================================
// Dialing
// ============================================================================

/// Try each mount table with a bounded deadline, remembering the one that
/// worked; neighborhood addresses come last.
async fn dial(
    engine: &SyncEngine,
    db: &Database,
    peer: &str,
    sg_tables: &[String],
    req: DeltaReq,
) -> Result<DeltaStream> {
    let addrs = engine.dial_addresses(db, peer, sg_tables);
    if addrs.is_empty() {
        return Err(SyncError::ConnFail(format!("no route to {peer}")));
    }

    let tables = engine.dial_tables(db, peer, sg_tables);
    let mut last_err = SyncError::ConnFail(peer.to_string());
    for addr in addrs {
        let attempt = tokio::time::timeout(
            engine.cfg().dial_timeout(),
            engine.transport().get_deltas(&addr, engine.name(), req.clone()),
        )
        .await;
        match attempt {
            Ok(Ok(stream)) => {
                if let Some((table, _)) = addr.rsplit_once('/') {
                    db.promote_table(peer, table, &tables);
                }
                return Ok(stream);
            }
            Ok(Err(e @ (SyncError::ConnFail(_) | SyncError::DbOffline(_)))) => {
                tracing::debug!(peer, addr, error = %e, "dial failed, rotating");
                last_err = e;
            }
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                last_err = SyncError::ConnFail(format!("dial timeout: {addr}"));
            }
        }
    }
    Err(last_err)
}

// ============================================================================
// Stream collection
// ============================================================================

async fn collect_stream(mut stream: DeltaStream) -> Result<(Vec<LogRecord>, GenVector)> {
    match stream.next().await {
        Some(DeltaResp::Start) => {}
        _ => return Err(SyncError::ConnFail("delta stream did not start".to_string())),
    }
    let mut records = Vec::new();
    let mut resp_vec: Option<GenVector> = None;
    loop {
        match stream.next().await {
            Some(DeltaResp::Rec(rec)) => records.push(rec),
            Some(DeltaResp::RespVec(v)) => resp_vec = Some(v),
            Some(DeltaResp::Finish) => break,
            Some(DeltaResp::Start) => {
                return Err(SyncError::Decode("unexpected second Start".to_string()))
            }
            None => return Err(SyncError::ConnFail("delta stream truncated".to_string())),
        }
    }
    Ok((records, resp_vec.unwrap_or_default()))
}

/// Records of one batch must agree on the count.
fn verify_batches(records: &[LogRecord]) -> Result<()> {
    let mut counts: HashMap<u64, u64> = HashMap::new();
    for rec in records {
        let m = &rec.metadata;
        if m.batch_id == 0 {
            continue;
        }
        match counts.insert(m.batch_id, m.batch_count) {
            Some(prev) if prev != m.batch_count => {
                return Err(SyncError::Corrupt(format!(
                    "batch {:x} count mismatch: {} vs {}",
                    m.batch_id, prev, m.batch_count
                )));
            }
            _ => {}
        }
    }
    Ok(())
}

// ============================================================================
// Replay
// ============================================================================

async fn replay(
    engine: &SyncEngine,
    db: &Database,
    path: &str,
    round: Round,
    dev: DeviceId,
    records: &[LogRecord],
    resp_vec: &GenVector,
) -> Result<()> {
    // Step 1: one transaction for the whole received batch.
    let mut tx = db.store.begin()?;
    let mut graft = GraftMap::new();

    for rec in records {
        let m = &rec.metadata;
        let space = match round {
            Round::Data => DATA_SPACE.to_string(),
            Round::SgMeta => sg_space(group_id_of_oid(&m.obj_id)?),
        };

        match m.rec_type {
            RecType::Node => {
                if dag::has_node(tx.as_mut(), &m.obj_id, &m.cur_vers) {
                    // Already applied in an earlier round or attempt; keep
                    // the graft bookkeeping so detection still sees it, and
                    // backfill parent edges a seeded copy may be missing.
                    graft.note_node(tx.as_mut(), &m.obj_id, &m.cur_vers, &m.parents);
                    for parent in &m.parents {
                        if dag::has_node(tx.as_mut(), &m.obj_id, parent) {
                            dag::add_parent(tx.as_mut(), &m.obj_id, &m.cur_vers, parent, None)?;
                        }
                    }
                    continue;
                }
                let pos = engine.with_state(path, |s| logstore::reserve_pos(s, 1))?;
                let mut stored = rec.clone();
                stored.metadata.pos = pos;
                let value = stored.value.take();
                let log_key = logstore::put_log_rec(tx.as_mut(), &space, &stored)?;
                dag::add_node(
                    tx.as_mut(),
                    &m.obj_id,
                    &m.cur_vers,
                    &log_key,
                    m.delete,
                    &m.parents,
                    m.batch_id,
                    m.batch_count,
                    Some(&mut graft),
                )?;
                if round == Round::SgMeta {
                    let gid = group_id_of_oid(&m.obj_id)?;
                    let raw = value.ok_or_else(|| {
                        SyncError::Decode(format!(
                            "syncgroup record {} has no data entry",
                            m.cur_vers
                        ))
                    })?;
                    tx.put_meta(&syncgroup::data_key(gid, &m.cur_vers), &raw)?;
                } else if !m.delete {
                    tx.put_at_version(&m.obj_id, &m.cur_vers, &value.unwrap_or_default())?;
                }
            }
            RecType::Link => {
                if !dag::has_node(tx.as_mut(), &m.obj_id, &m.cur_vers) {
                    tracing::warn!(
                        obj = %m.obj_id,
                        version = %m.cur_vers,
                        "link to unknown version, skipping"
                    );
                    continue;
                }
                let pos = engine.with_state(path, |s| logstore::reserve_pos(s, 1))?;
                if !logstore::has_log_rec(tx.as_mut(), &space, m.id, m.gen) {
                    let mut stored = rec.clone();
                    stored.metadata.pos = pos;
                    stored.value = None;
                    logstore::put_log_rec(tx.as_mut(), &space, &stored)?;
                }
                for parent in &m.parents {
                    if parent != &m.cur_vers {
                        dag::add_parent(
                            tx.as_mut(),
                            &m.obj_id,
                            &m.cur_vers,
                            parent,
                            Some(&mut graft),
                        )?;
                    }
                }
            }
        }
    }
    tx.commit()?;

    // Steps 2–3: conflict pass and decision transaction.
    let mut tx = db.store.begin()?;
    let mut objs: Vec<String> = graft.objects().cloned().collect();
    objs.sort();
    let mut sg_updated = false;

    for obj in &objs {
        let st = dag::has_conflict(tx.as_mut(), obj, &graft)?;
        read_check(tx.as_mut(), obj, st.old_head.as_deref())?;

        if !st.conflict {
            if st.old_head.as_deref() == Some(st.new_head.as_str()) {
                continue;
            }
            apply_head(tx.as_mut(), obj, &st.new_head)?;
            sg_updated |= is_sg_oid(obj);
            continue;
        }

        let old_head = st
            .old_head
            .clone()
            .ok_or_else(|| SyncError::Corrupt(format!("conflict without local head on {obj}")))?;
        let conflict = build_conflict(tx.as_mut(), obj, &old_head, &st.new_head, st.ancestor.as_deref())?;
        let resolution = engine.resolvers().resolve(&conflict).await;
        let space = record_space(obj)?;

        match resolution {
            Resolution::PickLocal => {
                let (gen, pos) =
                    engine.with_state(path, |s| logstore::reserve_gen_and_pos(s, &space, 1))?;
                append_link(
                    tx.as_mut(),
                    &space,
                    dev,
                    gen,
                    pos,
                    obj,
                    &old_head,
                    &st.new_head,
                    &old_head,
                    engine.now(),
                )?;
                dag::add_parent(tx.as_mut(), obj, &old_head, &st.new_head, None)?;
                dag::move_head(tx.as_mut(), obj, &old_head)?;
            }
            Resolution::PickRemote => {
                let (gen, pos) =
                    engine.with_state(path, |s| logstore::reserve_gen_and_pos(s, &space, 1))?;
                append_link(
                    tx.as_mut(),
                    &space,
                    dev,
                    gen,
                    pos,
                    obj,
                    &st.new_head,
                    &st.new_head,
                    &old_head,
                    engine.now(),
                )?;
                dag::add_parent(tx.as_mut(), obj, &st.new_head, &old_head, None)?;
                apply_head(tx.as_mut(), obj, &st.new_head)?;
            }
            Resolution::CreateNew(value) => {
                let synth = uuid::Uuid::new_v4().simple().to_string();
                let (gen, pos) =
                    engine.with_state(path, |s| logstore::reserve_gen_and_pos(s, &space, 1))?;
                let rec = LogRecord {
                    metadata: LogRecMetadata {
                        id: dev,
                        gen,
                        rec_type: RecType::Node,
                        obj_id: obj.clone(),
                        cur_vers: synth.clone(),
                        parents: vec![old_head.clone(), st.new_head.clone()],
                        upd_time: engine.now(),
                        delete: false,
                        batch_id: 0,
                        batch_count: 0,
                        pos,
                    },
                    value: None,
                };
                let log_key = logstore::put_log_rec(tx.as_mut(), &space, &rec)?;
                dag::add_node(
                    tx.as_mut(),
                    obj,
                    &synth,
                    &log_key,
                    false,
                    &[old_head.clone(), st.new_head.clone()],
                    0,
                    0,
                    None,
                )?;
                if is_sg_oid(obj) {
                    let gid = group_id_of_oid(obj)?;
                    tx.put_meta(&syncgroup::data_key(gid, &synth), &value)?;
                } else {
                    tx.put_at_version(obj, &synth, &value)?;
                    tx.put_version(obj, &synth, false)?;
                }
                dag::move_head(tx.as_mut(), obj, &synth)?;
            }
        }
        sg_updated |= is_sg_oid(obj);
    }

    // Merge the responder's vector and persist in the same transaction; the
    // in-memory copy follows only after a successful commit.
    let merged = engine.with_state(path, |s| {
        let mut genvec = s.genvec.clone();
        let mut sggenvec = s.sggenvec.clone();
        match round {
            Round::Data => merge_data_genvec(&mut genvec, resp_vec, dev),
            Round::SgMeta => merge_sg_genvec(&mut sggenvec, resp_vec, dev),
        }
        PersistedSyncState { genvec, sggenvec }
    })?;
    logstore::save_sync_state(tx.as_mut(), &merged)?;
    tx.commit()?;

    engine.with_state(path, |s| {
        s.genvec = merged.genvec;
        s.sggenvec = merged.sggenvec;
    })?;
    if sg_updated {
        engine.membership_changed();
    }
    Ok(())
}

/// Detect a race with the watcher: the object's current state must still be
/// what conflict detection saw.
fn read_check(tx: &mut dyn StoreTx, obj: &str, old_head: Option<&str>) -> Result<()> {
    let current = if is_sg_oid(obj) {
        match dag::get_head(tx, obj) {
            Ok(head) => Some(head),
            Err(SyncError::NoExist(_)) => None,
            Err(e) => return Err(e),
        }
    } else {
        match tx.get_version(obj) {
            Ok(version) => Some(version),
            Err(SyncError::NoExist(_)) => None,
            Err(e) => return Err(e),
        }
    };
    if current.as_deref() == old_head {
        Ok(())
    } else {
        Err(SyncError::ConcurrentTransaction)
    }
}

/// Move head to `version` and expose the matching store state for rows.
fn apply_head(tx: &mut dyn StoreTx, obj: &str, version: &str) -> Result<()> {
    if !is_sg_oid(obj) {
        let node = dag::get_node(tx, obj, version)?;
        tx.put_version(obj, version, node.deleted)?;
    }
    dag::move_head(tx, obj, version)
}

fn record_space(obj: &str) -> Result<String> {
    if is_sg_oid(obj) {
        Ok(sg_space(group_id_of_oid(obj)?))
    } else {
        Ok(DATA_SPACE.to_string())
    }
}

/// Append the Link record produced by a local/remote pick. The parents list
/// carries both heads, remote first; only the non-self edge goes into the
/// DAG.
#[allow(clippy::too_many_arguments)]
fn append_link(
    tx: &mut dyn StoreTx,
    space: &str,
    dev: DeviceId,
    gen: u64,
    pos: u64,
    obj: &str,
    winner: &str,
    remote_head: &str,
    local_head: &str,
    upd_time: DateTime<Utc>,
) -> Result<()> {
    let rec = LogRecord {
        metadata: LogRecMetadata {
            id: dev,
            gen,
            rec_type: RecType::Link,
            obj_id: obj.to_string(),
            cur_vers: winner.to_string(),
            parents: vec![remote_head.to_string(), local_head.to_string()],
            upd_time,
            delete: false,
            batch_id: 0,
            batch_count: 0,
            pos,
        },
        value: None,
    };
    logstore::put_log_rec(tx, space, &rec)?;
    Ok(())
}

fn build_conflict(
    tx: &mut dyn StoreTx,
    obj: &str,
    local: &str,
    remote: &str,
    ancestor: Option<&str>,
) -> Result<Conflict> {
    Ok(Conflict {
        obj_id: obj.to_string(),
        local: conflict_side(tx, obj, local)?,
        remote: conflict_side(tx, obj, remote)?,
        ancestor: match ancestor {
            Some(version) => Some(conflict_side(tx, obj, version)?),
            None => None,
        },
    })
}

fn conflict_side(tx: &mut dyn StoreTx, obj: &str, version: &str) -> Result<ConflictSide> {
    let node = dag::get_node(tx, obj, version)?;
    let value = if node.deleted {
        None
    } else if is_sg_oid(obj) {
        let gid = group_id_of_oid(obj)?;
        tx.get_meta(&syncgroup::data_key(gid, version)).ok()
    } else {
        tx.get_at_version(obj, version).ok()
    };

    let (upd_time, device) = if node.log_key.is_empty() {
        (Utc.timestamp_opt(0, 0).single().unwrap_or_else(Utc::now), 0)
    } else {
        let rec: LogRecord = decode_cbor(&tx.get_meta(&node.log_key)?)?;
        (rec.metadata.upd_time, rec.metadata.id)
    };

    Ok(ConflictSide {
        version: version.to_string(),
        value,
        deleted: node.deleted,
        upd_time,
        device,
    })
}

// ============================================================================
// Vector merge
// ============================================================================

/// Data-round merge: a responder prefix folds into every local prefix that
/// extends it, or lands as-is when none does. Local-device entries never
/// persist.
fn merge_data_genvec(local: &mut GenVector, resp: &GenVector, own: DeviceId) {
    for (rp, rpgv) in resp {
        let mut found_extension = false;
        for (lp, lpgv) in local.iter_mut() {
            if prefix_covers(rp, lp) {
                found_extension = true;
                super::types::merge_pgv(lpgv, rpgv);
            }
        }
        if !found_extension {
            local.insert(rp.clone(), rpgv.clone());
        }
    }
    for pgv in local.values_mut() {
        pgv.remove(&own);
    }
}

/// Syncgroup-round merge: oids are exact keys.
fn merge_sg_genvec(local: &mut GenVector, resp: &GenVector, own: DeviceId) {
    for (oid, rpgv) in resp {
        super::types::merge_pgv(local.entry(oid.clone()).or_default(), rpgv);
    }
    for pgv in local.values_mut() {
        pgv.remove(&own);
    }
}

// ============================================================================
// Pending-join completion
// ============================================================================

/// A joined syncgroup leaves its pending state once the merged vector plus
/// local knowledge dominates the checkpoint received at join time.
fn clear_caught_up_pendings(engine: &SyncEngine, db: &Database, path: &str) -> Result<()> {
    for gid in syncgroup::list_group_ids(db.store.as_ref())? {
        let mut tx = db.store.begin()?;
        let mut local = match syncgroup::get_local_state(tx.as_mut(), gid) {
            Ok(local) => local,
            Err(_) => {
                tx.abort();
                continue;
            }
        };
        if !local.sync_pending {
            tx.abort();
            continue;
        }
        let knowledge = engine.sg_knowledge(path, gid)?;
        if pgv_dominates(&knowledge, &local.pending_genvec) {
            tracing::info!(gid, db = %path, "pending syncgroup caught up");
            local.sync_pending = false;
            local.pending_genvec.clear();
            syncgroup::set_local_state(tx.as_mut(), gid, &local)?;
            tx.commit()?;
        } else {
            tx.abort();
        }
    }
    Ok(())
}
