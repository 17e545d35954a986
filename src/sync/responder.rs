//! Responder: serves one `GetDeltas` call from persisted state.
//!
//! Authorizes the caller per syncgroup, diffs the initiator's vector
//! against the frozen local vector into missing generation ranges, and
//! streams the records in strictly non-decreasing local position order.
//! Unauthorized syncgroups are silently dropped from the working set.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};

use tokio::sync::mpsc;

use crate::error::{Result, SyncError};
use crate::rpc::{DeltaReq, DeltaResp};
use crate::storage::StoreRead;
use crate::types::{
    group_id_of_oid, prefix_covers, sg_oid, sg_space, AccessTag, DeviceId, Gen, GroupId,
    DATA_SPACE,
};

use super::logstore;
use super::syncgroup;
use super::types::{GenVector, LogRecord, PrefixGenVector, RecType};
use super::{Database, SyncEngine};

/// Serve one delta request into `sink`.
pub async fn serve_deltas(
    engine: &SyncEngine,
    caller: &str,
    req: DeltaReq,
    sink: mpsc::Sender<DeltaResp>,
) -> Result<()> {
    let path = req.db_path()?;
    let db = engine.db(&path)?;

    send(&sink, DeltaResp::Start).await?;
    let (records, resp_vec) = match req {
        DeltaReq::Sg { init_vec, .. } => sg_deltas(engine, &db, &path, caller, &init_vec)?,
        DeltaReq::Data {
            sg_ids, init_vec, ..
        } => data_deltas(engine, &db, &path, caller, &sg_ids, &init_vec)?,
    };
    for rec in records {
        send(&sink, DeltaResp::Rec(rec)).await?;
    }
    send(&sink, DeltaResp::RespVec(resp_vec)).await?;
    send(&sink, DeltaResp::Finish).await
}

async fn send(sink: &mpsc::Sender<DeltaResp>, msg: DeltaResp) -> Result<()> {
    sink.send(msg)
        .await
        .map_err(|_| SyncError::ConnFail("initiator went away".to_string()))
}

// ============================================================================
// Syncgroup-metadata deltas
// ============================================================================

fn sg_deltas(
    engine: &SyncEngine,
    db: &Database,
    path: &str,
    caller: &str,
    init_vec: &GenVector,
) -> Result<(Vec<LogRecord>, GenVector)> {
    let spaces: Vec<String> = init_vec
        .keys()
        .filter_map(|oid| group_id_of_oid(oid).ok())
        .map(sg_space)
        .collect();
    engine.try_checkpoint(path, &spaces);

    let snapshot = db.store.snapshot()?;
    let dev = engine.device_id()?;
    let blessings = [caller.to_string()];

    let mut resp_vec = GenVector::new();
    let mut cursors: Vec<VecDeque<LogRecord>> = Vec::new();

    for (oid, init_pgv) in init_vec {
        let gid = match group_id_of_oid(oid) {
            Ok(gid) => gid,
            Err(e) => {
                tracing::warn!(db = %path, oid = %oid, error = %e, "bad syncgroup oid in request");
                continue;
            }
        };
        let Ok((sg, _)) = syncgroup::get_current_read(snapshot.as_ref(), gid) else {
            continue;
        };
        if !engine
            .checker()
            .allowed(&sg.spec.perms, AccessTag::Read, &blessings)
        {
            // Dropped from the working set; no trace of it in the reply.
            continue;
        }

        let local_pgv = frozen_sg_knowledge(engine, path, gid, dev)?;
        for (rec_dev, local_gen) in &local_pgv {
            let floor = init_pgv.get(rec_dev).copied().unwrap_or(0);
            if *local_gen > floor {
                let recs = logstore::scan_log_recs(
                    snapshot.as_ref(),
                    &sg_space(gid),
                    *rec_dev,
                    floor + 1,
                    *local_gen,
                )?;
                let mut queue = VecDeque::new();
                for mut rec in recs {
                    attach_sg_value(snapshot.as_ref(), gid, &mut rec)?;
                    queue.push_back(rec);
                }
                if !queue.is_empty() {
                    cursors.push(queue);
                }
            }
        }
        resp_vec.insert(oid.clone(), local_pgv);
    }

    Ok((merge_by_pos(cursors), resp_vec))
}

fn frozen_sg_knowledge(
    engine: &SyncEngine,
    path: &str,
    gid: GroupId,
    dev: DeviceId,
) -> Result<PrefixGenVector> {
    engine.with_state(path, |s| {
        let mut pgv = s.sggenvec.get(&sg_oid(gid)).cloned().unwrap_or_default();
        let checkpt = s
            .counters(&sg_space(gid))
            .map(|c| c.checkpt_gen)
            .unwrap_or(0);
        if checkpt > 0 {
            pgv.insert(dev, checkpt);
        }
        pgv
    })
}

/// Syncgroup Node records carry the versioned data entry as their value.
fn attach_sg_value(snapshot: &dyn StoreRead, gid: GroupId, rec: &mut LogRecord) -> Result<()> {
    if rec.metadata.rec_type == RecType::Node && !rec.metadata.delete {
        match snapshot.get_meta(&syncgroup::data_key(gid, &rec.metadata.cur_vers)) {
            Ok(raw) => rec.value = Some(raw),
            Err(SyncError::NoExist(_)) => {
                tracing::warn!(
                    gid,
                    version = %rec.metadata.cur_vers,
                    "syncgroup data entry missing for shipped record"
                );
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

// ============================================================================
// Data deltas
// ============================================================================

fn data_deltas(
    engine: &SyncEngine,
    db: &Database,
    path: &str,
    caller: &str,
    sg_ids: &std::collections::BTreeSet<GroupId>,
    init_vec: &GenVector,
) -> Result<(Vec<LogRecord>, GenVector)> {
    engine.try_checkpoint(path, &[DATA_SPACE.to_string()]);

    let snapshot = db.store.snapshot()?;
    let dev = engine.device_id()?;
    let blessings = [caller.to_string()];

    // Phase 1: authorize and filter.
    let mut allowed_prefixes: Vec<String> = Vec::new();
    for gid in sg_ids {
        let Ok((sg, _)) = syncgroup::get_current_read(snapshot.as_ref(), *gid) else {
            continue;
        };
        if !engine
            .checker()
            .allowed(&sg.spec.perms, AccessTag::Read, &blessings)
        {
            continue;
        }
        for prefix in &sg.spec.prefixes {
            if !allowed_prefixes.contains(prefix) {
                allowed_prefixes.push(prefix.clone());
            }
        }
    }
    let kept: Vec<(&String, &PrefixGenVector)> = init_vec
        .iter()
        .filter(|(rp, _)| allowed_prefixes.iter().any(|ap| prefix_covers(ap, rp)))
        .collect();

    // Phase 2: compute the missing ranges against the frozen local vector.
    let (genvec, checkpt) = engine.with_state(path, |s| {
        (s.genvec.clone(), s.data.checkpt_gen)
    })?;

    let mut resp_vec = GenVector::new();
    // dev → (floor per request prefix, merged missing range).
    let mut missing: HashMap<DeviceId, (Gen, Gen)> = HashMap::new();
    let mut floors: HashMap<&str, &PrefixGenVector> = HashMap::new();

    for (rp, init_pgv) in &kept {
        floors.insert(rp.as_str(), init_pgv);
        let mut local_pgv = PrefixGenVector::new();
        for (lp, pgv) in &genvec {
            if prefix_covers(lp, rp) || prefix_covers(rp, lp) {
                super::types::merge_pgv(&mut local_pgv, pgv);
            }
        }
        if checkpt > 0 {
            local_pgv.insert(dev, checkpt);
        }
        for (rec_dev, local_gen) in &local_pgv {
            let floor = init_pgv.get(rec_dev).copied().unwrap_or(0);
            if *local_gen > floor {
                let entry = missing.entry(*rec_dev).or_insert((floor + 1, *local_gen));
                entry.0 = entry.0.min(floor + 1);
                entry.1 = entry.1.max(*local_gen);
            }
        }
        resp_vec.insert((*rp).clone(), local_pgv);
    }

    // Phase 3: stream eligible records in local-position order.
    let mut cursors: Vec<VecDeque<LogRecord>> = Vec::new();
    for (rec_dev, (lo, hi)) in missing {
        let recs = logstore::scan_log_recs(snapshot.as_ref(), DATA_SPACE, rec_dev, lo, hi)?;
        let mut queue = VecDeque::new();
        for mut rec in recs {
            if !eligible(&rec, &floors) {
                continue;
            }
            if rec.metadata.rec_type == RecType::Node && !rec.metadata.delete {
                match snapshot.get_at_version(&rec.metadata.obj_id, &rec.metadata.cur_vers) {
                    Ok(value) => rec.value = Some(value),
                    Err(SyncError::NoExist(_)) => {
                        tracing::warn!(
                            obj = %rec.metadata.obj_id,
                            version = %rec.metadata.cur_vers,
                            "value missing for shipped record"
                        );
                    }
                    Err(e) => return Err(e),
                }
            }
            queue.push_back(rec);
        }
        if !queue.is_empty() {
            cursors.push(queue);
        }
    }

    Ok((merge_by_pos(cursors), resp_vec))
}

/// A record is shipped when some requested prefix covers its object and the
/// initiator does not already know this generation under that prefix.
fn eligible(rec: &LogRecord, floors: &HashMap<&str, &PrefixGenVector>) -> bool {
    floors.iter().any(|(rp, pgv)| {
        prefix_covers(rp, &rec.metadata.obj_id)
            && rec.metadata.gen > pgv.get(&rec.metadata.id).copied().unwrap_or(0)
    })
}

// ============================================================================
// Position-ordered merge
// ============================================================================

/// Merge per-device gen-ordered queues into one stream ordered by local
/// position. Positions within a batch are contiguous per device, so batches
/// never interleave.
fn merge_by_pos(mut cursors: Vec<VecDeque<LogRecord>>) -> Vec<LogRecord> {
    let mut heap: BinaryHeap<Reverse<(u64, usize)>> = BinaryHeap::new();
    for (i, queue) in cursors.iter().enumerate() {
        if let Some(front) = queue.front() {
            heap.push(Reverse((front.metadata.pos, i)));
        }
    }

    let mut out = Vec::new();
    while let Some(Reverse((_, i))) = heap.pop() {
        let Some(rec) = cursors[i].pop_front() else {
            continue;
        };
        if let Some(front) = cursors[i].front() {
            heap.push(Reverse((front.metadata.pos, i)));
        }
        out.push(rec);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::types::LogRecMetadata;
    use chrono::Utc;

    fn rec(dev: DeviceId, gen: Gen, pos: u64, obj: &str) -> LogRecord {
        LogRecord {
            metadata: LogRecMetadata {
                id: dev,
                gen,
                rec_type: RecType::Node,
                obj_id: obj.to_string(),
                cur_vers: format!("v{dev}-{gen}"),
                parents: vec![],
                upd_time: Utc::now(),
                delete: false,
                batch_id: 0,
                batch_count: 0,
                pos,
            },
            value: None,
        }
    }

    #[test]
    fn merge_orders_by_position() {
        let a: VecDeque<_> = vec![rec(1, 1, 2, "/r/a"), rec(1, 2, 5, "/r/b")].into();
        let b: VecDeque<_> = vec![rec(2, 1, 1, "/r/c"), rec(2, 2, 3, "/r/d")].into();
        let merged = merge_by_pos(vec![a, b]);
        let positions: Vec<u64> = merged.iter().map(|r| r.metadata.pos).collect();
        assert_eq!(positions, vec![1, 2, 3, 5]);
    }

    #[test]
    fn eligibility_honors_prefix_floors() {
        let mut pgv = PrefixGenVector::new();
        pgv.insert(1, 3);
        let mut floors: HashMap<&str, &PrefixGenVector> = HashMap::new();
        floors.insert("/r", &pgv);

        assert!(!eligible(&rec(1, 3, 1, "/r/x"), &floors));
        assert!(eligible(&rec(1, 4, 2, "/r/x"), &floors));
        assert!(!eligible(&rec(1, 9, 3, "/q/x"), &floors));
    }
}
