//! Watcher: turns committed store mutations into log records.
//!
//! One cooperative task per database tails the watch log from a persisted
//! resume marker. Row mutations under a watched prefix become Node records
//! in the data space; a `Continued` chain shares one batch id and its final
//! count. Syncgroup ops and snapshot bootstraps arrive through the same log
//! and are handled in order. Malformed entries are logged and skipped,
//! never deleted.

use crate::error::{Result, SyncError};
use crate::storage::{StoreRead, WatchEvent, WatchOp};
use crate::types::DATA_SPACE;

use super::logstore::{self, RESMARK_KEY};
use super::types::{decode_cbor, encode_cbor, LogRecMetadata, LogRecord, RecType};
use super::{dag, random_nonzero_u64, Database, SyncEngine};

/// Upper bound on one watch-log read; doubled when a single application
/// batch does not fit.
const WATCH_READ_MAX: usize = 256;

fn read_resmark(read: &dyn StoreRead) -> Result<u64> {
    match read.get_meta(RESMARK_KEY) {
        Ok(raw) => decode_cbor(&raw),
        Err(SyncError::NoExist(_)) => Ok(0),
        Err(e) => Err(e),
    }
}

/// Drain the database's watch log. Returns the number of consumed entries.
pub fn process_watch_queue(engine: &SyncEngine, path: &str) -> Result<usize> {
    let db = engine.db(path)?;
    let mut consumed = 0usize;
    let mut read_max = WATCH_READ_MAX;

    loop {
        let resmark = read_resmark(db.store.as_ref())?;
        let events = db.store.read_watch_log(resmark, read_max)?;
        if events.is_empty() {
            return Ok(consumed);
        }

        let chains = complete_chains(&events);
        if chains.is_empty() {
            if events.len() < read_max {
                // Trailing partial chain with nothing after it; the rest is
                // still being committed.
                return Ok(consumed);
            }
            read_max *= 2;
            continue;
        }
        read_max = WATCH_READ_MAX;

        for chain in chains {
            process_chain(engine, &db, path, chain)?;
            consumed += chain.len();
        }
    }
}

/// Split events into complete batch chains; a trailing chain without its
/// final (`continued = false`) entry is left out.
fn complete_chains(events: &[WatchEvent]) -> Vec<&[WatchEvent]> {
    let mut chains = Vec::new();
    let mut start = 0;
    for (i, event) in events.iter().enumerate() {
        if !event.entry.continued {
            chains.push(&events[start..=i]);
            start = i + 1;
        }
    }
    chains
}

fn process_chain(engine: &SyncEngine, db: &Database, path: &str, chain: &[WatchEvent]) -> Result<()> {
    let dev = engine.device_id()?;
    let last_seq = chain.last().map(|e| e.seq).unwrap_or(0);
    let mut sg_changes: Vec<(Vec<String>, bool)> = Vec::new();

    let mut attempts = 0;
    loop {
        sg_changes.clear();
        match apply_chain(engine, db, path, chain, dev, last_seq, &mut sg_changes) {
            Ok(()) => break,
            Err(SyncError::ConcurrentTransaction) if attempts < engine.cfg().replay_retries() => {
                attempts += 1;
                tracing::debug!(db = %path, attempts, "watcher raced a sync round, retrying");
            }
            Err(e) => return Err(e),
        }
    }

    // Watch-set updates take effect for later chains only.
    for (prefixes, remove) in sg_changes {
        db.adjust_watched(&prefixes, remove);
    }
    Ok(())
}

fn apply_chain(
    engine: &SyncEngine,
    db: &Database,
    path: &str,
    chain: &[WatchEvent],
    dev: crate::types::DeviceId,
    last_seq: u64,
    sg_changes: &mut Vec<(Vec<String>, bool)>,
) -> Result<()> {
    let mut tx = db.store.begin()?;

    // Collect the row mutations this chain makes syncable.
    let mut eligible: Vec<(&str, &str, bool, chrono::DateTime<chrono::Utc>)> = Vec::new();
    for event in chain {
        match &event.entry.op {
            WatchOp::SyncgroupChange { prefixes, remove } => {
                sg_changes.push((prefixes.clone(), *remove));
            }
            WatchOp::Put { key, version }
            | WatchOp::SnapshotRow { key, version }
            | WatchOp::Delete { key, version } => {
                if key.is_empty() || version.is_empty() {
                    tracing::warn!(db = %path, seq = event.seq, "malformed watch entry, skipping");
                    continue;
                }
                if !db.is_watched(key) {
                    continue;
                }
                if dag::has_node(tx.as_mut(), key, version) {
                    // Snapshot of a row the watcher already logged.
                    continue;
                }
                let deleted = matches!(event.entry.op, WatchOp::Delete { .. });
                eligible.push((key, version, deleted, event.entry.commit_ts));
            }
        }
    }

    if eligible.is_empty() {
        tx.put_meta(RESMARK_KEY, &encode_cbor(&last_seq)?)?;
        return tx.commit();
    }

    let n = eligible.len() as u64;
    let (batch_id, batch_count) = if n > 1 {
        (random_nonzero_u64(), n)
    } else {
        (0, 0)
    };
    let (gen0, pos0) = engine.with_state(path, |s| {
        logstore::reserve_gen_and_pos(s, DATA_SPACE, n)
    })?;

    for (i, (key, version, deleted, commit_ts)) in eligible.into_iter().enumerate() {
        let parents = match dag::get_head(tx.as_mut(), key) {
            Ok(head) => vec![head],
            Err(SyncError::NoExist(_)) => vec![],
            Err(e) => return Err(e),
        };
        let rec = LogRecord {
            metadata: LogRecMetadata {
                id: dev,
                gen: gen0 + i as u64,
                rec_type: RecType::Node,
                obj_id: key.to_string(),
                cur_vers: version.to_string(),
                parents: parents.clone(),
                upd_time: commit_ts,
                delete: deleted,
                batch_id,
                batch_count,
                pos: pos0 + i as u64,
            },
            value: None,
        };
        let log_key = logstore::put_log_rec(tx.as_mut(), DATA_SPACE, &rec)?;
        dag::add_node(
            tx.as_mut(),
            key,
            version,
            &log_key,
            deleted,
            &parents,
            batch_id,
            batch_count,
            None,
        )?;
        dag::move_head(tx.as_mut(), key, version)?;
    }

    tx.put_meta(RESMARK_KEY, &encode_cbor(&last_seq)?)?;
    tx.commit()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ev(seq: u64, continued: bool) -> WatchEvent {
        WatchEvent {
            seq,
            entry: crate::storage::WatchLogEntry {
                op: WatchOp::Put {
                    key: format!("/r/{seq}"),
                    version: format!("v{seq}"),
                },
                commit_ts: chrono::Utc::now(),
                continued,
            },
        }
    }

    #[test]
    fn chains_split_on_final_entries() {
        let events = vec![ev(1, true), ev(2, false), ev(3, false), ev(4, true)];
        let chains = complete_chains(&events);
        assert_eq!(chains.len(), 2);
        assert_eq!(chains[0].len(), 2);
        assert_eq!(chains[1].len(), 1);
        // The trailing partial chain is not returned.
    }

    #[test]
    fn no_complete_chain_when_batch_is_cut() {
        let events = vec![ev(1, true), ev(2, true)];
        assert!(complete_chains(&events).is_empty());
    }
}
