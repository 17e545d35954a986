//! Log-record and sync-state persistence.
//!
//! Log records are keyed `log/<space>/<dev 16-hex>/<gen 16-hex>` so a
//! (space, device) scan is lexicographically gen-ordered. Counters live in
//! the in-memory sync state and are recomputed at open by scanning the
//! persisted records; only the remote-knowledge vectors are persisted, as a
//! single `ss/` record.

use crate::error::{Result, SyncError};
use crate::storage::{Store, StoreRead, StoreTx};
use crate::types::{DeviceId, Gen, Pos};

use super::types::{decode_cbor, encode_cbor, DbSyncState, LogRecord, PersistedSyncState};

/// Key of the single persisted sync-state record.
pub const SYNC_STATE_KEY: &str = "ss/state";

/// Key of the watcher's resume marker.
pub const RESMARK_KEY: &str = "ss/resmark";

/// Key of the persisted device id.
pub const DEV_ID_KEY: &str = "ss/dev";

const LOG_PREFIX: &str = "log/";

// ============================================================================
// Keys
// ============================================================================

pub fn log_rec_key(space: &str, dev: DeviceId, gen: Gen) -> String {
    format!("log/{space}/{dev:016x}/{gen:016x}")
}

pub fn log_dev_prefix(space: &str, dev: DeviceId) -> String {
    format!("log/{space}/{dev:016x}/")
}

/// Recover (space, dev, gen) from a log-record key.
pub fn parse_log_rec_key(key: &str) -> Result<(String, DeviceId, Gen)> {
    let bad = || SyncError::Corrupt(format!("malformed log key: {key}"));
    let rest = key.strip_prefix(LOG_PREFIX).ok_or_else(bad)?;
    // The space itself may contain no '/', so split from the right.
    let (rest, gen_hex) = rest.rsplit_once('/').ok_or_else(bad)?;
    let (space, dev_hex) = rest.rsplit_once('/').ok_or_else(bad)?;
    let dev = DeviceId::from_str_radix(dev_hex, 16).map_err(|_| bad())?;
    let gen = Gen::from_str_radix(gen_hex, 16).map_err(|_| bad())?;
    Ok((space.to_string(), dev, gen))
}

// ============================================================================
// Counter reservation
// ============================================================================

/// Reserve `n` generations in `space` and `n` database-wide positions,
/// atomically under the engine's sync-state lock. Returns the first
/// reserved (gen, pos).
pub fn reserve_gen_and_pos(state: &mut DbSyncState, space: &str, n: u64) -> (Gen, Pos) {
    let pos = state.pos;
    state.pos += n;
    let c = state.counters_mut(space);
    let gen = c.gen;
    c.gen += n;
    (gen, pos)
}

/// Reserve `n` positions only, for records authored by remote devices.
pub fn reserve_pos(state: &mut DbSyncState, n: u64) -> Pos {
    let pos = state.pos;
    state.pos += n;
    pos
}

/// Freeze the responder's view of local knowledge: everything assigned so
/// far is durable, nothing newer leaves this device until the next round.
pub fn checkpoint_local_gen(state: &mut DbSyncState, space: &str) -> Gen {
    let c = state.counters_mut(space);
    c.checkpt_gen = c.gen - 1;
    c.checkpt_gen
}

// ============================================================================
// Log records
// ============================================================================

/// Write a log record inside the caller's transaction. Returns the log key.
pub fn put_log_rec(tx: &mut dyn StoreTx, space: &str, rec: &LogRecord) -> Result<String> {
    let key = log_rec_key(space, rec.metadata.id, rec.metadata.gen);
    tx.put_meta(&key, &encode_cbor(rec)?)?;
    Ok(key)
}

pub fn get_log_rec(
    read: &dyn StoreRead,
    space: &str,
    dev: DeviceId,
    gen: Gen,
) -> Result<LogRecord> {
    decode_cbor(&read.get_meta(&log_rec_key(space, dev, gen))?)
}

pub fn get_log_rec_tx(
    tx: &mut dyn StoreTx,
    space: &str,
    dev: DeviceId,
    gen: Gen,
) -> Result<LogRecord> {
    decode_cbor(&tx.get_meta(&log_rec_key(space, dev, gen))?)
}

pub fn has_log_rec(tx: &mut dyn StoreTx, space: &str, dev: DeviceId, gen: Gen) -> bool {
    tx.get_meta(&log_rec_key(space, dev, gen)).is_ok()
}

pub fn del_log_rec(tx: &mut dyn StoreTx, space: &str, dev: DeviceId, gen: Gen) -> Result<()> {
    tx.delete_meta(&log_rec_key(space, dev, gen))
}

/// Read a device's records with `from_gen <= gen <= to_gen`, gen-ordered.
pub fn scan_log_recs(
    read: &dyn StoreRead,
    space: &str,
    dev: DeviceId,
    from_gen: Gen,
    to_gen: Gen,
) -> Result<Vec<LogRecord>> {
    let mut out = Vec::new();
    for (key, raw) in read.scan_meta_prefix(&log_dev_prefix(space, dev))? {
        let (_, _, gen) = parse_log_rec_key(&key)?;
        if gen < from_gen {
            continue;
        }
        if gen > to_gen {
            break;
        }
        out.push(decode_cbor(&raw)?);
    }
    Ok(out)
}

// ============================================================================
// Sync state
// ============================================================================

pub fn save_sync_state(tx: &mut dyn StoreTx, state: &PersistedSyncState) -> Result<()> {
    tx.put_meta(SYNC_STATE_KEY, &encode_cbor(state)?)
}

pub fn load_sync_state(read: &dyn StoreRead) -> Result<PersistedSyncState> {
    match read.get_meta(SYNC_STATE_KEY) {
        Ok(raw) => decode_cbor(&raw),
        Err(SyncError::NoExist(_)) => Ok(PersistedSyncState::default()),
        Err(e) => Err(e),
    }
}

/// Read the stable device id, generating and persisting one at first start.
pub fn ensure_device_id(store: &dyn Store) -> Result<DeviceId> {
    match store.get_meta(DEV_ID_KEY) {
        Ok(raw) => decode_cbor(&raw),
        Err(SyncError::NoExist(_)) => {
            let mut bytes = [0u8; 8];
            getrandom::getrandom(&mut bytes)
                .map_err(|e| SyncError::Store(format!("rng: {e}")))?;
            let dev = DeviceId::from_le_bytes(bytes);
            let mut tx = store.begin()?;
            tx.put_meta(DEV_ID_KEY, &encode_cbor(&dev)?)?;
            tx.commit()?;
            Ok(dev)
        }
        Err(e) => Err(e),
    }
}

/// Rebuild the in-memory sync state at open: vectors from the persisted
/// record, counters by scanning the log. The next local gen in each space
/// follows this device's highest persisted gen; the next pos follows the
/// highest pos observed in any record of the database.
pub fn open_db_state(store: &dyn Store, dev: DeviceId) -> Result<DbSyncState> {
    let persisted = load_sync_state(store)?;
    let mut state = DbSyncState {
        genvec: persisted.genvec,
        sggenvec: persisted.sggenvec,
        ..Default::default()
    };

    for (key, raw) in store.scan_meta_prefix(LOG_PREFIX)? {
        let (space, rec_dev, gen) = parse_log_rec_key(&key)?;
        let rec: LogRecord = decode_cbor(&raw)?;
        if rec.metadata.pos >= state.pos {
            state.pos = rec.metadata.pos + 1;
        }
        let c = state.counters_mut(&space);
        if rec_dev == dev && gen >= c.gen {
            c.gen = gen + 1;
        }
    }

    // Everything already assigned is durable, so it is all checkpointed.
    for c in std::iter::once(&mut state.data).chain(state.sgs.values_mut()) {
        c.checkpt_gen = c.gen - 1;
    }
    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemStore;
    use crate::sync::types::{LogRecMetadata, RecType};
    use crate::types::DATA_SPACE;
    use chrono::Utc;

    fn rec(dev: DeviceId, gen: Gen, pos: Pos) -> LogRecord {
        LogRecord {
            metadata: LogRecMetadata {
                id: dev,
                gen,
                rec_type: RecType::Node,
                obj_id: "/r/x".to_string(),
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
    fn log_key_round_trip_and_order() {
        let k1 = log_rec_key("data", 3, 9);
        let k2 = log_rec_key("data", 3, 10);
        let k3 = log_rec_key("data", 3, 255);
        assert!(k1 < k2 && k2 < k3);
        assert_eq!(parse_log_rec_key(&k3).unwrap(), ("data".to_string(), 3, 255));

        let sg = log_rec_key("sg:00000000000000aa", 1, 2);
        let (space, dev, gen) = parse_log_rec_key(&sg).unwrap();
        assert_eq!((space.as_str(), dev, gen), ("sg:00000000000000aa", 1, 2));
    }

    #[test]
    fn reserve_advances_both_counters() {
        let mut state = DbSyncState::default();
        assert_eq!(reserve_gen_and_pos(&mut state, DATA_SPACE, 3), (1, 1));
        assert_eq!(reserve_gen_and_pos(&mut state, DATA_SPACE, 1), (4, 4));
        assert_eq!(reserve_pos(&mut state, 2), 5);
        assert_eq!(state.data.gen, 5);
        assert_eq!(state.pos, 7);
        // A syncgroup space shares the database position sequence.
        assert_eq!(reserve_gen_and_pos(&mut state, "sg:0000000000000001", 1), (1, 7));
    }

    #[test]
    fn checkpoint_freezes_last_assigned_gen() {
        let mut state = DbSyncState::default();
        reserve_gen_and_pos(&mut state, DATA_SPACE, 4);
        assert_eq!(checkpoint_local_gen(&mut state, DATA_SPACE), 4);
    }

    #[test]
    fn open_recomputes_counters_from_log() {
        let store = MemStore::new();
        let mut tx = store.begin().unwrap();
        put_log_rec(tx.as_mut(), DATA_SPACE, &rec(1, 1, 1)).unwrap();
        put_log_rec(tx.as_mut(), DATA_SPACE, &rec(1, 2, 2)).unwrap();
        put_log_rec(tx.as_mut(), DATA_SPACE, &rec(9, 5, 3)).unwrap();
        tx.commit().unwrap();

        let state = open_db_state(&store, 1).unwrap();
        // Own gens resume after 2; remote gens only influence pos.
        assert_eq!(state.data.gen, 3);
        assert_eq!(state.pos, 4);
        assert_eq!(state.data.checkpt_gen, 2);

        let fresh = open_db_state(&MemStore::new(), 1).unwrap();
        assert_eq!(fresh.data.gen, 1);
        assert_eq!(fresh.pos, 1);
        assert_eq!(fresh.data.checkpt_gen, 0);
    }

    #[test]
    fn scan_respects_gen_range() {
        let store = MemStore::new();
        let mut tx = store.begin().unwrap();
        for g in 1..=5 {
            put_log_rec(tx.as_mut(), DATA_SPACE, &rec(2, g, g)).unwrap();
        }
        tx.commit().unwrap();

        let recs = scan_log_recs(&store, DATA_SPACE, 2, 2, 4).unwrap();
        assert_eq!(
            recs.iter().map(|r| r.metadata.gen).collect::<Vec<_>>(),
            vec![2, 3, 4]
        );
    }

    #[test]
    fn device_id_is_stable() {
        let store = MemStore::new();
        let d1 = ensure_device_id(&store).unwrap();
        let d2 = ensure_device_id(&store).unwrap();
        assert_eq!(d1, d2);
    }
}
