//! The sync engine: per-process handle tying together the log store, DAG,
//! syncgroup registry, watcher, initiator, responder, and membership view.
//!
//! All in-memory sync state sits behind one per-process lock, held only for
//! map access and never across I/O. A separate async lock (`th_lock`)
//! serializes generation checkpointing with anything else that could expose
//! new local generations while an initiator round is in flight.

pub mod dag;
pub mod initiator;
pub mod logstore;
pub mod membership;
pub mod publisher;
pub mod resolver;
pub mod responder;
pub mod scheduler;
pub mod syncgroup;
pub mod types;
pub mod watcher;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;

use crate::discovery::{service_uuid, Advertisement, Neighborhood, ATTR_DATABASES, ATTR_PEER};
use crate::error::{Result, SyncError};
use crate::rpc::{DeltaReq, DeltaResp, PeerTransport};
use crate::storage::Store;
use crate::types::{
    join_app_db, prefix_covers, AccessChecker, AccessTag, Clock, DbId, DeviceId,
    PatternAccessChecker, SystemClock, DATA_PREFIX, PERMS_PREFIX,
};

use membership::{MemberView, MembershipView, DEFAULT_MEMBER_VIEW_TTL};
use resolver::{ConflictResolver, ResolverRegistry};
use types::{
    DbSyncState, GenVector, MemberInfo, PrefixGenVector, SgLocalState, Syncgroup, SyncgroupSpec,
    SyncgroupStatus,
};

pub use scheduler::SyncScheduler;

// ============================================================================
// Options
// ============================================================================

/// Configuration for a `SyncEngine`.
pub struct SyncEngineOptions {
    /// This peer's name, also used as its blessing in permission checks.
    pub name: String,
    pub transport: Arc<dyn PeerTransport>,
    pub access_checker: Arc<dyn AccessChecker>,
    pub clock: Arc<dyn Clock>,
    /// Rendezvous points this process can be dialed through.
    pub mount_tables: Vec<String>,
    pub member_view_ttl: Duration,
    /// Cadence of the per-database initiator driver.
    pub sync_interval: Duration,
    /// Cadence of the per-database watcher.
    pub watch_interval: Duration,
    pub publish_retry_interval: Duration,
    pub neighborhood_gc_interval: Duration,
    /// Bounded retries of a replay round on `ConcurrentTransaction`.
    pub replay_retries: usize,
    pub replay_backoff: Duration,
    /// Per-address dial deadline.
    pub dial_timeout: Duration,
}

impl SyncEngineOptions {
    pub fn new(name: impl Into<String>, transport: Arc<dyn PeerTransport>) -> Self {
        Self {
            name: name.into(),
            transport,
            access_checker: Arc::new(PatternAccessChecker),
            clock: Arc::new(SystemClock),
            mount_tables: Vec::new(),
            member_view_ttl: DEFAULT_MEMBER_VIEW_TTL,
            sync_interval: Duration::from_millis(500),
            watch_interval: Duration::from_millis(50),
            publish_retry_interval: Duration::from_millis(500),
            neighborhood_gc_interval: Duration::from_secs(5),
            replay_retries: 4,
            replay_backoff: Duration::from_millis(50),
            dial_timeout: Duration::from_secs(5),
        }
    }
}

// ============================================================================
// Database handle
// ============================================================================

/// One attached database: its store plus unsynced runtime state.
pub struct Database {
    pub id: DbId,
    /// Flat `app:db` path.
    pub path: String,
    pub store: Arc<dyn Store>,
    /// Watched prefix → refcount across covering syncgroups.
    watched: Mutex<HashMap<String, i64>>,
    /// Per-peer mount-table order; the last successful table moves to the
    /// front.
    peer_tables: Mutex<HashMap<String, Vec<String>>>,
    rr_index: Mutex<usize>,
}

impl Database {
    pub(crate) fn is_watched(&self, key: &str) -> bool {
        self.watched
            .lock()
            .keys()
            .any(|prefix| prefix_covers(prefix, key))
    }

    pub(crate) fn adjust_watched(&self, prefixes: &[String], remove: bool) {
        let mut watched = self.watched.lock();
        for prefix in prefixes {
            if remove {
                if let Some(count) = watched.get_mut(prefix) {
                    *count -= 1;
                    if *count <= 0 {
                        watched.remove(prefix);
                    }
                }
            } else {
                *watched.entry(prefix.clone()).or_insert(0) += 1;
            }
        }
    }

    pub(crate) fn table_order(&self, peer: &str, default: &[String]) -> Vec<String> {
        let tables = self.peer_tables.lock();
        match tables.get(peer) {
            Some(order) if !order.is_empty() => order.clone(),
            _ => default.to_vec(),
        }
    }

    /// Remember the mount table that worked, trying it first next time.
    pub(crate) fn promote_table(&self, peer: &str, table: &str, order: &[String]) {
        let mut tables = self.peer_tables.lock();
        let mut new_order: Vec<String> = order.to_vec();
        new_order.retain(|t| t != table);
        new_order.insert(0, table.to_string());
        tables.insert(peer.to_string(), new_order);
    }
}

// ============================================================================
// Engine
// ============================================================================

struct EngineInner {
    name: String,
    transport: Arc<dyn PeerTransport>,
    checker: Arc<dyn AccessChecker>,
    clock: Arc<dyn Clock>,
    mount_tables: Vec<String>,
    resolvers: ResolverRegistry,
    membership: MembershipView,
    neighborhood: Neighborhood,
    dbs: RwLock<HashMap<String, Arc<Database>>>,
    /// The per-process sync-state lock.
    state: Mutex<HashMap<String, DbSyncState>>,
    dev_id: Mutex<Option<DeviceId>>,
    /// Serializes checkpointing with outbound replies (one round in flight).
    th_lock: tokio::sync::Mutex<()>,
    cfg: EngineConfig,
}

struct EngineConfig {
    sync_interval: Duration,
    watch_interval: Duration,
    publish_retry_interval: Duration,
    neighborhood_gc_interval: Duration,
    replay_retries: usize,
    replay_backoff: Duration,
    dial_timeout: Duration,
}

/// Cloneable handle to the per-process sync engine.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

impl SyncEngine {
    pub fn new(opts: SyncEngineOptions) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                name: opts.name,
                transport: opts.transport,
                checker: opts.access_checker,
                clock: opts.clock,
                mount_tables: opts.mount_tables,
                resolvers: ResolverRegistry::new(),
                membership: MembershipView::new(opts.member_view_ttl),
                neighborhood: Neighborhood::default(),
                dbs: RwLock::new(HashMap::new()),
                state: Mutex::new(HashMap::new()),
                dev_id: Mutex::new(None),
                th_lock: tokio::sync::Mutex::new(()),
                cfg: EngineConfig {
                    sync_interval: opts.sync_interval,
                    watch_interval: opts.watch_interval,
                    publish_retry_interval: opts.publish_retry_interval,
                    neighborhood_gc_interval: opts.neighborhood_gc_interval,
                    replay_retries: opts.replay_retries,
                    replay_backoff: opts.replay_backoff,
                    dial_timeout: opts.dial_timeout,
                },
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Stable device id; available once a database is attached.
    pub fn device_id(&self) -> Result<DeviceId> {
        self.inner
            .dev_id
            .lock()
            .ok_or_else(|| SyncError::DbOffline("no database attached".to_string()))
    }

    pub(crate) fn transport(&self) -> Arc<dyn PeerTransport> {
        Arc::clone(&self.inner.transport)
    }

    pub(crate) fn checker(&self) -> &dyn AccessChecker {
        self.inner.checker.as_ref()
    }

    pub(crate) fn resolvers(&self) -> &ResolverRegistry {
        &self.inner.resolvers
    }

    pub fn neighborhood(&self) -> &Neighborhood {
        &self.inner.neighborhood
    }

    pub(crate) fn cfg(&self) -> ConfigView<'_> {
        ConfigView {
            cfg: &self.inner.cfg,
        }
    }

    pub fn register_resolver(&self, prefix: impl Into<String>, resolver: Arc<dyn ConflictResolver>) {
        self.inner.resolvers.register(prefix, resolver);
    }

    /// Current time from the configured clock; a failing networked clock is
    /// non-fatal and falls back to the local one.
    pub(crate) fn now(&self) -> DateTime<Utc> {
        match self.inner.clock.now() {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!(error = %e, "clock failed, using local time");
                Utc::now()
            }
        }
    }

    // ------------------------------------------------------------------
    // Databases
    // ------------------------------------------------------------------

    /// Attach a database. Recomputes in-memory counters from the persisted
    /// log and rebuilds the watched-prefix set from the syncgroup registry.
    pub fn attach_database(&self, id: DbId, store: Arc<dyn Store>) -> Result<()> {
        let path = join_app_db(&id.app, &id.name)?;
        if self.inner.dbs.read().contains_key(&path) {
            return Err(SyncError::Exist(format!("database {path}")));
        }

        let dev = {
            let mut dev_id = self.inner.dev_id.lock();
            match *dev_id {
                Some(dev) => {
                    // Later stores must agree with the process device id.
                    let stored = logstore::ensure_device_id(store.as_ref())?;
                    if stored != dev {
                        return Err(SyncError::Corrupt(format!(
                            "database {path} belongs to device {stored:x}, process is {dev:x}"
                        )));
                    }
                    dev
                }
                None => {
                    let dev = logstore::ensure_device_id(store.as_ref())?;
                    *dev_id = Some(dev);
                    dev
                }
            }
        };

        let state = logstore::open_db_state(store.as_ref(), dev)?;
        let db = Arc::new(Database {
            id,
            path: path.clone(),
            store,
            watched: Mutex::new(HashMap::new()),
            peer_tables: Mutex::new(HashMap::new()),
            rr_index: Mutex::new(0),
        });

        // Rebuild watched prefixes from the registry.
        for gid in syncgroup::list_group_ids(db.store.as_ref())? {
            let mut tx = db.store.begin()?;
            let local = syncgroup::get_local_state(tx.as_mut(), gid)?;
            if local.watched {
                if let Ok((sg, _)) = syncgroup::get_current(tx.as_mut(), gid) {
                    db.adjust_watched(&sg.spec.prefixes, false);
                }
            }
            tx.abort();
        }

        self.inner.state.lock().insert(path.clone(), state);
        self.inner.dbs.write().insert(path, db);
        Ok(())
    }

    pub fn databases(&self) -> Vec<Arc<Database>> {
        self.inner.dbs.read().values().cloned().collect()
    }

    pub(crate) fn db(&self, path: &str) -> Result<Arc<Database>> {
        self.inner
            .dbs
            .read()
            .get(path)
            .cloned()
            .ok_or_else(|| SyncError::NoExist(format!("database {path}")))
    }

    /// Run `f` under the per-process sync-state lock.
    pub(crate) fn with_state<R>(
        &self,
        path: &str,
        f: impl FnOnce(&mut DbSyncState) -> R,
    ) -> Result<R> {
        let mut state = self.inner.state.lock();
        let db_state = state
            .get_mut(path)
            .ok_or_else(|| SyncError::NoExist(format!("database {path}")))?;
        Ok(f(db_state))
    }

    pub(crate) async fn round_guard(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.inner.th_lock.lock().await
    }

    /// Checkpoint the given spaces unless an initiator round is in flight.
    /// A responder serving while no round runs may freeze fresh knowledge;
    /// while a round runs it must keep serving the round's checkpoint.
    pub(crate) fn try_checkpoint(&self, path: &str, spaces: &[String]) {
        if let Ok(_guard) = self.inner.th_lock.try_lock() {
            let _ = self.with_state(path, |s| {
                for space in spaces {
                    logstore::checkpoint_local_gen(s, space);
                }
            });
        }
    }

    // ------------------------------------------------------------------
    // Syncgroup admission
    // ------------------------------------------------------------------

    /// Create a syncgroup. If its name designates another peer as admin the
    /// group starts PublishPending and the publisher task hands it over;
    /// otherwise it is Running immediately.
    pub fn create_syncgroup(
        &self,
        db_id: &DbId,
        name: &str,
        spec: SyncgroupSpec,
        my_info: MemberInfo,
    ) -> Result<crate::types::GroupId> {
        validate_spec(&spec)?;
        let path = join_app_db(&db_id.app, &db_id.name)?;
        let db = self.db(&path)?;
        let dev = self.device_id()?;

        let gid = syncgroup::new_group_id()?;
        let status = match admin_of(name) {
            Some(admin) if admin != self.name() => SyncgroupStatus::PublishPending,
            _ => SyncgroupStatus::Running,
        };

        let mut tx = db.store.begin()?;
        if tx.get_meta(&syncgroup::name_key(name)).is_ok() {
            return Err(SyncError::Exist(format!("syncgroup {name}")));
        }

        let mut sg = Syncgroup {
            id: gid,
            name: name.to_string(),
            spec_version: String::new(),
            spec,
            creator: self.name().to_string(),
            app_name: db_id.app.clone(),
            db_name: db_id.name.clone(),
            status,
            joiners: BTreeMap::from([(self.name().to_string(), my_info)]),
        };

        let (gen, pos) = self.with_state(&path, |s| {
            logstore::reserve_gen_and_pos(s, &crate::types::sg_space(gid), 1)
        })?;
        syncgroup::update_versioning(
            tx.as_mut(),
            &mut sg,
            syncgroup::SgWrite::Logged { dev, gen, pos },
            self.now(),
        )?;
        syncgroup::put_name_index(tx.as_mut(), name, gid)?;
        syncgroup::set_local_state(
            tx.as_mut(),
            gid,
            &SgLocalState {
                num_local_joiners: 1,
                watched: true,
                ..Default::default()
            },
        )?;

        // Start watching and bootstrap pre-existing rows.
        tx.append_syncgroup_op(&sg.spec.prefixes, false)?;
        for prefix in &sg.spec.prefixes {
            tx.append_snapshot(prefix)?;
        }
        tx.commit()?;

        self.inner.membership.invalidate();
        Ok(gid)
    }

    /// Join a syncgroup by name. A repeat local join only bumps the local
    /// joiner count; the first join fetches the group from its admin and
    /// bootstraps the prefixes.
    pub async fn join_syncgroup(
        &self,
        db_id: &DbId,
        name: &str,
        my_info: MemberInfo,
    ) -> Result<Syncgroup> {
        let path = join_app_db(&db_id.app, &db_id.name)?;
        let db = self.db(&path)?;

        // Idempotent local rejoin.
        {
            let mut tx = db.store.begin()?;
            if let Ok(gid) = syncgroup::get_id_by_name(tx.as_mut(), name) {
                let mut local = syncgroup::get_local_state(tx.as_mut(), gid)?;
                local.num_local_joiners += 1;
                syncgroup::set_local_state(tx.as_mut(), gid, &local)?;
                let (sg, _) = syncgroup::get_current(tx.as_mut(), gid)?;
                tx.commit()?;
                return Ok(sg);
            }
            tx.abort();
        }

        let admin = admin_of(name)
            .ok_or_else(|| SyncError::BadQuery(format!("syncgroup name has no admin: {name}")))?;
        if admin == self.name() {
            return Err(SyncError::NoExist(format!("syncgroup {name}")));
        }

        let addrs = self.dial_addresses(&db, admin, &[]);
        if addrs.is_empty() {
            return Err(SyncError::ConnFail(format!("no route to admin {admin}")));
        }
        let mut last_err = SyncError::ConnFail(admin.to_string());
        for addr in addrs {
            match self
                .transport()
                .join_syncgroup_at_admin(&addr, self.name(), db_id, name, my_info.clone())
                .await
            {
                Ok((sg, version, genvec)) => {
                    return self.finish_join(&db, &path, sg, version, genvec);
                }
                Err(e @ (SyncError::ConnFail(_) | SyncError::DbOffline(_))) => last_err = e,
                Err(e) => return Err(e),
            }
        }
        Err(last_err)
    }

    fn finish_join(
        &self,
        db: &Arc<Database>,
        path: &str,
        mut sg: Syncgroup,
        version: String,
        genvec: GenVector,
    ) -> Result<Syncgroup> {
        let oid = crate::types::sg_oid(sg.id);
        let pending: PrefixGenVector = genvec.get(&oid).cloned().unwrap_or_default();

        let mut tx = db.store.begin()?;
        syncgroup::update_versioning(
            tx.as_mut(),
            &mut sg,
            syncgroup::SgWrite::Seed { version },
            self.now(),
        )?;
        syncgroup::put_name_index(tx.as_mut(), &sg.name, sg.id)?;
        syncgroup::set_local_state(
            tx.as_mut(),
            sg.id,
            &SgLocalState {
                num_local_joiners: 1,
                watched: true,
                sync_pending: true,
                pending_genvec: pending,
                ..Default::default()
            },
        )?;
        tx.append_syncgroup_op(&sg.spec.prefixes, false)?;
        for prefix in &sg.spec.prefixes {
            tx.append_snapshot(prefix)?;
        }
        tx.commit()?;

        // Make sure the group's space has counters from now on; the watcher
        // picks up the watch change from the log.
        self.with_state(path, |s| {
            s.counters_mut(&crate::types::sg_space(sg.id));
        })?;
        self.inner.membership.invalidate();
        Ok(sg)
    }

    /// Destroy a syncgroup locally: cascade-delete its data versions, DAG,
    /// log records, and indexes, and stop watching its prefixes. `NoExist`
    /// makes repeated destroys idempotent for the caller.
    pub fn destroy_syncgroup(&self, db_id: &DbId, name: &str) -> Result<()> {
        let path = join_app_db(&db_id.app, &db_id.name)?;
        let db = self.db(&path)?;

        let mut tx = db.store.begin()?;
        let gid = syncgroup::get_id_by_name(tx.as_mut(), name)?;
        let (sg, _) = syncgroup::get_current(tx.as_mut(), gid)?;
        syncgroup::delete_syncgroup(tx.as_mut(), name, gid)?;
        tx.append_syncgroup_op(&sg.spec.prefixes, true)?;
        tx.commit()?;

        self.with_state(&path, |s| {
            s.sgs.remove(&crate::types::sg_space(gid));
            s.sggenvec.remove(&crate::types::sg_oid(gid));
        })?;
        self.inner.membership.invalidate();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Server-side RPC handlers
    // ------------------------------------------------------------------

    /// Serve one `GetDeltas` call; the responder streams into `tx`.
    pub async fn handle_get_deltas(
        &self,
        caller: &str,
        req: DeltaReq,
        tx: mpsc::Sender<DeltaResp>,
    ) -> Result<()> {
        responder::serve_deltas(self, caller, req, tx).await
    }

    /// Accept a syncgroup published to this peer. Returns this peer's name.
    pub async fn handle_publish_syncgroup(
        &self,
        publisher: &str,
        sg: Syncgroup,
        version: String,
        genvec: GenVector,
    ) -> Result<String> {
        let path = join_app_db(&sg.app_name, &sg.db_name)?;
        let db = self.db(&path)?;

        {
            let mut tx = db.store.begin()?;
            match syncgroup::get_id_by_name(tx.as_mut(), &sg.name) {
                Ok(gid) if gid == sg.id => {
                    return Err(SyncError::DupSyncgroupPublish(sg.name.clone()))
                }
                Ok(_) => return Err(SyncError::Exist(sg.name.clone())),
                Err(SyncError::NoExist(_)) => {}
                Err(e) => return Err(e),
            }
            tx.abort();
        }

        tracing::info!(sg = %sg.name, from = %publisher, "accepting published syncgroup");
        let oid = crate::types::sg_oid(sg.id);
        let pending: PrefixGenVector = genvec.get(&oid).cloned().unwrap_or_default();
        let gid = sg.id;
        let mut sg = sg;

        let mut tx = db.store.begin()?;
        syncgroup::update_versioning(
            tx.as_mut(),
            &mut sg,
            syncgroup::SgWrite::Seed { version },
            self.now(),
        )?;
        syncgroup::put_name_index(tx.as_mut(), &sg.name, gid)?;
        syncgroup::set_local_state(
            tx.as_mut(),
            gid,
            &SgLocalState {
                watched: true,
                sync_pending: true,
                pending_genvec: pending,
                remote_publisher: true,
                ..Default::default()
            },
        )?;
        tx.append_syncgroup_op(&sg.spec.prefixes, false)?;
        for prefix in &sg.spec.prefixes {
            tx.append_snapshot(prefix)?;
        }
        tx.commit()?;

        self.with_state(&path, |s| {
            s.counters_mut(&crate::types::sg_space(gid));
        })?;
        self.inner.membership.invalidate();
        Ok(self.name().to_string())
    }

    /// Admit a joiner: authorize, add it to the joiner list through the
    /// versioned write path, and return the group with this database's
    /// syncgroup-space knowledge.
    pub async fn handle_join_syncgroup_at_admin(
        &self,
        joiner: &str,
        db_id: &DbId,
        sg_name: &str,
        info: MemberInfo,
    ) -> Result<(Syncgroup, String, GenVector)> {
        let path = join_app_db(&db_id.app, &db_id.name)?;
        let db = self.db(&path)?;
        let dev = self.device_id()?;

        let mut tx = db.store.begin()?;
        let gid = syncgroup::get_id_by_name(tx.as_mut(), sg_name)?;
        let (mut sg, head) = syncgroup::get_current(tx.as_mut(), gid)?;

        let blessings = [joiner.to_string()];
        if !self
            .checker()
            .allowed(&sg.spec.perms, AccessTag::Read, &blessings)
        {
            return Err(SyncError::NoAccess(format!(
                "{joiner} may not join {sg_name}"
            )));
        }

        let version = if sg.joiners.contains_key(joiner) {
            // Remote rejoin: answer with current state, no new version.
            tx.abort();
            head
        } else {
            sg.joiners.insert(joiner.to_string(), info);
            let (gen, pos) = self.with_state(&path, |s| {
                logstore::reserve_gen_and_pos(s, &crate::types::sg_space(gid), 1)
            })?;
            let version = syncgroup::update_versioning(
                tx.as_mut(),
                &mut sg,
                syncgroup::SgWrite::Logged { dev, gen, pos },
                self.now(),
            )?;
            tx.commit()?;
            self.inner.membership.invalidate();
            version
        };

        let knowledge = self.sg_knowledge(&path, gid)?;
        let oid = crate::types::sg_oid(gid);
        Ok((sg, version, GenVector::from([(oid, knowledge)])))
    }

    /// This database's full knowledge of one syncgroup's space: the stored
    /// remote vector plus everything this device has assigned.
    pub(crate) fn sg_knowledge(&self, path: &str, gid: crate::types::GroupId) -> Result<PrefixGenVector> {
        let dev = self.device_id()?;
        self.with_state(path, |s| {
            let space = crate::types::sg_space(gid);
            let mut pgv = s
                .sggenvec
                .get(&crate::types::sg_oid(gid))
                .cloned()
                .unwrap_or_default();
            let known = s.counters_mut(&space).known_gen();
            if known > 0 {
                pgv.insert(dev, known);
            }
            pgv
        })
    }

    // ------------------------------------------------------------------
    // Driver entry points
    // ------------------------------------------------------------------

    /// Drain the database's watch log into log records. Returns how many
    /// entries were consumed.
    pub fn process_watch_queue(&self, path: &str) -> Result<usize> {
        watcher::process_watch_queue(self, path)
    }

    /// Run one initiator round (syncgroup metadata, then data) against
    /// `peer`.
    pub async fn sync_once(&self, path: &str, peer: &str) -> Result<()> {
        initiator::sync_once(self, path, peer).await
    }

    /// Push pending syncgroup publishes for one database.
    pub async fn publish_pending(&self, path: &str) -> Result<()> {
        publisher::publish_pending(self, path).await
    }

    // ------------------------------------------------------------------
    // Peers
    // ------------------------------------------------------------------

    /// Aggregate syncgroup membership across all databases, TTL-cached.
    pub fn member_views(&self) -> HashMap<String, MemberView> {
        let dbs = self.databases();
        self.inner.membership.get(|| build_member_views(&dbs))
    }

    /// Peer names with membership counts.
    pub fn members(&self) -> HashMap<String, usize> {
        let dbs = self.databases();
        self.inner.membership.members(|| build_member_views(&dbs))
    }

    /// Deep copy of one peer's aggregate view.
    pub fn member_view(&self, peer: &str) -> Option<MemberView> {
        let dbs = self.databases();
        self.inner.membership.copy(peer, || build_member_views(&dbs))
    }

    /// Pick the next peer to sync `db` with: members sharing at least one
    /// syncgroup in this database, round-robin with a small random
    /// tie-break.
    pub(crate) fn select_peer(&self, db: &Database) -> Option<String> {
        let views = self.member_views();
        let mut candidates: Vec<String> = views
            .iter()
            .filter(|(peer, view)| {
                peer.as_str() != self.name() && view.databases.contains_key(&db.path)
            })
            .map(|(peer, _)| peer.clone())
            .collect();
        if candidates.is_empty() {
            return None;
        }
        candidates.sort();

        let mut rr = db.rr_index.lock();
        let jitter = (random_u64() as usize) % candidates.len().min(2);
        let idx = (*rr + jitter) % candidates.len();
        *rr = (*rr + 1) % candidates.len();
        Some(candidates[idx].clone())
    }

    pub(crate) fn membership_changed(&self) {
        self.inner.membership.invalidate();
    }

    /// Mount tables to try for `peer`, in per-peer learned order (the last
    /// successful table first), falling back to syncgroup tables, this
    /// process's tables, then tables advertised by the peer's groups.
    pub(crate) fn dial_tables(
        &self,
        db: &Database,
        peer: &str,
        sg_tables: &[String],
    ) -> Vec<String> {
        let mut default: Vec<String> = Vec::new();
        for table in sg_tables.iter().chain(self.inner.mount_tables.iter()) {
            if !default.contains(table) {
                default.push(table.clone());
            }
        }
        if let Some(view) = self.member_view(peer) {
            for table in view.mount_tables {
                if !default.contains(&table) {
                    default.push(table);
                }
            }
        }
        db.table_order(peer, &default)
    }

    /// Ordered dial addresses for `peer`: one per mount table, then any
    /// neighborhood addresses.
    pub(crate) fn dial_addresses(
        &self,
        db: &Database,
        peer: &str,
        sg_tables: &[String],
    ) -> Vec<String> {
        let mut addrs: Vec<String> = self
            .dial_tables(db, peer, sg_tables)
            .iter()
            .map(|table| format!("{table}/{peer}"))
            .collect();
        for addr in self.inner.neighborhood.addresses_of(peer) {
            if !addrs.contains(&addr) {
                addrs.push(addr);
            }
        }
        addrs
    }

    /// The advertisement this process publishes to the neighborhood.
    pub fn advertisement(&self) -> Result<Advertisement> {
        let dbs: Vec<String> = self.databases().iter().map(|db| db.path.clone()).collect();
        let addresses: Vec<String> = self
            .inner
            .mount_tables
            .iter()
            .map(|table| format!("{table}/{}", self.name()))
            .collect();
        Advertisement::new(
            service_uuid(crate::discovery::SYNC_INTERFACE_NAME),
            BTreeMap::from([
                (ATTR_PEER.to_string(), self.name().to_string()),
                (ATTR_DATABASES.to_string(), dbs.join(",")),
            ]),
            addresses,
        )
    }
}

pub(crate) struct ConfigView<'a> {
    cfg: &'a EngineConfig,
}

impl ConfigView<'_> {
    pub fn sync_interval(&self) -> Duration {
        self.cfg.sync_interval
    }
    pub fn watch_interval(&self) -> Duration {
        self.cfg.watch_interval
    }
    pub fn publish_retry_interval(&self) -> Duration {
        self.cfg.publish_retry_interval
    }
    pub fn neighborhood_gc_interval(&self) -> Duration {
        self.cfg.neighborhood_gc_interval
    }
    pub fn replay_retries(&self) -> usize {
        self.cfg.replay_retries
    }
    pub fn replay_backoff(&self) -> Duration {
        self.cfg.replay_backoff
    }
    pub fn dial_timeout(&self) -> Duration {
        self.cfg.dial_timeout
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// The admin peer designated by a syncgroup name (`<peer>/<suffix>`).
pub(crate) fn admin_of(name: &str) -> Option<&str> {
    name.split_once('/').map(|(peer, _)| peer)
}

fn validate_spec(spec: &SyncgroupSpec) -> Result<()> {
    if spec.prefixes.is_empty() {
        return Err(SyncError::BadQuery("syncgroup has no prefixes".to_string()));
    }
    for prefix in &spec.prefixes {
        if !prefix.starts_with(DATA_PREFIX) && !prefix.starts_with(PERMS_PREFIX) {
            return Err(SyncError::BadQuery(format!(
                "prefix {prefix} is outside the managed namespaces"
            )));
        }
    }
    Ok(())
}

/// Nonzero random id for batches.
pub(crate) fn random_u64() -> u64 {
    let mut bytes = [0u8; 8];
    // The uuid fallback keeps this infallible on exotic targets.
    if getrandom::getrandom(&mut bytes).is_err() {
        return uuid::Uuid::new_v4().as_u64_pair().0 | 1;
    }
    u64::from_le_bytes(bytes)
}

pub(crate) fn random_nonzero_u64() -> u64 {
    loop {
        let v = random_u64();
        if v != 0 {
            return v;
        }
    }
}

fn build_member_views(dbs: &[Arc<Database>]) -> HashMap<String, MemberView> {
    let mut views: HashMap<String, MemberView> = HashMap::new();
    for db in dbs {
        let gids = match syncgroup::list_group_ids(db.store.as_ref()) {
            Ok(gids) => gids,
            Err(e) => {
                tracing::warn!(db = %db.path, error = %e, "membership scan failed");
                continue;
            }
        };
        for gid in gids {
            let (sg, _) = match syncgroup::get_current_read(db.store.as_ref(), gid) {
                Ok(current) => current,
                Err(_) => continue,
            };
            for (joiner, info) in &sg.joiners {
                let view = views.entry(joiner.clone()).or_default();
                view.databases
                    .entry(db.path.clone())
                    .or_default()
                    .insert(gid, info.clone());
                for table in &sg.spec.mount_tables {
                    if !view.mount_tables.contains(table) {
                        view.mount_tables.push(table.clone());
                    }
                }
            }
        }
    }
    views
}
