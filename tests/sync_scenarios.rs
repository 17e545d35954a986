//! End-to-end sync scenarios over in-process engines wired through the
//! loopback transport and the in-memory store.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use syncbase::sync::types::pgv_dominates;
use syncbase::sync::{dag, logstore, syncgroup};
use syncbase::{
    DbId, DeltaReq, DeltaResp, GenVector, LogRecord, LoopbackNetwork, MemStore, MemberInfo,
    Permissions, RecType, Store, StoreRead, SyncEngine, SyncEngineOptions, SyncError,
    SyncgroupSpec,
};

// ============================================================================
// Helpers
// ============================================================================

const MT: &str = "mt1";

struct Node {
    engine: SyncEngine,
    store: MemStore,
    path: String,
}

fn db_id() -> DbId {
    DbId::new("app", "db")
}

fn make_node(net: &LoopbackNetwork, name: &str) -> Node {
    let mut opts = SyncEngineOptions::new(name, net.transport());
    opts.mount_tables = vec![MT.to_string()];
    opts.replay_backoff = Duration::from_millis(5);
    let engine = SyncEngine::new(opts);
    let store = MemStore::new();
    engine
        .attach_database(db_id(), Arc::new(store.clone()))
        .expect("attach database");
    net.register(&engine, name, &[MT.to_string()]);
    Node {
        engine,
        store,
        path: "app:db".to_string(),
    }
}

fn open_spec(prefix: &str) -> SyncgroupSpec {
    SyncgroupSpec {
        description: "test group".to_string(),
        prefixes: vec![prefix.to_string()],
        perms: Permissions::allow_all(&["a", "b", "c"]),
        mount_tables: vec![MT.to_string()],
    }
}

fn put(node: &Node, key: &str, value: &[u8]) {
    let mut tx = node.store.begin().expect("begin");
    tx.put_row(key, value).expect("put_row");
    tx.commit().expect("commit");
    node.engine.process_watch_queue(&node.path).expect("watch");
}

fn delete(node: &Node, key: &str) {
    let mut tx = node.store.begin().expect("begin");
    tx.delete_row(key).expect("delete_row");
    tx.commit().expect("commit");
    node.engine.process_watch_queue(&node.path).expect("watch");
}

fn head_of(node: &Node, obj: &str) -> Option<String> {
    node.store
        .get_meta(&dag::head_key(obj))
        .ok()
        .map(|raw| String::from_utf8(raw).unwrap())
}

fn data_log_records(node: &Node) -> Vec<LogRecord> {
    node.store
        .scan_meta_prefix("log/data/")
        .unwrap()
        .into_iter()
        .map(|(_, raw)| {
            let mut cursor = std::io::Cursor::new(raw);
            ciborium::from_reader(&mut cursor).unwrap()
        })
        .collect()
}

// ============================================================================
// S1 — fast-forward
// ============================================================================

#[tokio::test]
async fn s1_fast_forward_pull() {
    let net = LoopbackNetwork::new();
    let a = make_node(&net, "a");
    let b = make_node(&net, "b");

    a.engine
        .create_syncgroup(&db_id(), "b/sg1", open_spec("/r"), MemberInfo::default())
        .expect("create");
    a.engine.publish_pending(&a.path).await.expect("publish");

    put(&a, "/r/x", b"v1");
    let a_dev = a.engine.device_id().unwrap();
    let a_head = head_of(&a, "/r/x").expect("head on a");

    b.engine.sync_once(&b.path, "a").await.expect("sync");

    assert_eq!(b.store.get_row("/r/x").unwrap(), b"v1");
    assert_eq!(head_of(&b, "/r/x").as_deref(), Some(a_head.as_str()));

    // B's vector now covers A's first data generation.
    let state = logstore::load_sync_state(&b.store).unwrap();
    assert_eq!(state.genvec["/r"].get(&a_dev), Some(&1));

    // The only data record on B is A's Node (gen 1), with no parents.
    let recs = data_log_records(&b);
    assert_eq!(recs.len(), 1);
    let m = &recs[0].metadata;
    assert_eq!(m.id, a_dev);
    assert_eq!(m.gen, 1);
    assert_eq!(m.rec_type, RecType::Node);
    assert_eq!(m.obj_id, "/r/x");
    assert!(m.parents.is_empty());
}

// ============================================================================
// S2 — concurrent writes, last writer wins
// ============================================================================

#[tokio::test]
async fn s2_concurrent_writes_converge_with_links() {
    let net = LoopbackNetwork::new();
    let a = make_node(&net, "a");
    let b = make_node(&net, "b");

    b.engine
        .create_syncgroup(&db_id(), "b/sg1", open_spec("/r"), MemberInfo::default())
        .expect("create");
    a.engine
        .join_syncgroup(&db_id(), "b/sg1", MemberInfo::default())
        .await
        .expect("join");

    put(&a, "/r/x", b"v1");
    std::thread::sleep(Duration::from_millis(10));
    put(&b, "/r/x", b"v2");
    let v1 = head_of(&a, "/r/x").unwrap();
    let v2 = head_of(&b, "/r/x").unwrap();

    // A pulls first and resolves the conflict; B then receives V1 together
    // with the resolution link, so no second resolution is needed.
    a.engine.sync_once(&a.path, "b").await.expect("a pulls b");
    b.engine.sync_once(&b.path, "a").await.expect("b pulls a");

    for node in [&a, &b] {
        assert_eq!(head_of(node, "/r/x").as_deref(), Some(v2.as_str()));
        assert_eq!(node.store.get_row("/r/x").unwrap(), b"v2");

        let recs = data_log_records(node);
        let links: Vec<&LogRecord> = recs
            .iter()
            .filter(|r| r.metadata.rec_type == RecType::Link)
            .collect();
        // The resolution link ties both heads and is present exactly once.
        assert_eq!(links.len(), 1);
        let link = links[0];
        let mut parents = link.metadata.parents.clone();
        parents.sort();
        let mut expected = vec![v1.clone(), v2.clone()];
        expected.sort();
        assert_eq!(parents, expected);
        assert_eq!(link.metadata.cur_vers, v2);
    }
}

// ============================================================================
// S3 — delete wins tombstone
// ============================================================================

#[tokio::test]
async fn s3_delete_tombstone_propagates() {
    let net = LoopbackNetwork::new();
    let a = make_node(&net, "a");
    let b = make_node(&net, "b");

    a.engine
        .create_syncgroup(&db_id(), "b/sg1", open_spec("/r"), MemberInfo::default())
        .expect("create");
    a.engine.publish_pending(&a.path).await.expect("publish");

    put(&a, "/r/x", b"v1");
    let v1 = head_of(&a, "/r/x").unwrap();
    delete(&a, "/r/x");
    let v2 = head_of(&a, "/r/x").unwrap();

    b.engine.sync_once(&b.path, "a").await.expect("sync");

    assert!(matches!(
        b.store.get_row("/r/x"),
        Err(SyncError::NoExist(_))
    ));
    assert_eq!(head_of(&b, "/r/x").as_deref(), Some(v2.as_str()));
    // The DAG retains the full history.
    assert!(b.store.get_meta(&dag::node_key("/r/x", &v1)).is_ok());
    assert!(b.store.get_meta(&dag::node_key("/r/x", &v2)).is_ok());
}

// ============================================================================
// S4 — join with pending state
// ============================================================================

#[tokio::test]
async fn s4_join_clears_pending_after_catch_up() {
    let net = LoopbackNetwork::new();
    let a = make_node(&net, "a");
    let c = make_node(&net, "c");

    let gid = a
        .engine
        .create_syncgroup(&db_id(), "a/sg1", open_spec("/r"), MemberInfo::default())
        .expect("create");
    put(&a, "/r/x", b"v1");

    c.engine
        .join_syncgroup(&db_id(), "a/sg1", MemberInfo::default())
        .await
        .expect("join");

    // Pending until the initiator proves the local vector dominates.
    let (pending_before, pending_vec) = {
        let mut tx = c.store.begin().unwrap();
        let local = syncgroup::get_local_state(tx.as_mut(), gid).unwrap();
        tx.abort();
        (local.sync_pending, local.pending_genvec)
    };
    assert!(pending_before);
    assert!(!pending_vec.is_empty());

    c.engine.sync_once(&c.path, "a").await.expect("sync");

    let mut tx = c.store.begin().unwrap();
    let local = syncgroup::get_local_state(tx.as_mut(), gid).unwrap();
    tx.abort();
    assert!(!local.sync_pending);

    // And the data followed.
    assert_eq!(c.store.get_row("/r/x").unwrap(), b"v1");

    // Property 5: the merged vector dominates what the admin reported.
    let state = logstore::load_sync_state(&c.store).unwrap();
    let merged = state
        .sggenvec
        .get(&syncbase::types::sg_oid(gid))
        .cloned()
        .unwrap_or_default();
    assert!(pgv_dominates(&merged, &pending_vec));
}

// ============================================================================
// S5 — permission-filtered delta
// ============================================================================

#[tokio::test]
async fn s5_responder_filters_unauthorized_syncgroups() {
    let net = LoopbackNetwork::new();
    let b = make_node(&net, "b");

    let sg1 = b
        .engine
        .create_syncgroup(&db_id(), "b/sg1", open_spec("/r/open"), MemberInfo::default())
        .expect("create sg1");
    let secret_spec = SyncgroupSpec {
        perms: Permissions::allow_all(&["b"]),
        ..open_spec("/r/secret")
    };
    let sg2 = b
        .engine
        .create_syncgroup(&db_id(), "b/sg2", secret_spec, MemberInfo::default())
        .expect("create sg2");

    put(&b, "/r/open/x", b"public");
    put(&b, "/r/secret/x", b"private");

    // Caller "a" asks for both groups.
    let req = DeltaReq::Data {
        app: "app".to_string(),
        db: "db".to_string(),
        sg_ids: BTreeSet::from([sg1, sg2]),
        init_vec: GenVector::from([
            ("/r/open".to_string(), Default::default()),
            ("/r/secret".to_string(), Default::default()),
        ]),
    };
    let (tx, mut rx) = tokio::sync::mpsc::channel(64);
    b.engine
        .handle_get_deltas("a", req, tx)
        .await
        .expect("serve");

    let mut resp_vec = GenVector::new();
    let mut records = Vec::new();
    while let Some(msg) = rx.recv().await {
        match msg {
            DeltaResp::Rec(rec) => records.push(rec),
            DeltaResp::RespVec(v) => resp_vec = v,
            DeltaResp::Start | DeltaResp::Finish => {}
        }
    }

    assert!(resp_vec.contains_key("/r/open"));
    assert!(!resp_vec.contains_key("/r/secret"));
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].metadata.obj_id, "/r/open/x");
}

// ============================================================================
// S6 — watcher batch integrity
// ============================================================================

#[tokio::test]
async fn s6_batched_writes_carry_one_batch_id() {
    let net = LoopbackNetwork::new();
    let a = make_node(&net, "a");
    let b = make_node(&net, "b");

    a.engine
        .create_syncgroup(&db_id(), "b/sg1", open_spec("/r"), MemberInfo::default())
        .expect("create");
    a.engine.publish_pending(&a.path).await.expect("publish");

    let mut tx = a.store.begin().unwrap();
    tx.put_row("/r/a", b"1").unwrap();
    tx.put_row("/r/b", b"2").unwrap();
    tx.put_row("/r/c", b"3").unwrap();
    tx.commit().unwrap();
    a.engine.process_watch_queue(&a.path).unwrap();

    let recs = data_log_records(&a);
    assert_eq!(recs.len(), 3);
    let batch_id = recs[0].metadata.batch_id;
    assert_ne!(batch_id, 0);
    for rec in &recs {
        assert_eq!(rec.metadata.batch_id, batch_id);
        assert_eq!(rec.metadata.batch_count, 3);
    }

    b.engine.sync_once(&b.path, "a").await.expect("sync");
    for key in ["/r/a", "/r/b", "/r/c"] {
        assert!(b.store.get_row(key).is_ok(), "{key} missing on b");
    }
}

// ============================================================================
// Idempotence
// ============================================================================

#[tokio::test]
async fn repeated_pull_is_a_no_op() {
    let net = LoopbackNetwork::new();
    let a = make_node(&net, "a");
    let b = make_node(&net, "b");

    a.engine
        .create_syncgroup(&db_id(), "b/sg1", open_spec("/r"), MemberInfo::default())
        .expect("create");
    a.engine.publish_pending(&a.path).await.expect("publish");
    put(&a, "/r/x", b"v1");

    b.engine.sync_once(&b.path, "a").await.expect("first");
    let recs_before = data_log_records(&b);
    let head_before = head_of(&b, "/r/x");

    b.engine.sync_once(&b.path, "a").await.expect("second");
    assert_eq!(data_log_records(&b), recs_before);
    assert_eq!(head_of(&b, "/r/x"), head_before);
}

#[tokio::test]
async fn local_rejoin_only_bumps_join_count() {
    let net = LoopbackNetwork::new();
    let a = make_node(&net, "a");
    let c = make_node(&net, "c");

    let gid = a
        .engine
        .create_syncgroup(&db_id(), "a/sg1", open_spec("/r"), MemberInfo::default())
        .expect("create");

    let first = c
        .engine
        .join_syncgroup(&db_id(), "a/sg1", MemberInfo::default())
        .await
        .expect("first join");
    let second = c
        .engine
        .join_syncgroup(&db_id(), "a/sg1", MemberInfo::default())
        .await
        .expect("second join");
    assert_eq!(first.id, second.id);

    let mut tx = c.store.begin().unwrap();
    let local = syncgroup::get_local_state(tx.as_mut(), gid).unwrap();
    tx.abort();
    assert_eq!(local.num_local_joiners, 2);
}

// ============================================================================
// Quantified invariants
// ============================================================================

/// Invariants 1, 2, and 4 over a store after a workload: DAG parents exist,
/// heads are nodes, positions are unique per database and increasing per
/// device and space.
fn check_invariants(node: &Node) {
    // Every parent referenced exists.
    let nodes: Vec<(String, dag::DagNode)> = node
        .store
        .scan_meta_prefix("dag/node/")
        .unwrap()
        .into_iter()
        .map(|(key, raw)| {
            let decoded: dag::DagNode = ciborium::from_reader(raw.as_slice()).unwrap();
            (key, decoded)
        })
        .collect();
    for (key, n) in &nodes {
        let obj_and_ver = key.strip_prefix("dag/node/").unwrap();
        let (obj, _) = obj_and_ver.rsplit_once('/').unwrap();
        for parent in &n.parents {
            assert!(
                node.store.get_meta(&dag::node_key(obj, parent)).is_ok(),
                "missing parent {parent} of {key}"
            );
        }
    }

    // Every head points at an existing node.
    for (key, raw) in node.store.scan_meta_prefix("dag/head/").unwrap() {
        let obj = key.strip_prefix("dag/head/").unwrap();
        let head = String::from_utf8(raw).unwrap();
        assert!(
            node.store.get_meta(&dag::node_key(obj, &head)).is_ok(),
            "dangling head for {obj}"
        );
    }

    // Positions are unique across the database and increasing per
    // (device, space).
    let mut all_pos: Vec<u64> = Vec::new();
    let mut per_dev: std::collections::HashMap<(String, u64), u64> = Default::default();
    for (key, raw) in node.store.scan_meta_prefix("log/").unwrap() {
        let rec: LogRecord = ciborium::from_reader(raw.as_slice()).unwrap();
        let (space, dev, _) = logstore::parse_log_rec_key(&key).unwrap();
        all_pos.push(rec.metadata.pos);
        let last = per_dev.entry((space, dev)).or_insert(0);
        assert!(rec.metadata.pos > *last, "pos not increasing at {key}");
        *last = rec.metadata.pos;
    }
    let unique: std::collections::HashSet<u64> = all_pos.iter().copied().collect();
    assert_eq!(unique.len(), all_pos.len(), "duplicate pos in one database");
}

#[tokio::test]
async fn invariants_hold_after_convergence() {
    let net = LoopbackNetwork::new();
    let a = make_node(&net, "a");
    let b = make_node(&net, "b");

    b.engine
        .create_syncgroup(&db_id(), "b/sg1", open_spec("/r"), MemberInfo::default())
        .expect("create");
    a.engine
        .join_syncgroup(&db_id(), "b/sg1", MemberInfo::default())
        .await
        .expect("join");

    put(&a, "/r/x", b"a1");
    put(&b, "/r/x", b"b1");
    put(&a, "/r/y", b"a2");
    delete(&a, "/r/y");

    a.engine.sync_once(&a.path, "b").await.expect("a pulls");
    b.engine.sync_once(&b.path, "a").await.expect("b pulls");
    a.engine.sync_once(&a.path, "b").await.expect("a pulls again");
    b.engine.sync_once(&b.path, "a").await.expect("b pulls again");

    check_invariants(&a);
    check_invariants(&b);

    // Converged heads.
    assert_eq!(head_of(&a, "/r/x"), head_of(&b, "/r/x"));
    assert_eq!(head_of(&a, "/r/y"), head_of(&b, "/r/y"));
}

// ============================================================================
// Membership and peer selection
// ============================================================================

#[tokio::test]
async fn members_aggregate_across_syncgroups() {
    let net = LoopbackNetwork::new();
    let a = make_node(&net, "a");
    let b = make_node(&net, "b");

    b.engine
        .create_syncgroup(&db_id(), "b/sg1", open_spec("/r"), MemberInfo::default())
        .expect("create");
    a.engine
        .join_syncgroup(&db_id(), "b/sg1", MemberInfo::default())
        .await
        .expect("join");

    // B admitted A, so B's view lists both members.
    let members = b.engine.members();
    assert_eq!(members.get("a"), Some(&1));
    assert_eq!(members.get("b"), Some(&1));

    let view = b.engine.member_view("a").expect("view of a");
    assert!(view.databases.contains_key("app:db"));
}

// ============================================================================
// Syncgroup destruction
// ============================================================================

#[tokio::test]
async fn destroy_cascades_and_stops_watching() {
    let net = LoopbackNetwork::new();
    let a = make_node(&net, "a");

    a.engine
        .create_syncgroup(&db_id(), "a/sg1", open_spec("/r"), MemberInfo::default())
        .expect("create");
    put(&a, "/r/x", b"v1");

    a.engine
        .destroy_syncgroup(&db_id(), "a/sg1")
        .expect("destroy");
    a.engine.process_watch_queue(&a.path).unwrap();

    // Registry, syncgroup DAG, and syncgroup log records are gone; data
    // records are untouched.
    assert!(a.store.scan_meta_prefix("sg/").unwrap().is_empty());
    assert!(a.store.scan_meta_prefix("log/sg:").unwrap().is_empty());
    let before = data_log_records(&a).len();
    assert_eq!(before, 1);

    // The prefix is no longer watched, so new writes do not sync.
    put(&a, "/r/y", b"v2");
    assert_eq!(data_log_records(&a).len(), before);

    // Idempotent from the caller's perspective.
    assert!(matches!(
        a.engine.destroy_syncgroup(&db_id(), "a/sg1"),
        Err(SyncError::NoExist(_))
    ));
}

// ============================================================================
// Mount-table rotation
// ============================================================================

#[tokio::test]
async fn initiator_rotates_to_a_working_mount_table() {
    let net = LoopbackNetwork::new();
    let a = make_node(&net, "a");
    let b = make_node(&net, "b");

    // The syncgroup advertises a dead table first.
    let spec = SyncgroupSpec {
        mount_tables: vec!["dead-mt".to_string(), MT.to_string()],
        ..open_spec("/r")
    };
    a.engine
        .create_syncgroup(&db_id(), "b/sg1", spec, MemberInfo::default())
        .expect("create");
    a.engine.publish_pending(&a.path).await.expect("publish");
    put(&a, "/r/x", b"v1");

    b.engine.sync_once(&b.path, "a").await.expect("sync");
    assert_eq!(b.store.get_row("/r/x").unwrap(), b"v1");
}
