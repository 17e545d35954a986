//! Per-object version DAG.
//!
//! Every object maps each version to a node holding its parents, the log
//! record that introduced it, and batch membership; each object has exactly
//! one head pointer. During remote replay a transient graft map records the
//! new edges; it is the sole input to conflict detection.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};
use crate::storage::StoreTx;

use super::types::{decode_cbor, encode_cbor};

// ============================================================================
// Persisted shapes
// ============================================================================

/// A DAG node. `log_key` is empty only for bootstrap nodes written before
/// their log records exist locally (publish/join seeding).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DagNode {
    /// Depth: 0 for roots, `1 + max(parent levels)` otherwise. Used to rank
    /// common ancestors.
    pub level: u64,
    pub parents: Vec<String>,
    pub log_key: String,
    pub deleted: bool,
    pub batch_id: u64,
}

/// Membership of one application batch, kept while any of its nodes live.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchInfo {
    /// Object → version added under this batch id.
    pub objects: std::collections::BTreeMap<String, String>,
    pub count: u64,
}

pub fn node_key(obj: &str, version: &str) -> String {
    format!("dag/node/{obj}/{version}")
}

pub fn head_key(obj: &str) -> String {
    format!("dag/head/{obj}")
}

pub fn batch_key(batch_id: u64) -> String {
    format!("dag/batch/{batch_id:016x}")
}

// ============================================================================
// Graft map
// ============================================================================

/// Transient record of the DAG edges added by one replay batch.
#[derive(Debug, Default)]
pub struct GraftMap {
    objs: HashMap<String, GraftInfo>,
}

#[derive(Debug, Default)]
pub struct GraftInfo {
    /// Versions added in this batch.
    pub new_nodes: BTreeSet<String>,
    /// Versions with no children among the batch's additions.
    pub new_heads: BTreeSet<String>,
    /// Head pointer as it stood when the batch first touched the object.
    pub old_head: Option<String>,
}

impl GraftMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn objects(&self) -> impl Iterator<Item = &String> {
        self.objs.keys()
    }

    pub fn info(&self, obj: &str) -> Option<&GraftInfo> {
        self.objs.get(obj)
    }

    pub fn is_empty(&self) -> bool {
        self.objs.is_empty()
    }

    fn entry(&mut self, tx: &mut dyn StoreTx, obj: &str) -> &mut GraftInfo {
        self.objs
            .entry(obj.to_string())
            .or_insert_with(|| GraftInfo {
                old_head: get_head(tx, obj).ok(),
                ..Default::default()
            })
    }

    /// Record a replayed node without touching the DAG. Used when a record
    /// arrives again (an earlier round or a retried replay already stored
    /// it) so conflict detection still sees the full remote head set.
    pub fn note_node(
        &mut self,
        tx: &mut dyn StoreTx,
        obj: &str,
        version: &str,
        parents: &[String],
    ) {
        let info = self.entry(tx, obj);
        info.new_nodes.insert(version.to_string());
        info.new_heads.insert(version.to_string());
        for parent in parents {
            info.new_heads.remove(parent);
        }
    }
}

// ============================================================================
// Node and head operations
// ============================================================================

pub fn get_node(tx: &mut dyn StoreTx, obj: &str, version: &str) -> Result<DagNode> {
    decode_cbor(&tx.get_meta(&node_key(obj, version))?)
}

pub fn has_node(tx: &mut dyn StoreTx, obj: &str, version: &str) -> bool {
    tx.get_meta(&node_key(obj, version)).is_ok()
}

fn set_node(tx: &mut dyn StoreTx, obj: &str, version: &str, node: &DagNode) -> Result<()> {
    tx.put_meta(&node_key(obj, version), &encode_cbor(node)?)
}

pub fn get_head(tx: &mut dyn StoreTx, obj: &str) -> Result<String> {
    let raw = tx.get_meta(&head_key(obj))?;
    String::from_utf8(raw).map_err(|e| SyncError::Corrupt(format!("head of {obj}: {e}")))
}

pub fn set_head(tx: &mut dyn StoreTx, obj: &str, version: &str) -> Result<()> {
    tx.put_meta(&head_key(obj), version.as_bytes())
}

/// Idempotent head move.
pub fn move_head(tx: &mut dyn StoreTx, obj: &str, version: &str) -> Result<()> {
    if get_head(tx, obj).as_deref() == Ok(version) {
        return Ok(());
    }
    set_head(tx, obj, version)
}

/// Add a node for a new version. Every parent must already exist; the new
/// version must not. `graft` is supplied during remote replay only.
#[allow(clippy::too_many_arguments)]
pub fn add_node(
    tx: &mut dyn StoreTx,
    obj: &str,
    version: &str,
    log_key: &str,
    deleted: bool,
    parents: &[String],
    batch_id: u64,
    batch_count: u64,
    graft: Option<&mut GraftMap>,
) -> Result<()> {
    if has_node(tx, obj, version) {
        return Err(SyncError::Exist(format!("dag node {obj}@{version}")));
    }
    let mut level = 0;
    for parent in parents {
        let pnode = get_node(tx, obj, parent).map_err(|_| {
            SyncError::Corrupt(format!("dag node {obj}@{version}: missing parent {parent}"))
        })?;
        level = level.max(pnode.level + 1);
    }

    if let Some(graft) = graft {
        let info = graft.entry(tx, obj);
        info.new_nodes.insert(version.to_string());
        info.new_heads.insert(version.to_string());
        for parent in parents {
            info.new_heads.remove(parent);
        }
    }

    set_node(
        tx,
        obj,
        version,
        &DagNode {
            level,
            parents: parents.to_vec(),
            log_key: log_key.to_string(),
            deleted,
            batch_id,
        },
    )?;

    if batch_id != 0 {
        let key = batch_key(batch_id);
        let mut info: BatchInfo = match tx.get_meta(&key) {
            Ok(raw) => decode_cbor(&raw)?,
            Err(SyncError::NoExist(_)) => BatchInfo::default(),
            Err(e) => return Err(e),
        };
        info.objects.insert(obj.to_string(), version.to_string());
        info.count = batch_count;
        tx.put_meta(&key, &encode_cbor(&info)?)?;
    }
    Ok(())
}

/// Add a parent edge to an existing version (Link replay or resolution).
pub fn add_parent(
    tx: &mut dyn StoreTx,
    obj: &str,
    version: &str,
    parent: &str,
    graft: Option<&mut GraftMap>,
) -> Result<()> {
    if version == parent {
        return Err(SyncError::Corrupt(format!(
            "dag node {obj}@{version}: self parent"
        )));
    }
    let mut node = get_node(tx, obj, version)?;
    let pnode = get_node(tx, obj, parent).map_err(|_| {
        SyncError::Corrupt(format!("dag node {obj}@{version}: missing parent {parent}"))
    })?;
    if node.parents.iter().any(|p| p == parent) {
        return Ok(());
    }
    // The new parent must not descend from this version.
    let panc = ancestor_set(tx, obj, &[parent.to_string()])?;
    if panc.contains_key(version) {
        return Err(SyncError::Corrupt(format!(
            "dag node {obj}@{version}: cycle through {parent}"
        )));
    }

    node.parents.push(parent.to_string());
    node.level = node.level.max(pnode.level + 1);
    set_node(tx, obj, version, &node)?;

    if let Some(graft) = graft {
        let info = graft.entry(tx, obj);
        info.new_heads.remove(parent);
        info.new_heads.insert(version.to_string());
    }
    Ok(())
}

// ============================================================================
// Traversal
// ============================================================================

/// BFS over parents from `starts`, visiting each reachable node (including
/// the starts) exactly once. The callback may stop the walk early by
/// returning `false`.
pub fn for_each_ancestor(
    tx: &mut dyn StoreTx,
    obj: &str,
    starts: &[String],
    visit: &mut dyn FnMut(&str, &DagNode) -> Result<bool>,
) -> Result<()> {
    let mut queue: VecDeque<String> = starts.iter().cloned().collect();
    let mut seen: HashSet<String> = starts.iter().cloned().collect();
    while let Some(version) = queue.pop_front() {
        let node = get_node(tx, obj, &version)?;
        if !visit(&version, &node)? {
            return Ok(());
        }
        for parent in &node.parents {
            if seen.insert(parent.clone()) {
                queue.push_back(parent.clone());
            }
        }
    }
    Ok(())
}

/// All ancestors of `starts` (including the starts), with their nodes.
fn ancestor_set(
    tx: &mut dyn StoreTx,
    obj: &str,
    starts: &[String],
) -> Result<HashMap<String, DagNode>> {
    let mut out = HashMap::new();
    for_each_ancestor(tx, obj, starts, &mut |version, node| {
        out.insert(version.to_string(), node.clone());
        Ok(true)
    })?;
    Ok(out)
}

// ============================================================================
// Conflict detection
// ============================================================================

/// Outcome of conflict detection for one grafted object.
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictState {
    pub obj_id: String,
    pub conflict: bool,
    /// The head that should win absent application resolution. Equals
    /// `old_head` when the local side already dominates.
    pub new_head: String,
    pub old_head: Option<String>,
    /// Deepest common ancestor when in conflict; `None` for disjoint
    /// histories.
    pub ancestor: Option<String>,
}

/// Decide whether the remote heads grafted for `obj` conflict with the
/// local head. Pure function over the graft map plus the DAG.
pub fn has_conflict(tx: &mut dyn StoreTx, obj: &str, graft: &GraftMap) -> Result<ConflictState> {
    let info = graft
        .info(obj)
        .ok_or_else(|| SyncError::Corrupt(format!("no graft state for {obj}")))?;
    if info.new_heads.is_empty() {
        return Err(SyncError::Corrupt(format!("no new heads for {obj}")));
    }

    let new_heads: Vec<String> = info.new_heads.iter().cloned().collect();
    let newest = newest_head(tx, obj, &new_heads)?;

    let Some(old_head) = info.old_head.clone() else {
        // No local head: accept the remote side outright.
        return Ok(ConflictState {
            obj_id: obj.to_string(),
            conflict: false,
            new_head: newest,
            old_head: None,
            ancestor: None,
        });
    };

    if new_heads.len() == 1 && new_heads[0] == old_head {
        // Links only re-parented the current head.
        return Ok(ConflictState {
            obj_id: obj.to_string(),
            conflict: false,
            new_head: old_head.clone(),
            old_head: Some(old_head),
            ancestor: None,
        });
    }

    let old_anc = ancestor_set(tx, obj, &[old_head.clone()])?;
    let mut head_ancs: Vec<HashMap<String, DagNode>> = Vec::with_capacity(new_heads.len());
    for head in &new_heads {
        head_ancs.push(ancestor_set(tx, obj, std::slice::from_ref(head))?);
    }

    if head_ancs.iter().all(|anc| anc.contains_key(&old_head)) {
        // Local head is an ancestor of every remote head: fast-forward.
        return Ok(ConflictState {
            obj_id: obj.to_string(),
            conflict: false,
            new_head: newest,
            old_head: Some(old_head),
            ancestor: None,
        });
    }

    if new_heads.iter().all(|head| old_anc.contains_key(head)) {
        // Every remote head is already known locally: local wins.
        return Ok(ConflictState {
            obj_id: obj.to_string(),
            conflict: false,
            new_head: old_head.clone(),
            old_head: Some(old_head),
            ancestor: None,
        });
    }

    // Concurrent edit. The deepest common ancestor of the old head and all
    // new heads seeds the three-way resolution; lexicographically smallest
    // version breaks level ties.
    let mut common: Option<HashMap<String, DagNode>> = Some(old_anc);
    for anc in head_ancs {
        let prev = common.take().unwrap_or_default();
        common = Some(
            prev.into_iter()
                .filter(|(v, _)| anc.contains_key(v))
                .collect(),
        );
    }
    let ancestor = common
        .unwrap_or_default()
        .into_iter()
        .max_by(|(va, na), (vb, nb)| {
            na.level
                .cmp(&nb.level)
                .then_with(|| vb.cmp(va)) // prefer the smaller version string
        })
        .map(|(v, _)| v);

    Ok(ConflictState {
        obj_id: obj.to_string(),
        conflict: true,
        new_head: newest,
        old_head: Some(old_head),
        ancestor,
    })
}

/// Deterministic "newest" pick among candidate heads: deepest level, then
/// greatest version string.
fn newest_head(tx: &mut dyn StoreTx, obj: &str, heads: &[String]) -> Result<String> {
    let mut best: Option<(u64, String)> = None;
    for head in heads {
        let node = get_node(tx, obj, head)?;
        let candidate = (node.level, head.clone());
        if best
            .as_ref()
            .is_none_or(|b| (candidate.0, &candidate.1) > (b.0, &b.1))
        {
            best = Some(candidate);
        }
    }
    best.map(|(_, version)| version)
        .ok_or_else(|| SyncError::Corrupt(format!("no remote heads for {obj}")))
}

// ============================================================================
// Pruning
// ============================================================================

/// Batch ids touched by pruning; passed to `prune_done` once the caller has
/// committed the deletions.
pub type BatchSet = HashSet<u64>;

/// Delete every strict ancestor of `version`, its log record (via
/// `log_deleter`), and record touched batch ids. `version` becomes the only
/// remaining history for the object.
pub fn prune(
    tx: &mut dyn StoreTx,
    obj: &str,
    version: &str,
    batch_set: &mut BatchSet,
    log_deleter: &mut dyn FnMut(&mut dyn StoreTx, &str) -> Result<()>,
) -> Result<()> {
    let mut doomed: Vec<(String, DagNode)> = Vec::new();
    for_each_ancestor(tx, obj, &[version.to_string()], &mut |v, node| {
        if v != version {
            doomed.push((v.to_string(), node.clone()));
        }
        Ok(true)
    })?;

    for (v, node) in doomed {
        if node.batch_id != 0 {
            batch_set.insert(node.batch_id);
        }
        if !node.log_key.is_empty() {
            log_deleter(tx, &node.log_key)?;
        }
        tx.delete_meta(&node_key(obj, &v))?;
    }

    // The survivor keeps no dangling parent references.
    let mut node = get_node(tx, obj, version)?;
    if !node.parents.is_empty() {
        node.parents.clear();
        node.level = 0;
        set_node(tx, obj, version, &node)?;
    }
    Ok(())
}

/// Drop batch bookkeeping for fully pruned batches.
pub fn prune_done(tx: &mut dyn StoreTx, batch_set: &BatchSet) -> Result<()> {
    for batch_id in batch_set {
        tx.delete_meta(&batch_key(*batch_id))?;
    }
    Ok(())
}

/// Remove an object's entire DAG: every node reachable from the head, the
/// head pointer, and the associated log records.
pub fn prune_all(
    tx: &mut dyn StoreTx,
    obj: &str,
    batch_set: &mut BatchSet,
    log_deleter: &mut dyn FnMut(&mut dyn StoreTx, &str) -> Result<()>,
) -> Result<()> {
    let head = match get_head(tx, obj) {
        Ok(h) => h,
        Err(SyncError::NoExist(_)) => return Ok(()),
        Err(e) => return Err(e),
    };
    prune(tx, obj, &head, batch_set, log_deleter)?;
    let node = get_node(tx, obj, &head)?;
    if node.batch_id != 0 {
        batch_set.insert(node.batch_id);
    }
    if !node.log_key.is_empty() {
        log_deleter(tx, &node.log_key)?;
    }
    tx.delete_meta(&node_key(obj, &head))?;
    tx.delete_meta(&head_key(obj))
}
