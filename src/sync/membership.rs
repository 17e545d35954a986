//! Aggregated view of sync peers across all syncgroups and databases.
//!
//! Rebuilt on demand and cached for a short TTL; peer selection tolerates
//! the staleness window.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::types::GroupId;

use super::types::MemberInfo;

/// Default cache lifetime.
pub const DEFAULT_MEMBER_VIEW_TTL: Duration = Duration::from_secs(2);

/// Everything known about one peer: which syncgroups it has joined in which
/// databases, and where it can be dialed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemberView {
    /// db path → (group id → member info).
    pub databases: HashMap<String, HashMap<GroupId, MemberInfo>>,
    /// Union of the mount tables of the groups this peer is in.
    pub mount_tables: Vec<String>,
}

impl MemberView {
    /// Number of syncgroup memberships across all databases.
    pub fn group_count(&self) -> usize {
        self.databases.values().map(|sgs| sgs.len()).sum()
    }
}

struct Cached {
    built_at: Instant,
    view: HashMap<String, MemberView>,
}

/// TTL cache over the peer aggregate.
pub struct MembershipView {
    ttl: Duration,
    cached: Mutex<Option<Cached>>,
}

impl MembershipView {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            cached: Mutex::new(None),
        }
    }

    /// Return the cached aggregate, rebuilding through `rebuild` when the
    /// TTL has lapsed or nothing is cached yet.
    pub fn get(
        &self,
        rebuild: impl FnOnce() -> HashMap<String, MemberView>,
    ) -> HashMap<String, MemberView> {
        let mut cached = self.cached.lock();
        if let Some(c) = cached.as_ref() {
            if c.built_at.elapsed() < self.ttl {
                return c.view.clone();
            }
        }
        let view = rebuild();
        *cached = Some(Cached {
            built_at: Instant::now(),
            view: view.clone(),
        });
        view
    }

    /// Drop the cache so the next read rebuilds.
    pub fn invalidate(&self) {
        *self.cached.lock() = None;
    }

    /// Peer names with their membership counts.
    pub fn members(
        &self,
        rebuild: impl FnOnce() -> HashMap<String, MemberView>,
    ) -> HashMap<String, usize> {
        self.get(rebuild)
            .into_iter()
            .map(|(peer, view)| (peer, view.group_count()))
            .collect()
    }

    /// Deep copy of one peer's view.
    pub fn copy(
        &self,
        peer: &str,
        rebuild: impl FnOnce() -> HashMap<String, MemberView>,
    ) -> Option<MemberView> {
        self.get(rebuild).remove(peer)
    }
}
