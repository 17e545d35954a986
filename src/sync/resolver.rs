//! Conflict resolution policy.
//!
//! Registered per-collection resolvers are consulted first; a failing
//! resolver (`BrokenCrConnection`) falls back to the default policy:
//! last-writer-wins by update time, tie-break by device id.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::error::Result;
use crate::types::DeviceId;

// ============================================================================
// Conflict shapes
// ============================================================================

/// One side of a conflict as presented to resolvers.
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictSide {
    pub version: String,
    /// `None` for deletions and unmaterialized ancestors.
    pub value: Option<Vec<u8>>,
    pub deleted: bool,
    pub upd_time: DateTime<Utc>,
    pub device: DeviceId,
}

/// A detected concurrent edit on one object.
#[derive(Debug, Clone, PartialEq)]
pub struct Conflict {
    pub obj_id: String,
    pub local: ConflictSide,
    pub remote: ConflictSide,
    /// Three-way base; absent for disjoint histories.
    pub ancestor: Option<ConflictSide>,
}

/// A resolver's verdict.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    PickLocal,
    PickRemote,
    /// Produce a new version carrying the given merged value.
    CreateNew(Vec<u8>),
}

/// Application-supplied resolver, registered per collection prefix.
#[async_trait]
pub trait ConflictResolver: Send + Sync {
    async fn resolve(&self, conflict: &Conflict) -> Result<Resolution>;
}

// ============================================================================
// Default policy
// ============================================================================

/// Last-writer-wins: later update time wins; equal times fall back to the
/// greater device id.
pub fn default_resolution(conflict: &Conflict) -> Resolution {
    let local = (&conflict.local.upd_time, conflict.local.device);
    let remote = (&conflict.remote.upd_time, conflict.remote.device);
    if remote > local {
        Resolution::PickRemote
    } else {
        Resolution::PickLocal
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Longest-prefix-match registry of application resolvers.
#[derive(Default)]
pub struct ResolverRegistry {
    by_prefix: RwLock<Vec<(String, Arc<dyn ConflictResolver>)>>,
}

impl ResolverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, prefix: impl Into<String>, resolver: Arc<dyn ConflictResolver>) {
        let mut entries = self.by_prefix.write();
        entries.push((prefix.into(), resolver));
        entries.sort_by(|(a, _), (b, _)| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
    }

    fn lookup(&self, obj_id: &str) -> Option<Arc<dyn ConflictResolver>> {
        self.by_prefix
            .read()
            .iter()
            .find(|(prefix, _)| obj_id.starts_with(prefix.as_str()))
            .map(|(_, r)| Arc::clone(r))
    }

    /// Resolve a conflict: plugin first, default policy on miss or plugin
    /// failure.
    pub async fn resolve(&self, conflict: &Conflict) -> Resolution {
        if let Some(resolver) = self.lookup(&conflict.obj_id) {
            match resolver.resolve(conflict).await {
                Ok(resolution) => return resolution,
                Err(e) => {
                    tracing::warn!(
                        obj = %conflict.obj_id,
                        error = %e,
                        "conflict resolver failed, applying default policy"
                    );
                }
            }
        }
        default_resolution(conflict)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;
    use chrono::TimeZone;

    fn side(version: &str, ts: i64, device: DeviceId) -> ConflictSide {
        ConflictSide {
            version: version.to_string(),
            value: Some(b"v".to_vec()),
            deleted: false,
            upd_time: Utc.timestamp_opt(ts, 0).unwrap(),
            device,
        }
    }

    fn conflict(local: ConflictSide, remote: ConflictSide) -> Conflict {
        Conflict {
            obj_id: "/r/x".to_string(),
            local,
            remote,
            ancestor: None,
        }
    }

    #[test]
    fn later_writer_wins() {
        let c = conflict(side("l", 10, 1), side("r", 20, 2));
        assert_eq!(default_resolution(&c), Resolution::PickRemote);
        let c = conflict(side("l", 30, 1), side("r", 20, 2));
        assert_eq!(default_resolution(&c), Resolution::PickLocal);
    }

    #[test]
    fn equal_times_tie_break_by_device() {
        let c = conflict(side("l", 10, 1), side("r", 10, 2));
        assert_eq!(default_resolution(&c), Resolution::PickRemote);
        let c = conflict(side("l", 10, 2), side("r", 10, 1));
        assert_eq!(default_resolution(&c), Resolution::PickLocal);
    }

    struct Always(Resolution);

    #[async_trait]
    impl ConflictResolver for Always {
        async fn resolve(&self, _: &Conflict) -> Result<Resolution> {
            Ok(self.0.clone())
        }
    }

    struct Broken;

    #[async_trait]
    impl ConflictResolver for Broken {
        async fn resolve(&self, _: &Conflict) -> Result<Resolution> {
            Err(SyncError::BrokenCrConnection("client went away".into()))
        }
    }

    #[tokio::test]
    async fn registry_prefers_longest_prefix() {
        let registry = ResolverRegistry::new();
        registry.register("/r", Arc::new(Always(Resolution::PickLocal)));
        registry.register("/r/x", Arc::new(Always(Resolution::PickRemote)));

        let c = conflict(side("l", 30, 1), side("r", 20, 2));
        assert_eq!(registry.resolve(&c).await, Resolution::PickRemote);
    }

    #[tokio::test]
    async fn broken_resolver_falls_back_to_default() {
        let registry = ResolverRegistry::new();
        registry.register("/r", Arc::new(Broken));

        let c = conflict(side("l", 30, 1), side("r", 20, 2));
        assert_eq!(registry.resolve(&c).await, Resolution::PickLocal);
    }

    #[tokio::test]
    async fn unmatched_prefix_uses_default() {
        let registry = ResolverRegistry::new();
        registry.register("/p", Arc::new(Always(Resolution::PickLocal)));
        let c = conflict(side("l", 10, 1), side("r", 20, 2));
        assert_eq!(registry.resolve(&c).await, Resolution::PickRemote);
    }
}
