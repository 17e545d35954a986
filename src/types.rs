//! Core identities, key namespaces, and permission types shared across the
//! engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};

/// Stable 64-bit device id, chosen at first start and persisted.
pub type DeviceId = u64;

/// 64-bit syncgroup id.
pub type GroupId = u64;

/// Per-device, per-space monotone generation counter. Starts at 1.
pub type Gen = u64;

/// Per-database monotone log position, assigned at insertion time.
pub type Pos = u64;

// ============================================================================
// Database identity
// ============================================================================

/// A database is named by (application, database) within one process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DbId {
    pub app: String,
    pub name: String,
}

impl DbId {
    pub fn new(app: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            app: app.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for DbId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.app, self.name)
    }
}

/// Join (app, db) into the flat path used in keys and peer maps.
///
/// Names must not contain `:` so that `split_app_db` is an exact inverse.
pub fn join_app_db(app: &str, db: &str) -> Result<String> {
    if app.contains(':') || db.contains(':') {
        return Err(SyncError::BadQuery(format!(
            "app/db names must not contain ':': {app}, {db}"
        )));
    }
    Ok(format!("{app}:{db}"))
}

/// Split a flat app/db path back into (app, db).
pub fn split_app_db(path: &str) -> Result<(String, String)> {
    match path.split_once(':') {
        Some((app, db)) if !db.contains(':') => Ok((app.to_string(), db.to_string())),
        _ => Err(SyncError::BadQuery(format!("malformed app/db path: {path}"))),
    }
}

// ============================================================================
// Managed key namespaces
// ============================================================================

/// Row data namespace. Application keys live under `/r/...`.
pub const DATA_PREFIX: &str = "/r";

/// Prefix-permissions namespace, synced through the same pipeline.
pub const PERMS_PREFIX: &str = "/p";

/// Reserved object-id space for versioned syncgroup metadata.
pub const SG_OID_PREFIX: &str = "/sg";

/// Object-space name for data log records and counters.
pub const DATA_SPACE: &str = "data";

/// Object id of a syncgroup's versioned metadata entry.
pub fn sg_oid(gid: GroupId) -> String {
    format!("{SG_OID_PREFIX}/{gid:016x}")
}

/// Object-space name for a syncgroup's log records and counters.
/// No `/` so it nests cleanly inside `log/<space>/...` keys.
pub fn sg_space(gid: GroupId) -> String {
    format!("sg:{gid:016x}")
}

/// Recover the group id from an `sg_oid` string.
pub fn group_id_of_oid(oid: &str) -> Result<GroupId> {
    let hex = oid
        .strip_prefix(SG_OID_PREFIX)
        .and_then(|s| s.strip_prefix('/'))
        .ok_or_else(|| SyncError::BadQuery(format!("not a syncgroup oid: {oid}")))?;
    GroupId::from_str_radix(hex, 16)
        .map_err(|_| SyncError::BadQuery(format!("not a syncgroup oid: {oid}")))
}

/// True if `oid` addresses syncgroup metadata rather than a data row.
pub fn is_sg_oid(oid: &str) -> bool {
    oid.starts_with(SG_OID_PREFIX)
}

/// True if `key` falls under `prefix`. Prefixes are plain string prefixes;
/// the nesting rules for generation vectors rely on the same relation.
pub fn prefix_covers(prefix: &str, key: &str) -> bool {
    key.starts_with(prefix)
}

// ============================================================================
// Batch info
// ============================================================================

/// Join a batch source tag and id into the flat form used in watch markers.
pub fn join_batch_info(batch_type: &str, batch_id: u64) -> String {
    format!("{batch_type}:{batch_id:016x}")
}

/// Split a flat batch marker back into (type, id).
pub fn split_batch_info(info: &str) -> Result<(String, u64)> {
    let (t, id_hex) = info
        .rsplit_once(':')
        .ok_or_else(|| SyncError::BadQuery(format!("malformed batch info: {info}")))?;
    let id = u64::from_str_radix(id_hex, 16)
        .map_err(|_| SyncError::BadQuery(format!("malformed batch info: {info}")))?;
    Ok((t.to_string(), id))
}

// ============================================================================
// Permissions
// ============================================================================

/// Access tags checked against syncgroup permissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessTag {
    Admin,
    Read,
    Write,
}

/// Blessing-pattern permission lists attached to a syncgroup spec.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Permissions {
    pub admin: Vec<String>,
    pub read: Vec<String>,
    pub write: Vec<String>,
}

impl Permissions {
    /// Everyone named in `patterns` gets all three tags.
    pub fn allow_all(patterns: &[&str]) -> Self {
        let v: Vec<String> = patterns.iter().map(|p| p.to_string()).collect();
        Self {
            admin: v.clone(),
            read: v.clone(),
            write: v,
        }
    }

    pub fn patterns(&self, tag: AccessTag) -> &[String] {
        match tag {
            AccessTag::Admin => &self.admin,
            AccessTag::Read => &self.read,
            AccessTag::Write => &self.write,
        }
    }
}

/// Principal/credential checking is an external collaborator; the engine
/// only ever asks whether a caller's blessings satisfy a permission set.
pub trait AccessChecker: Send + Sync {
    fn allowed(&self, perms: &Permissions, tag: AccessTag, blessings: &[String]) -> bool;
}

/// Default checker: a pattern matches a blessing that equals it or extends
/// it by `:`-separated components.
#[derive(Debug, Default)]
pub struct PatternAccessChecker;

impl PatternAccessChecker {
    fn matches(pattern: &str, blessing: &str) -> bool {
        blessing == pattern
            || blessing
                .strip_prefix(pattern)
                .is_some_and(|rest| rest.starts_with(':'))
    }
}

impl AccessChecker for PatternAccessChecker {
    fn allowed(&self, perms: &Permissions, tag: AccessTag, blessings: &[String]) -> bool {
        perms
            .patterns(tag)
            .iter()
            .any(|p| blessings.iter().any(|b| Self::matches(p, b)))
    }
}

// ============================================================================
// Clock
// ============================================================================

/// Time source for record update times. A networked implementation may fail
/// with `GetTimeFailed`; callers fall back to the local clock.
pub trait Clock: Send + Sync {
    fn now(&self) -> Result<DateTime<Utc>>;
}

/// Local wall clock.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Result<DateTime<Utc>> {
        Ok(Utc::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn app_db_round_trip() {
        for (a, d) in [("app", "db"), ("a", ""), ("", "d"), ("x y", "z/w")] {
            let joined = join_app_db(a, d).unwrap();
            assert_eq!(split_app_db(&joined).unwrap(), (a.to_string(), d.to_string()));
        }
    }

    #[test]
    fn app_db_rejects_separator() {
        assert!(join_app_db("a:b", "c").is_err());
        assert!(join_app_db("a", "b:c").is_err());
    }

    #[test]
    fn batch_info_round_trip() {
        for (t, id) in [("dl", 0u64), ("sgd", 42), ("x:y", u64::MAX)] {
            let joined = join_batch_info(t, id);
            assert_eq!(split_batch_info(&joined).unwrap(), (t.to_string(), id));
        }
    }

    #[test]
    fn sg_oid_round_trip() {
        let oid = sg_oid(0xdead_beef);
        assert!(is_sg_oid(&oid));
        assert_eq!(group_id_of_oid(&oid).unwrap(), 0xdead_beef);
        assert!(group_id_of_oid("/r/x").is_err());
    }

    #[test]
    fn prefix_cover_is_string_prefix() {
        assert!(prefix_covers("/r", "/r/x"));
        assert!(prefix_covers("/r", "/r"));
        assert!(!prefix_covers("/r/x", "/r"));
    }

    #[test]
    fn pattern_checker_matches_extensions() {
        let perms = Permissions::allow_all(&["root:alice"]);
        let checker = PatternAccessChecker;
        assert!(checker.allowed(&perms, AccessTag::Read, &["root:alice".into()]));
        assert!(checker.allowed(&perms, AccessTag::Read, &["root:alice:phone".into()]));
        assert!(!checker.allowed(&perms, AccessTag::Read, &["root:alicex".into()]));
        assert!(!checker.allowed(&perms, AccessTag::Read, &["root:bob".into()]));
    }
}
