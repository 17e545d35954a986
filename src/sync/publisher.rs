//! Syncgroup publish flow.
//!
//! A created syncgroup whose name designates another peer as admin stays
//! PublishPending until this task hands it over. `DupSyncgroupPublish`
//! means another admin already did it and the status will arrive through
//! metadata sync; transport failures leave the group pending for the next
//! tick.

use crate::error::{Result, SyncError};
use crate::types::{sg_oid, sg_space, GroupId};

use super::logstore;
use super::syncgroup;
use super::types::{GenVector, MemberInfo, SyncgroupStatus};
use super::{admin_of, Database, SyncEngine};

/// Attempt every pending publish in one database.
pub async fn publish_pending(engine: &SyncEngine, path: &str) -> Result<()> {
    let db = engine.db(path)?;
    for gid in syncgroup::list_group_ids(db.store.as_ref())? {
        let (sg, local, version) = {
            let mut tx = db.store.begin()?;
            let local = match syncgroup::get_local_state(tx.as_mut(), gid) {
                Ok(local) => local,
                Err(_) => {
                    tx.abort();
                    continue;
                }
            };
            let Ok((sg, version)) = syncgroup::get_current(tx.as_mut(), gid) else {
                tx.abort();
                continue;
            };
            tx.abort();
            (sg, local, version)
        };

        if local.remote_publisher || sg.status != SyncgroupStatus::PublishPending {
            continue;
        }
        let Some(admin) = admin_of(&sg.name) else {
            continue;
        };
        if admin == engine.name() {
            continue;
        }

        let genvec = GenVector::from([(sg_oid(gid), engine.sg_knowledge(path, gid)?)]);
        let addrs = engine.dial_addresses(&db, admin, &sg.spec.mount_tables);
        if addrs.is_empty() {
            tracing::debug!(sg = %sg.name, admin, "no route to publish, retrying later");
            continue;
        }

        let mut outcome: Result<String> = Err(SyncError::ConnFail(admin.to_string()));
        for addr in &addrs {
            match engine
                .transport()
                .publish_syncgroup(
                    addr,
                    engine.name(),
                    sg.clone(),
                    version.clone(),
                    genvec.clone(),
                )
                .await
            {
                Err(e @ (SyncError::ConnFail(_) | SyncError::DbOffline(_))) => {
                    outcome = Err(e);
                }
                other => {
                    outcome = other;
                    break;
                }
            }
        }

        match outcome {
            Ok(publishee) => {
                tracing::info!(sg = %sg.name, publishee, "syncgroup published");
                set_status(engine, &db, path, gid, SyncgroupStatus::Running, Some(publishee))?;
            }
            Err(SyncError::DupSyncgroupPublish(_)) => {
                // Another admin beat us to it; the Running status arrives
                // through metadata sync.
                tracing::debug!(sg = %sg.name, "already published elsewhere");
            }
            Err(SyncError::Exist(_)) => {
                let already_handed_over = sg.joiners.contains_key(admin);
                let status = if already_handed_over {
                    SyncgroupStatus::Running
                } else {
                    SyncgroupStatus::PublishRejected
                };
                tracing::warn!(sg = %sg.name, ?status, "publish collided with an existing group");
                set_status(engine, &db, path, gid, status, None)?;
            }
            Err(e) => {
                tracing::debug!(sg = %sg.name, error = %e, "publish failed, will retry");
            }
        }
    }
    Ok(())
}

fn set_status(
    engine: &SyncEngine,
    db: &Database,
    path: &str,
    gid: GroupId,
    status: SyncgroupStatus,
    new_joiner: Option<String>,
) -> Result<()> {
    let dev = engine.device_id()?;
    let mut tx = db.store.begin()?;
    let (mut sg, _) = syncgroup::get_current(tx.as_mut(), gid)?;
    sg.status = status;
    if let Some(joiner) = new_joiner {
        sg.joiners.entry(joiner).or_insert_with(MemberInfo::default);
    }
    let (gen, pos) = engine.with_state(path, |s| {
        logstore::reserve_gen_and_pos(s, &sg_space(gid), 1)
    })?;
    syncgroup::update_versioning(
        tx.as_mut(),
        &mut sg,
        syncgroup::SgWrite::Logged { dev, gen, pos },
        engine.now(),
    )?;
    tx.commit()?;
    engine.membership_changed();
    Ok(())
}
