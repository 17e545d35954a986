//! Background task group.
//!
//! Every loop — watcher, initiator driver, publisher retry, membership
//! refresh, neighborhood gc, discovery — owns a shutdown receiver; shutdown
//! flips the watch channel and joins all tasks. Nothing outlives the
//! scheduler.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};

use crate::discovery::{service_uuid, DiscoveryPlugin, SYNC_INTERFACE_NAME};
use crate::error::SyncError;

use super::SyncEngine;

/// Owns the engine's background tasks.
pub struct SyncScheduler {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl SyncScheduler {
    /// Start background tasks for every database attached to `engine`.
    pub fn start(engine: SyncEngine) -> Self {
        Self::start_with_discovery(engine, None)
    }

    /// Start background tasks, plus advertise/scan loops on `plugin`.
    pub fn start_with_discovery(
        engine: SyncEngine,
        plugin: Option<Arc<dyn DiscoveryPlugin>>,
    ) -> Self {
        let (shutdown, done) = watch::channel(false);
        let mut handles = Vec::new();

        for db in engine.databases() {
            handles.push(spawn_watcher(engine.clone(), db.path.clone(), done.clone()));
            handles.push(spawn_initiator(engine.clone(), db.path.clone(), done.clone()));
            handles.push(spawn_publisher(engine.clone(), db.path.clone(), done.clone()));
        }
        handles.push(spawn_membership_refresh(engine.clone(), done.clone()));
        handles.push(spawn_neighborhood_gc(engine.clone(), done.clone()));

        if let Some(plugin) = plugin {
            handles.push(spawn_advertiser(engine.clone(), Arc::clone(&plugin), done.clone()));
            handles.push(spawn_scanner(engine, plugin, done));
        }

        Self { shutdown, handles }
    }

    /// Signal shutdown and wait for every task to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

fn ticker(period: Duration) -> tokio::time::Interval {
    let mut t = interval(period);
    t.set_missed_tick_behavior(MissedTickBehavior::Delay);
    t
}

async fn stopped(done: &mut watch::Receiver<bool>) -> bool {
    done.changed().await.is_err() || *done.borrow()
}

fn spawn_watcher(engine: SyncEngine, path: String, mut done: watch::Receiver<bool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = ticker(engine.cfg().watch_interval());
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    match engine.process_watch_queue(&path) {
                        Ok(_) => {}
                        Err(e @ SyncError::Corrupt(_)) => {
                            // Fatal for this database; the rest of the
                            // process keeps serving.
                            tracing::error!(db = %path, error = %e, "watcher stopping");
                            return;
                        }
                        Err(e) => tracing::warn!(db = %path, error = %e, "watcher pass failed"),
                    }
                }
                _ = done.changed() => {
                    if *done.borrow() {
                        return;
                    }
                }
            }
        }
    })
}

fn spawn_initiator(
    engine: SyncEngine,
    path: String,
    mut done: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = ticker(engine.cfg().sync_interval());
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    let Ok(db) = engine.db(&path) else { return };
                    let Some(peer) = engine.select_peer(&db) else { continue };
                    if let Err(e) = engine.sync_once(&path, &peer).await {
                        tracing::debug!(db = %path, peer, error = %e, "sync round failed");
                    }
                }
                _ = done.changed() => {
                    if *done.borrow() {
                        return;
                    }
                }
            }
        }
    })
}

fn spawn_publisher(
    engine: SyncEngine,
    path: String,
    mut done: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = ticker(engine.cfg().publish_retry_interval());
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    if let Err(e) = engine.publish_pending(&path).await {
                        tracing::debug!(db = %path, error = %e, "publish pass failed");
                    }
                }
                _ = done.changed() => {
                    if *done.borrow() {
                        return;
                    }
                }
            }
        }
    })
}

fn spawn_membership_refresh(engine: SyncEngine, mut done: watch::Receiver<bool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = ticker(crate::sync::membership::DEFAULT_MEMBER_VIEW_TTL);
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    let _ = engine.member_views();
                }
                _ = done.changed() => {
                    if *done.borrow() {
                        return;
                    }
                }
            }
        }
    })
}

fn spawn_neighborhood_gc(engine: SyncEngine, mut done: watch::Receiver<bool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = ticker(engine.cfg().neighborhood_gc_interval());
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    let collected = engine.neighborhood().gc();
                    if collected > 0 {
                        tracing::debug!(collected, "expired advertisements dropped");
                    }
                }
                _ = done.changed() => {
                    if *done.borrow() {
                        return;
                    }
                }
            }
        }
    })
}

fn spawn_advertiser(
    engine: SyncEngine,
    plugin: Arc<dyn DiscoveryPlugin>,
    done: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let adv = match engine.advertisement() {
            Ok(adv) => adv,
            Err(e) => {
                tracing::warn!(error = %e, "not advertising");
                return;
            }
        };
        if let Err(e) = plugin.advertise(done, adv).await {
            tracing::warn!(error = %e, "advertise loop failed");
        }
    })
}

fn spawn_scanner(
    engine: SyncEngine,
    plugin: Arc<dyn DiscoveryPlugin>,
    mut done: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let (found_tx, mut found_rx) = mpsc::channel(32);
        let scan_done = done.clone();
        let scanner = tokio::spawn(async move {
            if let Err(e) = plugin
                .scan(scan_done, service_uuid(SYNC_INTERFACE_NAME), found_tx)
                .await
            {
                tracing::warn!(error = %e, "scan loop failed");
            }
        });

        loop {
            tokio::select! {
                found = found_rx.recv() => {
                    match found {
                        Some(adv) => engine.neighborhood().update(adv),
                        None => break,
                    }
                }
                stop = stopped(&mut done) => {
                    if stop {
                        break;
                    }
                }
            }
        }
        let _ = scanner.await;
    })
}
