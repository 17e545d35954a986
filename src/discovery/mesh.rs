//! In-process mesh plugin.
//!
//! Advertisements live in a registry shared by every plugin handle; scanners
//! get the current set on subscribe and adds/removes as they happen. Stands
//! in for a radio medium in tests and single-host deployments.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::error::Result;

use super::types::Advertisement;
use super::DiscoveryPlugin;

#[derive(Default)]
struct MeshState {
    ads: HashMap<String, Advertisement>,
    subs: HashMap<u64, (Uuid, mpsc::Sender<Advertisement>)>,
    next_sub: u64,
}

/// Shared medium connecting every `MeshPlugin` cloned from it.
#[derive(Clone, Default)]
pub struct MeshNet {
    inner: Arc<Mutex<MeshState>>,
}

impl MeshNet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn plugin(&self) -> MeshPlugin {
        MeshPlugin { net: self.clone() }
    }

    fn subscribers(&self, service: Uuid) -> Vec<mpsc::Sender<Advertisement>> {
        self.inner
            .lock()
            .subs
            .values()
            .filter(|(s, _)| *s == service)
            .map(|(_, tx)| tx.clone())
            .collect()
    }

    async fn broadcast(&self, adv: &Advertisement) {
        for tx in self.subscribers(adv.service) {
            let _ = tx.send(adv.clone()).await;
        }
    }
}

/// Plugin handle over a `MeshNet`.
pub struct MeshPlugin {
    net: MeshNet,
}

async fn wait_done(mut done: watch::Receiver<bool>) {
    while !*done.borrow() {
        if done.changed().await.is_err() {
            return;
        }
    }
}

#[async_trait]
impl DiscoveryPlugin for MeshPlugin {
    async fn advertise(&self, done: watch::Receiver<bool>, adv: Advertisement) -> Result<()> {
        adv.validate()?;
        self.net
            .inner
            .lock()
            .ads
            .insert(adv.instance_id.clone(), adv.clone());
        self.net.broadcast(&adv).await;

        wait_done(done).await;

        self.net.inner.lock().ads.remove(&adv.instance_id);
        self.net.broadcast(&adv.as_lost()).await;
        Ok(())
    }

    async fn scan(
        &self,
        done: watch::Receiver<bool>,
        service: Uuid,
        found: mpsc::Sender<Advertisement>,
    ) -> Result<()> {
        let (sub_id, initial) = {
            let mut state = self.net.inner.lock();
            state.next_sub += 1;
            let sub_id = state.next_sub;
            state.subs.insert(sub_id, (service, found.clone()));
            let initial: Vec<Advertisement> = state
                .ads
                .values()
                .filter(|a| a.service == service)
                .cloned()
                .collect();
            (sub_id, initial)
        };
        for adv in initial {
            let _ = found.send(adv).await;
        }

        wait_done(done).await;

        self.net.inner.lock().subs.remove(&sub_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::{service_uuid, SYNC_INTERFACE_NAME};
    use std::collections::BTreeMap;

    fn adv(net_name: &str) -> Advertisement {
        Advertisement::new(
            service_uuid(SYNC_INTERFACE_NAME),
            BTreeMap::from([("peer".to_string(), net_name.to_string())]),
            vec![format!("mt1/{net_name}")],
        )
        .unwrap()
    }

    #[tokio::test]
    async fn scanner_sees_initial_set_and_removal() {
        let net = MeshNet::new();
        let service = service_uuid(SYNC_INTERFACE_NAME);
        let (stop_tx, stop_rx) = watch::channel(false);

        let advertisement = adv("b");
        let plugin = net.plugin();
        let ad_handle = {
            let advertisement = advertisement.clone();
            let done = stop_rx.clone();
            tokio::spawn(async move { plugin.advertise(done, advertisement).await })
        };
        // Let the advertisement land before subscribing.
        tokio::task::yield_now().await;

        let (found_tx, mut found_rx) = mpsc::channel(8);
        let scan_plugin = net.plugin();
        let scan_done = stop_rx.clone();
        let scan_handle =
            tokio::spawn(async move { scan_plugin.scan(scan_done, service, found_tx).await });

        let first = found_rx.recv().await.unwrap();
        assert_eq!(first.instance_id, advertisement.instance_id);
        assert!(!first.lost);

        stop_tx.send(true).unwrap();
        ad_handle.await.unwrap().unwrap();
        scan_handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn scanner_sees_adds_and_losses() {
        let net = MeshNet::new();
        let service = service_uuid(SYNC_INTERFACE_NAME);
        let (scan_stop_tx, scan_stop_rx) = watch::channel(false);
        let (ad_stop_tx, ad_stop_rx) = watch::channel(false);

        let (found_tx, mut found_rx) = mpsc::channel(8);
        let scan_plugin = net.plugin();
        let scan_handle = tokio::spawn(async move {
            scan_plugin.scan(scan_stop_rx, service, found_tx).await
        });
        tokio::task::yield_now().await;

        let advertisement = adv("c");
        let plugin = net.plugin();
        let ad_handle = {
            let advertisement = advertisement.clone();
            tokio::spawn(async move { plugin.advertise(ad_stop_rx, advertisement).await })
        };

        let added = found_rx.recv().await.unwrap();
        assert!(!added.lost);

        ad_stop_tx.send(true).unwrap();
        let removed = found_rx.recv().await.unwrap();
        assert!(removed.lost);
        assert_eq!(removed.instance_id, added.instance_id);

        ad_handle.await.unwrap().unwrap();
        scan_stop_tx.send(true).unwrap();
        scan_handle.await.unwrap().unwrap();
    }
}
