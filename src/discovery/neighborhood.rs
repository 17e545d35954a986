//! TTL-cached view of scanned advertisements.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::types::{Advertisement, ATTR_PEER};

/// How long an advertisement stays usable without a refresh.
pub const DEFAULT_ADVERTISEMENT_TTL: Duration = Duration::from_secs(10);

struct Entry {
    adv: Advertisement,
    refreshed: Instant,
}

/// Advertisements seen by the scanner, garbage-collected by TTL.
pub struct Neighborhood {
    ttl: Duration,
    inner: Mutex<HashMap<String, Entry>>,
}

impl Neighborhood {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Fold one scan event into the view.
    pub fn update(&self, adv: Advertisement) {
        let mut inner = self.inner.lock();
        if adv.lost {
            inner.remove(&adv.instance_id);
        } else {
            inner.insert(
                adv.instance_id.clone(),
                Entry {
                    adv,
                    refreshed: Instant::now(),
                },
            );
        }
    }

    /// Drop expired advertisements; returns how many were collected.
    pub fn gc(&self) -> usize {
        let mut inner = self.inner.lock();
        let before = inner.len();
        inner.retain(|_, e| e.refreshed.elapsed() < self.ttl);
        before - inner.len()
    }

    /// All live advertisements.
    pub fn advertisements(&self) -> Vec<Advertisement> {
        self.inner.lock().values().map(|e| e.adv.clone()).collect()
    }

    /// Dialable addresses advertised by `peer`, if it is in the
    /// neighborhood.
    pub fn addresses_of(&self, peer: &str) -> Vec<String> {
        self.inner
            .lock()
            .values()
            .filter(|e| e.adv.attributes.get(ATTR_PEER).map(String::as_str) == Some(peer))
            .flat_map(|e| e.adv.addresses.iter().cloned())
            .collect()
    }
}

impl Default for Neighborhood {
    fn default() -> Self {
        Self::new(DEFAULT_ADVERTISEMENT_TTL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::{service_uuid, SYNC_INTERFACE_NAME};
    use std::collections::BTreeMap;

    fn adv(peer: &str) -> Advertisement {
        Advertisement::new(
            service_uuid(SYNC_INTERFACE_NAME),
            BTreeMap::from([(ATTR_PEER.to_string(), peer.to_string())]),
            vec![format!("mt1/{peer}")],
        )
        .unwrap()
    }

    #[test]
    fn update_and_lose() {
        let hood = Neighborhood::default();
        let a = adv("b");
        hood.update(a.clone());
        assert_eq!(hood.addresses_of("b"), vec!["mt1/b".to_string()]);

        hood.update(a.as_lost());
        assert!(hood.addresses_of("b").is_empty());
    }

    #[test]
    fn gc_collects_expired() {
        let hood = Neighborhood::new(Duration::ZERO);
        hood.update(adv("b"));
        assert_eq!(hood.gc(), 1);
        assert!(hood.advertisements().is_empty());
    }
}
