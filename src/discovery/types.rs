//! Advertisement model and validation.

use std::collections::BTreeMap;

use uuid::Uuid;

use crate::error::{Result, SyncError};

/// Attribute naming the advertising peer.
pub const ATTR_PEER: &str = "peer";

/// Attribute listing the databases the peer will serve, `,`-separated.
pub const ATTR_DATABASES: &str = "dbs";

/// Derive a service UUID from an interface name (version-5 UUID).
pub fn service_uuid(interface_name: &str) -> Uuid {
    Uuid::new_v5(&Uuid::NAMESPACE_URL, interface_name.as_bytes())
}

/// One advertised service instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    pub service: Uuid,
    /// Random v4 id, stable for the lifetime of one advertisement.
    pub instance_id: String,
    /// Random stamp regenerated on every content change, so scanners can
    /// detect updates without diffing attributes.
    pub stamp: [u8; 8],
    pub attributes: BTreeMap<String, String>,
    /// Dialable addresses, packed with the wire codec on constrained media.
    pub addresses: Vec<String>,
    /// Set by scanners when the instance disappears.
    pub lost: bool,
}

impl Advertisement {
    pub fn new(
        service: Uuid,
        attributes: BTreeMap<String, String>,
        addresses: Vec<String>,
    ) -> Result<Self> {
        let mut stamp = [0u8; 8];
        getrandom::getrandom(&mut stamp)
            .map_err(|e| SyncError::BadAdvertisement(format!("rng: {e}")))?;
        let adv = Self {
            service,
            instance_id: uuid::Uuid::new_v4().simple().to_string(),
            stamp,
            attributes,
            addresses,
            lost: false,
        };
        adv.validate()?;
        Ok(adv)
    }

    /// Reject advertisements a scanner could not act on.
    pub fn validate(&self) -> Result<()> {
        if self.service.is_nil() {
            return Err(SyncError::BadAdvertisement("nil service uuid".to_string()));
        }
        if self.instance_id.is_empty() {
            return Err(SyncError::BadAdvertisement("empty instance id".to_string()));
        }
        if !self.lost && self.addresses.is_empty() {
            return Err(SyncError::BadAdvertisement("no addresses".to_string()));
        }
        Ok(())
    }

    /// Copy marked as removed, as delivered to scanners.
    pub fn as_lost(&self) -> Self {
        let mut adv = self.clone();
        adv.lost = true;
        adv
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sync_service() -> Uuid {
        service_uuid(super::super::SYNC_INTERFACE_NAME)
    }

    #[test]
    fn service_uuid_is_stable_and_v5() {
        let a = sync_service();
        let b = sync_service();
        assert_eq!(a, b);
        assert_eq!(a.get_version_num(), 5);
        assert_ne!(a, service_uuid("something-else"));
    }

    #[test]
    fn new_advertisement_validates() {
        let adv = Advertisement::new(
            sync_service(),
            BTreeMap::from([(ATTR_PEER.to_string(), "b".to_string())]),
            vec!["mt1/b".to_string()],
        )
        .unwrap();
        assert!(!adv.instance_id.is_empty());
        assert!(!adv.lost);
    }

    #[test]
    fn rejects_missing_addresses() {
        let err = Advertisement::new(sync_service(), BTreeMap::new(), vec![]);
        assert!(matches!(err, Err(SyncError::BadAdvertisement(_))));
    }

    #[test]
    fn lost_copy_keeps_identity() {
        let adv = Advertisement::new(sync_service(), BTreeMap::new(), vec!["a".to_string()])
            .unwrap();
        let lost = adv.as_lost();
        assert!(lost.lost);
        assert_eq!(lost.instance_id, adv.instance_id);
    }
}
