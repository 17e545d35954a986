//! Peer discovery: the advertise/scan plugin contract, the advertisement
//! model, an in-process mesh plugin, and the TTL-cached neighborhood view
//! that feeds peer selection.

mod mesh;
mod neighborhood;
mod types;

pub use mesh::{MeshNet, MeshPlugin};
pub use neighborhood::{Neighborhood, DEFAULT_ADVERTISEMENT_TTL};
pub use types::{service_uuid, Advertisement, ATTR_DATABASES, ATTR_PEER};

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::error::Result;

/// Interface name hashed into the sync service UUID.
pub const SYNC_INTERFACE_NAME: &str = "syncbase/peer-sync";

/// Neighborhood discovery plugin. Implementations map advertisements onto a
/// concrete medium (BLE, mDNS, an in-process mesh for tests); packet layout
/// is plugin-specific.
#[async_trait]
pub trait DiscoveryPlugin: Send + Sync {
    /// Make `adv` visible to nearby scanners until `done` signals shutdown,
    /// then withdraw it.
    async fn advertise(&self, done: watch::Receiver<bool>, adv: Advertisement) -> Result<()>;

    /// Emit the current set of advertisements for `service`, then adds and
    /// removes (`lost = true`) as they happen, until `done` signals
    /// shutdown.
    async fn scan(
        &self,
        done: watch::Receiver<bool>,
        service: Uuid,
        found: mpsc::Sender<Advertisement>,
    ) -> Result<()>;
}
