//! Peer RPC surface.
//!
//! The engine never owns sockets; a `PeerTransport` implementation carries
//! the three peer calls over whatever fabric the deployment uses. The
//! in-process loopback transport wires engines together for tests and
//! single-host setups.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::{Result, SyncError};
use crate::sync::types::{GenVector, LogRecord, MemberInfo, Syncgroup};
use crate::sync::SyncEngine;
use crate::types::{DbId, GroupId};

// ============================================================================
// Delta exchange messages
// ============================================================================

/// Knowledge summary sent by an initiator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DeltaReq {
    /// Pull data-space deltas for the named syncgroups.
    Data {
        app: String,
        db: String,
        sg_ids: BTreeSet<GroupId>,
        init_vec: GenVector,
    },
    /// Pull syncgroup-metadata deltas; `init_vec` is keyed by syncgroup oid.
    Sg {
        app: String,
        db: String,
        init_vec: GenVector,
    },
}

impl DeltaReq {
    pub fn db_path(&self) -> Result<String> {
        match self {
            DeltaReq::Data { app, db, .. } | DeltaReq::Sg { app, db, .. } => {
                crate::types::join_app_db(app, db)
            }
        }
    }
}

/// One message of a responder's delta stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DeltaResp {
    Start,
    Rec(LogRecord),
    /// The responder's frozen knowledge for each requested prefix.
    RespVec(GenVector),
    Finish,
}

/// Receiving half of a delta stream.
pub struct DeltaStream {
    rx: mpsc::Receiver<DeltaResp>,
}

impl DeltaStream {
    pub fn new(rx: mpsc::Receiver<DeltaResp>) -> Self {
        Self { rx }
    }

    /// Next message; `None` once the responder is done or gone.
    pub async fn next(&mut self) -> Option<DeltaResp> {
        self.rx.recv().await
    }
}

/// Channel capacity for delta streams.
pub const DELTA_STREAM_DEPTH: usize = 64;

// ============================================================================
// Transport
// ============================================================================

/// Client side of the peer RPC surface. `addr` is one dialable address,
/// usually `<mount table>/<peer name>`.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn get_deltas(&self, addr: &str, initiator: &str, req: DeltaReq)
        -> Result<DeltaStream>;

    /// Hand a newly created syncgroup to the peer named in its name.
    /// Returns the peer's name.
    async fn publish_syncgroup(
        &self,
        addr: &str,
        publisher: &str,
        sg: Syncgroup,
        version: String,
        genvec: GenVector,
    ) -> Result<String>;

    /// Join `sg_name` at its admin. Returns the current syncgroup, its
    /// entry version, and the admin's syncgroup-space knowledge.
    async fn join_syncgroup_at_admin(
        &self,
        addr: &str,
        joiner: &str,
        db: &DbId,
        sg_name: &str,
        info: MemberInfo,
    ) -> Result<(Syncgroup, String, GenVector)>;
}

// ============================================================================
// Loopback transport
// ============================================================================

/// Routing table connecting in-process engines: route string → engine.
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    routes: Arc<Mutex<HashMap<String, SyncEngine>>>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `engine` under `<mt>/<name>` for each mount table.
    pub fn register(&self, engine: &SyncEngine, name: &str, mount_tables: &[String]) {
        let mut routes = self.routes.lock();
        for mt in mount_tables {
            routes.insert(format!("{mt}/{name}"), engine.clone());
        }
    }

    /// Drop a route, simulating an unreachable mount table.
    pub fn unregister(&self, route: &str) {
        self.routes.lock().remove(route);
    }

    pub fn transport(&self) -> Arc<dyn PeerTransport> {
        Arc::new(LoopbackTransport { net: self.clone() })
    }

    fn resolve(&self, addr: &str) -> Result<SyncEngine> {
        self.routes
            .lock()
            .get(addr)
            .cloned()
            .ok_or_else(|| SyncError::ConnFail(addr.to_string()))
    }
}

struct LoopbackTransport {
    net: LoopbackNetwork,
}

#[async_trait]
impl PeerTransport for LoopbackTransport {
    async fn get_deltas(
        &self,
        addr: &str,
        initiator: &str,
        req: DeltaReq,
    ) -> Result<DeltaStream> {
        let engine = self.net.resolve(addr)?;
        let (tx, rx) = mpsc::channel(DELTA_STREAM_DEPTH);
        let caller = initiator.to_string();
        tokio::spawn(async move {
            if let Err(e) = engine.handle_get_deltas(&caller, req, tx).await {
                tracing::debug!(error = %e, "responder dropped delta stream");
            }
        });
        Ok(DeltaStream::new(rx))
    }

    async fn publish_syncgroup(
        &self,
        addr: &str,
        publisher: &str,
        sg: Syncgroup,
        version: String,
        genvec: GenVector,
    ) -> Result<String> {
        let engine = self.net.resolve(addr)?;
        engine
            .handle_publish_syncgroup(publisher, sg, version, genvec)
            .await
    }

    async fn join_syncgroup_at_admin(
        &self,
        addr: &str,
        joiner: &str,
        db: &DbId,
        sg_name: &str,
        info: MemberInfo,
    ) -> Result<(Syncgroup, String, GenVector)> {
        let engine = self.net.resolve(addr)?;
        engine
            .handle_join_syncgroup_at_admin(joiner, db, sg_name, info)
            .await
    }
}
