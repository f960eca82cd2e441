//! Per-client advertising/discovery/connection state (§3 "Client handle").

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::callback::ClientCallbackExecutor;
use crate::endpoint::{EndpointId, EndpointInfo};
use crate::options::{Medium, Strategy};
use crate::payload_manager::payload_manager::PayloadManager;
use crate::pcp::state::{ConnectionState, PendingConnection};

/// An endpoint this client has learned about, via discovery or
/// `inject_endpoint`, and may pass to `request_connection`.
#[derive(Clone, Debug)]
pub struct DiscoveredEndpoint {
    /// The name the advertiser registered with
    /// [`crate::mediums::platform::PlatformMediums::listen`].
    pub remote_address: String,
    pub medium: Medium,
    pub service_id: String,
    pub endpoint_name: EndpointInfo,
}

/// State kept while a client is advertising (§4.6, `LISTENING`).
pub(crate) struct AdvertisingState {
    pub(crate) service_id: String,
    pub(crate) medium: Medium,
    pub(crate) cancel: CancellationToken,
    pub(crate) accept_task: JoinHandle<()>,
}

/// State kept while a client is discovering (§4.6, `LISTENING`).
pub(crate) struct DiscoveryState {
    pub(crate) cancel: CancellationToken,
    pub(crate) poll_task: JoinHandle<()>,
}

/// All per-client state the controller tracks between `startAdvertising`/
/// `startDiscovery` and `stopAllEndpoints`. A client owns 0..1 active
/// [`Strategy`] (§3).
pub struct ClientSession {
    pub(crate) strategy: Option<Strategy>,
    pub(crate) local_endpoint_id: EndpointId,
    pub(crate) callbacks: Arc<ClientCallbackExecutor>,
    pub(crate) payload_manager: Arc<PayloadManager>,
    pub(crate) advertising: Option<AdvertisingState>,
    pub(crate) discovery: Option<DiscoveryState>,
    pub(crate) connections: HashMap<EndpointId, PendingConnection>,
    pub(crate) known_endpoints: HashMap<EndpointId, DiscoveredEndpoint>,
}

impl ClientSession {
    pub(crate) fn new(payload_manager_events: mpsc::UnboundedSender<crate::payload_manager::payload_manager::PayloadEvent>, endpoint_manager: Arc<crate::endpoint_manager::endpoint_manager::EndpointManager>) -> Self {
        Self {
            strategy: None,
            local_endpoint_id: EndpointId::generate(),
            callbacks: Arc::new(ClientCallbackExecutor::spawn()),
            payload_manager: PayloadManager::new(endpoint_manager, payload_manager_events),
            advertising: None,
            discovery: None,
            connections: HashMap::new(),
            known_endpoints: HashMap::new(),
        }
    }

    /// Locks this session's strategy to `wanted`, or confirms it already
    /// matches. Fails once a different strategy has been selected (§3:
    /// "a mismatch across calls yields `AlreadyHaveActiveStrategy`").
    pub(crate) fn lock_strategy(&mut self, wanted: Strategy) -> Result<(), ()> {
        match self.strategy {
            Some(existing) if existing != wanted => Err(()),
            Some(_) => Ok(()),
            None => {
                self.strategy = Some(wanted);
                Ok(())
            }
        }
    }

    /// Connections currently `ESTABLISHED`, for topology enforcement.
    pub(crate) fn established_count(&self) -> usize {
        self.connections.values().filter(|c| c.state == ConnectionState::Established).count()
    }

    /// Connections currently pending or established for the discoverer
    /// side's outbound limit (§4.6): anything not yet `REJECTED`/`CLOSED`.
    pub(crate) fn outbound_count(&self) -> usize {
        self.connections
            .values()
            .filter(|c| c.is_initiator && !matches!(c.state, ConnectionState::Rejected | ConnectionState::Closed))
            .count()
    }
}

impl std::fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession")
            .field("strategy", &self.strategy)
            .field("local_endpoint_id", &self.local_endpoint_id)
            .field("advertising", &self.advertising.is_some())
            .field("discovery", &self.discovery.is_some())
            .field("connections", &self.connections.len())
            .finish_non_exhaustive()
    }
}
