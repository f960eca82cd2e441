//! The crate's public facade (§6.1): one [`Core`] per process, shared by
//! every [`crate::endpoint::ClientId`] that calls into it.

use std::sync::Arc;

use crate::callback::{ConnectionLifecycleListener, DiscoveryListener, PayloadListener};
use crate::endpoint::{ClientId, EndpointId, EndpointInfo, OutOfBandMetadata};
use crate::error::Result;
use crate::mediums::platform::PlatformMediums;
use crate::options::ConnectionOptions;
use crate::payload::{Payload, PayloadId};
use crate::pcp::PcpController;
use crate::status::Status;

/// Entry point for advertising, discovery, and connection management.
///
/// Cheap to clone-by-reference (it's a thin handle over one shared
/// [`PcpController`]); applications typically construct one `Core` per
/// process and pass it, or clones of its inner `Arc`, to every client.
pub struct Core {
    controller: Arc<PcpController>,
}

impl Core {
    /// Builds a `Core` over the given platform binding. `mediums` is the
    /// only seam between this crate and an actual host platform — see
    /// [`PlatformMediums`].
    #[must_use]
    pub fn new(mediums: Arc<dyn PlatformMediums>) -> Self {
        Self { controller: PcpController::new(mediums) }
    }

    /// Begins advertising `service_id` under `options.strategy`, so nearby
    /// discoverers can find and connect to this client (§4.6).
    pub async fn start_advertising(
        &self,
        client: ClientId,
        service_id: String,
        options: ConnectionOptions,
        info: EndpointInfo,
        listener: Box<dyn ConnectionLifecycleListener>,
    ) -> Result<()> {
        self.controller.start_advertising(client, service_id, options, info, listener).await
    }

    /// Stops advertising for `client`, if it was advertising.
    pub async fn stop_advertising(&self, client: ClientId) -> Result<()> {
        self.controller.stop_advertising(client).await
    }

    /// Begins scanning for `service_id` advertisers (§4.6, §4.7).
    pub async fn start_discovery(
        &self,
        client: ClientId,
        service_id: String,
        options: ConnectionOptions,
        listener: Box<dyn DiscoveryListener>,
    ) -> Result<()> {
        self.controller.start_discovery(client, service_id, options, listener).await
    }

    /// Registers an endpoint learned outside this crate's own discovery
    /// loop (QR code, NFC, any other out-of-band channel), as if it had
    /// just been found by `start_discovery` (§6.1).
    pub async fn inject_endpoint(&self, client: ClientId, service_id: String, metadata: OutOfBandMetadata) -> Result<()> {
        self.controller.inject_endpoint(client, service_id, metadata).await
    }

    /// Stops discovery for `client`, if it was discovering.
    pub async fn stop_discovery(&self, client: ClientId) -> Result<()> {
        self.controller.stop_discovery(client).await
    }

    /// Dials a discovered or injected endpoint, starting the UKEY2
    /// handshake and `PENDING_AUTH` (§4.6, §4.8).
    pub async fn request_connection(&self, client: ClientId, endpoint_id: EndpointId, info: EndpointInfo, options: ConnectionOptions) -> Status {
        self.controller.request_connection(client, endpoint_id, info, options).await
    }

    /// Accepts a pending connection, completing `PENDING_AUTH` once the
    /// remote side has also accepted (§4.6).
    pub async fn accept_connection(&self, client: ClientId, endpoint_id: EndpointId, payload_listener: Box<dyn PayloadListener>) -> Status {
        self.controller.accept_connection(client, endpoint_id, payload_listener).await
    }

    /// Rejects a pending connection.
    pub async fn reject_connection(&self, client: ClientId, endpoint_id: EndpointId) -> Status {
        self.controller.reject_connection(client, endpoint_id).await
    }

    /// Requests a bandwidth upgrade for an established connection (§4.6).
    pub async fn initiate_bandwidth_upgrade(&self, client: ClientId, endpoint_id: EndpointId) -> Status {
        self.controller.initiate_bandwidth_upgrade(client, endpoint_id).await
    }

    /// Sends `payload` to every listed endpoint. The resulting
    /// [`PayloadId`] is delivered through the first `PayloadProgress`
    /// event, not returned here (§4.5, §6.1).
    pub async fn send_payload(&self, client: ClientId, endpoint_ids: Vec<EndpointId>, payload: Payload) -> Status {
        self.controller.send_payload(client, endpoint_ids, payload).await
    }

    /// Cancels an in-flight payload transfer.
    pub async fn cancel_payload(&self, client: ClientId, payload_id: PayloadId) -> Status {
        self.controller.cancel_payload(client, payload_id).await
    }

    /// Tears down one established connection.
    pub async fn disconnect_from_endpoint(&self, client: ClientId, endpoint_id: EndpointId) -> Status {
        self.controller.disconnect_from_endpoint(client, endpoint_id).await
    }

    /// Stops advertising, discovery, and every connection for `client` in
    /// one call (§6.1).
    pub async fn stop_all_endpoints(&self, client: ClientId) -> Status {
        self.controller.stop_all_endpoints(client).await
    }
}

impl std::fmt::Debug for Core {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Core").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mediums::platform::InMemoryMediums;
    use crate::options::{Medium, Strategy};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        initiated: Mutex<Option<EndpointId>>,
        accepted: Mutex<Option<EndpointId>>,
    }

    impl ConnectionLifecycleListener for Recorder {
        fn on_initiated(&self, endpoint_id: EndpointId, _auth_token: &str) {
            *self.initiated.lock().unwrap() = Some(endpoint_id);
        }
        fn on_accepted(&self, endpoint_id: EndpointId) {
            *self.accepted.lock().unwrap() = Some(endpoint_id);
        }
        fn on_bandwidth_changed(&self, _endpoint_id: EndpointId, _medium: Medium) {}
    }

    #[derive(Default)]
    struct FoundRecorder {
        found: Mutex<Option<EndpointId>>,
    }

    impl DiscoveryListener for FoundRecorder {
        fn on_endpoint_found(&self, endpoint_id: EndpointId, _endpoint_name: &EndpointInfo, _service_id: &str) {
            *self.found.lock().unwrap() = Some(endpoint_id);
        }
    }

    struct NoopPayloadListener;
    impl PayloadListener for NoopPayloadListener {}

    async fn wait_for<T: Clone>(f: impl Fn() -> Option<T>) -> T {
        for _ in 0..200 {
            if let Some(v) = f() {
                return v;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("condition never became true");
    }

    #[tokio::test]
    async fn full_handshake_between_advertiser_and_discoverer() {
        let mediums = InMemoryMediums::new();
        let core = Core::new(mediums);

        let advertiser = ClientId::generate();
        let discoverer = ClientId::generate();
        let adv_recorder = Arc::new(Recorder::default());
        let disc_recorder = Arc::new(Recorder::default());
        let found = Arc::new(FoundRecorder::default());

        core.start_advertising(
            advertiser,
            "svc".into(),
            ConnectionOptions::new(Strategy::P2pCluster),
            EndpointInfo::from("host"),
            Box::new(PassthroughConnection(Arc::clone(&adv_recorder))),
        )
        .await
        .unwrap();

        core.start_discovery(
            discoverer,
            "svc".into(),
            ConnectionOptions::new(Strategy::P2pCluster),
            Box::new(PassthroughDiscovery(Arc::clone(&found))),
        )
        .await
        .unwrap();

        let endpoint_id = wait_for(|| *found.found.lock().unwrap()).await;

        let status = core
            .request_connection(discoverer, endpoint_id, EndpointInfo::from("client"), ConnectionOptions::new(Strategy::P2pCluster))
            .await;
        assert_eq!(status, Status::Success);

        let advertiser_endpoint_id = wait_for(|| *adv_recorder.initiated.lock().unwrap()).await;

        assert_eq!(
            core.accept_connection(advertiser, advertiser_endpoint_id, Box::new(NoopPayloadListener)).await,
            Status::Success
        );
        assert_eq!(core.accept_connection(discoverer, endpoint_id, Box::new(NoopPayloadListener)).await, Status::Success);

        wait_for(|| *adv_recorder.accepted.lock().unwrap()).await;

        assert_eq!(core.disconnect_from_endpoint(discoverer, endpoint_id).await, Status::Success);
    }

    // `ConnectionLifecycleListener`/`DiscoveryListener` aren't `Clone`, so
    // the recorders above are shared through an `Arc` the listener wrapper
    // forwards to.
    struct PassthroughConnection(Arc<Recorder>);
    impl ConnectionLifecycleListener for PassthroughConnection {
        fn on_initiated(&self, endpoint_id: EndpointId, auth_token: &str) {
            self.0.on_initiated(endpoint_id, auth_token);
        }
        fn on_accepted(&self, endpoint_id: EndpointId) {
            self.0.on_accepted(endpoint_id);
        }
    }

    struct PassthroughDiscovery(Arc<FoundRecorder>);
    impl DiscoveryListener for PassthroughDiscovery {
        fn on_endpoint_found(&self, endpoint_id: EndpointId, endpoint_name: &EndpointInfo, service_id: &str) {
            self.0.on_endpoint_found(endpoint_id, endpoint_name, service_id);
        }
    }
}
