//! Advertising, discovery, and connection-lifecycle orchestration (§4.6).
//!
//! One [`PcpController`] is shared by every client of a [`crate::Core`]; it
//! owns the one [`ChannelManager`] and one [`EndpointManager`] common to all
//! of them (endpoint ids are unique process-wide in this crate) and a
//! per-client [`ClientSession`] table.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use nearlink_crypto::{HandshakeStep, InProcessHandshake, Ukey2Handshake};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::callback::{ConnectionLifecycleListener, DiscoveryListener, Event, PayloadListener};
use crate::channel::channel_manager::ChannelManager;
use crate::channel::endpoint_channel::{DisconnectReason, EndpointChannel};
use crate::endpoint::{EndpointId, EndpointInfo, OutOfBandMetadata};
use crate::endpoint_manager::endpoint_manager::{EndpointClosed, EndpointManager, IncomingFrame, KeepAliveParams};
use crate::error::{Error, Result};
use crate::mediums::platform::PlatformMediums;
use crate::options::{ConnectionOptions, Medium};
use crate::payload::{Payload, PayloadId};
use crate::payload_manager::payload_manager::PayloadEvent;
use crate::status::Status;
use crate::wire::{BandwidthUpgradeEvent, BleAdvertisement, ConnectionResponseStatus, OfflineFrame};

use super::bandwidth_upgrade;
use super::session::{AdvertisingState, ClientSession, DiscoveredEndpoint, DiscoveryState};
use super::state::{ConnectionState, PendingConnection};
use super::topology::{advertiser_accepts_more, discoverer_accepts_outbound};

/// How often a discovering client polls [`PlatformMediums::discover`] for
/// new advertisements (§4.7's "round" cadence, collapsed to a fixed timer
/// rather than the original's adaptive fast/slow schedule).
const DISCOVERY_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// The PCP state machine, topology enforcement, and connection lifecycle
/// for every client of one [`crate::Core`] (§4.6).
pub struct PcpController {
    pub(crate) mediums: Arc<dyn PlatformMediums>,
    pub(crate) channels: Arc<ChannelManager>,
    pub(crate) endpoints: Arc<EndpointManager>,
    pub(crate) sessions: AsyncMutex<HashMap<crate::endpoint::ClientId, ClientSession>>,
    /// Which client owns each currently-registered endpoint, for routing
    /// frames the shared [`EndpointManager`] dispatches.
    pub(crate) endpoint_owners: AsyncMutex<HashMap<EndpointId, crate::endpoint::ClientId>>,
    /// The `IncomingFrame`/`EndpointClosed` senders each endpoint's
    /// dispatch loop is draining, kept around so a bandwidth upgrade can
    /// restart [`EndpointManager`] on a new channel without orphaning that
    /// loop (`EndpointManager::start` takes fresh senders on every call).
    pub(crate) endpoint_signal_senders: AsyncMutex<HashMap<EndpointId, (mpsc::UnboundedSender<IncomingFrame>, mpsc::UnboundedSender<EndpointClosed>)>>,
}

type ClientId = crate::endpoint::ClientId;

impl PcpController {
    #[must_use]
    pub fn new(mediums: Arc<dyn PlatformMediums>) -> Arc<Self> {
        let channels = Arc::new(ChannelManager::new());
        let endpoints = Arc::new(EndpointManager::new(Arc::clone(&channels)));
        Arc::new(Self {
            mediums,
            channels,
            endpoints,
            sessions: AsyncMutex::new(HashMap::new()),
            endpoint_owners: AsyncMutex::new(HashMap::new()),
            endpoint_signal_senders: AsyncMutex::new(HashMap::new()),
        })
    }

    // -- advertising --------------------------------------------------

    pub async fn start_advertising(
        self: &Arc<Self>,
        client: ClientId,
        service_id: String,
        mut options: ConnectionOptions,
        info: EndpointInfo,
        listener: Box<dyn ConnectionLifecycleListener>,
    ) -> Result<()> {
        options.normalize();
        let medium = options.allowed_mediums.best().ok_or(Error::Medium { medium: Medium::Ble, reason: "no allowed medium".into() })?;

        let mut sessions = self.sessions.lock().await;
        let session = self.session_mut_or_default(&mut sessions, client);
        session.lock_strategy(options.strategy).map_err(|()| Error::AlreadyHaveActiveStrategy)?;
        if session.advertising.is_some() {
            return Err(Error::AlreadyAdvertising);
        }
        session.callbacks.set_connection_listener(listener).await;
        let local_endpoint_id = session.local_endpoint_id;
        let local_name = local_endpoint_id.as_str().to_string();

        self.mediums.listen(medium, &local_name).await?;
        let adv = BleAdvertisement {
            pcp: options.strategy,
            service_id_hash: BleAdvertisement::hash_service_id(&service_id),
            endpoint_id: local_endpoint_id,
            endpoint_name: info,
            bluetooth_mac: None,
        };
        if let Err(e) = self.mediums.advertise(medium, &service_id, &local_name, adv.to_bytes()).await {
            self.mediums.stop_listening(medium, &local_name).await;
            return Err(e);
        }

        let cancel = CancellationToken::new();
        let accept_task = {
            let controller = Arc::clone(self);
            let local_name = local_name.clone();
            let cancel = cancel.clone();
            let options = options.clone();
            tokio::spawn(async move { controller.accept_loop(client, medium, local_name, options, cancel).await })
        };

        session.advertising = Some(AdvertisingState { service_id, medium, cancel, accept_task });
        Ok(())
    }

    pub async fn stop_advertising(&self, client: ClientId) -> Result<()> {
        let mut sessions = self.sessions.lock().await;
        let Some(session) = sessions.get_mut(&client) else { return Ok(()) };
        if let Some(advertising) = session.advertising.take() {
            advertising.cancel.cancel();
            advertising.accept_task.abort();
            let local_name = session.local_endpoint_id.as_str().to_string();
            self.mediums.stop_advertising(advertising.medium, &advertising.service_id, &local_name).await;
            self.mediums.stop_listening(advertising.medium, &local_name).await;
        }
        Ok(())
    }

    async fn accept_loop(
        self: Arc<Self>,
        client: ClientId,
        medium: Medium,
        local_name: String,
        options: ConnectionOptions,
        cancel: CancellationToken,
    ) {
        loop {
            let stream = tokio::select! {
                () = cancel.cancelled() => return,
                result = self.mediums.accept(medium, &local_name) => result,
            };
            match stream {
                Ok(stream) => {
                    let controller = Arc::clone(&self);
                    let options = options.clone();
                    tokio::spawn(async move { controller.handle_inbound(client, medium, stream, options).await });
                }
                Err(e) => {
                    warn!(?client, error = %e, "advertiser accept loop failed, stopping");
                    return;
                }
            }
        }
    }

    async fn handle_inbound(
        self: Arc<Self>,
        client: ClientId,
        medium: Medium,
        stream: crate::mediums::platform::BoxedStream,
        options: ConnectionOptions,
    ) {
        let channel = Arc::new(EndpointChannel::new(medium, stream));
        let body = match channel.read().await {
            Ok(Some(body)) => body,
            _ => return,
        };
        let frame = match OfflineFrame::decode(&body) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "inbound connection opened with a non-decodable first frame");
                return;
            }
        };
        let OfflineFrame::ConnectionRequest { endpoint_id: remote_id, endpoint_name: remote_info, .. } = frame else {
            warn!("inbound connection's first frame was not a connection request");
            return;
        };

        let mut sessions = self.sessions.lock().await;
        let Some(session) = sessions.get_mut(&client) else { return };
        if let Some(strategy) = session.strategy {
            if !advertiser_accepts_more(strategy, session.established_count()) {
                debug!(?remote_id, "rejecting inbound connection, topology limit reached");
                let _ = channel.write(&OfflineFrame::ConnectionResponse { status: ConnectionResponseStatus::Reject }.encode()).await;
                return;
            }
        }
        if session.connections.contains_key(&remote_id) {
            debug!(?remote_id, "rejecting duplicate inbound connection request");
            return;
        }

        self.channels.register(remote_id, Arc::clone(&channel)).await;
        self.endpoint_owners.lock().await.insert(remote_id, client);
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = mpsc::unbounded_channel();
        self.endpoint_signal_senders.lock().await.insert(remote_id, (incoming_tx.clone(), closed_tx.clone()));
        self.endpoints
            .start(remote_id, channel, KeepAliveParams::from(&options), incoming_tx, closed_tx)
            .await;

        let handshake: Box<dyn Ukey2Handshake> = Box::new(InProcessHandshake::new(false));
        session.connections.insert(remote_id, PendingConnection::new(false, remote_info, handshake));
        drop(sessions);

        let controller = Arc::clone(&self);
        tokio::spawn(async move { controller.endpoint_dispatch_loop(client, remote_id, incoming_rx, closed_rx).await });
    }

    // -- discovery ------------------------------------------------------

    pub async fn start_discovery(
        self: &Arc<Self>,
        client: ClientId,
        service_id: String,
        mut options: ConnectionOptions,
        listener: Box<dyn DiscoveryListener>,
    ) -> Result<()> {
        options.normalize();
        let medium = options.allowed_mediums.best().ok_or(Error::Medium { medium: Medium::Ble, reason: "no allowed medium".into() })?;

        let mut sessions = self.sessions.lock().await;
        let session = self.session_mut_or_default(&mut sessions, client);
        session.lock_strategy(options.strategy).map_err(|()| Error::AlreadyHaveActiveStrategy)?;
        if session.discovery.is_some() {
            return Err(Error::AlreadyDiscovering);
        }
        session.callbacks.set_discovery_listener(listener).await;

        let cancel = CancellationToken::new();
        let poll_task = {
            let controller = Arc::clone(self);
            let service_id = service_id.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { controller.discovery_poll_loop(client, medium, service_id, cancel).await })
        };
        session.discovery = Some(DiscoveryState { cancel, poll_task });
        Ok(())
    }

    pub async fn stop_discovery(&self, client: ClientId) -> Result<()> {
        let mut sessions = self.sessions.lock().await;
        let Some(session) = sessions.get_mut(&client) else { return Ok(()) };
        if let Some(discovery) = session.discovery.take() {
            discovery.cancel.cancel();
            discovery.poll_task.abort();
        }
        Ok(())
    }

    async fn discovery_poll_loop(self: Arc<Self>, client: ClientId, medium: Medium, service_id: String, cancel: CancellationToken) {
        let mut tracker = crate::mediums::LostEntityTracker::<EndpointId>::new();
        let mut interval = tokio::time::interval(DISCOVERY_POLL_INTERVAL);
        loop {
            tokio::select! {
                () = cancel.cancelled() => return,
                _ = interval.tick() => {}
            }
            let payloads = match self.mediums.discover(medium, &service_id).await {
                Ok(payloads) => payloads,
                Err(e) => {
                    warn!(?client, error = %e, "discovery poll failed");
                    continue;
                }
            };

            let mut sessions = self.sessions.lock().await;
            let Some(session) = sessions.get_mut(&client) else { return };
            for bytes in &payloads {
                let Some(adv) = BleAdvertisement::from_bytes(bytes) else { continue };
                if adv.service_id_hash != BleAdvertisement::hash_service_id(&service_id) {
                    continue;
                }
                tracker.record_found(adv.endpoint_id);
                if !session.known_endpoints.contains_key(&adv.endpoint_id) {
                    session.known_endpoints.insert(
                        adv.endpoint_id,
                        DiscoveredEndpoint {
                            remote_address: adv.endpoint_id.as_str().to_string(),
                            medium,
                            service_id: service_id.clone(),
                            endpoint_name: adv.endpoint_name.clone(),
                        },
                    );
                    session
                        .callbacks
                        .send(Event::EndpointFound { endpoint_id: adv.endpoint_id, endpoint_name: adv.endpoint_name, service_id: service_id.clone() })
                        .await;
                }
            }
            for lost in tracker.compute_lost() {
                session.known_endpoints.remove(&lost);
                session.callbacks.send(Event::EndpointLost { endpoint_id: lost }).await;
            }
        }
    }

    pub async fn inject_endpoint(&self, client: ClientId, service_id: String, metadata: OutOfBandMetadata) -> Result<()> {
        let mut sessions = self.sessions.lock().await;
        let session = self.session_mut_or_default(&mut sessions, client);
        let medium = metadata.mediums.first().copied().unwrap_or(Medium::Bluetooth);
        session.known_endpoints.insert(
            metadata.endpoint_id,
            DiscoveredEndpoint {
                remote_address: metadata.remote_address,
                medium,
                service_id: service_id.clone(),
                endpoint_name: metadata.endpoint_name.clone(),
            },
        );
        session
            .callbacks
            .send(Event::EndpointFound { endpoint_id: metadata.endpoint_id, endpoint_name: metadata.endpoint_name, service_id })
            .await;
        Ok(())
    }

    // -- connection lifecycle -------------------------------------------

    pub async fn request_connection(self: &Arc<Self>, client: ClientId, endpoint_id: EndpointId, info: EndpointInfo, mut options: ConnectionOptions) -> Status {
        options.normalize();
        let (target, local_endpoint_id) = {
            let mut sessions = self.sessions.lock().await;
            let Some(session) = sessions.get_mut(&client) else { return Status::OutOfOrderApiCall };
            if session.connections.contains_key(&endpoint_id) {
                return Status::AlreadyConnectedToEndpoint;
            }
            if let Some(strategy) = session.strategy {
                if !discoverer_accepts_outbound(strategy, session.outbound_count()) {
                    return Status::AlreadyConnectedToEndpoint;
                }
            }
            let Some(target) = session.known_endpoints.get(&endpoint_id).cloned() else { return Status::EndpointUnknown };
            (target, session.local_endpoint_id)
        };

        // The dial itself may block for a while; it must not hold the
        // sessions lock other clients need (§4.6).
        let stream = match self.mediums.connect(target.medium, &target.remote_address).await {
            Ok(stream) => stream,
            Err(e) => return e.to_status(),
        };
        let channel = Arc::new(EndpointChannel::new(target.medium, stream));
        self.channels.register(endpoint_id, Arc::clone(&channel)).await;
        self.endpoint_owners.lock().await.insert(endpoint_id, client);
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = mpsc::unbounded_channel();
        self.endpoint_signal_senders.lock().await.insert(endpoint_id, (incoming_tx.clone(), closed_tx.clone()));
        self.endpoints.start(endpoint_id, channel, KeepAliveParams::from(&options), incoming_tx, closed_tx).await;

        let mut handshake: Box<dyn Ukey2Handshake> = Box::new(InProcessHandshake::new(true));
        let first_message = handshake.start();
        {
            let mut sessions = self.sessions.lock().await;
            let Some(session) = sessions.get_mut(&client) else {
                self.teardown_endpoint(endpoint_id, DisconnectReason::LocalDisconnection).await;
                return Status::OutOfOrderApiCall;
            };
            session.connections.insert(endpoint_id, PendingConnection::new(true, target.endpoint_name, handshake));
        }

        let nonce: u32 = rand::random();
        self.endpoints
            .send_control(endpoint_id, OfflineFrame::ConnectionRequest { endpoint_id: local_endpoint_id, endpoint_name: info, nonce, mediums: vec![target.medium] })
            .await;
        if let Some(message) = first_message {
            self.endpoints.send_control(endpoint_id, OfflineFrame::AuthenticationMessage { payload: message.into() }).await;
        }

        let controller = Arc::clone(self);
        tokio::spawn(async move { controller.endpoint_dispatch_loop(client, endpoint_id, incoming_rx, closed_rx).await });
        Status::Success
    }

    pub async fn accept_connection(&self, client: ClientId, endpoint_id: EndpointId, payload_listener: Box<dyn PayloadListener>) -> Status {
        let mut sessions = self.sessions.lock().await;
        let Some(session) = sessions.get_mut(&client) else { return Status::OutOfOrderApiCall };
        session.callbacks.set_payload_listener(payload_listener).await;
        let Some(connection) = session.connections.get_mut(&endpoint_id) else { return Status::EndpointUnknown };
        if connection.state != ConnectionState::PendingAuth {
            return Status::OutOfOrderApiCall;
        }
        connection.local_decision = Some(true);
        let both_accepted = connection.both_accepted();
        if both_accepted {
            connection.state = ConnectionState::Established;
        }
        let callbacks = Arc::clone(&session.callbacks);
        drop(sessions);

        self.endpoints.send_control(endpoint_id, OfflineFrame::ConnectionResponse { status: ConnectionResponseStatus::Accept }).await;
        if both_accepted {
            callbacks.send(Event::Accepted { endpoint_id }).await;
        }
        Status::Success
    }

    pub async fn reject_connection(&self, client: ClientId, endpoint_id: EndpointId) -> Status {
        let mut sessions = self.sessions.lock().await;
        let Some(session) = sessions.get_mut(&client) else { return Status::OutOfOrderApiCall };
        let Some(connection) = session.connections.get_mut(&endpoint_id) else { return Status::EndpointUnknown };
        if connection.state != ConnectionState::PendingAuth {
            return Status::OutOfOrderApiCall;
        }
        connection.local_decision = Some(false);
        connection.state = ConnectionState::Rejected;
        session.connections.remove(&endpoint_id);
        let callbacks = Arc::clone(&session.callbacks);
        drop(sessions);

        self.endpoints.send_control(endpoint_id, OfflineFrame::ConnectionResponse { status: ConnectionResponseStatus::Reject }).await;
        self.teardown_endpoint(endpoint_id, DisconnectReason::LocalDisconnection).await;
        callbacks.send(Event::Rejected { endpoint_id, status: Status::ConnectionRejected }).await;
        Status::Success
    }

    pub async fn disconnect_from_endpoint(&self, client: ClientId, endpoint_id: EndpointId) -> Status {
        let mut sessions = self.sessions.lock().await;
        let Some(session) = sessions.get_mut(&client) else { return Status::NotConnectedToEndpoint };
        if session.connections.remove(&endpoint_id).is_none() {
            return Status::NotConnectedToEndpoint;
        }
        let callbacks = Arc::clone(&session.callbacks);
        drop(sessions);

        self.teardown_endpoint(endpoint_id, DisconnectReason::LocalDisconnection).await;
        callbacks.send(Event::Disconnected { endpoint_id }).await;
        Status::Success
    }

    pub async fn stop_all_endpoints(&self, client: ClientId) -> Status {
        let _ = self.stop_advertising(client).await;
        let _ = self.stop_discovery(client).await;
        let endpoint_ids: Vec<EndpointId> = {
            let mut sessions = self.sessions.lock().await;
            let Some(session) = sessions.get_mut(&client) else { return Status::Success };
            session.connections.drain().map(|(id, _)| id).collect()
        };
        for endpoint_id in endpoint_ids {
            self.teardown_endpoint(endpoint_id, DisconnectReason::LocalDisconnection).await;
        }
        Status::Success
    }

    pub async fn initiate_bandwidth_upgrade(self: &Arc<Self>, client: ClientId, endpoint_id: EndpointId) -> Status {
        bandwidth_upgrade::initiate(self, client, endpoint_id).await
    }

    pub async fn send_payload(&self, client: ClientId, endpoint_ids: Vec<EndpointId>, payload: Payload) -> Status {
        let sessions = self.sessions.lock().await;
        let Some(session) = sessions.get(&client) else { return Status::NotConnectedToEndpoint };
        for endpoint_id in &endpoint_ids {
            match session.connections.get(endpoint_id) {
                Some(c) if c.state == ConnectionState::Established => {}
                _ => return Status::NotConnectedToEndpoint,
            }
        }
        let payload_manager = Arc::clone(&session.payload_manager);
        drop(sessions);
        payload_manager.send_payload(endpoint_ids, payload).await;
        Status::Success
    }

    pub async fn cancel_payload(&self, client: ClientId, payload_id: PayloadId) -> Status {
        let sessions = self.sessions.lock().await;
        let Some(session) = sessions.get(&client) else { return Status::PayloadUnknown };
        session.payload_manager.cancel_payload(payload_id).await
    }

    // -- shared plumbing --------------------------------------------------

    fn session_mut_or_default<'a>(&self, sessions: &'a mut HashMap<ClientId, ClientSession>, client: ClientId) -> &'a mut ClientSession {
        sessions.entry(client).or_insert_with(|| {
            let (events_tx, events_rx) = mpsc::unbounded_channel();
            let session = ClientSession::new(events_tx, Arc::clone(&self.endpoints));
            tokio::spawn(relay_payload_events(Arc::clone(&session.callbacks), events_rx));
            session
        })
    }

    async fn teardown_endpoint(&self, endpoint_id: EndpointId, reason: DisconnectReason) {
        self.endpoints.stop(endpoint_id).await;
        self.channels.unregister(endpoint_id, reason).await;
        self.endpoint_owners.lock().await.remove(&endpoint_id);
        self.endpoint_signal_senders.lock().await.remove(&endpoint_id);
    }

    async fn endpoint_dispatch_loop(
        self: Arc<Self>,
        client: ClientId,
        endpoint_id: EndpointId,
        mut incoming_rx: mpsc::UnboundedReceiver<IncomingFrame>,
        mut closed_rx: mpsc::UnboundedReceiver<EndpointClosed>,
    ) {
        loop {
            tokio::select! {
                frame = incoming_rx.recv() => {
                    match frame {
                        Some(IncomingFrame::Connection { frame, .. }) => self.handle_connection_frame(client, endpoint_id, frame).await,
                        Some(IncomingFrame::Payload { endpoint_id, packet_type, header, chunk }) => self.handle_payload_frame(client, endpoint_id, packet_type, header, chunk).await,
                        Some(IncomingFrame::BandwidthUpgrade { endpoint_id, event }) => self.handle_bandwidth_upgrade_event(client, endpoint_id, event).await,
                        None => return,
                    }
                }
                closed = closed_rx.recv() => {
                    match closed {
                        Some(closed) => {
                            self.handle_endpoint_closed(client, closed).await;
                            return;
                        }
                        None => return,
                    }
                }
            }
        }
    }

    async fn handle_payload_frame(&self, client: ClientId, endpoint_id: EndpointId, packet_type: crate::wire::PacketType, header: crate::wire::PayloadHeader, chunk: crate::wire::PayloadChunk) {
        let sessions = self.sessions.lock().await;
        let Some(session) = sessions.get(&client) else { return };
        let payload_manager = Arc::clone(&session.payload_manager);
        drop(sessions);
        payload_manager.handle_frame(endpoint_id, packet_type, header, chunk).await;
    }

    async fn handle_bandwidth_upgrade_event(self: &Arc<Self>, client: ClientId, endpoint_id: EndpointId, event: BandwidthUpgradeEvent) {
        match event {
            BandwidthUpgradeEvent::UpgradePathAvailable(info) => {
                bandwidth_upgrade::handle_upgrade_path_available(self, client, endpoint_id, info).await;
            }
            BandwidthUpgradeEvent::ClientIntroduction { .. }
            | BandwidthUpgradeEvent::LastWriteToPriorChannel
            | BandwidthUpgradeEvent::SafeToClosePriorChannel => {
                debug!(?endpoint_id, ?event, "bandwidth upgrade negotiation event handled out of band");
            }
        }
    }

    async fn handle_endpoint_closed(&self, client: ClientId, closed: EndpointClosed) {
        let EndpointClosed { endpoint_id, reason } = closed;
        self.endpoint_owners.lock().await.remove(&endpoint_id);
        self.endpoint_signal_senders.lock().await.remove(&endpoint_id);
        let mut sessions = self.sessions.lock().await;
        let Some(session) = sessions.get_mut(&client) else { return };
        let had_connection = session.connections.remove(&endpoint_id).is_some();
        let callbacks = Arc::clone(&session.callbacks);
        drop(sessions);
        if had_connection {
            debug!(?endpoint_id, ?reason, "endpoint channel closed");
            callbacks.send(Event::Disconnected { endpoint_id }).await;
        }
    }

    async fn handle_connection_frame(&self, client: ClientId, endpoint_id: EndpointId, frame: OfflineFrame) {
        match frame {
            OfflineFrame::AuthenticationMessage { payload } => self.handle_authentication_message(client, endpoint_id, &payload).await,
            OfflineFrame::ConnectionResponse { status } => self.handle_connection_response(client, endpoint_id, status).await,
            OfflineFrame::Disconnection => {
                self.teardown_endpoint(endpoint_id, DisconnectReason::RemoteDisconnection).await;
                let mut sessions = self.sessions.lock().await;
                if let Some(session) = sessions.get_mut(&client) {
                    let had_connection = session.connections.remove(&endpoint_id).is_some();
                    let callbacks = Arc::clone(&session.callbacks);
                    drop(sessions);
                    if had_connection {
                        callbacks.send(Event::Disconnected { endpoint_id }).await;
                    }
                }
            }
            OfflineFrame::ConnectionRequest { .. } => {
                warn!(?endpoint_id, "connection request arrived on an already-registered endpoint, ignoring");
            }
            OfflineFrame::KeepAlive | OfflineFrame::PayloadTransfer { .. } | OfflineFrame::BandwidthUpgradeNegotiation { .. } => {
                unreachable!("endpoint manager routes these to other IncomingFrame variants")
            }
        }
    }

    async fn handle_authentication_message(&self, client: ClientId, endpoint_id: EndpointId, payload: &[u8]) {
        let mut sessions = self.sessions.lock().await;
        let Some(session) = sessions.get_mut(&client) else { return };
        let Some(connection) = session.connections.get_mut(&endpoint_id) else { return };
        let step = connection.handshake.advance(payload);
        match step {
            HandshakeStep::SendAndContinue(bytes) => {
                drop(sessions);
                self.endpoints.send_control(endpoint_id, OfflineFrame::AuthenticationMessage { payload: bytes.into() }).await;
            }
            HandshakeStep::SendAndComplete(bytes, ctx) => {
                drop(sessions);
                self.endpoints.send_control(endpoint_id, OfflineFrame::AuthenticationMessage { payload: bytes.into() }).await;
                self.complete_handshake(client, endpoint_id, ctx).await;
            }
            HandshakeStep::Complete(ctx) => {
                drop(sessions);
                self.complete_handshake(client, endpoint_id, ctx).await;
            }
            HandshakeStep::Fail(e) => {
                warn!(?endpoint_id, error = %e, "handshake failed, rejecting connection");
                session.connections.remove(&endpoint_id);
                let callbacks = Arc::clone(&session.callbacks);
                drop(sessions);
                self.teardown_endpoint(endpoint_id, DisconnectReason::IoError).await;
                callbacks.send(Event::Rejected { endpoint_id, status: Status::Error }).await;
            }
        }
    }

    async fn complete_handshake(&self, client: ClientId, endpoint_id: EndpointId, ctx: nearlink_crypto::EncryptionContext) {
        let auth_token = ctx.short_auth_token().to_string();
        self.channels.encrypt(endpoint_id, ctx).await;
        let mut sessions = self.sessions.lock().await;
        let Some(session) = sessions.get_mut(&client) else { return };
        let Some(connection) = session.connections.get_mut(&endpoint_id) else { return };
        connection.auth_token = Some(auth_token.clone());
        let callbacks = Arc::clone(&session.callbacks);
        drop(sessions);
        callbacks.send(Event::Initiated { endpoint_id, auth_token }).await;
    }

    async fn handle_connection_response(&self, client: ClientId, endpoint_id: EndpointId, status: ConnectionResponseStatus) {
        let mut sessions = self.sessions.lock().await;
        let Some(session) = sessions.get_mut(&client) else { return };
        let Some(connection) = session.connections.get_mut(&endpoint_id) else { return };
        connection.remote_decision = Some(status == ConnectionResponseStatus::Accept);
        let callbacks = Arc::clone(&session.callbacks);

        if connection.either_rejected() {
            session.connections.remove(&endpoint_id);
            drop(sessions);
            self.teardown_endpoint(endpoint_id, DisconnectReason::RemoteDisconnection).await;
            callbacks.send(Event::Rejected { endpoint_id, status: Status::ConnectionRejected }).await;
        } else if connection.both_accepted() {
            connection.state = ConnectionState::Established;
            drop(sessions);
            callbacks.send(Event::Accepted { endpoint_id }).await;
        }
    }
}

async fn relay_payload_events(callbacks: Arc<crate::callback::ClientCallbackExecutor>, mut events_rx: mpsc::UnboundedReceiver<PayloadEvent>) {
    while let Some(event) = events_rx.recv().await {
        let event = match event {
            PayloadEvent::Received { endpoint_id, payload } => Event::PayloadReceived { endpoint_id, payload },
            PayloadEvent::Progress { endpoint_id, progress } => Event::PayloadProgress { endpoint_id, progress },
        };
        callbacks.send(event).await;
    }
}

impl std::fmt::Debug for PcpController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PcpController").finish_non_exhaustive()
    }
}
