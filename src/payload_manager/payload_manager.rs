//! Outgoing/incoming payload state, fragmentation, flow control, and
//! progress (§4.5).

pub mod incoming;
pub mod outgoing;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::warn;

use crate::endpoint::EndpointId;
use crate::endpoint_manager::endpoint_manager::EndpointManager;
use crate::payload::{Payload, PayloadId, PayloadProgress, ReceivedPayload, TransferStatus};
use crate::status::Status;
use crate::wire::{ControlMarker, PacketType, PayloadChunk, PayloadHeader};

use incoming::IncomingTransfer;
use outgoing::OutgoingTransfer;

/// One notification the payload manager raises to its owner (the core's
/// client callback dispatch), mirroring `payload_cb` / `payload_progress_cb`
/// (§4.4, §4.5).
#[derive(Debug)]
pub enum PayloadEvent {
    Received { endpoint_id: EndpointId, payload: ReceivedPayload },
    Progress { endpoint_id: EndpointId, progress: PayloadProgress },
}

/// Fragments outgoing payloads, reassembles incoming ones, and reports
/// progress, keyed by `(client, endpoint)` per the base spec — in this
/// crate, one `PayloadManager` instance exists per client, so the key
/// collapses to `endpoint_id` alone (and, for the incoming table,
/// `(endpoint_id, payload_id)`).
pub struct PayloadManager {
    endpoint_manager: Arc<EndpointManager>,
    outgoing: AsyncMutex<HashMap<PayloadId, Arc<AsyncMutex<OutgoingTransfer>>>>,
    incoming: AsyncMutex<HashMap<(EndpointId, PayloadId), IncomingTransfer>>,
    events: mpsc::UnboundedSender<PayloadEvent>,
}

impl PayloadManager {
    #[must_use]
    pub fn new(endpoint_manager: Arc<EndpointManager>, events: mpsc::UnboundedSender<PayloadEvent>) -> Arc<Self> {
        Arc::new(Self { endpoint_manager, outgoing: AsyncMutex::new(HashMap::new()), incoming: AsyncMutex::new(HashMap::new()), events })
    }

    /// Starts sending `payload` to every endpoint in `endpoint_ids`, moving
    /// it (§3: "payloads are move-only"). Returns the id the client should
    /// use with [`PayloadManager::cancel_payload`]; the send itself
    /// proceeds in the background and is reported via
    /// [`PayloadEvent::Progress`].
    pub async fn send_payload(self: &Arc<Self>, endpoint_ids: Vec<EndpointId>, payload: Payload) -> PayloadId {
        let payload_id = PayloadId::generate();
        let (transfer, progress_rx) =
            outgoing::spawn_send(payload_id, payload, endpoint_ids, Arc::clone(&self.endpoint_manager));
        self.outgoing.lock().await.insert(payload_id, Arc::clone(&transfer));
        tokio::spawn(Arc::clone(self).relay_outgoing_progress(payload_id, transfer, progress_rx));
        payload_id
    }

    async fn relay_outgoing_progress(
        self: Arc<Self>,
        payload_id: PayloadId,
        transfer: Arc<AsyncMutex<OutgoingTransfer>>,
        mut progress_rx: mpsc::UnboundedReceiver<outgoing::OutgoingProgress>,
    ) {
        while let Some(update) = progress_rx.recv().await {
            let _ = self.events.send(PayloadEvent::Progress { endpoint_id: update.endpoint_id, progress: update.progress });
        }
        if transfer.lock().await.is_finished() {
            self.outgoing.lock().await.remove(&payload_id);
        }
    }

    /// `CancelPayload(id)` (§4.5): idempotent, acknowledgement-free. Sends a
    /// CONTROL/CANCEL chunk to every endpoint this payload is still being
    /// sent to.
    pub async fn cancel_payload(&self, payload_id: PayloadId) -> Status {
        match self.outgoing.lock().await.get(&payload_id) {
            Some(transfer) => {
                transfer.lock().await.cancel.cancel();
                Status::Success
            }
            None => Status::PayloadUnknown,
        }
    }

    /// Handles one classified `PAYLOAD_TRANSFER` frame from an endpoint's
    /// reader task.
    pub async fn handle_frame(&self, endpoint_id: EndpointId, packet_type: PacketType, header: PayloadHeader, chunk: PayloadChunk) {
        let Some(payload_id) = PayloadId::from_raw(header.id) else {
            warn!(endpoint_id = ?endpoint_id, "payload transfer frame carried reserved id 0");
            return;
        };

        match packet_type {
            PacketType::Control(ControlMarker::Cancel) => self.abort_incoming(endpoint_id, payload_id, TransferStatus::Cancelled).await,
            PacketType::Control(ControlMarker::PayloadError) => self.abort_incoming(endpoint_id, payload_id, TransferStatus::Failure).await,
            PacketType::Data => self.apply_incoming_chunk(endpoint_id, payload_id, header, chunk).await,
        }
    }

    async fn apply_incoming_chunk(&self, endpoint_id: EndpointId, payload_id: PayloadId, header: PayloadHeader, chunk: PayloadChunk) {
        let key = (endpoint_id, payload_id);
        let mut incoming = self.incoming.lock().await;
        if !incoming.contains_key(&key) {
            let (transfer, received) = IncomingTransfer::start(payload_id, header.kind, header.total_size).await;
            incoming.insert(key, transfer);
            if let Some(received) = received {
                let _ = self.events.send(PayloadEvent::Received { endpoint_id, payload: received });
            }
        }
        let transfer = incoming.get_mut(&key).expect("just inserted above");
        if transfer.cancelled {
            return;
        }
        let is_last = transfer.apply_chunk(chunk.offset, chunk.body, chunk.last).await;
        let status = if is_last { TransferStatus::Success } else { TransferStatus::InProgress };
        let progress = transfer.progress(payload_id, status);

        if is_last {
            if let Some(received) = transfer.take_received(payload_id).await {
                let _ = self.events.send(PayloadEvent::Received { endpoint_id, payload: received });
            }
            incoming.remove(&key);
        }
        drop(incoming);
        let _ = self.events.send(PayloadEvent::Progress { endpoint_id, progress });
    }

    async fn abort_incoming(&self, endpoint_id: EndpointId, payload_id: PayloadId, status: TransferStatus) {
        let key = (endpoint_id, payload_id);
        let mut incoming = self.incoming.lock().await;
        if let Some(mut transfer) = incoming.remove(&key) {
            transfer.cancelled = true;
            let progress = transfer.progress(payload_id, status);
            drop(incoming);
            let _ = self.events.send(PayloadEvent::Progress { endpoint_id, progress });
        }
    }
}

impl std::fmt::Debug for PayloadManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PayloadManager").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::channel_manager::ChannelManager;
    use crate::endpoint_manager::endpoint_manager::KeepAliveParams;
    use crate::mediums::platform::{InMemoryMediums, PlatformMediums};
    use crate::options::Medium;

    type IncomingFrame = crate::endpoint_manager::endpoint_manager::IncomingFrame;

    async fn wired_pair() -> (Arc<EndpointManager>, Arc<EndpointManager>, EndpointId, mpsc::UnboundedReceiver<IncomingFrame>) {
        let mediums = InMemoryMediums::new();
        let id = EndpointId::from_bytes(*b"ABCD");
        mediums.listen(Medium::WifiLan, "s").await.unwrap();
        let accept = {
            let mediums = Arc::clone(&mediums);
            tokio::spawn(async move { mediums.accept(Medium::WifiLan, "s").await.unwrap() })
        };
        let client_stream = mediums.connect(Medium::WifiLan, "s").await.unwrap();
        let server_stream = accept.await.unwrap();

        let client_channels = Arc::new(ChannelManager::new());
        let server_channels = Arc::new(ChannelManager::new());
        client_channels.register(id, Arc::new(crate::channel::endpoint_channel::EndpointChannel::new(Medium::WifiLan, client_stream))).await;
        server_channels.register(id, Arc::new(crate::channel::endpoint_channel::EndpointChannel::new(Medium::WifiLan, server_stream))).await;

        let client_em = Arc::new(EndpointManager::new(client_channels.clone()));
        let server_em = Arc::new(EndpointManager::new(server_channels.clone()));

        let (client_incoming_tx, _client_incoming_rx) = mpsc::unbounded_channel();
        let (client_closed_tx, _client_closed_rx) = mpsc::unbounded_channel();
        client_em.start(id, client_channels.get(id).await.unwrap(), KeepAliveParams::default(), client_incoming_tx, client_closed_tx).await;

        let (server_incoming_tx, server_incoming_rx) = mpsc::unbounded_channel();
        let (server_closed_tx, _server_closed_rx) = mpsc::unbounded_channel();
        server_em.start(id, server_channels.get(id).await.unwrap(), KeepAliveParams::default(), server_incoming_tx, server_closed_tx).await;

        (client_em, server_em, id, server_incoming_rx)
    }

    #[tokio::test]
    async fn bytes_payload_is_delivered_and_progress_reported() {
        let (client_em, server_em, id, mut server_incoming_rx) = wired_pair().await;

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let payload_manager = PayloadManager::new(Arc::clone(&client_em), events_tx);

        let payload_id = payload_manager.send_payload(vec![id], Payload::Bytes(b"hello".to_vec())).await;
        let _ = payload_id;

        // Drain frames arriving at the server's endpoint manager into the
        // server-side payload manager, as the core's dispatch loop would.
        let (recv_events_tx, mut recv_events_rx) = mpsc::unbounded_channel();
        let server_payload_manager = PayloadManager::new(Arc::clone(&server_em), recv_events_tx);
        let frame = server_incoming_rx.recv().await.unwrap();
        if let IncomingFrame::Payload { endpoint_id, packet_type, header, chunk } = frame {
            server_payload_manager.handle_frame(endpoint_id, packet_type, header, chunk).await;
        }
        // last-chunk marker
        let frame = server_incoming_rx.recv().await.unwrap();
        if let IncomingFrame::Payload { endpoint_id, packet_type, header, chunk } = frame {
            server_payload_manager.handle_frame(endpoint_id, packet_type, header, chunk).await;
        }

        let received = recv_events_rx.recv().await.unwrap();
        match received {
            PayloadEvent::Received { payload: ReceivedPayload::Bytes { data, .. }, .. } => {
                assert_eq!(data, b"hello");
            }
            other => panic!("unexpected event: {other:?}"),
        }

        let progress = events_rx.recv().await.unwrap();
        match progress {
            PayloadEvent::Progress { progress, .. } => assert_eq!(progress.bytes_transferred, 5),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
