//! Per-endpoint reader/writer tasks and frame dispatch (§4.4).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::channel::channel_manager::ChannelManager;
use crate::channel::endpoint_channel::{DisconnectReason, SharedChannel};
use crate::endpoint::EndpointId;
use crate::options::{ConnectionOptions, DEFAULT_KEEP_ALIVE_INTERVAL_MILLIS, DEFAULT_KEEP_ALIVE_TIMEOUT_MILLIS};
use crate::wire::{BandwidthUpgradeEvent, OfflineFrame, PacketType, PayloadChunk, PayloadHeader};

/// Bound on each endpoint's writer queue (§4.5, "a bounded high-water
/// mark"): once this many frames of one priority are queued, the sender
/// (`send_control`/`send_data`) blocks until the writer task drains one,
/// giving outbound payload chunks real flow control instead of an
/// unbounded backlog.
const WRITER_QUEUE_CAPACITY: usize = 8;

/// Keep-alive timing, validated per §4.4: `0 < interval < timeout`,
/// otherwise the defaults are substituted.
#[derive(Clone, Copy, Debug)]
pub struct KeepAliveParams {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for KeepAliveParams {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(DEFAULT_KEEP_ALIVE_INTERVAL_MILLIS),
            timeout: Duration::from_millis(DEFAULT_KEEP_ALIVE_TIMEOUT_MILLIS),
        }
    }
}

impl From<&ConnectionOptions> for KeepAliveParams {
    fn from(opts: &ConnectionOptions) -> Self {
        let interval_ms = opts.keep_alive_interval_millis;
        let timeout_ms = opts.keep_alive_timeout_millis;
        if interval_ms == 0 || interval_ms >= timeout_ms {
            Self::default()
        } else {
            Self { interval: Duration::from_millis(interval_ms), timeout: Duration::from_millis(timeout_ms) }
        }
    }
}

/// A frame classified by the reader task and handed to whichever subsystem
/// owns that frame kind (§4.4 step 2). `CONNECTION_REQUEST`/`_RESPONSE`
/// route to the PCP controller via the `Connection` variant.
#[derive(Debug)]
pub enum IncomingFrame {
    Connection { endpoint_id: EndpointId, frame: OfflineFrame },
    Payload { endpoint_id: EndpointId, packet_type: PacketType, header: PayloadHeader, chunk: PayloadChunk },
    BandwidthUpgrade { endpoint_id: EndpointId, event: BandwidthUpgradeEvent },
}

/// Reported by a torn-down endpoint's reader/writer pair so the owner (the
/// PCP controller, via the core) can run `disconnected_cb` and clean up
/// payload/channel state.
#[derive(Debug)]
pub struct EndpointClosed {
    pub endpoint_id: EndpointId,
    pub reason: DisconnectReason,
}

struct RunningEndpoint {
    control_tx: mpsc::Sender<OfflineFrame>,
    data_tx: mpsc::Sender<OfflineFrame>,
    cancel: CancellationToken,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

/// Starts and tracks the reader/writer task pair for every registered
/// endpoint (§4.4).
pub struct EndpointManager {
    channels: Arc<ChannelManager>,
    running: AsyncMutex<HashMap<EndpointId, RunningEndpoint>>,
}

impl EndpointManager {
    #[must_use]
    pub fn new(channels: Arc<ChannelManager>) -> Self {
        Self { channels, running: AsyncMutex::new(HashMap::new()) }
    }

    /// Starts the reader and writer tasks for `endpoint_id`, whose channel
    /// must already be registered with the shared [`ChannelManager`].
    /// `incoming` receives every classified frame; `closed` receives exactly
    /// one [`EndpointClosed`] when either task observes a permanent channel
    /// failure or a clean disconnection.
    pub async fn start(
        &self,
        endpoint_id: EndpointId,
        channel: SharedChannel,
        keep_alive: KeepAliveParams,
        incoming: mpsc::UnboundedSender<IncomingFrame>,
        closed: mpsc::UnboundedSender<EndpointClosed>,
    ) {
        let cancel = CancellationToken::new();
        let (control_tx, control_rx) = mpsc::channel(WRITER_QUEUE_CAPACITY);
        let (data_tx, data_rx) = mpsc::channel(WRITER_QUEUE_CAPACITY);

        let reader = tokio::spawn(reader_loop(endpoint_id, channel.clone(), cancel.clone(), incoming, closed.clone()));
        let writer = tokio::spawn(writer_loop(endpoint_id, channel, cancel.clone(), control_rx, data_rx, keep_alive, closed));

        let previous = self.running.lock().await.insert(
            endpoint_id,
            RunningEndpoint { control_tx, data_tx, cancel, reader, writer },
        );
        if let Some(previous) = previous {
            warn!(?endpoint_id, "starting tasks for an endpoint that already had running tasks");
            previous.cancel.cancel();
        }
    }

    /// Enqueues a control-priority frame (connection request/response,
    /// disconnection, bandwidth-upgrade negotiation, keep-alive). Control
    /// frames always preempt pending payload chunks from the same writer
    /// (§4.4).
    pub async fn send_control(&self, endpoint_id: EndpointId, frame: OfflineFrame) -> bool {
        let tx = match self.running.lock().await.get(&endpoint_id) {
            Some(running) => running.control_tx.clone(),
            None => return false,
        };
        tx.send(frame).await.is_ok()
    }

    /// Enqueues a data-priority frame (an ordinary payload chunk). Blocks
    /// (without holding the endpoint table lock) once this endpoint's data
    /// queue is at [`WRITER_QUEUE_CAPACITY`], so a payload sender
    /// backpressures on a slow channel instead of piling up frames in
    /// memory (§4.5).
    pub async fn send_data(&self, endpoint_id: EndpointId, frame: OfflineFrame) -> bool {
        let tx = match self.running.lock().await.get(&endpoint_id) {
            Some(running) => running.data_tx.clone(),
            None => return false,
        };
        tx.send(frame).await.is_ok()
    }

    /// Cancels and drops the reader/writer pair for `endpoint_id`. Does not
    /// itself touch the channel manager; callers unregister separately.
    pub async fn stop(&self, endpoint_id: EndpointId) {
        if let Some(running) = self.running.lock().await.remove(&endpoint_id) {
            running.cancel.cancel();
            let _ = running.reader.await;
            let _ = running.writer.await;
        }
    }

    pub async fn is_running(&self, endpoint_id: EndpointId) -> bool {
        self.running.lock().await.contains_key(&endpoint_id)
    }
}

impl std::fmt::Debug for EndpointManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointManager").finish_non_exhaustive()
    }
}

async fn reader_loop(
    endpoint_id: EndpointId,
    channel: SharedChannel,
    cancel: CancellationToken,
    incoming: mpsc::UnboundedSender<IncomingFrame>,
    closed: mpsc::UnboundedSender<EndpointClosed>,
) {
    let reason = loop {
        let body = tokio::select! {
            () = cancel.cancelled() => break DisconnectReason::Shutdown,
            result = channel.read() => result,
        };
        match body {
            Ok(Some(bytes)) => match OfflineFrame::decode(&bytes) {
                Ok(frame) => dispatch(endpoint_id, frame, &incoming),
                Err(e) => {
                    warn!(?endpoint_id, error = %e, "malformed frame, closing channel");
                    break DisconnectReason::IoError;
                }
            },
            Ok(None) => break DisconnectReason::RemoteDisconnection,
            Err(_) => break DisconnectReason::RemoteDisconnection,
        }
    };
    debug!(?endpoint_id, ?reason, "reader task exiting");
    if reason == DisconnectReason::Shutdown {
        return;
    }
    cancel.cancel();
    let _ = closed.send(EndpointClosed { endpoint_id, reason });
}

fn dispatch(endpoint_id: EndpointId, frame: OfflineFrame, incoming: &mpsc::UnboundedSender<IncomingFrame>) {
    let routed = match frame {
        OfflineFrame::KeepAlive => return,
        OfflineFrame::PayloadTransfer { packet_type, header, chunk } => {
            IncomingFrame::Payload { endpoint_id, packet_type, header, chunk }
        }
        OfflineFrame::BandwidthUpgradeNegotiation { event } => {
            IncomingFrame::BandwidthUpgrade { endpoint_id, event }
        }
        connection_or_disconnection => IncomingFrame::Connection { endpoint_id, frame: connection_or_disconnection },
    };
    let _ = incoming.send(routed);
}

async fn writer_loop(
    endpoint_id: EndpointId,
    channel: SharedChannel,
    cancel: CancellationToken,
    mut control_rx: mpsc::Receiver<OfflineFrame>,
    mut data_rx: mpsc::Receiver<OfflineFrame>,
    keep_alive: KeepAliveParams,
    closed: mpsc::UnboundedSender<EndpointClosed>,
) {
    let mut keep_alive_timer = tokio::time::interval(keep_alive.interval);
    keep_alive_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let timeout_check = tokio::time::interval(keep_alive.interval.min(Duration::from_secs(1)).max(Duration::from_millis(50)));
    tokio::pin!(timeout_check);

    let reason = loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break DisconnectReason::Shutdown,
            maybe = control_rx.recv() => {
                match maybe {
                    Some(frame) if channel.write(&frame.encode()).await.is_err() => break DisconnectReason::IoError,
                    Some(_) => {}
                    None => break DisconnectReason::Shutdown,
                }
            }
            _ = timeout_check.tick() => {
                let elapsed = Instant::now().saturating_duration_since(channel.last_read_at().await);
                if elapsed >= keep_alive.timeout {
                    warn!(?endpoint_id, "keep-alive timeout, remote unreachable");
                    break DisconnectReason::LocalDisconnectionBecauseRemoteUnreachable;
                }
            }
            _ = keep_alive_timer.tick() => {
                if channel.write(&OfflineFrame::KeepAlive.encode()).await.is_err() {
                    break DisconnectReason::IoError;
                }
            }
            maybe = data_rx.recv() => {
                match maybe {
                    Some(frame) if channel.write(&frame.encode()).await.is_err() => break DisconnectReason::IoError,
                    Some(_) => {}
                    None => break DisconnectReason::Shutdown,
                }
            }
        }
    };
    debug!(?endpoint_id, ?reason, "writer task exiting");
    if reason != DisconnectReason::Shutdown {
        cancel.cancel();
        let _ = closed.send(EndpointClosed { endpoint_id, reason });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::endpoint_channel::EndpointChannel;
    use crate::mediums::platform::{InMemoryMediums, PlatformMediums};
    use crate::options::Medium;

    async fn connected_pair(mediums: &Arc<InMemoryMediums>, name: &str) -> (SharedChannel, SharedChannel) {
        mediums.listen(Medium::WifiLan, name).await.unwrap();
        let accept = {
            let mediums = Arc::clone(mediums);
            let name = name.to_string();
            tokio::spawn(async move { mediums.accept(Medium::WifiLan, &name).await.unwrap() })
        };
        let client_stream = mediums.connect(Medium::WifiLan, name).await.unwrap();
        let server_stream = accept.await.unwrap();
        (
            Arc::new(EndpointChannel::new(Medium::WifiLan, client_stream)),
            Arc::new(EndpointChannel::new(Medium::WifiLan, server_stream)),
        )
    }

    #[tokio::test]
    async fn payload_frames_are_routed_to_the_payload_channel() {
        let mediums = InMemoryMediums::new();
        let (client, server) = connected_pair(&mediums, "ep").await;
        let channels = Arc::new(ChannelManager::new());
        let id = EndpointId::from_bytes(*b"ABCD");
        channels.register(id, server).await;

        let manager = EndpointManager::new(channels);
        let (incoming_tx, mut incoming_rx) = mpsc::unbounded_channel();
        let (closed_tx, _closed_rx) = mpsc::unbounded_channel();
        manager.start(id, manager_channel(&manager, id).await, KeepAliveParams::default(), incoming_tx, closed_tx).await;

        let header = PayloadHeader { id: 1, kind: crate::payload::PayloadKind::Bytes, total_size: 5 };
        let chunk = PayloadChunk { offset: 0, body: bytes::Bytes::from_static(b"hello"), last: false };
        client
            .write(
                &OfflineFrame::PayloadTransfer { packet_type: PacketType::Data, header, chunk: chunk.clone() }
                    .encode(),
            )
            .await
            .unwrap();

        let frame = incoming_rx.recv().await.unwrap();
        match frame {
            IncomingFrame::Payload { endpoint_id, chunk: got, .. } => {
                assert_eq!(endpoint_id, id);
                assert_eq!(got, chunk);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    async fn manager_channel(manager: &EndpointManager, id: EndpointId) -> SharedChannel {
        manager.channels.get(id).await.expect("channel must be registered before starting tasks")
    }

    #[tokio::test]
    async fn keep_alive_timeout_reports_closed() {
        let mediums = InMemoryMediums::new();
        let (client, server) = connected_pair(&mediums, "timeout").await;
        let channels = Arc::new(ChannelManager::new());
        let id = EndpointId::from_bytes(*b"WXYZ");
        channels.register(id, server).await;

        let manager = EndpointManager::new(channels);
        let (incoming_tx, _incoming_rx) = mpsc::unbounded_channel();
        let (closed_tx, mut closed_rx) = mpsc::unbounded_channel();
        let params = KeepAliveParams { interval: Duration::from_millis(20), timeout: Duration::from_millis(60) };
        manager.start(id, manager_channel(&manager, id).await, params, incoming_tx, closed_tx).await;

        // The client side never writes anything, so the server's reader
        // never advances last_read_at; the timeout should fire.
        let closed = closed_rx.recv().await.unwrap();
        assert_eq!(closed.endpoint_id, id);
        assert_eq!(closed.reason, DisconnectReason::LocalDisconnectionBecauseRemoteUnreachable);
        drop(client);
    }
}
