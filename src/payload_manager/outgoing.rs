//! Outgoing payload fragmentation and per-endpoint send state (§4.5).

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::endpoint::EndpointId;
use crate::endpoint_manager::endpoint_manager::EndpointManager;
use crate::payload::{Payload, PayloadId, PayloadKind, PayloadProgress, TransferStatus};
use crate::wire::{ControlMarker, OfflineFrame, PacketType, PayloadChunk, PayloadHeader};

/// Maximum bytes per fragment for stream/file sources (§4.5). Bytes
/// payloads smaller than this go out as a single chunk for free; larger
/// ones are split the same way.
pub const MAX_CHUNK_SIZE: usize = 64 * 1024;

struct EndpointState {
    status: TransferStatus,
    bytes_transferred: u64,
}

/// Tracks the send of one payload across every endpoint it was addressed
/// to.
pub struct OutgoingTransfer {
    pub kind: PayloadKind,
    pub total_size: Option<u64>,
    endpoints: HashMap<EndpointId, EndpointState>,
    pub cancel: CancellationToken,
}

impl OutgoingTransfer {
    fn new(kind: PayloadKind, total_size: Option<u64>, endpoint_ids: &[EndpointId]) -> Self {
        let endpoints = endpoint_ids
            .iter()
            .map(|&id| (id, EndpointState { status: TransferStatus::InProgress, bytes_transferred: 0 }))
            .collect();
        Self { kind, total_size, endpoints, cancel: CancellationToken::new() }
    }

    fn mark(&mut self, endpoint_id: EndpointId, status: TransferStatus, bytes_transferred: u64) {
        if let Some(state) = self.endpoints.get_mut(&endpoint_id) {
            state.status = status;
            state.bytes_transferred = bytes_transferred;
        }
    }

    /// Whether every addressed endpoint has left `IN_PROGRESS`.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.endpoints.values().all(|s| s.status != TransferStatus::InProgress)
    }
}

/// Emitted for every progress update on the sending side of a transfer
/// (§4.5).
#[derive(Debug)]
pub struct OutgoingProgress {
    pub endpoint_id: EndpointId,
    pub progress: PayloadProgress,
}

/// Spawns the background send task for `payload`, addressed to
/// `endpoint_ids`. Returns the transfer's shared tracking state and a
/// channel of progress events for the payload manager to relay to the
/// client callback executor.
pub fn spawn_send(
    payload_id: PayloadId,
    payload: Payload,
    endpoint_ids: Vec<EndpointId>,
    endpoint_manager: Arc<EndpointManager>,
) -> (Arc<AsyncMutex<OutgoingTransfer>>, mpsc::UnboundedReceiver<OutgoingProgress>) {
    let transfer = Arc::new(AsyncMutex::new(OutgoingTransfer::new(payload.kind(), payload.total_size(), &endpoint_ids)));
    let (progress_tx, progress_rx) = mpsc::unbounded_channel();
    tokio::spawn(send_task(payload_id, payload, endpoint_ids, endpoint_manager, Arc::clone(&transfer), progress_tx));
    (transfer, progress_rx)
}

async fn send_task(
    payload_id: PayloadId,
    payload: Payload,
    endpoint_ids: Vec<EndpointId>,
    endpoint_manager: Arc<EndpointManager>,
    transfer: Arc<AsyncMutex<OutgoingTransfer>>,
    progress_tx: mpsc::UnboundedSender<OutgoingProgress>,
) {
    let cancel = transfer.lock().await.cancel.clone();
    let ctx = SendCtx { payload_id, endpoint_ids, endpoint_manager, transfer, progress_tx, cancel };

    let result = match payload {
        Payload::Bytes(data) => send_bytes(&ctx, &data).await,
        Payload::Stream(reader, len) => send_reader(&ctx, reader, PayloadKind::Stream, len, 0).await,
        Payload::File { data, total_size, offset } => send_reader(&ctx, data, PayloadKind::File, total_size, offset).await,
    };

    if result.is_err() {
        warn!(payload_id = %ctx.payload_id, "payload source failed, failing remaining endpoints");
        ctx.fail_remaining().await;
    }
}

struct SendCtx {
    payload_id: PayloadId,
    endpoint_ids: Vec<EndpointId>,
    endpoint_manager: Arc<EndpointManager>,
    transfer: Arc<AsyncMutex<OutgoingTransfer>>,
    progress_tx: mpsc::UnboundedSender<OutgoingProgress>,
    cancel: CancellationToken,
}

impl SendCtx {
    async fn emit(&self, endpoint_id: EndpointId, status: TransferStatus, bytes_transferred: u64, total_size: Option<u64>) {
        self.transfer.lock().await.mark(endpoint_id, status, bytes_transferred);
        let _ = self.progress_tx.send(OutgoingProgress {
            endpoint_id,
            progress: PayloadProgress { payload_id: self.payload_id, bytes_transferred, total_size, status },
        });
    }

    async fn send_chunk(&self, kind: PayloadKind, total_size: u64, offset: u64, body: Bytes, last: bool) {
        let header = PayloadHeader { id: self.payload_id.get(), kind, total_size };
        let bytes_transferred = offset + body.len() as u64;
        for &endpoint_id in &self.endpoint_ids {
            let chunk = PayloadChunk { offset, body: body.clone(), last };
            let frame = OfflineFrame::PayloadTransfer { packet_type: PacketType::Data, header, chunk };
            let delivered = self.endpoint_manager.send_data(endpoint_id, frame).await;
            let status = match (delivered, last) {
                (true, true) => TransferStatus::Success,
                (true, false) => TransferStatus::InProgress,
                (false, _) => TransferStatus::Failure,
            };
            self.emit(endpoint_id, status, bytes_transferred, Some(total_size)).await;
        }
    }

    async fn cancel_remaining(&self) {
        let total_size = self.transfer.lock().await.total_size;
        for &endpoint_id in &self.endpoint_ids {
            let header = PayloadHeader { id: self.payload_id.get(), kind: self.transfer.lock().await.kind, total_size: total_size.unwrap_or(0) };
            let frame = OfflineFrame::PayloadTransfer {
                packet_type: PacketType::Control(ControlMarker::Cancel),
                header,
                chunk: PayloadChunk { offset: 0, body: Bytes::new(), last: false },
            };
            let _ = self.endpoint_manager.send_control(endpoint_id, frame).await;
            self.emit(endpoint_id, TransferStatus::Cancelled, 0, total_size).await;
        }
    }

    async fn fail_remaining(&self) {
        let total_size = self.transfer.lock().await.total_size;
        for &endpoint_id in &self.endpoint_ids {
            let header = PayloadHeader { id: self.payload_id.get(), kind: self.transfer.lock().await.kind, total_size: total_size.unwrap_or(0) };
            let frame = OfflineFrame::PayloadTransfer {
                packet_type: PacketType::Control(ControlMarker::PayloadError),
                header,
                chunk: PayloadChunk { offset: 0, body: Bytes::new(), last: false },
            };
            let _ = self.endpoint_manager.send_control(endpoint_id, frame).await;
            self.emit(endpoint_id, TransferStatus::Failure, 0, total_size).await;
        }
    }
}

async fn send_bytes(ctx: &SendCtx, data: &[u8]) -> Result<(), ()> {
    let total_size = data.len() as u64;
    if data.is_empty() {
        ctx.send_chunk(PayloadKind::Bytes, 0, 0, Bytes::new(), true).await;
        return Ok(());
    }
    let mut offset = 0usize;
    while offset < data.len() {
        if ctx.cancel.is_cancelled() {
            ctx.cancel_remaining().await;
            return Ok(());
        }
        let end = (offset + MAX_CHUNK_SIZE).min(data.len());
        let body = Bytes::copy_from_slice(&data[offset..end]);
        ctx.send_chunk(PayloadKind::Bytes, total_size, offset as u64, body, false).await;
        offset = end;
    }
    ctx.send_chunk(PayloadKind::Bytes, total_size, total_size, Bytes::new(), true).await;
    Ok(())
}

/// Fragments `reader` into [`MAX_CHUNK_SIZE`] chunks starting at
/// `start_offset`, flagging the empty EOF chunk as the last chunk
/// explicitly (§4.5) rather than inferring it from `offset == total_size`,
/// since `total_size` is `u64::MAX` for an unknown-length stream and no
/// real offset ever reaches it.
async fn send_reader(
    ctx: &SendCtx,
    mut reader: std::pin::Pin<Box<dyn tokio::io::AsyncRead + Send>>,
    kind: PayloadKind,
    total_size: u64,
    start_offset: u64,
) -> Result<(), ()> {
    let mut offset = start_offset;
    let mut buf = vec![0u8; MAX_CHUNK_SIZE];
    loop {
        if ctx.cancel.is_cancelled() {
            ctx.cancel_remaining().await;
            return Ok(());
        }
        let n = reader.read(&mut buf).await.map_err(|_| ())?;
        if n == 0 {
            ctx.send_chunk(kind, total_size, offset, Bytes::new(), true).await;
            return Ok(());
        }
        let body = Bytes::copy_from_slice(&buf[..n]);
        ctx.send_chunk(kind, total_size, offset, body, false).await;
        offset += n as u64;
    }
}
