//! The client-facing payload container (§3, "Payload").

use tokio::io::AsyncRead;

/// Unique (per client/endpoint session), nonzero 64-bit payload id. Assigned
/// by the sender; the receiver adopts the id carried in the frame header.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct PayloadId(std::num::NonZeroU64);

impl PayloadId {
    /// Generates a new random, nonzero payload id.
    #[must_use]
    pub fn generate() -> Self {
        loop {
            let v: u64 = rand::random();
            if let Some(nz) = std::num::NonZeroU64::new(v) {
                return Self(nz);
            }
        }
    }

    /// Wraps an id already observed on the wire. Returns `None` for the
    /// reserved value `0`.
    #[must_use]
    pub fn from_raw(v: u64) -> Option<Self> {
        std::num::NonZeroU64::new(v).map(Self)
    }

    #[inline]
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0.get()
    }
}

impl std::fmt::Display for PayloadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Tag identifying which [`Payload`] variant a frame's header describes,
/// without transferring the payload body itself (§4.1).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum PayloadKind {
    Bytes,
    Stream,
    File,
}

/// A client-supplied unit of data to send end-to-end: bytes, a stream, or a
/// file. Payloads are move-only: once handed to `send_payload` the caller
/// retains no further access (§3).
pub enum Payload {
    /// Fully materialized bytes.
    Bytes(Vec<u8>),
    /// A lazy, finite, forward-only byte source. Not restartable: once
    /// consumed by the payload manager it cannot be re-read.
    Stream(Pin<Box<dyn AsyncRead + Send>>, u64),
    /// A seekable file-backed source, identified so the receiver can
    /// reassemble into a matching temporary file.
    File { data: Pin<Box<dyn AsyncRead + Send>>, total_size: u64, offset: u64 },
}

use std::pin::Pin;

impl Payload {
    /// The total size of the payload, if known up front. Bytes and files
    /// always know their size; a stream may not.
    #[must_use]
    pub fn total_size(&self) -> Option<u64> {
        match self {
            Payload::Bytes(b) => Some(b.len() as u64),
            Payload::Stream(_, len) => Some(*len).filter(|&l| l != u64::MAX),
            Payload::File { total_size, .. } => Some(*total_size),
        }
    }

    #[must_use]
    pub fn kind(&self) -> PayloadKind {
        match self {
            Payload::Bytes(_) => PayloadKind::Bytes,
            Payload::Stream(..) => PayloadKind::Stream,
            Payload::File { .. } => PayloadKind::File,
        }
    }
}

impl std::fmt::Debug for Payload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Payload::Bytes(b) => f.debug_tuple("Bytes").field(&b.len()).finish(),
            Payload::Stream(_, len) => f.debug_tuple("Stream").field(len).finish(),
            Payload::File { total_size, offset, .. } => {
                f.debug_struct("File").field("total_size", total_size).field("offset", offset).finish()
            }
        }
    }
}

/// Status of an in-flight payload transfer, carried in every
/// `PAYLOAD_PROGRESS` event (§4.5).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum TransferStatus {
    InProgress,
    Success,
    Failure,
    Cancelled,
}

/// One `PAYLOAD_PROGRESS` event delivered to the client callback executor.
#[derive(Clone, Copy, Debug)]
pub struct PayloadProgress {
    pub payload_id: PayloadId,
    pub bytes_transferred: u64,
    pub total_size: Option<u64>,
    pub status: TransferStatus,
}

/// A fully received payload handed to the client's `payload_cb`.
pub enum ReceivedPayload {
    Bytes { id: PayloadId, data: Vec<u8> },
    Stream { id: PayloadId, reader: Pin<Box<dyn AsyncRead + Send>> },
    File { id: PayloadId, reader: Pin<Box<dyn AsyncRead + Send>>, total_size: u64 },
}

impl ReceivedPayload {
    #[must_use]
    pub fn id(&self) -> PayloadId {
        match self {
            ReceivedPayload::Bytes { id, .. }
            | ReceivedPayload::Stream { id, .. }
            | ReceivedPayload::File { id, .. } => *id,
        }
    }
}

impl std::fmt::Debug for ReceivedPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReceivedPayload::Bytes { id, data } => {
                f.debug_struct("Bytes").field("id", id).field("len", &data.len()).finish()
            }
            ReceivedPayload::Stream { id, .. } => f.debug_struct("Stream").field("id", id).finish(),
            ReceivedPayload::File { id, total_size, .. } => {
                f.debug_struct("File").field("id", id).field("total_size", total_size).finish()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_id_zero_is_rejected() {
        assert!(PayloadId::from_raw(0).is_none());
        assert!(PayloadId::from_raw(1).is_some());
    }

    #[test]
    fn bytes_payload_reports_exact_size() {
        let p = Payload::Bytes(vec![0u8; 42]);
        assert_eq!(p.total_size(), Some(42));
        assert_eq!(p.kind(), PayloadKind::Bytes);
    }
}
