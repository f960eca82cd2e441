//! Incoming payload reassembly (§4.5).

use std::io::SeekFrom;
use std::path::PathBuf;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncRead, AsyncSeekExt, AsyncWriteExt, ReadBuf};
use tokio::sync::mpsc;
use tracing::warn;

use crate::payload::{PayloadId, PayloadKind, PayloadProgress, ReceivedPayload, TransferStatus};

/// The receiver never buffers more than one outstanding chunk ahead of the
/// client's own reader (§4.5, "Flow control"): the channel a [`ChunkReader`]
/// drains holds at most this many pending chunks, so a slow client
/// backpressures the dispatcher that calls [`IncomingTransfer::apply_chunk`].
const STREAM_CHUNK_BUFFER: usize = 1;

/// An `AsyncRead` fed by chunks pushed from the reader task, used for the
/// stream receive case. Ends cleanly when the sender is dropped (last-chunk
/// marker observed) without the reader needing to inspect frame-level
/// metadata.
pub struct ChunkReader {
    rx: mpsc::Receiver<Bytes>,
    current: Bytes,
}

impl ChunkReader {
    fn new(rx: mpsc::Receiver<Bytes>) -> Self {
        Self { rx, current: Bytes::new() }
    }
}

impl AsyncRead for ChunkReader {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        loop {
            if !self.current.is_empty() {
                let n = self.current.len().min(buf.remaining());
                let chunk = self.current.split_to(n);
                buf.put_slice(&chunk);
                return Poll::Ready(Ok(()));
            }
            match self.rx.poll_recv(cx) {
                Poll::Ready(Some(bytes)) => self.current = bytes,
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

/// In-memory or on-disk staging area for one incoming payload. Bytes
/// payloads accumulate directly; stream payloads push into a bounded
/// channel drained by a [`ChunkReader`] handed to the client; file payloads
/// append to a temporary file at each chunk's offset and are sealed (handed
/// to the client) only once the last-chunk marker arrives (§4.5).
enum Reassembly {
    Bytes(Vec<u8>),
    Streamed(mpsc::Sender<Bytes>),
    File { file: File, path: PathBuf },
}

/// Per-`(endpoint, payload)` receive-side state (§3 "Payload transfer
/// state").
pub struct IncomingTransfer {
    pub kind: PayloadKind,
    pub total_size: u64,
    pub bytes_transferred: u64,
    pub cancelled: bool,
    reassembly: Reassembly,
}

impl IncomingTransfer {
    /// Starts a new transfer from the header of its first chunk, returning
    /// the transfer state plus the payload to hand the client immediately.
    /// Bytes and file payloads are handed over only on completion (see
    /// [`IncomingTransfer::take_received`]); a stream payload is handed over
    /// immediately as a lazily-filled reader, since a stream has no
    /// "sealed" end state for the client to wait for.
    pub async fn start(id: PayloadId, kind: PayloadKind, total_size: u64) -> (Self, Option<ReceivedPayload>) {
        match kind {
            PayloadKind::Bytes => (
                Self { kind, total_size, bytes_transferred: 0, cancelled: false, reassembly: Reassembly::Bytes(Vec::new()) },
                None,
            ),
            PayloadKind::Stream => {
                let (tx, rx) = mpsc::channel(STREAM_CHUNK_BUFFER);
                let reader: Pin<Box<dyn AsyncRead + Send>> = Box::pin(ChunkReader::new(rx));
                (
                    Self { kind, total_size, bytes_transferred: 0, cancelled: false, reassembly: Reassembly::Streamed(tx) },
                    Some(ReceivedPayload::Stream { id, reader }),
                )
            }
            PayloadKind::File => {
                let path = temp_file_path(id);
                match OpenOptions::new().read(true).write(true).create(true).truncate(true).open(&path).await {
                    Ok(file) => (
                        Self { kind, total_size, bytes_transferred: 0, cancelled: false, reassembly: Reassembly::File { file, path } },
                        None,
                    ),
                    Err(e) => {
                        warn!(?id, error = %e, "failed to create temporary file for incoming payload, falling back to memory");
                        (
                            Self { kind, total_size, bytes_transferred: 0, cancelled: false, reassembly: Reassembly::Bytes(Vec::new()) },
                            None,
                        )
                    }
                }
            }
        }
    }

    /// Applies one received data chunk, seeking a file reassembly to
    /// `offset` before appending (§4.5, "appends to a temporary file at
    /// offset"). `last` is the sender's explicit last-chunk marker (not
    /// inferred from `offset`, which never reaches `total_size` for an
    /// unknown-length stream). Returns `last` unchanged, for the caller's
    /// convenience.
    pub async fn apply_chunk(&mut self, offset: u64, body: Bytes, last: bool) -> bool {
        self.bytes_transferred = offset + body.len() as u64;
        match &mut self.reassembly {
            Reassembly::Bytes(buf) => {
                if !body.is_empty() {
                    buf.extend_from_slice(&body);
                }
            }
            Reassembly::Streamed(tx) => {
                if !body.is_empty() {
                    // Bounded by `STREAM_CHUNK_BUFFER`: blocks here until the
                    // client's `ChunkReader` has drained the previous chunk.
                    let _ = tx.send(body).await;
                }
            }
            Reassembly::File { file, path } => {
                if !body.is_empty() {
                    if let Err(e) = write_chunk(file, offset, &body).await {
                        warn!(%e, path = %path.display(), "failed writing incoming payload chunk to disk");
                    }
                }
            }
        }
        last
    }

    /// Takes the fully materialized payload after the last-chunk marker.
    /// Bytes payloads are handed over as an in-memory buffer; file payloads
    /// are sealed (flushed, rewound, reopened for reading by the client) and
    /// handed over as a reader (§4.5, "on completion the file is sealed and
    /// handed to the client"). Stream payloads were already handed to the
    /// client at [`IncomingTransfer::start`] and simply run their channel
    /// dry, so this always returns `None` for them.
    pub async fn take_received(&mut self, id: PayloadId) -> Option<ReceivedPayload> {
        match &mut self.reassembly {
            Reassembly::Bytes(buf) => Some(ReceivedPayload::Bytes { id, data: std::mem::take(buf) }),
            Reassembly::Streamed(_) => None,
            Reassembly::File { file, .. } => {
                if let Err(e) = file.flush().await {
                    warn!(%e, "failed flushing sealed incoming payload file");
                }
                if let Err(e) = file.seek(SeekFrom::Start(0)).await {
                    warn!(%e, "failed rewinding sealed incoming payload file");
                }
                let reassembly = std::mem::replace(&mut self.reassembly, Reassembly::Bytes(Vec::new()));
                let Reassembly::File { file, .. } = reassembly else { unreachable!() };
                let reader: Pin<Box<dyn AsyncRead + Send>> = Box::pin(file);
                Some(ReceivedPayload::File { id, reader, total_size: self.total_size })
            }
        }
    }

    #[must_use]
    pub fn progress(&self, id: PayloadId, status: TransferStatus) -> PayloadProgress {
        PayloadProgress {
            payload_id: id,
            bytes_transferred: self.bytes_transferred,
            total_size: Some(self.total_size),
            status,
        }
    }
}

impl Drop for IncomingTransfer {
    fn drop(&mut self) {
        if let Reassembly::File { path, .. } = &self.reassembly {
            let path = path.clone();
            tokio::spawn(async move {
                let _ = tokio::fs::remove_file(&path).await;
            });
        }
    }
}

fn temp_file_path(id: PayloadId) -> PathBuf {
    std::env::temp_dir().join(format!("nearlink-payload-{id}-{:016x}.part", rand::random::<u64>()))
}

async fn write_chunk(file: &mut File, offset: u64, body: &[u8]) -> std::io::Result<()> {
    file.seek(SeekFrom::Start(offset)).await?;
    file.write_all(body).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn bytes_reassembly_concatenates_in_order() {
        let (mut transfer, handed_over) = IncomingTransfer::start(PayloadId::generate(), PayloadKind::Bytes, 10).await;
        assert!(handed_over.is_none());
        assert!(!transfer.apply_chunk(0, Bytes::from_static(b"hello"), false).await);
        assert!(!transfer.apply_chunk(5, Bytes::from_static(b"world"), false).await);
        assert!(transfer.apply_chunk(10, Bytes::new(), true).await);
        match transfer.take_received(PayloadId::generate()).await {
            Some(ReceivedPayload::Bytes { data, .. }) => assert_eq!(data, b"helloworld"),
            other => panic!("unexpected: {}", matches!(other, None)),
        }
    }

    #[tokio::test]
    async fn stream_reassembly_is_readable_as_chunks_arrive() {
        let (mut transfer, handed_over) = IncomingTransfer::start(PayloadId::generate(), PayloadKind::Stream, 5).await;
        let Some(ReceivedPayload::Stream { mut reader, .. }) = handed_over else { panic!("expected a stream") };

        let apply_task = tokio::spawn(async move {
            transfer.apply_chunk(0, Bytes::from_static(b"hello"), false).await;
            transfer.apply_chunk(5, Bytes::new(), true).await;
        });

        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello");
        apply_task.await.unwrap();
    }

    #[tokio::test]
    async fn unknown_length_stream_terminates_on_the_explicit_last_flag() {
        // total_size = u64::MAX (the unknown-length sentinel): no real
        // offset ever equals it, so termination must come from `last`.
        let (mut transfer, handed_over) =
            IncomingTransfer::start(PayloadId::generate(), PayloadKind::Stream, u64::MAX).await;
        let Some(ReceivedPayload::Stream { mut reader, .. }) = handed_over else { panic!("expected a stream") };

        let apply_task = tokio::spawn(async move {
            assert!(!transfer.apply_chunk(0, Bytes::from_static(b"hello"), false).await);
            assert!(transfer.apply_chunk(5, Bytes::new(), true).await);
        });

        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello");
        apply_task.await.unwrap();
    }

    #[tokio::test]
    async fn file_reassembly_seals_to_a_temp_file_and_hands_it_to_the_client() {
        let id = PayloadId::generate();
        let (mut transfer, handed_over) = IncomingTransfer::start(id, PayloadKind::File, 10).await;
        assert!(handed_over.is_none(), "a file payload is sealed, not handed over immediately");

        // Out-of-order delivery shouldn't happen on a FIFO channel, but the
        // seek-to-offset write means it would still land correctly.
        transfer.apply_chunk(5, Bytes::from_static(b"world"), false).await;
        transfer.apply_chunk(0, Bytes::from_static(b"hello"), false).await;
        assert!(transfer.apply_chunk(10, Bytes::new(), true).await);

        match transfer.take_received(id).await {
            Some(ReceivedPayload::File { mut reader, total_size, .. }) => {
                assert_eq!(total_size, 10);
                let mut out = Vec::new();
                reader.read_to_end(&mut out).await.unwrap();
                assert_eq!(out, b"helloworld");
            }
            other => panic!("expected a sealed file: {}", matches!(other, None)),
        }
    }
}
