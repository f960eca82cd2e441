//! A full-duplex framed byte channel to one remote endpoint (§4.2).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use nearlink_crypto::EncryptionContext;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::{Mutex as AsyncMutex, Notify};

use crate::error::{Error, Result};
use crate::mediums::platform::BoxedStream;
use crate::options::Medium;
use crate::wire;

/// Why an [`EndpointChannel`] was torn down. Surfaced by the channel
/// manager's `unregister` and by the endpoint manager's teardown path
/// (§4.3, §4.4, §7).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum DisconnectReason {
    LocalDisconnection,
    RemoteDisconnection,
    LocalDisconnectionBecauseRemoteUnreachable,
    IoError,
    UpgradedMedium,
    Shutdown,
}

/// A framed, optionally-encrypted, pausable byte pipe to one remote
/// endpoint (§3 "Endpoint channel", §4.2).
///
/// Owns the raw transport handed up by [`crate::mediums::platform::PlatformMediums`].
/// Exclusively registered with the channel manager; read from by exactly one
/// reader task and written to by exactly one writer task, but held as a
/// shared reference so both tasks can outlive a manager-level `replace`.
pub struct EndpointChannel {
    medium: Medium,
    reader: AsyncMutex<ReadHalf<BoxedStream>>,
    writer: AsyncMutex<WriteHalf<BoxedStream>>,
    encryption: AsyncMutex<Option<EncryptionContext>>,
    paused: AtomicBool,
    resumed: Notify,
    closed: AtomicBool,
    last_read_at: AsyncMutex<Instant>,
}

impl EndpointChannel {
    /// Wraps a raw byte stream obtained from a `PlatformMediums::connect` /
    /// `accept` call as a framed, encryptable channel.
    #[must_use]
    pub fn new(medium: Medium, stream: BoxedStream) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            medium,
            reader: AsyncMutex::new(reader),
            writer: AsyncMutex::new(writer),
            encryption: AsyncMutex::new(None),
            paused: AtomicBool::new(false),
            resumed: Notify::new(),
            closed: AtomicBool::new(false),
            last_read_at: AsyncMutex::new(Instant::now()),
        }
    }

    #[inline]
    #[must_use]
    pub fn get_medium(&self) -> Medium {
        self.medium
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub async fn last_read_at(&self) -> Instant {
        *self.last_read_at.lock().await
    }

    /// Installs the AES-128-CTR stream cipher derived from a completed
    /// UKEY2-equivalent handshake. Encryption applies to frame bodies only,
    /// never to the 4-byte length prefix (§4.2). A channel may transition
    /// unencrypted to encrypted at most once; a second call overwrites the
    /// previous context rather than erroring, matching §4.3's "order-
    /// independent" framing for the channel manager, which is the only
    /// caller.
    pub async fn enable_encryption(&self, ctx: EncryptionContext) {
        *self.encryption.lock().await = Some(ctx);
    }

    /// Blocks new reads until [`EndpointChannel::resume`] is called. A
    /// paused channel may still be closed (§4.2).
    pub fn pause(&self) {
        self.paused.store(true, Ordering::Release);
    }

    /// Releases a channel paused with [`EndpointChannel::pause`].
    pub fn resume(&self) {
        self.paused.store(false, Ordering::Release);
        self.resumed.notify_waiters();
    }

    async fn wait_while_paused(&self) {
        while self.paused.load(Ordering::Acquire) {
            self.resumed.notified().await;
        }
    }

    /// Reads one framed `OfflineFrame` body off the wire, decrypting it if
    /// encryption has been enabled. Blocks while the channel is paused.
    /// Returns `Ok(None)` on a clean peer-initiated close.
    pub async fn read(&self) -> Result<Option<Vec<u8>>> {
        if self.is_closed() {
            return Err(Error::Io(std::io::Error::new(std::io::ErrorKind::NotConnected, "channel closed")));
        }
        self.wait_while_paused().await;
        let mut reader = self.reader.lock().await;
        let body = match wire::read_framed(&mut *reader).await {
            Ok(body) => body,
            Err(e) => {
                self.closed.store(true, Ordering::Release);
                return Err(e);
            }
        };
        *self.last_read_at.lock().await = Instant::now();
        let Some(mut body) = body else { return Ok(None) };
        if let Some(ctx) = self.encryption.lock().await.as_mut() {
            ctx.decrypt(&mut body);
        }
        Ok(Some(body))
    }

    /// Writes one framed `OfflineFrame` body, encrypting it if encryption
    /// has been enabled. Blocks while the channel is paused.
    pub async fn write(&self, body: &[u8]) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Io(std::io::Error::new(std::io::ErrorKind::NotConnected, "channel closed")));
        }
        self.wait_while_paused().await;
        let mut owned;
        let to_write: &[u8] = if let Some(ctx) = self.encryption.lock().await.as_mut() {
            owned = body.to_vec();
            ctx.encrypt(&mut owned);
            &owned
        } else {
            body
        };
        let mut writer = self.writer.lock().await;
        match wire::write_framed(&mut *writer, to_write).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.closed.store(true, Ordering::Release);
                Err(e)
            }
        }
    }

    /// Tears the channel down permanently. Idempotent. A paused channel may
    /// still be closed (§4.2); closing resumes it first so a blocked writer
    /// observes the closed state rather than waiting forever.
    pub async fn close(&self, _reason: DisconnectReason) {
        self.closed.store(true, Ordering::Release);
        self.resume();
        let mut writer = self.writer.lock().await;
        let _ = tokio::io::AsyncWriteExt::shutdown(&mut *writer).await;
    }
}

impl std::fmt::Debug for EndpointChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointChannel")
            .field("medium", &self.medium)
            .field("closed", &self.is_closed())
            .field("paused", &self.paused.load(Ordering::Relaxed))
            .finish()
    }
}

/// Shared ownership of a channel, as required by §4.3 ("shared, reference-
/// counted access so readers/writers may hold the channel across a
/// replace").
pub type SharedChannel = Arc<EndpointChannel>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mediums::platform::{InMemoryMediums, PlatformMediums};

    #[tokio::test]
    async fn write_then_read_roundtrips_a_frame_body() {
        let mediums = InMemoryMediums::new();
        mediums.listen(Medium::WifiLan, "server").await.unwrap();
        let accept = {
            let mediums = Arc::clone(&mediums);
            tokio::spawn(async move { mediums.accept(Medium::WifiLan, "server").await.unwrap() })
        };
        let client_stream = mediums.connect(Medium::WifiLan, "server").await.unwrap();
        let server_stream = accept.await.unwrap();

        let client = EndpointChannel::new(Medium::WifiLan, client_stream);
        let server = EndpointChannel::new(Medium::WifiLan, server_stream);

        client.write(b"hello").await.unwrap();
        let got = server.read().await.unwrap().unwrap();
        assert_eq!(got, b"hello");
    }

    #[tokio::test]
    async fn closed_channel_rejects_further_operations() {
        let mediums = InMemoryMediums::new();
        mediums.listen(Medium::Ble, "a").await.unwrap();
        let accept = {
            let mediums = Arc::clone(&mediums);
            tokio::spawn(async move { mediums.accept(Medium::Ble, "a").await.unwrap() })
        };
        let client_stream = mediums.connect(Medium::Ble, "a").await.unwrap();
        let _server_stream = accept.await.unwrap();
        let channel = EndpointChannel::new(Medium::Ble, client_stream);
        channel.close(DisconnectReason::LocalDisconnection).await;
        assert!(channel.write(b"x").await.is_err());
        assert!(channel.read().await.is_err());
    }

    #[tokio::test]
    async fn pause_blocks_write_until_resumed() {
        let mediums = InMemoryMediums::new();
        mediums.listen(Medium::Ble, "b").await.unwrap();
        let accept = {
            let mediums = Arc::clone(&mediums);
            tokio::spawn(async move { mediums.accept(Medium::Ble, "b").await.unwrap() })
        };
        let client_stream = mediums.connect(Medium::Ble, "b").await.unwrap();
        let server_stream = accept.await.unwrap();
        let client = Arc::new(EndpointChannel::new(Medium::Ble, client_stream));
        let server = EndpointChannel::new(Medium::Ble, server_stream);

        client.pause();
        let write_client = Arc::clone(&client);
        let write_task = tokio::spawn(async move { write_client.write(b"after-resume").await });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!write_task.is_finished());

        client.resume();
        write_task.await.unwrap().unwrap();
        let got = server.read().await.unwrap().unwrap();
        assert_eq!(got, b"after-resume");
    }
}
