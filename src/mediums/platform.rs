//! The `PlatformMediums` capability surface (§6) and an in-memory
//! implementation used by tests (§4.9 of the expanded specification).
//!
//! Real bindings (the Swift/JS/Windows shims the base spec puts out of
//! scope) implement this trait against actual sockets, GATT
//! characteristics, NSD, and WebRTC signaling. The core never sees which
//! one is behind the trait object — it only ever reads and writes framed
//! byte channels.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio::sync::{mpsc, Mutex as AsyncMutex};

use crate::error::{Error, Result};
use crate::options::Medium;

/// A full-duplex byte stream to one remote endpoint, as handed up from the
/// platform layer before any framing or encryption is applied.
pub trait RawByteStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> RawByteStream for T {}

/// A boxed [`RawByteStream`], the concrete type `connect`/`accept` return.
pub type BoxedStream = Box<dyn RawByteStream>;

/// The capability surface the connection core requires of its host.
///
/// Every method is keyed by [`Medium`] since the surface is shared across
/// Bluetooth classic, BLE, Wi-Fi LAN, and WebRTC — the medium-specific
/// addressing (device name + UUID, GATT service, NSD service type, ICE
/// signaling channel) is a concern of the binding that implements this
/// trait, not of the core.
#[async_trait::async_trait]
pub trait PlatformMediums: std::fmt::Debug + Send + Sync {
    /// Begins listening for inbound connections to `local_name` on
    /// `medium` (Bluetooth classic `listen`, Wi-Fi LAN NSD register + TCP
    /// accept, BLE GATT server, or WebRTC signaling registration).
    async fn listen(&self, medium: Medium, local_name: &str) -> Result<()>;

    /// Stops listening previously started with [`PlatformMediums::listen`].
    async fn stop_listening(&self, medium: Medium, local_name: &str);

    /// Accepts the next inbound connection to `local_name` on `medium`.
    /// Cancel-safe: callers typically `tokio::select!` this against a
    /// shutdown signal.
    async fn accept(&self, medium: Medium, local_name: &str) -> Result<BoxedStream>;

    /// Dials `remote_name` on `medium` (Bluetooth classic `connect`,
    /// Wi-Fi LAN TCP connect to a discovered NSD address, BLE GATT client
    /// connect, or WebRTC signaling + ICE exchange).
    async fn connect(&self, medium: Medium, remote_name: &str) -> Result<BoxedStream>;

    /// Publishes (or replaces) `local_name`'s discovery payload for
    /// `service_id` on `medium` — the BLE `advertise(bytes)` / Wi-Fi LAN NSD
    /// register / Bluetooth classic device-name surface of §6, collapsed to
    /// one call since the payload bytes are already medium-agnostic (the
    /// encodings of §4.1). `payload` is normally a
    /// [`crate::wire::BleAdvertisement`] produced by the PCP controller;
    /// `local_name` is the same connectable name passed to
    /// [`PlatformMediums::listen`].
    async fn advertise(&self, medium: Medium, service_id: &str, local_name: &str, payload: Vec<u8>) -> Result<()>;

    /// Withdraws a payload published with [`PlatformMediums::advertise`].
    async fn stop_advertising(&self, medium: Medium, service_id: &str, local_name: &str);

    /// Returns every advertisement payload currently published for
    /// `service_id` on `medium`, i.e. one scan round of the BLE
    /// `scan(service_uuid) -> callbacks` / NSD discover surface of §6,
    /// collapsed to a poll rather than a callback stream. The PCP
    /// controller's discovery loop calls this on an interval and feeds the
    /// result through [`crate::mediums::LostEntityTracker`].
    async fn discover(&self, medium: Medium, service_id: &str) -> Result<Vec<Vec<u8>>>;
}

/// A process-local `PlatformMediums` backed by in-memory duplex pipes,
/// keyed by `(medium, name)`. This is the seam the end-to-end scenarios in
/// §8 of the specification are written against, and the Rust-native
/// equivalent of the original's `MediumEnvironment` test singleton.
#[derive(Debug, Default)]
pub struct InMemoryMediums {
    listeners: AsyncMutex<HashMap<(Medium, String), mpsc::UnboundedSender<DuplexStream>>>,
    #[allow(clippy::type_complexity)]
    pending: AsyncMutex<HashMap<(Medium, String), Arc<AsyncMutex<mpsc::UnboundedReceiver<DuplexStream>>>>>,
    /// `(medium, service_id) -> (advertiser local_name -> payload)`, the
    /// in-memory stand-in for over-the-air BLE/NSD advertisement
    /// broadcast.
    #[allow(clippy::type_complexity)]
    advertisements: AsyncMutex<HashMap<(Medium, String), HashMap<String, Vec<u8>>>>,
}

impl InMemoryMediums {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait::async_trait]
impl PlatformMediums for InMemoryMediums {
    async fn listen(&self, medium: Medium, local_name: &str) -> Result<()> {
        let key = (medium, local_name.to_string());
        let mut listeners = self.listeners.lock().await;
        if listeners.contains_key(&key) {
            return Err(Error::Medium { medium, reason: format!("{local_name} already listening") });
        }
        let (tx, rx) = mpsc::unbounded_channel();
        listeners.insert(key.clone(), tx);
        self.pending.lock().await.insert(key, Arc::new(AsyncMutex::new(rx)));
        Ok(())
    }

    async fn stop_listening(&self, medium: Medium, local_name: &str) {
        let key = (medium, local_name.to_string());
        self.listeners.lock().await.remove(&key);
        self.pending.lock().await.remove(&key);
    }

    async fn accept(&self, medium: Medium, local_name: &str) -> Result<BoxedStream> {
        let key = (medium, local_name.to_string());
        let rx = self
            .pending
            .lock()
            .await
            .get(&key)
            .cloned()
            .ok_or_else(|| Error::Medium { medium, reason: format!("{local_name} is not listening") })?;
        let mut rx = rx.lock().await;
        let stream = rx
            .recv()
            .await
            .ok_or_else(|| Error::Medium { medium, reason: "listener closed".into() })?;
        Ok(Box::new(stream))
    }

    async fn connect(&self, medium: Medium, remote_name: &str) -> Result<BoxedStream> {
        let key = (medium, remote_name.to_string());
        let tx = self
            .listeners
            .lock()
            .await
            .get(&key)
            .cloned()
            .ok_or_else(|| Error::Medium { medium, reason: format!("{remote_name} is not reachable") })?;
        let (local, remote) = tokio::io::duplex(64 * 1024);
        tx.send(remote)
            .map_err(|_| Error::Medium { medium, reason: "listener closed".into() })?;
        Ok(Box::new(local))
    }

    async fn advertise(&self, medium: Medium, service_id: &str, local_name: &str, payload: Vec<u8>) -> Result<()> {
        let key = (medium, service_id.to_string());
        self.advertisements.lock().await.entry(key).or_default().insert(local_name.to_string(), payload);
        Ok(())
    }

    async fn stop_advertising(&self, medium: Medium, service_id: &str, local_name: &str) {
        let key = (medium, service_id.to_string());
        if let Some(by_name) = self.advertisements.lock().await.get_mut(&key) {
            by_name.remove(local_name);
        }
    }

    async fn discover(&self, medium: Medium, service_id: &str) -> Result<Vec<Vec<u8>>> {
        let key = (medium, service_id.to_string());
        Ok(self
            .advertisements
            .lock()
            .await
            .get(&key)
            .map(|by_name| by_name.values().cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn connect_pairs_with_a_pending_listener() {
        let mediums = InMemoryMediums::new();
        mediums.listen(Medium::WifiLan, "server").await.unwrap();

        let server_mediums = Arc::clone(&mediums);
        let accept_task =
            tokio::spawn(async move { server_mediums.accept(Medium::WifiLan, "server").await });

        let mut client = mediums.connect(Medium::WifiLan, "server").await.unwrap();
        let mut server = accept_task.await.unwrap().unwrap();

        client.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn connect_without_listener_fails() {
        let mediums = InMemoryMediums::new();
        assert!(mediums.connect(Medium::Bluetooth, "nobody").await.is_err());
    }

    #[tokio::test]
    async fn discover_reflects_advertise_and_stop_advertising() {
        let mediums = InMemoryMediums::new();
        assert!(mediums.discover(Medium::Ble, "svc").await.unwrap().is_empty());

        mediums.advertise(Medium::Ble, "svc", "ABCD", b"payload-a".to_vec()).await.unwrap();
        let found = mediums.discover(Medium::Ble, "svc").await.unwrap();
        assert_eq!(found, vec![b"payload-a".to_vec()]);

        mediums.stop_advertising(Medium::Ble, "svc", "ABCD").await;
        assert!(mediums.discover(Medium::Ble, "svc").await.unwrap().is_empty());
    }
}
