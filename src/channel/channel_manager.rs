//! Registry of endpoint channels (§4.3).

use std::collections::HashMap;
use std::time::Duration;

use nearlink_crypto::EncryptionContext;
use tokio::sync::Mutex as AsyncMutex;
use tracing::debug;

use crate::channel::endpoint_channel::{DisconnectReason, EndpointChannel, SharedChannel};
use crate::endpoint::EndpointId;
use crate::wire::OfflineFrame;

/// Grace period `unregister` sleeps after best-effort writing a
/// `DISCONNECTION` frame, so it has a chance to leave the device before the
/// channel is torn down (§4.3, "kDataTransferDelay").
const DATA_TRANSFER_DELAY: Duration = Duration::from_millis(500);

#[derive(Default)]
struct Entry {
    channel: Option<SharedChannel>,
    /// An [`EncryptionContext`] that arrived via [`ChannelManager::encrypt`]
    /// before a channel was registered for this endpoint; applied the
    /// moment [`ChannelManager::register`] or [`ChannelManager::replace`]
    /// installs one (§4.3, "context may arrive before channel").
    pending_encryption: Option<EncryptionContext>,
}

/// Maintains `endpoint_id -> {channel, encryption_context, disconnect_reason}`
/// under a single mutex (§4.3). All mutating operations are `async` only
/// because they may perform channel I/O (best-effort disconnection frame,
/// encryption installation); the map itself is a plain `HashMap` behind one
/// lock, matching the base spec's "single mutex" resource policy.
#[derive(Default)]
pub struct ChannelManager {
    entries: AsyncMutex<HashMap<EndpointId, Entry>>,
}

impl ChannelManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a newly connected channel. If an entry already existed for
    /// `endpoint_id`, the old channel is closed after this call returns
    /// (callers must not keep stale shared references past this point). If
    /// an [`EncryptionContext`] arrived earlier via
    /// [`ChannelManager::encrypt`] for this endpoint, it is installed on
    /// `channel` immediately.
    pub async fn register(&self, endpoint_id: EndpointId, channel: SharedChannel) {
        let (previous, pending) = {
            let mut entries = self.entries.lock().await;
            let entry = entries.entry(endpoint_id).or_default();
            let previous = entry.channel.replace(channel);
            let pending = entry.pending_encryption.take();
            (previous, pending)
        };
        if let Some(ctx) = pending {
            self.get(endpoint_id).await.expect("just registered").enable_encryption(ctx).await;
        }
        if let Some(previous) = previous {
            debug!(?endpoint_id, "replacing channel on register");
            previous.close(DisconnectReason::UpgradedMedium).await;
        }
    }

    /// The bandwidth-upgrade variant of [`ChannelManager::register`]:
    /// inserts the new channel atomically. The caller is responsible for the
    /// handshake (`LAST_WRITE_TO_PRIOR_CHANNEL` / `SAFE_TO_CLOSE_PRIOR_CHANNEL`)
    /// that decides when to close the channel being replaced; this method
    /// does not close it. A pending [`EncryptionContext`] is applied the
    /// same way as in [`ChannelManager::register`].
    pub async fn replace(&self, endpoint_id: EndpointId, channel: SharedChannel) {
        let pending = {
            let mut entries = self.entries.lock().await;
            let entry = entries.entry(endpoint_id).or_default();
            entry.channel = Some(channel);
            entry.pending_encryption.take()
        };
        if let Some(ctx) = pending {
            self.get(endpoint_id).await.expect("just replaced").enable_encryption(ctx).await;
        }
    }

    /// Stores `ctx` and, if a channel is already registered, enables
    /// encryption on it immediately. Order-independent: calling this before
    /// [`ChannelManager::register`] stores `ctx` and applies it once the
    /// channel arrives (§4.3).
    pub async fn encrypt(&self, endpoint_id: EndpointId, ctx: EncryptionContext) {
        let channel = {
            let mut entries = self.entries.lock().await;
            let entry = entries.entry(endpoint_id).or_default();
            match &entry.channel {
                Some(channel) => Some(channel.clone()),
                None => {
                    entry.pending_encryption = Some(ctx);
                    None
                }
            }
        };
        if let Some(channel) = channel {
            channel.enable_encryption(ctx).await;
        }
    }

    /// Shared, reference-counted access to the current channel for
    /// `endpoint_id`, so a reader/writer task may keep reading/writing a
    /// channel across a concurrent `replace` (§4.3, §8).
    pub async fn get(&self, endpoint_id: EndpointId) -> Option<SharedChannel> {
        self.entries.lock().await.get(&endpoint_id).and_then(|e| e.channel.clone())
    }

    /// Resumes the channel if paused, writes a best-effort `DISCONNECTION`
    /// frame, sleeps [`DATA_TRANSFER_DELAY`], then removes and closes it.
    pub async fn unregister(&self, endpoint_id: EndpointId, reason: DisconnectReason) {
        let channel = self.entries.lock().await.remove(&endpoint_id).and_then(|e| e.channel);
        let Some(channel) = channel else { return };
        channel.resume();
        let _ = channel.write(&OfflineFrame::Disconnection.encode()).await;
        tokio::time::sleep(DATA_TRANSFER_DELAY).await;
        channel.close(reason).await;
    }

    /// Every endpoint id currently registered with a channel, for
    /// `stop_all_endpoints`.
    pub async fn endpoint_ids(&self) -> Vec<EndpointId> {
        self.entries.lock().await.iter().filter(|(_, e)| e.channel.is_some()).map(|(id, _)| *id).collect()
    }
}

impl std::fmt::Debug for ChannelManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelManager").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mediums::platform::{InMemoryMediums, PlatformMediums};
    use crate::options::Medium;
    use std::sync::Arc;

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
    async fn replace_swaps_the_shared_channel_atomically() {
        let mediums = InMemoryMediums::new();
        let manager = ChannelManager::new();
        let id = EndpointId::from_bytes(*b"ABCD");

        let (client_a, _server_a) = connected_pair(&mediums, "a").await;
        manager.register(id, client_a.clone()).await;
        assert!(Arc::ptr_eq(&manager.get(id).await.unwrap(), &client_a));

        let (client_b, _server_b) = connected_pair(&mediums, "b").await;
        manager.replace(id, client_b.clone()).await;
        let current = manager.get(id).await.unwrap();
        assert!(Arc::ptr_eq(&current, &client_b));

        // The old reference is still independently usable until dropped.
        assert!(!client_a.is_closed());
    }

    #[tokio::test]
    async fn unregister_removes_and_closes() {
        let mediums = InMemoryMediums::new();
        let manager = ChannelManager::new();
        let id = EndpointId::from_bytes(*b"WXYZ");
        let (client, _server) = connected_pair(&mediums, "c").await;
        manager.register(id, client.clone()).await;

        manager.unregister(id, DisconnectReason::LocalDisconnection).await;
        assert!(manager.get(id).await.is_none());
        assert!(client.is_closed());
    }

    /// A real [`EncryptionContext`], driven off the crate's handshake
    /// trait the same way the PCP controller derives one (§4.6, §4.8).
    fn a_context() -> EncryptionContext {
        use nearlink_crypto::{HandshakeStep, InProcessHandshake, Ukey2Handshake};

        let mut initiator: Box<dyn Ukey2Handshake> = Box::new(InProcessHandshake::new(true));
        let mut responder: Box<dyn Ukey2Handshake> = Box::new(InProcessHandshake::new(false));
        let initiator_msg = initiator.start().expect("initiator sends first");
        match responder.advance(&initiator_msg) {
            HandshakeStep::SendAndComplete(_msg, ctx) => ctx,
            other => panic!("unexpected step: {other:?}"),
        }
    }

    #[tokio::test]
    async fn encrypt_before_register_applies_on_registration() {
        // Per §4.3, a context may arrive before its channel; register()
        // must pull it back in and install it rather than silently
        // dropping it.
        let mediums = InMemoryMediums::new();
        let manager = ChannelManager::new();
        let id = EndpointId::from_bytes(*b"PQRS");

        manager.encrypt(id, a_context()).await;
        assert!(manager.get(id).await.is_none());

        let (client, server) = connected_pair(&mediums, "pending-encrypt").await;
        manager.register(id, client.clone()).await;

        // The channel now encrypts outbound frame bodies: the peer's raw
        // (undecrypted) read sees ciphertext, not "hello" verbatim. Had the
        // pending context been dropped, this would read back "hello".
        manager.get(id).await.unwrap().write(b"hello").await.unwrap();
        let wire_bytes = server.read().await.unwrap().unwrap();
        assert_ne!(wire_bytes, b"hello");
    }
}
