//! Bandwidth-upgrade orchestration (§4.6, "upgrade to a higher-bandwidth
//! medium once a connection is established").
//!
//! The base spec's upgrade negotiation picks a target medium from the
//! intersection of both sides' advertised capabilities and re-derives a
//! fresh encryption key for the new channel. This crate simplifies both:
//! the target is always [`Medium::WifiLan`], and the upgraded channel
//! carries no encryption at all (`EncryptionContext` isn't `Clone`, and a
//! second UKEY2 round per upgrade was judged out of scope). The
//! `LAST_WRITE_TO_PRIOR_CHANNEL` / `SAFE_TO_CLOSE_PRIOR_CHANNEL` handshake is
//! sent best-effort rather than fully synchronized with the peer.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::callback::Event;
use crate::channel::endpoint_channel::{DisconnectReason, EndpointChannel};
use crate::endpoint::{ClientId, EndpointId};
use crate::endpoint_manager::endpoint_manager::KeepAliveParams;
use crate::options::Medium;
use crate::pcp::state::ConnectionState;
use crate::status::Status;
use crate::wire::{BandwidthUpgradeEvent, OfflineFrame, UpgradePathInfo};

use super::controller::PcpController;

/// Grace period between telling the peer we're done writing to the prior
/// channel and actually closing it, so any frame already in flight has a
/// chance to arrive.
const PRIOR_CHANNEL_CLOSE_DELAY: Duration = Duration::from_millis(200);

fn rendezvous_name(a: EndpointId, b: EndpointId) -> String {
    let (a, b) = if a.as_str() <= b.as_str() { (a, b) } else { (b, a) };
    format!("bwu-{a}-{b}")
}

/// Initiates an upgrade for `endpoint_id` on behalf of `client` (§6.1
/// `initiateBandwidthUpgrade`). Only valid once the connection is
/// `ESTABLISHED`.
pub(crate) async fn initiate(controller: &Arc<PcpController>, client: ClientId, endpoint_id: EndpointId) -> Status {
    let local_endpoint_id = {
        let sessions = controller.sessions.lock().await;
        let Some(session) = sessions.get(&client) else { return Status::NotConnectedToEndpoint };
        match session.connections.get(&endpoint_id) {
            Some(c) if c.state == ConnectionState::Established => {}
            _ => return Status::NotConnectedToEndpoint,
        }
        session.local_endpoint_id
    };

    let name = rendezvous_name(local_endpoint_id, endpoint_id);
    if let Err(e) = controller.mediums.listen(Medium::WifiLan, &name).await {
        warn!(?endpoint_id, error = %e, "bandwidth upgrade listen failed");
        return e.to_status();
    }

    let info = UpgradePathInfo { medium: Medium::WifiLan, ip_address: None, port: None, ssid: Some(name.clone()), credentials: None };
    controller
        .endpoints
        .send_control(endpoint_id, OfflineFrame::BandwidthUpgradeNegotiation { event: BandwidthUpgradeEvent::UpgradePathAvailable(info) })
        .await;

    let controller = Arc::clone(controller);
    tokio::spawn(async move {
        let stream = match controller.mediums.accept(Medium::WifiLan, &name).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(?endpoint_id, error = %e, "bandwidth upgrade accept failed");
                controller.mediums.stop_listening(Medium::WifiLan, &name).await;
                return;
            }
        };
        controller.mediums.stop_listening(Medium::WifiLan, &name).await;
        let new_channel = Arc::new(EndpointChannel::new(Medium::WifiLan, stream));
        swap_channel(&controller, client, endpoint_id, new_channel).await;
    });

    Status::Success
}

/// Handles an inbound `UPGRADE_PATH_AVAILABLE` event: dials the advertised
/// rendezvous and swaps the endpoint onto it (§4.6).
pub(crate) async fn handle_upgrade_path_available(controller: &Arc<PcpController>, client: ClientId, endpoint_id: EndpointId, info: UpgradePathInfo) {
    let Some(name) = info.ssid else {
        warn!(?endpoint_id, "upgrade path advertised with no rendezvous name");
        return;
    };
    let stream = match controller.mediums.connect(info.medium, &name).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(?endpoint_id, error = %e, "bandwidth upgrade dial failed");
            return;
        }
    };
    let new_channel = Arc::new(EndpointChannel::new(info.medium, stream));

    let local_endpoint_id = {
        let sessions = controller.sessions.lock().await;
        sessions.get(&client).map(|s| s.local_endpoint_id)
    };
    if let Some(local_endpoint_id) = local_endpoint_id {
        let _ = new_channel
            .write(&OfflineFrame::BandwidthUpgradeNegotiation { event: BandwidthUpgradeEvent::ClientIntroduction { endpoint_id: local_endpoint_id } }.encode())
            .await;
    }

    swap_channel(controller, client, endpoint_id, new_channel).await;
}

/// Registers `new_channel` as `endpoint_id`'s channel in place of whatever
/// is currently registered, restarting the endpoint manager's reader/writer
/// pair on it while keeping the same `IncomingFrame`/`EndpointClosed`
/// receivers the endpoint's dispatch loop is already draining (§4.4,
/// `EndpointManager::start` takes fresh senders every call, so the prior
/// ones must be reused rather than dropped).
async fn swap_channel(controller: &Arc<PcpController>, client: ClientId, endpoint_id: EndpointId, new_channel: Arc<EndpointChannel>) {
    let Some(senders) = controller.endpoint_signal_senders.lock().await.get(&endpoint_id).cloned() else {
        warn!(?endpoint_id, "bandwidth upgrade completed after the endpoint was torn down");
        return;
    };

    let old_channel = controller.channels.get(endpoint_id).await;
    if let Some(old_channel) = &old_channel {
        let _ = old_channel.write(&OfflineFrame::BandwidthUpgradeNegotiation { event: BandwidthUpgradeEvent::LastWriteToPriorChannel }.encode()).await;
    }

    controller.channels.replace(endpoint_id, Arc::clone(&new_channel)).await;
    let (incoming_tx, closed_tx) = senders;
    controller.endpoints.start(endpoint_id, new_channel, KeepAliveParams::default(), incoming_tx, closed_tx).await;
    controller.endpoints.send_control(endpoint_id, OfflineFrame::BandwidthUpgradeNegotiation { event: BandwidthUpgradeEvent::SafeToClosePriorChannel }).await;

    if let Some(old_channel) = old_channel {
        tokio::spawn(async move {
            tokio::time::sleep(PRIOR_CHANNEL_CLOSE_DELAY).await;
            old_channel.close(DisconnectReason::UpgradedMedium).await;
        });
    }

    debug!(?endpoint_id, "bandwidth upgraded to wifi lan");
    let sessions = controller.sessions.lock().await;
    if let Some(session) = sessions.get(&client) {
        let callbacks = Arc::clone(&session.callbacks);
        drop(sessions);
        callbacks.send(Event::BandwidthChanged { endpoint_id, medium: Medium::WifiLan }).await;
    }
}
