//! Per-endpoint connection state machine shared by all three topology
//! flavors (§4.6): `LISTENING -> PENDING_AUTH -> ESTABLISHED/REJECTED/CLOSED`.
//! `IDLE`/`LISTENING` at the *client session* level (no advertising/discovery
//! active yet) are tracked by [`super::pcp::PcpController`] directly, since
//! they have no per-endpoint data to carry.

use nearlink_crypto::Ukey2Handshake;

use crate::endpoint::EndpointInfo;

/// Where one pending or active connection currently sits in the PCP state
/// machine.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionState {
    PendingAuth,
    Established,
    Rejected,
    Closed,
}

/// All state the controller keeps for one endpoint between
/// `RemoteConnectionRequest` and `ESTABLISHED`/`REJECTED`/`CLOSED`.
pub struct PendingConnection {
    pub state: ConnectionState,
    pub is_initiator: bool,
    pub remote_info: EndpointInfo,
    pub handshake: Box<dyn Ukey2Handshake>,
    pub auth_token: Option<String>,
    pub local_decision: Option<bool>,
    pub remote_decision: Option<bool>,
}

impl PendingConnection {
    #[must_use]
    pub fn new(is_initiator: bool, remote_info: EndpointInfo, handshake: Box<dyn Ukey2Handshake>) -> Self {
        Self {
            state: ConnectionState::PendingAuth,
            is_initiator,
            remote_info,
            handshake,
            auth_token: None,
            local_decision: None,
            remote_decision: None,
        }
    }

    /// Whether both the local client and the remote peer have reported
    /// `Accept`, per "`PENDING_AUTH -BothAccept-> ESTABLISHED`" (§4.6).
    #[must_use]
    pub fn both_accepted(&self) -> bool {
        self.local_decision == Some(true) && self.remote_decision == Some(true)
    }

    /// Whether either side has reported `Reject`, per
    /// "`PENDING_AUTH -EitherReject-> REJECTED`" (§4.6).
    #[must_use]
    pub fn either_rejected(&self) -> bool {
        self.local_decision == Some(false) || self.remote_decision == Some(false)
    }
}

impl std::fmt::Debug for PendingConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingConnection")
            .field("state", &self.state)
            .field("is_initiator", &self.is_initiator)
            .field("local_decision", &self.local_decision)
            .field("remote_decision", &self.remote_decision)
            .finish_non_exhaustive()
    }
}
