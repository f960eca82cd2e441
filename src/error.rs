//! Crate-wide error type.
//!
//! Internal failures are represented by [`Error`]; at the client callback
//! boundary they are mapped to the much smaller, `Copy` [`crate::Status`]
//! enum that actually crosses into application code (see
//! [`Error::to_status`]). The API serializer never propagates an `Error`
//! directly to a caller.

use crate::status::Status;

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Internal failure cause. See [`Status`] for the smaller, client-visible
/// taxonomy these collapse into.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The wire codec rejected a frame: bad length prefix, unknown frame
    /// type for the required fields, or a `total_size` that does not match
    /// the sum of the chunks received.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// A frame exceeded `MAX_FRAME_SIZE`.
    #[error("frame of {size} bytes exceeds the {limit} byte limit")]
    FrameTooLarge { size: usize, limit: usize },

    /// The underlying transport failed; the channel is now permanently
    /// closed.
    #[error("channel i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// An operation was attempted on an endpoint the channel manager, the
    /// endpoint manager, or the payload manager has no record of.
    #[error("unknown endpoint {0:?}")]
    UnknownEndpoint(crate::endpoint::EndpointId),

    /// An operation was attempted on a payload with no matching transfer
    /// state.
    #[error("unknown payload {0}")]
    UnknownPayload(u64),

    /// A public API call was made while the client's state machine was not
    /// in the state that call requires (e.g. `AcceptConnection` outside
    /// `PENDING_AUTH`).
    #[error("out of order api call in state {0:?}")]
    OutOfOrderApiCall(&'static str),

    /// Key-agreement failed.
    #[error("encryption handshake failed: {0}")]
    Crypto(#[from] nearlink_crypto::CryptoError),

    /// A topology rule (1:1, 1:N) was violated.
    #[error("already connected to endpoint {0:?}")]
    AlreadyConnected(crate::endpoint::EndpointId),

    /// The operation was cancelled via a [`tokio_util::sync::CancellationToken`].
    #[error("operation cancelled")]
    Cancelled,

    /// A medium-specific resource (socket bind, GATT service registration)
    /// could not be acquired.
    #[error("{medium:?} medium error: {reason}")]
    Medium { medium: crate::options::Medium, reason: String },

    /// The operation did not complete within its deadline.
    #[error("operation timed out")]
    Timeout,

    /// `startAdvertising`/`startDiscovery` selected a [`crate::options::Strategy`]
    /// that conflicts with one already active for this client (§3: "a client
    /// owns 0..1 active strategy").
    #[error("client already has an active strategy")]
    AlreadyHaveActiveStrategy,

    /// `startAdvertising` was called while this client was already
    /// advertising.
    #[error("client is already advertising")]
    AlreadyAdvertising,

    /// `startDiscovery` was called while this client was already
    /// discovering.
    #[error("client is already discovering")]
    AlreadyDiscovering,

    /// `startAdvertising` was called while this client was already
    /// listening for inbound connections on the selected medium.
    #[error("client is already listening")]
    AlreadyListening,

    /// The remote (or local) side rejected a pending connection during
    /// `PENDING_AUTH`.
    #[error("connection rejected")]
    ConnectionRejected,

    /// `sendPayload`/`disconnectFromEndpoint` named an endpoint that is not
    /// in the client's established-connections set.
    #[error("not connected to endpoint {0:?}")]
    NotConnectedToEndpoint(crate::endpoint::EndpointId),
}

impl Error {
    /// Maps an internal error to the client-visible [`Status`] closest in
    /// meaning, per §7 of the specification ("each task handles its own
    /// local errors; only disconnection and payload-failure are raised to
    /// the client").
    #[must_use]
    pub fn to_status(&self) -> Status {
        match self {
            Error::MalformedFrame(_) | Error::FrameTooLarge { .. } | Error::Io(_) => {
                Status::EndpointIoError
            }
            Error::UnknownEndpoint(_) => Status::EndpointUnknown,
            Error::UnknownPayload(_) => Status::PayloadUnknown,
            Error::OutOfOrderApiCall(_) => Status::OutOfOrderApiCall,
            Error::Crypto(_) => Status::Error,
            Error::AlreadyConnected(_) => Status::AlreadyConnectedToEndpoint,
            Error::Cancelled => Status::Reset,
            Error::Timeout => Status::Timeout,
            Error::Medium { medium, .. } => medium.error_status(),
            Error::AlreadyHaveActiveStrategy => Status::AlreadyHaveActiveStrategy,
            Error::AlreadyAdvertising => Status::AlreadyAdvertising,
            Error::AlreadyDiscovering => Status::AlreadyDiscovering,
            Error::AlreadyListening => Status::AlreadyListening,
            Error::ConnectionRejected => Status::ConnectionRejected,
            Error::NotConnectedToEndpoint(_) => Status::NotConnectedToEndpoint,
        }
    }
}
