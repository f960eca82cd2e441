//! The client-visible status taxonomy.

/// Outcome of a public API call or a terminal connection/payload event,
/// surfaced to the client through a `result_cb` or a listener callback. See
/// §6 ("Status taxonomy") of the specification.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
#[non_exhaustive]
pub enum Status {
    Success,
    Error,
    OutOfOrderApiCall,
    AlreadyHaveActiveStrategy,
    AlreadyAdvertising,
    AlreadyDiscovering,
    AlreadyListening,
    EndpointIoError,
    EndpointUnknown,
    ConnectionRejected,
    AlreadyConnectedToEndpoint,
    NotConnectedToEndpoint,
    BluetoothError,
    BleError,
    WifiLanError,
    PayloadUnknown,
    Reset,
    Timeout,
    Unknown,
}

impl Status {
    /// Returns `true` for [`Status::Success`].
    #[inline]
    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}
