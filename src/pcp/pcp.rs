//! Pre-Connection Protocol: topology-aware advertising, discovery,
//! connection lifecycle, and bandwidth-upgrade orchestration (§4.6).

pub use controller::PcpController;
pub use session::{ClientSession, DiscoveredEndpoint};
pub use state::{ConnectionState, PendingConnection};

pub(crate) mod bandwidth_upgrade;
pub(crate) mod controller;
pub(crate) mod session;
pub mod state;
pub mod topology;
