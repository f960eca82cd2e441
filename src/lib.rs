//! Nearlink: a peer-to-peer connection framework.
//!
//! Advertises and discovers nearby peers, negotiates an encrypted
//! connection between them, exchanges byte/stream/file payloads, and
//! opportunistically upgrades an established connection to a
//! higher-bandwidth medium.
//!
//! [`Core`] is the entry point; everything else is reached through it.
//! [`mediums::platform::PlatformMediums`] is the one seam between this
//! crate and an actual host platform — see [`mediums::platform::InMemoryMediums`]
//! for the in-process implementation the test suite is written against.

#![cfg_attr(not(test), warn(unused_crate_dependencies))]

pub use callback::{ConnectionLifecycleListener, DiscoveryListener, Event, PayloadListener};
pub use core_facade::Core;
pub use endpoint::{ClientId, EndpointId, EndpointInfo, OutOfBandMetadata, MAX_ENDPOINT_INFO_LEN};
pub use error::{Error, Result};
pub use options::{AllowedMediums, ConnectionOptions, Medium, Strategy};
pub use payload::{Payload, PayloadId, PayloadKind, PayloadProgress, ReceivedPayload, TransferStatus};
pub use status::Status;

pub mod callback;
#[path = "channel/channel.rs"]
pub mod channel;
#[path = "core.rs"]
mod core_facade;
pub mod endpoint;
pub mod endpoint_manager {
    //! Per-endpoint reader/writer tasks and frame dispatch (§4.4).
    #[path = "endpoint_manager/endpoint_manager.rs"]
    pub mod endpoint_manager;
}
pub mod error;
#[path = "mediums/mediums.rs"]
pub mod mediums;
pub mod options;
pub mod payload;
pub mod payload_manager {
    //! Outgoing/incoming payload state, fragmentation, flow control, and
    //! progress (§4.5).
    #[path = "payload_manager/payload_manager.rs"]
    pub mod payload_manager;
}
#[path = "pcp/pcp.rs"]
pub mod pcp;
pub mod status;
#[path = "wire/wire.rs"]
pub mod wire;
