//! The endpoint channel abstraction and its registry (§4.2, §4.3).

pub use channel_manager::ChannelManager;
pub use endpoint_channel::{DisconnectReason, EndpointChannel, SharedChannel};

pub mod channel_manager;
pub mod endpoint_channel;
