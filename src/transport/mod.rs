//! Transport layer for rtc-bridge
//!
//! The host drives the bridge over a WebSocket carrying JSON command frames.

pub mod host_link;
pub mod protocol;

pub use host_link::handle_host_connection;
pub use protocol::{HostCommand, HostFrame, HostReply};
