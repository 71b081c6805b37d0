//! rtc-bridge - handle-based WebRTC bridge
//!
//! Exposes a native WebRTC engine to a host application that only speaks
//! integer and string handles: peer connections, local and remote media
//! streams, tracks and data channels.

pub mod args;
pub mod capture;
pub mod config;
pub mod engine;
pub mod transport;
pub mod web;
pub mod webrtc;

// Re-exports
pub use config::{BridgeConfig, EngineBackend};
pub use engine::{EngineError, PeerConnectionFactory};
pub use webrtc::{BridgeError, HostEvent, Pending, RtcBridge, UserMedia};
