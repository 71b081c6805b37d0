//! Handle-based WebRTC bridge
//!
//! This module provides the bridge between a host application and the
//! native engine:
//! - Configuration parsing (`rtc_config`)
//! - SDP/ICE wire types and the signaling state model (`signaling`)
//! - Connection / stream / track registry (`registry`)
//! - Per-connection operation worker (`peer_connection`)
//! - Event relay and data channel manager
//! - The command surface, [`RtcBridge`]

pub mod bridge;
pub mod data_channel;
pub mod event_relay;
pub mod peer_connection;
pub mod registry;
pub mod rtc_config;
pub mod signaling;

pub use bridge::{RtcBridge, UserMedia};
pub use event_relay::{HostEvent, TrackInfo};
pub use peer_connection::Pending;
pub use signaling::{IceCandidate, SdpType, SessionDescription, SignalingState};

use crate::engine::EngineError;

/// Failure of a bridge command. The `Display` text is the failure string
/// reported to the host.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BridgeError {
    #[error("PeerConnection {0} not found")]
    ConnectionNotFound(i32),

    #[error("MediaStream {0} not found")]
    StreamNotFound(String),

    #[error("MediaStreamTrack {0} not found")]
    TrackNotFound(String),

    #[error("DataChannel {channel} of PeerConnection {connection} not found")]
    DataChannelNotFound { connection: i32, channel: i32 },

    #[error("PeerConnection {0} already exists")]
    DuplicateConnection(i32),

    #[error("{operation} called in wrong state: {state}")]
    InvalidState {
        operation: &'static str,
        state: SignalingState,
    },

    #[error("Invalid session description: {0}")]
    InvalidDescription(String),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("{0}")]
    Engine(String),

    #[error("PeerConnection {0} is closed")]
    Closed(i32),
}

impl From<EngineError> for BridgeError {
    fn from(err: EngineError) -> Self {
        BridgeError::Engine(err.0)
    }
}

impl BridgeError {
    /// True for the handle-resolution failures
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            BridgeError::ConnectionNotFound(_)
                | BridgeError::StreamNotFound(_)
                | BridgeError::TrackNotFound(_)
                | BridgeError::DataChannelNotFound { .. }
        )
    }
}
