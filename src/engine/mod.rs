//! Native engine abstraction
//!
//! The bridge never talks to a WebRTC implementation directly. It goes
//! through the traits below, which cover the peer connection factory, peer
//! connections, tracks and data channels. Engine callbacks come back as
//! [`EngineEvent`]s delivered to an [`EngineObserver`], possibly from engine
//! worker threads.

pub mod loopback;
#[cfg(feature = "webrtc-engine")]
pub mod webrtc_rs;

use crate::capture::CaptureSource;
use crate::webrtc::rtc_config::{DataChannelInit, MediaConstraints, RtcConfiguration};
use crate::webrtc::signaling::{
    IceCandidate, IceConnectionState, IceGatheringState, SessionDescription, SignalingState,
};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use serde::Serialize;
use std::any::Any;
use std::sync::Arc;

/// Failure reported by the native engine. The message is forwarded to the
/// host verbatim.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct EngineError(pub String);

impl EngineError {
    pub fn new(msg: impl Into<String>) -> Self {
        EngineError(msg.into())
    }
}

/// Media kind of a track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }
}

/// Track ready state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackState {
    Live,
    Ended,
}

/// A native media track (local capture or remote receiver)
pub trait NativeTrack: Send + Sync {
    fn id(&self) -> String;
    fn kind(&self) -> MediaKind;
    fn enabled(&self) -> bool;
    fn set_enabled(&self, enabled: bool);
    fn ready_state(&self) -> TrackState;
    fn as_any(&self) -> &dyn Any;
}

/// Compare two shared native objects by identity
pub fn same_object<T: ?Sized>(a: &Arc<T>, b: &Arc<T>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

/// Label the native engine gives to the stream it reuses for tracks
/// announced without an explicit stream
pub const DEFAULT_STREAM_LABEL: &str = "default";

/// Native media stream: a labelled container of audio and video tracks.
///
/// Identity is the `Arc` allocation; engines hand out the same `Arc` when
/// they re-announce a stream.
pub struct MediaStream {
    label: String,
    audio: RwLock<Vec<Arc<dyn NativeTrack>>>,
    video: RwLock<Vec<Arc<dyn NativeTrack>>>,
}

impl MediaStream {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            audio: RwLock::new(Vec::new()),
            video: RwLock::new(Vec::new()),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn audio_tracks(&self) -> Vec<Arc<dyn NativeTrack>> {
        self.audio.read().clone()
    }

    pub fn video_tracks(&self) -> Vec<Arc<dyn NativeTrack>> {
        self.video.read().clone()
    }

    /// Video tracks first, then audio
    pub fn tracks(&self) -> Vec<Arc<dyn NativeTrack>> {
        let mut all = self.video_tracks();
        all.extend(self.audio_tracks());
        all
    }

    /// Add a track; returns false if it is already part of the stream
    pub fn add_track(&self, track: Arc<dyn NativeTrack>) -> bool {
        let list = match track.kind() {
            MediaKind::Audio => &self.audio,
            MediaKind::Video => &self.video,
        };
        let mut list = list.write();
        if list.iter().any(|t| same_object(t, &track)) {
            return false;
        }
        list.push(track);
        true
    }

    /// Remove a track by native id; returns false if it was not present
    pub fn remove_track(&self, track_id: &str) -> bool {
        for list in [&self.audio, &self.video] {
            let mut list = list.write();
            if let Some(pos) = list.iter().position(|t| t.id() == track_id) {
                list.remove(pos);
                return true;
            }
        }
        false
    }
}

impl std::fmt::Debug for MediaStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaStream")
            .field("label", &self.label)
            .field("audio", &self.audio.read().len())
            .field("video", &self.video.read().len())
            .finish()
    }
}

/// Data channel ready state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DataChannelState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Payload sent or received on a data channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataChannelPayload {
    Text(String),
    Binary(Bytes),
}

/// A native data channel owned by a peer connection
#[async_trait]
pub trait NativeDataChannel: Send + Sync {
    /// Engine-assigned id, unique within the owning connection
    fn id(&self) -> i32;
    fn label(&self) -> String;
    fn state(&self) -> DataChannelState;
    async fn send(&self, payload: DataChannelPayload) -> Result<(), EngineError>;
    async fn close(&self);
}

/// Asynchronous engine callback
pub enum EngineEvent {
    IceCandidate(IceCandidate),
    IceGatheringChange(IceGatheringState),
    SignalingChange(SignalingState),
    IceConnectionChange(IceConnectionState),
    AddStream(Arc<MediaStream>),
    RemoveStream(Arc<MediaStream>),
    RenegotiationNeeded,
    /// Channel opened by the remote peer
    DataChannel(Arc<dyn NativeDataChannel>),
    DataChannelStateChange {
        id: i32,
        state: DataChannelState,
    },
    DataChannelMessage {
        id: i32,
        payload: DataChannelPayload,
    },
}

impl std::fmt::Debug for EngineEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineEvent::IceCandidate(c) => write!(f, "IceCandidate({})", c.candidate),
            EngineEvent::IceGatheringChange(s) => write!(f, "IceGatheringChange({:?})", s),
            EngineEvent::SignalingChange(s) => write!(f, "SignalingChange({:?})", s),
            EngineEvent::IceConnectionChange(s) => write!(f, "IceConnectionChange({:?})", s),
            EngineEvent::AddStream(s) => write!(f, "AddStream({})", s.label()),
            EngineEvent::RemoveStream(s) => write!(f, "RemoveStream({})", s.label()),
            EngineEvent::RenegotiationNeeded => write!(f, "RenegotiationNeeded"),
            EngineEvent::DataChannel(ch) => write!(f, "DataChannel({}, {})", ch.id(), ch.label()),
            EngineEvent::DataChannelStateChange { id, state } => {
                write!(f, "DataChannelStateChange({}, {:?})", id, state)
            }
            EngineEvent::DataChannelMessage { id, .. } => write!(f, "DataChannelMessage({})", id),
        }
    }
}

/// Receiver of engine callbacks. Must tolerate calls from any thread.
pub trait EngineObserver: Send + Sync {
    fn on_event(&self, event: EngineEvent);
}

/// A native peer connection
#[async_trait]
pub trait NativePeerConnection: Send + Sync {
    /// Signaling state as tracked by the engine
    fn signaling_state(&self) -> SignalingState;

    async fn create_offer(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<SessionDescription, EngineError>;

    async fn create_answer(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<SessionDescription, EngineError>;

    async fn set_local_description(&self, sdp: SessionDescription) -> Result<(), EngineError>;

    async fn set_remote_description(&self, sdp: SessionDescription) -> Result<(), EngineError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), EngineError>;

    async fn set_configuration(&self, config: &RtcConfiguration) -> Result<(), EngineError>;

    async fn add_stream(&self, stream: Arc<MediaStream>) -> Result<(), EngineError>;

    async fn remove_stream(&self, stream: &Arc<MediaStream>) -> Result<(), EngineError>;

    async fn create_data_channel(
        &self,
        label: &str,
        init: &DataChannelInit,
    ) -> Result<Arc<dyn NativeDataChannel>, EngineError>;

    /// Stats report, restricted to `track_id` when given
    async fn get_stats(&self, track_id: Option<&str>) -> Result<serde_json::Value, EngineError>;

    async fn close(&self);
}

/// Process-wide engine factory, created once at startup and shared
/// read-only by every connection.
#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create_peer_connection(
        &self,
        config: &RtcConfiguration,
        constraints: &MediaConstraints,
        observer: Arc<dyn EngineObserver>,
    ) -> Result<Arc<dyn NativePeerConnection>, EngineError>;

    fn create_local_media_stream(&self, label: &str) -> Arc<MediaStream> {
        Arc::new(MediaStream::new(label))
    }

    fn create_audio_track(&self, id: &str) -> Result<Arc<dyn NativeTrack>, EngineError>;

    fn create_video_track(
        &self,
        id: &str,
        source: &CaptureSource,
    ) -> Result<Arc<dyn NativeTrack>, EngineError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::loopback::LoopbackTrack;

    #[test]
    fn test_stream_track_bookkeeping() {
        let stream = MediaStream::new("s1");
        let audio: Arc<dyn NativeTrack> = Arc::new(LoopbackTrack::new("a1", MediaKind::Audio));
        let video: Arc<dyn NativeTrack> = Arc::new(LoopbackTrack::new("v1", MediaKind::Video));

        assert!(stream.add_track(audio.clone()));
        assert!(!stream.add_track(audio.clone()));
        assert!(stream.add_track(video));
        assert_eq!(stream.tracks().len(), 2);
        assert_eq!(stream.tracks()[0].id(), "v1");

        assert!(stream.remove_track("a1"));
        assert!(!stream.remove_track("a1"));
        assert!(stream.audio_tracks().is_empty());
    }

    #[test]
    fn test_same_object_identity() {
        let a = Arc::new(MediaStream::new(DEFAULT_STREAM_LABEL));
        let b = Arc::new(MediaStream::new(DEFAULT_STREAM_LABEL));
        assert!(same_object(&a, &a.clone()));
        assert!(!same_object(&a, &b));
    }
}
