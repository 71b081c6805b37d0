//! Bridge command surface
//!
//! [`RtcBridge`] is what the host drives: every command takes host handles
//! (integer connection handles, string stream / track handles), resolves
//! them through the registry and either acts immediately or queues the
//! work on the owning connection's worker. Asynchronous results come back
//! as [`Pending`] values; engine callbacks come out of the event receiver
//! returned by [`RtcBridge::new`].

use super::data_channel::{decode_payload, DataChannelManager};
use super::event_relay::{EventRelay, HostEvent, TrackInfo};
use super::peer_connection::{Pending, PeerConnection, Worker};
use super::registry::Registry;
use super::rtc_config::{DataChannelInit, MediaConstraints, RtcConfiguration, UserMediaConstraints};
use super::signaling::{IceCandidate, SdpType, SessionDescription};
use super::BridgeError;
use crate::capture::{CaptureSource, MediaCapture, SourceInfo};
use crate::engine::{MediaKind, NativeTrack, PeerConnectionFactory};
use log::{debug, info, warn};
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Result of `getUserMedia`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserMedia {
    #[serde(rename = "streamId")]
    pub stream_id: String,
    pub tracks: Vec<TrackInfo>,
}

/// Handle-based bridge between a host and the native engine
pub struct RtcBridge {
    /// Process-wide engine factory
    factory: Arc<dyn PeerConnectionFactory>,
    /// Camera collaborator
    capture: Arc<dyn MediaCapture>,
    registry: Arc<Registry>,
    relay: Arc<EventRelay>,
    channels: DataChannelManager,
}

impl RtcBridge {
    /// Create a bridge. Host events are delivered on the returned receiver.
    pub fn new(
        factory: Arc<dyn PeerConnectionFactory>,
        capture: Arc<dyn MediaCapture>,
    ) -> (Self, mpsc::UnboundedReceiver<HostEvent>) {
        let registry = Arc::new(Registry::new());
        let (tx, rx) = mpsc::unbounded_channel();
        let relay = Arc::new(EventRelay::new(registry.clone(), capture.clone(), tx));
        let bridge = Self {
            factory,
            capture,
            channels: DataChannelManager::new(registry.clone()),
            registry,
            relay,
        };
        (bridge, rx)
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn connection_count(&self) -> usize {
        self.registry.connection_count()
    }

    fn connection(&self, handle: i32) -> Result<Arc<PeerConnection>, BridgeError> {
        self.registry
            .connection(handle)
            .ok_or(BridgeError::ConnectionNotFound(handle))
    }

    // Connection lifecycle

    /// Create connection `handle`. The native connection is built on the
    /// connection's worker; commands issued right away queue behind it.
    ///
    /// The worker is spawned with `tokio::spawn`, so this must be called
    /// from within a tokio runtime and panics otherwise.
    pub fn init_connection(
        &self,
        config: Option<&Value>,
        constraints: Option<&Value>,
        handle: i32,
    ) -> Result<(), BridgeError> {
        let config = RtcConfiguration::parse(config);
        let constraints = MediaConstraints::parse(constraints);
        let (connection, ops) = PeerConnection::new(handle, config, constraints);
        self.registry.insert_connection(handle, connection.clone())?;

        let worker = Worker {
            observer: self.relay.observer(&connection),
            connection,
            registry: self.registry.clone(),
            factory: self.factory.clone(),
            channels: self.channels.clone(),
        };
        tokio::spawn(worker.run(ops));
        info!("PeerConnection {} initialised", handle);
        Ok(())
    }

    /// Replace the configuration of `handle`. The stored configuration only
    /// changes once the engine accepted the new one.
    pub fn set_configuration(&self, config: Option<&Value>, handle: i32) -> Pending<()> {
        match self.connection(handle) {
            Ok(connection) => connection.set_configuration(RtcConfiguration::parse(config)),
            Err(e) => Pending::ready(Err(e)),
        }
    }

    /// Close `handle`. The handle and everything it owns are gone when this
    /// returns; the native close runs on the worker afterwards.
    pub fn close(&self, handle: i32) -> Result<(), BridgeError> {
        let Some(evicted) = self.registry.evict_connection(handle) else {
            debug!("peerConnectionClose() peerConnection {} is null", handle);
            return Err(BridgeError::ConnectionNotFound(handle));
        };
        for removed in &evicted.streams {
            self.relay.release_tracks(removed);
        }
        evicted.connection.submit_close();
        info!(
            "PeerConnection {} closing ({} remote streams, {} data channels dropped)",
            handle,
            evicted.streams.len(),
            evicted.channels.len()
        );
        Ok(())
    }

    /// Close every connection
    pub fn shutdown(&self) {
        for handle in self.registry.connection_handles() {
            let _ = self.close(handle);
        }
    }

    // Local media

    /// Create a local stream with the requested audio / video tracks
    pub fn get_user_media(&self, constraints: Option<&Value>) -> Result<UserMedia, BridgeError> {
        let constraints = UserMediaConstraints::parse(constraints);
        if !constraints.audio && constraints.video.is_none() {
            return Err(BridgeError::InvalidPayload(
                "getUserMedia requires audio or video".to_string(),
            ));
        }

        let stream_id = self.registry.mint_stream_id();
        let mut reserved = vec![stream_id.clone()];
        let mut tracks: Vec<(String, Arc<dyn NativeTrack>, Option<CaptureSource>)> = Vec::new();

        let result = (|| -> Result<(), BridgeError> {
            if constraints.audio {
                let id = self.registry.mint_track_id();
                reserved.push(id.clone());
                let track = self.factory.create_audio_track(&id)?;
                tracks.push((id, track, None));
            }
            if let Some(ref video) = constraints.video {
                let id = self.registry.mint_track_id();
                reserved.push(id.clone());
                let source = self.capture.open_video_source(&id, video)?;
                match self.factory.create_video_track(&id, &source) {
                    Ok(track) => tracks.push((id, track, Some(source))),
                    Err(e) => {
                        self.capture.release_video_source(&id);
                        return Err(e.into());
                    }
                }
            }
            Ok(())
        })();

        if let Err(e) = result {
            warn!("getUserMedia() failed: {}", e);
            for (id, _, source) in &tracks {
                if source.is_some() {
                    self.capture.release_video_source(id);
                }
            }
            self.registry.release_reservations(&reserved);
            return Err(e);
        }

        let stream = self.factory.create_local_media_stream(&stream_id);
        let mut infos = Vec::with_capacity(tracks.len());
        for (id, track, _) in &tracks {
            stream.add_track(track.clone());
            infos.push(TrackInfo::new(id, track, false));
        }
        self.registry
            .insert_local_stream(stream_id.clone(), stream, tracks);
        info!("getUserMedia() created stream {}", stream_id);

        Ok(UserMedia {
            stream_id,
            tracks: infos,
        })
    }

    /// Capture sources offered by the camera collaborator
    pub fn get_sources(&self) -> Vec<SourceInfo> {
        self.capture.sources()
    }

    pub fn add_stream(&self, stream_id: &str, handle: i32) -> Pending<()> {
        let Some(stream) = self.registry.stream(stream_id) else {
            debug!("peerConnectionAddStream() mediaStream is null");
            return Pending::ready(Err(BridgeError::StreamNotFound(stream_id.to_string())));
        };
        match self.connection(handle) {
            Ok(connection) => connection.add_stream(stream_id.to_string(), stream),
            Err(e) => Pending::ready(Err(e)),
        }
    }

    pub fn remove_stream(&self, stream_id: &str, handle: i32) -> Pending<()> {
        let Some(stream) = self.registry.stream(stream_id) else {
            debug!("peerConnectionRemoveStream() mediaStream is null");
            return Pending::ready(Err(BridgeError::StreamNotFound(stream_id.to_string())));
        };
        match self.connection(handle) {
            Ok(connection) => connection.remove_stream(stream_id.to_string(), stream),
            Err(e) => Pending::ready(Err(e)),
        }
    }

    // Signaling

    /// Create an offer. Without host constraints the default offer
    /// constraints apply.
    pub fn create_offer(&self, handle: i32, constraints: Option<&Value>) -> Pending<SessionDescription> {
        let constraints = match constraints {
            Some(value) if !value.is_null() => MediaConstraints::parse(Some(value)),
            _ => MediaConstraints::default_offer(),
        };
        match self.connection(handle) {
            Ok(connection) => connection.create_offer(constraints),
            Err(e) => Pending::ready(Err(e)),
        }
    }

    pub fn create_answer(&self, handle: i32, constraints: Option<&Value>) -> Pending<SessionDescription> {
        let constraints = MediaConstraints::parse(constraints);
        match self.connection(handle) {
            Ok(connection) => connection.create_answer(constraints),
            Err(e) => Pending::ready(Err(e)),
        }
    }

    pub fn set_local_description(&self, sdp: &Value, handle: i32) -> Pending<()> {
        let connection = match self.connection(handle) {
            Ok(connection) => connection,
            Err(e) => return Pending::ready(Err(e)),
        };
        match parse_description(sdp) {
            Ok(sdp) => connection.set_local_description(sdp),
            Err(e) => Pending::ready(Err(e)),
        }
    }

    pub fn set_remote_description(&self, sdp: &Value, handle: i32) -> Pending<()> {
        let connection = match self.connection(handle) {
            Ok(connection) => connection,
            Err(e) => return Pending::ready(Err(e)),
        };
        match parse_description(sdp) {
            Ok(sdp) => connection.set_remote_description(sdp),
            Err(e) => Pending::ready(Err(e)),
        }
    }

    /// Add a remote ICE candidate and report plain success / failure. The
    /// candidate is queued before this returns, so it runs in order with
    /// the connection's other operations even if the future is awaited
    /// elsewhere.
    pub fn add_ice_candidate(
        &self,
        candidate: &Value,
        handle: i32,
    ) -> impl Future<Output = bool> + Send + 'static {
        let pending = self.submit_candidate(candidate, handle);
        async move { matches!(pending.wait().await, Some(Ok(()))) }
    }

    fn submit_candidate(&self, candidate: &Value, handle: i32) -> Pending<()> {
        let Ok(connection) = self.connection(handle) else {
            debug!("peerConnectionAddICECandidate() peerConnection {} is null", handle);
            return Pending::ready(Err(BridgeError::ConnectionNotFound(handle)));
        };
        match serde_json::from_value::<IceCandidate>(candidate.clone()) {
            Ok(candidate) => connection.add_ice_candidate(candidate),
            Err(e) => {
                debug!("peerConnectionAddICECandidate() bad candidate: {}", e);
                Pending::ready(Err(BridgeError::InvalidPayload(e.to_string())))
            }
        }
    }

    /// Stats of `handle`, restricted to one track when `track_id` is given
    pub fn get_stats(&self, track_id: Option<&str>, handle: i32) -> Pending<Value> {
        let connection = match self.connection(handle) {
            Ok(connection) => connection,
            Err(e) => return Pending::ready(Err(e)),
        };
        let native_id = match track_id.filter(|id| !id.is_empty()) {
            Some(id) => match self.registry.track(id) {
                Some(track) => Some(track.id()),
                None => return Pending::ready(Err(BridgeError::TrackNotFound(id.to_string()))),
            },
            None => None,
        };
        connection.get_stats(native_id)
    }

    // Tracks

    /// Enable or disable a track. Setting the current value again does not
    /// reach the engine.
    pub fn track_set_enabled(&self, track_id: &str, enabled: bool) -> Result<(), BridgeError> {
        let Some(track) = self.registry.track(track_id) else {
            debug!("mediaStreamTrackSetEnabled() track is null");
            return Err(BridgeError::TrackNotFound(track_id.to_string()));
        };
        if track.enabled() != enabled {
            track.set_enabled(enabled);
        }
        Ok(())
    }

    /// Stop a track: disable it, release its camera and drop its handle
    pub fn track_stop(&self, track_id: &str) -> Result<(), BridgeError> {
        let Some(entry) = self.registry.remove_track(track_id) else {
            debug!("mediaStreamTrackStop() track is null");
            return Err(BridgeError::TrackNotFound(track_id.to_string()));
        };
        if entry.track.enabled() {
            entry.track.set_enabled(false);
        }
        if entry.track.kind() == MediaKind::Video {
            self.capture.release_video_source(track_id);
        }
        Ok(())
    }

    pub fn track_switch_camera(&self, track_id: &str) -> Result<(), BridgeError> {
        let Some(entry) = self.registry.track_entry(track_id) else {
            debug!("mediaStreamTrackSwitchCamera() track is null");
            return Err(BridgeError::TrackNotFound(track_id.to_string()));
        };
        if entry.source.is_none() {
            debug!("mediaStreamTrackSwitchCamera() track {} has no camera", track_id);
            return Ok(());
        }
        if let Some(source) = self.capture.switch_camera(track_id) {
            self.registry.set_track_source(track_id, Some(source));
        }
        Ok(())
    }

    /// Remove a track from its stream and drop its handle
    pub fn track_release(&self, stream_id: &str, track_id: &str) -> Result<(), BridgeError> {
        let Some(stream) = self.registry.stream(stream_id) else {
            debug!("mediaStreamTrackRelease() stream is null");
            return Err(BridgeError::StreamNotFound(stream_id.to_string()));
        };
        let Some(entry) = self.registry.remove_track(track_id) else {
            debug!("mediaStreamTrackRelease() track is null");
            return Err(BridgeError::TrackNotFound(track_id.to_string()));
        };
        if entry.track.enabled() {
            entry.track.set_enabled(false);
        }
        stream.remove_track(&entry.track.id());
        if entry.track.kind() == MediaKind::Video {
            self.capture.release_video_source(track_id);
        }
        Ok(())
    }

    /// Drop a stream and all of its tracks
    pub fn release_stream(&self, stream_id: &str) -> Result<(), BridgeError> {
        let Some(removed) = self.registry.release_stream(stream_id) else {
            debug!("mediaStreamRelease() mediaStream is null");
            return Err(BridgeError::StreamNotFound(stream_id.to_string()));
        };
        self.relay.release_tracks(&removed);
        Ok(())
    }

    // Data channels

    /// Create a data channel; resolves to the engine-assigned channel id
    pub fn create_data_channel(
        &self,
        handle: i32,
        label: &str,
        config: Option<&Value>,
    ) -> Pending<i32> {
        match self.connection(handle) {
            Ok(connection) => {
                connection.create_data_channel(label.to_string(), DataChannelInit::parse(config))
            }
            Err(e) => Pending::ready(Err(e)),
        }
    }

    /// Queue a message. `data_type` is `"text"` or `"binary"` (base64).
    pub fn data_channel_send(
        &self,
        handle: i32,
        id: i32,
        data: &str,
        data_type: &str,
    ) -> Result<(), BridgeError> {
        let connection = self.connection(handle)?;
        let channel = self.channels.resolve(handle, id)?;
        let payload = decode_payload(data, data_type)?;
        connection.send_data(channel, payload);
        Ok(())
    }

    pub fn data_channel_close(&self, handle: i32, id: i32) -> Result<(), BridgeError> {
        let connection = self.connection(handle)?;
        let channel = self.channels.resolve(handle, id)?;
        connection.close_data_channel(channel);
        Ok(())
    }
}

impl Drop for RtcBridge {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Decode a host `{ type, sdp }` map
fn parse_description(value: &Value) -> Result<SessionDescription, BridgeError> {
    let map = value
        .as_object()
        .ok_or_else(|| BridgeError::InvalidDescription("not a map".to_string()))?;
    let sdp_type = map
        .get("type")
        .and_then(Value::as_str)
        .and_then(SdpType::from_canonical)
        .ok_or_else(|| BridgeError::InvalidDescription("missing or unknown type".to_string()))?;
    let sdp = match map.get("sdp").and_then(Value::as_str) {
        Some(sdp) => sdp.to_string(),
        None if sdp_type == SdpType::Rollback => String::new(),
        None => return Err(BridgeError::InvalidDescription("missing sdp".to_string())),
    };
    Ok(SessionDescription::new(sdp_type, sdp))
}
