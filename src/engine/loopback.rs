//! In-memory engine
//!
//! Runs the offer/answer state machine, produces synthetic SDP and host
//! candidates, and echoes data channel traffic back to the sender. No
//! network I/O happens. Test code drives remote-side behaviour through the
//! `announce_*` helpers on [`LoopbackPeerConnection`].

use super::{
    same_object, DataChannelPayload, DataChannelState, EngineError, EngineEvent, EngineObserver,
    MediaKind, MediaStream, NativeDataChannel, NativePeerConnection, NativeTrack,
    PeerConnectionFactory, TrackState,
};
use crate::capture::CaptureSource;
use crate::webrtc::rtc_config::{DataChannelInit, MediaConstraints, RtcConfiguration};
use crate::webrtc::signaling::{
    DescriptionSide, IceCandidate, IceConnectionState, IceGatheringState, SdpType,
    SessionDescription, SignalingState,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Track implementation for the loopback engine
pub struct LoopbackTrack {
    id: String,
    kind: MediaKind,
    enabled: AtomicBool,
    ended: AtomicBool,
    set_enabled_calls: AtomicUsize,
}

impl LoopbackTrack {
    pub fn new(id: impl Into<String>, kind: MediaKind) -> Self {
        Self {
            id: id.into(),
            kind,
            enabled: AtomicBool::new(true),
            ended: AtomicBool::new(false),
            set_enabled_calls: AtomicUsize::new(0),
        }
    }

    /// Number of times the engine-level enable switch was invoked
    pub fn set_enabled_calls(&self) -> usize {
        self.set_enabled_calls.load(Ordering::SeqCst)
    }

    pub fn end(&self) {
        self.ended.store(true, Ordering::SeqCst);
    }
}

impl NativeTrack for LoopbackTrack {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn set_enabled(&self, enabled: bool) {
        self.set_enabled_calls.fetch_add(1, Ordering::SeqCst);
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn ready_state(&self) -> TrackState {
        if self.ended.load(Ordering::SeqCst) {
            TrackState::Ended
        } else {
            TrackState::Live
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Data channel that echoes every message it is sent
pub struct LoopbackDataChannel {
    id: i32,
    label: String,
    state: Mutex<DataChannelState>,
    observer: Arc<dyn EngineObserver>,
    sent: Mutex<Vec<DataChannelPayload>>,
}

impl LoopbackDataChannel {
    fn new(id: i32, label: &str, observer: Arc<dyn EngineObserver>) -> Self {
        Self {
            id,
            label: label.to_string(),
            state: Mutex::new(DataChannelState::Connecting),
            observer,
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Payloads accepted by `send`
    pub fn sent(&self) -> Vec<DataChannelPayload> {
        self.sent.lock().clone()
    }

    fn transition(&self, next: DataChannelState) {
        {
            let mut state = self.state.lock();
            if *state == next {
                return;
            }
            *state = next;
        }
        self.observer.on_event(EngineEvent::DataChannelStateChange {
            id: self.id,
            state: next,
        });
    }
}

#[async_trait]
impl NativeDataChannel for LoopbackDataChannel {
    fn id(&self) -> i32 {
        self.id
    }

    fn label(&self) -> String {
        self.label.clone()
    }

    fn state(&self) -> DataChannelState {
        *self.state.lock()
    }

    async fn send(&self, payload: DataChannelPayload) -> Result<(), EngineError> {
        if self.state() != DataChannelState::Open {
            return Err(EngineError::new("DataChannel is not open"));
        }
        self.sent.lock().push(payload.clone());
        self.observer.on_event(EngineEvent::DataChannelMessage {
            id: self.id,
            payload,
        });
        Ok(())
    }

    async fn close(&self) {
        if matches!(self.state(), DataChannelState::Closing | DataChannelState::Closed) {
            return;
        }
        self.transition(DataChannelState::Closing);
        self.transition(DataChannelState::Closed);
    }
}

struct LoopbackState {
    signaling: SignalingState,
    ice_connection: IceConnectionState,
    config: RtcConfiguration,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    streams: Vec<Arc<MediaStream>>,
    remote_candidates: Vec<IceCandidate>,
    channels: Vec<Arc<LoopbackDataChannel>>,
    next_channel_id: i32,
    sdp_version: u64,
}

/// Peer connection of the loopback engine
pub struct LoopbackPeerConnection {
    session_id: u64,
    observer: Arc<dyn EngineObserver>,
    state: Mutex<LoopbackState>,
    delay: Duration,
    closed: AtomicBool,
}

impl LoopbackPeerConnection {
    fn new(
        session_id: u64,
        config: RtcConfiguration,
        observer: Arc<dyn EngineObserver>,
        delay: Duration,
    ) -> Self {
        Self {
            session_id,
            observer,
            state: Mutex::new(LoopbackState {
                signaling: SignalingState::Stable,
                ice_connection: IceConnectionState::New,
                config,
                local: None,
                remote: None,
                streams: Vec::new(),
                remote_candidates: Vec::new(),
                channels: Vec::new(),
                next_channel_id: 0,
                sdp_version: 1,
            }),
            delay,
            closed: AtomicBool::new(false),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn configuration(&self) -> RtcConfiguration {
        self.state.lock().config.clone()
    }

    pub fn local_streams(&self) -> Vec<Arc<MediaStream>> {
        self.state.lock().streams.clone()
    }

    pub fn remote_candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().remote_candidates.clone()
    }

    pub fn data_channel(&self, id: i32) -> Option<Arc<LoopbackDataChannel>> {
        self.state
            .lock()
            .channels
            .iter()
            .find(|c| c.id == id)
            .cloned()
    }

    /// Announce a remote stream with the given track kinds
    pub fn announce_remote_stream(&self, label: &str, kinds: &[MediaKind]) -> Arc<MediaStream> {
        let stream = Arc::new(MediaStream::new(label));
        for (i, kind) in kinds.iter().enumerate() {
            let id = format!("{}-{}{}", label, kind.as_str(), i);
            stream.add_track(Arc::new(LoopbackTrack::new(id, *kind)));
        }
        self.announce_stream(stream.clone());
        stream
    }

    /// Announce an existing stream object (again)
    pub fn announce_stream(&self, stream: Arc<MediaStream>) {
        self.observer.on_event(EngineEvent::AddStream(stream));
    }

    pub fn announce_stream_removed(&self, stream: Arc<MediaStream>) {
        self.observer.on_event(EngineEvent::RemoveStream(stream));
    }

    /// Announce a data channel opened by the remote side
    pub fn announce_remote_data_channel(&self, label: &str) -> Arc<LoopbackDataChannel> {
        let channel = {
            let mut state = self.state.lock();
            let id = next_free_channel_id(&mut state);
            let channel = Arc::new(LoopbackDataChannel::new(id, label, self.observer.clone()));
            state.channels.push(channel.clone());
            channel
        };
        *channel.state.lock() = DataChannelState::Open;
        self.observer
            .on_event(EngineEvent::DataChannel(channel.clone()));
        channel
    }

    /// Forward an arbitrary event to the observer
    pub fn emit(&self, event: EngineEvent) {
        self.observer.on_event(event);
    }

    async fn simulate_work(&self) {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
    }

    fn ensure_open(&self) -> Result<(), EngineError> {
        if self.is_closed() {
            Err(EngineError::new("PeerConnection is closed"))
        } else {
            Ok(())
        }
    }

    fn build_sdp(&self, constraints: &MediaConstraints) -> String {
        let mut state = self.state.lock();
        state.sdp_version += 1;

        let has_kind = |kind: MediaKind| {
            state.streams.iter().any(|s| {
                s.tracks().iter().any(|t| t.kind() == kind)
            })
        };
        let audio = has_kind(MediaKind::Audio) || constraints.is_true("OfferToReceiveAudio");
        let video = has_kind(MediaKind::Video) || constraints.is_true("OfferToReceiveVideo");
        let data = !state.channels.is_empty();

        let mut sdp = format!(
            "v=0\r\no=- {} {} IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n",
            self.session_id, state.sdp_version
        );
        let mut mid = 0;
        if audio {
            sdp.push_str(&format!(
                "m=audio 9 UDP/TLS/RTP/SAVPF 111\r\na=mid:{}\r\na=rtpmap:111 opus/48000/2\r\n",
                mid
            ));
            mid += 1;
        }
        if video {
            sdp.push_str(&format!(
                "m=video 9 UDP/TLS/RTP/SAVPF 96\r\na=mid:{}\r\na=rtpmap:96 VP8/90000\r\n",
                mid
            ));
            mid += 1;
        }
        if data {
            sdp.push_str(&format!(
                "m=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\na=mid:{}\r\n",
                mid
            ));
        }
        sdp
    }

    fn apply_description(
        &self,
        side: DescriptionSide,
        sdp: SessionDescription,
    ) -> Result<(), EngineError> {
        if sdp.sdp_type != SdpType::Rollback && !sdp.sdp.starts_with("v=0") {
            return Err(EngineError::new(format!(
                "Failed to set {} sdp: SessionDescription is invalid",
                match side {
                    DescriptionSide::Local => "local",
                    DescriptionSide::Remote => "remote",
                }
            )));
        }

        let sdp_type = sdp.sdp_type;
        let (previous, next) = {
            let mut state = self.state.lock();
            let previous = state.signaling;
            let next = previous.apply(side, sdp_type).map_err(EngineError)?;
            state.signaling = next;
            match (side, sdp_type) {
                (_, SdpType::Rollback) => {}
                (DescriptionSide::Local, _) => state.local = Some(sdp),
                (DescriptionSide::Remote, _) => state.remote = Some(sdp),
            }
            (previous, next)
        };

        if previous != next {
            self.observer.on_event(EngineEvent::SignalingChange(next));
        }

        if side == DescriptionSide::Local && sdp_type != SdpType::Rollback {
            self.gather_candidates();
        }

        if next == SignalingState::Stable && sdp_type == SdpType::Answer {
            self.connect();
        }
        Ok(())
    }

    fn gather_candidates(&self) {
        self.observer
            .on_event(EngineEvent::IceGatheringChange(IceGatheringState::Gathering));
        let port = 50000 + (self.session_id % 10000) as u16;
        self.observer.on_event(EngineEvent::IceCandidate(IceCandidate {
            sdp_mid: "0".to_string(),
            sdp_mline_index: 0,
            candidate: format!(
                "candidate:1 1 udp 2130706431 127.0.0.1 {} typ host generation 0",
                port
            ),
        }));
        self.observer
            .on_event(EngineEvent::IceGatheringChange(IceGatheringState::Complete));
    }

    fn connect(&self) {
        let pending = {
            let mut state = self.state.lock();
            if state.ice_connection == IceConnectionState::Connected {
                return;
            }
            state.ice_connection = IceConnectionState::Connected;
            state.channels.clone()
        };
        self.observer
            .on_event(EngineEvent::IceConnectionChange(IceConnectionState::Checking));
        self.observer
            .on_event(EngineEvent::IceConnectionChange(IceConnectionState::Connected));
        for channel in pending {
            if channel.state() == DataChannelState::Connecting {
                channel.transition(DataChannelState::Open);
            }
        }
    }
}

fn next_free_channel_id(state: &mut LoopbackState) -> i32 {
    loop {
        let id = state.next_channel_id;
        state.next_channel_id += 1;
        if !state.channels.iter().any(|c| c.id == id) {
            return id;
        }
    }
}

#[async_trait]
impl NativePeerConnection for LoopbackPeerConnection {
    fn signaling_state(&self) -> SignalingState {
        self.state.lock().signaling
    }

    async fn create_offer(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<SessionDescription, EngineError> {
        self.ensure_open()?;
        self.simulate_work().await;
        self.ensure_open()?;
        Ok(SessionDescription::offer(self.build_sdp(constraints)))
    }

    async fn create_answer(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<SessionDescription, EngineError> {
        self.ensure_open()?;
        self.simulate_work().await;
        self.ensure_open()?;
        if !self.signaling_state().can_create_answer() {
            return Err(EngineError::new(
                "CreateAnswer failed: no remote offer has been set",
            ));
        }
        Ok(SessionDescription::answer(self.build_sdp(constraints)))
    }

    async fn set_local_description(&self, sdp: SessionDescription) -> Result<(), EngineError> {
        self.ensure_open()?;
        self.apply_description(DescriptionSide::Local, sdp)
    }

    async fn set_remote_description(&self, sdp: SessionDescription) -> Result<(), EngineError> {
        self.ensure_open()?;
        self.apply_description(DescriptionSide::Remote, sdp)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), EngineError> {
        self.ensure_open()?;
        if !candidate.candidate.starts_with("candidate:") {
            return Err(EngineError::new("Failed to parse ICE candidate"));
        }
        let mut state = self.state.lock();
        if state.remote.is_none() {
            return Err(EngineError::new(
                "Failed to add ICE candidate: remote description is not set",
            ));
        }
        state.remote_candidates.push(candidate);
        Ok(())
    }

    async fn set_configuration(&self, config: &RtcConfiguration) -> Result<(), EngineError> {
        self.ensure_open()?;
        self.state.lock().config = config.clone();
        Ok(())
    }

    async fn add_stream(&self, stream: Arc<MediaStream>) -> Result<(), EngineError> {
        self.ensure_open()?;
        {
            let mut state = self.state.lock();
            if state.streams.iter().any(|s| same_object(s, &stream)) {
                return Err(EngineError::new("Stream already added"));
            }
            state.streams.push(stream);
        }
        self.observer.on_event(EngineEvent::RenegotiationNeeded);
        Ok(())
    }

    async fn remove_stream(&self, stream: &Arc<MediaStream>) -> Result<(), EngineError> {
        self.ensure_open()?;
        let removed = {
            let mut state = self.state.lock();
            let before = state.streams.len();
            state.streams.retain(|s| !same_object(s, stream));
            before != state.streams.len()
        };
        if removed {
            self.observer.on_event(EngineEvent::RenegotiationNeeded);
        }
        Ok(())
    }

    async fn create_data_channel(
        &self,
        label: &str,
        init: &DataChannelInit,
    ) -> Result<Arc<dyn NativeDataChannel>, EngineError> {
        self.ensure_open()?;
        let (channel, connected) = {
            let mut state = self.state.lock();
            let id = match init.id {
                Some(id) if init.negotiated => {
                    if state.channels.iter().any(|c| c.id == id) {
                        return Err(EngineError::new(format!(
                            "Data channel id {} is already in use",
                            id
                        )));
                    }
                    id
                }
                _ => next_free_channel_id(&mut state),
            };
            let channel = Arc::new(LoopbackDataChannel::new(id, label, self.observer.clone()));
            state.channels.push(channel.clone());
            (channel, state.ice_connection == IceConnectionState::Connected)
        };
        if connected {
            channel.transition(DataChannelState::Open);
        } else {
            self.observer.on_event(EngineEvent::RenegotiationNeeded);
        }
        Ok(channel)
    }

    async fn get_stats(&self, track_id: Option<&str>) -> Result<serde_json::Value, EngineError> {
        self.ensure_open()?;
        self.simulate_work().await;
        let state = self.state.lock();
        let mut reports = vec![json!({
            "id": format!("PC-{}", self.session_id),
            "type": "peer-connection",
            "dataChannelsOpened": state.channels.iter()
                .filter(|c| c.state() == DataChannelState::Open)
                .count(),
        })];
        for stream in &state.streams {
            for track in stream.tracks() {
                if track_id.is_some_and(|wanted| wanted != track.id()) {
                    continue;
                }
                reports.push(json!({
                    "id": format!("T-{}", track.id()),
                    "type": "track",
                    "trackIdentifier": track.id(),
                    "kind": track.kind().as_str(),
                }));
            }
        }
        Ok(serde_json::Value::Array(reports))
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let channels = {
            let mut state = self.state.lock();
            state.signaling = SignalingState::Closed;
            state.ice_connection = IceConnectionState::Closed;
            std::mem::take(&mut state.channels)
        };
        for channel in channels {
            channel.close().await;
        }
        self.observer
            .on_event(EngineEvent::SignalingChange(SignalingState::Closed));
        self.observer
            .on_event(EngineEvent::IceConnectionChange(IceConnectionState::Closed));
    }
}

/// Factory of the loopback engine
#[derive(Default)]
pub struct LoopbackFactory {
    delay: Duration,
    next_session: AtomicU64,
    created: Mutex<Vec<Arc<LoopbackPeerConnection>>>,
    fail_next: AtomicBool,
}

impl LoopbackFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every offer / answer / stats operation by `delay`
    pub fn with_operation_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    /// Make the next `create_peer_connection` call fail
    pub fn fail_next_connection(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    /// Every peer connection created so far, oldest first
    pub fn connections(&self) -> Vec<Arc<LoopbackPeerConnection>> {
        self.created.lock().clone()
    }

    pub fn last_connection(&self) -> Option<Arc<LoopbackPeerConnection>> {
        self.created.lock().last().cloned()
    }
}

#[async_trait]
impl PeerConnectionFactory for LoopbackFactory {
    async fn create_peer_connection(
        &self,
        config: &RtcConfiguration,
        _constraints: &MediaConstraints,
        observer: Arc<dyn EngineObserver>,
    ) -> Result<Arc<dyn NativePeerConnection>, EngineError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(EngineError::new("Failed to create peer connection"));
        }
        let session_id = self.next_session.fetch_add(1, Ordering::SeqCst) + 1;
        let pc = Arc::new(LoopbackPeerConnection::new(
            session_id,
            config.clone(),
            observer,
            self.delay,
        ));
        self.created.lock().push(pc.clone());
        Ok(pc)
    }

    fn create_audio_track(&self, id: &str) -> Result<Arc<dyn NativeTrack>, EngineError> {
        Ok(Arc::new(LoopbackTrack::new(id, MediaKind::Audio)))
    }

    fn create_video_track(
        &self,
        id: &str,
        _source: &CaptureSource,
    ) -> Result<Arc<dyn NativeTrack>, EngineError> {
        Ok(Arc::new(LoopbackTrack::new(id, MediaKind::Video)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl EngineObserver for Recorder {
        fn on_event(&self, event: EngineEvent) {
            self.events.lock().push(format!("{:?}", event));
        }
    }

    async fn new_pc(recorder: &Arc<Recorder>) -> Arc<dyn NativePeerConnection> {
        LoopbackFactory::new()
            .create_peer_connection(
                &RtcConfiguration::default(),
                &MediaConstraints::default(),
                recorder.clone(),
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_offer_answer_reaches_stable_and_connects() {
        let recorder = Arc::new(Recorder::default());
        let pc = new_pc(&recorder).await;

        let offer = pc.create_offer(&MediaConstraints::default_offer()).await.unwrap();
        assert!(offer.sdp.contains("m=audio"));
        assert_eq!(pc.signaling_state(), SignalingState::Stable);

        pc.set_local_description(offer).await.unwrap();
        assert_eq!(pc.signaling_state(), SignalingState::HaveLocalOffer);

        pc.set_remote_description(SessionDescription::answer("v=0\r\n"))
            .await
            .unwrap();
        assert_eq!(pc.signaling_state(), SignalingState::Stable);

        let events = recorder.events.lock().clone();
        assert!(events.contains(&"SignalingChange(HaveLocalOffer)".to_string()));
        assert!(events.iter().any(|e| e.starts_with("IceCandidate(")));
        assert!(events.contains(&"IceConnectionChange(Connected)".to_string()));
    }

    #[tokio::test]
    async fn test_invalid_sdp_leaves_state_unchanged() {
        let recorder = Arc::new(Recorder::default());
        let pc = new_pc(&recorder).await;
        let err = pc
            .set_remote_description(SessionDescription::offer("garbage"))
            .await
            .unwrap_err();
        assert!(err.0.contains("SessionDescription is invalid"));
        assert_eq!(pc.signaling_state(), SignalingState::Stable);
    }

    #[tokio::test]
    async fn test_answer_requires_remote_offer() {
        let recorder = Arc::new(Recorder::default());
        let pc = new_pc(&recorder).await;
        assert!(pc.create_answer(&MediaConstraints::default()).await.is_err());
    }

    #[tokio::test]
    async fn test_candidate_requires_remote_description() {
        let recorder = Arc::new(Recorder::default());
        let pc = new_pc(&recorder).await;
        let candidate = IceCandidate {
            sdp_mid: "0".into(),
            sdp_mline_index: 0,
            candidate: "candidate:1 1 udp 1 10.0.0.1 9 typ host".into(),
        };
        assert!(pc.add_ice_candidate(candidate.clone()).await.is_err());
        pc.set_remote_description(SessionDescription::offer("v=0\r\n"))
            .await
            .unwrap();
        assert!(pc.add_ice_candidate(candidate).await.is_ok());
    }

    #[tokio::test]
    async fn test_data_channel_opens_on_connect_and_echoes() {
        let recorder = Arc::new(Recorder::default());
        let pc = new_pc(&recorder).await;
        let channel = pc
            .create_data_channel("chat", &DataChannelInit::default())
            .await
            .unwrap();
        assert_eq!(channel.state(), DataChannelState::Connecting);
        assert!(channel
            .send(DataChannelPayload::Text("early".into()))
            .await
            .is_err());

        pc.set_remote_description(SessionDescription::offer("v=0\r\n"))
            .await
            .unwrap();
        pc.set_local_description(SessionDescription::answer("v=0\r\n"))
            .await
            .unwrap();
        assert_eq!(channel.state(), DataChannelState::Open);

        channel
            .send(DataChannelPayload::Text("hi".into()))
            .await
            .unwrap();
        let events = recorder.events.lock().clone();
        assert!(events.contains(&format!("DataChannelMessage({})", channel.id())));
    }

    #[tokio::test]
    async fn test_close_is_terminal() {
        let recorder = Arc::new(Recorder::default());
        let pc = new_pc(&recorder).await;
        pc.close().await;
        assert_eq!(pc.signaling_state(), SignalingState::Closed);
        assert!(pc.create_offer(&MediaConstraints::default()).await.is_err());
    }

    #[test]
    fn test_track_counts_enable_calls() {
        let track = LoopbackTrack::new("t", MediaKind::Video);
        track.set_enabled(false);
        track.set_enabled(false);
        assert_eq!(track.set_enabled_calls(), 2);
        assert!(!track.enabled());
    }
}
