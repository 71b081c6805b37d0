//! Engine backed by webrtc-rs
//!
//! Maps the bridge's engine seam onto `webrtc::peer_connection`. One API
//! object (media engine, interceptors, setting engine) is built per peer
//! connection from the process-wide [`WebRtcSettings`].

use super::{
    DataChannelPayload, DataChannelState, EngineError, EngineEvent, EngineObserver, MediaKind,
    MediaStream, NativeDataChannel, NativePeerConnection, NativeTrack, PeerConnectionFactory,
    TrackState, DEFAULT_STREAM_LABEL,
};
use crate::capture::CaptureSource;
use crate::webrtc::rtc_config::{
    BundlePolicy, DataChannelInit, IceServer, IceTransportPolicy, MediaConstraints,
    RtcConfiguration, RtcpMuxPolicy,
};
use crate::webrtc::signaling::{
    IceCandidate, IceConnectionState, IceGatheringState, SdpType, SessionDescription,
    SignalingState,
};
use async_trait::async_trait;
use log::{debug, warn};
use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice::udp_network::{EphemeralUDP, UDPNetwork};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_candidate_type::RTCIceCandidateType;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::{RTCAnswerOptions, RTCOfferOptions};
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::ice_transport_policy::RTCIceTransportPolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::{RTCRtpTransceiver, RTCRtpTransceiverInit};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// msid stream id carried by locally created tracks
const LOCAL_MSID: &str = "rtc-bridge";

impl From<webrtc::Error> for EngineError {
    fn from(err: webrtc::Error) -> Self {
        EngineError(err.to_string())
    }
}

/// Process-wide network settings of the webrtc-rs engine
#[derive(Debug, Clone, Default)]
pub struct WebRtcSettings {
    /// Used when a connection's configuration names no ICE server
    pub fallback_ice_servers: Vec<IceServer>,
    /// Inclusive UDP port range for ICE host candidates
    pub udp_port_range: Option<(u16, u16)>,
    /// Public IPs advertised in place of host candidates
    pub nat1to1_ips: Vec<String>,
}

/// Local track feeding samples into the engine
pub struct WebRtcLocalTrack {
    id: String,
    kind: MediaKind,
    enabled: AtomicBool,
    track: Arc<TrackLocalStaticSample>,
}

impl WebRtcLocalTrack {
    fn new(id: &str, kind: MediaKind) -> Self {
        let capability = match kind {
            MediaKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 2,
                sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
                rtcp_feedback: vec![],
            },
            MediaKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90000,
                channels: 0,
                sdp_fmtp_line: String::new(),
                rtcp_feedback: vec![],
            },
        };
        Self {
            id: id.to_string(),
            kind,
            enabled: AtomicBool::new(true),
            track: Arc::new(TrackLocalStaticSample::new(
                capability,
                id.to_string(),
                LOCAL_MSID.to_string(),
            )),
        }
    }

    /// Sample writer handed to a media source
    pub fn sample_track(&self) -> Arc<TrackLocalStaticSample> {
        self.track.clone()
    }
}

impl NativeTrack for WebRtcLocalTrack {
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
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn ready_state(&self) -> TrackState {
        TrackState::Live
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Track received from the remote peer
struct WebRtcRemoteTrack {
    id: String,
    kind: MediaKind,
    enabled: AtomicBool,
}

impl NativeTrack for WebRtcRemoteTrack {
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
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn ready_state(&self) -> TrackState {
        TrackState::Live
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Data channel wrapper. Ids are assigned here because webrtc-rs only
/// fixes the SCTP stream id once the association is up.
struct WebRtcDataChannel {
    id: i32,
    inner: Arc<RTCDataChannel>,
}

impl WebRtcDataChannel {
    fn wire(id: i32, inner: Arc<RTCDataChannel>, observer: Arc<dyn EngineObserver>) -> Arc<Self> {
        let on_open = observer.clone();
        inner.on_open(Box::new(move || {
            on_open.on_event(EngineEvent::DataChannelStateChange {
                id,
                state: DataChannelState::Open,
            });
            Box::pin(async {})
        }));

        let on_close = observer.clone();
        inner.on_close(Box::new(move || {
            on_close.on_event(EngineEvent::DataChannelStateChange {
                id,
                state: DataChannelState::Closed,
            });
            Box::pin(async {})
        }));

        inner.on_message(Box::new(move |msg: DataChannelMessage| {
            let payload = if msg.is_string {
                DataChannelPayload::Text(String::from_utf8_lossy(&msg.data).into_owned())
            } else {
                DataChannelPayload::Binary(msg.data)
            };
            observer.on_event(EngineEvent::DataChannelMessage { id, payload });
            Box::pin(async {})
        }));

        Arc::new(Self { id, inner })
    }
}

#[async_trait]
impl NativeDataChannel for WebRtcDataChannel {
    fn id(&self) -> i32 {
        self.id
    }

    fn label(&self) -> String {
        self.inner.label().to_string()
    }

    fn state(&self) -> DataChannelState {
        match self.inner.ready_state() {
            RTCDataChannelState::Open => DataChannelState::Open,
            RTCDataChannelState::Closing => DataChannelState::Closing,
            RTCDataChannelState::Closed => DataChannelState::Closed,
            _ => DataChannelState::Connecting,
        }
    }

    async fn send(&self, payload: DataChannelPayload) -> Result<(), EngineError> {
        match payload {
            DataChannelPayload::Text(text) => self.inner.send_text(text).await?,
            DataChannelPayload::Binary(bytes) => self.inner.send(&bytes).await?,
        };
        Ok(())
    }

    async fn close(&self) {
        if let Err(e) = self.inner.close().await {
            debug!("DataChannel {} close failed: {}", self.id, e);
        }
    }
}

/// Channel ids shared between local creation and remote announcements
#[derive(Default)]
struct ChannelIds {
    next: AtomicI32,
}

impl ChannelIds {
    fn next(&self) -> i32 {
        self.next.fetch_add(1, Ordering::SeqCst)
    }
}

/// Remote streams assembled from incoming tracks, keyed by msid
#[derive(Default)]
struct RemoteStreams {
    streams: Mutex<HashMap<String, Arc<MediaStream>>>,
}

impl RemoteStreams {
    fn on_track(&self, track: &TrackRemote) -> Option<Arc<MediaStream>> {
        let kind = match track.kind() {
            RTPCodecType::Audio => MediaKind::Audio,
            RTPCodecType::Video => MediaKind::Video,
            _ => return None,
        };
        let mut label = track.stream_id();
        if label.is_empty() || label == "-" {
            label = DEFAULT_STREAM_LABEL.to_string();
        }
        let stream = self
            .streams
            .lock()
            .entry(label.clone())
            .or_insert_with(|| Arc::new(MediaStream::new(&label)))
            .clone();
        stream.add_track(Arc::new(WebRtcRemoteTrack {
            id: track.id(),
            kind,
            enabled: AtomicBool::new(true),
        }));
        Some(stream)
    }
}

pub struct WebRtcPeerConnection {
    pc: Arc<RTCPeerConnection>,
    observer: Arc<dyn EngineObserver>,
    channel_ids: Arc<ChannelIds>,
    settings: WebRtcSettings,
    /// Senders of each added local stream, keyed by stream identity
    senders: Mutex<HashMap<usize, Vec<Arc<RTCRtpSender>>>>,
}

fn stream_key(stream: &Arc<MediaStream>) -> usize {
    Arc::as_ptr(stream) as usize
}

impl WebRtcPeerConnection {
    fn wire(
        pc: Arc<RTCPeerConnection>,
        observer: Arc<dyn EngineObserver>,
        settings: WebRtcSettings,
    ) -> Self {
        let channel_ids = Arc::new(ChannelIds::default());

        let obs = observer.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            if let Some(candidate) = candidate {
                match candidate.to_json() {
                    Ok(init) => obs.on_event(EngineEvent::IceCandidate(IceCandidate {
                        sdp_mid: init.sdp_mid.unwrap_or_default(),
                        sdp_mline_index: init.sdp_mline_index.unwrap_or(0),
                        candidate: init.candidate,
                    })),
                    Err(e) => debug!("Dropping unserialisable ICE candidate: {}", e),
                }
            }
            Box::pin(async {})
        }));

        let obs = observer.clone();
        pc.on_ice_gathering_state_change(Box::new(move |state: RTCIceGathererState| {
            let state = match state {
                RTCIceGathererState::Gathering => Some(IceGatheringState::Gathering),
                RTCIceGathererState::Complete => Some(IceGatheringState::Complete),
                RTCIceGathererState::New => Some(IceGatheringState::New),
                _ => None,
            };
            if let Some(state) = state {
                obs.on_event(EngineEvent::IceGatheringChange(state));
            }
            Box::pin(async {})
        }));

        let obs = observer.clone();
        pc.on_signaling_state_change(Box::new(move |state: RTCSignalingState| {
            if let Some(state) = map_signaling(state) {
                obs.on_event(EngineEvent::SignalingChange(state));
            }
            Box::pin(async {})
        }));

        let obs = observer.clone();
        pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
            let state = match state {
                RTCIceConnectionState::New => Some(IceConnectionState::New),
                RTCIceConnectionState::Checking => Some(IceConnectionState::Checking),
                RTCIceConnectionState::Connected => Some(IceConnectionState::Connected),
                RTCIceConnectionState::Completed => Some(IceConnectionState::Completed),
                RTCIceConnectionState::Failed => Some(IceConnectionState::Failed),
                RTCIceConnectionState::Disconnected => Some(IceConnectionState::Disconnected),
                RTCIceConnectionState::Closed => Some(IceConnectionState::Closed),
                _ => None,
            };
            if let Some(state) = state {
                obs.on_event(EngineEvent::IceConnectionChange(state));
            }
            Box::pin(async {})
        }));

        let obs = observer.clone();
        pc.on_negotiation_needed(Box::new(move || {
            obs.on_event(EngineEvent::RenegotiationNeeded);
            Box::pin(async {})
        }));

        let obs = observer.clone();
        let remote = Arc::new(RemoteStreams::default());
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                if let Some(stream) = remote.on_track(&track) {
                    obs.on_event(EngineEvent::AddStream(stream));
                }
                Box::pin(async {})
            },
        ));

        let obs = observer.clone();
        let ids = channel_ids.clone();
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let channel = WebRtcDataChannel::wire(ids.next(), dc, obs.clone());
            obs.on_event(EngineEvent::DataChannel(channel));
            Box::pin(async {})
        }));

        Self {
            pc,
            observer,
            channel_ids,
            settings,
            senders: Mutex::new(HashMap::new()),
        }
    }

    /// Add receive-only transceivers for kinds the offer must carry but no
    /// local track provides
    async fn ensure_receivers(&self, constraints: &MediaConstraints) -> Result<(), EngineError> {
        let transceivers = self.pc.get_transceivers().await;
        for (key, kind) in [
            ("OfferToReceiveAudio", RTPCodecType::Audio),
            ("OfferToReceiveVideo", RTPCodecType::Video),
        ] {
            if !constraints.is_true(key) || transceivers.iter().any(|t| t.kind() == kind) {
                continue;
            }
            self.pc
                .add_transceiver_from_kind(
                    kind,
                    Some(RTCRtpTransceiverInit {
                        direction: RTCRtpTransceiverDirection::Recvonly,
                        send_encodings: Vec::new(),
                    }),
                )
                .await?;
        }
        Ok(())
    }
}

fn map_signaling(state: RTCSignalingState) -> Option<SignalingState> {
    match state {
        RTCSignalingState::Stable => Some(SignalingState::Stable),
        RTCSignalingState::HaveLocalOffer => Some(SignalingState::HaveLocalOffer),
        RTCSignalingState::HaveRemoteOffer => Some(SignalingState::HaveRemoteOffer),
        RTCSignalingState::HaveLocalPranswer => Some(SignalingState::HaveLocalPrAnswer),
        RTCSignalingState::HaveRemotePranswer => Some(SignalingState::HaveRemotePrAnswer),
        RTCSignalingState::Closed => Some(SignalingState::Closed),
        _ => None,
    }
}

fn to_native_description(sdp: SessionDescription) -> Result<RTCSessionDescription, EngineError> {
    let desc = match sdp.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(sdp.sdp)?,
        SdpType::Answer => RTCSessionDescription::answer(sdp.sdp)?,
        SdpType::Pranswer => RTCSessionDescription::pranswer(sdp.sdp)?,
        SdpType::Rollback => {
            let mut desc = RTCSessionDescription::default();
            desc.sdp_type = RTCSdpType::Rollback;
            desc
        }
    };
    Ok(desc)
}

fn from_native_description(desc: RTCSessionDescription) -> Result<SessionDescription, EngineError> {
    let sdp_type = match desc.sdp_type {
        RTCSdpType::Offer => SdpType::Offer,
        RTCSdpType::Answer => SdpType::Answer,
        RTCSdpType::Pranswer => SdpType::Pranswer,
        RTCSdpType::Rollback => SdpType::Rollback,
        _ => return Err(EngineError::new("Engine produced an untyped description")),
    };
    Ok(SessionDescription::new(sdp_type, desc.sdp))
}

/// Translate the typed configuration, falling back to the process-wide
/// ICE servers when the connection names none
fn to_native_configuration(config: &RtcConfiguration, settings: &WebRtcSettings) -> RTCConfiguration {
    let servers = if config.ice_servers.is_empty() {
        &settings.fallback_ice_servers
    } else {
        &config.ice_servers
    };
    let ice_servers = servers
        .iter()
        .map(|server| RTCIceServer {
            urls: vec![server.url.clone()],
            username: server.username.clone().unwrap_or_default(),
            credential: server.credential.clone().unwrap_or_default(),
            ..Default::default()
        })
        .collect();

    let ice_transport_policy = match config.ice_transport_policy {
        IceTransportPolicy::Relay => RTCIceTransportPolicy::Relay,
        IceTransportPolicy::All => RTCIceTransportPolicy::All,
        other => {
            debug!("iceTransportPolicy {:?} not supported by webrtc-rs, using all", other);
            RTCIceTransportPolicy::All
        }
    };

    let defaults = RtcConfiguration::default();
    if config.tcp_candidate_policy != defaults.tcp_candidate_policy
        || config.candidate_network_policy != defaults.candidate_network_policy
        || config.key_type != defaults.key_type
        || config.continual_gathering_policy != defaults.continual_gathering_policy
        || config.audio_jitter_buffer_max_packets != defaults.audio_jitter_buffer_max_packets
        || config.audio_jitter_buffer_fast_accelerate
        || config.ice_connection_receiving_timeout != -1
        || config.ice_backup_candidate_pair_ping_interval != -1
        || config.prune_turn_ports
        || config.presume_writable_when_fully_relayed
    {
        debug!("Engine-private configuration fields are ignored by webrtc-rs");
    }

    RTCConfiguration {
        ice_servers,
        ice_transport_policy,
        bundle_policy: match config.bundle_policy {
            BundlePolicy::Balanced => RTCBundlePolicy::Balanced,
            BundlePolicy::MaxCompat => RTCBundlePolicy::MaxCompat,
            BundlePolicy::MaxBundle => RTCBundlePolicy::MaxBundle,
        },
        rtcp_mux_policy: match config.rtcp_mux_policy {
            RtcpMuxPolicy::Negotiate => RTCRtcpMuxPolicy::Negotiate,
            RtcpMuxPolicy::Require => RTCRtcpMuxPolicy::Require,
        },
        ice_candidate_pool_size: u8::try_from(config.ice_candidate_pool_size).unwrap_or(u8::MAX),
        ..Default::default()
    }
}

#[async_trait]
impl NativePeerConnection for WebRtcPeerConnection {
    fn signaling_state(&self) -> SignalingState {
        map_signaling(self.pc.signaling_state()).unwrap_or_default()
    }

    async fn create_offer(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<SessionDescription, EngineError> {
        self.ensure_receivers(constraints).await?;
        let options = RTCOfferOptions {
            ice_restart: constraints.is_true("IceRestart"),
            ..Default::default()
        };
        from_native_description(self.pc.create_offer(Some(options)).await?)
    }

    async fn create_answer(
        &self,
        _constraints: &MediaConstraints,
    ) -> Result<SessionDescription, EngineError> {
        let answer = self
            .pc
            .create_answer(Some(RTCAnswerOptions::default()))
            .await?;
        from_native_description(answer)
    }

    async fn set_local_description(&self, sdp: SessionDescription) -> Result<(), EngineError> {
        self.pc
            .set_local_description(to_native_description(sdp)?)
            .await?;
        Ok(())
    }

    async fn set_remote_description(&self, sdp: SessionDescription) -> Result<(), EngineError> {
        self.pc
            .set_remote_description(to_native_description(sdp)?)
            .await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), EngineError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: Some(candidate.sdp_mid),
            sdp_mline_index: Some(candidate.sdp_mline_index),
            username_fragment: None,
        };
        self.pc.add_ice_candidate(init).await?;
        Ok(())
    }

    async fn set_configuration(&self, config: &RtcConfiguration) -> Result<(), EngineError> {
        self.pc
            .set_configuration(to_native_configuration(config, &self.settings))
            .await?;
        Ok(())
    }

    async fn add_stream(&self, stream: Arc<MediaStream>) -> Result<(), EngineError> {
        let key = stream_key(&stream);
        if self.senders.lock().contains_key(&key) {
            return Err(EngineError::new("Stream already added"));
        }
        let mut senders = Vec::new();
        for track in stream.tracks() {
            let Some(local) = track.as_any().downcast_ref::<WebRtcLocalTrack>() else {
                warn!("Track {} was not created by this engine, skipped", track.id());
                continue;
            };
            let sample: Arc<dyn TrackLocal + Send + Sync> = local.sample_track();
            senders.push(self.pc.add_track(sample).await?);
        }
        self.senders.lock().insert(key, senders);
        Ok(())
    }

    async fn remove_stream(&self, stream: &Arc<MediaStream>) -> Result<(), EngineError> {
        let senders = self.senders.lock().remove(&stream_key(stream));
        for sender in senders.unwrap_or_default() {
            self.pc.remove_track(&sender).await?;
        }
        Ok(())
    }

    async fn create_data_channel(
        &self,
        label: &str,
        init: &DataChannelInit,
    ) -> Result<Arc<dyn NativeDataChannel>, EngineError> {
        let negotiated = if init.negotiated {
            init.id.and_then(|id| u16::try_from(id).ok())
        } else {
            None
        };
        let options = RTCDataChannelInit {
            ordered: init.ordered,
            max_packet_life_time: init.max_packet_life_time,
            max_retransmits: init.max_retransmits,
            protocol: init.protocol.clone(),
            negotiated,
        };
        let dc = self.pc.create_data_channel(label, Some(options)).await?;
        let id = match negotiated {
            Some(id) => i32::from(id),
            None => self.channel_ids.next(),
        };
        Ok(WebRtcDataChannel::wire(id, dc, self.observer.clone()))
    }

    async fn get_stats(&self, track_id: Option<&str>) -> Result<serde_json::Value, EngineError> {
        let report = self.pc.get_stats().await;
        let value = serde_json::to_value(&report)
            .map_err(|e| EngineError::new(format!("Failed to encode stats: {}", e)))?;
        let Some(track_id) = track_id else {
            return Ok(value);
        };
        // Keep the reports that mention the track
        let filtered = match value {
            serde_json::Value::Object(map) => map
                .into_iter()
                .filter(|(_, report)| {
                    report
                        .as_object()
                        .is_some_and(|fields| fields.values().any(|v| v.as_str() == Some(track_id)))
                })
                .collect(),
            _ => serde_json::Map::new(),
        };
        Ok(serde_json::Value::Object(filtered))
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            warn!("PeerConnection close failed: {}", e);
        }
    }
}

/// Factory building webrtc-rs peer connections
pub struct WebRtcFactory {
    settings: WebRtcSettings,
}

impl WebRtcFactory {
    pub fn new(settings: WebRtcSettings) -> Self {
        Self { settings }
    }

    fn setting_engine(&self) -> Result<SettingEngine, EngineError> {
        let mut setting_engine = SettingEngine::default();
        if !self.settings.nat1to1_ips.is_empty() {
            setting_engine
                .set_nat_1to1_ips(self.settings.nat1to1_ips.clone(), RTCIceCandidateType::Host);
        }
        if let Some((min, max)) = self.settings.udp_port_range {
            let ephemeral = EphemeralUDP::new(min, max).map_err(|e| {
                EngineError::new(format!("Invalid ICE UDP port range: {}", e))
            })?;
            setting_engine.set_udp_network(UDPNetwork::Ephemeral(ephemeral));
        }
        Ok(setting_engine)
    }
}

#[async_trait]
impl PeerConnectionFactory for WebRtcFactory {
    async fn create_peer_connection(
        &self,
        config: &RtcConfiguration,
        _constraints: &MediaConstraints,
        observer: Arc<dyn EngineObserver>,
    ) -> Result<Arc<dyn NativePeerConnection>, EngineError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .with_setting_engine(self.setting_engine()?)
            .build();

        let pc = api
            .new_peer_connection(to_native_configuration(config, &self.settings))
            .await?;
        Ok(Arc::new(WebRtcPeerConnection::wire(
            Arc::new(pc),
            observer,
            self.settings.clone(),
        )))
    }

    fn create_audio_track(&self, id: &str) -> Result<Arc<dyn NativeTrack>, EngineError> {
        Ok(Arc::new(WebRtcLocalTrack::new(id, MediaKind::Audio)))
    }

    fn create_video_track(
        &self,
        id: &str,
        source: &CaptureSource,
    ) -> Result<Arc<dyn NativeTrack>, EngineError> {
        debug!("Video track {} bound to camera {}", id, source.device_id);
        Ok(Arc::new(WebRtcLocalTrack::new(id, MediaKind::Video)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_fallback_ice_servers_apply_when_none_given() {
        let settings = WebRtcSettings {
            fallback_ice_servers: vec![IceServer {
                url: "stun:stun.l.google.com:19302".into(),
                username: None,
                credential: None,
            }],
            ..Default::default()
        };
        let native = to_native_configuration(&RtcConfiguration::default(), &settings);
        assert_eq!(native.ice_servers.len(), 1);
        assert_eq!(native.ice_servers[0].urls[0], "stun:stun.l.google.com:19302");

        let own = RtcConfiguration::parse(Some(&json!({
            "iceServers": [{"urls": "turn:relay", "username": "u", "credential": "c"}],
            "iceTransportPolicy": "relay"
        })));
        let native = to_native_configuration(&own, &settings);
        assert_eq!(native.ice_servers[0].urls[0], "turn:relay");
        assert_eq!(native.ice_servers[0].username, "u");
        assert_eq!(native.ice_transport_policy, RTCIceTransportPolicy::Relay);
    }

    #[test]
    fn test_bundle_and_mux_policy_mapping() {
        let native = to_native_configuration(&RtcConfiguration::default(), &WebRtcSettings::default());
        assert_eq!(native.bundle_policy, RTCBundlePolicy::Balanced);
        assert_eq!(native.rtcp_mux_policy, RTCRtcpMuxPolicy::Negotiate);
    }

    #[test]
    fn test_signaling_mapping() {
        assert_eq!(
            map_signaling(RTCSignalingState::HaveRemotePranswer),
            Some(SignalingState::HaveRemotePrAnswer)
        );
        assert_eq!(map_signaling(RTCSignalingState::Unspecified), None);
    }

    #[tokio::test]
    async fn test_offer_carries_requested_media() {
        struct Sink;
        impl EngineObserver for Sink {
            fn on_event(&self, _event: EngineEvent) {}
        }

        let factory = WebRtcFactory::new(WebRtcSettings::default());
        let pc = factory
            .create_peer_connection(
                &RtcConfiguration::default(),
                &MediaConstraints::default(),
                Arc::new(Sink),
            )
            .await
            .unwrap();
        let offer = pc.create_offer(&MediaConstraints::default_offer()).await.unwrap();
        assert_eq!(offer.sdp_type, SdpType::Offer);
        assert!(offer.sdp.contains("m=audio"));
        assert!(offer.sdp.contains("m=video"));
        pc.close().await;
    }
}
