//! Event relay
//!
//! Turns engine callbacks into registry updates and host events. Each
//! connection gets its own observer holding a weak reference to the
//! connection; an event is acted on only while that connection is still
//! the live registry entry for its handle.

use super::data_channel::{encode_payload, DataChannelManager};
use super::peer_connection::PeerConnection;
use super::registry::{Registry, RemovedStream};
use super::signaling::IceCandidate;
use crate::capture::MediaCapture;
use crate::engine::{
    DataChannelState, EngineEvent, EngineObserver, MediaKind, NativeTrack, TrackState,
};
use log::{debug, info};
use serde::Serialize;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;

/// Track descriptor sent to the host
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrackInfo {
    pub id: String,
    pub kind: MediaKind,
    pub label: String,
    pub enabled: bool,
    #[serde(rename = "readyState")]
    pub ready_state: TrackState,
    pub remote: bool,
}

impl TrackInfo {
    pub fn new(handle: &str, track: &Arc<dyn NativeTrack>, remote: bool) -> Self {
        Self {
            id: handle.to_string(),
            kind: track.kind(),
            label: track.id(),
            enabled: track.enabled(),
            ready_state: track.ready_state(),
            remote,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DataChannelInfo {
    pub id: i32,
    pub label: String,
}

/// Event delivered to the host
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event")]
pub enum HostEvent {
    #[serde(rename = "peerConnectionGotICECandidate")]
    IceCandidate { id: i32, candidate: IceCandidate },

    #[serde(rename = "peerConnectionIceGatheringChanged")]
    IceGatheringChanged {
        id: i32,
        #[serde(rename = "iceGatheringState")]
        ice_gathering_state: String,
    },

    #[serde(rename = "peerConnectionSignalingStateChanged")]
    SignalingStateChanged {
        id: i32,
        #[serde(rename = "signalingState")]
        signaling_state: String,
    },

    #[serde(rename = "peerConnectionIceConnectionChanged")]
    IceConnectionChanged {
        id: i32,
        #[serde(rename = "iceConnectionState")]
        ice_connection_state: String,
    },

    #[serde(rename = "peerConnectionOnRenegotiationNeeded")]
    RenegotiationNeeded { id: i32 },

    #[serde(rename = "peerConnectionAddedStream")]
    StreamAdded {
        id: i32,
        #[serde(rename = "streamId")]
        stream_id: String,
        tracks: Vec<TrackInfo>,
    },

    #[serde(rename = "peerConnectionRemovedStream")]
    StreamRemoved {
        id: i32,
        #[serde(rename = "streamId")]
        stream_id: String,
    },

    #[serde(rename = "peerConnectionDidOpenDataChannel")]
    DataChannelOpened {
        id: i32,
        #[serde(rename = "dataChannel")]
        data_channel: DataChannelInfo,
    },

    #[serde(rename = "dataChannelStateChanged")]
    DataChannelStateChanged {
        id: i32,
        #[serde(rename = "peerConnectionId")]
        peer_connection_id: i32,
        state: DataChannelState,
    },

    #[serde(rename = "dataChannelReceiveMessage")]
    DataChannelMessage {
        id: i32,
        #[serde(rename = "peerConnectionId")]
        peer_connection_id: i32,
        #[serde(rename = "type")]
        data_type: String,
        data: String,
    },
}

impl HostEvent {
    /// Wire name of the event
    pub fn name(&self) -> &'static str {
        match self {
            HostEvent::IceCandidate { .. } => "peerConnectionGotICECandidate",
            HostEvent::IceGatheringChanged { .. } => "peerConnectionIceGatheringChanged",
            HostEvent::SignalingStateChanged { .. } => "peerConnectionSignalingStateChanged",
            HostEvent::IceConnectionChanged { .. } => "peerConnectionIceConnectionChanged",
            HostEvent::RenegotiationNeeded { .. } => "peerConnectionOnRenegotiationNeeded",
            HostEvent::StreamAdded { .. } => "peerConnectionAddedStream",
            HostEvent::StreamRemoved { .. } => "peerConnectionRemovedStream",
            HostEvent::DataChannelOpened { .. } => "peerConnectionDidOpenDataChannel",
            HostEvent::DataChannelStateChanged { .. } => "dataChannelStateChanged",
            HostEvent::DataChannelMessage { .. } => "dataChannelReceiveMessage",
        }
    }

    /// Handle of the connection the event belongs to
    pub fn connection(&self) -> i32 {
        match self {
            HostEvent::DataChannelStateChanged {
                peer_connection_id, ..
            }
            | HostEvent::DataChannelMessage {
                peer_connection_id, ..
            } => *peer_connection_id,
            HostEvent::IceCandidate { id, .. }
            | HostEvent::IceGatheringChanged { id, .. }
            | HostEvent::SignalingStateChanged { id, .. }
            | HostEvent::IceConnectionChanged { id, .. }
            | HostEvent::RenegotiationNeeded { id }
            | HostEvent::StreamAdded { id, .. }
            | HostEvent::StreamRemoved { id, .. }
            | HostEvent::DataChannelOpened { id, .. } => *id,
        }
    }
}

/// Shared relay state
pub struct EventRelay {
    registry: Arc<Registry>,
    channels: DataChannelManager,
    capture: Arc<dyn MediaCapture>,
    events: mpsc::UnboundedSender<HostEvent>,
}

impl EventRelay {
    pub fn new(
        registry: Arc<Registry>,
        capture: Arc<dyn MediaCapture>,
        events: mpsc::UnboundedSender<HostEvent>,
    ) -> Self {
        Self {
            channels: DataChannelManager::new(registry.clone()),
            registry,
            capture,
            events,
        }
    }

    /// Observer handed to the engine for `connection`
    pub fn observer(self: &Arc<Self>, connection: &Arc<PeerConnection>) -> Arc<dyn EngineObserver> {
        Arc::new(ConnectionObserver {
            handle: connection.handle(),
            connection: Arc::downgrade(connection),
            relay: self.clone(),
        })
    }

    pub fn emit(&self, event: HostEvent) {
        debug!("Host event {}", event.name());
        if self.events.send(event).is_err() {
            debug!("Host event receiver dropped");
        }
    }

    /// Release capture sources of tracks that left the registry
    pub fn release_tracks(&self, removed: &RemovedStream) {
        for (id, entry) in &removed.tracks {
            if entry.track.kind() == MediaKind::Video {
                self.capture.release_video_source(id);
            }
        }
    }

    fn dispatch(&self, handle: i32, weak: &Weak<PeerConnection>, event: EngineEvent) {
        let Some(connection) = weak.upgrade() else {
            debug!("PeerConnection {} dropped, ignoring {:?}", handle, event);
            return;
        };
        if connection.is_closed() || !self.registry.is_current(&connection) {
            debug!("PeerConnection {} closed, ignoring {:?}", handle, event);
            return;
        }

        match event {
            EngineEvent::IceCandidate(candidate) => {
                self.emit(HostEvent::IceCandidate {
                    id: handle,
                    candidate,
                });
            }

            EngineEvent::IceGatheringChange(state) => {
                if connection.record_ice_gathering(state) {
                    self.emit(HostEvent::IceGatheringChanged {
                        id: handle,
                        ice_gathering_state: state.as_str().to_string(),
                    });
                }
            }

            EngineEvent::SignalingChange(state) => {
                if connection.record_signaling_event(state) {
                    self.emit(HostEvent::SignalingStateChanged {
                        id: handle,
                        signaling_state: state.as_str().to_string(),
                    });
                }
            }

            EngineEvent::IceConnectionChange(state) => {
                if connection.record_ice_connection(state) {
                    info!("PeerConnection {} ICE state: {}", handle, state.as_str());
                    self.emit(HostEvent::IceConnectionChanged {
                        id: handle,
                        ice_connection_state: state.as_str().to_string(),
                    });
                }
            }

            EngineEvent::RenegotiationNeeded => {
                self.emit(HostEvent::RenegotiationNeeded { id: handle });
            }

            EngineEvent::AddStream(stream) => {
                let Some(added) = self.registry.on_add_stream(&connection, stream) else {
                    return;
                };
                info!(
                    "PeerConnection {} added remote stream {}{}",
                    handle,
                    added.stream_id,
                    if added.reused { " (reused)" } else { "" }
                );
                let tracks = added
                    .tracks
                    .iter()
                    .map(|(id, track)| TrackInfo::new(id, track, true))
                    .collect();
                self.emit(HostEvent::StreamAdded {
                    id: handle,
                    stream_id: added.stream_id,
                    tracks,
                });
            }

            EngineEvent::RemoveStream(stream) => {
                let Some(removed) = self.registry.on_remove_stream(&connection, &stream) else {
                    debug!("PeerConnection {} removed an unknown stream", handle);
                    return;
                };
                self.release_tracks(&removed);
                self.emit(HostEvent::StreamRemoved {
                    id: handle,
                    stream_id: removed.stream_id,
                });
            }

            EngineEvent::DataChannel(channel) => {
                let info = DataChannelInfo {
                    id: channel.id(),
                    label: channel.label(),
                };
                if self.channels.register(&connection, channel) {
                    self.emit(HostEvent::DataChannelOpened {
                        id: handle,
                        data_channel: info,
                    });
                }
            }

            EngineEvent::DataChannelStateChange { id, state } => {
                self.channels.on_state_change(handle, id, state);
                self.emit(HostEvent::DataChannelStateChanged {
                    id,
                    peer_connection_id: handle,
                    state,
                });
            }

            EngineEvent::DataChannelMessage { id, payload } => {
                let (data_type, data) = encode_payload(&payload);
                self.emit(HostEvent::DataChannelMessage {
                    id,
                    peer_connection_id: handle,
                    data_type: data_type.to_string(),
                    data,
                });
            }
        }
    }
}

struct ConnectionObserver {
    handle: i32,
    connection: Weak<PeerConnection>,
    relay: Arc<EventRelay>,
}

impl EngineObserver for ConnectionObserver {
    fn on_event(&self, event: EngineEvent) {
        self.relay.dispatch(self.handle, &self.connection, event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::VirtualCameras;
    use crate::engine::loopback::LoopbackTrack;
    use crate::engine::MediaStream;
    use crate::webrtc::signaling::{IceConnectionState, SignalingState};
    use serde_json::json;

    struct Fixture {
        registry: Arc<Registry>,
        relay: Arc<EventRelay>,
        events: mpsc::UnboundedReceiver<HostEvent>,
        connection: Arc<PeerConnection>,
        observer: Arc<dyn EngineObserver>,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(Registry::new());
        let (tx, events) = mpsc::unbounded_channel();
        let relay = Arc::new(EventRelay::new(
            registry.clone(),
            Arc::new(VirtualCameras::new(2)),
            tx,
        ));
        let connection = PeerConnection::detached(7);
        registry.insert_connection(7, connection.clone()).unwrap();
        let observer = relay.observer(&connection);
        Fixture {
            registry,
            relay,
            events,
            connection,
            observer,
        }
    }

    fn drain(events: &mut mpsc::UnboundedReceiver<HostEvent>) -> Vec<HostEvent> {
        let mut out = Vec::new();
        while let Ok(event) = events.try_recv() {
            out.push(event);
        }
        out
    }

    #[test]
    fn test_event_wire_format() {
        let event = HostEvent::DataChannelMessage {
            id: 1,
            peer_connection_id: 7,
            data_type: "text".into(),
            data: "hi".into(),
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({
                "event": "dataChannelReceiveMessage",
                "id": 1,
                "peerConnectionId": 7,
                "type": "text",
                "data": "hi"
            })
        );
        assert_eq!(event.connection(), 7);
        assert_eq!(HostEvent::RenegotiationNeeded { id: 3 }.connection(), 3);
    }

    #[test]
    fn test_default_stream_announced_twice_keeps_handle() {
        let mut f = fixture();
        let stream = Arc::new(MediaStream::new("default"));
        stream.add_track(Arc::new(LoopbackTrack::new("a0", MediaKind::Audio)));

        f.observer.on_event(EngineEvent::AddStream(stream.clone()));
        f.observer.on_event(EngineEvent::AddStream(stream));

        let ids: Vec<String> = drain(&mut f.events)
            .into_iter()
            .filter_map(|e| match e {
                HostEvent::StreamAdded { stream_id, .. } => Some(stream_id),
                _ => None,
            })
            .collect();
        assert_eq!(ids.len(), 2);
        assert_eq!(ids[0], ids[1]);
        assert_eq!(f.registry.stream_count(), 1);
    }

    #[test]
    fn test_stream_announced_per_track_keeps_one_entry() {
        let mut f = fixture();
        let stream = Arc::new(MediaStream::new("peer-msid"));
        stream.add_track(Arc::new(LoopbackTrack::new("a0", MediaKind::Audio)));
        f.observer.on_event(EngineEvent::AddStream(stream.clone()));
        stream.add_track(Arc::new(LoopbackTrack::new("v0", MediaKind::Video)));
        f.observer.on_event(EngineEvent::AddStream(stream));

        let added: Vec<(String, usize)> = drain(&mut f.events)
            .into_iter()
            .filter_map(|e| match e {
                HostEvent::StreamAdded {
                    stream_id, tracks, ..
                } => Some((stream_id, tracks.len())),
                _ => None,
            })
            .collect();
        assert_eq!(added.len(), 2);
        assert_eq!(added[0].0, added[1].0);
        assert_eq!(added[1].1, 2);
        assert_eq!(f.registry.stream_count(), 1);
        assert_eq!(f.registry.track_count(), 2);
    }

    #[test]
    fn test_remove_stream_emits_handle() {
        let mut f = fixture();
        let stream = Arc::new(MediaStream::new("s1"));
        stream.add_track(Arc::new(LoopbackTrack::new("v0", MediaKind::Video)));
        f.observer.on_event(EngineEvent::AddStream(stream.clone()));
        f.observer.on_event(EngineEvent::RemoveStream(stream));

        let events = drain(&mut f.events);
        let (added, removed) = match (&events[0], &events[1]) {
            (
                HostEvent::StreamAdded { stream_id: a, tracks, .. },
                HostEvent::StreamRemoved { stream_id: r, .. },
            ) => {
                assert_eq!(tracks[0].label, "v0");
                assert!(tracks[0].remote);
                (a.clone(), r.clone())
            }
            other => panic!("unexpected events {:?}", other),
        };
        assert_eq!(added, removed);
        assert_eq!(f.registry.track_count(), 0);
    }

    #[test]
    fn test_state_events_deduplicated() {
        let mut f = fixture();
        f.observer
            .on_event(EngineEvent::SignalingChange(SignalingState::HaveLocalOffer));
        f.observer
            .on_event(EngineEvent::SignalingChange(SignalingState::HaveLocalOffer));
        f.observer
            .on_event(EngineEvent::IceConnectionChange(IceConnectionState::Checking));
        f.observer
            .on_event(EngineEvent::IceConnectionChange(IceConnectionState::Checking));
        assert_eq!(drain(&mut f.events).len(), 2);
        assert_eq!(f.connection.signaling_state(), SignalingState::HaveLocalOffer);
    }

    #[test]
    fn test_events_after_eviction_are_dropped() {
        let mut f = fixture();
        f.registry.evict_connection(7);
        f.observer.on_event(EngineEvent::RenegotiationNeeded);
        f.observer
            .on_event(EngineEvent::AddStream(Arc::new(MediaStream::new("late"))));
        assert!(drain(&mut f.events).is_empty());
        assert_eq!(f.registry.stream_count(), 0);
    }

    #[test]
    fn test_reused_handle_ignores_stale_observer() {
        let mut f = fixture();
        f.registry.evict_connection(7);
        let replacement = PeerConnection::detached(7);
        f.registry.insert_connection(7, replacement.clone()).unwrap();

        f.observer.on_event(EngineEvent::RenegotiationNeeded);
        assert!(drain(&mut f.events).is_empty());

        f.relay
            .observer(&replacement)
            .on_event(EngineEvent::RenegotiationNeeded);
        assert_eq!(
            drain(&mut f.events),
            vec![HostEvent::RenegotiationNeeded { id: 7 }]
        );
    }
}
