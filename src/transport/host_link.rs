//! Host link
//!
//! One WebSocket session per host. Commands are dispatched to the bridge
//! in arrival order; replies and the host's events share the outgoing
//! channel. Connections a host initialised are closed when its link drops.

use super::protocol::{encode_event, parse_frame, HostCommand, HostFrame, HostReply};
use crate::web::SharedState;
use crate::webrtc::{BridgeError, Pending};
use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

/// Handles owned by one host link
type OwnedHandles = Arc<Mutex<HashSet<i32>>>;

/// Handle a host WebSocket connection
pub async fn handle_host_connection(socket: WebSocket, state: Arc<SharedState>) {
    info!("New host link established");
    state.metrics.host_link_opened();
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_sender.send(Message::Text(msg.into())).await.is_err() {
                break;
            }
        }
    });

    let owned: OwnedHandles = Arc::new(Mutex::new(HashSet::new()));
    let event_task = tokio::spawn(forward_events(
        state.subscribe_events(),
        state.clone(),
        owned.clone(),
        tx.clone(),
    ));

    let link = HostLink {
        state: state.clone(),
        owned: owned.clone(),
        tx: tx.clone(),
    };

    while let Some(result) = ws_receiver.next().await {
        match result {
            Ok(Message::Text(text)) => {
                let text_str: &str = text.as_ref();
                match parse_frame(text_str) {
                    Ok(frame) => link.dispatch(frame),
                    Err((tag, e)) => {
                        warn!("Invalid host command: {}", e);
                        if let Some(tag) = tag {
                            link.reply(HostReply::error(tag, e.to_string()));
                        }
                    }
                }
            }
            Ok(Message::Binary(_)) => {
                debug!("Received binary message on host link");
            }
            Ok(Message::Ping(_data)) => {
                debug!("Received ping on host link");
            }
            Ok(Message::Close(_)) => {
                info!("Host link closed");
                break;
            }
            Err(e) => {
                error!("WebSocket error: {}", e);
                break;
            }
            _ => {}
        }
    }

    event_task.abort();
    send_task.abort();

    let handles: Vec<i32> = owned.lock().drain().collect();
    for handle in &handles {
        if let Err(e) = state.bridge.close(*handle) {
            debug!("Closing PeerConnection {} on disconnect: {}", handle, e);
        }
    }
    state.metrics.host_link_closed();
    info!("Host link handler finished ({} connections closed)", handles.len());
}

async fn forward_events(
    mut events: broadcast::Receiver<Arc<crate::webrtc::HostEvent>>,
    state: Arc<SharedState>,
    owned: OwnedHandles,
    tx: mpsc::UnboundedSender<String>,
) {
    loop {
        match events.recv().await {
            Ok(event) => {
                if !owned.lock().contains(&event.connection()) {
                    continue;
                }
                let Some(payload) = encode_event(&event) else {
                    continue;
                };
                state.metrics.record_event(event.name());
                if tx.send(payload).is_err() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Host link lagging, {} events skipped", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

struct HostLink {
    state: Arc<SharedState>,
    owned: OwnedHandles,
    tx: mpsc::UnboundedSender<String>,
}

impl HostLink {
    fn reply(&self, reply: HostReply) {
        let _ = self.tx.send(reply.to_json());
    }

    fn respond<T: Serialize>(&self, tag: u64, method: &'static str, result: Result<T, BridgeError>) {
        self.state.metrics.record_command(method, result.is_ok());
        if let Err(ref e) = result {
            debug!("{}() failed: {}", method, e);
        }
        self.reply(HostReply::from_result(tag, result));
    }

    /// Acknowledge a fire-and-forget command. Failures are logged, the host
    /// always sees success.
    fn ack(&self, tag: u64, method: &'static str, result: Result<(), BridgeError>) {
        self.state.metrics.record_command(method, result.is_ok());
        if let Err(e) = result {
            debug!("{}() ignored: {}", method, e);
        }
        self.reply(HostReply::ok(tag, None));
    }

    /// Reply once `pending` resolves. A discarded result gets no reply.
    fn respond_later<T>(&self, tag: u64, method: &'static str, pending: Pending<T>)
    where
        T: Serialize + Send + 'static,
    {
        let state = self.state.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let Some(result) = pending.wait().await else {
                debug!("{}() result discarded, connection closed", method);
                return;
            };
            state.metrics.record_command(method, result.is_ok());
            if let Err(ref e) = result {
                debug!("{}() failed: {}", method, e);
            }
            let _ = tx.send(HostReply::from_result(tag, result).to_json());
        });
    }

    /// Ack right away, log the outcome once `pending` resolves
    fn ack_later(&self, tag: u64, method: &'static str, pending: Pending<()>) {
        self.reply(HostReply::ok(tag, None));
        let state = self.state.clone();
        tokio::spawn(async move {
            match pending.wait().await {
                Some(Ok(())) => state.metrics.record_command(method, true),
                Some(Err(e)) => {
                    state.metrics.record_command(method, false);
                    warn!("{}() failed: {}", method, e);
                }
                None => debug!("{}() result discarded, connection closed", method),
            }
        });
    }

    /// Submit `frame` to the bridge. Every bridge call happens here, in
    /// frame order; only the waiting is spawned.
    fn dispatch(&self, frame: HostFrame) {
        let HostFrame { tag, command } = frame;
        let method = command.method();
        let bridge = &self.state.bridge;

        match command {
            HostCommand::Init {
                id,
                configuration,
                constraints,
            } => {
                // Owned before the worker starts so no early event is filtered out
                let claimed = self.owned.lock().insert(id);
                let result = bridge.init_connection(configuration.as_ref(), constraints.as_ref(), id);
                if result.is_err() && claimed {
                    self.owned.lock().remove(&id);
                }
                self.respond(tag, method, result);
            }
            HostCommand::SetConfiguration { id, configuration } => {
                self.ack_later(tag, method, bridge.set_configuration(configuration.as_ref(), id));
            }
            HostCommand::GetUserMedia { constraints } => {
                self.respond(tag, method, bridge.get_user_media(constraints.as_ref()));
            }
            HostCommand::GetSources => {
                self.respond(tag, method, Ok::<_, BridgeError>(bridge.get_sources()));
            }
            HostCommand::AddStream { id, stream_id } => {
                self.ack_later(tag, method, bridge.add_stream(&stream_id, id));
            }
            HostCommand::RemoveStream { id, stream_id } => {
                self.ack_later(tag, method, bridge.remove_stream(&stream_id, id));
            }
            HostCommand::CreateOffer { id, constraints } => {
                self.respond_later(tag, method, bridge.create_offer(id, constraints.as_ref()));
            }
            HostCommand::CreateAnswer { id, constraints } => {
                self.respond_later(tag, method, bridge.create_answer(id, constraints.as_ref()));
            }
            HostCommand::SetLocalDescription { id, sdp } => {
                self.respond_later(tag, method, bridge.set_local_description(&sdp, id));
            }
            HostCommand::SetRemoteDescription { id, sdp } => {
                self.respond_later(tag, method, bridge.set_remote_description(&sdp, id));
            }
            HostCommand::AddIceCandidate { id, candidate } => {
                let added = bridge.add_ice_candidate(&candidate, id);
                let state = self.state.clone();
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    let added = added.await;
                    state.metrics.record_command(method, added);
                    let _ = tx.send(HostReply::ok(tag, Some(added.into())).to_json());
                });
            }
            HostCommand::GetStats { id, track_id } => {
                self.respond_later(tag, method, bridge.get_stats(track_id.as_deref(), id));
            }
            HostCommand::Close { id } => {
                // Only the link that initialised a connection may close it
                if !self.owned.lock().remove(&id) {
                    self.respond::<()>(tag, method, Err(BridgeError::ConnectionNotFound(id)));
                    return;
                }
                self.ack(tag, method, bridge.close(id));
            }
            HostCommand::TrackSetEnabled { track_id, enabled } => {
                self.ack(tag, method, bridge.track_set_enabled(&track_id, enabled));
            }
            HostCommand::TrackStop { track_id } => {
                self.ack(tag, method, bridge.track_stop(&track_id));
            }
            HostCommand::TrackSwitchCamera { track_id } => {
                self.ack(tag, method, bridge.track_switch_camera(&track_id));
            }
            HostCommand::TrackRelease {
                stream_id,
                track_id,
            } => {
                self.ack(tag, method, bridge.track_release(&stream_id, &track_id));
            }
            HostCommand::StreamRelease { stream_id } => {
                self.ack(tag, method, bridge.release_stream(&stream_id));
            }
            HostCommand::CreateDataChannel {
                peer_connection_id,
                label,
                config,
            } => {
                self.respond_later(
                    tag,
                    method,
                    bridge.create_data_channel(peer_connection_id, &label, config.as_ref()),
                );
            }
            HostCommand::DataChannelSend {
                peer_connection_id,
                id,
                data,
                data_type,
            } => {
                self.ack(
                    tag,
                    method,
                    bridge.data_channel_send(peer_connection_id, id, &data, &data_type),
                );
            }
            HostCommand::DataChannelClose {
                peer_connection_id,
                id,
            } => {
                self.ack(tag, method, bridge.data_channel_close(peer_connection_id, id));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::VirtualCameras;
    use crate::config::BridgeConfig;
    use crate::engine::loopback::LoopbackFactory;
    use crate::web::metrics::Metrics;
    use crate::webrtc::RtcBridge;
    use serde_json::{json, Value};

    fn link() -> (HostLink, mpsc::UnboundedReceiver<String>) {
        let (bridge, events) = RtcBridge::new(
            Arc::new(LoopbackFactory::new()),
            Arc::new(VirtualCameras::new(1)),
        );
        let state = SharedState::new(BridgeConfig::default(), bridge, events, Metrics::new().unwrap());
        let (tx, rx) = mpsc::unbounded_channel();
        let link = HostLink {
            state: Arc::new(state),
            owned: Arc::new(Mutex::new(HashSet::new())),
            tx,
        };
        (link, rx)
    }

    fn send(link: &HostLink, frame: Value) {
        link.dispatch(parse_frame(&frame.to_string()).unwrap());
    }

    async fn next_reply(rx: &mut mpsc::UnboundedReceiver<String>) -> Value {
        serde_json::from_str(&rx.recv().await.unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_init_and_offer_replies() {
        let (link, mut rx) = link();
        send(&link, json!({"tag": 1, "method": "peerConnectionInit", "id": 5}));
        assert_eq!(next_reply(&mut rx).await, json!({"tag": 1, "ok": true}));
        assert!(link.owned.lock().contains(&5));

        send(
            &link,
            json!({"tag": 2, "method": "peerConnectionCreateOffer", "id": 5,
                   "constraints": {"mandatory": {"OfferToReceiveAudio": true}}}),
        );
        let reply = next_reply(&mut rx).await;
        assert_eq!(reply["tag"], 2);
        assert_eq!(reply["ok"], true);
        assert_eq!(reply["result"]["type"], "offer");
    }

    #[tokio::test]
    async fn test_failures_reported_with_reason() {
        let (link, mut rx) = link();
        send(&link, json!({"tag": 1, "method": "peerConnectionCreateAnswer", "id": 9}));
        assert_eq!(
            next_reply(&mut rx).await,
            json!({"tag": 1, "ok": false, "error": "PeerConnection 9 not found"})
        );

        send(&link, json!({"tag": 2, "method": "peerConnectionInit", "id": 9}));
        next_reply(&mut rx).await;
        send(&link, json!({"tag": 3, "method": "peerConnectionInit", "id": 9}));
        assert_eq!(
            next_reply(&mut rx).await,
            json!({"tag": 3, "ok": false, "error": "PeerConnection 9 already exists"})
        );
    }

    #[tokio::test]
    async fn test_fire_and_forget_commands_ack() {
        let (link, mut rx) = link();
        send(
            &link,
            json!({"tag": 4, "method": "mediaStreamTrackSetEnabled", "trackId": "nope", "enabled": false}),
        );
        assert_eq!(next_reply(&mut rx).await, json!({"tag": 4, "ok": true}));

        send(&link, json!({"tag": 5, "method": "peerConnectionAddICECandidate", "id": 1,
                           "candidate": {"sdpMid": "0", "sdpMLineIndex": 0, "candidate": "x"}}));
        assert_eq!(
            next_reply(&mut rx).await,
            json!({"tag": 5, "ok": true, "result": false})
        );
    }

    #[tokio::test]
    async fn test_get_user_media_result() {
        let (link, mut rx) = link();
        send(
            &link,
            json!({"tag": 1, "method": "getUserMedia", "constraints": {"audio": true, "video": true}}),
        );
        let reply = next_reply(&mut rx).await;
        assert_eq!(reply["ok"], true);
        assert_eq!(reply["result"]["tracks"].as_array().unwrap().len(), 2);

        send(&link, json!({"tag": 2, "method": "mediaStreamTrackGetSources"}));
        let reply = next_reply(&mut rx).await;
        assert_eq!(reply["result"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_close_rejected_for_other_links_connection() {
        let (owner, mut owner_rx) = link();
        send(&owner, json!({"tag": 1, "method": "peerConnectionInit", "id": 6}));
        next_reply(&mut owner_rx).await;

        let (tx, mut other_rx) = mpsc::unbounded_channel();
        let other = HostLink {
            state: owner.state.clone(),
            owned: Arc::new(Mutex::new(HashSet::new())),
            tx,
        };
        send(&other, json!({"tag": 2, "method": "peerConnectionClose", "id": 6}));
        assert_eq!(
            next_reply(&mut other_rx).await,
            json!({"tag": 2, "ok": false, "error": "PeerConnection 6 not found"})
        );
        assert_eq!(owner.state.bridge.connection_count(), 1);
        assert!(owner.owned.lock().contains(&6));
    }

    #[tokio::test]
    async fn test_close_releases_ownership() {
        let (link, mut rx) = link();
        send(&link, json!({"tag": 1, "method": "peerConnectionInit", "id": 2}));
        next_reply(&mut rx).await;
        send(&link, json!({"tag": 2, "method": "peerConnectionClose", "id": 2}));
        assert_eq!(next_reply(&mut rx).await, json!({"tag": 2, "ok": true}));
        assert!(link.owned.lock().is_empty());
        assert_eq!(link.state.bridge.connection_count(), 0);
    }
}
