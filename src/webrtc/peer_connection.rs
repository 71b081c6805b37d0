//! Per-connection state and operation worker
//!
//! Every connection owns one worker task fed by an unbounded queue. All
//! engine operations of that connection run on the worker in the order the
//! host issued them, so a connection's own operations never race each
//! other while different connections proceed in parallel.
//!
//! Results come back through [`Pending`]. A result produced after the
//! connection was closed is discarded and the `Pending` resolves to `None`.

use super::data_channel::DataChannelManager;
use super::registry::Registry;
use super::rtc_config::{DataChannelInit, MediaConstraints, RtcConfiguration};
use super::signaling::{
    IceCandidate, IceConnectionState, IceGatheringState, SessionDescription, SignalingState,
};
use super::BridgeError;
use crate::engine::{
    DataChannelPayload, EngineObserver, MediaStream, NativeDataChannel, NativePeerConnection,
    PeerConnectionFactory,
};
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

type Reply<T> = oneshot::Sender<Result<T, BridgeError>>;

/// Result of an asynchronous bridge operation
#[must_use = "dropping a Pending discards the outcome"]
pub struct Pending<T> {
    rx: oneshot::Receiver<Result<T, BridgeError>>,
}

impl<T> Pending<T> {
    pub(crate) fn channel() -> (Reply<T>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { rx })
    }

    /// An already completed operation
    pub fn ready(result: Result<T, BridgeError>) -> Self {
        let (tx, pending) = Self::channel();
        let _ = tx.send(result);
        pending
    }

    /// Wait for the outcome. `None` means the result was discarded because
    /// the connection was closed first.
    pub async fn wait(self) -> Option<Result<T, BridgeError>> {
        self.rx.await.ok()
    }
}

/// Queued engine operation
pub(crate) enum Operation {
    CreateOffer {
        constraints: MediaConstraints,
        reply: Reply<SessionDescription>,
    },
    CreateAnswer {
        constraints: MediaConstraints,
        reply: Reply<SessionDescription>,
    },
    SetLocalDescription {
        sdp: SessionDescription,
        reply: Reply<()>,
    },
    SetRemoteDescription {
        sdp: SessionDescription,
        reply: Reply<()>,
    },
    AddIceCandidate {
        candidate: IceCandidate,
        reply: Reply<()>,
    },
    SetConfiguration {
        config: RtcConfiguration,
        reply: Reply<()>,
    },
    AddStream {
        stream_id: String,
        stream: Arc<MediaStream>,
        reply: Reply<()>,
    },
    RemoveStream {
        stream_id: String,
        stream: Arc<MediaStream>,
        reply: Reply<()>,
    },
    GetStats {
        track_id: Option<String>,
        reply: Reply<serde_json::Value>,
    },
    CreateDataChannel {
        label: String,
        init: DataChannelInit,
        reply: Reply<i32>,
    },
    DataChannelSend {
        channel: Arc<dyn NativeDataChannel>,
        payload: DataChannelPayload,
    },
    DataChannelClose {
        channel: Arc<dyn NativeDataChannel>,
    },
    Close,
}

impl Operation {
    fn name(&self) -> &'static str {
        match self {
            Operation::CreateOffer { .. } => "createOffer",
            Operation::CreateAnswer { .. } => "createAnswer",
            Operation::SetLocalDescription { .. } => "setLocalDescription",
            Operation::SetRemoteDescription { .. } => "setRemoteDescription",
            Operation::AddIceCandidate { .. } => "addIceCandidate",
            Operation::SetConfiguration { .. } => "setConfiguration",
            Operation::AddStream { .. } => "addStream",
            Operation::RemoveStream { .. } => "removeStream",
            Operation::GetStats { .. } => "getStats",
            Operation::CreateDataChannel { .. } => "createDataChannel",
            Operation::DataChannelSend { .. } => "dataChannelSend",
            Operation::DataChannelClose { .. } => "dataChannelClose",
            Operation::Close => "close",
        }
    }

    /// Answer the caller with `err`; fire-and-forget operations are dropped
    fn fail(self, err: BridgeError) {
        match self {
            Operation::CreateOffer { reply, .. } | Operation::CreateAnswer { reply, .. } => {
                let _ = reply.send(Err(err));
            }
            Operation::SetLocalDescription { reply, .. }
            | Operation::SetRemoteDescription { reply, .. }
            | Operation::AddIceCandidate { reply, .. }
            | Operation::SetConfiguration { reply, .. }
            | Operation::AddStream { reply, .. }
            | Operation::RemoveStream { reply, .. } => {
                let _ = reply.send(Err(err));
            }
            Operation::GetStats { reply, .. } => {
                let _ = reply.send(Err(err));
            }
            Operation::CreateDataChannel { reply, .. } => {
                let _ = reply.send(Err(err));
            }
            Operation::DataChannelSend { .. }
            | Operation::DataChannelClose { .. }
            | Operation::Close => {}
        }
    }
}

/// Mirrored engine state of a connection
struct ConnectionState {
    /// Signaling state as last reported by the engine
    signaling: SignalingState,
    /// Last signaling state sent to the host
    signaling_emitted: SignalingState,
    ice_connection: IceConnectionState,
    ice_gathering: IceGatheringState,
    config: RtcConfiguration,
    constraints: MediaConstraints,
}

/// A host-visible peer connection
pub struct PeerConnection {
    /// Host-assigned handle
    handle: i32,
    /// Set once by close; never cleared
    closed: AtomicBool,
    state: Mutex<ConnectionState>,
    ops: mpsc::UnboundedSender<Operation>,
}

impl PeerConnection {
    pub(crate) fn new(
        handle: i32,
        config: RtcConfiguration,
        constraints: MediaConstraints,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Operation>) {
        let (ops, rx) = mpsc::unbounded_channel();
        let connection = Arc::new(Self {
            handle,
            closed: AtomicBool::new(false),
            state: Mutex::new(ConnectionState {
                signaling: SignalingState::Stable,
                signaling_emitted: SignalingState::Stable,
                ice_connection: IceConnectionState::New,
                ice_gathering: IceGatheringState::New,
                config,
                constraints,
            }),
            ops,
        });
        (connection, rx)
    }

    /// A connection with no worker behind it
    #[cfg(test)]
    pub(crate) fn detached(handle: i32) -> Arc<Self> {
        Self::new(handle, RtcConfiguration::default(), MediaConstraints::default()).0
    }

    pub fn handle(&self) -> i32 {
        self.handle
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Returns true if this call closed the connection
    pub(crate) fn mark_closed(&self) -> bool {
        let first = !self.closed.swap(true, Ordering::SeqCst);
        if first {
            let mut state = self.state.lock();
            state.signaling = SignalingState::Closed;
            state.ice_connection = IceConnectionState::Closed;
        }
        first
    }

    pub fn signaling_state(&self) -> SignalingState {
        self.state.lock().signaling
    }

    pub fn ice_connection_state(&self) -> IceConnectionState {
        self.state.lock().ice_connection
    }

    pub fn ice_gathering_state(&self) -> IceGatheringState {
        self.state.lock().ice_gathering
    }

    pub fn configuration(&self) -> RtcConfiguration {
        self.state.lock().config.clone()
    }

    pub fn constraints(&self) -> MediaConstraints {
        self.state.lock().constraints.clone()
    }

    /// Mirror an engine-reported signaling state without notifying anyone
    fn mirror_signaling(&self, next: SignalingState) {
        let mut state = self.state.lock();
        if state.signaling != SignalingState::Closed {
            state.signaling = next;
        }
    }

    /// Record a signaling change event; false if the host already saw it
    pub(crate) fn record_signaling_event(&self, next: SignalingState) -> bool {
        let mut state = self.state.lock();
        if state.signaling != SignalingState::Closed || next == SignalingState::Closed {
            state.signaling = next;
        }
        if state.signaling_emitted == next {
            return false;
        }
        state.signaling_emitted = next;
        true
    }

    pub(crate) fn record_ice_connection(&self, next: IceConnectionState) -> bool {
        let mut state = self.state.lock();
        if state.ice_connection == next {
            return false;
        }
        state.ice_connection = next;
        true
    }

    pub(crate) fn record_ice_gathering(&self, next: IceGatheringState) -> bool {
        let mut state = self.state.lock();
        if state.ice_gathering == next {
            return false;
        }
        state.ice_gathering = next;
        true
    }

    /// Queue an operation. A closed connection answers with NotFound.
    pub(crate) fn submit(&self, op: Operation) {
        if self.is_closed() {
            op.fail(BridgeError::ConnectionNotFound(self.handle));
            return;
        }
        if let Err(mpsc::error::SendError(op)) = self.ops.send(op) {
            debug!(
                "PeerConnection {} worker gone, dropping {}",
                self.handle,
                op.name()
            );
        }
    }

    /// Queue the native close. Bypasses the closed check.
    pub(crate) fn submit_close(&self) {
        let _ = self.ops.send(Operation::Close);
    }

    pub fn create_offer(&self, constraints: MediaConstraints) -> Pending<SessionDescription> {
        let (reply, pending) = Pending::channel();
        self.submit(Operation::CreateOffer { constraints, reply });
        pending
    }

    pub fn create_answer(&self, constraints: MediaConstraints) -> Pending<SessionDescription> {
        let (reply, pending) = Pending::channel();
        self.submit(Operation::CreateAnswer { constraints, reply });
        pending
    }

    pub fn set_local_description(&self, sdp: SessionDescription) -> Pending<()> {
        let (reply, pending) = Pending::channel();
        self.submit(Operation::SetLocalDescription { sdp, reply });
        pending
    }

    pub fn set_remote_description(&self, sdp: SessionDescription) -> Pending<()> {
        let (reply, pending) = Pending::channel();
        self.submit(Operation::SetRemoteDescription { sdp, reply });
        pending
    }

    pub fn add_ice_candidate(&self, candidate: IceCandidate) -> Pending<()> {
        let (reply, pending) = Pending::channel();
        self.submit(Operation::AddIceCandidate { candidate, reply });
        pending
    }

    pub fn set_configuration(&self, config: RtcConfiguration) -> Pending<()> {
        let (reply, pending) = Pending::channel();
        self.submit(Operation::SetConfiguration { config, reply });
        pending
    }

    pub fn add_stream(&self, stream_id: String, stream: Arc<MediaStream>) -> Pending<()> {
        let (reply, pending) = Pending::channel();
        self.submit(Operation::AddStream {
            stream_id,
            stream,
            reply,
        });
        pending
    }

    pub fn remove_stream(&self, stream_id: String, stream: Arc<MediaStream>) -> Pending<()> {
        let (reply, pending) = Pending::channel();
        self.submit(Operation::RemoveStream {
            stream_id,
            stream,
            reply,
        });
        pending
    }

    pub fn get_stats(&self, track_id: Option<String>) -> Pending<serde_json::Value> {
        let (reply, pending) = Pending::channel();
        self.submit(Operation::GetStats { track_id, reply });
        pending
    }

    pub fn create_data_channel(&self, label: String, init: DataChannelInit) -> Pending<i32> {
        let (reply, pending) = Pending::channel();
        self.submit(Operation::CreateDataChannel { label, init, reply });
        pending
    }

    pub(crate) fn send_data(&self, channel: Arc<dyn NativeDataChannel>, payload: DataChannelPayload) {
        self.submit(Operation::DataChannelSend { channel, payload });
    }

    pub(crate) fn close_data_channel(&self, channel: Arc<dyn NativeDataChannel>) {
        self.submit(Operation::DataChannelClose { channel });
    }
}

impl std::fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnection")
            .field("handle", &self.handle)
            .field("closed", &self.is_closed())
            .field("signaling", &self.signaling_state())
            .finish()
    }
}

/// Drives the engine for one connection
pub(crate) struct Worker {
    pub connection: Arc<PeerConnection>,
    pub registry: Arc<Registry>,
    pub factory: Arc<dyn PeerConnectionFactory>,
    pub observer: Arc<dyn EngineObserver>,
    pub channels: DataChannelManager,
}

impl Worker {
    pub async fn run(self, mut ops: mpsc::UnboundedReceiver<Operation>) {
        let handle = self.connection.handle();
        let config = self.connection.configuration();
        let constraints = self.connection.constraints();

        let native = match self
            .factory
            .create_peer_connection(&config, &constraints, self.observer.clone())
            .await
        {
            Ok(native) => native,
            Err(e) => {
                warn!("PeerConnection {} creation failed: {}", handle, e);
                self.registry.evict_if_current(&self.connection);
                self.connection.mark_closed();
                ops.close();
                while let Some(op) = ops.recv().await {
                    op.fail(BridgeError::Engine(e.0.clone()));
                }
                return;
            }
        };
        info!("PeerConnection {} created", handle);

        while let Some(op) = ops.recv().await {
            if let Operation::Close = op {
                native.close().await;
                info!("PeerConnection {} closed", handle);
                break;
            }
            if self.is_stale() {
                debug!("PeerConnection {} closed, dropping {}", handle, op.name());
                continue;
            }
            self.execute(native.as_ref(), op).await;
        }

        // Queue closed without an explicit close: bridge dropped
        if !self.connection.is_closed() {
            self.connection.mark_closed();
            native.close().await;
        }
    }

    /// The connection was closed or its handle now belongs to another one
    fn is_stale(&self) -> bool {
        self.connection.is_closed() || !self.registry.is_current(&self.connection)
    }

    /// Deliver a result unless the connection went away while the engine
    /// was working
    fn deliver<T>(&self, name: &str, reply: Reply<T>, result: Result<T, BridgeError>) {
        if self.is_stale() {
            debug!(
                "PeerConnection {} closed during {}, result discarded",
                self.connection.handle(),
                name
            );
            return;
        }
        if let Err(ref e) = result {
            warn!("PeerConnection {} {} failed: {}", self.connection.handle(), name, e);
        }
        let _ = reply.send(result);
    }

    async fn execute(&self, native: &dyn NativePeerConnection, op: Operation) {
        let handle = self.connection.handle();
        let name = op.name();
        match op {
            Operation::CreateOffer { constraints, reply } => {
                let state = self.connection.signaling_state();
                let result = if state.can_create_offer() {
                    native.create_offer(&constraints).await.map_err(Into::into)
                } else {
                    Err(BridgeError::InvalidState {
                        operation: "createOffer",
                        state,
                    })
                };
                self.deliver(name, reply, result);
            }

            Operation::CreateAnswer { constraints, reply } => {
                let state = self.connection.signaling_state();
                let result = if state.can_create_answer() {
                    native.create_answer(&constraints).await.map_err(Into::into)
                } else {
                    Err(BridgeError::InvalidState {
                        operation: "createAnswer",
                        state,
                    })
                };
                self.deliver(name, reply, result);
            }

            Operation::SetLocalDescription { sdp, reply } => {
                let result = native.set_local_description(sdp).await;
                if result.is_ok() && !self.is_stale() {
                    self.connection.mirror_signaling(native.signaling_state());
                }
                self.deliver(name, reply, result.map_err(Into::into));
            }

            Operation::SetRemoteDescription { sdp, reply } => {
                let result = native.set_remote_description(sdp).await;
                if result.is_ok() && !self.is_stale() {
                    self.connection.mirror_signaling(native.signaling_state());
                }
                self.deliver(name, reply, result.map_err(Into::into));
            }

            Operation::AddIceCandidate { candidate, reply } => {
                let result = native.add_ice_candidate(candidate).await;
                self.deliver(name, reply, result.map_err(Into::into));
            }

            Operation::SetConfiguration { config, reply } => {
                let result = native.set_configuration(&config).await;
                if result.is_ok() && !self.is_stale() {
                    self.connection.state.lock().config = config;
                }
                self.deliver(name, reply, result.map_err(Into::into));
            }

            Operation::AddStream {
                stream_id,
                stream,
                reply,
            } => {
                let result = native.add_stream(stream).await;
                if result.is_ok() {
                    self.registry.attach_stream(&stream_id, handle);
                    debug!("PeerConnection {} added stream {}", handle, stream_id);
                }
                self.deliver(name, reply, result.map_err(Into::into));
            }

            Operation::RemoveStream {
                stream_id,
                stream,
                reply,
            } => {
                let result = native.remove_stream(&stream).await;
                if result.is_ok() {
                    self.registry.detach_stream(&stream_id, handle);
                }
                self.deliver(name, reply, result.map_err(Into::into));
            }

            Operation::GetStats { track_id, reply } => {
                let result = native.get_stats(track_id.as_deref()).await;
                self.deliver(name, reply, result.map_err(Into::into));
            }

            Operation::CreateDataChannel { label, init, reply } => {
                let result = match native.create_data_channel(&label, &init).await {
                    Ok(channel) => {
                        let id = channel.id();
                        if self.channels.register(&self.connection, channel.clone()) {
                            info!(
                                "PeerConnection {} created DataChannel {} '{}'",
                                handle, id, label
                            );
                            Ok(id)
                        } else if self.is_stale() {
                            channel.close().await;
                            Err(BridgeError::ConnectionNotFound(handle))
                        } else {
                            channel.close().await;
                            Err(BridgeError::Engine(format!(
                                "DataChannel id {} is already in use",
                                id
                            )))
                        }
                    }
                    Err(e) => Err(e.into()),
                };
                self.deliver(name, reply, result);
            }

            Operation::DataChannelSend { channel, payload } => {
                if let Err(e) = channel.send(payload).await {
                    warn!(
                        "PeerConnection {} DataChannel {} send failed: {}",
                        handle,
                        channel.id(),
                        e
                    );
                }
            }

            Operation::DataChannelClose { channel } => {
                let id = channel.id();
                channel.close().await;
                self.channels.forget(handle, id);
            }

            Operation::Close => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ready_pending() {
        let pending = Pending::ready(Ok(5));
        assert_eq!(pending.wait().await, Some(Ok(5)));
    }

    #[tokio::test]
    async fn test_dropped_reply_resolves_to_none() {
        let (reply, pending) = Pending::<()>::channel();
        drop(reply);
        assert_eq!(pending.wait().await, None);
    }

    #[tokio::test]
    async fn test_closed_connection_rejects_operations() {
        let connection = PeerConnection::detached(3);
        assert!(connection.mark_closed());
        assert!(!connection.mark_closed());
        assert_eq!(connection.signaling_state(), SignalingState::Closed);

        let result = connection
            .create_offer(MediaConstraints::default())
            .wait()
            .await;
        assert_eq!(result, Some(Err(BridgeError::ConnectionNotFound(3))));
    }

    #[test]
    fn test_signaling_events_are_deduplicated() {
        let connection = PeerConnection::detached(1);
        connection.mirror_signaling(SignalingState::HaveLocalOffer);
        assert!(connection.record_signaling_event(SignalingState::HaveLocalOffer));
        assert!(!connection.record_signaling_event(SignalingState::HaveLocalOffer));
        assert!(connection.record_signaling_event(SignalingState::Stable));
    }

    #[test]
    fn test_ice_state_records_changes_only() {
        let connection = PeerConnection::detached(1);
        assert!(!connection.record_ice_connection(IceConnectionState::New));
        assert!(connection.record_ice_connection(IceConnectionState::Checking));
        assert!(connection.record_ice_gathering(IceGatheringState::Gathering));
        assert!(!connection.record_ice_gathering(IceGatheringState::Gathering));
    }
}
