//! Shared state for rtc-bridge
//!
//! Holds the bridge, metrics and the host event fan-out shared by the HTTP
//! handlers and every host link.

use crate::config::BridgeConfig;
use crate::web::metrics::Metrics;
use crate::webrtc::{HostEvent, RtcBridge};
use log::debug;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

/// Shared state for the application
#[derive(Clone)]
pub struct SharedState {
    /// Configuration
    pub config: Arc<BridgeConfig>,

    /// The bridge all host links drive
    pub bridge: Arc<RtcBridge>,

    /// Prometheus metrics
    pub metrics: Arc<Metrics>,

    /// Host event broadcast sender
    pub event_sender: broadcast::Sender<Arc<HostEvent>>,

    /// Server start time
    pub start_time: std::time::Instant,
}

impl SharedState {
    /// Create the shared state and start forwarding bridge events to the
    /// broadcast channel. Must be called inside a tokio runtime.
    pub fn new(
        config: BridgeConfig,
        bridge: RtcBridge,
        events: mpsc::UnboundedReceiver<HostEvent>,
        metrics: Metrics,
    ) -> Self {
        let (event_sender, _) = broadcast::channel(config.server.event_buffer.max(1));
        tokio::spawn(fan_out_events(events, event_sender.clone()));

        Self {
            config: Arc::new(config),
            bridge: Arc::new(bridge),
            metrics: Arc::new(metrics),
            event_sender,
            start_time: std::time::Instant::now(),
        }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<Arc<HostEvent>> {
        self.event_sender.subscribe()
    }
}

async fn fan_out_events(
    mut events: mpsc::UnboundedReceiver<HostEvent>,
    sender: broadcast::Sender<Arc<HostEvent>>,
) {
    while let Some(event) = events.recv().await {
        if sender.send(Arc::new(event)).is_err() {
            debug!("No host link connected, event dropped");
        }
    }
    debug!("Bridge event stream ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::VirtualCameras;
    use crate::engine::loopback::LoopbackFactory;

    #[tokio::test]
    async fn test_events_reach_subscribers() {
        let (bridge, events) = RtcBridge::new(
            Arc::new(LoopbackFactory::new()),
            Arc::new(VirtualCameras::new(0)),
        );
        let state = SharedState::new(BridgeConfig::default(), bridge, events, Metrics::new().unwrap());
        let mut rx = state.subscribe_events();

        state.bridge.init_connection(None, None, 1).unwrap();
        let channel = state.bridge.create_data_channel(1, "chat", None).wait().await;
        assert!(matches!(channel, Some(Ok(_))));

        let event = rx.recv().await.unwrap();
        assert_eq!(*event, HostEvent::RenegotiationNeeded { id: 1 });
    }
}
