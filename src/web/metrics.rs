//! Prometheus metrics
//!
//! Gauges mirror the registry sizes and are refreshed on every scrape;
//! counters are bumped by the host link as commands and events flow.

use crate::webrtc::RtcBridge;
use prometheus::{Encoder, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use std::time::Instant;

pub struct Metrics {
    registry: Registry,
    started: Instant,
    uptime: IntGauge,
    connections: IntGauge,
    streams: IntGauge,
    tracks: IntGauge,
    data_channels: IntGauge,
    host_links: IntGauge,
    commands: IntCounterVec,
    events: IntCounterVec,
}

fn gauge(registry: &Registry, name: &str, help: &str) -> Result<IntGauge, prometheus::Error> {
    let g = IntGauge::new(name, help)?;
    registry.register(Box::new(g.clone()))?;
    Ok(g)
}

fn counter(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> Result<IntCounterVec, prometheus::Error> {
    let c = IntCounterVec::new(Opts::new(name, help), labels)?;
    registry.register(Box::new(c.clone()))?;
    Ok(c)
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();
        Ok(Self {
            uptime: gauge(&registry, "rtc_bridge_uptime_seconds", "Server uptime in seconds")?,
            connections: gauge(
                &registry,
                "rtc_bridge_peer_connections",
                "Live peer connection handles",
            )?,
            streams: gauge(&registry, "rtc_bridge_media_streams", "Registered media streams")?,
            tracks: gauge(&registry, "rtc_bridge_media_tracks", "Registered media tracks")?,
            data_channels: gauge(
                &registry,
                "rtc_bridge_data_channels",
                "Registered data channels",
            )?,
            host_links: gauge(&registry, "rtc_bridge_host_links", "Connected host WebSockets")?,
            commands: counter(
                &registry,
                "rtc_bridge_commands_total",
                "Host commands handled",
                &["method", "outcome"],
            )?,
            events: counter(
                &registry,
                "rtc_bridge_events_total",
                "Events delivered to the host",
                &["event"],
            )?,
            started: Instant::now(),
            registry,
        })
    }

    pub fn record_command(&self, method: &str, ok: bool) {
        self.commands
            .with_label_values(&[method, if ok { "ok" } else { "error" }])
            .inc();
    }

    pub fn record_event(&self, event: &str) {
        self.events.with_label_values(&[event]).inc();
    }

    pub fn host_link_opened(&self) {
        self.host_links.inc();
    }

    pub fn host_link_closed(&self) {
        self.host_links.dec();
    }

    pub fn uptime_secs(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    /// Refresh the gauges from `bridge` and encode everything in the text
    /// exposition format
    pub fn render(&self, bridge: &RtcBridge) -> String {
        let registry = bridge.registry();
        self.uptime.set(self.started.elapsed().as_secs() as i64);
        self.connections.set(registry.connection_count() as i64);
        self.streams.set(registry.stream_count() as i64);
        self.tracks.set(registry.track_count() as i64);
        self.data_channels.set(registry.channel_count() as i64);

        let mut buffer = Vec::new();
        if let Err(e) = TextEncoder::new().encode(&self.registry.gather(), &mut buffer) {
            log::warn!("Failed to encode metrics: {}", e);
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::VirtualCameras;
    use crate::engine::loopback::LoopbackFactory;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_render_reports_registry_sizes() {
        let metrics = Metrics::new().unwrap();
        let (bridge, _events) = RtcBridge::new(
            Arc::new(LoopbackFactory::new()),
            Arc::new(VirtualCameras::new(1)),
        );
        bridge.init_connection(None, None, 3).unwrap();
        bridge
            .get_user_media(Some(&serde_json::json!({"audio": true})))
            .unwrap();
        metrics.record_command("getUserMedia", true);
        metrics.record_event("peerConnectionOnRenegotiationNeeded");

        let text = metrics.render(&bridge);
        assert!(text.contains("rtc_bridge_peer_connections 1"));
        assert!(text.contains("rtc_bridge_media_streams 1"));
        assert!(text.contains("rtc_bridge_media_tracks 1"));
        assert!(text.contains(r#"rtc_bridge_commands_total{method="getUserMedia",outcome="ok"} 1"#));
    }
}
