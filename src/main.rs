//! rtc-bridge - Main entry point
//!
//! Serves the handle-based WebRTC bridge to a host application over a
//! WebSocket, with health and metrics endpoints alongside.

use clap::Parser;
use log::{error, info, warn};
use rtc_bridge::args::Args;
use rtc_bridge::capture::VirtualCameras;
use rtc_bridge::config::{BridgeConfig, EngineBackend};
use rtc_bridge::engine::loopback::LoopbackFactory;
use rtc_bridge::engine::PeerConnectionFactory;
use rtc_bridge::web::{self, Metrics, SharedState};
use rtc_bridge::webrtc::RtcBridge;
use std::sync::Arc;
use tokio::signal;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse command line arguments
    let args = Args::parse();
    let loaded = args.load_config();

    // Initialize logging with noise filtering for third-party WebRTC crates
    let log_level = match loaded {
        Ok(ref config) => config.logging.level.clone(),
        Err(_) if args.verbose => "debug".to_string(),
        Err(_) => "info".to_string(),
    };
    env_logger::Builder::new()
        .parse_filters(&std::env::var("RTC_BRIDGE_LOG").unwrap_or(log_level))
        .filter_module("webrtc_ice", log::LevelFilter::Error)
        .filter_module("webrtc_dtls", log::LevelFilter::Error)
        .filter_module("webrtc_mdns", log::LevelFilter::Error)
        .filter_module("webrtc_sctp", log::LevelFilter::Error)
        .init();

    info!("rtc-bridge v{}", env!("CARGO_PKG_VERSION"));

    let config = match loaded {
        Ok(cfg) => {
            info!("Loaded configuration from {:?}", args.config);
            cfg
        }
        Err(e) => {
            warn!("Failed to load config: {}, using defaults", e);
            BridgeConfig::default()
        }
    };

    // Validate configuration
    if let Err(e) = config.validate() {
        error!("Invalid configuration: {}", e);
        return Err(e);
    }

    let factory = build_factory(&config)?;
    info!("Using {} engine backend", config.engine.backend.as_str());

    let cameras = Arc::new(VirtualCameras::new(config.capture.cameras));
    info!("Capture collaborator exposes {} camera(s)", config.capture.cameras);

    let (bridge, events) = RtcBridge::new(factory, cameras);
    let metrics = Metrics::new()?;
    let state = Arc::new(SharedState::new(config, bridge, events, metrics));

    // Wait for shutdown signal
    let shutdown = async {
        let _ = signal::ctrl_c().await;
        info!("Shutdown signal received");
    };

    if let Err(e) = web::run_http_server(state.clone(), shutdown).await {
        error!("HTTP server error: {}", e);
    }

    info!("Initiating graceful shutdown...");
    state.bridge.shutdown();
    info!("rtc-bridge stopped");
    Ok(())
}

fn build_factory(
    config: &BridgeConfig,
) -> Result<Arc<dyn PeerConnectionFactory>, Box<dyn std::error::Error>> {
    match config.engine.backend {
        EngineBackend::Loopback => Ok(Arc::new(LoopbackFactory::new())),
        #[cfg(feature = "webrtc-engine")]
        EngineBackend::Webrtc => Ok(Arc::new(rtc_bridge::engine::webrtc_rs::WebRtcFactory::new(
            config.engine.webrtc_settings(),
        ))),
        #[cfg(not(feature = "webrtc-engine"))]
        EngineBackend::Webrtc => Err("Built without the webrtc-engine feature".into()),
    }
}
