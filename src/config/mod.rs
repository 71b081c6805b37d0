//! Configuration management for rtc-bridge

use crate::webrtc::rtc_config::IceServer;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Native engine selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum EngineBackend {
    /// webrtc-rs
    #[default]
    Webrtc,
    /// In-memory engine, no network traffic
    Loopback,
}

impl EngineBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineBackend::Webrtc => "webrtc",
            EngineBackend::Loopback => "loopback",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Server configuration
    pub server: ServerConfig,

    /// Logging configuration
    pub logging: LoggingConfig,

    /// Native engine configuration
    pub engine: EngineConfig,

    /// Capture configuration
    pub capture: CaptureConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address
    pub host: String,

    /// HTTP / WebSocket port
    pub port: u16,

    /// WebSocket path of the host link
    pub ws_path: String,

    /// Events buffered per host link before it starts skipping
    pub event_buffer: usize,

    /// Require HTTP basic auth on everything but /health
    pub basic_auth_enabled: bool,

    pub basic_auth_user: String,

    pub basic_auth_password: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8090,
            ws_path: "/bridge".to_string(),
            event_buffer: 1024,
            basic_auth_enabled: false,
            basic_auth_user: "user".to_string(),
            basic_auth_password: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// ICE server entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Engine backend
    pub backend: EngineBackend,

    /// Used when a connection's configuration names no ICE server
    pub ice_servers: Vec<IceServerConfig>,

    /// UDP port range for ICE host candidates (both ends must be set)
    pub udp_port_min: Option<u16>,
    pub udp_port_max: Option<u16>,

    /// Public IPs advertised in place of host candidates (NAT 1:1)
    pub nat1to1_ips: Vec<String>,
}

impl EngineConfig {
    /// Fallback ICE servers, one entry per URL
    pub fn fallback_ice_servers(&self) -> Vec<IceServer> {
        self.ice_servers
            .iter()
            .flat_map(|server| {
                server.urls.iter().map(move |url| IceServer {
                    url: url.clone(),
                    username: server.username.clone(),
                    credential: server.credential.clone(),
                })
            })
            .collect()
    }

    pub fn udp_port_range(&self) -> Option<(u16, u16)> {
        match (self.udp_port_min, self.udp_port_max) {
            (Some(min), Some(max)) => Some((min, max)),
            _ => None,
        }
    }

    #[cfg(feature = "webrtc-engine")]
    pub fn webrtc_settings(&self) -> crate::engine::webrtc_rs::WebRtcSettings {
        crate::engine::webrtc_rs::WebRtcSettings {
            fallback_ice_servers: self.fallback_ice_servers(),
            udp_port_range: self.udp_port_range(),
            nat1to1_ips: self.nat1to1_ips.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Cameras exposed by the capture collaborator
    pub cameras: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self { cameras: 2 }
    }
}

impl BridgeConfig {
    /// Load configuration from file. A missing file yields the defaults.
    pub fn load(path: &PathBuf) -> Result<Self, Box<dyn std::error::Error>> {
        if !path.exists() {
            return Ok(BridgeConfig::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config: BridgeConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        if self.server.port == 0 {
            return Err("Server port must be non-zero".into());
        }

        if !self.server.ws_path.starts_with('/') {
            return Err(format!("ws_path must start with '/': {}", self.server.ws_path).into());
        }

        if matches!(self.server.ws_path.as_str(), "/health" | "/metrics" | "/connections") {
            return Err(format!("ws_path {} collides with a built-in route", self.server.ws_path).into());
        }

        if self.server.basic_auth_enabled && self.server.basic_auth_password.is_empty() {
            return Err("Basic auth is enabled but password is empty".into());
        }

        match (self.engine.udp_port_min, self.engine.udp_port_max) {
            (Some(min), Some(max)) if min > max => {
                return Err(format!("udp_port_min {} exceeds udp_port_max {}", min, max).into());
            }
            (Some(_), None) | (None, Some(_)) => {
                return Err("udp_port_min and udp_port_max must be set together".into());
            }
            _ => {}
        }

        for server in &self.engine.ice_servers {
            if server.urls.is_empty() {
                return Err("ICE server entry without urls".into());
            }
        }

        #[cfg(not(feature = "webrtc-engine"))]
        if self.engine.backend == EngineBackend::Webrtc {
            return Err("webrtc backend requested but built without the webrtc-engine feature".into());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config: BridgeConfig = toml::from_str(
            r#"
            [server]
            port = 9000

            [engine]
            backend = "loopback"
            udp_port_min = 40000
            udp_port_max = 40100

            [[engine.ice_servers]]
            urls = ["stun:stun.example.org:3478", "turn:turn.example.org"]
            username = "u"
            credential = "p"
            "#,
        )
        .unwrap();

        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.ws_path, "/bridge");
        assert_eq!(config.engine.backend, EngineBackend::Loopback);
        assert_eq!(config.engine.udp_port_range(), Some((40000, 40100)));
        assert_eq!(config.capture.cameras, 2);

        let servers = config.engine.fallback_ice_servers();
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[1].url, "turn:turn.example.org");
        assert_eq!(servers[1].username.as_deref(), Some("u"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let config = BridgeConfig::load(&PathBuf::from("/nonexistent/rtc-bridge.toml")).unwrap();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = BridgeConfig::default();
        config.engine.backend = EngineBackend::Loopback;
        config.engine.udp_port_min = Some(50000);
        assert!(config.validate().is_err());
        config.engine.udp_port_max = Some(40000);
        assert!(config.validate().is_err());
        config.engine.udp_port_max = Some(60000);
        assert!(config.validate().is_ok());

        config.server.ws_path = "metrics".to_string();
        assert!(config.validate().is_err());
        config.server.ws_path = "/metrics".to_string();
        assert!(config.validate().is_err());
        config.server.ws_path = "/bridge".to_string();

        config.server.basic_auth_enabled = true;
        assert!(config.validate().is_err());
    }
}
