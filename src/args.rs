use clap::Parser;
use std::path::PathBuf;

use crate::config::{self, EngineBackend};

#[derive(Parser, Debug)]
#[command(name = "rtc-bridge")]
#[command(author = "rtc-bridge Team")]
#[command(version)]
#[command(about = "Handle-based WebRTC bridge for a host application", long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/rtc-bridge.toml")]
    pub config: PathBuf,

    /// Bind address of the HTTP / WebSocket server
    #[arg(long)]
    pub host: Option<String>,

    /// HTTP / WebSocket port
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Native engine backend
    #[arg(short, long, value_enum)]
    pub backend: Option<EngineBackend>,

    /// Verbose logging
    #[arg(short, long, action)]
    pub verbose: bool,
}

impl Args {
    /// Load the configuration file and apply command line overrides
    pub fn load_config(&self) -> Result<config::BridgeConfig, Box<dyn std::error::Error>> {
        let mut config = config::BridgeConfig::load(&self.config)?;
        if let Some(ref host) = self.host {
            config.server.host = host.clone();
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(backend) = self.backend {
            config.engine.backend = backend;
        }
        if self.verbose {
            config.logging.level = "debug".to_string();
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_file() {
        let args = Args::parse_from([
            "rtc-bridge",
            "--config",
            "/nonexistent/rtc-bridge.toml",
            "--port",
            "9100",
            "--backend",
            "loopback",
            "-v",
        ]);
        let config = args.load_config().unwrap();
        assert_eq!(config.server.port, 9100);
        assert_eq!(config.engine.backend, EngineBackend::Loopback);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.server.host, "127.0.0.1");
    }
}
