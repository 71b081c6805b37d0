//! HTTP server for health checks, metrics and the host link

pub mod shared;
pub use shared::SharedState;

pub mod metrics;
pub use metrics::Metrics;

pub mod http_server;
pub use http_server::run_http_server;
