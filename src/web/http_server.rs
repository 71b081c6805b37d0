//! HTTP server for health checks, metrics and the host link
//!
//! Provides health check endpoints, Prometheus metrics, a connection
//! listing and the host link WebSocket.

use crate::web::shared::SharedState;
use axum::{
    body::Body,
    extract::State,
    extract::WebSocketUpgrade,
    http::{header, Request, StatusCode},
    middleware,
    response::Response,
    routing::get,
    Router,
};
use base64::Engine;
use log::info;
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;

/// Build the router serving `state`
pub fn router(state: Arc<SharedState>) -> Router {
    let ws_path = state.config.server.ws_path.clone();
    info!("Host link endpoint at {}", ws_path);

    let link_state = state.clone();
    let host_link_handler = move |ws: WebSocketUpgrade| {
        let state = link_state.clone();
        async move {
            ws.on_upgrade(move |socket| async move {
                crate::transport::handle_host_connection(socket, state).await;
            })
        }
    };

    let auth_state = state.clone();
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/connections", get(connections_handler))
        .route(&ws_path, get(host_link_handler))
        .with_state(state)
        .layer(middleware::from_fn_with_state(auth_state, basic_auth_middleware))
}

/// Run the HTTP server until `shutdown` resolves
pub async fn run_http_server(
    state: Arc<SharedState>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), Box<dyn std::error::Error>> {
    let addr = format!("{}:{}", state.config.server.host, state.config.server.port);
    let app = router(state);

    let listener = TcpListener::bind(&addr).await?;
    info!("HTTP server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| Box::new(e) as Box<dyn std::error::Error>)?;

    Ok(())
}

/// Health check handler
async fn health_handler(State(state): State<Arc<SharedState>>) -> String {
    format!(
        r#"{{
  "status": "healthy",
  "uptime_seconds": {:.2},
  "connections": {},
  "version": "{}"
}}"#,
        state.start_time.elapsed().as_secs_f64(),
        state.bridge.connection_count(),
        env!("CARGO_PKG_VERSION")
    )
}

/// Metrics handler (Prometheus format)
async fn metrics_handler(State(state): State<Arc<SharedState>>) -> String {
    state.metrics.render(&state.bridge)
}

/// Live connection handles and registry sizes
async fn connections_handler(State(state): State<Arc<SharedState>>) -> Response {
    let registry = state.bridge.registry();
    let payload = json!({
        "peer_connections": registry.connection_handles(),
        "media_streams": registry.stream_count(),
        "media_tracks": registry.track_count(),
        "data_channels": registry.channel_count(),
    });
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(payload.to_string()))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

async fn basic_auth_middleware(
    State(state): State<Arc<SharedState>>,
    req: Request<Body>,
    next: middleware::Next,
) -> Response {
    let server = &state.config.server;
    if !server.basic_auth_enabled || req.uri().path() == "/health" {
        return next.run(req).await;
    }

    if let Some(value) = req.headers().get(header::AUTHORIZATION) {
        if let Some((user, pass)) = value.to_str().ok().and_then(decode_basic_auth) {
            if user == server.basic_auth_user && pass == server.basic_auth_password {
                return next.run(req).await;
            }
        }
    }

    let mut response = Response::builder()
        .status(StatusCode::UNAUTHORIZED)
        .body(Body::from("Unauthorized"))
        .unwrap_or_else(|_| Response::new(Body::empty()));
    response.headers_mut().insert(
        header::WWW_AUTHENTICATE,
        header::HeaderValue::from_static("Basic realm=\"rtc-bridge\""),
    );
    response
}

/// Split a `Basic` authorization header into user and password
fn decode_basic_auth(value: &str) -> Option<(String, String)> {
    let encoded = value.strip_prefix("Basic ")?;
    let decoded = base64::engine::general_purpose::STANDARD.decode(encoded).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, pass) = decoded.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}
