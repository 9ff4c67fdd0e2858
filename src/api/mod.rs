//! Chathub HTTP Server
//!
//! HTTP layer for the hub, built with Axum.
//!
//! # Endpoints
//!
//! ## WebSocket
//! - `GET /v1/ws` - Chat connection (path configurable)
//!
//! ## Health
//! - `GET /health/live` - Liveness probe
//! - `GET /health/ready` - Readiness probe
//! - `GET /health` - Full health status
//!
//! # Example
//!
//! ```rust,ignore
//! use chathub::api::{serve, AppState};
//! use chathub::config::Config;
//! use chathub::hub::BroadcastHub;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::default();
//!     let (hub, dispatcher) = BroadcastHub::new(config.hub.hub_config());
//!     let cancel = CancellationToken::new();
//!     tokio::spawn(dispatcher.run(cancel.clone()));
//!
//!     serve(AppState::new(hub, config), cancel).await?;
//!     Ok(())
//! }
//! ```

pub mod dto;
pub mod error;
pub mod routes;
pub mod state;

pub use error::{ApiError, ApiResult};
pub use state::AppState;

use axum::{
    http::{HeaderValue, Method},
    middleware,
    routing::get,
    Router,
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};

use crate::config::ServerConfig;
use crate::websocket::{require_allowed_origin, websocket_handler};

/// Build the router with all routes and middleware
pub fn build_router(state: AppState) -> Router {
    let shared_state = Arc::new(state);
    let server = &shared_state.config.server;

    let ws_routes = Router::new()
        .route(&server.path, get(websocket_handler))
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&shared_state),
            require_allowed_origin,
        ));

    let health_routes = Router::new()
        .route("/live", get(routes::health::liveness))
        .route("/ready", get(routes::health::readiness))
        .route("/", get(routes::health::full_health));

    let cors = cors_layer(server);

    Router::new()
        .merge(ws_routes)
        .nest("/health", health_routes)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(shared_state)
}

/// CORS policy from the allowed origin list
///
/// Allow-all mirrors the request origin so credentials stay permitted.
fn cors_layer(config: &ServerConfig) -> CorsLayer {
    if config.allows_any_origin() {
        return CorsLayer::very_permissive();
    }

    let origins: Vec<HeaderValue> = config
        .allowed_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin.trim_end_matches('/')) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(origin = %origin, error = %e, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET])
        .allow_credentials(true)
}

/// Bind the configured address and serve until `cancel` fires
pub async fn serve(state: AppState, cancel: CancellationToken) -> ApiResult<()> {
    let addr = state.config.server.addr();
    let listener = TcpListener::bind(&addr).await?;
    serve_with_listener(listener, state, cancel).await
}

/// Serve on an already bound listener until `cancel` fires
pub async fn serve_with_listener(
    listener: TcpListener,
    state: AppState,
    cancel: CancellationToken,
) -> ApiResult<()> {
    let path = state.config.server.path.clone();
    let router = build_router(state);

    tracing::info!("Chathub listening on {} (WebSocket at {})", listener.local_addr()?, path);

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .map_err(|e| ApiError::Internal(format!("Server error: {}", e)))?;

    tracing::info!("Chathub HTTP server shut down gracefully");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, starting graceful shutdown");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::hub::{BroadcastHub, Message};
    use axum::{
        body::Body,
        http::{header, Request, StatusCode},
    };
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tower::util::ServiceExt;

    fn create_test_app(config: Config) -> (Router, Arc<crate::hub::BroadcastHub>) {
        let (hub, _dispatcher) = BroadcastHub::new(config.hub.hub_config());
        let router = build_router(AppState::new(Arc::clone(&hub), config));
        (router, hub)
    }

    fn restricted_config() -> Config {
        let mut config = Config::default();
        config.server.allowed_origins = vec!["https://chat.example".to_string()];
        config
    }

    async fn get(app: Router, uri: &str, origin: Option<&str>) -> axum::response::Response {
        let mut request = Request::builder().uri(uri);
        if let Some(origin) = origin {
            request = request.header(header::ORIGIN, origin);
        }
        app.oneshot(request.body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_live() {
        let (app, _hub) = create_test_app(Config::default());
        let response = get(app, "/health/live", None).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_health_ready() {
        let (app, _hub) = create_test_app(Config::default());
        let response = get(app, "/health/ready", None).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_health_not_ready_after_shutdown() {
        let config = Config::default();
        let (hub, dispatcher) = BroadcastHub::new(config.hub.hub_config());
        let app = build_router(AppState::new(hub, config));

        let cancel = CancellationToken::new();
        cancel.cancel();
        dispatcher.run(cancel).await;

        let response = get(app, "/health/ready", None).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_health_full() {
        let (app, _hub) = create_test_app(Config::default());
        let response = get(app, "/health", None).await;
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["hub"]["connections"], 0);
        assert_eq!(json["version"], env!("CARGO_PKG_VERSION"));
    }

    #[tokio::test]
    async fn test_disallowed_origin_forbidden() {
        let (app, _hub) = create_test_app(restricted_config());
        let response = get(app, "/v1/ws", Some("https://evil.example")).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_allowed_origin_reaches_upgrade() {
        let (app, _hub) = create_test_app(restricted_config());
        // Not an upgrade request, so the WebSocket extractor rejects it
        let response = get(app, "/v1/ws", Some("https://chat.example")).await;
        assert_ne!(response.status(), StatusCode::FORBIDDEN);
        assert!(response.status().is_client_error());
    }

    #[tokio::test]
    async fn test_cors_allows_any_origin_by_default() {
        let (app, _hub) = create_test_app(Config::default());
        let response = get(app, "/health/live", Some("http://localhost:8080")).await;
        assert_eq!(
            response.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN),
            Some(&HeaderValue::from_static("http://localhost:8080"))
        );
    }

    // Minimal WebSocket client over a raw TCP stream

    async fn ws_connect(addr: std::net::SocketAddr) -> TcpStream {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = format!(
            "GET /v1/ws HTTP/1.1\r\n\
             Host: {}\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
             Sec-WebSocket-Version: 13\r\n\r\n",
            addr
        );
        stream.write_all(request.as_bytes()).await.unwrap();

        let mut response = Vec::new();
        let mut byte = [0u8; 1];
        while !response.ends_with(b"\r\n\r\n") {
            stream.read_exact(&mut byte).await.unwrap();
            response.push(byte[0]);
        }
        let response = String::from_utf8(response).unwrap();
        assert!(response.starts_with("HTTP/1.1 101"), "{}", response);
        stream
    }

    async fn ws_send_text(stream: &mut TcpStream, text: &str) {
        let payload = text.as_bytes();
        assert!(payload.len() < 126);
        let mask = [0x12u8, 0x34, 0x56, 0x78];

        let mut frame = vec![0x81, 0x80 | payload.len() as u8];
        frame.extend_from_slice(&mask);
        frame.extend(payload.iter().enumerate().map(|(i, b)| b ^ mask[i % 4]));
        stream.write_all(&frame).await.unwrap();
    }

    async fn ws_read_text(stream: &mut TcpStream) -> String {
        let read = async {
            let mut header = [0u8; 2];
            stream.read_exact(&mut header).await.unwrap();
            assert_eq!(header[0], 0x81, "expected a final text frame");
            let len = (header[1] & 0x7f) as usize;
            assert!(len < 126);

            let mut payload = vec![0u8; len];
            stream.read_exact(&mut payload).await.unwrap();
            String::from_utf8(payload).unwrap()
        };
        tokio::time::timeout(Duration::from_secs(2), read)
            .await
            .expect("timed out waiting for frame")
    }

    struct TestServer {
        addr: std::net::SocketAddr,
        hub: Arc<BroadcastHub>,
        cancel: CancellationToken,
        delivery: tokio::task::JoinHandle<()>,
    }

    async fn start_server(config: Config) -> TestServer {
        let (hub, dispatcher) = BroadcastHub::new(config.hub.hub_config());
        let cancel = CancellationToken::new();
        let delivery = tokio::spawn(dispatcher.run(cancel.clone()));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = AppState::new(Arc::clone(&hub), config);
        tokio::spawn(serve_with_listener(listener, state, cancel.clone()));

        TestServer {
            addr,
            hub,
            cancel,
            delivery,
        }
    }

    async fn wait_for_connections(hub: &BroadcastHub, count: usize) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while hub.connection_count() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_websocket_fan_out_end_to_end() {
        let TestServer {
            addr,
            hub,
            cancel,
            delivery,
        } = start_server(Config::default()).await;

        let mut alice = ws_connect(addr).await;
        let mut bob = ws_connect(addr).await;
        wait_for_connections(&hub, 2).await;

        let hi = Message::new("alice", "hi").encode().unwrap();
        ws_send_text(&mut alice, &hi).await;

        assert_eq!(ws_read_text(&mut alice).await, hi);
        assert_eq!(ws_read_text(&mut bob).await, hi);
        assert_eq!(hub.stats().published, 1);

        cancel.cancel();
        delivery.await.unwrap();
        assert_eq!(hub.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_websocket_with_custom_write_buffer() {
        let mut config = Config::default();
        config.server.write_buffer_size = 64;
        let server = start_server(config).await;

        let mut carol = ws_connect(server.addr).await;
        wait_for_connections(&server.hub, 1).await;

        let hello = Message::new("carol", "a message longer than the write buffer").encode().unwrap();
        ws_send_text(&mut carol, &hello).await;
        assert_eq!(ws_read_text(&mut carol).await, hello);

        server.cancel.cancel();
        server.delivery.await.unwrap();
    }
}
