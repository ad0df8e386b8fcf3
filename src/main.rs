// SPDX-License-Identifier: GPL-3.0-or-later

//! Parley Chat Server
//!
//! A real-time direct-messaging server. Provides:
//! - WebSocket endpoint for presence, messaging, and side-channel signals
//! - Durable message log with read markers
//! - HTTP endpoint for Prometheus metrics
//! - Rate limiting and abuse prevention

use std::sync::Arc;
use std::time::Instant;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio_tungstenite::accept_async;
use tracing::{error, info};

use parley::auth::TokenVerifier;
use parley::config::ChatConfig;
use parley::connection_limit::ConnectionLimiter;
use parley::fanout::SignalFanout;
use parley::handler;
use parley::http::{create_router, HttpState};
use parley::messages::{create_message_store, MessageStore};
use parley::metrics::ChatMetrics;
use parley::presence::PresenceRegistry;
use parley::rate_limit::RateLimiter;
use parley::relay::MessageRelay;
use parley::users::{create_user_directory, UserDirectory};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("parley=info".parse().unwrap()),
        )
        .init();

    let config = ChatConfig::from_env();

    if config.jwt_secret.is_empty() {
        error!("PARLEY_JWT_SECRET is not set; refusing to start without a token secret");
        std::process::exit(1);
    }

    // TLS enforcement: refuse to start if not localhost and TLS not confirmed
    let is_localhost = config.listen_addr.ip().is_loopback();
    let tls_verified = std::env::var("PARLEY_TLS_VERIFIED")
        .map(|v| v == "true" || v == "1")
        .unwrap_or(false);

    if !is_localhost && !tls_verified {
        error!("SECURITY ERROR: the chat server must run behind a TLS proxy in production.");
        error!(
            "Listen address {} is not loopback and TLS verification has not been confirmed.",
            config.listen_addr
        );
        error!("Either run behind a TLS-terminating proxy and set PARLEY_TLS_VERIFIED=true,");
        error!("or bind to localhost for development: PARLEY_LISTEN_ADDR=127.0.0.1:8080");
        std::process::exit(1);
    }

    let rate_limiter = Arc::new(RateLimiter::new(config.rate_limit_per_min));
    let connection_limiter = ConnectionLimiter::new(config.max_connections);
    let start_time = Instant::now();

    // Metrics bind to localhost by default; they reveal internal state
    let http_addr =
        std::env::var("PARLEY_METRICS_ADDR").unwrap_or_else(|_| "127.0.0.1:8081".to_string());

    info!("Starting Parley Chat Server v{}", env!("CARGO_PKG_VERSION"));
    info!("WebSocket: {}", config.listen_addr);
    if tls_verified {
        info!("TLS: Verified (handled by external proxy)");
    } else {
        info!("TLS: Local development mode (localhost only)");
    }
    info!("Metrics endpoint: {}", http_addr);
    info!("Storage backend: {:?}", config.storage_backend);
    info!("Idle timeout: {}s", config.idle_timeout_secs);

    let metrics = ChatMetrics::new();

    let users: Arc<dyn UserDirectory> = Arc::from(create_user_directory(
        config.storage_backend,
        Some(config.data_dir.as_path()),
    ));
    let store: Arc<dyn MessageStore> = Arc::from(create_message_store(
        config.storage_backend,
        Some(config.data_dir.as_path()),
    ));
    let registry = Arc::new(PresenceRegistry::new());
    let relay = Arc::new(MessageRelay::new(
        registry.clone(),
        users.clone(),
        store.clone(),
    ));
    let fanout = Arc::new(SignalFanout::new(registry.clone(), store.clone()));
    let verifier = Arc::new(TokenVerifier::new(&config.jwt_secret));

    // Metrics auth token (optional additional protection)
    let metrics_token = std::env::var("PARLEY_METRICS_TOKEN").ok();
    if metrics_token.is_some() {
        info!("Metrics endpoint protected with bearer token");
    } else if !http_addr.starts_with("127.0.0.1") && !http_addr.starts_with("localhost") {
        info!("WARNING: Metrics exposed on non-localhost without auth token");
        info!("Consider setting PARLEY_METRICS_TOKEN for production use");
    }

    let http_state = HttpState {
        metrics: metrics.clone(),
        metrics_token,
    };
    let http_router = create_router(http_state);

    let http_listener = TcpListener::bind(&http_addr)
        .await
        .expect("Failed to bind HTTP listener");

    tokio::spawn(async move {
        info!("HTTP server listening on {}", http_addr);
        axum::serve(http_listener, http_router).await.unwrap();
    });

    // Sweep stale rate limiter buckets
    let cleanup_rate_limiter = rate_limiter.clone();
    tokio::spawn(async move {
        loop {
            // Every 10 minutes, drop users idle for 30 minutes
            tokio::time::sleep(std::time::Duration::from_secs(600)).await;
            let removed =
                cleanup_rate_limiter.cleanup_inactive(std::time::Duration::from_secs(1800));
            if removed > 0 {
                info!("Cleaned up {} stale rate limiter entries", removed);
            }
        }
    });

    let listener = TcpListener::bind(&config.listen_addr)
        .await
        .expect("Failed to bind WebSocket listener");

    info!("WebSocket server listening on {}", config.listen_addr);

    while let Ok((stream, _addr)) = listener.accept().await {
        let connection_guard = match connection_limiter.try_acquire() {
            Some(guard) => guard,
            None => {
                tracing::warn!(
                    "Connection rejected: at max capacity ({}/{})",
                    connection_limiter.active_count(),
                    config.max_connections
                );
                metrics.connection_errors.inc();
                drop(stream);
                continue;
            }
        };

        let verifier = verifier.clone();
        let users = users.clone();
        let registry = registry.clone();
        let relay = relay.clone();
        let fanout = fanout.clone();
        let rate_limiter = rate_limiter.clone();
        let metrics = metrics.clone();
        let max_message_size = config.max_message_size;
        let idle_timeout = config.idle_timeout();

        tokio::spawn(async move {
            // Keep the guard alive for the duration of the connection
            let _guard = connection_guard;

            // Peek at the first bytes to tell a plain HTTP probe from a
            // WebSocket upgrade. Liveness checks hit the main port directly.
            let mut peek_buf = [0u8; 512];
            if let Ok(n) = stream.peek(&mut peek_buf).await {
                if n > 0 {
                    let peek_str = String::from_utf8_lossy(&peek_buf[..n]);
                    let peek_lower = peek_str.to_ascii_lowercase();

                    let is_websocket_upgrade = peek_lower.contains("upgrade: websocket")
                        && peek_lower.contains("connection:")
                        && peek_lower.contains("upgrade");

                    if !is_websocket_upgrade && peek_lower.starts_with("get ") {
                        let (status, body) = if peek_lower.contains("get /health")
                            || peek_lower.contains("get /up")
                            || peek_lower.contains("get /ready")
                        {
                            let uptime = start_time.elapsed().as_secs();
                            (
                                "200 OK",
                                format!(
                                    r#"{{"status":"healthy","version":"{}","uptime_seconds":{},"online_users":{}}}"#,
                                    env!("CARGO_PKG_VERSION"),
                                    uptime,
                                    registry.online_count()
                                ),
                            )
                        } else {
                            (
                                "200 OK",
                                r#"{"error":"This is a WebSocket chat endpoint"}"#.to_string(),
                            )
                        };
                        let response = format!(
                            "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                            status,
                            body.len(),
                            body
                        );
                        let mut stream = stream;
                        let _ = stream.write_all(response.as_bytes()).await;
                        let _ = stream.shutdown().await;
                        return;
                    }
                }
            }

            // WebSocket handshake with timeout to stop slowloris clients
            match tokio::time::timeout(idle_timeout, accept_async(stream)).await {
                Ok(Ok(ws_stream)) => {
                    metrics.connections_total.inc();
                    metrics.connections_active.inc();

                    handler::handle_connection(
                        ws_stream,
                        handler::ConnectionDeps {
                            verifier,
                            users,
                            registry,
                            relay,
                            fanout,
                            rate_limiter,
                            metrics: metrics.clone(),
                            max_message_size,
                            idle_timeout,
                        },
                    )
                    .await;

                    metrics.connections_active.dec();
                }
                Ok(Err(e)) => {
                    error!("WebSocket handshake failed: {}", e);
                    metrics.connection_errors.inc();
                }
                Err(_) => {
                    tracing::warn!("WebSocket handshake timeout (slowloris protection)");
                    metrics.connection_errors.inc();
                }
            }
            // _guard dropped here, releasing the connection slot
        });
    }
}
