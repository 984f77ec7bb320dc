//! hooknest-api: HTTP surface for the hooknest engine

mod handlers;
pub mod middleware;

use axum::{
    Router,
    http::{HeaderValue, header},
    routing::{any, get},
};
use hooknest_core::{ConfigSource, Hooknest};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::compression::CompressionLayer;
use tower_http::compression::predicate::{NotForContentType, Predicate, SizeAbove};
use tower_http::cors::CorsLayer;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

/// Application state shared across handlers
pub struct AppState {
    pub hooknest: Arc<Hooknest>,
}

/// Build the Axum router with all routes.
///
/// Note: rate limiting and auth run inside the handlers against the live
/// config snapshot (they hot-reload), so `oneshot` tests exercise the real
/// gate without a TCP connection.
pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = build_cors_layer(&state);
    // Never compress the SSE stream: buffering would starve heartbeats.
    let compression = CompressionLayer::new()
        .compress_when(SizeAbove::new(1024).and(NotForContentType::new("text/event-stream")));

    Router::new()
        .route("/webhook/{id}", any(handlers::ingest))
        .route(
            "/replay/{webhook_id}/{item_id}",
            get(handlers::replay).post(handlers::replay),
        )
        .route("/log-stream", get(handlers::log_stream))
        .route("/logs", get(handlers::logs))
        .route("/info", get(handlers::info))
        .route("/", get(handlers::dashboard))
        .layer(axum::middleware::from_fn(middleware::request_id_middleware))
        .with_state(state)
        .layer(cors)
        .layer(compression)
        .layer(SetResponseHeaderLayer::overriding(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(
            TraceLayer::new_for_http().make_span_with(
                tower_http::trace::DefaultMakeSpan::new()
                    .level(tracing::Level::INFO)
                    .include_headers(false),
            ),
        )
}

/// Build CORS layer from config.
///
/// Defaults to denying all cross-origin requests if `cors_origins` is not
/// configured. Set `cors_origins = ["*"]` to allow all origins.
fn build_cors_layer(state: &AppState) -> CorsLayer {
    let origins = &state.hooknest.server_config().cors_origins;
    if origins.is_empty() {
        CorsLayer::new()
    } else if origins.iter().any(|o| o == "*") {
        CorsLayer::permissive()
    } else {
        let origins: Vec<_> = origins.iter().filter_map(|o| o.parse().ok()).collect();
        CorsLayer::new().allow_origin(origins)
    }
}

/// Run the API server with graceful shutdown support.
///
/// Drains in-flight connections on SIGINT or SIGTERM, then stops the
/// background tickers and persists the webhook registry, waiting at most
/// the configured shutdown timeout.
pub async fn serve(hooknest: Arc<Hooknest>, config_source: ConfigSource) -> anyhow::Result<()> {
    let server = hooknest.server_config().clone();
    hooknest.start_background(config_source);

    let state = Arc::new(AppState {
        hooknest: Arc::clone(&hooknest),
    });
    let app = build_router(state);

    let addr: SocketAddr = format!("{}:{}", server.host, server.port).parse()?;
    tracing::info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    let timeout = std::time::Duration::from_millis(server.shutdown_timeout_ms);
    if tokio::time::timeout(timeout, hooknest.shutdown()).await.is_err() {
        tracing::warn!("Shutdown exceeded {:?}; exiting anyway", timeout);
    }

    Ok(())
}

/// Wait for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, draining connections...");
}
