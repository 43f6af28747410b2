pub mod handlers;
pub mod state;

use crate::{config::Config, error::Result, metrics};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    http::{HeaderName, HeaderValue},
    middleware::map_response,
    response::Response,
    routing::get,
};
use state::AppState;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// Reserved paths; everything else is proxied
pub const HEALTH_PATH: &str = "/_postcache/health";
pub const METRICS_PATH: &str = "/_postcache/metrics";

const VERSION_HEADER: HeaderName = HeaderName::from_static("x-postcache-version");

async fn add_version_header(mut response: Response) -> Response {
    response.headers_mut().insert(
        VERSION_HEADER,
        HeaderValue::from_static(env!("CARGO_PKG_VERSION")),
    );
    response
}

/// Assemble the router around an existing state.
///
/// Request bodies are forwarded whole, whatever their size.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route(HEALTH_PATH, get(handlers::health::health_check))
        .route(METRICS_PATH, get(handlers::health::metrics))
        .fallback(handlers::proxy::proxy)
        .layer(DefaultBodyLimit::disable())
        .layer(map_response(add_version_header))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Build the full router for `config` without installing a metrics recorder.
///
/// Connects to the configured cache store, so this fails when Valkey is
/// selected but unreachable.
pub async fn build_router(config: Config) -> Result<Router> {
    let state = AppState::new(config, None).await?;
    Ok(router(state))
}

/// Start the Axum HTTP server and run until Ctrl-C
pub async fn start(config: Config) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let addr = format!("0.0.0.0:{}", config.port);

    let prometheus = metrics::install_recorder()?;
    let state = AppState::new(config, Some(prometheus)).await?;
    let coordinator = state.coordinator.clone();
    let app = router(state);

    // Bind TCP listener
    let listener = match tokio::net::TcpListener::bind(addr.as_str()).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind to address {}: {}", addr, e);
            return Err(e.into());
        }
    };

    info!("Proxy listening on http://{}", addr);

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!("Server error: {}", e);
        return Err(e.into());
    }

    // In-flight refreshes hold leases; let them finish and release
    coordinator.shutdown().await;
    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        // Without a signal handler, run until killed
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
