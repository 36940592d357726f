//! HTTP server setup and routing

use crate::error::{Error, Result};
use crate::node::PeerNode;
use axum::{
    routing::{get, post},
    Router,
};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

/// Shared application context passed to all handlers
#[derive(Clone)]
pub struct AppContext {
    pub node: Arc<PeerNode>,
}

/// Build the router with all routes
pub fn create_router(ctx: AppContext) -> Router {
    Router::new()
        // Health endpoint
        .route("/health", get(super::handlers::health))
        // Playback control
        .route("/playback/play", post(super::handlers::play))
        .route("/playback/stop", post(super::handlers::stop))
        // Local state
        .route("/cache", get(super::handlers::list_cache))
        .route("/sessions", get(super::handlers::list_sessions))
        .route("/peers", get(super::handlers::list_peers))
        .route(
            "/audio/volume",
            get(super::handlers::get_volume).post(super::handlers::set_volume),
        )
        // SSE event stream
        .route("/events", get(super::sse::event_stream))
        .with_state(ctx)
        // Enable CORS for local access
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Serve the API on `addr` until `shutdown` resolves
pub async fn serve<F>(ctx: AppContext, addr: SocketAddr, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = create_router(ctx);

    info!("Starting HTTP server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Http(format!("Failed to bind to {}: {}", addr, e)))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| Error::Http(format!("Server error: {}", e)))?;

    Ok(())
}
