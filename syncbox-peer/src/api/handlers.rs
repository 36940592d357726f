//! HTTP request handlers

use crate::api::server::AppContext;
use crate::coordinator::PlaybackSession;
use crate::endpoint::EndpointStatus;
use crate::error::Error;
use axum::{extract::State, http::StatusCode, Json};
use serde::{Deserialize, Serialize};
use syncbox_common::{Locator, PeerId, RequestId};
use tracing::{error, info};

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub module: String,
    pub version: String,
    pub peer: PeerId,
    pub members: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: String,
}

#[derive(Debug, Deserialize)]
pub struct PlayRequest {
    pub locator: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PlayResponse {
    pub status: String,
    pub request_id: RequestId,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CachedEntry {
    pub label: String,
    pub locator: Locator,
}

#[derive(Debug, Serialize)]
pub struct CacheResponse {
    pub cached: Vec<CachedEntry>,
}

#[derive(Debug, Serialize)]
pub struct SessionsResponse {
    pub sessions: Vec<PlaybackSession>,
}

#[derive(Debug, Serialize)]
pub struct PeersResponse {
    pub local: PeerId,
    pub endpoints: Vec<EndpointStatus>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct VolumeRequest {
    /// 0-100 user-facing scale
    pub volume: u8,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct VolumeResponse {
    pub volume: u8,
}

type ApiError = (StatusCode, Json<StatusResponse>);

fn api_error(status: StatusCode, e: impl std::fmt::Display) -> ApiError {
    (
        status,
        Json(StatusResponse {
            status: format!("error: {}", e),
        }),
    )
}

fn to_user_volume(volume: f32) -> u8 {
    (volume * 100.0).round().clamp(0.0, 100.0) as u8
}

// ============================================================================
// Health Endpoint
// ============================================================================

/// GET /health - Health check endpoint
pub async fn health(State(ctx): State<AppContext>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        module: "syncbox_peer".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        peer: ctx.node.local_peer_id(),
        members: ctx.node.peer_count(),
    })
}

// ============================================================================
// Playback Endpoints
// ============================================================================

/// POST /playback/play - Request synchronized playback of a locator
pub async fn play(
    State(ctx): State<AppContext>,
    Json(req): Json<PlayRequest>,
) -> Result<(StatusCode, Json<PlayResponse>), ApiError> {
    match ctx.node.request_playback(&req.locator) {
        Ok(request_id) => {
            info!("Playback requested via API: {}", req.locator);
            Ok((
                StatusCode::ACCEPTED,
                Json(PlayResponse {
                    status: "requested".to_string(),
                    request_id,
                }),
            ))
        }
        Err(e @ Error::InvalidLocator(_)) => Err(api_error(StatusCode::BAD_REQUEST, e)),
        Err(e) => {
            error!("Failed to request playback: {}", e);
            Err(api_error(StatusCode::SERVICE_UNAVAILABLE, e))
        }
    }
}

/// POST /playback/stop - Stop this peer's playback on every node
pub async fn stop(State(ctx): State<AppContext>) -> Result<Json<StatusResponse>, ApiError> {
    match ctx.node.stop_playback() {
        Ok(()) => Ok(Json(StatusResponse {
            status: "ok".to_string(),
        })),
        Err(e) => {
            error!("Failed to stop playback: {}", e);
            Err(api_error(StatusCode::SERVICE_UNAVAILABLE, e))
        }
    }
}

// ============================================================================
// State Endpoints
// ============================================================================

/// GET /cache - Resources cached on this node, oldest first
pub async fn list_cache(State(ctx): State<AppContext>) -> Json<CacheResponse> {
    let cached = ctx
        .node
        .list_cached()
        .await
        .into_iter()
        .map(|(label, locator)| CachedEntry { label, locator })
        .collect();
    Json(CacheResponse { cached })
}

/// GET /sessions - Requests in flight on this node
pub async fn list_sessions(State(ctx): State<AppContext>) -> Json<SessionsResponse> {
    Json(SessionsResponse {
        sessions: ctx.node.active_sessions().await,
    })
}

/// GET /peers - Endpoints registered on this node
pub async fn list_peers(State(ctx): State<AppContext>) -> Json<PeersResponse> {
    Json(PeersResponse {
        local: ctx.node.local_peer_id(),
        endpoints: ctx.node.endpoints().await,
    })
}

// ============================================================================
// Volume Endpoints
// ============================================================================

/// GET /audio/volume - Local volume (0-100)
pub async fn get_volume(State(ctx): State<AppContext>) -> Json<VolumeResponse> {
    Json(VolumeResponse {
        volume: to_user_volume(ctx.node.volume().await),
    })
}

/// POST /audio/volume - Set local volume (0-100); never broadcast
pub async fn set_volume(
    State(ctx): State<AppContext>,
    Json(req): Json<VolumeRequest>,
) -> Result<Json<VolumeResponse>, ApiError> {
    if req.volume > 100 {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            format!("volume must be 0-100, got {}", req.volume),
        ));
    }

    let applied = ctx.node.set_volume(req.volume as f32 / 100.0).await;
    Ok(Json(VolumeResponse {
        volume: to_user_volume(applied),
    }))
}
