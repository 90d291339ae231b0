use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::Serialize;
use tracing::error;

use super::app_state::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub channels: usize,
}

/// GET /api/channels: names of channels that currently have members.
pub async fn get_channels(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.hub.list_channels().await {
        Ok(channels) => Json(channels).into_response(),
        Err(e) => {
            error!(error = %e, "Failed to list channels");
            (StatusCode::SERVICE_UNAVAILABLE, "Hub unavailable").into_response()
        }
    }
}

/// GET /api/channels/{name}/members: display names of a channel's members.
pub async fn get_channel_members(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    match state.hub.list_members(&name).await {
        Ok(Some(members)) => Json(members).into_response(),
        Ok(None) => (StatusCode::NOT_FOUND, "Channel not found").into_response(),
        Err(e) => {
            error!(error = %e, channel = %name, "Failed to list members");
            (StatusCode::SERVICE_UNAVAILABLE, "Hub unavailable").into_response()
        }
    }
}

/// GET /api/health
pub async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.hub.list_channels().await {
        Ok(channels) => Json(HealthResponse {
            status: "ok",
            channels: channels.len(),
        })
        .into_response(),
        Err(_) => (StatusCode::SERVICE_UNAVAILABLE, "Hub unavailable").into_response(),
    }
}
