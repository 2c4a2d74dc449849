//! HTTP handlers for liveness and capacity endpoints.

use axum::{Json, extract::State};
use tracing::error;

use crate::{AppState, api::models::system::DiscoverResponse};

/// Banner returned at the root path.
pub const BANNER: &str = "CFSharedFS Agent";

#[utoipa::path(
    get,
    path = "/",
    tag = "system",
    summary = "Banner",
    responses(
        (status = 200, description = "Agent banner", body = String),
    )
)]
pub async fn root() -> &'static str {
    BANNER
}

#[utoipa::path(
    get,
    path = "/healthz",
    tag = "system",
    summary = "Health check",
    responses(
        (status = 200, description = "Agent is serving", body = String),
    )
)]
pub async fn healthz() -> &'static str {
    "OK"
}

#[utoipa::path(
    get,
    path = "/discover",
    tag = "system",
    summary = "Discover capacity",
    description = "Report free bytes on the volume holding the service homes",
    responses(
        (status = 200, description = "Capacity, or the reason it could not be measured", body = DiscoverResponse),
    )
)]
#[tracing::instrument(skip_all)]
pub async fn discover(State(state): State<AppState>) -> Json<DiscoverResponse> {
    let name = state.config.agent_name.clone();
    match state.provisioner.disk_free().await {
        Ok(bytes) => Json(DiscoverResponse {
            name,
            success: true,
            disk_free: Some(bytes),
            msg: None,
        }),
        Err(e) => {
            error!(error = %e, "disk free probe failed");
            Json(DiscoverResponse {
                name,
                success: false,
                disk_free: None,
                msg: Some(e.to_string()),
            })
        }
    }
}
