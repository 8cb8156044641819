// Health and readiness probes

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::readiness::Readiness;

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ReadinessResponse {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

pub fn routes(readiness: Arc<Readiness>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .with_state(readiness)
}

/// GET /health - liveness probe, succeeds whenever the process is up
#[utoipa::path(
    get,
    path = "/health",
    responses((status = 200, description = "Service is up", body = HealthResponse)),
    tag = "system"
)]
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        service: "agentsight-ingress".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// GET /ready - readiness probe, checks dependency freshness
#[utoipa::path(
    get,
    path = "/ready",
    responses(
        (status = 200, description = "Dependencies recently healthy", body = ReadinessResponse),
        (status = 503, description = "A dependency is stale", body = ReadinessResponse)
    ),
    tag = "system"
)]
pub async fn ready(State(readiness): State<Arc<Readiness>>) -> Response {
    match readiness.stale_dependency() {
        None => Json(ReadinessResponse {
            ready: true,
            detail: None,
        })
        .into_response(),
        Some(dependency) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ReadinessResponse {
                ready: false,
                detail: Some(format!("no successful {dependency} operation in 30s")),
            }),
        )
            .into_response(),
    }
}
