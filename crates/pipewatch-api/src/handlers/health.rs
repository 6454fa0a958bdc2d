use axum::Json;

use crate::types::HealthResponse;

pub async fn health_live() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}
