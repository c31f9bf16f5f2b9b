use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;
use std::sync::Arc;

use crate::main_helper::AppState;

#[derive(Serialize)]
pub struct LivenessResponse {
    pub status: &'static str,
}

#[derive(Serialize)]
pub struct ReadinessResponse {
    pub status: String,
    pub database: String,
}

pub async fn liveness() -> Json<LivenessResponse> {
    Json(LivenessResponse { status: "ok" })
}

pub async fn readiness(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<ReadinessResponse>) {
    let mut db_ok = true;

    if let Err(e) = sqlx::query("SELECT 1").fetch_one(&state.db).await {
        tracing::error!("Readiness check: DB error: {}", e);
        db_ok = false;
    }

    let status_code = if db_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status_code,
        Json(ReadinessResponse {
            status: if db_ok { "ready" } else { "unready" }.to_string(),
            database: if db_ok { "ok" } else { "error" }.to_string(),
        }),
    )
}
