use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{ConnectInfo, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    middleware,
    response::{sse::KeepAlive, IntoResponse, Response, Sse},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::cors::CorsLayer;
use tracing::Instrument;

use crate::constants::KEEPALIVE_INTERVAL_SECS;
use crate::generator::StreamGenerator;
use crate::health;
use crate::logging;
use crate::main_helper::AppState;
use crate::types::ChatRequest;

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/chat", post(chat_handler))
        .route("/api/chat/recover", get(recover_handler))
        .route("/health", get(health::liveness))
        .route("/readyz", get(health::readiness))
        .layer(CorsLayer::permissive())
        .layer(middleware::from_fn(logging::request_id_middleware))
        .with_state(state)
}

#[tracing::instrument(name = "chat", skip_all, fields(response_id = tracing::field::Empty))]
async fn chat_handler(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(request): Json<ChatRequest>,
) -> Response {
    if let Err(e) = request.validate() {
        tracing::warn!("Rejected chat request: {}", e);
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": e.to_string(), "code": "VALIDATION_ERROR" })),
        )
            .into_response();
    }

    let decision = state.rate_limiter.check(&addr.ip().to_string()).await;
    let mut limit_headers = HeaderMap::new();
    let reset_epoch = chrono::Utc::now().timestamp() + decision.retry_after.as_secs() as i64;
    insert_header(&mut limit_headers, "X-RateLimit-Limit", decision.limit);
    insert_header(&mut limit_headers, "X-RateLimit-Remaining", decision.remaining);
    insert_header(&mut limit_headers, "X-RateLimit-Reset", reset_epoch);

    if !decision.allowed {
        let retry_after = decision.retry_after.as_secs().max(1);
        insert_header(&mut limit_headers, "Retry-After", retry_after);
        tracing::warn!("Rate limited {}", addr.ip());
        return (
            StatusCode::TOO_MANY_REQUESTS,
            limit_headers,
            Json(serde_json::json!({
                "error": "Too many requests",
                "retryAfter": retry_after,
            })),
        )
            .into_response();
    }

    let response_id = uuid::Uuid::new_v4().to_string();
    tracing::Span::current().record("response_id", response_id.as_str());
    tracing::info!(
        "Starting answer stream {} [history: {}]",
        response_id,
        request.history.len()
    );

    let (tx, rx) = mpsc::channel(100);
    let generator_state = state.clone();
    let rid = response_id.clone();
    let stream_span = tracing::info_span!("stream", response_id = %rid);
    tokio::spawn(
        async move {
            StreamGenerator::run(generator_state, request, rid, tx).await;
        }
        .instrument(stream_span),
    );

    let sse = Sse::new(ReceiverStream::new(rx)).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(KEEPALIVE_INTERVAL_SECS))
            .text("keepalive"),
    );

    (
        [(header::CACHE_CONTROL, "no-cache")],
        limit_headers,
        sse,
    )
        .into_response()
}

#[derive(Deserialize)]
struct RecoverParams {
    id: String,
}

async fn recover_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<RecoverParams>,
) -> Response {
    match state.cache.read(&params.id).await {
        Ok(Some(session)) => Json(serde_json::json!({
            "events": session.events,
            "complete": session.complete,
        }))
        .into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "Unknown response id" })),
        )
            .into_response(),
        Err(e) => {
            tracing::error!("Recover read failed for {}: {}", params.id, e);
            e.into_response()
        }
    }
}

fn insert_header(headers: &mut HeaderMap, name: &'static str, value: impl ToString) {
    if let Ok(v) = HeaderValue::from_str(&value.to_string()) {
        headers.insert(name, v);
    }
}
