//! HTTP surface: signaling (`/offer`), recording control, and a liveness
//! probe. Thin glue over the core components — each handler either delegates
//! straight to a component method or does the minimal JSON shuffling to call
//! one.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::error::{AppError, Result};
use crate::signaling::{self, AnswerResponse, OfferRequest};
use crate::state::AppState;

pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = cors_layer(&state.config.cors_origin);

    Router::new()
        .route("/status", get(status))
        .route("/offer", post(offer))
        .route("/record/status", get(record_status))
        .route("/record/start", post(record_start))
        .route("/record/stop", post(record_stop))
        .route("/record/list", get(record_list))
        .route("/record/download/:filename", get(record_download))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

fn cors_layer(cors_origin: &str) -> CorsLayer {
    let allow_origin = if cors_origin == "*" {
        AllowOrigin::any()
    } else {
        match HeaderValue::from_str(cors_origin) {
            Ok(value) => AllowOrigin::exact(value),
            Err(_) => {
                tracing::warn!(cors_origin, "invalid cors_origin header value, falling back to *");
                AllowOrigin::any()
            }
        }
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE])
}

async fn status() -> &'static str {
    "OK"
}

async fn offer(
    State(state): State<Arc<AppState>>,
    Json(req): Json<OfferRequest>,
) -> Result<Json<AnswerResponse>> {
    let answer = signaling::handle_offer(
        req,
        state.registry.clone(),
        state.keyframe_cache.clone(),
        state.config.framerate,
    )
    .await?;
    Ok(Json(answer))
}

async fn record_status(State(state): State<Arc<AppState>>) -> Json<crate::recorder::RecordingStatus> {
    Json(state.recorder.status().await)
}

async fn record_start(
    State(state): State<Arc<AppState>>,
) -> Result<Json<crate::recorder::RecordingStatus>> {
    Ok(Json(state.recorder.start().await?))
}

async fn record_stop(
    State(state): State<Arc<AppState>>,
) -> Result<Json<crate::recorder::RecordingStatus>> {
    Ok(Json(state.recorder.stop().await?))
}

#[derive(Serialize)]
struct RecordingListResponse {
    recordings: Vec<crate::recorder::RecordingFile>,
}

async fn record_list(
    State(state): State<Arc<AppState>>,
) -> Result<Json<RecordingListResponse>> {
    let recordings = state.recorder.list().await?;
    Ok(Json(RecordingListResponse { recordings }))
}

async fn record_download(
    State(state): State<Arc<AppState>>,
    Path(filename): Path<String>,
) -> Result<Response> {
    let path = state.recorder.resolve_download_path(&filename)?;
    let bytes = tokio::fs::read(&path).await.map_err(AppError::Io)?;

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(header::CONTENT_LENGTH, bytes.len())
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{filename}\""),
        )
        .body(Body::from(bytes))
        .map_err(|e| AppError::SignalingFailed(format!("failed to build response: {e}")))?
        .into_response())
}
