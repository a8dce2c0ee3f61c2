use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;
use uuid::Uuid;

use super::{ApiError, ApiJson};
use crate::app_state::AppState;
use crate::models::submission::{SubmitRelease, SubmitReleaseResponse};
use crate::services::status::ReleaseStatusView;
use crate::services::storage::PNG_CONTENT_TYPE;

/// POST /api/v1/releases: submit a release for capture and comparison.
///
/// 201 for a new candidate, 200 when an identical submission is reused.
pub async fn submit_release(
    State(state): State<AppState>,
    ApiJson(body): ApiJson<SubmitRelease>,
) -> Result<(StatusCode, Json<SubmitReleaseResponse>), ApiError> {
    let response = state.releases.submit(body).await?;
    let status = if response.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(response)))
}

/// GET /api/v1/releases/{candidate_id}
pub async fn get_release(
    State(state): State<AppState>,
    Path(candidate_id): Path<Uuid>,
) -> Result<Json<ReleaseStatusView>, ApiError> {
    state
        .status
        .by_candidate_id(candidate_id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("release {}", candidate_id)))
}

/// GET /api/v1/poll/{polling_id}
pub async fn poll_release(
    State(state): State<AppState>,
    Path(polling_id): Path<Uuid>,
) -> Result<Json<ReleaseStatusView>, ApiError> {
    state
        .status
        .by_polling_id(polling_id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("polling id {}", polling_id)))
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub candidate_id: Uuid,
    pub cancelled_tasks: u32,
    pub already_cancelled: bool,
}

/// Header carrying the build API key on requests without a JSON body.
pub const API_KEY_HEADER: &str = "x-api-key";

/// POST /api/v1/releases/{candidate_id}/cancel
///
/// Requires the owning build's API key in `x-api-key`.
pub async fn cancel_release(
    State(state): State<AppState>,
    Path(candidate_id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Json<CancelResponse>, ApiError> {
    let api_key = headers
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::new(StatusCode::UNAUTHORIZED, "missing API key"))?;
    let outcome = state.releases.cancel(candidate_id, api_key).await?;
    Ok(Json(CancelResponse {
        candidate_id,
        cancelled_tasks: outcome.forced,
        already_cancelled: !outcome.newly_cancelled,
    }))
}

/// GET /api/v1/artifacts/{*key}: screenshot or diff image bytes.
pub async fn get_artifact(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    if !key.starts_with("releases/") || key.contains("..") {
        return Err(ApiError::not_found("artifact"));
    }
    let bytes = state
        .blobs
        .get(&key)
        .await
        .map_err(ApiError::internal)?
        .ok_or_else(|| ApiError::not_found("artifact"))?;

    Ok(([(header::CONTENT_TYPE, PNG_CONTENT_TYPE)], bytes))
}
