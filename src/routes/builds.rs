use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use chrono::Utc;
use garde::Validate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{ApiError, ApiJson};
use crate::app_state::AppState;
use crate::models::build::{hash_api_key, Build, BuildConfig};

pub const ADMIN_TOKEN_HEADER: &str = "x-admin-token";

#[derive(Debug, Deserialize, Validate)]
pub struct UpsertBuild {
    #[garde(length(min = 1, max = 200))]
    pub account: String,

    #[garde(length(min = 16, max = 256))]
    pub api_key: String,

    #[garde(skip)]
    #[serde(default)]
    pub config: BuildConfig,
}

#[derive(Debug, Serialize)]
pub struct BuildResponse {
    pub id: Uuid,
    pub name: String,
    pub account: String,
    pub config: BuildConfig,
}

/// PUT /api/v1/builds/{name}: create or replace a build (operator only).
pub async fn upsert_build(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
    ApiJson(body): ApiJson<UpsertBuild>,
) -> Result<(StatusCode, Json<BuildResponse>), ApiError> {
    let Some(expected) = state.admin_token.as_deref() else {
        return Err(ApiError::new(StatusCode::FORBIDDEN, "build administration is disabled"));
    };
    let presented = headers
        .get(ADMIN_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok());
    if presented != Some(expected) {
        return Err(ApiError::new(StatusCode::UNAUTHORIZED, "invalid admin token"));
    }

    if let Err(report) = body.validate() {
        return Err(ApiError::new(StatusCode::UNPROCESSABLE_ENTITY, report.to_string()));
    }

    let existing = state.store.get_build(&name).await?;
    let now = Utc::now();
    let build = match &existing {
        Some(current) => Build {
            account: body.account,
            api_key_hash: hash_api_key(&body.api_key),
            config: body.config,
            updated_at: now,
            ..current.clone()
        },
        None => Build::new(&name, &body.account, &body.api_key, body.config),
    };
    state.store.put_build(&build).await?;

    tracing::info!(build = %build.name, created = existing.is_none(), "Build saved");
    let status = if existing.is_some() {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((
        status,
        Json(BuildResponse {
            id: build.id,
            name: build.name,
            account: build.account,
            config: build.config,
        }),
    ))
}
