pub mod builds;
pub mod health;
pub mod hooks;
pub mod metrics;
pub mod releases;

use axum::extract::rejection::JsonRejection;
use axum::extract::{FromRequest, Request};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde_json::json;
use std::fmt::Display;

use crate::app_state::AppState;
use crate::services::releases::SubmitError;
use crate::services::tracker::TrackerError;
use crate::store::StoreError;

/// API routes. The Prometheus endpoint is mounted separately by the binary.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/api/v1/releases", post(releases::submit_release))
        .route("/api/v1/releases/{candidate_id}", get(releases::get_release))
        .route("/api/v1/releases/{candidate_id}/cancel", post(releases::cancel_release))
        .route("/api/v1/poll/{polling_id}", get(releases::poll_release))
        .route("/api/v1/artifacts/{*key}", get(releases::get_artifact))
        .route("/api/v1/builds/{name}", put(builds::upsert_build))
        .route("/api/v1/hooks/push", post(hooks::push_event))
        .with_state(state)
}

/// JSON error body: `{"error": ..., "details": ...}`.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            details: None,
        }
    }

    pub fn not_found(what: impl Display) -> Self {
        Self::new(StatusCode::NOT_FOUND, format!("{} not found", what))
    }

    pub fn internal(error: impl Display) -> Self {
        tracing::error!(error = %error, "Request failed");
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = match self.details {
            Some(details) => json!({ "error": self.message, "details": details }),
            None => json!({ "error": self.message }),
        };
        (self.status, Json(body)).into_response()
    }
}

/// `Json` whose rejections render as [`ApiError`] bodies.
pub struct ApiJson<T>(pub T);

impl<S, T> FromRequest<S> for ApiJson<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state).await?;
        Ok(Self(value))
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::new(rejection.status(), rejection.body_text())
    }
}

impl From<StoreError> for ApiError {
    fn from(error: StoreError) -> Self {
        ApiError::internal(error)
    }
}

impl From<SubmitError> for ApiError {
    fn from(error: SubmitError) -> Self {
        match error {
            SubmitError::Validation(e) => ApiError {
                status: StatusCode::UNPROCESSABLE_ENTITY,
                message: e.to_string(),
                details: serde_json::to_value(&e.violations).ok(),
            },
            SubmitError::UnknownBuild(name) => ApiError::not_found(format!("build `{}`", name)),
            SubmitError::Unauthorized => ApiError::new(StatusCode::UNAUTHORIZED, "API key not accepted"),
            SubmitError::UnknownRelease(id) => ApiError::not_found(format!("release {}", id)),
            SubmitError::Tracker(TrackerError::UnknownRelease(id)) => {
                ApiError::not_found(format!("release {}", id))
            }
            other => ApiError::internal(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::compiler::{ValidationError, Violation};
    use axum::body::{to_bytes, Body};
    use axum::http::header;
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    struct Named {
        #[allow(dead_code)]
        name: String,
    }

    async fn reject(request: Request) -> (StatusCode, serde_json::Value) {
        let rejection = match ApiJson::<Named>::from_request(request, &()).await {
            Ok(_) => panic!("body should have been rejected"),
            Err(e) => e,
        };
        let response = rejection.into_response();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    fn json_request(body: &'static str) -> Request {
        axum::http::Request::builder()
            .method("POST")
            .uri("/")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn test_malformed_json_renders_error_body() {
        let (status, body) = reject(json_request("{\"name\": ")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().is_some_and(|m| !m.is_empty()));

        let (status, body) = reject(json_request("{\"title\": \"x\"}")).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(body["error"].as_str().is_some_and(|m| m.contains("name")));
    }

    #[tokio::test]
    async fn test_missing_content_type_renders_error_body() {
        let request = axum::http::Request::builder()
            .method("POST")
            .uri("/")
            .body(Body::from("{\"name\": \"x\"}"))
            .unwrap();
        let (status, body) = reject(request).await;
        assert_eq!(status, StatusCode::UNSUPPORTED_MEDIA_TYPE);
        assert!(body["error"].is_string());
    }

    #[test]
    fn test_submit_errors_map_to_statuses() {
        let validation = ApiError::from(SubmitError::Validation(ValidationError {
            violations: vec![Violation {
                field: "tests".into(),
                message: "length is lower than 1".into(),
            }],
        }));
        assert_eq!(validation.status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(validation.details.unwrap()[0]["field"], "tests");

        assert_eq!(
            ApiError::from(SubmitError::UnknownBuild("site".into())).status,
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::from(SubmitError::Unauthorized).status,
            StatusCode::UNAUTHORIZED
        );
    }
}
