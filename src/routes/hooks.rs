//! Source-control push hook. A push to a branch submits the build's stored
//! push template as a release named `{branch}@{short sha}`.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;

use super::{ApiError, ApiJson};
use crate::app_state::AppState;
use crate::models::build::Build;
use crate::models::submission::{SubmitRelease, SubmitReleaseResponse};

#[derive(Debug, Clone, Deserialize)]
pub struct PushEvent {
    pub build: String,
    pub api_key: String,
    /// e.g. `refs/heads/main`
    #[serde(rename = "ref")]
    pub git_ref: String,
    /// Head commit after the push.
    pub after: String,
    #[serde(default)]
    pub callback_url: Option<String>,
}

pub fn release_name(event: &PushEvent) -> String {
    let branch = event
        .git_ref
        .strip_prefix("refs/heads/")
        .unwrap_or(&event.git_ref);
    let sha: String = event.after.chars().take(12).collect();
    format!("{}@{}", branch, sha)
}

/// Turn a push into a submission using the build's push template.
pub fn submission_for_push(event: PushEvent, build: &Build) -> Option<SubmitRelease> {
    if build.config.push_tests.is_empty() {
        return None;
    }
    Some(SubmitRelease {
        release: release_name(&event),
        build: event.build,
        api_key: event.api_key,
        setup_code: None,
        callback_url: event.callback_url,
        notify_email: None,
        tests: build.config.push_tests.clone(),
    })
}

/// POST /api/v1/hooks/push
pub async fn push_event(
    State(state): State<AppState>,
    ApiJson(event): ApiJson<PushEvent>,
) -> Result<(StatusCode, Json<SubmitReleaseResponse>), ApiError> {
    let build = state
        .store
        .get_build(&event.build)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("build `{}`", event.build)))?;

    let Some(submission) = submission_for_push(event, &build) else {
        return Err(ApiError::new(
            StatusCode::UNPROCESSABLE_ENTITY,
            "build has no push test template",
        ));
    };

    let response = state.releases.submit(submission).await?;
    let status = if response.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(response)))
}
