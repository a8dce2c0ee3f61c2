use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::models::comparison::{Classification, ComparisonResult};
use crate::models::notification::NotificationEvent;
use crate::models::release::{Release, ReleaseStatus};
use crate::models::task::ScreenSize;
use crate::store::{ReleaseStore, StoreError};

/// What a polling client sees for one release.
#[derive(Debug, Clone, Serialize)]
pub struct ReleaseStatusView {
    pub candidate_id: Uuid,
    pub build: String,
    pub release: String,
    pub release_number: i32,
    pub status: ReleaseStatus,
    pub cancelled: bool,
    pub expected_count: u32,
    pub reported_count: u32,
    pub same: usize,
    pub different: usize,
    pub errors: usize,
    pub pending: usize,
    pub tests: Vec<TestStatusView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notification: Option<NotificationEvent>,
    pub created_at: DateTime<Utc>,
    pub swept: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct TestStatusView {
    pub name: String,
    pub size: ScreenSize,
    /// "pending" until both variants are finalized, "expired" once a swept
    /// release has dropped its result.
    pub state: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub classification: Option<Classification>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_a: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_b: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diff: Option<String>,
}

impl TestStatusView {
    fn unresolved(name: &str, size: ScreenSize, state: &'static str) -> Self {
        Self {
            name: name.to_string(),
            size,
            state,
            classification: None,
            score: None,
            image_a: None,
            image_b: None,
            diff: None,
        }
    }

    fn resolved(result: &ComparisonResult) -> Self {
        Self {
            name: result.test_name.clone(),
            size: result.size,
            state: result.classification.label(),
            classification: Some(result.classification),
            score: result.diff.as_ref().map(|d| d.score),
            image_a: result.image_a.as_ref().map(|i| i.key.clone()),
            image_b: result.image_b.as_ref().map(|i| i.key.clone()),
            diff: result.diff_key.clone(),
        }
    }
}

pub struct StatusService {
    store: Arc<dyn ReleaseStore>,
}

impl StatusService {
    pub fn new(store: Arc<dyn ReleaseStore>) -> Self {
        Self { store }
    }

    pub async fn by_candidate_id(&self, candidate_id: Uuid) -> Result<Option<ReleaseStatusView>, StoreError> {
        let Some(release) = self.store.get_release(candidate_id).await? else {
            return Ok(None);
        };
        let results = self.store.list_comparisons(candidate_id).await?;
        let notification = if release.is_done() {
            self.store.get_notification(candidate_id).await?
        } else {
            None
        };
        Ok(Some(build_view(&release, &results, notification)))
    }

    pub async fn by_polling_id(&self, polling_id: Uuid) -> Result<Option<ReleaseStatusView>, StoreError> {
        match self.store.resolve_polling_id(polling_id).await? {
            Some(candidate_id) => self.by_candidate_id(candidate_id).await,
            None => Ok(None),
        }
    }
}

fn build_view(
    release: &Release,
    results: &[ComparisonResult],
    notification: Option<NotificationEvent>,
) -> ReleaseStatusView {
    let unresolved = if release.swept_at.is_some() {
        "expired"
    } else {
        "pending"
    };
    let mut tests = Vec::new();
    for test in &release.tests {
        for &size in &test.sizes {
            let view = results
                .iter()
                .find(|r| r.test_name == test.name && r.size == size)
                .map(TestStatusView::resolved)
                .unwrap_or_else(|| TestStatusView::unresolved(&test.name, size, unresolved));
            tests.push(view);
        }
    }

    let count = |state: &str| tests.iter().filter(|t| t.state == state).count();
    ReleaseStatusView {
        candidate_id: release.candidate_id,
        build: release.build_name.clone(),
        release: release.release_name.clone(),
        release_number: release.release_number,
        status: release.status,
        cancelled: release.is_cancelled(),
        expected_count: release.expected_count,
        reported_count: release.reported_count,
        same: count("same"),
        different: count("different"),
        errors: count("error"),
        pending: count("pending"),
        notification,
        created_at: release.created_at,
        swept: release.swept_at.is_some(),
        tests,
    }
}
