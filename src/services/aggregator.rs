//! Pairs the A and B captures of each (test, size) and records a comparison
//! result once both sides are finalized.
//!
//! Results are insert-if-absent, so the per-task trigger and the final sweep
//! at completion can both run without producing two results for one pair.

use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::models::comparison::{Classification, ComparisonError, ComparisonResult};
use crate::models::release::Release;
use crate::models::task::{ImageRef, ScreenSize, TaskId, TaskOutcome, Variant};
use crate::services::comparator::{self, Screenshot};
use crate::services::storage::{image_key, BlobStore, StorageError, PNG_CONTENT_TYPE};
use crate::store::{LedgerSnapshot, ReleaseStore, StoreError};

pub struct ComparisonAggregator {
    store: Arc<dyn ReleaseStore>,
    blobs: Arc<dyn BlobStore>,
    tolerance: f64,
}

impl ComparisonAggregator {
    pub fn new(store: Arc<dyn ReleaseStore>, blobs: Arc<dyn BlobStore>, tolerance: f64) -> Self {
        Self {
            store,
            blobs,
            tolerance,
        }
    }

    /// Called after a task's outcome is recorded. Resolves its pair when the
    /// sibling has already been finalized.
    pub async fn on_task_finalized(
        &self,
        candidate_id: Uuid,
        task_id: &TaskId,
    ) -> Result<Option<ComparisonResult>, AggregatorError> {
        let release = self
            .store
            .get_release(candidate_id)
            .await?
            .ok_or(AggregatorError::UnknownRelease(candidate_id))?;
        let task = self
            .store
            .get_task(candidate_id, task_id)
            .await?
            .ok_or_else(|| AggregatorError::UnknownTask(task_id.clone()))?;
        let ledger = self.store.ledger(candidate_id).await?.unwrap_or_default();

        self.resolve_pair(&release, &ledger, &task.test_name, task.size)
            .await
    }

    /// Resolve every pair whose outcomes are both recorded. Returns how many
    /// new results were written.
    pub async fn resolve_release(&self, release: &Release) -> Result<usize, AggregatorError> {
        let ledger = self
            .store
            .ledger(release.candidate_id)
            .await?
            .unwrap_or_default();
        let existing: Vec<(String, ScreenSize)> = self
            .store
            .list_comparisons(release.candidate_id)
            .await?
            .into_iter()
            .map(|r| (r.test_name, r.size))
            .collect();

        let mut written = 0;
        for test in &release.tests {
            for &size in &test.sizes {
                if existing.iter().any(|(name, s)| name == &test.name && *s == size) {
                    continue;
                }
                if self
                    .resolve_pair(release, &ledger, &test.name, size)
                    .await?
                    .is_some()
                {
                    written += 1;
                }
            }
        }
        Ok(written)
    }

    async fn resolve_pair(
        &self,
        release: &Release,
        ledger: &LedgerSnapshot,
        test_name: &str,
        size: ScreenSize,
    ) -> Result<Option<ComparisonResult>, AggregatorError> {
        let outcome = |variant| {
            let id = TaskId::derive(
                &release.build_name,
                &release.release_name,
                test_name,
                variant,
                size,
            );
            ledger.outcomes.get(&id)
        };
        let (Some(a), Some(b)) = (outcome(Variant::A), outcome(Variant::B)) else {
            return Ok(None);
        };

        let mut result = ComparisonResult {
            candidate_id: release.candidate_id,
            test_name: test_name.to_string(),
            size,
            classification: Classification::Error(ComparisonError::CaptureFailed),
            image_a: a.image().cloned(),
            image_b: b.image().cloned(),
            diff: None,
            diff_key: None,
            created_at: Utc::now(),
        };

        if let (TaskOutcome::Captured { image: image_a }, TaskOutcome::Captured { image: image_b }) =
            (a, b)
        {
            let masks = release
                .test(test_name)
                .map(|test| release.mask_selectors(test))
                .unwrap_or_default();
            self.compare_images(release.candidate_id, image_a, image_b, &masks, &mut result)
                .await?;
        }

        let inserted = self.store.insert_comparison(&result).await?;
        if !inserted {
            return Ok(None);
        }

        metrics::counter!("comparisons_total", "classification" => result.classification.label())
            .increment(1);
        info!(
            candidate_id = %release.candidate_id,
            test = %test_name,
            size = %size,
            classification = result.classification.label(),
            "Comparison recorded"
        );
        Ok(Some(result))
    }

    async fn compare_images(
        &self,
        candidate_id: Uuid,
        image_a: &ImageRef,
        image_b: &ImageRef,
        masks: &[String],
        result: &mut ComparisonResult,
    ) -> Result<(), AggregatorError> {
        let started = std::time::Instant::now();
        let (bytes_a, bytes_b) = (self.fetch(image_a).await?, self.fetch(image_b).await?);
        let shots = match (decode(bytes_a, image_a), decode(bytes_b, image_b)) {
            (Err(reason), _) | (_, Err(reason)) => {
                result.classification = Classification::Error(reason);
                return Ok(());
            }
            (Ok(a), Ok(b)) => (a, b),
        };

        let comparison = comparator::compare(shots.0.as_ref(), shots.1.as_ref(), masks, self.tolerance);
        metrics::histogram!("comparison_duration_seconds").record(started.elapsed().as_secs_f64());

        result.classification = comparison.classification;
        result.diff = comparison.metadata;

        let Some(diff_image) = comparison.diff_image else {
            return Ok(());
        };
        let stored = match comparator::encode_png(&diff_image) {
            Ok(bytes) => {
                let (key, _) = image_key(candidate_id, &bytes);
                self.blobs
                    .put(&key, &bytes, PNG_CONTENT_TYPE)
                    .await
                    .map(|_| key)
                    .map_err(|e| e.to_string())
            }
            Err(e) => Err(e.to_string()),
        };
        match stored {
            Ok(key) => result.diff_key = Some(key),
            Err(error) => warn!(
                candidate_id = %candidate_id,
                test = %result.test_name,
                error = %error,
                "Failed to store diff image"
            ),
        }
        Ok(())
    }

    /// `None` only when the blob is gone. A failed read leaves the pair
    /// unresolved.
    async fn fetch(&self, image: &ImageRef) -> Result<Option<Vec<u8>>, AggregatorError> {
        self.blobs.get(&image.key).await.map_err(|e| {
            warn!(key = %image.key, error = %e, "Screenshot fetch failed");
            AggregatorError::Storage(e)
        })
    }
}

/// A missing blob decodes to `None`, which the comparator reports as a missing image.
fn decode(bytes: Option<Vec<u8>>, image: &ImageRef) -> Result<Option<Screenshot>, ComparisonError> {
    bytes
        .map(|bytes| Screenshot::decode(&bytes, image.regions.clone()))
        .transpose()
}

#[derive(Debug, thiserror::Error)]
pub enum AggregatorError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("blob read failed: {0}")]
    Storage(#[from] StorageError),

    #[error("release {0} not found")]
    UnknownRelease(Uuid),

    #[error("task {0} not found")]
    UnknownTask(TaskId),
}
