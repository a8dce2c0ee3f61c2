//! Deletes screenshot and diff blobs of releases past the retention window.
//! Pro builds are exempt. A release whose deletes partly fail stays unswept
//! and is retried on the next cycle.

use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::models::release::Release;
use crate::services::storage::BlobStore;
use crate::store::{ReleaseStore, StoreError};

#[derive(Debug, Clone)]
pub struct RetentionConfig {
    pub ttl: Duration,
    pub interval: Duration,
    /// Keep comparison rows (classification, scores) after their blobs are gone.
    pub retain_comparison_metadata: bool,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(3 * 24 * 60 * 60),
            interval: Duration::from_secs(60 * 60),
            retain_comparison_metadata: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub releases_swept: usize,
    pub releases_exempt: usize,
    pub releases_failed: usize,
    pub blobs_deleted: usize,
}

pub struct RetentionSweeper {
    store: Arc<dyn ReleaseStore>,
    blobs: Arc<dyn BlobStore>,
    config: RetentionConfig,
}

impl RetentionSweeper {
    pub fn new(store: Arc<dyn ReleaseStore>, blobs: Arc<dyn BlobStore>, config: RetentionConfig) -> Self {
        Self { store, blobs, config }
    }

    pub async fn sweep_once(&self, now: DateTime<Utc>) -> Result<SweepReport, StoreError> {
        let ttl = chrono::Duration::from_std(self.config.ttl).unwrap_or_else(|_| chrono::Duration::days(3));
        let mut report = SweepReport::default();

        for release in self.store.list_sweepable(now - ttl).await? {
            // The build's current plan decides, not the snapshot taken at submission.
            let pro = match self.store.get_build_by_id(release.build_id).await? {
                Some(build) => build.config.pro,
                None => release.config.pro,
            };
            if pro {
                report.releases_exempt += 1;
                continue;
            }

            match self.sweep_release(&release, now).await? {
                Some(deleted) => {
                    report.releases_swept += 1;
                    report.blobs_deleted += deleted;
                }
                None => report.releases_failed += 1,
            }
        }

        metrics::counter!("retention_blobs_deleted_total").increment(report.blobs_deleted as u64);
        if report.releases_swept > 0 || report.releases_failed > 0 {
            info!(
                swept = report.releases_swept,
                exempt = report.releases_exempt,
                failed = report.releases_failed,
                blobs = report.blobs_deleted,
                "Retention sweep finished"
            );
        }
        Ok(report)
    }

    /// `None` when any delete failed; the release is left for the next cycle.
    async fn sweep_release(&self, release: &Release, now: DateTime<Utc>) -> Result<Option<usize>, StoreError> {
        let id = release.candidate_id;
        let mut keys = BTreeSet::new();
        if let Some(ledger) = self.store.ledger(id).await? {
            keys.extend(ledger.outcomes.values().filter_map(|o| o.image()).map(|i| i.key.clone()));
        }
        for result in self.store.list_comparisons(id).await? {
            keys.extend(result.diff_key);
        }

        let mut failed = 0;
        for key in &keys {
            if let Err(e) = self.blobs.delete(key).await {
                warn!(candidate_id = %id, key = %key, error = %e, "Blob delete failed");
                failed += 1;
            }
        }
        if failed > 0 {
            return Ok(None);
        }

        self.store.mark_swept(id, now).await?;
        if !self.config.retain_comparison_metadata {
            self.store.delete_comparisons(id).await?;
        }
        debug!(candidate_id = %id, blobs = keys.len(), "Release swept");
        Ok(Some(keys.len()))
    }

    /// Sweep on a fixed interval until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep_once(Utc::now()).await {
                        error!(error = %e, "Retention sweep failed");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    }
}
