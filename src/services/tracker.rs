//! Completion barrier for a release.
//!
//! `register` fixes the number of expected tasks before any of them can run;
//! `report` records each task's terminal outcome exactly once. When the last
//! outstanding outcome lands, the release moves to Comparing, every pair is
//! resolved, and a single compare-and-set moves it to Done. Only the caller
//! that wins that transition sends the notification.

use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::models::release::ReleaseStatus;
use crate::models::task::{CaptureError, TaskId, TaskOutcome};
use crate::services::aggregator::{AggregatorError, ComparisonAggregator};
use crate::services::notifier::Notifier;
use crate::store::{RecordOutcome, RegisterOutcome, ReleaseStore, StoreError};

/// What a single `report` call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportOutcome {
    Recorded { reported: u32, expected: u32 },
    /// The task already had an outcome. Nothing changed.
    Duplicate { reported: u32, expected: u32 },
    /// This report was the last one and moved the release to Done.
    Completed { expected: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancelOutcome {
    /// Tasks force-finalized as cancelled by this call.
    pub forced: u32,
    /// False when the release had already been cancelled.
    pub newly_cancelled: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    #[error("invariant violated for release {candidate_id}: {detail}")]
    InvariantViolation { candidate_id: Uuid, detail: String },

    #[error("release {0} not found")]
    UnknownRelease(Uuid),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Aggregation(#[from] AggregatorError),
}

impl TrackerError {
    fn violation(candidate_id: Uuid, detail: impl Into<String>) -> Self {
        TrackerError::InvariantViolation {
            candidate_id,
            detail: detail.into(),
        }
    }
}

pub struct CompletionTracker {
    store: Arc<dyn ReleaseStore>,
    aggregator: Arc<ComparisonAggregator>,
    notifier: Arc<Notifier>,
}

impl CompletionTracker {
    pub fn new(
        store: Arc<dyn ReleaseStore>,
        aggregator: Arc<ComparisonAggregator>,
        notifier: Arc<Notifier>,
    ) -> Self {
        Self {
            store,
            aggregator,
            notifier,
        }
    }

    /// Fix the expected task count. Idempotent for the same count.
    pub async fn register(&self, candidate_id: Uuid, expected: u32) -> Result<(), TrackerError> {
        match self.store.register_ledger(candidate_id, expected).await? {
            RegisterOutcome::Created => {
                debug!(candidate_id = %candidate_id, expected, "Ledger registered");
                Ok(())
            }
            RegisterOutcome::AlreadyRegistered { expected: existing } if existing == expected => Ok(()),
            RegisterOutcome::AlreadyRegistered { expected: existing } => Err(TrackerError::violation(
                candidate_id,
                format!("re-registered with {} tasks, ledger expects {}", expected, existing),
            )),
        }
    }

    /// Record a task's terminal outcome.
    pub async fn report(
        &self,
        candidate_id: Uuid,
        task_id: &TaskId,
        outcome: TaskOutcome,
    ) -> Result<ReportOutcome, TrackerError> {
        let recorded = self.store.record_outcome(candidate_id, task_id, &outcome).await?;
        let (reported, expected) = match recorded {
            RecordOutcome::Recorded { reported, expected } => (reported, expected),
            RecordOutcome::Duplicate { reported, expected } => {
                debug!(candidate_id = %candidate_id, task_id = %task_id, "Duplicate report ignored");
                metrics::counter!("duplicate_reports_total").increment(1);
                // A full ledger on a release that is not Done means an earlier
                // completion attempt failed after its outcome was recorded.
                if reported == expected && self.complete(candidate_id).await? {
                    return Ok(ReportOutcome::Completed { expected });
                }
                return Ok(ReportOutcome::Duplicate { reported, expected });
            }
            RecordOutcome::NotRegistered => {
                return Err(TrackerError::violation(candidate_id, "report before register"));
            }
            RecordOutcome::UnknownTask => {
                return Err(TrackerError::violation(
                    candidate_id,
                    format!("task {} is not part of the release", task_id),
                ));
            }
            RecordOutcome::LedgerFull { expected } => {
                return Err(TrackerError::violation(
                    candidate_id,
                    format!("more than {} distinct outcomes reported", expected),
                ));
            }
        };

        let label = match &outcome {
            TaskOutcome::Captured { .. } => "captured",
            TaskOutcome::Failed { .. } => "failed",
        };
        metrics::counter!("tasks_reported_total", "outcome" => label).increment(1);
        debug!(candidate_id = %candidate_id, task_id = %task_id, reported, expected, "Outcome recorded");

        // A failed pairing here is retried by the sweep at completion.
        if let Err(e) = self.aggregator.on_task_finalized(candidate_id, task_id).await {
            warn!(candidate_id = %candidate_id, task_id = %task_id, error = %e, "Pair comparison deferred");
        }

        if reported == expected && self.complete(candidate_id).await? {
            return Ok(ReportOutcome::Completed { expected });
        }
        Ok(ReportOutcome::Recorded { reported, expected })
    }

    /// Finish a release whose ledger is full but never reached Done, e.g.
    /// after a crash between the last report and the final transition.
    pub async fn finalize_if_complete(&self, candidate_id: Uuid) -> Result<bool, TrackerError> {
        let Some(ledger) = self.store.ledger(candidate_id).await? else {
            return Ok(false);
        };
        if !ledger.is_complete() {
            return Ok(false);
        }
        self.complete(candidate_id).await
    }

    /// Finish every release left with a full ledger short of Done. Returns how
    /// many this call completed.
    pub async fn recover_stalled(&self) -> Result<u32, TrackerError> {
        let mut recovered = 0;
        for candidate_id in self.store.list_stalled().await? {
            match self.finalize_if_complete(candidate_id).await {
                Ok(true) => {
                    recovered += 1;
                    warn!(candidate_id = %candidate_id, "Recovered stalled release");
                }
                Ok(false) => {}
                Err(e) => {
                    error!(candidate_id = %candidate_id, error = %e, "Failed to finish stalled release")
                }
            }
        }
        Ok(recovered)
    }

    /// Stop a release. Tasks without an outcome are finalized as cancelled so
    /// the barrier still completes.
    pub async fn cancel(&self, candidate_id: Uuid) -> Result<CancelOutcome, TrackerError> {
        let release = self
            .store
            .get_release(candidate_id)
            .await?
            .ok_or(TrackerError::UnknownRelease(candidate_id))?;
        let newly_cancelled = self.store.mark_cancelled(candidate_id, Utc::now()).await?;

        let tasks = self.store.list_tasks(candidate_id).await?;
        let ledger = match self.store.ledger(candidate_id).await? {
            Some(ledger) => ledger,
            None => {
                self.register(candidate_id, tasks.len() as u32).await?;
                Default::default()
            }
        };

        let mut forced = 0;
        for task in tasks.iter().filter(|t| !ledger.outcomes.contains_key(&t.id)) {
            match self
                .report(candidate_id, &task.id, CaptureError::Cancelled.into())
                .await?
            {
                ReportOutcome::Duplicate { .. } => {}
                ReportOutcome::Recorded { .. } | ReportOutcome::Completed { .. } => forced += 1,
            }
        }

        if newly_cancelled {
            metrics::counter!("releases_cancelled_total").increment(1);
            info!(
                candidate_id = %candidate_id,
                build = %release.build_name,
                release = %release.release_name,
                forced,
                "Release cancelled"
            );
        }
        Ok(CancelOutcome {
            forced,
            newly_cancelled,
        })
    }

    /// Returns true only for the caller that moved the release to Done.
    async fn complete(&self, candidate_id: Uuid) -> Result<bool, TrackerError> {
        for from in [ReleaseStatus::Pending, ReleaseStatus::Capturing] {
            if self
                .store
                .transition_release(candidate_id, from, ReleaseStatus::Comparing)
                .await?
            {
                break;
            }
        }

        let release = self
            .store
            .get_release(candidate_id)
            .await?
            .ok_or(TrackerError::UnknownRelease(candidate_id))?;
        if release.status != ReleaseStatus::Comparing {
            return Ok(false);
        }

        let swept = self.aggregator.resolve_release(&release).await?;
        if swept > 0 {
            debug!(candidate_id = %candidate_id, swept, "Resolved remaining pairs at completion");
        }

        if !self
            .store
            .transition_release(candidate_id, ReleaseStatus::Comparing, ReleaseStatus::Done)
            .await?
        {
            return Ok(false);
        }

        let elapsed = (Utc::now() - release.created_at).num_milliseconds().max(0) as f64 / 1000.0;
        metrics::counter!("releases_completed_total").increment(1);
        metrics::histogram!("release_duration_seconds").record(elapsed);
        info!(
            candidate_id = %candidate_id,
            build = %release.build_name,
            release = %release.release_name,
            expected = release.expected_count,
            "Release done"
        );

        let done = self
            .store
            .get_release(candidate_id)
            .await?
            .unwrap_or(release);
        if let Err(e) = self.notifier.notify(&done).await {
            error!(candidate_id = %candidate_id, error = %e, "Failed to record notification");
        }
        Ok(true)
    }
}
