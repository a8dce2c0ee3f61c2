//! Release intake: validate, compile, persist, register the completion
//! barrier, then enqueue every capture task.
//!
//! Registration always happens before the first task is enqueued, so no
//! outcome can be reported against an unregistered release.

use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::models::release::{Release, ReleaseStatus};
use crate::models::task::CaptureTask;
use crate::models::submission::{SubmitRelease, SubmitReleaseResponse};
use crate::services::compiler::{self, ValidationError};
use crate::services::notifier::results_url;
use crate::services::queue::{QueueError, QueuedTask, TaskQueue};
use crate::services::tracker::{CancelOutcome, CompletionTracker, TrackerError};
use crate::store::{ReleaseStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("unknown build: {0}")]
    UnknownBuild(String),

    #[error("API key not accepted for build")]
    Unauthorized,

    #[error("release {0} not found")]
    UnknownRelease(Uuid),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Tracker(#[from] TrackerError),
}

pub struct ReleaseService {
    store: Arc<dyn ReleaseStore>,
    queue: Arc<dyn TaskQueue>,
    tracker: Arc<CompletionTracker>,
    public_base_url: String,
}

impl ReleaseService {
    pub fn new(
        store: Arc<dyn ReleaseStore>,
        queue: Arc<dyn TaskQueue>,
        tracker: Arc<CompletionTracker>,
        public_base_url: String,
    ) -> Self {
        Self {
            store,
            queue,
            tracker,
            public_base_url,
        }
    }

    /// Submit a release.
    ///
    /// An identical resubmission (same compiled task set) of a live candidate
    /// returns that candidate under a fresh polling id. A changed submission
    /// cancels the previous in-flight candidate and starts a new one with the
    /// next release number.
    pub async fn submit(&self, submission: SubmitRelease) -> Result<SubmitReleaseResponse, SubmitError> {
        let build = self.store.get_build(&submission.build).await?;
        let config = build.as_ref().map(|b| b.config.clone()).unwrap_or_default();
        let compiled = compiler::compile(&submission, &config)?;

        let build = build.ok_or_else(|| SubmitError::UnknownBuild(submission.build.clone()))?;
        if !build.accepts_key(&submission.api_key) {
            return Err(SubmitError::Unauthorized);
        }

        let digest = compiled.digest();
        let previous = self.store.latest_release(build.id, &submission.release).await?;

        if let Some(prev) = previous.as_ref().filter(|p| p.spec_digest == digest && !p.is_cancelled()) {
            if prev.status == ReleaseStatus::Pending {
                self.resume(prev).await?;
            }
            let polling_id = Uuid::new_v4();
            self.store.record_submission(polling_id, prev.candidate_id).await?;
            metrics::counter!("release_submissions_total", "kind" => "reused").increment(1);
            info!(
                candidate_id = %prev.candidate_id,
                build = %build.name,
                release = %submission.release,
                "Identical resubmission; reusing candidate"
            );
            return Ok(self.response(polling_id, prev.candidate_id, false));
        }

        if let Some(prev) = previous.as_ref().filter(|p| !p.is_done() && !p.is_cancelled()) {
            self.tracker.cancel(prev.candidate_id).await?;
            info!(
                candidate_id = %prev.candidate_id,
                build = %build.name,
                release = %submission.release,
                "Superseded in-flight candidate"
            );
        }

        let candidate_id = Uuid::new_v4();
        let release = Release {
            candidate_id,
            build_id: build.id,
            build_name: build.name.clone(),
            release_name: submission.release.clone(),
            release_number: previous.as_ref().map_or(1, |p| p.release_number + 1),
            config: build.config.clone(),
            tests: compiled.tests.clone(),
            expected_count: compiled.expected_count(),
            reported_count: 0,
            status: ReleaseStatus::Pending,
            spec_digest: digest,
            callback_url: submission.callback_url.clone(),
            notify_email: submission.notify_email.clone(),
            created_at: Utc::now(),
            cancelled_at: None,
            swept_at: None,
        };
        let tasks = compiled.tasks_for(candidate_id);

        self.store.insert_release(&release, &tasks).await?;
        self.tracker.register(candidate_id, release.expected_count).await?;
        self.enqueue_all(candidate_id, &tasks).await?;

        let polling_id = Uuid::new_v4();
        self.store.record_submission(polling_id, candidate_id).await?;

        metrics::counter!("release_submissions_total", "kind" => "created").increment(1);
        metrics::counter!("capture_tasks_enqueued_total").increment(tasks.len() as u64);
        info!(
            candidate_id = %candidate_id,
            build = %build.name,
            release = %release.release_name,
            release_number = release.release_number,
            tasks = tasks.len(),
            "Release accepted"
        );
        Ok(self.response(polling_id, candidate_id, true))
    }

    /// Cancel a release on behalf of the holder of its build's API key.
    pub async fn cancel(&self, candidate_id: Uuid, api_key: &str) -> Result<CancelOutcome, SubmitError> {
        let release = self
            .store
            .get_release(candidate_id)
            .await?
            .ok_or(SubmitError::UnknownRelease(candidate_id))?;
        let build = self.store.get_build_by_id(release.build_id).await?;
        if !build.is_some_and(|b| b.accepts_key(api_key)) {
            return Err(SubmitError::Unauthorized);
        }
        Ok(self.tracker.cancel(candidate_id).await?)
    }

    /// Enqueue tasks, then move the release out of Pending. A release left in
    /// Pending did not get all of its tasks onto the queue.
    async fn enqueue_all(&self, candidate_id: Uuid, tasks: &[CaptureTask]) -> Result<(), SubmitError> {
        let now = Utc::now();
        for task in tasks {
            let queued = QueuedTask {
                candidate_id,
                task_id: task.id.clone(),
                attempts: 0,
            };
            self.queue.enqueue(&queued, now).await?;
        }
        self.store
            .transition_release(candidate_id, ReleaseStatus::Pending, ReleaseStatus::Capturing)
            .await?;
        Ok(())
    }

    /// Finish an intake that failed part-way. Tasks without an outcome are
    /// enqueued again; a copy that is already queued is skipped once its
    /// first delivery finalizes it.
    async fn resume(&self, release: &Release) -> Result<(), SubmitError> {
        self.tracker
            .register(release.candidate_id, release.expected_count)
            .await?;
        let reported = self
            .store
            .ledger(release.candidate_id)
            .await?
            .map(|ledger| ledger.outcomes)
            .unwrap_or_default();
        let remaining: Vec<CaptureTask> = self
            .store
            .list_tasks(release.candidate_id)
            .await?
            .into_iter()
            .filter(|task| !reported.contains_key(&task.id))
            .collect();
        self.enqueue_all(release.candidate_id, &remaining).await?;
        warn!(
            candidate_id = %release.candidate_id,
            requeued = remaining.len(),
            "Resumed incomplete intake"
        );
        Ok(())
    }

    fn response(&self, polling_id: Uuid, candidate_id: Uuid, created: bool) -> SubmitReleaseResponse {
        SubmitReleaseResponse {
            polling_id,
            candidate_id,
            results_url: results_url(&self.public_base_url, candidate_id),
            created,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::build::{Build, BuildConfig};
    use crate::models::submission::TestSpec;
    use crate::services::aggregator::ComparisonAggregator;
    use crate::services::notifier::{CallbackSender, Mailer, Notifier, NotifierConfig, ReleaseSummary, TransportError};
    use crate::services::queue::MemoryTaskQueue;
    use crate::services::storage::MemoryBlobStore;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use std::collections::BTreeMap;

    struct Silent;

    #[async_trait]
    impl CallbackSender for Silent {
        async fn post(&self, _url: &str, _summary: &ReleaseSummary) -> Result<(), TransportError> {
            Ok(())
        }
    }

    #[async_trait]
    impl Mailer for Silent {
        async fn send(&self, _to: &str, _subject: &str, _body: &str) -> Result<(), TransportError> {
            Ok(())
        }
    }

    async fn service() -> (ReleaseService, Arc<MemoryStore>, Arc<MemoryTaskQueue>) {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryTaskQueue::new());
        let blobs = Arc::new(MemoryBlobStore::new());
        let aggregator = Arc::new(ComparisonAggregator::new(store.clone(), blobs, 0.0));
        let notifier = Arc::new(Notifier::new(
            store.clone(),
            Arc::new(Silent),
            Arc::new(Silent),
            NotifierConfig::default(),
        ));
        let tracker = Arc::new(CompletionTracker::new(store.clone(), aggregator, notifier));
        store
            .put_build(&Build::new("site", "acme", "key", BuildConfig::default()))
            .await
            .unwrap();
        let service = ReleaseService::new(
            store.clone(),
            queue.clone(),
            tracker,
            "https://diff.example.com".into(),
        );
        (service, store, queue)
    }

    fn submission(url: &str) -> SubmitRelease {
        SubmitRelease {
            build: "site".into(),
            release: "r1".into(),
            api_key: "key".into(),
            setup_code: None,
            callback_url: None,
            notify_email: None,
            tests: vec![TestSpec {
                name: "home".into(),
                url: url.into(),
                host_a: "https://prod.example.com".into(),
                host_b: "https://staging.example.com".into(),
                setup_code: None,
                auth: None,
                headers: BTreeMap::new(),
                mask_selectors: vec![],
                sizes: vec![],
                user_agent: None,
            }],
        }
    }

    #[tokio::test]
    async fn test_submit_registers_then_enqueues() {
        let (service, store, queue) = service().await;
        let response = service.submit(submission("/")).await.unwrap();

        assert!(response.created);
        assert_eq!(
            response.results_url,
            format!("https://diff.example.com/api/v1/releases/{}", response.candidate_id)
        );
        let release = store.get_release(response.candidate_id).await.unwrap().unwrap();
        assert_eq!(release.status, ReleaseStatus::Capturing);
        assert_eq!(release.expected_count, 2);
        assert_eq!(store.ledger(response.candidate_id).await.unwrap().unwrap().expected, 2);
        assert_eq!(queue.depth().await.unwrap(), 2);
        assert_eq!(
            store.resolve_polling_id(response.polling_id).await.unwrap(),
            Some(response.candidate_id)
        );
    }

    #[tokio::test]
    async fn test_identical_resubmission_reuses_candidate() {
        let (service, _store, queue) = service().await;
        let first = service.submit(submission("/")).await.unwrap();
        let second = service.submit(submission("/")).await.unwrap();

        assert!(!second.created);
        assert_eq!(first.candidate_id, second.candidate_id);
        assert_ne!(first.polling_id, second.polling_id);
        assert_eq!(queue.depth().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_changed_submission_supersedes_in_flight_candidate() {
        let (service, store, _queue) = service().await;
        let first = service.submit(submission("/")).await.unwrap();
        let second = service.submit(submission("/pricing")).await.unwrap();

        assert!(second.created);
        assert_ne!(first.candidate_id, second.candidate_id);

        let old = store.get_release(first.candidate_id).await.unwrap().unwrap();
        assert!(old.is_cancelled());
        assert_eq!(old.status, ReleaseStatus::Done);
        let new = store.get_release(second.candidate_id).await.unwrap().unwrap();
        assert_eq!(new.release_number, old.release_number + 1);
    }

    #[tokio::test]
    async fn test_rejects_unknown_build_and_bad_key() {
        let (service, _store, _queue) = service().await;

        let mut unknown = submission("/");
        unknown.build = "other".into();
        assert!(matches!(
            service.submit(unknown).await,
            Err(SubmitError::UnknownBuild(_))
        ));

        let mut bad_key = submission("/");
        bad_key.api_key = "wrong".into();
        assert!(matches!(service.submit(bad_key).await, Err(SubmitError::Unauthorized)));
    }

    #[tokio::test]
    async fn test_validation_errors_win_over_lookup() {
        let (service, _store, _queue) = service().await;
        let mut invalid = submission("/");
        invalid.build = "other".into();
        invalid.tests.clear();
        assert!(matches!(
            service.submit(invalid).await,
            Err(SubmitError::Validation(_))
        ));
    }
}
