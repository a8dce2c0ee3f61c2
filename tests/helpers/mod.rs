//! In-process collaborators and a memory-backed pipeline for integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use image::{Rgba, RgbaImage};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use shotdiff::models::build::Build;
use shotdiff::models::comparison::ComparisonResult;
use shotdiff::models::notification::NotificationEvent;
use shotdiff::models::release::{Release, ReleaseStatus};
use shotdiff::models::task::{CaptureRequest, CaptureTask, TaskId, TaskOutcome, TaskStatus};
use shotdiff::pipeline::{Collaborators, Pipeline, PipelineSettings};
use shotdiff::services::capture::{CaptureClient, CaptureFailure, CaptureResponse};
use shotdiff::services::comparator::encode_png;
use shotdiff::services::dispatcher::DispatcherConfig;
use shotdiff::services::notifier::{
    CallbackSender, Mailer, NotifierConfig, OutcomePolicy, ReleaseSummary, TransportError,
};
use shotdiff::services::queue::{MemoryTaskQueue, QueueError, QueuedTask, TaskQueue};
use shotdiff::services::storage::{BlobStore, MemoryBlobStore, StorageError};
use shotdiff::services::sweeper::RetentionConfig;
use shotdiff::store::{
    LedgerSnapshot, MemoryStore, RecordOutcome, RegisterOutcome, ReleaseStore, StoreError,
};

pub const WHITE: [u8; 4] = [255, 255, 255, 255];
pub const RED: [u8; 4] = [255, 0, 0, 255];

pub fn solid_png(color: [u8; 4]) -> Vec<u8> {
    encode_png(&RgbaImage::from_pixel(8, 8, Rgba(color))).expect("encode png")
}

#[derive(Debug, Clone, Copy)]
pub enum Page {
    Solid([u8; 4]),
    Status(u16),
}

/// Renders pages by full URL. Unscripted URLs come back plain white.
#[derive(Default)]
pub struct PageCapture {
    pages: Mutex<HashMap<String, Page>>,
    calls: Mutex<HashMap<String, u32>>,
}

impl PageCapture {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, url: impl Into<String>, page: Page) {
        self.pages.lock().insert(url.into(), page);
    }

    pub fn calls(&self, url: &str) -> u32 {
        self.calls.lock().get(url).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> u32 {
        self.calls.lock().values().sum()
    }
}

#[async_trait]
impl CaptureClient for PageCapture {
    async fn capture(&self, request: &CaptureRequest) -> Result<CaptureResponse, CaptureFailure> {
        *self.calls.lock().entry(request.url.clone()).or_default() += 1;
        let page = self
            .pages
            .lock()
            .get(&request.url)
            .copied()
            .unwrap_or(Page::Solid(WHITE));
        match page {
            Page::Solid(color) => Ok(CaptureResponse {
                image: solid_png(color),
                regions: BTreeMap::new(),
            }),
            Page::Status(status) => Err(CaptureFailure::Status {
                status,
                body: "scripted failure".into(),
            }),
        }
    }
}

#[derive(Default)]
pub struct RecordingCallbacks {
    pub posted: Mutex<Vec<(String, ReleaseSummary)>>,
}

#[async_trait]
impl CallbackSender for RecordingCallbacks {
    async fn post(&self, url: &str, summary: &ReleaseSummary) -> Result<(), TransportError> {
        self.posted.lock().push((url.to_string(), summary.clone()));
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingMailer {
    pub sent: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn send(&self, to: &str, subject: &str, _body: &str) -> Result<(), TransportError> {
        self.sent.lock().push((to.to_string(), subject.to_string()));
        Ok(())
    }
}

/// Counts down injected failures; `take` is true while any remain.
#[derive(Default)]
pub struct Failures(AtomicU32);

impl Failures {
    pub fn arm(&self, count: u32) {
        self.0.store(count, Ordering::SeqCst);
    }

    fn take(&self) -> bool {
        self.0
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// Memory store whose Comparing -> Done transition can be made to fail.
pub struct FlakyStore {
    pub inner: Arc<MemoryStore>,
    pub done_transitions: Failures,
}

#[async_trait]
impl ReleaseStore for FlakyStore {
    async fn health_check(&self) -> Result<(), StoreError> {
        self.inner.health_check().await
    }

    async fn put_build(&self, build: &Build) -> Result<(), StoreError> {
        self.inner.put_build(build).await
    }

    async fn get_build(&self, name: &str) -> Result<Option<Build>, StoreError> {
        self.inner.get_build(name).await
    }

    async fn get_build_by_id(&self, id: Uuid) -> Result<Option<Build>, StoreError> {
        self.inner.get_build_by_id(id).await
    }

    async fn insert_release(&self, release: &Release, tasks: &[CaptureTask]) -> Result<(), StoreError> {
        self.inner.insert_release(release, tasks).await
    }

    async fn get_release(&self, candidate_id: Uuid) -> Result<Option<Release>, StoreError> {
        self.inner.get_release(candidate_id).await
    }

    async fn latest_release(
        &self,
        build_id: Uuid,
        release_name: &str,
    ) -> Result<Option<Release>, StoreError> {
        self.inner.latest_release(build_id, release_name).await
    }

    async fn transition_release(
        &self,
        candidate_id: Uuid,
        from: ReleaseStatus,
        to: ReleaseStatus,
    ) -> Result<bool, StoreError> {
        if to == ReleaseStatus::Done && self.done_transitions.take() {
            return Err(StoreError::Corrupt("connection reset".into()));
        }
        self.inner.transition_release(candidate_id, from, to).await
    }

    async fn mark_cancelled(&self, candidate_id: Uuid, at: DateTime<Utc>) -> Result<bool, StoreError> {
        self.inner.mark_cancelled(candidate_id, at).await
    }

    async fn mark_swept(&self, candidate_id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.inner.mark_swept(candidate_id, at).await
    }

    async fn list_sweepable(&self, created_before: DateTime<Utc>) -> Result<Vec<Release>, StoreError> {
        self.inner.list_sweepable(created_before).await
    }

    async fn list_stalled(&self) -> Result<Vec<Uuid>, StoreError> {
        self.inner.list_stalled().await
    }

    async fn record_submission(&self, polling_id: Uuid, candidate_id: Uuid) -> Result<(), StoreError> {
        self.inner.record_submission(polling_id, candidate_id).await
    }

    async fn resolve_polling_id(&self, polling_id: Uuid) -> Result<Option<Uuid>, StoreError> {
        self.inner.resolve_polling_id(polling_id).await
    }

    async fn get_task(
        &self,
        candidate_id: Uuid,
        task_id: &TaskId,
    ) -> Result<Option<CaptureTask>, StoreError> {
        self.inner.get_task(candidate_id, task_id).await
    }

    async fn list_tasks(&self, candidate_id: Uuid) -> Result<Vec<CaptureTask>, StoreError> {
        self.inner.list_tasks(candidate_id).await
    }

    async fn update_task_progress(
        &self,
        candidate_id: Uuid,
        task_id: &TaskId,
        status: TaskStatus,
        attempts: u32,
    ) -> Result<bool, StoreError> {
        self.inner
            .update_task_progress(candidate_id, task_id, status, attempts)
            .await
    }

    async fn register_ledger(
        &self,
        candidate_id: Uuid,
        expected: u32,
    ) -> Result<RegisterOutcome, StoreError> {
        self.inner.register_ledger(candidate_id, expected).await
    }

    async fn record_outcome(
        &self,
        candidate_id: Uuid,
        task_id: &TaskId,
        outcome: &TaskOutcome,
    ) -> Result<RecordOutcome, StoreError> {
        self.inner.record_outcome(candidate_id, task_id, outcome).await
    }

    async fn ledger(&self, candidate_id: Uuid) -> Result<Option<LedgerSnapshot>, StoreError> {
        self.inner.ledger(candidate_id).await
    }

    async fn insert_comparison(&self, result: &ComparisonResult) -> Result<bool, StoreError> {
        self.inner.insert_comparison(result).await
    }

    async fn list_comparisons(&self, candidate_id: Uuid) -> Result<Vec<ComparisonResult>, StoreError> {
        self.inner.list_comparisons(candidate_id).await
    }

    async fn delete_comparisons(&self, candidate_id: Uuid) -> Result<u64, StoreError> {
        self.inner.delete_comparisons(candidate_id).await
    }

    async fn save_notification(&self, event: &NotificationEvent) -> Result<(), StoreError> {
        self.inner.save_notification(event).await
    }

    async fn get_notification(
        &self,
        candidate_id: Uuid,
    ) -> Result<Option<NotificationEvent>, StoreError> {
        self.inner.get_notification(candidate_id).await
    }
}

/// Memory queue that rejects enqueues once `accept` of them have gone through.
pub struct FlakyQueue {
    pub inner: Arc<MemoryTaskQueue>,
    pub accept: AtomicU32,
    pub enqueues: Failures,
}

#[async_trait]
impl TaskQueue for FlakyQueue {
    async fn enqueue(&self, task: &QueuedTask, ready_at: DateTime<Utc>) -> Result<(), QueueError> {
        let passes = self
            .accept
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if !passes && self.enqueues.take() {
            let refused = serde_json::from_str::<u8>("refused").unwrap_err();
            return Err(QueueError::Serialize(refused));
        }
        self.inner.enqueue(task, ready_at).await
    }

    async fn dequeue(&self) -> Result<Option<QueuedTask>, QueueError> {
        self.inner.dequeue().await
    }

    async fn ack(&self, task: &QueuedTask) -> Result<(), QueueError> {
        self.inner.ack(task).await
    }

    async fn depth(&self) -> Result<u64, QueueError> {
        self.inner.depth().await
    }

    async fn reclaim_stale(&self, lease: Duration) -> Result<u64, QueueError> {
        self.inner.reclaim_stale(lease).await
    }

    async fn health_check(&self) -> Result<(), QueueError> {
        self.inner.health_check().await
    }
}

/// Memory blob store whose reads can be made to fail.
pub struct FlakyBlobs {
    pub inner: Arc<MemoryBlobStore>,
    pub reads: Failures,
}

#[async_trait]
impl BlobStore for FlakyBlobs {
    async fn put(&self, key: &str, data: &[u8], content_type: &str) -> Result<(), StorageError> {
        self.inner.put(key, data, content_type).await
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        if self.reads.take() {
            return Err(StorageError::Status {
                key: key.to_string(),
                status: 503,
            });
        }
        self.inner.get(key).await
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.inner.delete(key).await
    }
}

/// Millisecond timings so retries and polling do not slow the suite down.
pub fn fast_settings(outcome_policy: OutcomePolicy) -> PipelineSettings {
    PipelineSettings {
        dispatcher: DispatcherConfig {
            worker_concurrency: 4,
            per_host_concurrency: 2,
            max_retries: 2,
            capture_timeout: Duration::from_secs(5),
            backoff_base: Duration::from_millis(1),
            backoff_max: Duration::from_millis(4),
            host_busy_delay: Duration::from_millis(1),
            poll_interval: Duration::from_millis(2),
            report_attempts: 3,
        },
        notifier: NotifierConfig {
            outcome_policy,
            max_attempts: 2,
            backoff_base: Duration::from_millis(1),
            backoff_max: Duration::from_millis(2),
            public_base_url: "https://diff.example.com".into(),
        },
        retention: RetentionConfig::default(),
        comparison_tolerance: 0.0,
    }
}

pub struct TestPipeline {
    pub pipeline: Pipeline,
    /// Backing state, read directly so injected faults never hide it.
    pub store: Arc<MemoryStore>,
    pub blobs: Arc<MemoryBlobStore>,
    pub queue: Arc<MemoryTaskQueue>,
    pub capture: Arc<PageCapture>,
    pub callbacks: Arc<RecordingCallbacks>,
    pub mailer: Arc<RecordingMailer>,
}

pub struct Faults {
    pub store: Arc<FlakyStore>,
    pub queue: Arc<FlakyQueue>,
    pub blobs: Arc<FlakyBlobs>,
}

impl TestPipeline {
    pub fn new(capture: PageCapture, settings: PipelineSettings) -> Self {
        Self::build(capture, settings, None)
    }

    /// A pipeline whose store, queue and blob store fail on demand. Nothing
    /// fails until a [`Failures`] counter is armed.
    pub fn flaky(capture: PageCapture) -> (Self, Faults) {
        let store = Arc::new(MemoryStore::new());
        let blobs = Arc::new(MemoryBlobStore::new());
        let queue = Arc::new(MemoryTaskQueue::new());
        let faults = Faults {
            store: Arc::new(FlakyStore {
                inner: store,
                done_transitions: Failures::default(),
            }),
            queue: Arc::new(FlakyQueue {
                inner: queue,
                accept: AtomicU32::new(u32::MAX),
                enqueues: Failures::default(),
            }),
            blobs: Arc::new(FlakyBlobs {
                inner: blobs,
                reads: Failures::default(),
            }),
        };
        let t = Self::build(
            capture,
            fast_settings(OutcomePolicy::Strict),
            Some(&faults),
        );
        (t, faults)
    }

    fn build(capture: PageCapture, settings: PipelineSettings, faults: Option<&Faults>) -> Self {
        let (store, blobs, queue) = match faults {
            Some(f) => (f.store.inner.clone(), f.blobs.inner.clone(), f.queue.inner.clone()),
            None => (
                Arc::new(MemoryStore::new()),
                Arc::new(MemoryBlobStore::new()),
                Arc::new(MemoryTaskQueue::new()),
            ),
        };
        let capture = Arc::new(capture);
        let callbacks = Arc::new(RecordingCallbacks::default());
        let mailer = Arc::new(RecordingMailer::default());

        let (store_dyn, blobs_dyn, queue_dyn) = match faults {
            Some(f) => (
                f.store.clone() as Arc<dyn ReleaseStore>,
                f.blobs.clone() as Arc<dyn BlobStore>,
                f.queue.clone() as Arc<dyn TaskQueue>,
            ),
            None => (
                store.clone() as Arc<dyn ReleaseStore>,
                blobs.clone() as Arc<dyn BlobStore>,
                queue.clone() as Arc<dyn TaskQueue>,
            ),
        };
        let pipeline = Pipeline::new(
            Collaborators {
                store: store_dyn,
                blobs: blobs_dyn,
                queue: queue_dyn,
                capture: capture.clone(),
                callbacks: callbacks.clone(),
                mailer: mailer.clone(),
            },
            settings,
        );
        Self {
            pipeline,
            store,
            blobs,
            queue,
            capture,
            callbacks,
            mailer,
        }
    }

    pub fn strict(capture: PageCapture) -> Self {
        Self::new(capture, fast_settings(OutcomePolicy::Strict))
    }

    /// Drain the capture queue, including retries.
    pub async fn drain(&self) {
        self.pipeline
            .dispatcher
            .run_until_idle()
            .await
            .expect("dispatcher drained");
    }

    /// Tasks waiting in the queue.
    pub async fn queued(&self) -> u64 {
        self.queue.depth().await.expect("queue depth")
    }

    pub fn callbacks_posted(&self) -> Vec<(String, ReleaseSummary)> {
        self.callbacks.posted.lock().clone()
    }
}
