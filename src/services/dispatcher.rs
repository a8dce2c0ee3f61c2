//! Pulls capture tasks off the queue and runs them under a global and a
//! per-host concurrency cap, with timeouts and capped exponential retry.
//!
//! Every task ends with exactly one report to the completion tracker, whether
//! it captured, failed permanently, or ran out of retries.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::models::release::Release;
use crate::models::task::{CaptureError, CaptureTask, ImageRef, TaskOutcome, TaskStatus};
use crate::services::backoff;
use crate::services::capture::{CaptureClient, CaptureFailure, CaptureResponse};
use crate::services::queue::{QueueError, QueuedTask, TaskQueue};
use crate::services::storage::{image_key, BlobStore, PNG_CONTENT_TYPE};
use crate::services::tracker::{CompletionTracker, TrackerError};
use crate::store::{ReleaseStore, StoreError};

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub worker_concurrency: usize,
    pub per_host_concurrency: usize,
    /// Total capture attempts per task, including the first.
    pub max_retries: u32,
    pub capture_timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Delay before retrying a task whose host was saturated.
    pub host_busy_delay: Duration,
    /// Idle wait when the queue has nothing ready.
    pub poll_interval: Duration,
    /// Attempts at handing an outcome to the tracker before giving up.
    pub report_attempts: u32,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            worker_concurrency: 8,
            per_host_concurrency: 2,
            max_retries: 3,
            capture_timeout: Duration::from_secs(60),
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(60),
            host_busy_delay: Duration::from_millis(500),
            poll_interval: Duration::from_secs(1),
            report_attempts: 5,
        }
    }
}

/// What happened to one dequeued task.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskDisposition {
    Captured,
    Retrying { attempts: u32, ready_at: DateTime<Utc> },
    Failed(CaptureError),
    /// Host was saturated; requeued without using an attempt.
    Deferred,
    /// Release cancelled, task already finalized, or records missing.
    Skipped,
    /// Dispatch hit an infrastructure error. The claim is left for lease reclaim.
    Abandoned,
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Tracker(#[from] TrackerError),
}

pub struct Dispatcher {
    store: Arc<dyn ReleaseStore>,
    queue: Arc<dyn TaskQueue>,
    capture: Arc<dyn CaptureClient>,
    blobs: Arc<dyn BlobStore>,
    tracker: Arc<CompletionTracker>,
    config: DispatcherConfig,
    slots: Arc<Semaphore>,
    hosts: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn ReleaseStore>,
        queue: Arc<dyn TaskQueue>,
        capture: Arc<dyn CaptureClient>,
        blobs: Arc<dyn BlobStore>,
        tracker: Arc<CompletionTracker>,
        config: DispatcherConfig,
    ) -> Self {
        let slots = Arc::new(Semaphore::new(config.worker_concurrency.max(1)));
        Self {
            store,
            queue,
            capture,
            blobs,
            tracker,
            config,
            slots,
            hosts: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Dispatch until `shutdown` flips to true, then drain in-flight captures.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            workers = self.config.worker_concurrency,
            per_host = self.config.per_host_concurrency,
            "Dispatcher started"
        );
        let mut workers = JoinSet::new();

        loop {
            if *shutdown.borrow() {
                break;
            }
            let permit = tokio::select! {
                permit = self.slots.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = shutdown.changed() => break,
            };

            match self.queue.dequeue().await {
                Ok(Some(item)) => self.spawn(&mut workers, item, permit),
                Ok(None) => {
                    drop(permit);
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                        _ = shutdown.changed() => {}
                    }
                }
                Err(e) => {
                    drop(permit);
                    error!(error = %e, "Failed to dequeue capture task");
                    tokio::time::sleep(self.config.poll_interval).await;
                }
            }

            while let Some(joined) = workers.try_join_next() {
                if let Err(e) = joined {
                    error!(error = %e, "Capture worker panicked");
                }
            }
        }

        info!(in_flight = workers.len(), "Dispatcher draining");
        while workers.join_next().await.is_some() {}
        info!("Dispatcher stopped");
    }

    /// Dispatch until the queue is empty and nothing is in flight, including
    /// tasks waiting out a retry delay.
    pub async fn run_until_idle(self: &Arc<Self>) -> Result<(), QueueError> {
        let mut workers = JoinSet::new();
        loop {
            let Ok(permit) = self.slots.clone().acquire_owned().await else {
                break;
            };
            match self.queue.dequeue().await? {
                Some(item) => self.spawn(&mut workers, item, permit),
                None => {
                    drop(permit);
                    if workers.join_next().await.is_none() {
                        if self.queue.depth().await? == 0 {
                            break;
                        }
                        tokio::time::sleep(self.config.poll_interval).await;
                    }
                }
            }
        }
        while workers.join_next().await.is_some() {}
        Ok(())
    }

    fn spawn(self: &Arc<Self>, workers: &mut JoinSet<()>, item: QueuedTask, permit: OwnedSemaphorePermit) {
        let this = Arc::clone(self);
        workers.spawn(async move {
            let _permit = permit;
            this.process(item).await;
        });
    }

    /// Run one dequeued task to its next resting state and ack the claim.
    pub async fn process(&self, item: QueuedTask) -> TaskDisposition {
        let disposition = match self.attempt(&item).await {
            Ok(disposition) => disposition,
            Err(e) => {
                error!(
                    candidate_id = %item.candidate_id,
                    task_id = %item.task_id,
                    error = %e,
                    "Dispatch failed; task left for lease reclaim"
                );
                return TaskDisposition::Abandoned;
            }
        };

        if let Err(e) = self.queue.ack(&item).await {
            warn!(task_id = %item.task_id, error = %e, "Failed to ack capture task");
        }
        disposition
    }

    async fn attempt(&self, item: &QueuedTask) -> Result<TaskDisposition, DispatchError> {
        let Some(release) = self.store.get_release(item.candidate_id).await? else {
            warn!(candidate_id = %item.candidate_id, "Task for unknown release dropped");
            return Ok(TaskDisposition::Skipped);
        };
        if release.is_cancelled() {
            debug!(candidate_id = %item.candidate_id, task_id = %item.task_id, "Release cancelled; skipping");
            return Ok(TaskDisposition::Skipped);
        }
        let Some(task) = self.store.get_task(item.candidate_id, &item.task_id).await? else {
            warn!(task_id = %item.task_id, "Unknown task dropped");
            return Ok(TaskDisposition::Skipped);
        };
        if task.status == TaskStatus::Finalized {
            return Ok(TaskDisposition::Skipped);
        }

        let Ok(host_permit) = self.host_slot(&task.host).try_acquire_owned() else {
            let ready_at = after(self.config.host_busy_delay);
            self.queue.enqueue(item, ready_at).await?;
            metrics::counter!("capture_deferrals_total").increment(1);
            return Ok(TaskDisposition::Deferred);
        };

        let attempts = item.attempts + 1;
        if !self
            .store
            .update_task_progress(item.candidate_id, &item.task_id, TaskStatus::InFlight, attempts)
            .await?
        {
            return Ok(TaskDisposition::Skipped);
        }

        metrics::counter!("capture_attempts_total").increment(1);
        let started = Instant::now();
        let result = match tokio::time::timeout(
            self.config.capture_timeout,
            self.capture.capture(&task.request),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(CaptureFailure::Timeout),
        };
        drop(host_permit);
        metrics::histogram!("capture_duration_seconds").record(started.elapsed().as_secs_f64());

        let failure = match result {
            Ok(response) => match self.store_image(&release, response).await {
                Ok(image) => {
                    self.finalize(item, image.into()).await?;
                    info!(
                        candidate_id = %item.candidate_id,
                        task_id = %item.task_id,
                        test = %task.test_name,
                        variant = %task.variant,
                        attempts,
                        "Capture stored"
                    );
                    return Ok(TaskDisposition::Captured);
                }
                Err(failure) => failure,
            },
            Err(failure) => failure,
        };

        self.handle_failure(item, &task, attempts, failure).await
    }

    async fn handle_failure(
        &self,
        item: &QueuedTask,
        task: &CaptureTask,
        attempts: u32,
        failure: CaptureFailure,
    ) -> Result<TaskDisposition, DispatchError> {
        let error = if !failure.is_retriable() {
            CaptureError::NonRetriable {
                detail: failure.to_string(),
            }
        } else if attempts < self.config.max_retries {
            self.store
                .update_task_progress(item.candidate_id, &item.task_id, TaskStatus::Retrying, attempts)
                .await?;
            let delay = backoff::delay(self.config.backoff_base, self.config.backoff_max, attempts);
            let ready_at = after(delay);
            let retry = QueuedTask {
                attempts,
                ..item.clone()
            };
            self.queue.enqueue(&retry, ready_at).await?;
            metrics::counter!("capture_retries_total").increment(1);
            warn!(
                candidate_id = %item.candidate_id,
                task_id = %item.task_id,
                test = %task.test_name,
                attempts,
                delay_ms = delay.as_millis() as u64,
                error = %failure,
                "Capture failed; retrying"
            );
            return Ok(TaskDisposition::Retrying { attempts, ready_at });
        } else {
            CaptureError::RetriesExhausted {
                attempts,
                last_error: failure.to_string(),
            }
        };

        warn!(
            candidate_id = %item.candidate_id,
            task_id = %item.task_id,
            test = %task.test_name,
            attempts,
            error = %error,
            "Capture failed"
        );
        metrics::counter!("capture_failures_total").increment(1);
        self.finalize(item, error.clone().into()).await?;
        Ok(TaskDisposition::Failed(error))
    }

    async fn store_image(&self, release: &Release, response: CaptureResponse) -> Result<ImageRef, CaptureFailure> {
        let decoded = image::load_from_memory(&response.image)
            .map_err(|e| CaptureFailure::InvalidResponse(format!("undecodable screenshot: {}", e)))?;
        let (key, sha256) = image_key(release.candidate_id, &response.image);
        self.blobs
            .put(&key, &response.image, PNG_CONTENT_TYPE)
            .await
            .map_err(|e| CaptureFailure::Transport(format!("blob store: {}", e)))?;

        Ok(ImageRef {
            key,
            sha256,
            width: decoded.width(),
            height: decoded.height(),
            regions: response.regions,
        })
    }

    /// Hand the outcome to the tracker, retrying store and blob hiccups. A
    /// retry after the outcome landed finishes the release from the full ledger.
    async fn finalize(&self, item: &QueuedTask, outcome: TaskOutcome) -> Result<(), DispatchError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self
                .tracker
                .report(item.candidate_id, &item.task_id, outcome.clone())
                .await
            {
                Ok(reported) => {
                    debug!(task_id = %item.task_id, ?reported, "Outcome reported");
                    return Ok(());
                }
                Err(e @ (TrackerError::Store(_) | TrackerError::Aggregation(_)))
                    if attempt < self.config.report_attempts =>
                {
                    warn!(task_id = %item.task_id, attempt, error = %e, "Report failed; retrying");
                    tokio::time::sleep(backoff::delay(
                        self.config.backoff_base,
                        self.config.backoff_max,
                        attempt,
                    ))
                    .await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn host_slot(&self, host: &str) -> Arc<Semaphore> {
        let mut hosts = self.hosts.lock();
        hosts
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.config.per_host_concurrency.max(1))))
            .clone()
    }
}

fn after(delay: Duration) -> DateTime<Utc> {
    Utc::now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::hours(1))
}
