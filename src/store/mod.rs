//! Persisted state for builds, releases, tasks, the completion ledger,
//! comparison results and notification events.
//!
//! [`ReleaseStore`] is implemented by [`memory::MemoryStore`] (single process,
//! tests) and by [`crate::db::queries::PgStore`] (PostgreSQL). Every ledger
//! mutation is an atomic record-if-absent keyed by task id.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::models::build::Build;
use crate::models::comparison::ComparisonResult;
use crate::models::notification::NotificationEvent;
use crate::models::release::{Release, ReleaseStatus};
use crate::models::task::{CaptureTask, TaskId, TaskOutcome, TaskStatus};

pub use memory::MemoryStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Stored record is corrupt: {0}")]
    Corrupt(String),
}

/// Result of the register phase of the completion barrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    Created,
    AlreadyRegistered { expected: u32 },
}

/// Result of recording a task outcome in the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    /// First report for this task; counts after the insert.
    Recorded { reported: u32, expected: u32 },
    /// The task already had an outcome; nothing changed.
    Duplicate { reported: u32, expected: u32 },
    /// No ledger was registered for the release.
    NotRegistered,
    /// The task id does not belong to the release.
    UnknownTask,
    /// The ledger already holds `expected` outcomes.
    LedgerFull { expected: u32 },
}

/// Point-in-time copy of a release ledger.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LedgerSnapshot {
    pub expected: u32,
    pub outcomes: BTreeMap<TaskId, TaskOutcome>,
}

impl LedgerSnapshot {
    pub fn reported(&self) -> u32 {
        self.outcomes.len() as u32
    }

    pub fn is_complete(&self) -> bool {
        self.reported() == self.expected
    }
}

#[async_trait]
pub trait ReleaseStore: Send + Sync {
    async fn health_check(&self) -> Result<(), StoreError>;

    /// Insert or replace a build, keyed by name.
    async fn put_build(&self, build: &Build) -> Result<(), StoreError>;

    async fn get_build(&self, name: &str) -> Result<Option<Build>, StoreError>;

    async fn get_build_by_id(&self, id: Uuid) -> Result<Option<Build>, StoreError>;

    /// Persist a freshly compiled release and its tasks.
    async fn insert_release(&self, release: &Release, tasks: &[CaptureTask]) -> Result<(), StoreError>;

    async fn get_release(&self, candidate_id: Uuid) -> Result<Option<Release>, StoreError>;

    /// Highest-numbered candidate for a (build, release name) pair.
    async fn latest_release(
        &self,
        build_id: Uuid,
        release_name: &str,
    ) -> Result<Option<Release>, StoreError>;

    /// Compare-and-set on the release status. Returns whether the transition applied.
    async fn transition_release(
        &self,
        candidate_id: Uuid,
        from: ReleaseStatus,
        to: ReleaseStatus,
    ) -> Result<bool, StoreError>;

    /// Returns false if the release was already cancelled or does not exist.
    async fn mark_cancelled(&self, candidate_id: Uuid, at: DateTime<Utc>) -> Result<bool, StoreError>;

    async fn mark_swept(&self, candidate_id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError>;

    /// Releases created before the cutoff whose blobs have not been swept.
    async fn list_sweepable(&self, created_before: DateTime<Utc>) -> Result<Vec<Release>, StoreError>;

    /// Releases whose ledger holds every expected outcome but which never reached Done.
    async fn list_stalled(&self) -> Result<Vec<Uuid>, StoreError>;

    async fn record_submission(&self, polling_id: Uuid, candidate_id: Uuid) -> Result<(), StoreError>;

    async fn resolve_polling_id(&self, polling_id: Uuid) -> Result<Option<Uuid>, StoreError>;

    async fn get_task(
        &self,
        candidate_id: Uuid,
        task_id: &TaskId,
    ) -> Result<Option<CaptureTask>, StoreError>;

    async fn list_tasks(&self, candidate_id: Uuid) -> Result<Vec<CaptureTask>, StoreError>;

    /// Move a task forward in its lifecycle. Returns false when the transition
    /// is not allowed from the stored status (e.g. the task is already finalized).
    async fn update_task_progress(
        &self,
        candidate_id: Uuid,
        task_id: &TaskId,
        status: TaskStatus,
        attempts: u32,
    ) -> Result<bool, StoreError>;

    async fn register_ledger(
        &self,
        candidate_id: Uuid,
        expected: u32,
    ) -> Result<RegisterOutcome, StoreError>;

    /// Record a task outcome if none is recorded yet, finalizing the task.
    async fn record_outcome(
        &self,
        candidate_id: Uuid,
        task_id: &TaskId,
        outcome: &TaskOutcome,
    ) -> Result<RecordOutcome, StoreError>;

    async fn ledger(&self, candidate_id: Uuid) -> Result<Option<LedgerSnapshot>, StoreError>;

    /// Insert if no result exists for (candidate, test, size). Returns whether it was inserted.
    async fn insert_comparison(&self, result: &ComparisonResult) -> Result<bool, StoreError>;

    async fn list_comparisons(&self, candidate_id: Uuid) -> Result<Vec<ComparisonResult>, StoreError>;

    async fn delete_comparisons(&self, candidate_id: Uuid) -> Result<u64, StoreError>;

    async fn save_notification(&self, event: &NotificationEvent) -> Result<(), StoreError>;

    async fn get_notification(
        &self,
        candidate_id: Uuid,
    ) -> Result<Option<NotificationEvent>, StoreError>;
}
