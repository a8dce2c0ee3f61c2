use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

use super::{LedgerSnapshot, RecordOutcome, RegisterOutcome, ReleaseStore, StoreError};
use crate::models::build::Build;
use crate::models::comparison::ComparisonResult;
use crate::models::notification::NotificationEvent;
use crate::models::release::{Release, ReleaseStatus};
use crate::models::task::{CaptureTask, ScreenSize, TaskId, TaskOutcome, TaskStatus};

/// In-process store. All state sits behind one mutex that is only held for
/// synchronous map updates, never across an await.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    builds: HashMap<Uuid, Build>,
    build_names: HashMap<String, Uuid>,
    releases: HashMap<Uuid, Release>,
    submissions: HashMap<Uuid, Uuid>,
    tasks: HashMap<Uuid, BTreeMap<TaskId, CaptureTask>>,
    ledgers: HashMap<Uuid, LedgerSnapshot>,
    comparisons: HashMap<Uuid, BTreeMap<(String, ScreenSize), ComparisonResult>>,
    notifications: HashMap<Uuid, NotificationEvent>,
}

impl Inner {
    fn release_view(&self, release: &Release) -> Release {
        let mut view = release.clone();
        view.reported_count = self
            .ledgers
            .get(&release.candidate_id)
            .map(LedgerSnapshot::reported)
            .unwrap_or(0);
        view
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ReleaseStore for MemoryStore {
    async fn health_check(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn put_build(&self, build: &Build) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        if let Some(old_id) = inner.build_names.insert(build.name.clone(), build.id) {
            if old_id != build.id {
                inner.builds.remove(&old_id);
            }
        }
        inner.builds.insert(build.id, build.clone());
        Ok(())
    }

    async fn get_build(&self, name: &str) -> Result<Option<Build>, StoreError> {
        let inner = self.inner.lock();
        Ok(inner
            .build_names
            .get(name)
            .and_then(|id| inner.builds.get(id))
            .cloned())
    }

    async fn get_build_by_id(&self, id: Uuid) -> Result<Option<Build>, StoreError> {
        Ok(self.inner.lock().builds.get(&id).cloned())
    }

    async fn insert_release(&self, release: &Release, tasks: &[CaptureTask]) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        inner.releases.insert(release.candidate_id, release.clone());
        inner.tasks.insert(
            release.candidate_id,
            tasks.iter().map(|t| (t.id.clone(), t.clone())).collect(),
        );
        Ok(())
    }

    async fn get_release(&self, candidate_id: Uuid) -> Result<Option<Release>, StoreError> {
        let inner = self.inner.lock();
        Ok(inner.releases.get(&candidate_id).map(|r| inner.release_view(r)))
    }

    async fn latest_release(
        &self,
        build_id: Uuid,
        release_name: &str,
    ) -> Result<Option<Release>, StoreError> {
        let inner = self.inner.lock();
        Ok(inner
            .releases
            .values()
            .filter(|r| r.build_id == build_id && r.release_name == release_name)
            .max_by_key(|r| r.release_number)
            .map(|r| inner.release_view(r)))
    }

    async fn transition_release(
        &self,
        candidate_id: Uuid,
        from: ReleaseStatus,
        to: ReleaseStatus,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock();
        match inner.releases.get_mut(&candidate_id) {
            Some(release) if release.status == from => {
                release.status = to;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_cancelled(&self, candidate_id: Uuid, at: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock();
        match inner.releases.get_mut(&candidate_id) {
            Some(release) if release.cancelled_at.is_none() => {
                release.cancelled_at = Some(at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_swept(&self, candidate_id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError> {
        if let Some(release) = self.inner.lock().releases.get_mut(&candidate_id) {
            release.swept_at.get_or_insert(at);
        }
        Ok(())
    }

    async fn list_sweepable(&self, created_before: DateTime<Utc>) -> Result<Vec<Release>, StoreError> {
        let inner = self.inner.lock();
        let mut releases: Vec<Release> = inner
            .releases
            .values()
            .filter(|r| r.swept_at.is_none() && r.created_at < created_before)
            .map(|r| inner.release_view(r))
            .collect();
        releases.sort_by_key(|r| r.created_at);
        Ok(releases)
    }

    async fn list_stalled(&self) -> Result<Vec<Uuid>, StoreError> {
        let inner = self.inner.lock();
        Ok(inner
            .releases
            .values()
            .filter(|r| r.status != ReleaseStatus::Done)
            .filter(|r| {
                inner
                    .ledgers
                    .get(&r.candidate_id)
                    .is_some_and(LedgerSnapshot::is_complete)
            })
            .map(|r| r.candidate_id)
            .collect())
    }

    async fn record_submission(&self, polling_id: Uuid, candidate_id: Uuid) -> Result<(), StoreError> {
        self.inner.lock().submissions.insert(polling_id, candidate_id);
        Ok(())
    }

    async fn resolve_polling_id(&self, polling_id: Uuid) -> Result<Option<Uuid>, StoreError> {
        Ok(self.inner.lock().submissions.get(&polling_id).copied())
    }

    async fn get_task(
        &self,
        candidate_id: Uuid,
        task_id: &TaskId,
    ) -> Result<Option<CaptureTask>, StoreError> {
        Ok(self
            .inner
            .lock()
            .tasks
            .get(&candidate_id)
            .and_then(|tasks| tasks.get(task_id))
            .cloned())
    }

    async fn list_tasks(&self, candidate_id: Uuid) -> Result<Vec<CaptureTask>, StoreError> {
        Ok(self
            .inner
            .lock()
            .tasks
            .get(&candidate_id)
            .map(|tasks| tasks.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn update_task_progress(
        &self,
        candidate_id: Uuid,
        task_id: &TaskId,
        status: TaskStatus,
        attempts: u32,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock();
        let task = match inner.tasks.get_mut(&candidate_id).and_then(|t| t.get_mut(task_id)) {
            Some(task) => task,
            None => return Ok(false),
        };
        if status == TaskStatus::Finalized || !task.status.can_transition_to(status) {
            return Ok(false);
        }
        task.status = status;
        task.attempts = task.attempts.max(attempts);
        task.updated_at = Utc::now();
        Ok(true)
    }

    async fn register_ledger(
        &self,
        candidate_id: Uuid,
        expected: u32,
    ) -> Result<RegisterOutcome, StoreError> {
        let mut inner = self.inner.lock();
        if let Some(ledger) = inner.ledgers.get(&candidate_id) {
            return Ok(RegisterOutcome::AlreadyRegistered {
                expected: ledger.expected,
            });
        }
        inner.ledgers.insert(
            candidate_id,
            LedgerSnapshot {
                expected,
                outcomes: BTreeMap::new(),
            },
        );
        Ok(RegisterOutcome::Created)
    }

    async fn record_outcome(
        &self,
        candidate_id: Uuid,
        task_id: &TaskId,
        outcome: &TaskOutcome,
    ) -> Result<RecordOutcome, StoreError> {
        let mut inner = self.inner.lock();
        let Inner { ledgers, tasks, .. } = &mut *inner;

        let Some(ledger) = ledgers.get_mut(&candidate_id) else {
            return Ok(RecordOutcome::NotRegistered);
        };
        let Some(task) = tasks.get_mut(&candidate_id).and_then(|t| t.get_mut(task_id)) else {
            return Ok(RecordOutcome::UnknownTask);
        };

        let expected = ledger.expected;
        if ledger.outcomes.contains_key(task_id) {
            return Ok(RecordOutcome::Duplicate {
                reported: ledger.reported(),
                expected,
            });
        }
        if ledger.reported() >= expected {
            return Ok(RecordOutcome::LedgerFull { expected });
        }

        ledger.outcomes.insert(task_id.clone(), outcome.clone());
        task.status = TaskStatus::Finalized;
        task.outcome = Some(outcome.clone());
        task.updated_at = Utc::now();

        Ok(RecordOutcome::Recorded {
            reported: ledger.reported(),
            expected,
        })
    }

    async fn ledger(&self, candidate_id: Uuid) -> Result<Option<LedgerSnapshot>, StoreError> {
        Ok(self.inner.lock().ledgers.get(&candidate_id).cloned())
    }

    async fn insert_comparison(&self, result: &ComparisonResult) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock();
        let results = inner.comparisons.entry(result.candidate_id).or_default();
        let key = (result.test_name.clone(), result.size);
        if results.contains_key(&key) {
            return Ok(false);
        }
        results.insert(key, result.clone());
        Ok(true)
    }

    async fn list_comparisons(&self, candidate_id: Uuid) -> Result<Vec<ComparisonResult>, StoreError> {
        Ok(self
            .inner
            .lock()
            .comparisons
            .get(&candidate_id)
            .map(|results| results.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn delete_comparisons(&self, candidate_id: Uuid) -> Result<u64, StoreError> {
        Ok(self
            .inner
            .lock()
            .comparisons
            .remove(&candidate_id)
            .map(|results| results.len() as u64)
            .unwrap_or(0))
    }

    async fn save_notification(&self, event: &NotificationEvent) -> Result<(), StoreError> {
        self.inner
            .lock()
            .notifications
            .insert(event.candidate_id, event.clone());
        Ok(())
    }

    async fn get_notification(
        &self,
        candidate_id: Uuid,
    ) -> Result<Option<NotificationEvent>, StoreError> {
        Ok(self.inner.lock().notifications.get(&candidate_id).cloned())
    }
}
