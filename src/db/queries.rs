use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use std::collections::BTreeMap;
use std::str::FromStr;
use uuid::Uuid;

use crate::models::build::{Build, BuildConfig};
use crate::models::comparison::ComparisonResult;
use crate::models::notification::NotificationEvent;
use crate::models::release::{Release, ReleaseStatus, TestCase};
use crate::models::task::{CaptureRequest, CaptureTask, ScreenSize, TaskId, TaskOutcome, TaskStatus, Variant};
use crate::store::{LedgerSnapshot, RecordOutcome, RegisterOutcome, ReleaseStore, StoreError};

const RELEASE_COLUMNS: &str = r#"
    r.candidate_id, r.build_id, r.build_name, r.release_name, r.release_number, r.config,
    r.tests, r.expected_count, r.status, r.spec_digest, r.callback_url, r.notify_email,
    r.created_at, r.cancelled_at, r.swept_at, COALESCE(l.reported_count, 0) AS reported_count
"#;

const TASK_COLUMNS: &str = r#"
    candidate_id, task_id, test_name, variant, width, height, host, request, attempts,
    status, outcome, updated_at
"#;

/// PostgreSQL-backed [`ReleaseStore`].
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn parse<T: FromStr>(column: &str, raw: &str) -> Result<T, StoreError> {
    raw.parse()
        .map_err(|_| StoreError::Corrupt(format!("{} has unknown value `{}`", column, raw)))
}

fn count(column: &str, value: i32) -> Result<u32, StoreError> {
    u32::try_from(value).map_err(|_| StoreError::Corrupt(format!("{} is negative", column)))
}

fn build_from_row(row: &PgRow) -> Result<Build, StoreError> {
    Ok(Build {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        account: row.try_get("account")?,
        api_key_hash: row.try_get("api_key_hash")?,
        config: row.try_get::<Json<BuildConfig>, _>("config")?.0,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn release_from_row(row: &PgRow) -> Result<Release, StoreError> {
    let status: String = row.try_get("status")?;
    Ok(Release {
        candidate_id: row.try_get("candidate_id")?,
        build_id: row.try_get("build_id")?,
        build_name: row.try_get("build_name")?,
        release_name: row.try_get("release_name")?,
        release_number: row.try_get("release_number")?,
        config: row.try_get::<Json<BuildConfig>, _>("config")?.0,
        tests: row.try_get::<Json<Vec<TestCase>>, _>("tests")?.0,
        expected_count: count("expected_count", row.try_get("expected_count")?)?,
        reported_count: count("reported_count", row.try_get("reported_count")?)?,
        status: parse::<ReleaseStatus>("status", &status)?,
        spec_digest: row.try_get("spec_digest")?,
        callback_url: row.try_get("callback_url")?,
        notify_email: row.try_get("notify_email")?,
        created_at: row.try_get("created_at")?,
        cancelled_at: row.try_get("cancelled_at")?,
        swept_at: row.try_get("swept_at")?,
    })
}

fn task_from_row(row: &PgRow) -> Result<CaptureTask, StoreError> {
    let variant: String = row.try_get("variant")?;
    let status: String = row.try_get("status")?;
    let task_id: String = row.try_get("task_id")?;
    Ok(CaptureTask {
        id: TaskId::from_raw(task_id),
        candidate_id: row.try_get("candidate_id")?,
        test_name: row.try_get("test_name")?,
        variant: parse::<Variant>("variant", &variant)?,
        size: ScreenSize::new(
            count("width", row.try_get("width")?)?,
            count("height", row.try_get("height")?)?,
        ),
        host: row.try_get("host")?,
        request: row.try_get::<Json<CaptureRequest>, _>("request")?.0,
        attempts: count("attempts", row.try_get("attempts")?)?,
        status: parse::<TaskStatus>("status", &status)?,
        outcome: row
            .try_get::<Option<Json<TaskOutcome>>, _>("outcome")?
            .map(|j| j.0),
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl ReleaseStore for PgStore {
    async fn health_check(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn put_build(&self, build: &Build) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO builds (id, name, account, api_key_hash, config, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (name) DO UPDATE
            SET account = EXCLUDED.account,
                api_key_hash = EXCLUDED.api_key_hash,
                config = EXCLUDED.config,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(build.id)
        .bind(&build.name)
        .bind(&build.account)
        .bind(&build.api_key_hash)
        .bind(Json(&build.config))
        .bind(build.created_at)
        .bind(build.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_build(&self, name: &str) -> Result<Option<Build>, StoreError> {
        let row = sqlx::query("SELECT * FROM builds WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(build_from_row).transpose()
    }

    async fn get_build_by_id(&self, id: Uuid) -> Result<Option<Build>, StoreError> {
        let row = sqlx::query("SELECT * FROM builds WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(build_from_row).transpose()
    }

    async fn insert_release(&self, release: &Release, tasks: &[CaptureTask]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO releases (
                candidate_id, build_id, build_name, release_name, release_number, config, tests,
                expected_count, status, spec_digest, callback_url, notify_email, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(release.candidate_id)
        .bind(release.build_id)
        .bind(&release.build_name)
        .bind(&release.release_name)
        .bind(release.release_number)
        .bind(Json(&release.config))
        .bind(Json(&release.tests))
        .bind(release.expected_count as i32)
        .bind(release.status.to_string())
        .bind(&release.spec_digest)
        .bind(&release.callback_url)
        .bind(&release.notify_email)
        .bind(release.created_at)
        .execute(&mut *tx)
        .await?;

        for task in tasks {
            sqlx::query(
                r#"
                INSERT INTO capture_tasks (
                    candidate_id, task_id, test_name, variant, width, height, host, request,
                    attempts, status, updated_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                "#,
            )
            .bind(task.candidate_id)
            .bind(task.id.as_str())
            .bind(&task.test_name)
            .bind(task.variant.to_string())
            .bind(task.size.width as i32)
            .bind(task.size.height as i32)
            .bind(&task.host)
            .bind(Json(&task.request))
            .bind(task.attempts as i32)
            .bind(task.status.to_string())
            .bind(task.updated_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_release(&self, candidate_id: Uuid) -> Result<Option<Release>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM releases r LEFT JOIN ledgers l USING (candidate_id) WHERE r.candidate_id = $1",
            RELEASE_COLUMNS
        ))
        .bind(candidate_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(release_from_row).transpose()
    }

    async fn latest_release(
        &self,
        build_id: Uuid,
        release_name: &str,
    ) -> Result<Option<Release>, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {} FROM releases r LEFT JOIN ledgers l USING (candidate_id)
            WHERE r.build_id = $1 AND r.release_name = $2
            ORDER BY r.release_number DESC
            LIMIT 1
            "#,
            RELEASE_COLUMNS
        ))
        .bind(build_id)
        .bind(release_name)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(release_from_row).transpose()
    }

    async fn transition_release(
        &self,
        candidate_id: Uuid,
        from: ReleaseStatus,
        to: ReleaseStatus,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE releases SET status = $3 WHERE candidate_id = $1 AND status = $2",
        )
        .bind(candidate_id)
        .bind(from.to_string())
        .bind(to.to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_cancelled(&self, candidate_id: Uuid, at: DateTime<Utc>) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE releases SET cancelled_at = $2 WHERE candidate_id = $1 AND cancelled_at IS NULL",
        )
        .bind(candidate_id)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_swept(&self, candidate_id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query("UPDATE releases SET swept_at = $2 WHERE candidate_id = $1 AND swept_at IS NULL")
            .bind(candidate_id)
            .bind(at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_sweepable(&self, created_before: DateTime<Utc>) -> Result<Vec<Release>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM releases r LEFT JOIN ledgers l USING (candidate_id)
            WHERE r.swept_at IS NULL AND r.created_at < $1
            ORDER BY r.created_at
            "#,
            RELEASE_COLUMNS
        ))
        .bind(created_before)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(release_from_row).collect()
    }

    async fn list_stalled(&self) -> Result<Vec<Uuid>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT r.candidate_id FROM releases r JOIN ledgers l USING (candidate_id)
            WHERE r.status <> $1 AND l.reported_count = l.expected_count
            "#,
        )
        .bind(ReleaseStatus::Done.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| row.try_get::<Uuid, _>("candidate_id").map_err(StoreError::from))
            .collect()
    }

    async fn record_submission(&self, polling_id: Uuid, candidate_id: Uuid) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO submissions (polling_id, candidate_id) VALUES ($1, $2)")
            .bind(polling_id)
            .bind(candidate_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn resolve_polling_id(&self, polling_id: Uuid) -> Result<Option<Uuid>, StoreError> {
        let row = sqlx::query("SELECT candidate_id FROM submissions WHERE polling_id = $1")
            .bind(polling_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(match row {
            Some(r) => Some(r.try_get("candidate_id")?),
            None => None,
        })
    }

    async fn get_task(
        &self,
        candidate_id: Uuid,
        task_id: &TaskId,
    ) -> Result<Option<CaptureTask>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM capture_tasks WHERE candidate_id = $1 AND task_id = $2",
            TASK_COLUMNS
        ))
        .bind(candidate_id)
        .bind(task_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(task_from_row).transpose()
    }

    async fn list_tasks(&self, candidate_id: Uuid) -> Result<Vec<CaptureTask>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM capture_tasks WHERE candidate_id = $1 ORDER BY task_id",
            TASK_COLUMNS
        ))
        .bind(candidate_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(task_from_row).collect()
    }

    async fn update_task_progress(
        &self,
        candidate_id: Uuid,
        task_id: &TaskId,
        status: TaskStatus,
        attempts: u32,
    ) -> Result<bool, StoreError> {
        // Finalization only happens through record_outcome.
        if status == TaskStatus::Finalized {
            return Ok(false);
        }
        let allowed_from: Vec<String> = [TaskStatus::Queued, TaskStatus::InFlight, TaskStatus::Retrying]
            .into_iter()
            .filter(|from| from.can_transition_to(status))
            .map(|from| from.to_string())
            .collect();

        let result = sqlx::query(
            r#"
            UPDATE capture_tasks
            SET status = $3, attempts = GREATEST(attempts, $4), updated_at = NOW()
            WHERE candidate_id = $1 AND task_id = $2 AND status = ANY($5)
            "#,
        )
        .bind(candidate_id)
        .bind(task_id.as_str())
        .bind(status.to_string())
        .bind(attempts as i32)
        .bind(&allowed_from)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn register_ledger(
        &self,
        candidate_id: Uuid,
        expected: u32,
    ) -> Result<RegisterOutcome, StoreError> {
        let inserted = sqlx::query(
            "INSERT INTO ledgers (candidate_id, expected_count) VALUES ($1, $2) ON CONFLICT DO NOTHING",
        )
        .bind(candidate_id)
        .bind(expected as i32)
        .execute(&self.pool)
        .await?;
        if inserted.rows_affected() == 1 {
            return Ok(RegisterOutcome::Created);
        }

        let row = sqlx::query("SELECT expected_count FROM ledgers WHERE candidate_id = $1")
            .bind(candidate_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(RegisterOutcome::AlreadyRegistered {
            expected: count("expected_count", row.try_get("expected_count")?)?,
        })
    }

    async fn record_outcome(
        &self,
        candidate_id: Uuid,
        task_id: &TaskId,
        outcome: &TaskOutcome,
    ) -> Result<RecordOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;

        // Row lock serializes reports for one release.
        let Some(ledger) = sqlx::query(
            "SELECT expected_count, reported_count FROM ledgers WHERE candidate_id = $1 FOR UPDATE",
        )
        .bind(candidate_id)
        .fetch_optional(&mut *tx)
        .await?
        else {
            return Ok(RecordOutcome::NotRegistered);
        };
        let expected = count("expected_count", ledger.try_get("expected_count")?)?;
        let reported = count("reported_count", ledger.try_get("reported_count")?)?;

        let existing = sqlx::query(
            "SELECT 1 AS found FROM ledger_entries WHERE candidate_id = $1 AND task_id = $2",
        )
        .bind(candidate_id)
        .bind(task_id.as_str())
        .fetch_optional(&mut *tx)
        .await?;
        if existing.is_some() {
            return Ok(RecordOutcome::Duplicate { reported, expected });
        }

        let task = sqlx::query(
            "SELECT 1 AS found FROM capture_tasks WHERE candidate_id = $1 AND task_id = $2",
        )
        .bind(candidate_id)
        .bind(task_id.as_str())
        .fetch_optional(&mut *tx)
        .await?;
        if task.is_none() {
            return Ok(RecordOutcome::UnknownTask);
        }
        if reported >= expected {
            return Ok(RecordOutcome::LedgerFull { expected });
        }

        sqlx::query("INSERT INTO ledger_entries (candidate_id, task_id, outcome) VALUES ($1, $2, $3)")
            .bind(candidate_id)
            .bind(task_id.as_str())
            .bind(Json(outcome))
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE ledgers SET reported_count = reported_count + 1 WHERE candidate_id = $1")
            .bind(candidate_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            r#"
            UPDATE capture_tasks
            SET status = 'finalized', outcome = $3, updated_at = NOW()
            WHERE candidate_id = $1 AND task_id = $2
            "#,
        )
        .bind(candidate_id)
        .bind(task_id.as_str())
        .bind(Json(outcome))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(RecordOutcome::Recorded {
            reported: reported + 1,
            expected,
        })
    }

    async fn ledger(&self, candidate_id: Uuid) -> Result<Option<LedgerSnapshot>, StoreError> {
        let Some(ledger) = sqlx::query("SELECT expected_count FROM ledgers WHERE candidate_id = $1")
            .bind(candidate_id)
            .fetch_optional(&self.pool)
            .await?
        else {
            return Ok(None);
        };

        let rows = sqlx::query("SELECT task_id, outcome FROM ledger_entries WHERE candidate_id = $1")
            .bind(candidate_id)
            .fetch_all(&self.pool)
            .await?;
        let mut outcomes = BTreeMap::new();
        for row in &rows {
            let task_id: String = row.try_get("task_id")?;
            let outcome = row.try_get::<Json<TaskOutcome>, _>("outcome")?.0;
            outcomes.insert(TaskId::from_raw(task_id), outcome);
        }

        Ok(Some(LedgerSnapshot {
            expected: count("expected_count", ledger.try_get("expected_count")?)?,
            outcomes,
        }))
    }

    async fn insert_comparison(&self, result: &ComparisonResult) -> Result<bool, StoreError> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO comparison_results (candidate_id, test_name, width, height, result, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(result.candidate_id)
        .bind(&result.test_name)
        .bind(result.size.width as i32)
        .bind(result.size.height as i32)
        .bind(Json(result))
        .bind(result.created_at)
        .execute(&self.pool)
        .await?;
        Ok(inserted.rows_affected() == 1)
    }

    async fn list_comparisons(&self, candidate_id: Uuid) -> Result<Vec<ComparisonResult>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT result FROM comparison_results
            WHERE candidate_id = $1
            ORDER BY test_name, width, height
            "#,
        )
        .bind(candidate_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| -> Result<ComparisonResult, StoreError> {
                Ok(row.try_get::<Json<ComparisonResult>, _>("result")?.0)
            })
            .collect()
    }

    async fn delete_comparisons(&self, candidate_id: Uuid) -> Result<u64, StoreError> {
        let deleted = sqlx::query("DELETE FROM comparison_results WHERE candidate_id = $1")
            .bind(candidate_id)
            .execute(&self.pool)
            .await?;
        Ok(deleted.rows_affected())
    }

    async fn save_notification(&self, event: &NotificationEvent) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO notification_events (candidate_id, event, created_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (candidate_id) DO NOTHING
            "#,
        )
        .bind(event.candidate_id)
        .bind(Json(event))
        .bind(event.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_notification(
        &self,
        candidate_id: Uuid,
    ) -> Result<Option<NotificationEvent>, StoreError> {
        let row = sqlx::query("SELECT event FROM notification_events WHERE candidate_id = $1")
            .bind(candidate_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(match row {
            Some(r) => Some(r.try_get::<Json<NotificationEvent>, _>("event")?.0),
            None => None,
        })
    }
}
