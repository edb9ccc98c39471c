//! Shared task state machine for the ASR and PDF export engines.
//!
//! ```text
//! pending ──dispatch──▶ processing ──success──▶ completed
//!    │                      └──failure──▶ failed
//!    └──failure─────────────────────────▶ failed
//! ```
//!
//! Every write below is a single-row update keyed by id and guarded by
//! [`OPEN_GUARD`], so nothing leaves `completed` or `failed` except an
//! explicit retry of a failed task.

pub mod dispatcher;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::errors::AppError;
use crate::state::AppState;
use dispatcher::{Job, JobHandler};

/// Appended to every transition that must not touch a terminal row.
pub const OPEN_GUARD: &str = "status NOT IN ('completed', 'failed')";

/// Rows handed to the dispatcher per rescan.
const RESCAN_BATCH: i64 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "task_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

/// The two persisted task engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Asr,
    PdfExport,
}

impl TaskKind {
    pub const ALL: [TaskKind; 2] = [TaskKind::Asr, TaskKind::PdfExport];

    pub fn table(self) -> &'static str {
        match self {
            TaskKind::Asr => "asr_tasks",
            TaskKind::PdfExport => "pdf_export_tasks",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskKind::Asr => "asr",
            TaskKind::PdfExport => "pdf_export",
        }
    }
}

/// Retry is only permitted from `failed`.
pub fn ensure_retryable(status: TaskStatus) -> Result<(), AppError> {
    if status == TaskStatus::Failed {
        Ok(())
    } else {
        Err(AppError::InvalidState(format!(
            "only failed tasks can be retried, task is {status:?}"
        )))
    }
}

fn grace_cutoff(now: DateTime<Utc>, grace: std::time::Duration) -> DateTime<Utc> {
    let grace = chrono::Duration::from_std(grace).unwrap_or_else(|_| chrono::Duration::seconds(60));
    now - grace
}

// ────────────────────────────────────────────────────────────────────────────
// Shared SQL
// ────────────────────────────────────────────────────────────────────────────

/// Takes the dispatch lease on a pending row. Returns `false` when another
/// worker holds a fresh lease or the row has moved on.
pub async fn claim(
    pool: &PgPool,
    kind: TaskKind,
    id: Uuid,
    now: DateTime<Utc>,
    grace: std::time::Duration,
) -> Result<bool, sqlx::Error> {
    let sql = format!(
        "UPDATE {} SET dispatched_at = $2, updated_at = $2 \
         WHERE id = $1 AND status = 'pending' \
           AND (dispatched_at IS NULL OR dispatched_at < $3)",
        kind.table()
    );
    let claimed = sqlx::query(&sql)
        .bind(id)
        .bind(now)
        .bind(grace_cutoff(now, grace))
        .execute(pool)
        .await?
        .rows_affected();
    Ok(claimed == 1)
}

pub async fn mark_processing(
    pool: &PgPool,
    kind: TaskKind,
    id: Uuid,
    progress: i32,
    now: DateTime<Utc>,
) -> Result<bool, sqlx::Error> {
    let sql = format!(
        "UPDATE {} SET status = 'processing', progress = $2, updated_at = $3 \
         WHERE id = $1 AND {OPEN_GUARD}",
        kind.table()
    );
    let updated = sqlx::query(&sql)
        .bind(id)
        .bind(progress.clamp(0, 100))
        .bind(now)
        .execute(pool)
        .await?
        .rows_affected();
    Ok(updated == 1)
}

pub async fn mark_failed(
    pool: &PgPool,
    kind: TaskKind,
    id: Uuid,
    message: &str,
    now: DateTime<Utc>,
) -> Result<bool, sqlx::Error> {
    let sql = format!(
        "UPDATE {} SET status = 'failed', error_message = $2, updated_at = $3 \
         WHERE id = $1 AND {OPEN_GUARD}",
        kind.table()
    );
    let updated = sqlx::query(&sql)
        .bind(id)
        .bind(message)
        .bind(now)
        .execute(pool)
        .await?
        .rows_affected();
    if updated == 1 {
        info!("{} task {id} failed: {message}", kind.as_str());
    }
    Ok(updated == 1)
}

/// Resets a failed task to `pending` with a clean slate and no lease.
pub async fn reset_for_retry(
    pool: &PgPool,
    kind: TaskKind,
    id: Uuid,
    now: DateTime<Utc>,
) -> Result<(), AppError> {
    let sql = format!(
        "UPDATE {} SET status = 'pending', progress = 0, error_message = NULL, \
         dispatched_at = NULL, updated_at = $2 \
         WHERE id = $1 AND status = 'failed'",
        kind.table()
    );
    let updated = sqlx::query(&sql)
        .bind(id)
        .bind(now)
        .execute(pool)
        .await?
        .rows_affected();
    if updated == 0 {
        return Err(AppError::InvalidState(
            "only failed tasks can be retried".to_string(),
        ));
    }
    info!("{} task {id} reset for retry", kind.as_str());
    Ok(())
}

pub async fn delete(pool: &PgPool, kind: TaskKind, id: Uuid) -> Result<(), AppError> {
    let sql = format!("DELETE FROM {} WHERE id = $1", kind.table());
    let deleted = sqlx::query(&sql).bind(id).execute(pool).await?.rows_affected();
    if deleted == 0 {
        return Err(AppError::NotFound(format!("Task {id} not found")));
    }
    info!("{} task {id} deleted", kind.as_str());
    Ok(())
}

/// Pending rows older than the grace period whose lease is absent or stale.
pub async fn scan_pending(
    pool: &PgPool,
    kind: TaskKind,
    now: DateTime<Utc>,
    grace: std::time::Duration,
) -> Result<Vec<Uuid>, sqlx::Error> {
    let sql = format!(
        "SELECT id FROM {} \
         WHERE status = 'pending' AND created_at < $1 \
           AND (dispatched_at IS NULL OR dispatched_at < $1) \
         ORDER BY created_at \
         LIMIT $2",
        kind.table()
    );
    sqlx::query_scalar(&sql)
        .bind(grace_cutoff(now, grace))
        .bind(RESCAN_BATCH)
        .fetch_all(pool)
        .await
}

/// Re-enqueues orphaned pending tasks of every kind. Returns how many were
/// handed to the dispatcher.
pub async fn rescan(state: &AppState) -> Result<usize, AppError> {
    let now = state.clock.now();
    let grace = state.config.workers.dispatch_grace;
    let mut enqueued = 0;
    for kind in TaskKind::ALL {
        for id in scan_pending(&state.db, kind, now, grace).await? {
            if state.dispatcher.enqueue(Job { kind, id }) {
                enqueued += 1;
            }
        }
    }
    if enqueued > 0 {
        info!("Rescan re-enqueued {enqueued} pending task(s)");
    }
    Ok(enqueued)
}

#[async_trait]
impl JobHandler for AppState {
    async fn handle(&self, job: Job) {
        let now = self.clock.now();
        match claim(&self.db, job.kind, job.id, now, self.config.workers.dispatch_grace).await {
            Ok(true) => {}
            Ok(false) => {
                debug!("Task already claimed or no longer pending");
                return;
            }
            Err(e) => {
                error!("Failed to claim task: {e}");
                return;
            }
        }

        match job.kind {
            TaskKind::Asr => crate::asr::service::run_submission(self, job.id).await,
            TaskKind::PdfExport => crate::export::service::run_render(self, job.id).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::time::Duration;

    #[test]
    fn test_terminal_states() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Processing.is_terminal());
    }

    #[test]
    fn test_open_guard_covers_every_terminal_state() {
        for status in [TaskStatus::Completed, TaskStatus::Failed] {
            let literal = serde_json::to_value(status).unwrap();
            let literal = literal.as_str().unwrap();
            assert!(status.is_terminal());
            assert!(OPEN_GUARD.contains(&format!("'{literal}'")), "{literal}");
        }
    }

    #[test]
    fn test_retry_gate() {
        assert!(ensure_retryable(TaskStatus::Failed).is_ok());
        for status in [TaskStatus::Pending, TaskStatus::Processing, TaskStatus::Completed] {
            assert!(matches!(
                ensure_retryable(status),
                Err(AppError::InvalidState(_))
            ));
        }
    }

    #[test]
    fn test_grace_cutoff() {
        let now = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
        let cutoff = grace_cutoff(now, std::time::Duration::from_secs(90));
        assert_eq!(cutoff, Utc.with_ymd_and_hms(2025, 3, 1, 11, 58, 30).unwrap());
    }

    #[test]
    fn test_task_tables() {
        assert_eq!(TaskKind::Asr.table(), "asr_tasks");
        assert_eq!(TaskKind::PdfExport.table(), "pdf_export_tasks");
    }

    async fn insert_asr(pool: &PgPool, status: TaskStatus, now: DateTime<Utc>) -> Uuid {
        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO asr_tasks (id, user_id, status, audio_url, audio_format, created_at, updated_at) \
             VALUES ($1, $2, $3, 'https://cdn.example.com/a.mp3', 'mp3', $4, $4)",
        )
        .bind(id)
        .bind(Uuid::new_v4())
        .bind(status)
        .bind(now)
        .execute(pool)
        .await
        .unwrap();
        id
    }

    async fn status_of(pool: &PgPool, id: Uuid) -> (TaskStatus, Option<String>) {
        sqlx::query_as("SELECT status, error_message FROM asr_tasks WHERE id = $1")
            .bind(id)
            .fetch_one(pool)
            .await
            .unwrap()
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn test_terminal_rows_ignore_further_transitions(pool: PgPool) {
        let now = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
        for terminal in [TaskStatus::Completed, TaskStatus::Failed] {
            let id = insert_asr(&pool, terminal, now).await;

            assert!(!mark_processing(&pool, TaskKind::Asr, id, 50, now).await.unwrap());
            assert!(!mark_failed(&pool, TaskKind::Asr, id, "late failure", now).await.unwrap());
            assert!(!claim(&pool, TaskKind::Asr, id, now, Duration::from_secs(60)).await.unwrap());

            assert_eq!(status_of(&pool, id).await, (terminal, None));
        }
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn test_open_rows_move_forward_once(pool: PgPool) {
        let now = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
        let id = insert_asr(&pool, TaskStatus::Pending, now).await;

        assert!(mark_processing(&pool, TaskKind::Asr, id, 10, now).await.unwrap());
        assert!(mark_failed(&pool, TaskKind::Asr, id, "vendor said no", now).await.unwrap());
        assert!(!mark_failed(&pool, TaskKind::Asr, id, "second failure", now).await.unwrap());
        assert_eq!(
            status_of(&pool, id).await,
            (TaskStatus::Failed, Some("vendor said no".to_string()))
        );
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn test_claim_is_exclusive_until_the_lease_goes_stale(pool: PgPool) {
        let now = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
        let grace = Duration::from_secs(60);
        let id = insert_asr(&pool, TaskStatus::Pending, now).await;

        assert!(claim(&pool, TaskKind::Asr, id, now, grace).await.unwrap());
        assert!(!claim(&pool, TaskKind::Asr, id, now, grace).await.unwrap());

        let later = now + chrono::Duration::seconds(61);
        assert!(claim(&pool, TaskKind::Asr, id, later, grace).await.unwrap());
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn test_retry_only_resets_failed_rows(pool: PgPool) {
        let now = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
        let completed = insert_asr(&pool, TaskStatus::Completed, now).await;
        assert!(matches!(
            reset_for_retry(&pool, TaskKind::Asr, completed, now).await,
            Err(AppError::InvalidState(_))
        ));

        let failed = insert_asr(&pool, TaskStatus::Failed, now).await;
        reset_for_retry(&pool, TaskKind::Asr, failed, now).await.unwrap();
        assert_eq!(status_of(&pool, failed).await, (TaskStatus::Pending, None));
    }
}
