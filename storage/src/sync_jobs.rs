//! Postgres-backed durable job queue and sync record sink.
//!
//! Jobs live in `permission_sync_jobs`. Workers claim rows with
//! `FOR UPDATE SKIP LOCKED`, so any number of processes can poll the same
//! table without handing one job to two workers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use errors::StoreError;
use perms_sync::jobs::{
    CANCELLATION_REASON_HIGHER_PRIORITY, JobPriority, JobState, NewSyncJob, PermissionSyncJob,
    ResetStats, SyncJobQueue, SyncJobReason, SyncJobResult
};
use perms_sync::store::{StoreResult, SyncRecord, SyncRecordsStore};
use perms_sync::types::{ProviderStatusesSet, RequestType};
use sqlx::postgres::PgRow;
use sqlx::{AssertSqlSafe, Pool, Postgres, Row};
use std::time::Duration;
use tracing::{debug, info};

const BACKEND: &str = "postgres";

const STALLED_FAILURE_MESSAGE: &str = "job stalled too many times";

const CANCELLATION_REASON_SUPERSEDED: &str = "A newer job for the same entity is already queued.";

const JOB_COLUMNS: &str = "id, state, failure_message, reason, cancellation_reason, \
     triggered_by_user_id, queued_at, started_at, finished_at, process_after, num_resets, \
     num_failures, last_heartbeat_at, worker_hostname, cancel, repository_id, user_id, priority, \
     no_perms, invalidate_caches, permissions_added, permissions_removed, permissions_found, \
     code_host_states, is_partial_success";

fn query_err(e: impl std::fmt::Display) -> StoreError {
    StoreError::query(BACKEND, e)
}

fn serialization_err(e: &serde_json::Error) -> StoreError {
    StoreError::SerializationError {
        error_type: "json".to_string(),
        reason: e.to_string()
    }
}

/// Which entity column a job targets.
#[derive(Debug, Clone, Copy)]
enum JobTarget {
    User,
    Repo
}

impl JobTarget {
    fn column(self) -> &'static str {
        match self {
            Self::User => "user_id",
            Self::Repo => "repository_id"
        }
    }
}

pub struct PgSyncJobStore {
    pool: Pool<Postgres>
}

impl PgSyncJobStore {
    pub async fn new(connection_url: &str) -> StoreResult<Self> {
        let pool = Pool::connect(connection_url)
            .await
            .map_err(|e| StoreError::ConnectionError {
                backend: BACKEND.to_string(),
                reason: e.to_string()
            })?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Pool<Postgres> {
        &self.pool
    }

    pub async fn initialize_schema(&self) -> StoreResult<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS permission_sync_jobs (
                id BIGSERIAL PRIMARY KEY,
                state TEXT NOT NULL DEFAULT 'queued',
                failure_message TEXT,
                reason TEXT,
                cancellation_reason TEXT,
                triggered_by_user_id INTEGER,
                queued_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                started_at TIMESTAMPTZ,
                finished_at TIMESTAMPTZ,
                process_after TIMESTAMPTZ,
                num_resets INTEGER NOT NULL DEFAULT 0,
                num_failures INTEGER NOT NULL DEFAULT 0,
                last_heartbeat_at TIMESTAMPTZ,
                worker_hostname TEXT NOT NULL DEFAULT '',
                cancel BOOLEAN NOT NULL DEFAULT FALSE,
                repository_id INTEGER,
                user_id INTEGER,
                priority INTEGER NOT NULL DEFAULT 0,
                no_perms BOOLEAN NOT NULL DEFAULT FALSE,
                invalidate_caches BOOLEAN NOT NULL DEFAULT FALSE,
                permissions_added INTEGER NOT NULL DEFAULT 0,
                permissions_removed INTEGER NOT NULL DEFAULT 0,
                permissions_found INTEGER NOT NULL DEFAULT 0,
                code_host_states JSONB NOT NULL DEFAULT '[]',
                is_partial_success BOOLEAN NOT NULL DEFAULT FALSE,
                CONSTRAINT permission_sync_jobs_for_user_xor_repository
                    CHECK ((user_id IS NULL) <> (repository_id IS NULL))
            )"
        )
        .execute(&self.pool)
        .await
        .map_err(query_err)?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_permission_sync_jobs_state \
             ON permission_sync_jobs(state)"
        )
        .execute(&self.pool)
        .await
        .map_err(query_err)?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_permission_sync_jobs_user_id \
             ON permission_sync_jobs(user_id)"
        )
        .execute(&self.pool)
        .await
        .map_err(query_err)?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_permission_sync_jobs_repository_id \
             ON permission_sync_jobs(repository_id)"
        )
        .execute(&self.pool)
        .await
        .map_err(query_err)?;

        // At most one immediate queued job per entity. Concurrent creates
        // race on these instead of on the duplicate lookup.
        for column in [JobTarget::User.column(), JobTarget::Repo.column()] {
            let sql = format!(
                "CREATE UNIQUE INDEX IF NOT EXISTS idx_permission_sync_jobs_queued_{0} \
                 ON permission_sync_jobs({0}) \
                 WHERE state = 'queued' AND process_after IS NULL AND NOT cancel",
                column
            );
            sqlx::query(AssertSqlSafe(sql.as_str()))
                .execute(&self.pool)
                .await
                .map_err(query_err)?;
        }

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS permission_sync_records (
                id BIGSERIAL PRIMARY KEY,
                request_type TEXT NOT NULL,
                entity_id INTEGER NOT NULL,
                priority TEXT NOT NULL,
                no_perms BOOLEAN NOT NULL,
                invalidate_caches BOOLEAN NOT NULL,
                started_at TIMESTAMPTZ NOT NULL,
                finished_at TIMESTAMPTZ NOT NULL,
                permissions_added INTEGER,
                permissions_removed INTEGER,
                permissions_found INTEGER,
                provider_states JSONB NOT NULL DEFAULT '[]',
                failure_message TEXT
            )"
        )
        .execute(&self.pool)
        .await
        .map_err(query_err)?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_permission_sync_records_entity \
             ON permission_sync_records(request_type, entity_id, finished_at DESC)"
        )
        .execute(&self.pool)
        .await
        .map_err(query_err)?;

        info!("Permission sync job schema initialized");
        Ok(())
    }

    pub async fn get(&self, job_id: i64) -> StoreResult<Option<PermissionSyncJob>> {
        let sql = format!("SELECT {} FROM permission_sync_jobs WHERE id = $1", JOB_COLUMNS);
        let row = sqlx::query(AssertSqlSafe(sql.as_str()))
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(query_err)?;

        row.as_ref().map(job_from_row).transpose()
    }

    /// Inserts a job unless an equal or higher priority immediate job for
    /// the same entity is already queued. A lower priority one is canceled.
    async fn create(&self, target: JobTarget, entity_id: i32, job: &NewSyncJob) -> StoreResult<Option<i64>> {
        let column = target.column();
        let priority = job.priority.as_i32();
        let mut tx = self.pool.begin().await.map_err(query_err)?;

        // Delayed jobs are never deduplicated.
        if job.process_after.is_none() {
            let sql = format!(
                "SELECT id, priority FROM permission_sync_jobs \
                 WHERE {} = $1 AND state = 'queued' AND process_after IS NULL AND NOT cancel \
                 ORDER BY priority DESC LIMIT 1 FOR UPDATE",
                column
            );
            let existing: Option<(i64, i32)> = sqlx::query_as(AssertSqlSafe(sql.as_str()))
                .bind(entity_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(query_err)?;

            if let Some((existing_id, existing_priority)) = existing {
                if existing_priority >= priority {
                    debug!(
                        entity = column,
                        entity_id,
                        existing_id,
                        "Queued job with equal or higher priority exists, skipping"
                    );
                    tx.rollback().await.map_err(query_err)?;
                    return Ok(None);
                }

                sqlx::query(
                    "UPDATE permission_sync_jobs \
                     SET cancel = TRUE, state = 'canceled', cancellation_reason = $2, \
                         finished_at = NOW() \
                     WHERE id = $1"
                )
                .bind(existing_id)
                .bind(CANCELLATION_REASON_HIGHER_PRIORITY)
                .execute(&mut *tx)
                .await
                .map_err(query_err)?;
            }
        }

        let sql = format!(
            "INSERT INTO permission_sync_jobs \
             ({}, reason, priority, triggered_by_user_id, process_after, no_perms, invalidate_caches) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             ON CONFLICT DO NOTHING \
             RETURNING id",
            column
        );
        let inserted: Option<(i64,)> = sqlx::query_as(AssertSqlSafe(sql.as_str()))
            .bind(entity_id)
            .bind(job.reason.map(|r| r.as_str()))
            .bind(priority)
            .bind(job.triggered_by_user_id)
            .bind(job.process_after)
            .bind(job.no_perms)
            .bind(job.invalidate_caches)
            .fetch_optional(&mut *tx)
            .await
            .map_err(query_err)?;

        let Some((id,)) = inserted else {
            debug!(
                entity = column,
                entity_id,
                "Concurrent job for the same entity was queued first, skipping"
            );
            tx.rollback().await.map_err(query_err)?;
            return Ok(None);
        };

        tx.commit().await.map_err(query_err)?;
        Ok(Some(id))
    }
}

fn job_from_row(row: &PgRow) -> StoreResult<PermissionSyncJob> {
    let state: String = row.try_get("state").map_err(query_err)?;
    let state = JobState::parse(&state)
        .ok_or_else(|| query_err(format!("unknown job state {:?}", state)))?;
    let reason: Option<String> = row.try_get("reason").map_err(query_err)?;
    let states: serde_json::Value = row.try_get("code_host_states").map_err(query_err)?;
    let code_host_states: ProviderStatusesSet =
        serde_json::from_value(states).map_err(|e| serialization_err(&e))?;

    Ok(PermissionSyncJob {
        id: row.try_get("id").map_err(query_err)?,
        state,
        failure_message: row.try_get("failure_message").map_err(query_err)?,
        reason: reason.as_deref().and_then(SyncJobReason::parse),
        cancellation_reason: row.try_get("cancellation_reason").map_err(query_err)?,
        triggered_by_user_id: row.try_get("triggered_by_user_id").map_err(query_err)?,
        queued_at: row.try_get("queued_at").map_err(query_err)?,
        started_at: row.try_get("started_at").map_err(query_err)?,
        finished_at: row.try_get("finished_at").map_err(query_err)?,
        process_after: row.try_get("process_after").map_err(query_err)?,
        num_resets: row.try_get("num_resets").map_err(query_err)?,
        num_failures: row.try_get("num_failures").map_err(query_err)?,
        last_heartbeat_at: row.try_get("last_heartbeat_at").map_err(query_err)?,
        worker_hostname: row.try_get("worker_hostname").map_err(query_err)?,
        cancel: row.try_get("cancel").map_err(query_err)?,
        repository_id: row.try_get("repository_id").map_err(query_err)?,
        user_id: row.try_get("user_id").map_err(query_err)?,
        priority: JobPriority::from_i32(row.try_get("priority").map_err(query_err)?),
        no_perms: row.try_get("no_perms").map_err(query_err)?,
        invalidate_caches: row.try_get("invalidate_caches").map_err(query_err)?,
        permissions_added: row.try_get("permissions_added").map_err(query_err)?,
        permissions_removed: row.try_get("permissions_removed").map_err(query_err)?,
        permissions_found: row.try_get("permissions_found").map_err(query_err)?,
        code_host_states,
        is_partial_success: row.try_get("is_partial_success").map_err(query_err)?
    })
}

fn states_json(states: &ProviderStatusesSet) -> StoreResult<serde_json::Value> {
    serde_json::to_value(states).map_err(|e| serialization_err(&e))
}

#[async_trait]
impl SyncJobQueue for PgSyncJobStore {
    async fn create_user_sync_job(&self, user_id: i32, job: &NewSyncJob) -> StoreResult<Option<i64>> {
        self.create(JobTarget::User, user_id, job).await
    }

    async fn create_repo_sync_job(&self, repo_id: i32, job: &NewSyncJob) -> StoreResult<Option<i64>> {
        self.create(JobTarget::Repo, repo_id, job).await
    }

    async fn dequeue(&self, worker_hostname: &str) -> StoreResult<Option<PermissionSyncJob>> {
        let sql = format!(
            "UPDATE permission_sync_jobs \
             SET state = 'processing', started_at = NOW(), last_heartbeat_at = NOW(), \
                 finished_at = NULL, worker_hostname = $1 \
             WHERE id = ( \
                 SELECT id FROM permission_sync_jobs \
                 WHERE state IN ('queued', 'errored') AND NOT cancel \
                   AND (process_after IS NULL OR process_after <= NOW()) \
                 ORDER BY priority DESC, (user_id IS NULL) ASC, queued_at ASC, id ASC \
                 LIMIT 1 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             RETURNING {}",
            JOB_COLUMNS
        );
        let row = sqlx::query(AssertSqlSafe(sql.as_str()))
            .bind(worker_hostname)
            .fetch_optional(&self.pool)
            .await
            .map_err(query_err)?;

        row.as_ref().map(job_from_row).transpose()
    }

    async fn heartbeat(&self, job_ids: &[i64]) -> StoreResult<()> {
        if job_ids.is_empty() {
            return Ok(());
        }
        sqlx::query(
            "UPDATE permission_sync_jobs SET last_heartbeat_at = NOW() \
             WHERE id = ANY($1) AND state = 'processing'"
        )
        .bind(job_ids)
        .execute(&self.pool)
        .await
        .map_err(query_err)?;
        Ok(())
    }

    async fn mark_completed(&self, job_id: i64, result: &SyncJobResult) -> StoreResult<()> {
        sqlx::query(
            "UPDATE permission_sync_jobs \
             SET state = 'completed', finished_at = NOW(), permissions_added = $2, \
                 permissions_removed = $3, permissions_found = $4, code_host_states = $5, \
                 is_partial_success = $6 \
             WHERE id = $1"
        )
        .bind(job_id)
        .bind(result.result.added as i32)
        .bind(result.result.removed as i32)
        .bind(result.result.found as i32)
        .bind(states_json(&result.provider_states)?)
        .bind(result.partial_success)
        .execute(&self.pool)
        .await
        .map_err(query_err)?;
        Ok(())
    }

    async fn mark_errored(
        &self,
        job_id: i64,
        failure_message: &str,
        provider_states: &ProviderStatusesSet,
        max_num_failures: i32
    ) -> StoreResult<JobState> {
        let row = sqlx::query(
            "UPDATE permission_sync_jobs \
             SET num_failures = num_failures + 1, failure_message = $2, code_host_states = $3, \
                 finished_at = NOW(), \
                 state = CASE WHEN num_failures + 1 >= $4 THEN 'failed' ELSE 'errored' END \
             WHERE id = $1 \
             RETURNING state"
        )
        .bind(job_id)
        .bind(failure_message)
        .bind(states_json(provider_states)?)
        .bind(max_num_failures)
        .fetch_optional(&self.pool)
        .await
        .map_err(query_err)?;

        let Some(row) = row else {
            return Err(StoreError::NotFound {
                backend: BACKEND.to_string(),
                id: job_id.to_string()
            });
        };
        let state: String = row.try_get("state").map_err(query_err)?;
        JobState::parse(&state).ok_or_else(|| query_err(format!("unknown job state {:?}", state)))
    }

    async fn reset_stalled(&self, stalled_after: Duration, max_num_resets: i32) -> StoreResult<ResetStats> {
        let seconds = stalled_after.as_secs_f64();
        let mut tx = self.pool.begin().await.map_err(query_err)?;

        let failed = sqlx::query(
            "UPDATE permission_sync_jobs \
             SET state = 'failed', finished_at = NOW(), failure_message = $3 \
             WHERE state = 'processing' \
               AND last_heartbeat_at < NOW() - make_interval(secs => $1) \
               AND num_resets >= $2"
        )
        .bind(seconds)
        .bind(max_num_resets)
        .bind(STALLED_FAILURE_MESSAGE)
        .execute(&mut *tx)
        .await
        .map_err(query_err)?
        .rows_affected();

        // A stalled job whose entity already has a fresh queued job can't be
        // requeued without breaking the one-queued-job rule.
        let superseded = sqlx::query(
            "UPDATE permission_sync_jobs j \
             SET state = 'canceled', cancel = TRUE, cancellation_reason = $3, finished_at = NOW() \
             WHERE j.state = 'processing' \
               AND j.last_heartbeat_at < NOW() - make_interval(secs => $1) \
               AND j.num_resets < $2 \
               AND j.process_after IS NULL \
               AND EXISTS ( \
                   SELECT 1 FROM permission_sync_jobs q \
                   WHERE q.state = 'queued' AND q.process_after IS NULL AND NOT q.cancel \
                     AND (q.user_id = j.user_id OR q.repository_id = j.repository_id) \
               )"
        )
        .bind(seconds)
        .bind(max_num_resets)
        .bind(CANCELLATION_REASON_SUPERSEDED)
        .execute(&mut *tx)
        .await
        .map_err(query_err)?
        .rows_affected();
        if superseded > 0 {
            debug!(superseded, "Canceled stalled jobs already queued again");
        }

        let reset = sqlx::query(
            "UPDATE permission_sync_jobs \
             SET state = 'queued', num_resets = num_resets + 1, started_at = NULL, \
                 last_heartbeat_at = NULL, worker_hostname = '' \
             WHERE state = 'processing' \
               AND last_heartbeat_at < NOW() - make_interval(secs => $1) \
               AND num_resets < $2"
        )
        .bind(seconds)
        .bind(max_num_resets)
        .execute(&mut *tx)
        .await
        .map_err(query_err)?
        .rows_affected();

        tx.commit().await.map_err(query_err)?;
        Ok(ResetStats { reset, failed })
    }

    async fn cancel(&self, job_id: i64, reason: &str) -> StoreResult<bool> {
        let affected = sqlx::query(
            "UPDATE permission_sync_jobs \
             SET cancel = TRUE, state = 'canceled', cancellation_reason = $2, finished_at = NOW() \
             WHERE id = $1 AND state IN ('queued', 'errored')"
        )
        .bind(job_id)
        .bind(reason)
        .execute(&self.pool)
        .await
        .map_err(query_err)?
        .rows_affected();
        Ok(affected > 0)
    }
}

#[async_trait]
impl SyncRecordsStore for PgSyncJobStore {
    async fn record(&self, record: &SyncRecord) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO permission_sync_records \
             (request_type, entity_id, priority, no_perms, invalidate_caches, started_at, \
              finished_at, permissions_added, permissions_removed, permissions_found, \
              provider_states, failure_message) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)"
        )
        .bind(record.request_type.as_str())
        .bind(record.id)
        .bind(record.priority.as_str())
        .bind(record.no_perms)
        .bind(record.invalidate_caches)
        .bind(record.started_at)
        .bind(record.finished_at)
        .bind(record.result.map(|r| r.added as i32))
        .bind(record.result.map(|r| r.removed as i32))
        .bind(record.result.map(|r| r.found as i32))
        .bind(states_json(&record.provider_states)?)
        .bind(record.failure_message.as_deref())
        .execute(&self.pool)
        .await
        .map_err(query_err)?;
        Ok(())
    }

    async fn latest_finished_sync(
        &self,
        request_type: RequestType,
        id: i32
    ) -> StoreResult<Option<DateTime<Utc>>> {
        let (latest,): (Option<DateTime<Utc>>,) = sqlx::query_as(
            "SELECT MAX(finished_at) FROM permission_sync_records \
             WHERE request_type = $1 AND entity_id = $2 AND failure_message IS NULL"
        )
        .bind(request_type.as_str())
        .bind(id)
        .fetch_one(&self.pool)
        .await
        .map_err(query_err)?;
        Ok(latest)
    }
}
