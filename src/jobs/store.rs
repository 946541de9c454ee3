//! Durable job queue over the `jobs` table.
//!
//! The store is stateless in-process; all coordination lives in the table.
//! Claiming uses `FOR UPDATE SKIP LOCKED` so any number of workers can pull
//! from the same queue, and an expired lease makes a `running` job claimable
//! again without operator help.

use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use super::payload::JobPayload;
use crate::db::models::DbJob;
use crate::error::IngestError;

const JOB_COLUMNS: &str =
    "id, org_id, kind, payload, run_at, status, attempts, max_attempts, \
     locked_by, locked_at, lock_expires_at, last_error, created_at";

/// Retry delay after the Nth attempt: 2^N seconds.
pub fn backoff_delay(attempts: i32) -> Duration {
    let shift = attempts.clamp(0, 30) as u32;
    Duration::from_secs(1u64 << shift)
}

#[derive(Clone)]
pub struct JobStore {
    pool: PgPool,
}

impl JobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert one queued job. `run_at` defaults to now.
    pub async fn enqueue(
        &self,
        org_id: Uuid,
        payload: &JobPayload,
        run_at: Option<DateTime<Utc>>,
    ) -> Result<i64, IngestError> {
        let id = sqlx::query_scalar::<_, i64>(
            "INSERT INTO jobs (org_id, kind, payload, run_at)
             VALUES ($1, $2, $3, COALESCE($4, now()))
             RETURNING id",
        )
        .bind(org_id)
        .bind(payload.kind().as_str())
        .bind(payload.to_value()?)
        .bind(run_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    /// Atomically claim up to `limit` due jobs for this worker.
    ///
    /// One SQL statement: due `queued` jobs and abandoned `running` jobs
    /// (expired lease) are locked with SKIP LOCKED, moved to `running`, and
    /// returned with `attempts` already incremented. Jobs that have consumed
    /// every attempt are left alone; `recover_stuck` fails them.
    pub async fn claim(
        &self,
        org_id: Uuid,
        worker_id: &str,
        limit: i64,
        lease: Duration,
    ) -> Result<Vec<DbJob>, IngestError> {
        let sql = format!(
            "UPDATE jobs
             SET status = 'running', locked_by = $2, locked_at = now(),
                 lock_expires_at = now() + make_interval(secs => $4),
                 attempts = attempts + 1
             WHERE id IN (
                 SELECT id FROM jobs
                 WHERE org_id = $1 AND run_at <= now() AND attempts < max_attempts
                   AND (status = 'queued'
                        OR (status = 'running' AND lock_expires_at < now()))
                 ORDER BY run_at ASC
                 LIMIT $3
                 FOR UPDATE SKIP LOCKED
             )
             RETURNING {JOB_COLUMNS}"
        );
        let mut jobs = sqlx::query_as::<_, DbJob>(&sql)
            .bind(org_id)
            .bind(worker_id)
            .bind(limit)
            .bind(lease.as_secs_f64())
            .fetch_all(&self.pool)
            .await?;
        // RETURNING does not preserve the subquery order.
        jobs.sort_by_key(|j| j.run_at);
        Ok(jobs)
    }

    /// Mark a running job as succeeded. Terminal statuses are absorbing, so
    /// a job reclaimed by another worker in the meantime is left alone.
    pub async fn complete(&self, id: i64) -> Result<(), IngestError> {
        sqlx::query(
            "UPDATE jobs
             SET status = 'succeeded', locked_by = NULL, locked_at = NULL,
                 lock_expires_at = NULL
             WHERE id = $1 AND status = 'running'",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Record a failure: requeue with exponential backoff, or transition to
    /// `failed` once the attempt budget is spent (leaving `run_at` as-is).
    pub async fn fail(&self, id: i64, error: &str) -> Result<(), IngestError> {
        let mut tx = self.pool.begin().await?;
        let row: Option<(i32, i32)> = sqlx::query_as(
            "SELECT attempts, max_attempts FROM jobs
             WHERE id = $1 AND status = 'running' FOR UPDATE",
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((attempts, max_attempts)) = row else {
            // Reclaimed or already terminal; nothing to record.
            tx.commit().await?;
            return Ok(());
        };

        if attempts >= max_attempts {
            sqlx::query(
                "UPDATE jobs
                 SET status = 'failed', last_error = $2, locked_by = NULL,
                     locked_at = NULL, lock_expires_at = NULL
                 WHERE id = $1",
            )
            .bind(id)
            .bind(error)
            .execute(&mut *tx)
            .await?;
        } else {
            sqlx::query(
                "UPDATE jobs
                 SET status = 'queued', run_at = now() + make_interval(secs => $3),
                     last_error = $2, locked_by = NULL, locked_at = NULL,
                     lock_expires_at = NULL
                 WHERE id = $1",
            )
            .bind(id)
            .bind(error)
            .bind(backoff_delay(attempts).as_secs_f64())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Fail a job immediately, skipping remaining attempts. Used for errors
    /// no retry can fix (constraint violations, undecodable payloads).
    pub async fn fail_fast(&self, id: i64, error: &str) -> Result<(), IngestError> {
        sqlx::query(
            "UPDATE jobs
             SET status = 'failed', last_error = $2, locked_by = NULL,
                 locked_at = NULL, lock_expires_at = NULL
             WHERE id = $1 AND status = 'running'",
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Cancel pending ingest jobs for a wallet. Used on unregistration.
    pub async fn cancel_wallet_jobs(
        &self,
        org_id: Uuid,
        wallet_id: i64,
    ) -> Result<u64, IngestError> {
        let result = sqlx::query(
            "UPDATE jobs
             SET status = 'canceled'
             WHERE org_id = $1 AND kind = 'ingest_wallet' AND status = 'queued'
               AND (payload ->> 'wallet_id')::bigint = $2",
        )
        .bind(org_id)
        .bind(wallet_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// One-shot recovery of `running` jobs with expired leases: requeue them,
    /// or fail those whose attempt budget is already spent. Normal operation
    /// relies on `claim`; this runs at worker startup and from the admin
    /// utility.
    pub async fn recover_stuck(&self, org_id: Uuid) -> Result<u64, IngestError> {
        let result = sqlx::query(
            "WITH expired AS (
                 SELECT id, attempts, max_attempts FROM jobs
                 WHERE org_id = $1 AND status = 'running' AND lock_expires_at < now()
                 FOR UPDATE SKIP LOCKED
             )
             UPDATE jobs j
             SET status = CASE WHEN e.attempts >= e.max_attempts
                               THEN 'failed' ELSE 'queued' END,
                 last_error = CASE WHEN e.attempts >= e.max_attempts
                                   THEN 'lease expired after final attempt'
                                   ELSE j.last_error END,
                 locked_by = NULL, locked_at = NULL, lock_expires_at = NULL
             FROM expired e
             WHERE j.id = e.id",
        )
        .bind(org_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Scheduler dedup: is there already a queued or running ingest job for
    /// this wallet?
    pub async fn has_pending_ingest(
        &self,
        org_id: Uuid,
        wallet_id: i64,
    ) -> Result<bool, IngestError> {
        let exists = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (
                 SELECT 1 FROM jobs
                 WHERE org_id = $1 AND kind = 'ingest_wallet'
                   AND status IN ('queued', 'running')
                   AND (payload ->> 'wallet_id')::bigint = $2
             )",
        )
        .bind(org_id)
        .bind(wallet_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    /// Job counts per status, for the monitor surface.
    pub async fn counts_by_status(&self, org_id: Uuid) -> Result<Vec<(String, i64)>, IngestError> {
        let rows = sqlx::query_as::<_, (String, i64)>(
            "SELECT status, COUNT(*) FROM jobs WHERE org_id = $1
             GROUP BY status ORDER BY status",
        )
        .bind(org_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Running jobs whose lease has already expired.
    pub async fn expired_running(&self, org_id: Uuid) -> Result<i64, IngestError> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM jobs
             WHERE org_id = $1 AND status = 'running' AND lock_expires_at < now()",
        )
        .bind(org_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_ladder_doubles_per_attempt() {
        let deltas: Vec<u64> = (1..=9).map(|n| backoff_delay(n).as_secs()).collect();
        assert_eq!(deltas, vec![2, 4, 8, 16, 32, 64, 128, 256, 512]);
    }

    #[test]
    fn backoff_shift_is_clamped() {
        assert_eq!(backoff_delay(0).as_secs(), 1);
        assert_eq!(backoff_delay(64).as_secs(), 1u64 << 30);
    }
}
