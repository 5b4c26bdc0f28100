#[cfg(test)]
mod tests;

use super::models::{
    EmbeddingRecord, IndexJob, NewEmbedding, NewIndexJob, NewUsageRecord, UsageOperation,
    UsageRecord, encode_vector,
};
use crate::content::ContentType;
use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use serde::Serialize;
use sqlx::SqlitePool;

const EMBEDDING_COLUMNS: &str = "id, tenant_id, content_type, content_id, content_text, \
     metadata, vector, dimension, model, created_at, updated_at, deleted_at";

const JOB_COLUMNS: &str = "id, job_id, batch_id, tenant_id, operation, content_type, \
     content_id, payload, status, attempts, error_message, run_after, created_at, \
     updated_at, completed_at";

const USAGE_COLUMNS: &str = "id, tenant_id, operation, content_type, token_count, \
     api_calls, duration_ms, success, error_message, created_at";

pub struct EmbeddingQueries;

impl EmbeddingQueries {
    /// Insert or replace the active embedding for a `(tenant, type, id)` key.
    ///
    /// An existing active row is updated in place so `created_at` survives
    /// re-indexing; only a genuinely new key inserts. Soft-deleted rows are
    /// never resurrected, so the partial unique index on active keys holds.
    #[inline]
    pub async fn upsert(
        pool: &SqlitePool,
        new: &NewEmbedding,
        now: NaiveDateTime,
    ) -> Result<EmbeddingRecord> {
        let metadata =
            serde_json::to_string(&new.metadata).context("Failed to serialize metadata")?;
        let vector = encode_vector(&new.vector);
        let dimension = i64::try_from(new.vector.len()).context("Vector dimension overflow")?;

        let mut transaction = pool
            .begin()
            .await
            .context("Failed to begin upsert transaction")?;

        let updated = sqlx::query(
            r"
            UPDATE embeddings
            SET content_text = ?, metadata = ?, vector = ?, dimension = ?,
                model = ?, updated_at = ?
            WHERE tenant_id = ? AND content_type = ? AND content_id = ?
              AND deleted_at IS NULL
            ",
        )
        .bind(&new.content_text)
        .bind(&metadata)
        .bind(&vector)
        .bind(dimension)
        .bind(&new.model)
        .bind(now)
        .bind(&new.tenant_id)
        .bind(new.content_type)
        .bind(&new.content_id)
        .execute(&mut *transaction)
        .await
        .context("Failed to update active embedding")?
        .rows_affected();

        if updated == 0 {
            sqlx::query(
                r"
                INSERT INTO embeddings (tenant_id, content_type, content_id, content_text,
                                        metadata, vector, dimension, model, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ",
            )
            .bind(&new.tenant_id)
            .bind(new.content_type)
            .bind(&new.content_id)
            .bind(&new.content_text)
            .bind(&metadata)
            .bind(&vector)
            .bind(dimension)
            .bind(&new.model)
            .bind(now)
            .bind(now)
            .execute(&mut *transaction)
            .await
            .context("Failed to insert embedding")?;
        }

        transaction
            .commit()
            .await
            .context("Failed to commit upsert transaction")?;

        Self::get_active(pool, &new.tenant_id, new.content_type, &new.content_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("Failed to retrieve upserted embedding"))
    }

    #[inline]
    pub async fn get_active(
        pool: &SqlitePool,
        tenant_id: &str,
        content_type: ContentType,
        content_id: &str,
    ) -> Result<Option<EmbeddingRecord>> {
        let result = sqlx::query_as::<_, EmbeddingRecord>(&format!(
            r"
            SELECT {EMBEDDING_COLUMNS}
            FROM embeddings
            WHERE tenant_id = ? AND content_type = ? AND content_id = ?
              AND deleted_at IS NULL
            ",
        ))
        .bind(tenant_id)
        .bind(content_type)
        .bind(content_id)
        .fetch_optional(pool)
        .await
        .context("Failed to get active embedding")?;

        Ok(result)
    }

    #[inline]
    pub async fn list_active(
        pool: &SqlitePool,
        tenant_id: &str,
        content_type: Option<ContentType>,
    ) -> Result<Vec<EmbeddingRecord>> {
        let records = match content_type {
            Some(content_type) => {
                sqlx::query_as::<_, EmbeddingRecord>(&format!(
                    r"
                    SELECT {EMBEDDING_COLUMNS}
                    FROM embeddings
                    WHERE tenant_id = ? AND content_type = ? AND deleted_at IS NULL
                    ORDER BY updated_at DESC, id DESC
                    ",
                ))
                .bind(tenant_id)
                .bind(content_type)
                .fetch_all(pool)
                .await
            }
            None => {
                sqlx::query_as::<_, EmbeddingRecord>(&format!(
                    r"
                    SELECT {EMBEDDING_COLUMNS}
                    FROM embeddings
                    WHERE tenant_id = ? AND deleted_at IS NULL
                    ORDER BY updated_at DESC, id DESC
                    ",
                ))
                .bind(tenant_id)
                .fetch_all(pool)
                .await
            }
        }
        .context("Failed to list active embeddings")?;

        Ok(records)
    }

    /// Returns whether an active row existed. Deleting an absent or already
    /// deleted key is not an error.
    #[inline]
    pub async fn soft_delete(
        pool: &SqlitePool,
        tenant_id: &str,
        content_type: ContentType,
        content_id: &str,
        now: NaiveDateTime,
    ) -> Result<bool> {
        let result = sqlx::query(
            r"
            UPDATE embeddings
            SET deleted_at = ?, updated_at = ?
            WHERE tenant_id = ? AND content_type = ? AND content_id = ?
              AND deleted_at IS NULL
            ",
        )
        .bind(now)
        .bind(now)
        .bind(tenant_id)
        .bind(content_type)
        .bind(content_id)
        .execute(pool)
        .await
        .context("Failed to soft delete embedding")?;

        Ok(result.rows_affected() > 0)
    }

    #[inline]
    pub async fn count_active(
        pool: &SqlitePool,
        tenant_id: &str,
        content_type: Option<ContentType>,
    ) -> Result<i64> {
        let count = match content_type {
            Some(content_type) => {
                sqlx::query_scalar::<_, i64>(
                    r"
                    SELECT COUNT(*)
                    FROM embeddings
                    WHERE tenant_id = ? AND content_type = ? AND deleted_at IS NULL
                    ",
                )
                .bind(tenant_id)
                .bind(content_type)
                .fetch_one(pool)
                .await
            }
            None => {
                sqlx::query_scalar::<_, i64>(
                    "SELECT COUNT(*) FROM embeddings WHERE tenant_id = ? AND deleted_at IS NULL",
                )
                .bind(tenant_id)
                .fetch_one(pool)
                .await
            }
        }
        .context("Failed to count active embeddings")?;

        Ok(count)
    }

    #[inline]
    pub async fn count_active_all(pool: &SqlitePool) -> Result<i64> {
        let count =
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM embeddings WHERE deleted_at IS NULL")
                .fetch_one(pool)
                .await
                .context("Failed to count active embeddings across tenants")?;

        Ok(count)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub total: i64,
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
}

pub struct JobQueries;

impl JobQueries {
    #[inline]
    pub async fn enqueue(
        pool: &SqlitePool,
        new: &NewIndexJob,
        now: NaiveDateTime,
    ) -> Result<IndexJob> {
        sqlx::query(
            r"
            INSERT INTO index_jobs (job_id, batch_id, tenant_id, operation, content_type,
                                    content_id, payload, status, attempts, run_after,
                                    created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, 'pending', 0, ?, ?, ?)
            ",
        )
        .bind(&new.job_id)
        .bind(&new.batch_id)
        .bind(&new.tenant_id)
        .bind(new.operation)
        .bind(new.content_type)
        .bind(&new.content_id)
        .bind(&new.payload)
        .bind(now)
        .bind(now)
        .bind(now)
        .execute(pool)
        .await
        .context("Failed to enqueue index job")?;

        Self::get_by_job_id(pool, &new.job_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("Failed to retrieve enqueued job"))
    }

    #[inline]
    pub async fn enqueue_batch(
        pool: &SqlitePool,
        jobs: &[NewIndexJob],
        now: NaiveDateTime,
    ) -> Result<usize> {
        if jobs.is_empty() {
            return Ok(0);
        }

        let mut transaction = pool
            .begin()
            .await
            .context("Failed to begin transaction for batch enqueue")?;

        for job in jobs {
            sqlx::query(
                r"
                INSERT INTO index_jobs (job_id, batch_id, tenant_id, operation, content_type,
                                        content_id, payload, status, attempts, run_after,
                                        created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, 'pending', 0, ?, ?, ?)
                ",
            )
            .bind(&job.job_id)
            .bind(&job.batch_id)
            .bind(&job.tenant_id)
            .bind(job.operation)
            .bind(job.content_type)
            .bind(&job.content_id)
            .bind(&job.payload)
            .bind(now)
            .bind(now)
            .bind(now)
            .execute(&mut *transaction)
            .await
            .context("Failed to enqueue job in batch")?;
        }

        transaction
            .commit()
            .await
            .context("Failed to commit batch enqueue transaction")?;

        Ok(jobs.len())
    }

    #[inline]
    pub async fn get_by_job_id(pool: &SqlitePool, job_id: &str) -> Result<Option<IndexJob>> {
        let result = sqlx::query_as::<_, IndexJob>(&format!(
            "SELECT {JOB_COLUMNS} FROM index_jobs WHERE job_id = ?",
        ))
        .bind(job_id)
        .fetch_optional(pool)
        .await
        .context("Failed to get job by job id")?;

        Ok(result)
    }

    #[inline]
    pub async fn list_by_batch(pool: &SqlitePool, batch_id: &str) -> Result<Vec<IndexJob>> {
        let jobs = sqlx::query_as::<_, IndexJob>(&format!(
            "SELECT {JOB_COLUMNS} FROM index_jobs WHERE batch_id = ? ORDER BY id ASC",
        ))
        .bind(batch_id)
        .fetch_all(pool)
        .await
        .context("Failed to list jobs by batch")?;

        Ok(jobs)
    }

    /// Jobs eligible to run now, in enqueue order.
    ///
    /// A job is held back while any same-key job is processing or an older
    /// same-key job is still pending, so writes for one content key are
    /// serialized in enqueue order across workers.
    #[inline]
    pub async fn find_claimable(
        pool: &SqlitePool,
        now: NaiveDateTime,
        limit: i64,
    ) -> Result<Vec<IndexJob>> {
        let jobs = sqlx::query_as::<_, IndexJob>(&format!(
            r"
            SELECT {JOB_COLUMNS}
            FROM index_jobs AS job
            WHERE job.status = 'pending'
              AND job.run_after <= ?
              AND NOT EXISTS (
                  SELECT 1
                  FROM index_jobs AS other
                  WHERE other.tenant_id = job.tenant_id
                    AND other.content_type = job.content_type
                    AND other.content_id = job.content_id
                    AND (other.status = 'processing'
                         OR (other.status = 'pending' AND other.id < job.id))
              )
            ORDER BY job.id ASC
            LIMIT ?
            ",
        ))
        .bind(now)
        .bind(limit)
        .fetch_all(pool)
        .await
        .context("Failed to find claimable jobs")?;

        Ok(jobs)
    }

    /// Claim a pending job for processing, incrementing its attempt count.
    /// Returns false when another worker claimed it first.
    #[inline]
    pub async fn try_claim(pool: &SqlitePool, id: i64, now: NaiveDateTime) -> Result<bool> {
        let result = sqlx::query(
            r"
            UPDATE index_jobs
            SET status = 'processing', attempts = attempts + 1, updated_at = ?
            WHERE id = ? AND status = 'pending'
            ",
        )
        .bind(now)
        .bind(id)
        .execute(pool)
        .await
        .context("Failed to claim job")?;

        Ok(result.rows_affected() == 1)
    }

    #[inline]
    pub async fn mark_completed(pool: &SqlitePool, id: i64, now: NaiveDateTime) -> Result<()> {
        sqlx::query(
            r"
            UPDATE index_jobs
            SET status = 'completed', error_message = NULL, updated_at = ?, completed_at = ?
            WHERE id = ?
            ",
        )
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(pool)
        .await
        .context("Failed to mark job completed")?;

        Ok(())
    }

    #[inline]
    pub async fn mark_failed(
        pool: &SqlitePool,
        id: i64,
        error: &str,
        now: NaiveDateTime,
    ) -> Result<()> {
        sqlx::query(
            r"
            UPDATE index_jobs
            SET status = 'failed', error_message = ?, updated_at = ?, completed_at = ?
            WHERE id = ?
            ",
        )
        .bind(error)
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(pool)
        .await
        .context("Failed to mark job failed")?;

        Ok(())
    }

    /// Return a failed attempt to the queue with a deferred `run_after`.
    #[inline]
    pub async fn schedule_retry(
        pool: &SqlitePool,
        id: i64,
        error: &str,
        run_after: NaiveDateTime,
        now: NaiveDateTime,
    ) -> Result<()> {
        sqlx::query(
            r"
            UPDATE index_jobs
            SET status = 'pending', error_message = ?, run_after = ?, updated_at = ?
            WHERE id = ?
            ",
        )
        .bind(error)
        .bind(run_after)
        .bind(now)
        .bind(id)
        .execute(pool)
        .await
        .context("Failed to schedule job retry")?;

        Ok(())
    }

    /// Requeue processing jobs whose worker stopped heartbeating before
    /// `cutoff`. Delivery is at-least-once, so a rescued job may re-run.
    #[inline]
    pub async fn reset_stuck(
        pool: &SqlitePool,
        cutoff: NaiveDateTime,
        now: NaiveDateTime,
    ) -> Result<u64> {
        let result = sqlx::query(
            r"
            UPDATE index_jobs
            SET status = 'pending', run_after = ?, updated_at = ?
            WHERE status = 'processing' AND updated_at < ?
            ",
        )
        .bind(now)
        .bind(now)
        .bind(cutoff)
        .execute(pool)
        .await
        .context("Failed to reset stuck jobs")?;

        Ok(result.rows_affected())
    }

    /// Requeue failed jobs with a fresh attempt budget.
    #[inline]
    pub async fn retry_failed(
        pool: &SqlitePool,
        tenant_id: Option<&str>,
        now: NaiveDateTime,
    ) -> Result<u64> {
        let result = match tenant_id {
            Some(tenant_id) => {
                sqlx::query(
                    r"
                    UPDATE index_jobs
                    SET status = 'pending', attempts = 0, error_message = NULL,
                        run_after = ?, updated_at = ?, completed_at = NULL
                    WHERE status = 'failed' AND tenant_id = ?
                    ",
                )
                .bind(now)
                .bind(now)
                .bind(tenant_id)
                .execute(pool)
                .await
            }
            None => {
                sqlx::query(
                    r"
                    UPDATE index_jobs
                    SET status = 'pending', attempts = 0, error_message = NULL,
                        run_after = ?, updated_at = ?, completed_at = NULL
                    WHERE status = 'failed'
                    ",
                )
                .bind(now)
                .bind(now)
                .execute(pool)
                .await
            }
        }
        .context("Failed to retry failed jobs")?;

        Ok(result.rows_affected())
    }

    /// Purge terminal jobs, completed and failed alike, finished before
    /// `cutoff`.
    #[inline]
    pub async fn cleanup_completed(pool: &SqlitePool, cutoff: NaiveDateTime) -> Result<u64> {
        let result = sqlx::query(
            r"
            DELETE FROM index_jobs
            WHERE status IN ('completed', 'failed')
              AND completed_at IS NOT NULL
              AND completed_at < ?
            ",
        )
        .bind(cutoff)
        .execute(pool)
        .await
        .context("Failed to clean up completed jobs")?;

        Ok(result.rows_affected())
    }

    #[inline]
    pub async fn get_stats(pool: &SqlitePool) -> Result<QueueStats> {
        let stats = sqlx::query_as::<_, QueueStats>(
            r"
            SELECT
                COUNT(*) AS total,
                COALESCE(SUM(CASE WHEN status = 'pending' THEN 1 ELSE 0 END), 0) AS pending,
                COALESCE(SUM(CASE WHEN status = 'processing' THEN 1 ELSE 0 END), 0) AS processing,
                COALESCE(SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END), 0) AS completed,
                COALESCE(SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END), 0) AS failed
            FROM index_jobs
            ",
        )
        .fetch_one(pool)
        .await
        .context("Failed to get queue statistics")?;

        Ok(stats)
    }

    /// Enqueue time of the oldest job still waiting, for queue monitoring.
    #[inline]
    pub async fn oldest_pending(pool: &SqlitePool) -> Result<Option<NaiveDateTime>> {
        let created_at = sqlx::query_scalar::<_, NaiveDateTime>(
            r"
            SELECT created_at
            FROM index_jobs
            WHERE status = 'pending'
            ORDER BY created_at ASC
            LIMIT 1
            ",
        )
        .fetch_optional(pool)
        .await
        .context("Failed to read oldest pending job")?;

        Ok(created_at)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, sqlx::FromRow)]
pub struct UsageTotalsRow {
    pub total_operations: i64,
    pub successful_operations: i64,
    pub total_tokens: i64,
    pub total_api_calls: i64,
    pub avg_duration_ms: f64,
}

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct OperationUsageRow {
    pub operation: UsageOperation,
    pub operations: i64,
    pub successful: i64,
    pub tokens: i64,
    pub api_calls: i64,
}

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct ContentTypeUsageRow {
    pub content_type: ContentType,
    pub operations: i64,
    pub tokens: i64,
}

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct UsageTrendRow {
    pub bucket: String,
    pub operations: i64,
    pub successful: i64,
    pub tokens: i64,
}

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct TenantUsageRow {
    pub tenant_id: String,
    pub operations: i64,
    pub successful: i64,
    pub tokens: i64,
    pub api_calls: i64,
}

pub struct UsageQueries;

impl UsageQueries {
    #[inline]
    pub async fn insert(
        pool: &SqlitePool,
        record: &NewUsageRecord,
        now: NaiveDateTime,
    ) -> Result<i64> {
        let id = sqlx::query(
            r"
            INSERT INTO usage_metrics (tenant_id, operation, content_type, token_count,
                                       api_calls, duration_ms, success, error_message, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(&record.tenant_id)
        .bind(record.operation)
        .bind(record.content_type)
        .bind(record.token_count)
        .bind(record.api_calls)
        .bind(record.duration_ms)
        .bind(record.success)
        .bind(&record.error_message)
        .bind(now)
        .execute(pool)
        .await
        .context("Failed to insert usage record")?
        .last_insert_rowid();

        Ok(id)
    }

    #[inline]
    pub async fn list_for_tenant(
        pool: &SqlitePool,
        tenant_id: &str,
        since: NaiveDateTime,
    ) -> Result<Vec<UsageRecord>> {
        let records = sqlx::query_as::<_, UsageRecord>(&format!(
            r"
            SELECT {USAGE_COLUMNS}
            FROM usage_metrics
            WHERE tenant_id = ? AND created_at >= ?
            ORDER BY created_at ASC, id ASC
            ",
        ))
        .bind(tenant_id)
        .bind(since)
        .fetch_all(pool)
        .await
        .context("Failed to list usage records")?;

        Ok(records)
    }

    #[inline]
    pub async fn totals_for_tenant(
        pool: &SqlitePool,
        tenant_id: &str,
        since: NaiveDateTime,
    ) -> Result<UsageTotalsRow> {
        let row = sqlx::query_as::<_, UsageTotalsRow>(
            r"
            SELECT
                COUNT(*) AS total_operations,
                COALESCE(SUM(CASE WHEN success = 1 THEN 1 ELSE 0 END), 0) AS successful_operations,
                COALESCE(SUM(token_count), 0) AS total_tokens,
                COALESCE(SUM(api_calls), 0) AS total_api_calls,
                COALESCE(AVG(duration_ms), 0.0) AS avg_duration_ms
            FROM usage_metrics
            WHERE tenant_id = ? AND created_at >= ?
            ",
        )
        .bind(tenant_id)
        .bind(since)
        .fetch_one(pool)
        .await
        .context("Failed to aggregate tenant usage")?;

        Ok(row)
    }

    #[inline]
    pub async fn totals_all_tenants(
        pool: &SqlitePool,
        since: NaiveDateTime,
    ) -> Result<UsageTotalsRow> {
        let row = sqlx::query_as::<_, UsageTotalsRow>(
            r"
            SELECT
                COUNT(*) AS total_operations,
                COALESCE(SUM(CASE WHEN success = 1 THEN 1 ELSE 0 END), 0) AS successful_operations,
                COALESCE(SUM(token_count), 0) AS total_tokens,
                COALESCE(SUM(api_calls), 0) AS total_api_calls,
                COALESCE(AVG(duration_ms), 0.0) AS avg_duration_ms
            FROM usage_metrics
            WHERE created_at >= ?
            ",
        )
        .bind(since)
        .fetch_one(pool)
        .await
        .context("Failed to aggregate usage across tenants")?;

        Ok(row)
    }

    #[inline]
    pub async fn breakdown_by_operation(
        pool: &SqlitePool,
        tenant_id: &str,
        since: NaiveDateTime,
    ) -> Result<Vec<OperationUsageRow>> {
        let rows = sqlx::query_as::<_, OperationUsageRow>(
            r"
            SELECT
                operation,
                COUNT(*) AS operations,
                COALESCE(SUM(CASE WHEN success = 1 THEN 1 ELSE 0 END), 0) AS successful,
                COALESCE(SUM(token_count), 0) AS tokens,
                COALESCE(SUM(api_calls), 0) AS api_calls
            FROM usage_metrics
            WHERE tenant_id = ? AND created_at >= ?
            GROUP BY operation
            ORDER BY operation ASC
            ",
        )
        .bind(tenant_id)
        .bind(since)
        .fetch_all(pool)
        .await
        .context("Failed to break down usage by operation")?;

        Ok(rows)
    }

    #[inline]
    pub async fn breakdown_by_content_type(
        pool: &SqlitePool,
        tenant_id: &str,
        since: NaiveDateTime,
    ) -> Result<Vec<ContentTypeUsageRow>> {
        let rows = sqlx::query_as::<_, ContentTypeUsageRow>(
            r"
            SELECT
                content_type,
                COUNT(*) AS operations,
                COALESCE(SUM(token_count), 0) AS tokens
            FROM usage_metrics
            WHERE tenant_id = ? AND created_at >= ? AND content_type IS NOT NULL
            GROUP BY content_type
            ORDER BY content_type ASC
            ",
        )
        .bind(tenant_id)
        .bind(since)
        .fetch_all(pool)
        .await
        .context("Failed to break down usage by content type")?;

        Ok(rows)
    }

    /// Usage bucketed by a strftime format, e.g. `%Y-%m-%d %H:00` for hourly
    /// buckets or `%Y-%m-%d` for daily ones. Buckets with no records are
    /// absent rather than zero-filled.
    #[inline]
    pub async fn trend(
        pool: &SqlitePool,
        tenant_id: &str,
        since: NaiveDateTime,
        bucket_format: &str,
    ) -> Result<Vec<UsageTrendRow>> {
        let rows = sqlx::query_as::<_, UsageTrendRow>(
            r"
            SELECT
                strftime(?, created_at) AS bucket,
                COUNT(*) AS operations,
                COALESCE(SUM(CASE WHEN success = 1 THEN 1 ELSE 0 END), 0) AS successful,
                COALESCE(SUM(token_count), 0) AS tokens
            FROM usage_metrics
            WHERE tenant_id = ? AND created_at >= ?
            GROUP BY bucket
            ORDER BY bucket ASC
            ",
        )
        .bind(bucket_format)
        .bind(tenant_id)
        .bind(since)
        .fetch_all(pool)
        .await
        .context("Failed to compute usage trend")?;

        Ok(rows)
    }

    #[inline]
    pub async fn tenant_rollup(
        pool: &SqlitePool,
        since: NaiveDateTime,
    ) -> Result<Vec<TenantUsageRow>> {
        let rows = sqlx::query_as::<_, TenantUsageRow>(
            r"
            SELECT
                tenant_id,
                COUNT(*) AS operations,
                COALESCE(SUM(CASE WHEN success = 1 THEN 1 ELSE 0 END), 0) AS successful,
                COALESCE(SUM(token_count), 0) AS tokens,
                COALESCE(SUM(api_calls), 0) AS api_calls
            FROM usage_metrics
            WHERE created_at >= ?
            GROUP BY tenant_id
            ORDER BY tokens DESC, tenant_id ASC
            ",
        )
        .bind(since)
        .fetch_all(pool)
        .await
        .context("Failed to roll up usage by tenant")?;

        Ok(rows)
    }
}
