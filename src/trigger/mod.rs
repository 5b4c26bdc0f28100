//! Auto-trigger indexing: a persistent job queue plus a fixed worker pool.
//!
//! Jobs move `pending -> processing -> completed | failed`. A failed attempt
//! below the retry budget goes back to `pending` with a deferred `run_after`.
//! Workers serialize jobs per `(tenant, content_type, content_id)` key so a
//! retrying `create` can never overtake the `update` queued after it.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{NaiveDateTime, Utc};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::content::{ContentPayload, ContentType};
use crate::database::Database;
use crate::database::models::{
    IndexJob, JobOperation, JobStatus, NewEmbedding, NewIndexJob, NewUsageRecord, UsageOperation,
};
use crate::database::queries::{EmbeddingQueries, JobQueries, QueueStats};
use crate::embeddings::Embedder;
use crate::embeddings::generator::EXPONENTIAL_BACKOFF_BASE;
use crate::usage::UsageTracker;
use crate::{EngineError, Result};


/// How many claim candidates to pull per poll. Losing a claim race moves on
/// to the next candidate instead of going back to sleep.
const CLAIM_CANDIDATES: i64 = 8;

/// One indexing job as accepted on the wire.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerJobRequest {
    pub operation: JobOperation,
    pub content_type: ContentType,
    pub content_id: String,
    #[serde(default)]
    pub payload: Option<ContentPayload>,
}

/// Identifiers returned when a batch is accepted.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedBatch {
    pub batch_id: String,
    pub job_ids: Vec<String>,
}

/// Wire view of a single job.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusView {
    pub job_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,
    pub operation: JobOperation,
    pub content_type: ContentType,
    pub content_id: String,
    pub status: JobStatus,
    pub attempts: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<NaiveDateTime>,
}

impl From<&IndexJob> for JobStatusView {
    fn from(job: &IndexJob) -> Self {
        Self {
            job_id: job.job_id.clone(),
            batch_id: job.batch_id.clone(),
            operation: job.operation,
            content_type: job.content_type,
            content_id: job.content_id.clone(),
            status: job.status,
            attempts: job.attempts,
            error_message: job.error_message.clone(),
            created_at: job.created_at,
            updated_at: job.updated_at,
            completed_at: job.completed_at,
        }
    }
}

/// Aggregated view of a batch. `completed` means every member is terminal,
/// regardless of whether it succeeded.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchStatusView {
    pub batch_id: String,
    pub total: usize,
    pub counts: BTreeMap<JobStatus, usize>,
    pub completed: bool,
    pub jobs: Vec<JobStatusView>,
}

/// Queue counters plus the age of the oldest job still waiting.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerQueueStats {
    #[serde(flatten)]
    pub counts: QueueStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oldest_pending_age_seconds: Option<i64>,
}

/// Queue front-end and worker pool for auto-trigger indexing.
#[derive(Clone)]
pub struct TriggerService {
    database: Database,
    embedder: Arc<dyn Embedder>,
    usage: UsageTracker,
    config: QueueConfig,
    notify: Arc<Notify>,
}

impl TriggerService {
    #[inline]
    pub fn new(
        database: Database,
        embedder: Arc<dyn Embedder>,
        usage: UsageTracker,
        config: QueueConfig,
    ) -> Self {
        Self {
            database,
            embedder,
            usage,
            config,
            notify: Arc::new(Notify::new()),
        }
    }

    /// Validate and enqueue one job, waking an idle worker. Returns the
    /// assigned job id without waiting for processing.
    #[inline]
    pub async fn queue_trigger_job(
        &self,
        tenant_id: &str,
        request: &TriggerJobRequest,
    ) -> Result<String> {
        validate_job(tenant_id, request)?;

        let new_job = build_job(tenant_id, None, request)?;
        let job =
            JobQueries::enqueue(self.database.pool(), &new_job, Utc::now().naive_utc()).await?;
        self.notify.notify_one();

        info!(
            "Queued {} job {} for tenant {}",
            request.operation, job.job_id, tenant_id
        );
        Ok(job.job_id)
    }

    /// Enqueue several jobs under one batch id. The whole batch is validated
    /// up front and inserted atomically.
    #[inline]
    pub async fn queue_batch_trigger_jobs(
        &self,
        tenant_id: &str,
        requests: &[TriggerJobRequest],
    ) -> Result<QueuedBatch> {
        if requests.is_empty() {
            return Err(EngineError::Validation(
                "batch must contain at least one job".to_string(),
            ));
        }
        for request in requests {
            validate_job(tenant_id, request)?;
        }

        let batch_id = Uuid::new_v4().to_string();
        let mut new_jobs = Vec::with_capacity(requests.len());
        for request in requests {
            new_jobs.push(build_job(tenant_id, Some(&batch_id), request)?);
        }

        let queued =
            JobQueries::enqueue_batch(self.database.pool(), &new_jobs, Utc::now().naive_utc())
                .await?;
        self.notify.notify_waiters();

        info!(
            "Queued batch {} with {} job(s) for tenant {}",
            batch_id, queued, tenant_id
        );
        Ok(QueuedBatch {
            batch_id,
            job_ids: new_jobs.into_iter().map(|job| job.job_id).collect(),
        })
    }

    /// Tenant-scoped job lookup; another tenant's job id reads as missing.
    #[inline]
    pub async fn get_job_status(&self, tenant_id: &str, job_id: &str) -> Result<JobStatusView> {
        let job = JobQueries::get_by_job_id(self.database.pool(), job_id)
            .await?
            .filter(|job| job.tenant_id == tenant_id)
            .ok_or_else(|| EngineError::NotFound(format!("Job {job_id} not found")))?;

        Ok(JobStatusView::from(&job))
    }

    #[inline]
    pub async fn get_batch_status(
        &self,
        tenant_id: &str,
        batch_id: &str,
    ) -> Result<BatchStatusView> {
        let jobs: Vec<IndexJob> = JobQueries::list_by_batch(self.database.pool(), batch_id)
            .await?
            .into_iter()
            .filter(|job| job.tenant_id == tenant_id)
            .collect();
        if jobs.is_empty() {
            return Err(EngineError::NotFound(format!("Batch {batch_id} not found")));
        }

        let counts: BTreeMap<JobStatus, usize> = jobs
            .iter()
            .counts_by(|job| job.status)
            .into_iter()
            .collect();
        let completed = jobs.iter().all(|job| job.status.is_terminal());

        Ok(BatchStatusView {
            batch_id: batch_id.to_string(),
            total: jobs.len(),
            counts,
            completed,
            jobs: jobs.iter().map(JobStatusView::from).collect(),
        })
    }

    /// Put failed jobs back in the queue with a fresh attempt budget,
    /// optionally scoped to one tenant. Returns the requeued count.
    #[inline]
    pub async fn retry_failed_jobs(&self, tenant_id: Option<&str>) -> Result<u64> {
        let requeued =
            JobQueries::retry_failed(self.database.pool(), tenant_id, Utc::now().naive_utc())
                .await?;
        if requeued > 0 {
            self.notify.notify_waiters();
            info!("Requeued {} failed job(s)", requeued);
        }
        Ok(requeued)
    }

    /// Purge terminal jobs older than the horizon, defaulting to the
    /// configured cleanup age. Returns the purge count.
    #[inline]
    pub async fn cleanup_completed_jobs(&self, older_than_hours: Option<u64>) -> Result<u64> {
        let hours = older_than_hours.unwrap_or(self.config.cleanup_age_hours);
        let hours = i64::try_from(hours).unwrap_or(i64::MAX);
        let cutoff = Utc::now().naive_utc() - chrono::Duration::hours(hours);
        let purged = JobQueries::cleanup_completed(self.database.pool(), cutoff).await?;
        if purged > 0 {
            info!("Purged {} terminal job(s)", purged);
        }
        Ok(purged)
    }

    #[inline]
    pub async fn queue_stats(&self) -> Result<TriggerQueueStats> {
        let counts = JobQueries::get_stats(self.database.pool()).await?;
        let oldest = JobQueries::oldest_pending(self.database.pool()).await?;
        let now = Utc::now().naive_utc();

        Ok(TriggerQueueStats {
            counts,
            oldest_pending_age_seconds: oldest
                .map(|created_at| (now - created_at).num_seconds().max(0)),
        })
    }

    /// Crash recovery: requeue processing rows whose worker went quiet for
    /// longer than the processing timeout. Run at service start.
    #[inline]
    pub async fn reset_stuck_jobs(&self) -> Result<u64> {
        let now = Utc::now().naive_utc();
        let timeout = i64::try_from(self.config.processing_timeout_seconds).unwrap_or(i64::MAX);
        let cutoff = now - chrono::Duration::seconds(timeout);

        let reset = JobQueries::reset_stuck(self.database.pool(), cutoff, now).await?;
        if reset > 0 {
            warn!("Reset {} stuck job(s) back to pending", reset);
            self.notify.notify_waiters();
        }
        Ok(reset)
    }

    /// Claim and process at most one ready job. Returns whether a job ran.
    ///
    /// Job execution failures transition the job (retry or failed) and are
    /// not errors here; only queue/storage trouble is.
    #[inline]
    pub async fn process_next(&self) -> Result<bool> {
        let now = Utc::now().naive_utc();
        let candidates =
            JobQueries::find_claimable(self.database.pool(), now, CLAIM_CANDIDATES).await?;

        for job in candidates {
            if JobQueries::try_claim(self.database.pool(), job.id, now).await? {
                self.run_job(&job).await?;
                return Ok(true);
            }
            // Another worker got it first; try the next candidate.
        }

        Ok(false)
    }

    /// Start the fixed worker pool. Workers idle on the notifier with a
    /// poll-interval fallback and drain their in-flight job on shutdown.
    #[inline]
    pub fn spawn_workers(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::with_capacity(self.config.workers);
        for worker_id in 0..self.config.workers {
            let service = self.clone();
            let mut shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                info!("Indexing worker {} started", worker_id);
                service.worker_loop(worker_id, &mut shutdown).await;
                info!("Indexing worker {} stopped", worker_id);
            }));
        }
        handles
    }

    async fn worker_loop(&self, worker_id: usize, shutdown: &mut watch::Receiver<bool>) {
        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.process_next().await {
                Ok(true) => {
                    // Keep draining while there is work.
                }
                Ok(false) => {
                    tokio::select! {
                        () = self.notify.notified() => {}
                        () = sleep(poll_interval) => {}
                        _ = shutdown.changed() => {}
                    }
                }
                Err(error) => {
                    error!("Worker {} queue error: {}", worker_id, error);
                    tokio::select! {
                        () = sleep(poll_interval) => {}
                        _ = shutdown.changed() => {}
                    }
                }
            }
        }
    }

    /// Execute one claimed job and apply its terminal or retry transition.
    async fn run_job(&self, job: &IndexJob) -> Result<()> {
        let started = Instant::now();
        debug!(
            "Processing job {} ({} {} {})",
            job.job_id,
            job.operation,
            job.content_type.as_str(),
            job.content_id
        );

        let outcome = self.execute(job).await;
        let now = Utc::now().naive_utc();
        // The claim already bumped the stored counter.
        let attempts = job.attempts + 1;

        match outcome {
            Ok(()) => {
                JobQueries::mark_completed(self.database.pool(), job.id, now).await?;
                self.record_job_usage(job, true, None, started).await;
                info!("Job {} completed", job.job_id);
            }
            Err(error) => {
                let message = error.to_string();
                let budget_spent = attempts >= i64::from(self.config.max_attempts);

                if budget_spent || !is_retryable(&error) {
                    JobQueries::mark_failed(self.database.pool(), job.id, &message, now).await?;
                    self.record_job_usage(job, false, Some(&message), started)
                        .await;
                    warn!(
                        "Job {} failed after {} attempt(s): {}",
                        job.job_id, attempts, message
                    );
                } else {
                    let delay_ms = retry_delay_ms(&self.config, attempts);
                    let run_after =
                        now + chrono::Duration::milliseconds(i64::try_from(delay_ms).unwrap_or(0));
                    JobQueries::schedule_retry(
                        self.database.pool(),
                        job.id,
                        &message,
                        run_after,
                        now,
                    )
                    .await?;
                    warn!(
                        "Job {} attempt {} failed, retrying in {}ms: {}",
                        job.job_id, attempts, delay_ms, message
                    );
                }
            }
        }

        Ok(())
    }

    async fn execute(&self, job: &IndexJob) -> Result<()> {
        match job.operation {
            JobOperation::Create | JobOperation::Update => self.index_content(job).await,
            JobOperation::Delete => self.delete_content(job).await,
        }
    }

    async fn index_content(&self, job: &IndexJob) -> Result<()> {
        let raw = job.payload.as_deref().ok_or_else(|| {
            EngineError::Validation(format!("Job {} has no payload", job.job_id))
        })?;
        let payload: ContentPayload = serde_json::from_str(raw)?;
        if payload.content_type() != job.content_type {
            return Err(EngineError::Validation(format!(
                "Payload type {} does not match job content type {}",
                payload.content_type(),
                job.content_type
            )));
        }

        let text = payload.embedding_text();
        let metadata = payload.to_metadata()?;
        let vector = self.embedder.embed(&job.tenant_id, &text).await?;
        if vector.len() != self.embedder.dimension() {
            return Err(EngineError::DimensionMismatch {
                expected: self.embedder.dimension(),
                actual: vector.len(),
            });
        }

        EmbeddingQueries::upsert(
            self.database.pool(),
            &NewEmbedding {
                tenant_id: job.tenant_id.clone(),
                content_type: job.content_type,
                content_id: job.content_id.clone(),
                content_text: text,
                metadata,
                vector,
                model: self.embedder.model().to_string(),
            },
            Utc::now().naive_utc(),
        )
        .await?;

        Ok(())
    }

    /// Delete is idempotent: a missing or already deleted target completes.
    async fn delete_content(&self, job: &IndexJob) -> Result<()> {
        let removed = EmbeddingQueries::soft_delete(
            self.database.pool(),
            &job.tenant_id,
            job.content_type,
            &job.content_id,
            Utc::now().naive_utc(),
        )
        .await?;
        if !removed {
            debug!(
                "Job {} targeted already absent content {}",
                job.job_id, job.content_id
            );
        }
        Ok(())
    }

    /// Exactly one record per terminal transition; retries that stay in the
    /// queue produce none.
    async fn record_job_usage(
        &self,
        job: &IndexJob,
        success: bool,
        error_message: Option<&str>,
        started: Instant,
    ) {
        self.usage
            .record(NewUsageRecord {
                tenant_id: job.tenant_id.clone(),
                operation: UsageOperation::from(job.operation),
                content_type: Some(job.content_type),
                token_count: 0,
                api_calls: 0,
                duration_ms: i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX),
                success,
                error_message: error_message.map(str::to_string),
            })
            .await;
    }
}

fn validate_job(tenant_id: &str, request: &TriggerJobRequest) -> Result<()> {
    if tenant_id.trim().is_empty() {
        return Err(EngineError::Validation(
            "tenantId must not be empty".to_string(),
        ));
    }
    if request.content_id.trim().is_empty() {
        return Err(EngineError::Validation(
            "contentId must not be empty".to_string(),
        ));
    }

    match request.operation {
        JobOperation::Create | JobOperation::Update => {
            let payload = request.payload.as_ref().ok_or_else(|| {
                EngineError::Validation(format!("{} jobs require a payload", request.operation))
            })?;
            if payload.content_type() != request.content_type {
                return Err(EngineError::Validation(format!(
                    "Payload type {} does not match job content type {}",
                    payload.content_type(),
                    request.content_type
                )));
            }
            if payload.embedding_text().trim().is_empty() {
                return Err(EngineError::Validation(
                    "payload produces no text to embed".to_string(),
                ));
            }
        }
        JobOperation::Delete => {}
    }

    Ok(())
}

fn build_job(
    tenant_id: &str,
    batch_id: Option<&str>,
    request: &TriggerJobRequest,
) -> Result<NewIndexJob> {
    let payload = request
        .payload
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;

    Ok(NewIndexJob {
        job_id: Uuid::new_v4().to_string(),
        batch_id: batch_id.map(str::to_string),
        tenant_id: tenant_id.to_string(),
        operation: request.operation,
        content_type: request.content_type,
        content_id: request.content_id.clone(),
        payload,
    })
}

/// Malformed payloads can never succeed, so they skip the retry budget.
fn is_retryable(error: &EngineError) -> bool {
    !matches!(
        error,
        EngineError::Validation(_) | EngineError::Serialization(_)
    )
}

/// Same doubling policy as the embedding client, capped by configuration.
fn retry_delay_ms(config: &QueueConfig, attempt: i64) -> u64 {
    let attempt = u32::try_from(attempt.max(1)).unwrap_or(1);
    let factor = EXPONENTIAL_BACKOFF_BASE.saturating_pow(attempt - 1);
    config
        .initial_retry_delay_ms
        .saturating_mul(factor)
        .min(config.max_retry_delay_ms)
}
