use super::*;
use crate::database::Database;
use crate::database::models::{JobOperation, JobStatus, NewEmbedding, NewIndexJob};
use chrono::NaiveDate;
use tempfile::TempDir;

async fn create_test_pool() -> (TempDir, SqlitePool) {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let database = Database::new(temp_dir.path().join("test.db"))
        .await
        .expect("Failed to open database");

    (temp_dir, database.pool().clone())
}

fn at(hour: u32, minute: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2026, 8, 25)
        .expect("valid date")
        .and_hms_opt(hour, minute, 0)
        .expect("valid time")
}

fn sample_embedding(tenant_id: &str, content_type: ContentType, content_id: &str) -> NewEmbedding {
    NewEmbedding {
        tenant_id: tenant_id.to_owned(),
        content_type,
        content_id: content_id.to_owned(),
        content_text: format!("text for {content_id}"),
        metadata: serde_json::json!({ "name": content_id }),
        vector: vec![0.1, 0.2, 0.3],
        model: "test-model".to_owned(),
    }
}

fn sample_job(tenant_id: &str, content_id: &str, operation: JobOperation) -> NewIndexJob {
    NewIndexJob {
        job_id: uuid::Uuid::new_v4().to_string(),
        batch_id: None,
        tenant_id: tenant_id.to_owned(),
        operation,
        content_type: ContentType::Menu,
        content_id: content_id.to_owned(),
        payload: Some("{\"type\":\"MENU\",\"name\":\"Margherita\"}".to_owned()),
    }
}

fn usage_record(
    tenant_id: &str,
    operation: UsageOperation,
    content_type: Option<ContentType>,
    tokens: i64,
    success: bool,
) -> NewUsageRecord {
    NewUsageRecord {
        tenant_id: tenant_id.to_owned(),
        operation,
        content_type,
        token_count: tokens,
        api_calls: 1,
        duration_ms: 40,
        success,
        error_message: (!success).then(|| "provider returned 500".to_owned()),
    }
}

#[tokio::test]
async fn upsert_updates_active_row_in_place() {
    let (_temp_dir, pool) = create_test_pool().await;

    let first = EmbeddingQueries::upsert(
        &pool,
        &sample_embedding("tenant-a", ContentType::Menu, "item-1"),
        at(10, 0),
    )
    .await
    .expect("Failed to insert embedding");

    assert_eq!(first.created_at, at(10, 0));
    assert_eq!(first.dimension, 3);

    let mut replacement = sample_embedding("tenant-a", ContentType::Menu, "item-1");
    replacement.content_text = "updated text".to_owned();
    replacement.vector = vec![0.9, 0.8, 0.7, 0.6];

    let second = EmbeddingQueries::upsert(&pool, &replacement, at(11, 0))
        .await
        .expect("Failed to update embedding");

    assert_eq!(second.id, first.id);
    assert_eq!(second.created_at, at(10, 0));
    assert_eq!(second.updated_at, at(11, 0));
    assert_eq!(second.content_text, "updated text");
    assert_eq!(second.dimension, 4);
    assert_eq!(
        second.decoded_vector().expect("Should decode"),
        vec![0.9, 0.8, 0.7, 0.6]
    );

    let count = EmbeddingQueries::count_active(&pool, "tenant-a", None)
        .await
        .expect("Failed to count");
    assert_eq!(count, 1);
}

#[tokio::test]
async fn soft_delete_hides_row_and_next_upsert_starts_fresh() {
    let (_temp_dir, pool) = create_test_pool().await;

    let original = EmbeddingQueries::upsert(
        &pool,
        &sample_embedding("tenant-a", ContentType::Faq, "faq-1"),
        at(9, 0),
    )
    .await
    .expect("Failed to insert embedding");

    let deleted =
        EmbeddingQueries::soft_delete(&pool, "tenant-a", ContentType::Faq, "faq-1", at(9, 30))
            .await
            .expect("Failed to soft delete");
    assert!(deleted);

    let missing = EmbeddingQueries::get_active(&pool, "tenant-a", ContentType::Faq, "faq-1")
        .await
        .expect("Query should succeed");
    assert!(missing.is_none());

    let repeat =
        EmbeddingQueries::soft_delete(&pool, "tenant-a", ContentType::Faq, "faq-1", at(9, 45))
            .await
            .expect("Query should succeed");
    assert!(!repeat, "second delete should report no active row");

    let reborn = EmbeddingQueries::upsert(
        &pool,
        &sample_embedding("tenant-a", ContentType::Faq, "faq-1"),
        at(10, 0),
    )
    .await
    .expect("Failed to re-insert after delete");

    assert_ne!(reborn.id, original.id, "soft-deleted row must not be resurrected");
    assert_eq!(reborn.created_at, at(10, 0));

    let count = EmbeddingQueries::count_active(&pool, "tenant-a", Some(ContentType::Faq))
        .await
        .expect("Failed to count");
    assert_eq!(count, 1);
}

#[tokio::test]
async fn list_active_scopes_by_tenant_and_type() {
    let (_temp_dir, pool) = create_test_pool().await;

    for (tenant, content_type, id) in [
        ("tenant-a", ContentType::Menu, "pizza"),
        ("tenant-a", ContentType::Menu, "pasta"),
        ("tenant-a", ContentType::Policy, "refunds"),
        ("tenant-b", ContentType::Menu, "sushi"),
    ] {
        EmbeddingQueries::upsert(&pool, &sample_embedding(tenant, content_type, id), at(8, 0))
            .await
            .expect("Failed to insert embedding");
    }

    EmbeddingQueries::soft_delete(&pool, "tenant-a", ContentType::Menu, "pasta", at(8, 30))
        .await
        .expect("Failed to soft delete");

    let all_a = EmbeddingQueries::list_active(&pool, "tenant-a", None)
        .await
        .expect("Failed to list");
    assert_eq!(all_a.len(), 2);
    assert!(all_a.iter().all(|r| r.tenant_id == "tenant-a"));
    assert!(all_a.iter().all(|r| r.deleted_at.is_none()));

    let menus_a = EmbeddingQueries::list_active(&pool, "tenant-a", Some(ContentType::Menu))
        .await
        .expect("Failed to list");
    assert_eq!(menus_a.len(), 1);
    assert_eq!(menus_a[0].content_id, "pizza");

    assert_eq!(
        EmbeddingQueries::count_active(&pool, "tenant-b", None)
            .await
            .expect("Failed to count"),
        1
    );
    assert_eq!(
        EmbeddingQueries::count_active_all(&pool)
            .await
            .expect("Failed to count"),
        3
    );
}

#[tokio::test]
async fn job_claim_lifecycle() {
    let (_temp_dir, pool) = create_test_pool().await;

    let job = JobQueries::enqueue(
        &pool,
        &sample_job("tenant-a", "item-1", JobOperation::Create),
        at(10, 0),
    )
    .await
    .expect("Failed to enqueue");

    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.attempts, 0);

    let claimable = JobQueries::find_claimable(&pool, at(10, 0), 10)
        .await
        .expect("Failed to find claimable");
    assert_eq!(claimable.len(), 1);
    assert_eq!(claimable[0].id, job.id);

    assert!(
        JobQueries::try_claim(&pool, job.id, at(10, 1))
            .await
            .expect("Failed to claim")
    );
    assert!(
        !JobQueries::try_claim(&pool, job.id, at(10, 1))
            .await
            .expect("Second claim should not error"),
        "a claimed job cannot be claimed again"
    );

    let claimed = JobQueries::get_by_job_id(&pool, &job.job_id)
        .await
        .expect("Failed to fetch")
        .expect("Job should exist");
    assert_eq!(claimed.status, JobStatus::Processing);
    assert_eq!(claimed.attempts, 1);

    JobQueries::mark_completed(&pool, job.id, at(10, 2))
        .await
        .expect("Failed to complete");

    let finished = JobQueries::get_by_job_id(&pool, &job.job_id)
        .await
        .expect("Failed to fetch")
        .expect("Job should exist");
    assert_eq!(finished.status, JobStatus::Completed);
    assert_eq!(finished.completed_at, Some(at(10, 2)));

    let stats = JobQueries::get_stats(&pool).await.expect("Failed to get stats");
    assert_eq!(
        stats,
        QueueStats {
            total: 1,
            pending: 0,
            processing: 0,
            completed: 1,
            failed: 0
        }
    );
}

#[tokio::test]
async fn same_key_jobs_run_in_enqueue_order() {
    let (_temp_dir, pool) = create_test_pool().await;

    let create = JobQueries::enqueue(
        &pool,
        &sample_job("tenant-a", "item-1", JobOperation::Create),
        at(10, 0),
    )
    .await
    .expect("Failed to enqueue create");
    let update = JobQueries::enqueue(
        &pool,
        &sample_job("tenant-a", "item-1", JobOperation::Update),
        at(10, 0),
    )
    .await
    .expect("Failed to enqueue update");
    let other_key = JobQueries::enqueue(
        &pool,
        &sample_job("tenant-a", "item-2", JobOperation::Create),
        at(10, 0),
    )
    .await
    .expect("Failed to enqueue other key");

    let claimable = JobQueries::find_claimable(&pool, at(10, 0), 10)
        .await
        .expect("Failed to find claimable");
    let ids: Vec<i64> = claimable.iter().map(|j| j.id).collect();
    assert_eq!(
        ids,
        vec![create.id, other_key.id],
        "newer same-key job must wait for the older one"
    );

    assert!(
        JobQueries::try_claim(&pool, create.id, at(10, 1))
            .await
            .expect("Failed to claim")
    );

    let while_processing = JobQueries::find_claimable(&pool, at(10, 1), 10)
        .await
        .expect("Failed to find claimable");
    assert_eq!(
        while_processing.iter().map(|j| j.id).collect::<Vec<_>>(),
        vec![other_key.id],
        "a processing job blocks its key"
    );

    JobQueries::mark_completed(&pool, create.id, at(10, 2))
        .await
        .expect("Failed to complete");

    let after = JobQueries::find_claimable(&pool, at(10, 2), 10)
        .await
        .expect("Failed to find claimable");
    assert!(after.iter().any(|j| j.id == update.id));
}

#[tokio::test]
async fn deferred_retry_is_invisible_until_due() {
    let (_temp_dir, pool) = create_test_pool().await;

    let job = JobQueries::enqueue(
        &pool,
        &sample_job("tenant-a", "item-1", JobOperation::Update),
        at(10, 0),
    )
    .await
    .expect("Failed to enqueue");

    assert!(
        JobQueries::try_claim(&pool, job.id, at(10, 0))
            .await
            .expect("Failed to claim")
    );
    JobQueries::schedule_retry(&pool, job.id, "provider timeout", at(10, 5), at(10, 0))
        .await
        .expect("Failed to schedule retry");

    let too_early = JobQueries::find_claimable(&pool, at(10, 4), 10)
        .await
        .expect("Failed to find claimable");
    assert!(too_early.is_empty());

    let due = JobQueries::find_claimable(&pool, at(10, 5), 10)
        .await
        .expect("Failed to find claimable");
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].attempts, 1);
    assert_eq!(due[0].error_message.as_deref(), Some("provider timeout"));
}

#[tokio::test]
async fn retry_failed_resets_attempt_budget() {
    let (_temp_dir, pool) = create_test_pool().await;

    let job = JobQueries::enqueue(
        &pool,
        &sample_job("tenant-a", "item-1", JobOperation::Create),
        at(10, 0),
    )
    .await
    .expect("Failed to enqueue");
    let other_tenant = JobQueries::enqueue(
        &pool,
        &sample_job("tenant-b", "item-9", JobOperation::Create),
        at(10, 0),
    )
    .await
    .expect("Failed to enqueue");

    for id in [job.id, other_tenant.id] {
        assert!(
            JobQueries::try_claim(&pool, id, at(10, 1))
                .await
                .expect("Failed to claim")
        );
        JobQueries::mark_failed(&pool, id, "boom", at(10, 2))
            .await
            .expect("Failed to mark failed");
    }

    let reset = JobQueries::retry_failed(&pool, Some("tenant-a"), at(10, 3))
        .await
        .expect("Failed to retry failed");
    assert_eq!(reset, 1);

    let requeued = JobQueries::get_by_job_id(&pool, &job.job_id)
        .await
        .expect("Failed to fetch")
        .expect("Job should exist");
    assert_eq!(requeued.status, JobStatus::Pending);
    assert_eq!(requeued.attempts, 0);
    assert!(requeued.error_message.is_none());
    assert!(requeued.completed_at.is_none());

    let untouched = JobQueries::get_by_job_id(&pool, &other_tenant.job_id)
        .await
        .expect("Failed to fetch")
        .expect("Job should exist");
    assert_eq!(untouched.status, JobStatus::Failed);

    let reset_all = JobQueries::retry_failed(&pool, None, at(10, 4))
        .await
        .expect("Failed to retry failed");
    assert_eq!(reset_all, 1);
}

#[tokio::test]
async fn reset_stuck_requeues_stale_processing_jobs() {
    let (_temp_dir, pool) = create_test_pool().await;

    let stale = JobQueries::enqueue(
        &pool,
        &sample_job("tenant-a", "item-1", JobOperation::Create),
        at(9, 0),
    )
    .await
    .expect("Failed to enqueue");
    let fresh = JobQueries::enqueue(
        &pool,
        &sample_job("tenant-a", "item-2", JobOperation::Create),
        at(9, 0),
    )
    .await
    .expect("Failed to enqueue");

    assert!(
        JobQueries::try_claim(&pool, stale.id, at(9, 1))
            .await
            .expect("Failed to claim")
    );
    assert!(
        JobQueries::try_claim(&pool, fresh.id, at(9, 50))
            .await
            .expect("Failed to claim")
    );

    let rescued = JobQueries::reset_stuck(&pool, at(9, 30), at(10, 0))
        .await
        .expect("Failed to reset stuck");
    assert_eq!(rescued, 1);

    let stale_after = JobQueries::get_by_job_id(&pool, &stale.job_id)
        .await
        .expect("Failed to fetch")
        .expect("Job should exist");
    assert_eq!(stale_after.status, JobStatus::Pending);

    let fresh_after = JobQueries::get_by_job_id(&pool, &fresh.job_id)
        .await
        .expect("Failed to fetch")
        .expect("Job should exist");
    assert_eq!(fresh_after.status, JobStatus::Processing);
}

#[tokio::test]
async fn cleanup_removes_old_terminal_jobs() {
    let (_temp_dir, pool) = create_test_pool().await;

    let old_done = JobQueries::enqueue(
        &pool,
        &sample_job("tenant-a", "item-1", JobOperation::Create),
        at(8, 0),
    )
    .await
    .expect("Failed to enqueue");
    let new_done = JobQueries::enqueue(
        &pool,
        &sample_job("tenant-a", "item-2", JobOperation::Create),
        at(8, 0),
    )
    .await
    .expect("Failed to enqueue");
    let old_failed = JobQueries::enqueue(
        &pool,
        &sample_job("tenant-a", "item-3", JobOperation::Create),
        at(8, 0),
    )
    .await
    .expect("Failed to enqueue");
    let waiting = JobQueries::enqueue(
        &pool,
        &sample_job("tenant-a", "item-4", JobOperation::Create),
        at(8, 0),
    )
    .await
    .expect("Failed to enqueue");

    for id in [old_done.id, new_done.id, old_failed.id] {
        assert!(
            JobQueries::try_claim(&pool, id, at(8, 1))
                .await
                .expect("Failed to claim")
        );
    }
    JobQueries::mark_completed(&pool, old_done.id, at(8, 30))
        .await
        .expect("Failed to complete");
    JobQueries::mark_completed(&pool, new_done.id, at(11, 0))
        .await
        .expect("Failed to complete");
    JobQueries::mark_failed(&pool, old_failed.id, "boom", at(8, 30))
        .await
        .expect("Failed to mark failed");

    let removed = JobQueries::cleanup_completed(&pool, at(10, 0))
        .await
        .expect("Failed to clean up");
    assert_eq!(removed, 2, "completed and failed jobs past the cutoff go");

    assert!(
        JobQueries::get_by_job_id(&pool, &old_done.job_id)
            .await
            .expect("Query should succeed")
            .is_none()
    );
    assert!(
        JobQueries::get_by_job_id(&pool, &old_failed.job_id)
            .await
            .expect("Query should succeed")
            .is_none()
    );
    assert!(
        JobQueries::get_by_job_id(&pool, &new_done.job_id)
            .await
            .expect("Query should succeed")
            .is_some(),
        "jobs finished after the cutoff stay"
    );
    assert!(
        JobQueries::get_by_job_id(&pool, &waiting.job_id)
            .await
            .expect("Query should succeed")
            .is_some(),
        "pending jobs are never purged"
    );
}

#[tokio::test]
async fn batch_enqueue_inserts_all_jobs() {
    let (_temp_dir, pool) = create_test_pool().await;

    let batch_id = uuid::Uuid::new_v4().to_string();
    let jobs: Vec<NewIndexJob> = (0..3)
        .map(|i| {
            let mut job = sample_job("tenant-a", &format!("item-{i}"), JobOperation::Create);
            job.batch_id = Some(batch_id.clone());
            job
        })
        .collect();

    let inserted = JobQueries::enqueue_batch(&pool, &jobs, at(10, 0))
        .await
        .expect("Failed to batch enqueue");
    assert_eq!(inserted, 3);

    let listed = JobQueries::list_by_batch(&pool, &batch_id)
        .await
        .expect("Failed to list batch");
    assert_eq!(listed.len(), 3);
    assert!(listed.windows(2).all(|pair| pair[0].id < pair[1].id));

    assert_eq!(
        JobQueries::enqueue_batch(&pool, &[], at(10, 0))
            .await
            .expect("Empty batch should succeed"),
        0
    );
}

#[tokio::test]
async fn usage_totals_and_breakdowns() {
    let (_temp_dir, pool) = create_test_pool().await;

    let menu = Some(ContentType::Menu);
    let policy = Some(ContentType::Policy);
    let records = [
        (usage_record("tenant-a", UsageOperation::Embedding, menu, 120, true), at(10, 0)),
        (usage_record("tenant-a", UsageOperation::Embedding, menu, 80, false), at(10, 15)),
        (usage_record("tenant-a", UsageOperation::Search, None, 8, true), at(11, 0)),
        (usage_record("tenant-a", UsageOperation::IndexCreate, policy, 60, true), at(11, 30)),
        (usage_record("tenant-b", UsageOperation::Search, None, 5, true), at(11, 45)),
    ];
    for (record, when) in &records {
        UsageQueries::insert(&pool, record, *when)
            .await
            .expect("Failed to insert usage");
    }

    let totals = UsageQueries::totals_for_tenant(&pool, "tenant-a", at(9, 0))
        .await
        .expect("Failed to aggregate");
    assert_eq!(totals.total_operations, 4);
    assert_eq!(totals.successful_operations, 3);
    assert_eq!(totals.total_tokens, 268);
    assert_eq!(totals.total_api_calls, 4);
    assert!((totals.avg_duration_ms - 40.0).abs() < f64::EPSILON);

    let by_operation = UsageQueries::breakdown_by_operation(&pool, "tenant-a", at(9, 0))
        .await
        .expect("Failed to break down");
    let embedding = by_operation
        .iter()
        .find(|row| row.operation == UsageOperation::Embedding)
        .expect("embedding row");
    assert_eq!(embedding.operations, 2);
    assert_eq!(embedding.successful, 1);
    assert_eq!(embedding.tokens, 200);

    let by_type = UsageQueries::breakdown_by_content_type(&pool, "tenant-a", at(9, 0))
        .await
        .expect("Failed to break down");
    assert_eq!(by_type.len(), 2, "typeless records are not bucketed");
    assert!(
        by_type
            .iter()
            .any(|row| row.content_type == ContentType::Menu && row.tokens == 200)
    );

    let window = UsageQueries::totals_for_tenant(&pool, "tenant-a", at(11, 0))
        .await
        .expect("Failed to aggregate");
    assert_eq!(window.total_operations, 2, "cutoff excludes older records");

    let empty = UsageQueries::totals_for_tenant(&pool, "tenant-c", at(9, 0))
        .await
        .expect("Failed to aggregate");
    assert_eq!(empty.total_operations, 0);
    assert!((empty.avg_duration_ms).abs() < f64::EPSILON);
}

#[tokio::test]
async fn usage_trend_buckets_by_hour() {
    let (_temp_dir, pool) = create_test_pool().await;

    for (tokens, when) in [(10, at(10, 5)), (20, at(10, 40)), (30, at(12, 0))] {
        UsageQueries::insert(
            &pool,
            &usage_record("tenant-a", UsageOperation::Search, None, tokens, true),
            when,
        )
        .await
        .expect("Failed to insert usage");
    }

    let trend = UsageQueries::trend(&pool, "tenant-a", at(9, 0), "%Y-%m-%d %H:00")
        .await
        .expect("Failed to compute trend");

    assert_eq!(trend.len(), 2, "empty hours yield no bucket");
    assert_eq!(trend[0].bucket, "2026-08-25 10:00");
    assert_eq!(trend[0].operations, 2);
    assert_eq!(trend[0].tokens, 30);
    assert_eq!(trend[1].bucket, "2026-08-25 12:00");
    assert_eq!(trend[1].tokens, 30);
}

#[tokio::test]
async fn tenant_rollup_orders_by_token_spend() {
    let (_temp_dir, pool) = create_test_pool().await;

    for (tenant, tokens) in [("tenant-a", 50), ("tenant-b", 500), ("tenant-c", 5)] {
        UsageQueries::insert(
            &pool,
            &usage_record(tenant, UsageOperation::Embedding, Some(ContentType::Menu), tokens, true),
            at(10, 0),
        )
        .await
        .expect("Failed to insert usage");
    }

    let rollup = UsageQueries::tenant_rollup(&pool, at(9, 0))
        .await
        .expect("Failed to roll up");
    let tenants: Vec<&str> = rollup.iter().map(|row| row.tenant_id.as_str()).collect();
    assert_eq!(tenants, vec!["tenant-b", "tenant-a", "tenant-c"]);
}
