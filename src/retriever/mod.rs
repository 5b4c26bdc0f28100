//! Cache-first context retrieval.
//!
//! Each request runs Validate -> CacheLookup -> EmbedQuery -> Search ->
//! Assemble -> CachePopulate. Retries live in the embedding generator; this
//! layer either succeeds, fails validation, or surfaces the upstream error.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::NaiveDateTime;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cache::{CachedContext, QueryCache};
use crate::content::{ContentType, title_from_metadata};
use crate::database::models::{NewUsageRecord, UsageOperation};
use crate::embeddings::Embedder;
use crate::search::{SearchEngine, SearchHit};
use crate::usage::UsageTracker;
use crate::{EngineError, Result};


pub const MAX_QUERY_CHARS: usize = 1000;
pub const MIN_TOP_N: usize = 1;
pub const MAX_TOP_N: usize = 20;
pub const DEFAULT_TOP_N: usize = 5;
/// Similarity floor for single-type structured lookups.
pub const DEFAULT_MIN_SCORE: f64 = 0.75;
/// Looser floor used when fanning a query across every content type.
pub const DEFAULT_MIN_SCORE_ALL_TYPES: f64 = 0.65;

const SNIPPET_MAX_CHARS: usize = 240;

/// Retrieval request as accepted on the wire.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextRequest {
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub content_type: Option<ContentType>,
    #[serde(default)]
    pub top_n: Option<usize>,
    #[serde(default)]
    pub min_score: Option<f64>,
    #[serde(default)]
    pub include_metadata: bool,
}

/// One ranked result in a retrieval envelope.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextResult {
    pub content_type: ContentType,
    pub content_id: String,
    pub title: String,
    pub snippet: String,
    pub score: f64,
    pub confidence: f64,
    pub updated_at: NaiveDateTime,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// Retrieval envelope. An empty `results` list is a successful outcome.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrievedContext {
    pub results: Vec<ContextResult>,
    pub total: usize,
    pub average_confidence: f64,
    #[serde(rename = "retrievalTime")]
    pub retrieval_time_ms: u64,
    pub cached: bool,
}

/// All-types envelope: the merged results plus a per-type count breakdown.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrievedAllContext {
    #[serde(flatten)]
    pub context: RetrievedContext,
    pub breakdown: BTreeMap<ContentType, usize>,
}

struct QueryPlan {
    query: String,
    top_n: usize,
    min_score: f64,
}

/// Cache-first retrieval orchestrator. Collaborators are injected so tests
/// can swap the embedding backend for a deterministic one.
#[derive(Clone)]
pub struct ContextRetriever {
    embedder: Arc<dyn Embedder>,
    search: SearchEngine,
    cache: QueryCache,
    usage: UsageTracker,
}

impl ContextRetriever {
    #[inline]
    pub fn new(
        embedder: Arc<dyn Embedder>,
        search: SearchEngine,
        cache: QueryCache,
        usage: UsageTracker,
    ) -> Self {
        Self {
            embedder,
            search,
            cache,
            usage,
        }
    }

    /// Retrieve context for one content type, or across all of them when
    /// the request carries no filter.
    #[inline]
    pub async fn retrieve_context(
        &self,
        tenant_id: &str,
        request: &ContextRequest,
    ) -> Result<RetrievedContext> {
        let started = Instant::now();
        let plan = validate_request(tenant_id, request, DEFAULT_MIN_SCORE)?;

        let outcome = self
            .lookup_single(tenant_id, request.content_type, &plan)
            .await;
        self.record_search_usage(
            tenant_id,
            request.content_type,
            UsageOperation::Search,
            &outcome,
            started,
        )
        .await;

        let (context, cached) = outcome?;
        Ok(assemble_envelope(
            &context,
            cached,
            request.include_metadata,
            started,
        ))
    }

    /// Fan the query across every content type, merge by score, and report
    /// a per-type result breakdown. Any `contentType` in the request is
    /// ignored.
    #[inline]
    pub async fn retrieve_all_context(
        &self,
        tenant_id: &str,
        request: &ContextRequest,
    ) -> Result<RetrievedAllContext> {
        let started = Instant::now();
        let plan = validate_request(tenant_id, request, DEFAULT_MIN_SCORE_ALL_TYPES)?;

        let outcome = self.lookup_all(tenant_id, &plan).await;
        self.record_search_usage(tenant_id, None, UsageOperation::SearchAll, &outcome, started)
            .await;

        let (context, cached) = outcome?;
        let breakdown = breakdown_by_type(&context.results);
        Ok(RetrievedAllContext {
            context: assemble_envelope(&context, cached, request.include_metadata, started),
            breakdown,
        })
    }

    async fn lookup_single(
        &self,
        tenant_id: &str,
        content_type: Option<ContentType>,
        plan: &QueryPlan,
    ) -> Result<(Arc<CachedContext>, bool)> {
        let key =
            QueryCache::make_key(tenant_id, content_type, plan.top_n, plan.min_score, &plan.query);
        if let Some(context) = self.cache.get(&key).await {
            debug!("Cache hit for tenant {}", tenant_id);
            return Ok((context, true));
        }

        let vector = self.embedder.embed(tenant_id, &plan.query).await?;
        let hits = self
            .search
            .search(tenant_id, &vector, content_type, plan.top_n, plan.min_score)
            .await?;

        let context = Arc::new(assemble_results(&hits));
        self.cache.insert(key, Arc::clone(&context)).await;
        Ok((context, false))
    }

    async fn lookup_all(
        &self,
        tenant_id: &str,
        plan: &QueryPlan,
    ) -> Result<(Arc<CachedContext>, bool)> {
        let key = QueryCache::make_key(tenant_id, None, plan.top_n, plan.min_score, &plan.query);
        if let Some(context) = self.cache.get(&key).await {
            debug!("Cache hit for tenant {}", tenant_id);
            return Ok((context, true));
        }

        let vector = self.embedder.embed(tenant_id, &plan.query).await?;

        let mut merged: Vec<SearchHit> = Vec::new();
        for content_type in ContentType::ALL {
            let hits = self
                .search
                .search(
                    tenant_id,
                    &vector,
                    Some(content_type),
                    plan.top_n,
                    plan.min_score,
                )
                .await?;
            merged.extend(hits);
        }
        merged.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| b.record.updated_at.cmp(&a.record.updated_at))
        });
        merged.truncate(plan.top_n);

        let context = Arc::new(assemble_results(&merged));
        self.cache.insert(key, Arc::clone(&context)).await;
        Ok((context, false))
    }

    /// Exactly one search usage record per retrieval call, at the terminal
    /// outcome. Validation failures never reach this point.
    async fn record_search_usage(
        &self,
        tenant_id: &str,
        content_type: Option<ContentType>,
        operation: UsageOperation,
        outcome: &Result<(Arc<CachedContext>, bool)>,
        started: Instant,
    ) {
        let (success, error_message) = match outcome {
            Ok(_) => (true, None),
            Err(error) => (false, Some(error.to_string())),
        };

        self.usage
            .record(NewUsageRecord {
                tenant_id: tenant_id.to_string(),
                operation,
                content_type,
                token_count: 0,
                api_calls: 0,
                duration_ms: i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX),
                success,
                error_message,
            })
            .await;
    }
}

fn validate_request(
    tenant_id: &str,
    request: &ContextRequest,
    default_min_score: f64,
) -> Result<QueryPlan> {
    if tenant_id.trim().is_empty() {
        return Err(EngineError::Validation(
            "tenantId must not be empty".to_string(),
        ));
    }

    let query = request.query.trim();
    if query.is_empty() {
        return Err(EngineError::Validation(
            "query must not be empty".to_string(),
        ));
    }
    if query.chars().count() > MAX_QUERY_CHARS {
        return Err(EngineError::Validation(format!(
            "query must be at most {MAX_QUERY_CHARS} characters"
        )));
    }

    let top_n = request.top_n.unwrap_or(DEFAULT_TOP_N);
    if !(MIN_TOP_N..=MAX_TOP_N).contains(&top_n) {
        return Err(EngineError::Validation(format!(
            "topN must be between {MIN_TOP_N} and {MAX_TOP_N}, got {top_n}"
        )));
    }

    let min_score = request.min_score.unwrap_or(default_min_score);
    if !min_score.is_finite() || !(0.0..=1.0).contains(&min_score) {
        return Err(EngineError::Validation(format!(
            "minScore must be within 0.0..=1.0, got {min_score}"
        )));
    }

    Ok(QueryPlan {
        query: query.to_string(),
        top_n,
        min_score,
    })
}

fn assemble_results(hits: &[SearchHit]) -> CachedContext {
    let results: Vec<ContextResult> = hits.iter().map(result_from_hit).collect();
    let average_confidence = if hits.is_empty() {
        0.0
    } else {
        let total: f64 = hits.iter().map(|hit| hit.score).sum();
        total / hits.len() as f64
    };

    CachedContext {
        results,
        average_confidence,
    }
}

fn result_from_hit(hit: &SearchHit) -> ContextResult {
    let metadata = hit.record.metadata_value();

    ContextResult {
        content_type: hit.record.content_type,
        content_id: hit.record.content_id.clone(),
        title: title_from_metadata(hit.record.content_type, &metadata, &hit.record.content_id),
        snippet: snippet_of(&hit.record.content_text),
        score: hit.score,
        confidence: round_confidence(hit.score),
        updated_at: hit.record.updated_at,
        metadata: Some(metadata),
    }
}

/// Stored results always carry metadata; strip it per request unless the
/// caller asked for it.
fn assemble_envelope(
    context: &CachedContext,
    cached: bool,
    include_metadata: bool,
    started: Instant,
) -> RetrievedContext {
    let results: Vec<ContextResult> = context
        .results
        .iter()
        .map(|result| {
            let mut shaped = result.clone();
            if !include_metadata {
                shaped.metadata = None;
            }
            shaped
        })
        .collect();

    let total = results.len();
    RetrievedContext {
        results,
        total,
        average_confidence: context.average_confidence,
        retrieval_time_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        cached,
    }
}

/// Leading slice of the indexed text, cut at a char boundary.
fn snippet_of(content: &str) -> String {
    let trimmed = content.trim();
    match trimmed.char_indices().nth(SNIPPET_MAX_CHARS) {
        Some((byte_end, _)) => trimmed.get(..byte_end).unwrap_or(trimmed).to_string(),
        None => trimmed.to_string(),
    }
}

/// Confidence is the similarity score rounded to two decimals.
fn round_confidence(score: f64) -> f64 {
    (score * 100.0).round() / 100.0
}

fn breakdown_by_type(results: &[ContextResult]) -> BTreeMap<ContentType, usize> {
    results
        .iter()
        .counts_by(|result| result.content_type)
        .into_iter()
        .collect()
}
