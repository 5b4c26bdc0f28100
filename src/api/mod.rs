//! HTTP surface consumed by the platform's web tier.
//!
//! Every response uses one envelope: `{"success": true, "data": ...}` on
//! success, `{"success": false, "error": {"code", "message"}}` on failure,
//! camelCase throughout. Authentication happens upstream; tenant ids arrive
//! already vetted in the path.

use std::time::Instant;

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{FromRequest, FromRequestParts, Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::EngineError;
use crate::cache::QueryCache;
use crate::database::Database;
use crate::retriever::{ContextRequest, ContextRetriever};
use crate::trigger::{TriggerJobRequest, TriggerService};
use crate::usage::{ReportPeriod, UsageTracker};


/// Shared handler state. Every member clones cheaply.
#[derive(Clone)]
pub struct AppState {
    pub retriever: ContextRetriever,
    pub trigger: TriggerService,
    pub usage: UsageTracker,
    pub cache: QueryCache,
    pub database: Database,
}

/// Build the full route tree, `/health` at the root and everything else
/// under `/api/v1`.
pub fn router(state: AppState) -> Router {
    let tenant_routes = Router::new()
        .route("/tenants/:tenant_id/search", post(search))
        .route("/tenants/:tenant_id/search/all", post(search_all))
        .route("/tenants/:tenant_id/index/jobs", post(queue_job))
        .route("/tenants/:tenant_id/index/jobs/:job_id", get(job_status))
        .route("/tenants/:tenant_id/index/batches", post(queue_batch))
        .route(
            "/tenants/:tenant_id/index/batches/:batch_id",
            get(batch_status),
        )
        .route("/tenants/:tenant_id/index/retries", post(retry_jobs))
        .route("/tenants/:tenant_id/usage", get(usage_report));

    let admin_routes = Router::new()
        .route("/admin/metrics", get(admin_metrics))
        .route("/admin/queue", get(queue_stats))
        .route("/admin/cache", get(cache_stats))
        .route("/admin/cleanup", post(cleanup));

    Router::new()
        .route("/health", get(health))
        .nest("/api/v1", tenant_routes.merge(admin_routes))
        .fallback(unknown_route)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Wire error codes. `Unauthorized` is produced by the auth layer in front
/// of this service; it is listed here so the contract is complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidRequest,
    Unauthorized,
    NotFound,
    SearchFailed,
    InternalError,
}

impl ErrorCode {
    fn status(self) -> StatusCode {
        match self {
            ErrorCode::InvalidRequest => StatusCode::BAD_REQUEST,
            ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::SearchFailed => StatusCode::BAD_GATEWAY,
            ErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Debug)]
pub struct ApiError {
    code: ErrorCode,
    message: String,
}

impl ApiError {
    fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(error: EngineError) -> Self {
        match &error {
            EngineError::Validation(message) => {
                Self::new(ErrorCode::InvalidRequest, message.clone())
            }
            EngineError::NotFound(message) => Self::new(ErrorCode::NotFound, message.clone()),
            EngineError::EmbeddingFailed { .. } | EngineError::Upstream(_) => {
                Self::new(ErrorCode::SearchFailed, error.to_string())
            }
            _ => {
                // Storage and configuration detail stays in the logs.
                error!("Internal error serving request: {}", error);
                Self::new(ErrorCode::InternalError, "Internal server error")
            }
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::new(ErrorCode::InvalidRequest, rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::new(ErrorCode::InvalidRequest, rejection.body_text())
    }
}

#[derive(Serialize)]
struct SuccessEnvelope<T> {
    success: bool,
    data: T,
}

#[derive(Serialize)]
struct ErrorEnvelope {
    success: bool,
    error: ErrorBody,
}

#[derive(Serialize)]
struct ErrorBody {
    code: ErrorCode,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.code.status();
        let envelope = ErrorEnvelope {
            success: false,
            error: ErrorBody {
                code: self.code,
                message: self.message,
            },
        };
        (status, Json(envelope)).into_response()
    }
}

fn success<T: Serialize>(data: T) -> Json<SuccessEnvelope<T>> {
    Json(SuccessEnvelope {
        success: true,
        data,
    })
}

/// `axum::Json` that reports body problems in the error envelope.
#[derive(FromRequest)]
#[from_request(via(Json), rejection(ApiError))]
struct ApiJson<T>(T);

/// `axum::extract::Query` with the same treatment.
#[derive(FromRequestParts)]
#[from_request(via(Query), rejection(ApiError))]
struct ApiQuery<T>(T);

/// Search payload plus the wall time the handler spent on it, next to the
/// retriever's own internal timing.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TimedResponse<T> {
    #[serde(flatten)]
    payload: T,
    response_time: u64,
}

impl<T> TimedResponse<T> {
    fn new(payload: T, started: Instant) -> Self {
        Self {
            payload,
            response_time: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BatchRequest {
    jobs: Vec<TriggerJobRequest>,
}

#[derive(Deserialize)]
struct PeriodQuery {
    period: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CleanupQuery {
    older_than_hours: Option<u64>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct QueuedJobBody {
    job_id: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RetriesBody {
    requeued: u64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CleanupBody {
    purged: u64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthBody {
    status: &'static str,
    version: &'static str,
    database: &'static str,
}

fn parse_period(raw: Option<&str>) -> Result<ReportPeriod, ApiError> {
    raw.map_or(Ok(ReportPeriod::Day), |value| {
        value.parse::<ReportPeriod>().map_err(ApiError::from)
    })
}

async fn health(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    state
        .database
        .health_check()
        .await
        .map_err(EngineError::Other)?;

    Ok(success(HealthBody {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        database: "reachable",
    }))
}

async fn search(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
    ApiJson(request): ApiJson<ContextRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let started = Instant::now();
    let context = state.retriever.retrieve_context(&tenant_id, &request).await?;
    Ok(success(TimedResponse::new(context, started)))
}

async fn search_all(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
    ApiJson(request): ApiJson<ContextRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let started = Instant::now();
    let context = state
        .retriever
        .retrieve_all_context(&tenant_id, &request)
        .await?;
    Ok(success(TimedResponse::new(context, started)))
}

async fn queue_job(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
    ApiJson(request): ApiJson<TriggerJobRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let job_id = state.trigger.queue_trigger_job(&tenant_id, &request).await?;
    Ok(success(QueuedJobBody { job_id }))
}

async fn queue_batch(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
    ApiJson(request): ApiJson<BatchRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let queued = state
        .trigger
        .queue_batch_trigger_jobs(&tenant_id, &request.jobs)
        .await?;
    Ok(success(queued))
}

async fn job_status(
    State(state): State<AppState>,
    Path((tenant_id, job_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let status = state.trigger.get_job_status(&tenant_id, &job_id).await?;
    Ok(success(status))
}

async fn batch_status(
    State(state): State<AppState>,
    Path((tenant_id, batch_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let status = state.trigger.get_batch_status(&tenant_id, &batch_id).await?;
    Ok(success(status))
}

async fn retry_jobs(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let requeued = state.trigger.retry_failed_jobs(Some(&tenant_id)).await?;
    Ok(success(RetriesBody { requeued }))
}

async fn usage_report(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
    ApiQuery(query): ApiQuery<PeriodQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let period = parse_period(query.period.as_deref())?;
    let report = state.usage.report(&tenant_id, period).await?;
    Ok(success(report))
}

async fn admin_metrics(
    State(state): State<AppState>,
    ApiQuery(query): ApiQuery<PeriodQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let period = parse_period(query.period.as_deref())?;
    let metrics = state.usage.admin_metrics(period).await?;
    Ok(success(metrics))
}

async fn queue_stats(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let stats = state.trigger.queue_stats().await?;
    Ok(success(stats))
}

async fn cache_stats(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    Ok(success(state.cache.stats().await))
}

async fn cleanup(
    State(state): State<AppState>,
    ApiQuery(query): ApiQuery<CleanupQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let purged = state
        .trigger
        .cleanup_completed_jobs(query.older_than_hours)
        .await?;
    Ok(success(CleanupBody { purged }))
}

async fn unknown_route() -> ApiError {
    ApiError::new(ErrorCode::NotFound, "Route not found")
}
