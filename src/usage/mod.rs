
use chrono::{Duration, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use tracing::{debug, warn};

use crate::config::UsageConfig;
use crate::content::ContentType;
use crate::database::Database;
use crate::database::models::{NewUsageRecord, UsageOperation};
use crate::database::queries::UsageQueries;
use crate::{EngineError, Result};

/// Reporting window, measured backwards from now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportPeriod {
    Day,
    Week,
    Month,
}

impl ReportPeriod {
    pub fn window(self) -> Duration {
        match self {
            ReportPeriod::Day => Duration::hours(24),
            ReportPeriod::Week => Duration::days(7),
            ReportPeriod::Month => Duration::days(30),
        }
    }

    /// Hourly buckets for a day of data, daily buckets for longer windows.
    fn bucket_format(self) -> &'static str {
        match self {
            ReportPeriod::Day => "%Y-%m-%d %H:00",
            ReportPeriod::Week | ReportPeriod::Month => "%Y-%m-%d",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ReportPeriod::Day => "day",
            ReportPeriod::Week => "week",
            ReportPeriod::Month => "month",
        }
    }
}

impl fmt::Display for ReportPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReportPeriod {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "day" => Ok(ReportPeriod::Day),
            "week" => Ok(ReportPeriod::Week),
            "month" => Ok(ReportPeriod::Month),
            other => Err(EngineError::Validation(format!(
                "unknown report period {other:?}, expected day, week, or month"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageSummary {
    pub total_operations: i64,
    pub successful_operations: i64,
    pub failed_operations: i64,
    pub success_rate: f64,
    pub total_tokens: i64,
    pub total_api_calls: i64,
    pub avg_duration_ms: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationUsage {
    pub operations: i64,
    pub successful: i64,
    pub tokens: i64,
    pub api_calls: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentTypeUsage {
    pub operations: i64,
    pub tokens: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrendPoint {
    pub bucket: String,
    pub operations: i64,
    pub successful: i64,
    pub tokens: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertCode {
    LowSuccessRate,
    TokenBudgetExceeded,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageAlert {
    pub code: AlertCode,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageReport {
    pub tenant_id: String,
    pub period: ReportPeriod,
    pub window_start: NaiveDateTime,
    pub generated_at: NaiveDateTime,
    pub summary: UsageSummary,
    pub operations: BTreeMap<UsageOperation, OperationUsage>,
    pub content_types: BTreeMap<ContentType, ContentTypeUsage>,
    pub trend: Vec<TrendPoint>,
    pub alerts: Vec<UsageAlert>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantUsage {
    pub tenant_id: String,
    pub operations: i64,
    pub successful: i64,
    pub tokens: i64,
    pub api_calls: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminMetrics {
    pub period: ReportPeriod,
    pub window_start: NaiveDateTime,
    pub generated_at: NaiveDateTime,
    pub summary: UsageSummary,
    pub active_tenants: usize,
    pub tenants: Vec<TenantUsage>,
}

/// Append-only metering of provider calls, searches, and indexing work.
#[derive(Debug, Clone)]
pub struct UsageTracker {
    database: Database,
    config: UsageConfig,
}

impl UsageTracker {
    pub fn new(database: Database, config: UsageConfig) -> Self {
        Self { database, config }
    }

    /// Append a usage record. Metering must never fail the operation being
    /// metered, so insert errors are logged and swallowed.
    pub async fn record(&self, record: NewUsageRecord) {
        let now = Utc::now().naive_utc();
        if let Err(e) = UsageQueries::insert(self.database.pool(), &record, now).await {
            warn!(
                "Failed to record {} usage for tenant {}: {}",
                record.operation, record.tenant_id, e
            );
        }
    }

    pub async fn report(&self, tenant_id: &str, period: ReportPeriod) -> Result<UsageReport> {
        let generated_at = Utc::now().naive_utc();
        let window_start = generated_at - period.window();
        let pool = self.database.pool();

        debug!(
            "Building {} usage report for tenant {} since {}",
            period, tenant_id, window_start
        );

        let totals = UsageQueries::totals_for_tenant(pool, tenant_id, window_start).await?;
        let by_operation =
            UsageQueries::breakdown_by_operation(pool, tenant_id, window_start).await?;
        let by_content_type =
            UsageQueries::breakdown_by_content_type(pool, tenant_id, window_start).await?;
        let trend_rows =
            UsageQueries::trend(pool, tenant_id, window_start, period.bucket_format()).await?;

        let summary = build_summary(
            totals.total_operations,
            totals.successful_operations,
            totals.total_tokens,
            totals.total_api_calls,
            totals.avg_duration_ms,
        );
        let alerts = self.build_alerts(&summary, period);

        let operations = by_operation
            .into_iter()
            .map(|row| {
                (
                    row.operation,
                    OperationUsage {
                        operations: row.operations,
                        successful: row.successful,
                        tokens: row.tokens,
                        api_calls: row.api_calls,
                    },
                )
            })
            .collect();

        let content_types = by_content_type
            .into_iter()
            .map(|row| {
                (
                    row.content_type,
                    ContentTypeUsage {
                        operations: row.operations,
                        tokens: row.tokens,
                    },
                )
            })
            .collect();

        let trend = trend_rows
            .into_iter()
            .map(|row| TrendPoint {
                bucket: row.bucket,
                operations: row.operations,
                successful: row.successful,
                tokens: row.tokens,
            })
            .collect();

        Ok(UsageReport {
            tenant_id: tenant_id.to_owned(),
            period,
            window_start,
            generated_at,
            summary,
            operations,
            content_types,
            trend,
            alerts,
        })
    }

    /// Cross-tenant rollup for operators.
    pub async fn admin_metrics(&self, period: ReportPeriod) -> Result<AdminMetrics> {
        let generated_at = Utc::now().naive_utc();
        let window_start = generated_at - period.window();
        let pool = self.database.pool();

        let totals = UsageQueries::totals_all_tenants(pool, window_start).await?;
        let rollup = UsageQueries::tenant_rollup(pool, window_start).await?;

        let summary = build_summary(
            totals.total_operations,
            totals.successful_operations,
            totals.total_tokens,
            totals.total_api_calls,
            totals.avg_duration_ms,
        );

        let tenants: Vec<TenantUsage> = rollup
            .into_iter()
            .map(|row| TenantUsage {
                tenant_id: row.tenant_id,
                operations: row.operations,
                successful: row.successful,
                tokens: row.tokens,
                api_calls: row.api_calls,
            })
            .collect();

        Ok(AdminMetrics {
            period,
            window_start,
            generated_at,
            summary,
            active_tenants: tenants.len(),
            tenants,
        })
    }

    fn build_alerts(&self, summary: &UsageSummary, period: ReportPeriod) -> Vec<UsageAlert> {
        let mut alerts = Vec::new();

        // A window with no activity is healthy, not alarming.
        if summary.total_operations == 0 {
            return alerts;
        }

        let threshold = self.config.success_rate_alert_threshold;
        if summary.success_rate < threshold {
            alerts.push(UsageAlert {
                code: AlertCode::LowSuccessRate,
                message: format!(
                    "Success rate {:.1}% over the last {} is below the {:.1}% threshold",
                    summary.success_rate * 100.0,
                    period,
                    threshold * 100.0
                ),
            });
        }

        let budget = i64::try_from(self.config.token_alert_budget).unwrap_or(i64::MAX);
        if summary.total_tokens > budget {
            alerts.push(UsageAlert {
                code: AlertCode::TokenBudgetExceeded,
                message: format!(
                    "Token usage {} over the last {} exceeds the budget of {}",
                    summary.total_tokens, period, budget
                ),
            });
        }

        alerts
    }
}

fn build_summary(
    total: i64,
    successful: i64,
    tokens: i64,
    api_calls: i64,
    avg_duration_ms: f64,
) -> UsageSummary {
    let success_rate = if total == 0 {
        1.0
    } else {
        successful as f64 / total as f64
    };

    UsageSummary {
        total_operations: total,
        successful_operations: successful,
        failed_operations: total - successful,
        success_rate,
        total_tokens: tokens,
        total_api_calls: api_calls,
        avg_duration_ms,
    }
}
