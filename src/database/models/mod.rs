
use anyhow::{Result, bail};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;

use crate::content::ContentType;

/// Active or soft-deleted embedding row.
#[derive(Debug, Clone, FromRow, PartialEq)]
pub struct EmbeddingRecord {
    pub id: i64,
    pub tenant_id: String,
    pub content_type: ContentType,
    pub content_id: String,
    pub content_text: String,
    pub metadata: String,
    pub vector: Vec<u8>,
    pub dimension: i64,
    pub model: String,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
    pub deleted_at: Option<NaiveDateTime>,
}

impl EmbeddingRecord {
    pub fn decoded_vector(&self) -> Result<Vec<f32>> {
        decode_vector(&self.vector)
    }

    /// Stored metadata as JSON; rows written through the engine always hold
    /// valid JSON, so a parse failure degrades to an empty object.
    pub fn metadata_value(&self) -> serde_json::Value {
        serde_json::from_str(&self.metadata)
            .unwrap_or_else(|_| serde_json::Value::Object(serde_json::Map::new()))
    }
}

#[derive(Debug, Clone)]
pub struct NewEmbedding {
    pub tenant_id: String,
    pub content_type: ContentType,
    pub content_id: String,
    pub content_text: String,
    pub metadata: serde_json::Value,
    pub vector: Vec<f32>,
    pub model: String,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type,
)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum JobOperation {
    Create,
    Update,
    Delete,
}

impl fmt::Display for JobOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobOperation::Create => "create",
            JobOperation::Update => "update",
            JobOperation::Delete => "delete",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, FromRow, PartialEq)]
pub struct IndexJob {
    pub id: i64,
    pub job_id: String,
    pub batch_id: Option<String>,
    pub tenant_id: String,
    pub operation: JobOperation,
    pub content_type: ContentType,
    pub content_id: String,
    pub payload: Option<String>,
    pub status: JobStatus,
    pub attempts: i64,
    pub error_message: Option<String>,
    pub run_after: NaiveDateTime,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
    pub completed_at: Option<NaiveDateTime>,
}

#[derive(Debug, Clone)]
pub struct NewIndexJob {
    pub job_id: String,
    pub batch_id: Option<String>,
    pub tenant_id: String,
    pub operation: JobOperation,
    pub content_type: ContentType,
    pub content_id: String,
    pub payload: Option<String>,
}

/// Metered operations. Embedding attempts are recorded by the generator;
/// the rest are terminal-outcome records from the retriever and workers.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type,
)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum UsageOperation {
    Embedding,
    Search,
    SearchAll,
    IndexCreate,
    IndexUpdate,
    IndexDelete,
}

impl UsageOperation {
    pub fn as_str(self) -> &'static str {
        match self {
            UsageOperation::Embedding => "embedding",
            UsageOperation::Search => "search",
            UsageOperation::SearchAll => "search_all",
            UsageOperation::IndexCreate => "index_create",
            UsageOperation::IndexUpdate => "index_update",
            UsageOperation::IndexDelete => "index_delete",
        }
    }
}

impl From<JobOperation> for UsageOperation {
    fn from(op: JobOperation) -> Self {
        match op {
            JobOperation::Create => UsageOperation::IndexCreate,
            JobOperation::Update => UsageOperation::IndexUpdate,
            JobOperation::Delete => UsageOperation::IndexDelete,
        }
    }
}

impl fmt::Display for UsageOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, FromRow, PartialEq)]
pub struct UsageRecord {
    pub id: i64,
    pub tenant_id: String,
    pub operation: UsageOperation,
    pub content_type: Option<ContentType>,
    pub token_count: i64,
    pub api_calls: i64,
    pub duration_ms: i64,
    pub success: bool,
    pub error_message: Option<String>,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone)]
pub struct NewUsageRecord {
    pub tenant_id: String,
    pub operation: UsageOperation,
    pub content_type: Option<ContentType>,
    pub token_count: i64,
    pub api_calls: i64,
    pub duration_ms: i64,
    pub success: bool,
    pub error_message: Option<String>,
}

/// Encode an embedding as little-endian f32 bytes for BLOB storage.
pub fn encode_vector(values: &[f32]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(values.len() * 4);
    for value in values {
        buf.extend_from_slice(&value.to_le_bytes());
    }
    buf
}

pub fn decode_vector(bytes: &[u8]) -> Result<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        bail!(
            "vector blob length {} is not a multiple of 4 bytes",
            bytes.len()
        );
    }

    Ok(bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}
