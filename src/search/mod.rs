
use std::cmp::Ordering;
use tracing::debug;

use crate::content::ContentType;
use crate::database::Database;
use crate::database::models::EmbeddingRecord;
use crate::database::queries::EmbeddingQueries;
use crate::{EngineError, Result};

pub const MIN_TOP_N: usize = 1;
pub const MAX_TOP_N: usize = 50;

/// Cosine similarity of two vectors, accumulated in f64 so float noise does
/// not reorder near-ties. A zero-magnitude vector scores 0.0 rather than
/// dividing by zero.
#[inline]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Result<f64> {
    if a.len() != b.len() {
        return Err(EngineError::DimensionMismatch {
            expected: a.len(),
            actual: b.len(),
        });
    }

    let mut dot = 0.0_f64;
    let mut norm_a = 0.0_f64;
    let mut norm_b = 0.0_f64;

    for (x, y) in a.iter().zip(b.iter()) {
        let x = f64::from(*x);
        let y = f64::from(*y);
        dot = x.mul_add(y, dot);
        norm_a = x.mul_add(x, norm_a);
        norm_b = y.mul_add(y, norm_b);
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return Ok(0.0);
    }

    Ok(dot / (norm_a.sqrt() * norm_b.sqrt()))
}

/// An active embedding row scored against a query vector.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub record: EmbeddingRecord,
    pub score: f64,
}

/// Brute-force cosine ranking over a tenant's active embeddings.
#[derive(Debug, Clone)]
pub struct SearchEngine {
    database: Database,
    dimension: usize,
}

impl SearchEngine {
    pub fn new(database: Database, dimension: usize) -> Self {
        Self {
            database,
            dimension,
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Rank a tenant's active embeddings against `query_vector`.
    ///
    /// Results are sorted by score descending; exact ties go to the more
    /// recently updated row. A stored vector whose dimension differs from
    /// the query is a hard error, not a skipped row.
    pub async fn search(
        &self,
        tenant_id: &str,
        query_vector: &[f32],
        content_type: Option<ContentType>,
        top_n: usize,
        min_score: f64,
    ) -> Result<Vec<SearchHit>> {
        if !(MIN_TOP_N..=MAX_TOP_N).contains(&top_n) {
            return Err(EngineError::Validation(format!(
                "top_n must be between {MIN_TOP_N} and {MAX_TOP_N}, got {top_n}"
            )));
        }
        if !min_score.is_finite() || !(0.0..=1.0).contains(&min_score) {
            return Err(EngineError::Validation(format!(
                "min_score must be within 0.0..=1.0, got {min_score}"
            )));
        }
        if query_vector.len() != self.dimension {
            return Err(EngineError::DimensionMismatch {
                expected: self.dimension,
                actual: query_vector.len(),
            });
        }

        let candidates =
            EmbeddingQueries::list_active(self.database.pool(), tenant_id, content_type).await?;
        let candidate_count = candidates.len();

        let mut hits = Vec::new();
        for record in candidates {
            let stored = record.decoded_vector().map_err(|e| {
                EngineError::Database(format!(
                    "corrupt vector for {}/{}/{}: {e}",
                    record.tenant_id, record.content_type, record.content_id
                ))
            })?;
            let score = cosine_similarity(query_vector, &stored)?;

            if score >= min_score {
                hits.push(SearchHit { record, score });
            }
        }

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| b.record.updated_at.cmp(&a.record.updated_at))
        });
        hits.truncate(top_n);

        debug!(
            "Search for tenant {} scored {} candidates, kept {} above {:.2}",
            tenant_id,
            candidate_count,
            hits.len(),
            min_score
        );

        Ok(hits)
    }
}
