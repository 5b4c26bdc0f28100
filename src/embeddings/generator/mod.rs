
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use url::Url;

use super::tokens::{estimate_token_count, truncate_to_token_budget};
use crate::config::ProviderConfig;
use crate::database::models::{NewUsageRecord, UsageOperation};
use crate::usage::UsageTracker;
use crate::{EngineError, Result};

/// Shared backoff base: provider retries and queue retries both double the
/// delay on every attempt.
pub(crate) const EXPONENTIAL_BACKOFF_BASE: u64 = 2;

/// Source of embedding vectors. The engine depends on this trait rather than
/// a concrete client so retrieval and indexing can be tested without a
/// provider.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, tenant_id: &str, text: &str) -> Result<Vec<f32>>;

    /// Embed many texts, preserving input order in the output.
    async fn embed_batch(&self, tenant_id: &str, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    fn dimension(&self) -> usize;

    /// Name of the model producing the vectors, stored with each embedding.
    fn model(&self) -> &str;
}

/// Client for an OpenAI-compatible `/embeddings` endpoint.
#[derive(Debug, Clone)]
pub struct EmbeddingGenerator {
    client: reqwest::Client,
    base_url: Url,
    api_key: Option<String>,
    model: String,
    dimension: usize,
    batch_size: usize,
    max_input_tokens: usize,
    retry_attempts: u32,
    usage: UsageTracker,
}

#[derive(Debug, Serialize)]
struct EmbedRequest {
    model: String,
    input: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    data: Vec<EmbeddingData>,
    #[serde(default)]
    usage: Option<ProviderUsage>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    index: usize,
    embedding: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct ProviderUsage {
    #[serde(default)]
    prompt_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ModelsResponse {
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    message: String,
}

enum AttemptError {
    Retryable { status: Option<u16>, message: String },
    Fatal { status: Option<u16>, message: String },
}

impl EmbeddingGenerator {
    #[inline]
    pub fn new(config: &ProviderConfig, usage: UsageTracker) -> Result<Self> {
        let base_url = config
            .parsed_base_url()
            .map_err(|e| EngineError::Config(e.to_string()))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| EngineError::Config(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url,
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            dimension: config.dimension as usize,
            batch_size: config.batch_size as usize,
            max_input_tokens: config.max_input_tokens as usize,
            retry_attempts: config.retry_attempts,
            usage,
        })
    }

    #[inline]
    #[must_use]
    pub fn with_retry_attempts(mut self, attempts: u32) -> Self {
        self.retry_attempts = attempts;
        self
    }

    /// Verify the provider is reachable and serves the configured model.
    #[inline]
    pub async fn health_check(&self) -> Result<()> {
        let url = self.endpoint("models")?;
        debug!("Checking embedding provider at {}", url);

        let mut request = self.client.get(url);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| EngineError::Upstream(format!("Provider unreachable: {e}")))?;

        if !response.status().is_success() {
            return Err(EngineError::Upstream(format!(
                "Provider model listing failed: HTTP {}",
                response.status()
            )));
        }

        let models: ModelsResponse = response
            .json()
            .await
            .map_err(|e| EngineError::Upstream(format!("Failed to parse model listing: {e}")))?;

        if models.data.iter().any(|m| m.id == self.model) {
            info!(
                "Provider at {} is healthy and serves model {}",
                self.base_url, self.model
            );
            Ok(())
        } else {
            let available: Vec<&str> = models.data.iter().map(|m| m.id.as_str()).collect();
            warn!(
                "Model {} not found. Available models: {:?}",
                self.model, available
            );
            Err(EngineError::Config(format!(
                "Model '{}' is not available. Available models: {:?}",
                self.model, available
            )))
        }
    }

    fn endpoint(&self, leaf: &str) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| {
                EngineError::Config(format!("Provider URL {} cannot be a base", self.base_url))
            })?
            .pop_if_empty()
            .push(leaf);
        Ok(url)
    }

    /// One provider round trip for a single batch, with retries.
    ///
    /// Every HTTP attempt is metered, successful or not. Server errors and
    /// transport failures retry with exponential backoff; client errors fail
    /// immediately.
    async fn embed_inputs(&self, tenant_id: &str, inputs: &[String]) -> Result<Vec<Vec<f32>>> {
        let url = self.endpoint("embeddings")?;
        let request = EmbedRequest {
            model: self.model.clone(),
            input: inputs.to_vec(),
        };
        let estimated_tokens = estimate_inputs(inputs);

        let mut last_status = None;
        let mut last_message = String::new();

        for attempt in 1..=self.retry_attempts {
            debug!(
                "Embedding request attempt {}/{} ({} inputs)",
                attempt,
                self.retry_attempts,
                inputs.len()
            );

            let started = Instant::now();
            let outcome = self.send_batch(&url, &request).await;
            let duration_ms = millis(started.elapsed());

            match outcome {
                Ok(response) => {
                    let token_count = response
                        .usage
                        .as_ref()
                        .map_or(estimated_tokens, |u| i64::from(u.prompt_tokens));
                    self.record_attempt(tenant_id, token_count, duration_ms, true, None)
                        .await;

                    debug!("Embedding request succeeded on attempt {}", attempt);
                    return self.collect_vectors(response, inputs.len());
                }
                Err(AttemptError::Fatal { status, message }) => {
                    warn!(
                        "Embedding request failed without retry (status {:?}): {}",
                        status, message
                    );
                    self.record_attempt(
                        tenant_id,
                        estimated_tokens,
                        duration_ms,
                        false,
                        Some(&message),
                    )
                    .await;

                    return Err(EngineError::EmbeddingFailed {
                        attempts: attempt,
                        status,
                        message,
                    });
                }
                Err(AttemptError::Retryable { status, message }) => {
                    warn!(
                        "Embedding request attempt {}/{} failed (status {:?}): {}",
                        attempt, self.retry_attempts, status, message
                    );
                    self.record_attempt(
                        tenant_id,
                        estimated_tokens,
                        duration_ms,
                        false,
                        Some(&message),
                    )
                    .await;

                    last_status = status;
                    last_message = message;

                    if attempt < self.retry_attempts {
                        let delay = Duration::from_millis(
                            EXPONENTIAL_BACKOFF_BASE.pow(attempt - 1) * 1000,
                        );
                        debug!("Waiting {:?} before retry", delay);
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        error!(
            "All {} embedding attempts failed for {}",
            self.retry_attempts, self.base_url
        );

        Err(EngineError::EmbeddingFailed {
            attempts: self.retry_attempts,
            status: last_status,
            message: last_message,
        })
    }

    async fn send_batch(
        &self,
        url: &Url,
        request: &EmbedRequest,
    ) -> std::result::Result<EmbedResponse, AttemptError> {
        let mut builder = self.client.post(url.clone()).json(request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(|e| AttemptError::Retryable {
            status: None,
            message: format!("transport error: {e}"),
        })?;

        let status = response.status();
        if status.is_success() {
            return response.json().await.map_err(|e| AttemptError::Fatal {
                status: None,
                message: format!("Failed to parse embedding response: {e}"),
            });
        }

        let code = status.as_u16();
        let message = read_error_message(response).await;
        if status.is_server_error() {
            Err(AttemptError::Retryable {
                status: Some(code),
                message,
            })
        } else {
            Err(AttemptError::Fatal {
                status: Some(code),
                message,
            })
        }
    }

    fn collect_vectors(&self, response: EmbedResponse, expected: usize) -> Result<Vec<Vec<f32>>> {
        if response.data.len() != expected {
            return Err(EngineError::Upstream(format!(
                "provider returned {} embeddings for {} inputs",
                response.data.len(),
                expected
            )));
        }

        // Providers may stream results out of order; the index field is the
        // contract for matching them back to inputs.
        let mut data = response.data;
        data.sort_by_key(|entry| entry.index);

        data.into_iter()
            .map(|entry| {
                if entry.embedding.len() == self.dimension {
                    Ok(entry.embedding)
                } else {
                    Err(EngineError::DimensionMismatch {
                        expected: self.dimension,
                        actual: entry.embedding.len(),
                    })
                }
            })
            .collect()
    }

    async fn record_attempt(
        &self,
        tenant_id: &str,
        token_count: i64,
        duration_ms: i64,
        success: bool,
        error: Option<&str>,
    ) {
        self.usage
            .record(NewUsageRecord {
                tenant_id: tenant_id.to_owned(),
                operation: UsageOperation::Embedding,
                content_type: None,
                token_count,
                api_calls: 1,
                duration_ms,
                success,
                error_message: error.map(str::to_owned),
            })
            .await;
    }
}

#[async_trait]
impl Embedder for EmbeddingGenerator {
    async fn embed(&self, tenant_id: &str, text: &str) -> Result<Vec<f32>> {
        if text.trim().is_empty() {
            return Err(EngineError::Validation(
                "cannot embed text that is empty after trimming".to_string(),
            ));
        }
        let prepared = truncate_to_token_budget(text, self.max_input_tokens).into_owned();

        self.embed_inputs(tenant_id, &[prepared])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| EngineError::Upstream("provider returned no embedding".to_owned()))
    }

    async fn embed_batch(&self, tenant_id: &str, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        if let Some(position) = texts.iter().position(|text| text.trim().is_empty()) {
            return Err(EngineError::Validation(format!(
                "cannot embed text that is empty after trimming (input {position})"
            )));
        }

        let prepared: Vec<String> = texts
            .iter()
            .map(|text| truncate_to_token_budget(text, self.max_input_tokens).into_owned())
            .collect();

        let mut results = Vec::with_capacity(prepared.len());
        for chunk in prepared.chunks(self.batch_size) {
            let vectors = self.embed_inputs(tenant_id, chunk).await?;
            results.extend(vectors);
        }

        debug!("Generated {} embeddings", results.len());
        Ok(results)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model(&self) -> &str {
        &self.model
    }
}

fn estimate_inputs(inputs: &[String]) -> i64 {
    let total: usize = inputs.iter().map(|text| estimate_token_count(text)).sum();
    i64::try_from(total).unwrap_or(i64::MAX)
}

fn millis(elapsed: Duration) -> i64 {
    i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX)
}

async fn read_error_message(response: reqwest::Response) -> String {
    let status = response.status();
    match response.text().await {
        Ok(body) => match serde_json::from_str::<ErrorBody>(&body) {
            Ok(parsed) => parsed.error.message,
            Err(_) => {
                let trimmed = body.trim();
                if trimmed.is_empty() {
                    format!("HTTP {status}")
                } else {
                    trimmed.chars().take(200).collect()
                }
            }
        },
        Err(_) => format!("HTTP {status}"),
    }
}
