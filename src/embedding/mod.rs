//! Embedding generation.
//!
//! Providers talk to an embedding backend and classify failures as
//! [`EmbedError::Transient`] or [`EmbedError::Fatal`]. [`EmbeddingClient`]
//! adds input truncation, a per-call timeout, dimension validation and the
//! backoff loop shared by indexing and querying.

pub mod local;
pub mod openai;

use crate::error::EmbedError;
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

pub use local::LocalEmbedder;
pub use openai::OpenAiEmbedder;

/// Provider-agnostic embedding backend.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Generate an embedding for a single text. Exactly one backend call.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError>;

    /// The model name used by this provider.
    fn model_name(&self) -> &str;
}

/// Truncate `text` to at most `max_chars` characters.
///
/// Character count approximates the backend's token budget; truncation is
/// lossy.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((byte_index, _)) => &text[..byte_index],
        None => text,
    }
}

/// Embedding client shared by the sync engine and the query gateway.
#[derive(Clone)]
pub struct EmbeddingClient {
    provider: Arc<dyn EmbeddingProvider>,
    dimension: usize,
    max_input_chars: usize,
    timeout: Duration,
    retry: RetryPolicy,
}

impl EmbeddingClient {
    pub fn new(
        provider: Arc<dyn EmbeddingProvider>,
        dimension: usize,
        max_input_chars: usize,
        timeout: Duration,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            provider,
            dimension,
            max_input_chars,
            timeout,
            retry,
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn model_name(&self) -> &str {
        self.provider.model_name()
    }

    /// One attempt: truncate, call the provider under the timeout, validate
    /// the dimension.
    pub async fn embed_once(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        let input = truncate_chars(text, self.max_input_chars);
        if input.trim().is_empty() {
            return Err(EmbedError::Fatal("empty input text".into()));
        }

        let embedding = match tokio::time::timeout(self.timeout, self.provider.embed(input)).await
        {
            Ok(result) => result?,
            Err(_) => {
                return Err(EmbedError::Transient(format!(
                    "embedding call timed out after {:?}",
                    self.timeout
                )));
            }
        };

        if embedding.len() != self.dimension {
            return Err(EmbedError::Fatal(format!(
                "embedding dimension mismatch: expected {}, got {}",
                self.dimension,
                embedding.len()
            )));
        }
        if embedding.iter().any(|value| !value.is_finite()) {
            return Err(EmbedError::Fatal("embedding contains non-finite values".into()));
        }

        Ok(embedding)
    }

    /// Embed with exponential backoff on transient failures.
    ///
    /// Fatal failures return immediately. After the last attempt the final
    /// transient error is returned.
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.embed_once(text).await {
                Ok(embedding) => return Ok(embedding),
                Err(error) if error.is_transient() && attempt < self.retry.max_attempts => {
                    let delay = self.retry.delay_for(attempt);
                    tracing::debug!(attempt, ?delay, %error, "transient embedding failure, backing off");
                    tokio::time::sleep(delay).await;
                }
                Err(error) => return Err(error),
            }
        }
    }
}
