//! Query gateway: free text in, ranked entity ids out.

use crate::dataset::EntityKind;
use crate::embedding::EmbeddingClient;
use crate::error::Result;
use crate::retry::{self, RetryPolicy};
use crate::vector::config::KindLimits;
use crate::vector::{IndexMatch, VectorIndex};
use std::sync::Arc;
use std::time::Duration;

/// Embeds free-text queries with the indexing embedder and asks the index
/// for nearest neighbours.
#[derive(Clone)]
pub struct QueryGateway {
    index: Arc<dyn VectorIndex>,
    embedder: EmbeddingClient,
    limits: KindLimits,
    retry: RetryPolicy,
    timeout: Duration,
}

impl QueryGateway {
    /// Index calls run under `timeout` and are retried with `retry` on
    /// transient failures.
    pub fn new(
        index: Arc<dyn VectorIndex>,
        embedder: EmbeddingClient,
        limits: KindLimits,
        retry: RetryPolicy,
        timeout: Duration,
    ) -> Self {
        Self {
            index,
            embedder,
            limits,
            retry,
            timeout,
        }
    }

    /// Nearest entities of `kind` to `text`, best first.
    ///
    /// `top_k` is clamped to the kind's ceiling. An empty result is returned
    /// when the text is blank or the index holds no vectors of that kind.
    pub async fn query(&self, text: &str, top_k: usize, kind: EntityKind) -> Result<Vec<IndexMatch>> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(Vec::new());
        }

        let ceiling = self.limits.for_kind(kind).max(1);
        let top_k = top_k.clamp(1, ceiling);

        let stored = retry::index_call(self.retry, self.timeout, "count", || {
            self.index.count(Some(kind))
        })
        .await?;
        if stored == 0 {
            tracing::debug!(%kind, "index holds no vectors for kind");
            return Ok(Vec::new());
        }

        let embedding = self.embedder.embed(text).await?;
        let matches = retry::index_call(self.retry, self.timeout, "query", || {
            self.index.query(&embedding, top_k, Some(kind))
        })
        .await?;

        tracing::debug!(%kind, top_k, returned = matches.len(), "query served");
        Ok(matches)
    }
}
