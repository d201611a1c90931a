//! On-device embedding generation via fastembed.

use crate::embedding::EmbeddingProvider;
use crate::error::EmbedError;
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;

/// Local embedding model.
///
/// fastembed runs synchronously on the ONNX runtime, so calls are moved onto
/// the blocking pool.
pub struct LocalEmbedder {
    model: Arc<fastembed::TextEmbedding>,
    model_name: String,
}

impl LocalEmbedder {
    /// Load the default model, storing downloaded files in `cache_dir`.
    pub fn new(cache_dir: &Path) -> anyhow::Result<Self> {
        // Limit ONNX Runtime threads to prevent memory pressure.
        if std::env::var("OMP_NUM_THREADS").is_err() {
            // SAFETY: Called once during single-threaded init before any ONNX
            // threads are spawned.
            unsafe { std::env::set_var("OMP_NUM_THREADS", "2") };
        }

        let options = fastembed::InitOptions::default()
            .with_cache_dir(cache_dir.to_path_buf())
            .with_show_download_progress(false);

        let model = fastembed::TextEmbedding::try_new(options)
            .map_err(|error| anyhow::anyhow!("failed to load local embedding model: {error}"))?;

        Ok(Self {
            model: Arc::new(model),
            model_name: "fastembed-default".to_string(),
        })
    }
}

#[async_trait]
impl EmbeddingProvider for LocalEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        let text = text.to_string();
        let model = self.model.clone();
        let embeddings = tokio::task::spawn_blocking(move || model.embed(vec![text], None))
            .await
            .map_err(|error| EmbedError::Transient(format!("embedding task failed: {error}")))?
            .map_err(|error| EmbedError::Fatal(error.to_string()))?;

        embeddings
            .into_iter()
            .next()
            .ok_or_else(|| EmbedError::Fatal("model returned no embedding".into()))
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }
}
