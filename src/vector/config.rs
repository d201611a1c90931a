//! Configuration for the vector index and query gateway.

use crate::dataset::EntityKind;
use serde::{Deserialize, Serialize};

/// Configuration for the remote vector index.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VectorConfig {
    /// Index backend: `lancedb` or `memory`.
    pub backend: IndexBackend,
    /// LanceDB connection URI: a local directory or an object-store URI.
    pub uri: String,
    /// Table holding entity vectors.
    pub table_name: String,
    /// Embedding dimension (must match the embedding model).
    pub embedding_dim: usize,
    /// Maximum records per upsert call.
    pub batch_size: usize,
    /// Attempts per batch before its ids are reported failed-to-sync.
    pub batch_attempts: u32,
    /// Upper bound on ids pulled by `list_ids` during diffing.
    pub list_ids_limit: usize,
    /// Per-kind ceiling for `top_k` in queries.
    pub max_results: KindLimits,
}

impl Default for VectorConfig {
    fn default() -> Self {
        Self {
            backend: IndexBackend::LanceDb,
            uri: "data/index".to_string(),
            table_name: "travel_entities".to_string(),
            embedding_dim: 384,
            batch_size: 100,
            batch_attempts: 3,
            list_ids_limit: 10_000,
            max_results: KindLimits::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexBackend {
    #[serde(alias = "lance")]
    LanceDb,
    Memory,
}

/// Per-kind `top_k` ceilings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct KindLimits {
    pub hotel: usize,
    pub place: usize,
    pub restaurant: usize,
}

impl KindLimits {
    pub fn for_kind(&self, kind: EntityKind) -> usize {
        match kind {
            EntityKind::Hotel => self.hotel,
            EntityKind::Place => self.place,
            EntityKind::Restaurant => self.restaurant,
        }
    }
}

impl Default for KindLimits {
    fn default() -> Self {
        Self {
            hotel: 20,
            place: 30,
            restaurant: 20,
        }
    }
}
