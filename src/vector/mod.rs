//! Remote vector index abstraction and the query gateway.
//!
//! The index stores one entry per entity: the vector, the entity kind and a
//! sanitized metadata map. Similarity is always cosine.

pub mod config;
pub mod memory;
pub mod search;
pub mod table;

use crate::dataset::EntityKind;
use crate::error::IndexError;
use async_trait::async_trait;
use std::collections::HashSet;

pub use config::{IndexBackend, KindLimits, VectorConfig};
pub use memory::MemoryIndex;
pub use search::QueryGateway;
pub use table::LanceIndex;

/// Sanitized metadata as written to the index. Never contains `null`.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// A single index entry.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexRecord {
    pub id: String,
    pub kind: EntityKind,
    pub vector: Vec<f32>,
    pub metadata: Metadata,
}

/// A nearest-neighbour hit.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexMatch {
    pub id: String,
    /// Cosine similarity, higher is closer.
    pub score: f32,
    pub metadata: Metadata,
}

/// Operations the sync engine and query gateway need from the index.
///
/// Upserts are idempotent by id.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Insert or replace every record in the batch with one write.
    async fn upsert(&self, batch: &[IndexRecord]) -> Result<(), IndexError>;

    /// Nearest neighbours of `vector`, best first, optionally restricted to a kind.
    async fn query(
        &self,
        vector: &[f32],
        top_k: usize,
        kind: Option<EntityKind>,
    ) -> Result<Vec<IndexMatch>, IndexError>;

    /// Up to `limit` ids currently stored.
    async fn list_ids(&self, limit: usize) -> Result<HashSet<String>, IndexError>;

    async fn fetch(&self, id: &str) -> Result<Option<IndexRecord>, IndexError>;

    async fn delete(&self, id: &str) -> Result<(), IndexError>;

    /// Number of stored vectors, optionally restricted to a kind.
    async fn count(&self, kind: Option<EntityKind>) -> Result<usize, IndexError>;
}

/// Cosine similarity of two equal-length vectors. Zero vectors score 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}
