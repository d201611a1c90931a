//! In-process vector index.
//!
//! Brute-force cosine search over a map. Backs dry runs (`backend = "memory"`)
//! and tests; contents are lost when the process exits.

use crate::dataset::EntityKind;
use crate::error::IndexError;
use crate::vector::{IndexMatch, IndexRecord, VectorIndex, cosine_similarity};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::sync::RwLock;

#[derive(Default)]
pub struct MemoryIndex {
    entries: RwLock<BTreeMap<String, IndexRecord>>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(
        &self,
    ) -> Result<std::sync::RwLockReadGuard<'_, BTreeMap<String, IndexRecord>>, IndexError> {
        self.entries
            .read()
            .map_err(|_| IndexError::Fatal("memory index lock poisoned".into()))
    }

    fn write(
        &self,
    ) -> Result<std::sync::RwLockWriteGuard<'_, BTreeMap<String, IndexRecord>>, IndexError> {
        self.entries
            .write()
            .map_err(|_| IndexError::Fatal("memory index lock poisoned".into()))
    }
}

#[async_trait]
impl VectorIndex for MemoryIndex {
    async fn upsert(&self, batch: &[IndexRecord]) -> Result<(), IndexError> {
        let mut entries = self.write()?;
        for record in batch {
            entries.insert(record.id.clone(), record.clone());
        }
        Ok(())
    }

    async fn query(
        &self,
        vector: &[f32],
        top_k: usize,
        kind: Option<EntityKind>,
    ) -> Result<Vec<IndexMatch>, IndexError> {
        let entries = self.read()?;
        let mut matches: Vec<IndexMatch> = entries
            .values()
            .filter(|record| kind.is_none_or(|kind| record.kind == kind))
            .map(|record| IndexMatch {
                id: record.id.clone(),
                score: cosine_similarity(vector, &record.vector),
                metadata: record.metadata.clone(),
            })
            .collect();

        matches.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        matches.truncate(top_k);
        Ok(matches)
    }

    async fn list_ids(&self, limit: usize) -> Result<HashSet<String>, IndexError> {
        Ok(self.read()?.keys().take(limit).cloned().collect())
    }

    async fn fetch(&self, id: &str) -> Result<Option<IndexRecord>, IndexError> {
        Ok(self.read()?.get(id).cloned())
    }

    async fn delete(&self, id: &str) -> Result<(), IndexError> {
        self.write()?.remove(id);
        Ok(())
    }

    async fn count(&self, kind: Option<EntityKind>) -> Result<usize, IndexError> {
        Ok(self
            .read()?
            .values()
            .filter(|record| kind.is_none_or(|kind| record.kind == kind))
            .count())
    }
}
