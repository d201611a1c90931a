//! Entity dataset loading.
//!
//! Upstream crawlers append one JSON object per line, tagged by `kind`. The
//! sync engine only ever sees the deduplicated, id-keyed view.

pub mod models;

use crate::error::DatasetError;
use std::collections::BTreeMap;
use std::io::BufRead;
use std::path::Path;

pub use models::{Attributes, Entity, EntityKind, Hotel, MetadataValue, Place, Restaurant};

/// The current dataset, keyed by entity id.
#[derive(Debug, Clone, Default)]
pub struct Dataset {
    entities: BTreeMap<String, Entity>,
}

impl Dataset {
    /// Build a dataset from entities. A later entity with an existing id
    /// replaces the earlier one.
    pub fn from_entities(entities: impl IntoIterator<Item = Entity>) -> Self {
        let mut map = BTreeMap::new();
        for entity in entities {
            map.insert(entity.id.clone(), entity);
        }
        Self { entities: map }
    }

    /// Load a JSON Lines file. Blank lines are skipped.
    pub fn load_jsonl(path: &Path) -> Result<Self, DatasetError> {
        let file = std::fs::File::open(path).map_err(|source| DatasetError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_reader(std::io::BufReader::new(file), path)
    }

    fn from_reader(reader: impl BufRead, path: &Path) -> Result<Self, DatasetError> {
        let mut entities = Vec::new();
        for (index, line) in reader.lines().enumerate() {
            let line = line.map_err(|source| DatasetError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            if line.trim().is_empty() {
                continue;
            }
            let entity: Entity = serde_json::from_str(&line).map_err(|source| {
                DatasetError::Parse {
                    line: index + 1,
                    source,
                }
            })?;
            entities.push(entity);
        }

        let dataset = Self::from_entities(entities);
        tracing::info!(path = %path.display(), count = dataset.len(), "loaded entity dataset");
        Ok(dataset)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Entity> {
        self.entities.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entities.contains_key(id)
    }

    /// Entities in id order.
    pub fn iter(&self) -> impl Iterator<Item = &Entity> {
        self.entities.values()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.entities.keys().map(String::as_str)
    }
}
