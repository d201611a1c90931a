#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tripvector::dataset::{Attributes, Entity, EntityKind, Hotel, Place, Restaurant};
use tripvector::embedding::{EmbeddingClient, EmbeddingProvider};
use tripvector::error::{EmbedError, IndexError};
use tripvector::retry::RetryPolicy;
use tripvector::sync::{CheckpointStore, Snapshot, SyncEngine, SyncOptions};
use tripvector::vector::{IndexMatch, IndexRecord, MemoryIndex, VectorIndex};

pub const DIM: usize = 4;

/// Deterministic embedder that counts calls. With `hang_after = Some(k)`,
/// every call after the k-th never completes; with `stall_on`, neither does
/// any call whose text contains it. `latency` delays each call by a
/// text-dependent amount.
#[derive(Default)]
pub struct CountingEmbedder {
    pub calls: AtomicUsize,
    pub hang_after: Option<usize>,
    pub stall_on: Option<String>,
    pub latency: Option<fn(&str) -> Duration>,
}

impl CountingEmbedder {
    pub fn hanging_after(k: usize) -> Self {
        Self {
            hang_after: Some(k),
            ..Default::default()
        }
    }

    pub fn with_latency(latency: fn(&str) -> Duration) -> Self {
        Self {
            latency: Some(latency),
            ..Default::default()
        }
    }

    pub fn stalling_on(mut self, text: &str) -> Self {
        self.stall_on = Some(text.to_string());
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

pub fn vector_for(text: &str) -> Vec<f32> {
    let mut vector = vec![1.0f32; DIM];
    for (i, byte) in text.bytes().enumerate() {
        vector[i % DIM] += byte as f32 / 255.0;
    }
    vector
}

#[async_trait]
impl EmbeddingProvider for CountingEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency(text)).await;
        }
        let stalled = self
            .stall_on
            .as_deref()
            .is_some_and(|needle| text.contains(needle));
        if stalled || self.hang_after.is_some_and(|k| call > k) {
            std::future::pending::<()>().await;
        }
        Ok(vector_for(text))
    }

    fn model_name(&self) -> &str {
        "counting"
    }
}

/// Memory index that records upsert batches and can fail them on demand.
#[derive(Default)]
pub struct RecordingIndex {
    pub inner: MemoryIndex,
    pub batches: Mutex<Vec<Vec<String>>>,
    pub failing: AtomicUsize,
}

impl RecordingIndex {
    pub fn batches(&self) -> Vec<Vec<String>> {
        self.batches.lock().unwrap().clone()
    }

    pub fn fail_next_upserts(&self, n: usize) {
        self.failing.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl VectorIndex for RecordingIndex {
    async fn upsert(&self, batch: &[IndexRecord]) -> Result<(), IndexError> {
        let failing = self.failing.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing.store(failing - 1, Ordering::SeqCst);
            return Err(IndexError::Transient("service unavailable".into()));
        }
        self.batches
            .lock()
            .unwrap()
            .push(batch.iter().map(|record| record.id.clone()).collect());
        self.inner.upsert(batch).await
    }

    async fn query(
        &self,
        vector: &[f32],
        top_k: usize,
        kind: Option<EntityKind>,
    ) -> Result<Vec<IndexMatch>, IndexError> {
        self.inner.query(vector, top_k, kind).await
    }

    async fn list_ids(&self, limit: usize) -> Result<HashSet<String>, IndexError> {
        self.inner.list_ids(limit).await
    }

    async fn fetch(&self, id: &str) -> Result<Option<IndexRecord>, IndexError> {
        self.inner.fetch(id).await
    }

    async fn delete(&self, id: &str) -> Result<(), IndexError> {
        self.inner.delete(id).await
    }

    async fn count(&self, kind: Option<EntityKind>) -> Result<usize, IndexError> {
        self.inner.count(kind).await
    }
}

pub fn client(provider: Arc<CountingEmbedder>) -> EmbeddingClient {
    EmbeddingClient::new(
        provider,
        DIM,
        2_000,
        Duration::from_secs(30),
        RetryPolicy::new(1, Duration::ZERO, Duration::ZERO),
    )
}

pub fn options(batch_size: usize, checkpoint_interval: usize) -> SyncOptions {
    SyncOptions {
        batch_size,
        checkpoint_interval,
        index_retry: RetryPolicy::new(1, Duration::ZERO, Duration::ZERO),
        ..Default::default()
    }
}

pub fn engine(
    provider: Arc<CountingEmbedder>,
    index: Arc<RecordingIndex>,
    snapshot: Snapshot,
    checkpoint_path: &Path,
    options: SyncOptions,
) -> SyncEngine {
    SyncEngine::new(
        client(provider),
        index,
        snapshot,
        CheckpointStore::new(checkpoint_path),
        options,
    )
}

pub fn hotel(id: &str, name: &str, rating: Option<f64>) -> Entity {
    Entity::new(
        id,
        Attributes::Hotel(Hotel {
            name: name.to_string(),
            city: "Lisbon".to_string(),
            rating,
            amenities: vec!["wifi".to_string()],
            ..Default::default()
        }),
    )
}

pub fn place(id: &str, name: &str) -> Entity {
    Entity::new(
        id,
        Attributes::Place(Place {
            name: name.to_string(),
            city: "Porto".to_string(),
            rating: Some(4.5),
            ..Default::default()
        }),
    )
}

pub fn restaurant(id: &str, name: &str) -> Entity {
    Entity::new(
        id,
        Attributes::Restaurant(Restaurant {
            name: name.to_string(),
            cuisine: "Portuguese".to_string(),
            rating: Some(4.2),
            ..Default::default()
        }),
    )
}
