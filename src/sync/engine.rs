//! One synchronization run: diff, embed, snapshot, upsert.

use crate::dataset::Dataset;
use crate::embedding::EmbeddingClient;
use crate::error::{IndexError, Result};
use crate::retry::{self, RetryPolicy};
use crate::sync::checkpoint::{Checkpoint, CheckpointStore};
use crate::sync::diff::diff;
use crate::sync::render::{RenderDefaults, render};
use crate::sync::snapshot::{Snapshot, SnapshotRow};
use crate::sync::upsert::{BatchUpserter, sanitize};
use crate::vector::{IndexRecord, VectorIndex};
use chrono::Utc;
use futures::StreamExt as _;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::Instrument as _;

/// Knobs for a sync run.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Save the checkpoint after this many processed rows.
    pub checkpoint_interval: usize,
    /// Embedding calls in flight at once.
    pub concurrency: usize,
    /// Take a remote id listing even when a snapshot exists.
    pub reconcile_remote: bool,
    pub list_ids_limit: usize,
    pub batch_size: usize,
    /// Retry policy for index calls (batches, listing, fetch).
    pub index_retry: RetryPolicy,
    /// Timeout applied to every index call.
    pub request_timeout: Duration,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            checkpoint_interval: 50,
            concurrency: 1,
            reconcile_remote: false,
            list_ids_limit: 10_000,
            batch_size: 100,
            index_retry: RetryPolicy::new(3, Duration::from_millis(500), Duration::from_secs(8)),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// What a run did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    /// Entities in the dataset.
    pub total: usize,
    /// Entities that already had a vector in the snapshot.
    pub already_embedded: usize,
    /// Vectors added to the snapshot by this run, resumed ones included.
    pub newly_embedded: usize,
    /// Rows whose embedding failed; retried on the next run.
    pub failed: usize,
    pub upserted: usize,
    pub failed_to_sync: usize,
    /// Vectors taken from a checkpoint left by an interrupted run.
    pub resumed: usize,
    /// Rows recovered from the remote index into an empty snapshot.
    pub adopted: usize,
    /// Actual embedding calls that produced a vector.
    pub embed_calls: usize,
}

/// Ids listed from the index. `complete` is false when the listing hit
/// its limit.
struct RemoteListing {
    ids: HashSet<String>,
    complete: bool,
}

/// Drives synchronization of a dataset into the vector index.
pub struct SyncEngine {
    embedder: EmbeddingClient,
    index: Arc<dyn VectorIndex>,
    snapshot: Snapshot,
    checkpoints: CheckpointStore,
    upserter: BatchUpserter,
    options: SyncOptions,
}

impl SyncEngine {
    pub fn new(
        embedder: EmbeddingClient,
        index: Arc<dyn VectorIndex>,
        snapshot: Snapshot,
        checkpoints: CheckpointStore,
        options: SyncOptions,
    ) -> Self {
        let upserter = BatchUpserter::new(
            index.clone(),
            options.batch_size,
            options.index_retry,
            options.request_timeout,
        );
        Self {
            embedder,
            index,
            snapshot,
            checkpoints,
            upserter,
            options,
        }
    }

    /// Run one synchronization pass.
    ///
    /// Row and batch failures are counted in the summary. Snapshot and
    /// checkpoint I/O failures abort the run; rerunning is always safe.
    pub async fn run(&self, dataset: &Dataset) -> Result<RunSummary> {
        let run_id = uuid::Uuid::new_v4();
        let span = tracing::info_span!("sync_run", %run_id);
        self.run_inner(dataset).instrument(span).await
    }

    async fn run_inner(&self, dataset: &Dataset) -> Result<RunSummary> {
        let started = std::time::Instant::now();
        let defaults = RenderDefaults::from_dataset(dataset);
        let mut summary = RunSummary {
            total: dataset.len(),
            ..Default::default()
        };

        let mut rows = self.snapshot.load_all().await?;
        let snapshot_empty = rows.is_empty();
        let listing = if snapshot_empty || self.options.reconcile_remote {
            self.remote_listing().await
        } else {
            None
        };
        if snapshot_empty && let Some(listing) = &listing {
            summary.adopted = self.adopt(dataset, &defaults, &listing.ids, &mut rows).await;
        }
        // A truncated listing cannot prove absence; fall back to the synced flags.
        let remote_ids = listing
            .filter(|listing| listing.complete)
            .map(|listing| listing.ids);

        let partition = diff(dataset, &rows, remote_ids.as_ref());
        summary.already_embedded = partition.unchanged.len() + partition.to_upsert_only.len();

        // Embed the working set, resuming from any matching checkpoint.
        let working_set = &partition.to_embed;
        let fingerprint = Checkpoint::fingerprint(working_set.iter().map(String::as_str));
        let mut checkpoint = match self.checkpoints.load()? {
            Some(checkpoint) if checkpoint.fingerprint == fingerprint => {
                summary.resumed = checkpoint.embeddings.len();
                tracing::info!(resumed = summary.resumed, "resuming from checkpoint");
                checkpoint
            }
            Some(_) => {
                tracing::warn!(
                    path = %self.checkpoints.path().display(),
                    "checkpoint belongs to a different working set, discarding"
                );
                Checkpoint::new(fingerprint)
            }
            None => Checkpoint::new(fingerprint),
        };

        let contexts: Vec<String> = working_set
            .iter()
            .map(|id| {
                dataset
                    .get(id)
                    .map(|entity| render(entity, &defaults))
                    .unwrap_or_default()
            })
            .collect();
        let pending: Vec<usize> = (0..working_set.len())
            .filter(|offset| !checkpoint.embeddings.contains_key(offset))
            .collect();

        let embedder = &self.embedder;
        let mut results = futures::stream::iter(pending)
            .map(|offset| {
                let context = &contexts[offset];
                async move { (offset, embedder.embed(context).await) }
            })
            .buffered(self.options.concurrency.max(1));

        let interval = self.options.checkpoint_interval.max(1);
        let mut since_save = 0usize;
        let mut failed_ids = Vec::new();
        while let Some((offset, result)) = results.next().await {
            let mut save_now = false;
            match result {
                Ok(vector) => {
                    checkpoint.embeddings.insert(offset, vector);
                    summary.embed_calls += 1;
                }
                Err(error) => {
                    tracing::warn!(id = %working_set[offset], %error, "embedding failed, skipping row");
                    failed_ids.push(working_set[offset].clone());
                    save_now = true;
                }
            }
            checkpoint.last_processed_index = checkpoint.last_processed_index.max(Some(offset));
            since_save += 1;
            if save_now || since_save >= interval {
                self.checkpoints.save(&checkpoint)?;
                since_save = 0;
            }
        }
        summary.failed = failed_ids.len();
        summary.newly_embedded = checkpoint.embeddings.len();

        // Fold new vectors and latest attributes into the snapshot.
        let embedded_at = Utc::now();
        let mut newly_embedded = Vec::with_capacity(checkpoint.embeddings.len());
        for (offset, vector) in std::mem::take(&mut checkpoint.embeddings) {
            let (Some(id), Some(context)) = (working_set.get(offset), contexts.get(offset)) else {
                continue;
            };
            let Some(entity) = dataset.get(id) else {
                continue;
            };
            rows.insert(
                id.clone(),
                SnapshotRow {
                    id: id.clone(),
                    kind: entity.kind(),
                    context: context.clone(),
                    embedding: vector,
                    entity: entity.clone(),
                    synced: false,
                    embedded_at,
                },
            );
            newly_embedded.push(id.clone());
        }
        for id in partition.unchanged.iter().chain(&partition.to_upsert_only) {
            if let (Some(row), Some(entity)) = (rows.get_mut(id), dataset.get(id)) {
                row.kind = entity.kind();
                row.entity = entity.clone();
            }
        }
        for id in &partition.to_upsert_only {
            if let Some(row) = rows.get_mut(id) {
                row.synced = false;
            }
        }

        self.snapshot.replace_all(rows.values()).await?;
        self.checkpoints.clear()?;

        let mut to_upsert: Vec<&String> = newly_embedded
            .iter()
            .chain(&partition.to_upsert_only)
            .collect();
        to_upsert.sort();
        let records: Vec<IndexRecord> = to_upsert
            .into_iter()
            .filter_map(|id| rows.get(id))
            .map(|row| IndexRecord {
                id: row.id.clone(),
                kind: row.kind,
                vector: row.embedding.clone(),
                metadata: sanitize(&row.entity.metadata()),
            })
            .collect();

        let report = self.upserter.upsert_all(&records).await;
        self.snapshot.mark_synced(&report.upserted).await?;
        summary.upserted = report.upserted.len();
        summary.failed_to_sync = report.failed.len();

        tracing::info!(
            total = summary.total,
            already_embedded = summary.already_embedded,
            newly_embedded = summary.newly_embedded,
            failed = summary.failed,
            upserted = summary.upserted,
            failed_to_sync = summary.failed_to_sync,
            resumed = summary.resumed,
            adopted = summary.adopted,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "sync run complete"
        );
        Ok(summary)
    }

    /// Bounded listing of remote ids. A failed listing is logged and treated
    /// as unknown.
    async fn remote_listing(&self) -> Option<RemoteListing> {
        let limit = self.options.list_ids_limit;
        match self.index_call("list_ids", || self.index.list_ids(limit)).await {
            Ok(ids) => {
                let complete = ids.len() < limit;
                if !complete {
                    tracing::warn!(limit, "remote id listing hit its limit, it may be partial");
                }
                Some(RemoteListing { ids, complete })
            }
            Err(error) => {
                tracing::warn!(%error, "could not list remote ids");
                None
            }
        }
    }

    /// Pull vectors for dataset ids the index already holds into `rows`.
    async fn adopt(
        &self,
        dataset: &Dataset,
        defaults: &RenderDefaults,
        remote_ids: &HashSet<String>,
        rows: &mut BTreeMap<String, SnapshotRow>,
    ) -> usize {
        let embedded_at = Utc::now();
        let mut adopted = 0;

        for entity in dataset.iter().filter(|entity| remote_ids.contains(&entity.id)) {
            let record = match self.index_call("fetch", || self.index.fetch(&entity.id)).await {
                Ok(Some(record)) => record,
                Ok(None) => continue,
                Err(error) => {
                    tracing::warn!(id = %entity.id, %error, "could not fetch remote vector, will re-embed");
                    continue;
                }
            };
            if record.vector.len() != self.embedder.dimension() {
                tracing::warn!(
                    id = %entity.id,
                    dimension = record.vector.len(),
                    "remote vector has the wrong dimension, will re-embed"
                );
                continue;
            }

            rows.insert(
                entity.id.clone(),
                SnapshotRow {
                    id: entity.id.clone(),
                    kind: entity.kind(),
                    context: render(entity, defaults),
                    embedding: record.vector,
                    entity: entity.clone(),
                    synced: true,
                    embedded_at,
                },
            );
            adopted += 1;
        }

        if adopted > 0 {
            tracing::info!(adopted, "adopted vectors from the remote index");
        }
        adopted
    }

    async fn index_call<T, F, Fut>(
        &self,
        operation: &str,
        call: F,
    ) -> std::result::Result<T, IndexError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = std::result::Result<T, IndexError>>,
    {
        retry::index_call(
            self.options.index_retry,
            self.options.request_timeout,
            operation,
            call,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{Attributes, Entity, EntityKind, Hotel, Place};
    use crate::embedding::EmbeddingProvider;
    use crate::error::EmbedError;
    use crate::vector::MemoryIndex;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Deterministic 3-d vectors; fails every text containing `poison`.
    #[derive(Default)]
    struct CountingEmbedder {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EmbeddingProvider for CountingEmbedder {
        async fn embed(&self, text: &str) -> std::result::Result<Vec<f32>, EmbedError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if text.contains("poison") {
                return Err(EmbedError::Fatal("invalid input".into()));
            }
            Ok(vec![text.len() as f32, 1.0, 0.5])
        }

        fn model_name(&self) -> &str {
            "counting"
        }
    }

    fn place(id: &str, name: &str) -> Entity {
        Entity::new(
            id,
            Attributes::Place(Place {
                name: name.to_string(),
                rating: Some(4.0),
                ..Default::default()
            }),
        )
    }

    fn engine(
        provider: Arc<CountingEmbedder>,
        index: Arc<MemoryIndex>,
        snapshot: Snapshot,
        checkpoints: CheckpointStore,
    ) -> SyncEngine {
        engine_with(
            provider,
            index,
            snapshot,
            checkpoints,
            SyncOptions {
                checkpoint_interval: 2,
                batch_size: 2,
                ..Default::default()
            },
        )
    }

    fn engine_with(
        provider: Arc<CountingEmbedder>,
        index: Arc<MemoryIndex>,
        snapshot: Snapshot,
        checkpoints: CheckpointStore,
        options: SyncOptions,
    ) -> SyncEngine {
        let embedder = EmbeddingClient::new(
            provider,
            3,
            1000,
            Duration::from_secs(5),
            RetryPolicy::new(1, Duration::ZERO, Duration::ZERO),
        );
        SyncEngine::new(embedder, index, snapshot, checkpoints, options)
    }

    #[tokio::test]
    async fn test_failed_row_is_skipped_and_retried_next_run() {
        let temp = tempfile::tempdir().expect("tempdir");
        let provider = Arc::new(CountingEmbedder::default());
        let index = Arc::new(MemoryIndex::new());
        let snapshot = Snapshot::in_memory().await.unwrap();
        let checkpoints = CheckpointStore::new(temp.path().join("checkpoint.json"));
        let engine = engine(provider.clone(), index.clone(), snapshot.clone(), checkpoints.clone());

        let dataset = Dataset::from_entities([place("1", "Museum"), place("2", "poison")]);
        let first = engine.run(&dataset).await.unwrap();
        assert_eq!(first.newly_embedded, 1);
        assert_eq!(first.failed, 1);
        assert_eq!(first.upserted, 1);
        assert!(checkpoints.load().unwrap().is_none());
        assert_eq!(snapshot.counts().await.unwrap().total, 1);

        let fixed = Dataset::from_entities([place("1", "Museum"), place("2", "Gallery")]);
        let second = engine.run(&fixed).await.unwrap();
        assert_eq!(second.newly_embedded, 1);
        assert_eq!(second.already_embedded, 1);
        assert_eq!(second.upserted, 1);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
        assert_eq!(index.count(None).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_changed_attributes_flow_to_snapshot_without_reembedding() {
        let temp = tempfile::tempdir().expect("tempdir");
        let provider = Arc::new(CountingEmbedder::default());
        let index = Arc::new(MemoryIndex::new());
        let snapshot = Snapshot::in_memory().await.unwrap();
        let engine = engine(
            provider.clone(),
            index,
            snapshot.clone(),
            CheckpointStore::new(temp.path().join("checkpoint.json")),
        );

        engine.run(&Dataset::from_entities([place("1", "Museum")])).await.unwrap();
        let before = snapshot.load_all().await.unwrap()["1"].clone();

        let renamed = Dataset::from_entities([place("1", "City Museum")]);
        let summary = engine.run(&renamed).await.unwrap();
        assert_eq!(summary.newly_embedded, 0);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);

        let after = snapshot.load_all().await.unwrap()["1"].clone();
        assert_eq!(after.embedding, before.embedding);
        assert_eq!(after.context, before.context);
        assert_eq!(after.entity.name(), "City Museum");
    }

    #[tokio::test]
    async fn test_stale_checkpoint_is_discarded() {
        let temp = tempfile::tempdir().expect("tempdir");
        let checkpoints = CheckpointStore::new(temp.path().join("checkpoint.json"));
        let mut stale = Checkpoint::new(Checkpoint::fingerprint(["other"]));
        stale.embeddings.insert(0, vec![9.0, 9.0, 9.0]);
        checkpoints.save(&stale).unwrap();

        let provider = Arc::new(CountingEmbedder::default());
        let snapshot = Snapshot::in_memory().await.unwrap();
        let engine = engine(provider.clone(), Arc::new(MemoryIndex::new()), snapshot.clone(), checkpoints);

        let summary = engine.run(&Dataset::from_entities([place("1", "Museum")])).await.unwrap();
        assert_eq!(summary.resumed, 0);
        assert_eq!(summary.embed_calls, 1);
        assert_ne!(snapshot.load_all().await.unwrap()["1"].embedding, vec![9.0, 9.0, 9.0]);
    }

    #[tokio::test]
    async fn test_kind_change_under_stable_id_updates_snapshot_row() {
        let temp = tempfile::tempdir().expect("tempdir");
        let provider = Arc::new(CountingEmbedder::default());
        let snapshot = Snapshot::in_memory().await.unwrap();
        let engine = engine(
            provider.clone(),
            Arc::new(MemoryIndex::new()),
            snapshot.clone(),
            CheckpointStore::new(temp.path().join("checkpoint.json")),
        );

        engine.run(&Dataset::from_entities([place("1", "Old Mill")])).await.unwrap();
        let retyped = Entity::new(
            "1",
            Attributes::Hotel(Hotel {
                name: "Old Mill".to_string(),
                ..Default::default()
            }),
        );
        let summary = engine.run(&Dataset::from_entities([retyped])).await.unwrap();
        assert_eq!(summary.newly_embedded, 0);

        let row = snapshot.load_all().await.unwrap()["1"].clone();
        assert_eq!(row.kind, EntityKind::Hotel);
        assert_eq!(row.entity.kind(), EntityKind::Hotel);
    }

    #[tokio::test]
    async fn test_truncated_listing_falls_back_to_synced_flags() {
        let temp = tempfile::tempdir().expect("tempdir");
        let provider = Arc::new(CountingEmbedder::default());
        let index = Arc::new(MemoryIndex::new());
        let snapshot = Snapshot::in_memory().await.unwrap();
        let dataset = Dataset::from_entities([
            place("a", "Harbour"),
            place("b", "Lighthouse"),
            place("c", "Market"),
        ]);
        let reconciling = |list_ids_limit| {
            engine_with(
                provider.clone(),
                index.clone(),
                snapshot.clone(),
                CheckpointStore::new(temp.path().join("checkpoint.json")),
                SyncOptions {
                    reconcile_remote: true,
                    list_ids_limit,
                    ..Default::default()
                },
            )
        };

        let first = reconciling(1).run(&dataset).await.unwrap();
        assert_eq!(first.upserted, 3);

        // Only one id fits in the listing; the rows stay unchanged.
        let second = reconciling(1).run(&dataset).await.unwrap();
        assert_eq!(second.upserted, 0);
        assert_eq!(second.already_embedded, 3);

        // A complete listing still detects a vector missing from the index.
        index.delete("b").await.unwrap();
        let third = reconciling(100).run(&dataset).await.unwrap();
        assert_eq!(third.upserted, 1);
        assert_eq!(third.newly_embedded, 0);
        assert_eq!(index.count(None).await.unwrap(), 3);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
    }
}
