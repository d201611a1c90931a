//! Incremental synchronization of a dataset into the vector index.
//!
//! A run renders every entity, diffs the dataset against the local
//! snapshot, embeds only what is new (checkpointing as it goes), rewrites
//! the snapshot and pushes pending records to the index in batches.

pub mod checkpoint;
pub mod diff;
pub mod engine;
pub mod render;
pub mod snapshot;
pub mod upsert;

pub use checkpoint::{Checkpoint, CheckpointStore};
pub use diff::{Diff, diff};
pub use engine::{RunSummary, SyncEngine, SyncOptions};
pub use render::{RenderDefaults, render};
pub use snapshot::{Snapshot, SnapshotCounts, SnapshotRow};
pub use upsert::{BatchUpserter, UpsertReport, sanitize};
