//! Partition the dataset against the local snapshot.
//!
//! Comparison is by id only. An entity whose attributes changed under a
//! stable id is `unchanged`: its vector is not recomputed, while any later
//! index write carries the new attributes.

use crate::dataset::Dataset;
use crate::sync::snapshot::SnapshotRow;
use std::collections::{BTreeMap, HashSet};

/// Result of diffing; every list is sorted by id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Diff {
    /// Not in the snapshot: needs an embedding call.
    pub to_embed: Vec<String>,
    /// Embedded before but not (known to be) in the remote index.
    pub to_upsert_only: Vec<String>,
    /// Embedded and present in the remote index.
    pub unchanged: Vec<String>,
}

impl Diff {
    pub fn total(&self) -> usize {
        self.to_embed.len() + self.to_upsert_only.len() + self.unchanged.len()
    }
}

/// Partition dataset ids.
///
/// With `remote_ids`, presence in the index is taken from that set;
/// otherwise from each snapshot row's `synced` flag.
pub fn diff(
    dataset: &Dataset,
    snapshot: &BTreeMap<String, SnapshotRow>,
    remote_ids: Option<&HashSet<String>>,
) -> Diff {
    let mut result = Diff::default();

    for id in dataset.ids() {
        let Some(row) = snapshot.get(id) else {
            result.to_embed.push(id.to_string());
            continue;
        };

        let in_index = match remote_ids {
            Some(remote_ids) => remote_ids.contains(id),
            None => row.synced,
        };
        if in_index {
            result.unchanged.push(id.to_string());
        } else {
            result.to_upsert_only.push(id.to_string());
        }
    }

    tracing::debug!(
        to_embed = result.to_embed.len(),
        to_upsert_only = result.to_upsert_only.len(),
        unchanged = result.unchanged.len(),
        "dataset diffed against snapshot"
    );
    result
}
