//! Batched writes to the remote index.

use crate::dataset::MetadataValue;
use crate::error::IndexError;
use crate::retry::{self, RetryPolicy};
use crate::vector::{IndexRecord, Metadata, VectorIndex};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Replace missing values with type defaults; the index rejects `null`.
///
/// Numbers: missing or non-finite → `0.0`. Text: missing → `""`. Lists are
/// joined with `", "`.
pub fn sanitize(metadata: &BTreeMap<String, MetadataValue>) -> Metadata {
    metadata
        .iter()
        .map(|(key, value)| {
            let value = match value {
                MetadataValue::Number(number) => {
                    let number = number.filter(|number| number.is_finite()).unwrap_or(0.0);
                    serde_json::Number::from_f64(number)
                        .map(Value::Number)
                        .unwrap_or_else(|| Value::from(0.0))
                }
                MetadataValue::Text(text) => Value::String(text.clone().unwrap_or_default()),
                MetadataValue::List(items) => Value::String(items.join(", ")),
            };
            (key.clone(), value)
        })
        .collect()
}

/// Outcome of one upsert pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpsertReport {
    /// Ids confirmed written.
    pub upserted: Vec<String>,
    /// Ids whose batch exhausted its attempts (failed-to-sync).
    pub failed: Vec<String>,
    /// Remote write calls that succeeded or were attempted for the last time.
    pub batches: usize,
}

/// Writes records in batches of at most `batch_size`, retrying whole batches.
#[derive(Clone)]
pub struct BatchUpserter {
    index: Arc<dyn VectorIndex>,
    batch_size: usize,
    retry: RetryPolicy,
    timeout: Duration,
}

impl BatchUpserter {
    pub fn new(
        index: Arc<dyn VectorIndex>,
        batch_size: usize,
        retry: RetryPolicy,
        timeout: Duration,
    ) -> Self {
        Self {
            index,
            batch_size: batch_size.max(1),
            retry,
            timeout,
        }
    }

    /// Upsert every record. A failing batch never stops later batches.
    pub async fn upsert_all(&self, records: &[IndexRecord]) -> UpsertReport {
        let mut report = UpsertReport::default();

        for (batch_index, batch) in records.chunks(self.batch_size).enumerate() {
            report.batches += 1;
            let ids = batch.iter().map(|record| record.id.clone());

            match self.write_batch(batch).await {
                Ok(()) => report.upserted.extend(ids),
                Err(error) => {
                    tracing::warn!(
                        batch_index,
                        size = batch.len(),
                        %error,
                        "batch failed to sync"
                    );
                    report.failed.extend(ids);
                }
            }
        }

        tracing::info!(
            upserted = report.upserted.len(),
            failed = report.failed.len(),
            batches = report.batches,
            "upsert pass complete"
        );
        report
    }

    async fn write_batch(&self, batch: &[IndexRecord]) -> Result<(), IndexError> {
        retry::index_call(self.retry, self.timeout, "upsert", || self.index.upsert(batch)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::EntityKind;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::Mutex;

    /// Records every upsert call; fails the first `fail_first` calls.
    #[derive(Default)]
    struct RecordingIndex {
        calls: Mutex<Vec<Vec<String>>>,
        fail_first: usize,
        fatal: bool,
    }

    #[async_trait]
    impl VectorIndex for RecordingIndex {
        async fn upsert(&self, batch: &[IndexRecord]) -> Result<(), IndexError> {
            let mut calls = self.calls.lock().unwrap();
            calls.push(batch.iter().map(|record| record.id.clone()).collect());
            if calls.len() <= self.fail_first {
                return Err(if self.fatal {
                    IndexError::Fatal("schema mismatch".into())
                } else {
                    IndexError::Transient("503".into())
                });
            }
            Ok(())
        }

        async fn query(
            &self,
            _vector: &[f32],
            _top_k: usize,
            _kind: Option<EntityKind>,
        ) -> Result<Vec<crate::vector::IndexMatch>, IndexError> {
            Ok(Vec::new())
        }

        async fn list_ids(&self, _limit: usize) -> Result<HashSet<String>, IndexError> {
            Ok(HashSet::new())
        }

        async fn fetch(&self, _id: &str) -> Result<Option<IndexRecord>, IndexError> {
            Ok(None)
        }

        async fn delete(&self, _id: &str) -> Result<(), IndexError> {
            Ok(())
        }

        async fn count(&self, _kind: Option<EntityKind>) -> Result<usize, IndexError> {
            Ok(0)
        }
    }

    fn records(n: usize) -> Vec<IndexRecord> {
        (0..n)
            .map(|i| IndexRecord {
                id: format!("id-{i}"),
                kind: EntityKind::Place,
                vector: vec![1.0],
                metadata: Metadata::new(),
            })
            .collect()
    }

    fn upserter(index: Arc<RecordingIndex>, batch_size: usize, attempts: u32) -> BatchUpserter {
        BatchUpserter::new(
            index,
            batch_size,
            RetryPolicy::new(attempts, Duration::from_millis(1), Duration::from_millis(1)),
            Duration::from_secs(5),
        )
    }

    #[test]
    fn test_sanitize_never_emits_null() {
        let mut metadata = BTreeMap::new();
        metadata.insert("rating".to_string(), MetadataValue::Number(Some(f64::NAN)));
        metadata.insert("price".to_string(), MetadataValue::Number(None));
        metadata.insert("hours".to_string(), MetadataValue::Text(None));
        metadata.insert(
            "amenities".to_string(),
            MetadataValue::List(vec!["wifi".into(), "spa".into()]),
        );
        metadata.insert("name".to_string(), MetadataValue::Text(Some("Inn".into())));

        let sanitized = sanitize(&metadata);
        assert_eq!(sanitized["rating"], serde_json::json!(0.0));
        assert_eq!(sanitized["price"], serde_json::json!(0.0));
        assert_eq!(sanitized["hours"], serde_json::json!(""));
        assert_eq!(sanitized["amenities"], serde_json::json!("wifi, spa"));
        assert_eq!(sanitized["name"], serde_json::json!("Inn"));
        assert!(sanitized.values().all(|value| !value.is_null()));
    }

    #[tokio::test]
    async fn test_issues_ceil_n_over_b_calls() {
        for (n, b, expected) in [(5, 2, 3), (4, 2, 2), (1, 10, 1), (0, 3, 0)] {
            let index = Arc::new(RecordingIndex::default());
            let report = upserter(index.clone(), b, 3).upsert_all(&records(n)).await;
            assert_eq!(index.calls.lock().unwrap().len(), expected, "n={n} b={b}");
            assert_eq!(report.batches, expected);
            assert_eq!(report.upserted.len(), n);
        }
    }

    #[tokio::test]
    async fn test_transient_batch_failure_is_retried_whole() {
        let index = Arc::new(RecordingIndex {
            fail_first: 1,
            ..Default::default()
        });
        let report = upserter(index.clone(), 2, 3).upsert_all(&records(3)).await;

        let calls = index.calls.lock().unwrap();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[0], calls[1]);
        assert!(report.failed.is_empty());
        assert_eq!(report.upserted.len(), 3);
    }

    #[tokio::test]
    async fn test_exhausted_batch_is_reported_and_pipeline_continues() {
        let index = Arc::new(RecordingIndex {
            fail_first: 2,
            ..Default::default()
        });
        let report = upserter(index.clone(), 2, 2).upsert_all(&records(3)).await;

        assert_eq!(report.failed, vec!["id-0", "id-1"]);
        assert_eq!(report.upserted, vec!["id-2"]);
        assert_eq!(index.calls.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_fatal_batch_failure_is_not_retried() {
        let index = Arc::new(RecordingIndex {
            fail_first: 1,
            fatal: true,
            ..Default::default()
        });
        let report = upserter(index.clone(), 5, 3).upsert_all(&records(2)).await;
        assert_eq!(report.failed.len(), 2);
        assert_eq!(index.calls.lock().unwrap().len(), 1);
    }
}
