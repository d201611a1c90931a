//! LanceDB-backed vector index.
//!
//! The connection URI may be a local directory or an object-store URI
//! (`s3://`, `gs://`); the table layout is the same either way.

use crate::dataset::EntityKind;
use crate::error::IndexError;
use crate::vector::{IndexMatch, IndexRecord, Metadata, VectorIndex};
use arrow_array::cast::AsArray;
use arrow_array::types::Float32Type;
use arrow_array::{Array, ArrayRef, FixedSizeListArray, RecordBatch, RecordBatchIterator, StringArray};
use async_trait::async_trait;
use futures::TryStreamExt;
use lancedb::query::{ExecutableQuery, QueryBase, Select};
use std::collections::HashSet;
use std::sync::Arc;

/// Entity vectors stored in a LanceDB table.
#[derive(Clone)]
pub struct LanceIndex {
    table: lancedb::Table,
    dimension: usize,
}

impl LanceIndex {
    /// Connect and open the table, creating it when missing.
    pub async fn connect(
        uri: &str,
        table_name: &str,
        dimension: usize,
    ) -> Result<Self, IndexError> {
        let connection = lancedb::connect(uri).execute().await.map_err(lance_error)?;
        Self::open_or_create(&connection, table_name, dimension).await
    }

    /// Open existing table or create a new one.
    ///
    /// An existing table whose embedding width differs from `dimension` is
    /// a fatal error.
    pub async fn open_or_create(
        connection: &lancedb::Connection,
        table_name: &str,
        dimension: usize,
    ) -> Result<Self, IndexError> {
        match connection.open_table(table_name).execute().await {
            Ok(table) => {
                let schema = table.schema().await.map_err(lance_error)?;
                check_dimension(&schema, table_name, dimension)?;
                return Ok(Self { table, dimension });
            }
            Err(error) => {
                tracing::debug!(%error, table_name, "failed to open index table, will create");
            }
        }

        let schema = Arc::new(schema(dimension));
        let batches = RecordBatchIterator::new(vec![].into_iter().map(Ok), schema);
        let table = connection
            .create_table(table_name, Box::new(batches))
            .execute()
            .await
            .map_err(lance_error)?;

        tracing::info!(table_name, dimension, "created index table");
        Ok(Self { table, dimension })
    }

    fn to_record_batch(&self, batch: &[IndexRecord]) -> Result<RecordBatch, IndexError> {
        let mut metadata_json = Vec::with_capacity(batch.len());
        for record in batch {
            if record.vector.len() != self.dimension {
                return Err(IndexError::Fatal(format!(
                    "embedding dimension mismatch for {}: expected {}, got {}",
                    record.id,
                    self.dimension,
                    record.vector.len()
                )));
            }
            let json = serde_json::to_string(&record.metadata)
                .map_err(|error| IndexError::Fatal(error.to_string()))?;
            metadata_json.push(json);
        }

        let ids = StringArray::from_iter_values(batch.iter().map(|record| record.id.as_str()));
        let kinds = StringArray::from_iter_values(batch.iter().map(|record| record.kind.as_str()));
        let metadata = StringArray::from_iter_values(metadata_json.iter().map(String::as_str));
        let embeddings = FixedSizeListArray::from_iter_primitive::<Float32Type, _, _>(
            batch
                .iter()
                .map(|record| Some(record.vector.iter().map(|value| Some(*value)).collect::<Vec<_>>())),
            self.dimension as i32,
        );

        RecordBatch::try_new(
            Arc::new(schema(self.dimension)),
            vec![
                Arc::new(ids) as ArrayRef,
                Arc::new(kinds) as ArrayRef,
                Arc::new(metadata) as ArrayRef,
                Arc::new(embeddings) as ArrayRef,
            ],
        )
        .map_err(|error| IndexError::Fatal(error.to_string()))
    }

    async fn collect(
        &self,
        query: lancedb::query::Query,
    ) -> Result<Vec<RecordBatch>, IndexError> {
        query
            .execute()
            .await
            .map_err(lance_error)?
            .try_collect()
            .await
            .map_err(lance_error)
    }
}

#[async_trait]
impl VectorIndex for LanceIndex {
    async fn upsert(&self, batch: &[IndexRecord]) -> Result<(), IndexError> {
        if batch.is_empty() {
            return Ok(());
        }
        let record_batch = self.to_record_batch(batch)?;

        // Replace existing rows so repeated upserts never accumulate duplicates.
        let predicate = format!("id IN ({})", quote_list(batch.iter().map(|r| r.id.as_str())));
        self.table.delete(&predicate).await.map_err(lance_error)?;

        let batches =
            RecordBatchIterator::new(vec![Ok(record_batch)], Arc::new(schema(self.dimension)));
        self.table
            .add(Box::new(batches))
            .execute()
            .await
            .map_err(lance_error)?;
        Ok(())
    }

    async fn query(
        &self,
        vector: &[f32],
        top_k: usize,
        kind: Option<EntityKind>,
    ) -> Result<Vec<IndexMatch>, IndexError> {
        if vector.len() != self.dimension {
            return Err(IndexError::Fatal(format!(
                "query embedding dimension mismatch: expected {}, got {}",
                self.dimension,
                vector.len()
            )));
        }

        let mut query = self
            .table
            .query()
            .nearest_to(vector)
            .map_err(lance_error)?
            .distance_type(lancedb::DistanceType::Cosine)
            .select(Select::columns(&["id", "metadata"]))
            .limit(top_k);
        if let Some(kind) = kind {
            query = query.only_if(format!("kind = '{}'", kind.as_str()));
        }

        let results: Vec<RecordBatch> = query
            .execute()
            .await
            .map_err(lance_error)?
            .try_collect()
            .await
            .map_err(lance_error)?;

        let mut matches = Vec::new();
        for batch in results {
            if let (Some(id_col), Some(metadata_col), Some(dist_col)) = (
                batch.column_by_name("id"),
                batch.column_by_name("metadata"),
                batch.column_by_name("_distance"),
            ) {
                let ids: &StringArray = id_col.as_string::<i32>();
                let metadata: &StringArray = metadata_col.as_string::<i32>();
                let distances: &arrow_array::PrimitiveArray<Float32Type> = dist_col.as_primitive();

                for i in 0..ids.len() {
                    if ids.is_valid(i) && distances.is_valid(i) {
                        matches.push(IndexMatch {
                            id: ids.value(i).to_string(),
                            score: 1.0 - distances.value(i),
                            metadata: parse_metadata(metadata.value(i))?,
                        });
                    }
                }
            }
        }

        matches.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(matches)
    }

    async fn list_ids(&self, limit: usize) -> Result<HashSet<String>, IndexError> {
        let results = self
            .collect(
                self.table
                    .query()
                    .select(Select::columns(&["id"]))
                    .limit(limit),
            )
            .await?;

        let mut ids = HashSet::new();
        for batch in results {
            if let Some(id_col) = batch.column_by_name("id") {
                let values: &StringArray = id_col.as_string::<i32>();
                for index in 0..values.len() {
                    if values.is_valid(index) {
                        ids.insert(values.value(index).to_string());
                    }
                }
            }
        }
        Ok(ids)
    }

    async fn fetch(&self, id: &str) -> Result<Option<IndexRecord>, IndexError> {
        let results = self
            .collect(
                self.table
                    .query()
                    .only_if(format!("id = {}", quote(id)))
                    .select(Select::columns(&["id", "kind", "metadata", "embedding"]))
                    .limit(1),
            )
            .await?;

        for batch in results {
            if let (Some(id_col), Some(kind_col), Some(metadata_col), Some(embedding_col)) = (
                batch.column_by_name("id"),
                batch.column_by_name("kind"),
                batch.column_by_name("metadata"),
                batch.column_by_name("embedding"),
            ) {
                let ids: &StringArray = id_col.as_string::<i32>();
                let kinds: &StringArray = kind_col.as_string::<i32>();
                let metadata: &StringArray = metadata_col.as_string::<i32>();
                let embeddings: &FixedSizeListArray = embedding_col.as_fixed_size_list();

                if ids.is_empty() || !ids.is_valid(0) {
                    continue;
                }
                let kind = kinds
                    .value(0)
                    .parse::<EntityKind>()
                    .map_err(IndexError::Fatal)?;
                let values = embeddings.value(0);
                let vector = values.as_primitive::<Float32Type>().values().to_vec();

                return Ok(Some(IndexRecord {
                    id: ids.value(0).to_string(),
                    kind,
                    vector,
                    metadata: parse_metadata(metadata.value(0))?,
                }));
            }
        }
        Ok(None)
    }

    async fn delete(&self, id: &str) -> Result<(), IndexError> {
        self.table
            .delete(&format!("id = {}", quote(id)))
            .await
            .map_err(lance_error)?;
        Ok(())
    }

    async fn count(&self, kind: Option<EntityKind>) -> Result<usize, IndexError> {
        let filter = kind.map(|kind| format!("kind = '{}'", kind.as_str()));
        self.table.count_rows(filter).await.map_err(lance_error)
    }
}

/// LanceDB failures are mostly I/O against object storage or the remote
/// service, so they are retried as transient.
fn lance_error(error: lancedb::Error) -> IndexError {
    IndexError::Transient(error.to_string())
}

fn parse_metadata(raw: &str) -> Result<Metadata, IndexError> {
    serde_json::from_str(raw)
        .map_err(|error| IndexError::Fatal(format!("corrupt metadata column: {error}")))
}

fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn quote_list<'a>(values: impl Iterator<Item = &'a str>) -> String {
    values.map(quote).collect::<Vec<_>>().join(", ")
}

fn check_dimension(
    schema: &arrow_schema::Schema,
    table_name: &str,
    dimension: usize,
) -> Result<(), IndexError> {
    let field = schema.field_with_name("embedding").map_err(|_| {
        IndexError::Fatal(format!("index table {table_name} has no embedding column"))
    })?;
    match field.data_type() {
        arrow_schema::DataType::FixedSizeList(_, size) if *size as usize == dimension => Ok(()),
        arrow_schema::DataType::FixedSizeList(_, size) => Err(IndexError::Fatal(format!(
            "index table {table_name} stores {size}-dimensional embeddings, configured for {dimension}"
        ))),
        other => Err(IndexError::Fatal(format!(
            "index table {table_name} has an unexpected embedding column type {other}"
        ))),
    }
}

/// Arrow schema for the entity vectors table.
fn schema(dimension: usize) -> arrow_schema::Schema {
    arrow_schema::Schema::new(vec![
        arrow_schema::Field::new("id", arrow_schema::DataType::Utf8, false),
        arrow_schema::Field::new("kind", arrow_schema::DataType::Utf8, false),
        arrow_schema::Field::new("metadata", arrow_schema::DataType::Utf8, false),
        arrow_schema::Field::new(
            "embedding",
            arrow_schema::DataType::FixedSizeList(
                Arc::new(arrow_schema::Field::new(
                    "item",
                    arrow_schema::DataType::Float32,
                    true,
                )),
                dimension as i32,
            ),
            false,
        ),
    ])
}
