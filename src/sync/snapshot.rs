//! Local snapshot of embedded entities (SQLite).
//!
//! The pipeline's own source of truth for "already embedded", independent of
//! what the remote index currently holds.

use crate::dataset::{Entity, EntityKind};
use crate::error::DbError;
use chrono::{DateTime, Utc};
use sqlx::Row as _;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use std::collections::BTreeMap;
use std::path::Path;

/// One embedded entity.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotRow {
    pub id: String,
    pub kind: EntityKind,
    /// The rendered text the embedding was computed from.
    pub context: String,
    pub embedding: Vec<f32>,
    /// Latest known attributes.
    pub entity: Entity,
    /// Whether the remote index is known to hold this row.
    pub synced: bool,
    pub embedded_at: DateTime<Utc>,
}

/// Row counts for status reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SnapshotCounts {
    pub total: usize,
    pub unsynced: usize,
}

/// SQLite-backed snapshot table.
#[derive(Clone)]
pub struct Snapshot {
    pool: SqlitePool,
}

impl Snapshot {
    /// Open (creating if needed) the snapshot database at `path`.
    pub async fn open(path: &Path) -> Result<Self, DbError> {
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|error| DbError::Sqlite(sqlx::Error::Io(error)))?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        Self::from_pool(pool).await
    }

    /// In-memory database, used by tests and dry runs.
    pub async fn in_memory() -> Result<Self, DbError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        Self::from_pool(pool).await
    }

    async fn from_pool(pool: SqlitePool) -> Result<Self, DbError> {
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(sqlx::Error::from)?;
        Ok(Self { pool })
    }

    /// Load every row keyed by id.
    pub async fn load_all(&self) -> Result<BTreeMap<String, SnapshotRow>, DbError> {
        let rows = sqlx::query(
            "SELECT id, kind, context, embedding, attributes, synced, embedded_at FROM snapshot",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut snapshot = BTreeMap::new();
        for row in rows {
            let row = decode_row(&row)?;
            snapshot.insert(row.id.clone(), row);
        }
        Ok(snapshot)
    }

    /// Atomically replace the whole table with `rows`.
    pub async fn replace_all<'a>(
        &self,
        rows: impl IntoIterator<Item = &'a SnapshotRow>,
    ) -> Result<usize, DbError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM snapshot").execute(&mut *tx).await?;

        let mut written = 0;
        for row in rows {
            let attributes = serde_json::to_string(&row.entity).map_err(|error| {
                DbError::CorruptRow {
                    id: row.id.clone(),
                    reason: error.to_string(),
                }
            })?;
            sqlx::query(
                "INSERT INTO snapshot (id, kind, context, embedding, attributes, synced, embedded_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&row.id)
            .bind(row.kind.as_str())
            .bind(&row.context)
            .bind(encode_embedding(&row.embedding))
            .bind(attributes)
            .bind(row.synced)
            .bind(row.embedded_at)
            .execute(&mut *tx)
            .await?;
            written += 1;
        }

        tx.commit().await?;
        Ok(written)
    }

    /// Flag rows as present in the remote index.
    pub async fn mark_synced(&self, ids: &[String]) -> Result<(), DbError> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for id in ids {
            sqlx::query("UPDATE snapshot SET synced = 1 WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn counts(&self) -> Result<SnapshotCounts, DbError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS total, COALESCE(SUM(CASE WHEN synced = 0 THEN 1 ELSE 0 END), 0) AS unsynced FROM snapshot",
        )
        .fetch_one(&self.pool)
        .await?;
        let total: i64 = row.try_get("total")?;
        let unsynced: i64 = row.try_get("unsynced")?;
        Ok(SnapshotCounts {
            total: total as usize,
            unsynced: unsynced as usize,
        })
    }
}

fn decode_row(row: &SqliteRow) -> Result<SnapshotRow, DbError> {
    let id: String = row.try_get("id")?;
    let corrupt = |reason: String| DbError::CorruptRow {
        id: id.clone(),
        reason,
    };

    let kind: String = row.try_get("kind")?;
    let kind = kind.parse::<EntityKind>().map_err(corrupt)?;
    let embedding: Vec<u8> = row.try_get("embedding")?;
    let embedding = decode_embedding(&embedding).ok_or_else(|| {
        corrupt(format!("embedding blob of {} bytes", embedding.len()))
    })?;
    let attributes: String = row.try_get("attributes")?;
    let entity: Entity =
        serde_json::from_str(&attributes).map_err(|error| corrupt(error.to_string()))?;

    Ok(SnapshotRow {
        kind,
        context: row.try_get("context")?,
        embedding,
        entity,
        synced: row.try_get("synced")?,
        embedded_at: row.try_get("embedded_at")?,
        id,
    })
}

/// Little-endian `f32` array.
pub fn encode_embedding(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|value| value.to_le_bytes()).collect()
}

pub fn decode_embedding(bytes: &[u8]) -> Option<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return None;
    }
    Some(
        bytes
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect(),
    )
}
