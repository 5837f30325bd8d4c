//! Persisted per-source staleness state (`monitoring.data_sources`).

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use eduinfo_core::{SourceMetadata, StalenessRecord, StalenessUpdate};
use serde_json::Value as JsonValue;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("monitoring store query failed: {0}")]
    Database(#[from] sqlx::Error),
    #[error("metadata for {source_id} is not valid: {source}")]
    Metadata {
        source_id: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("monitoring store unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait StalenessStore: Send + Sync {
    async fn get(&self, source_id: &str) -> Result<Option<StalenessRecord>, StoreError>;

    /// Partial write: absent fields keep their stored value. Creates the record when missing.
    async fn upsert(&self, source_id: &str, update: &StalenessUpdate) -> Result<(), StoreError>;

    /// Fails when the store cannot serve reads at all.
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

const SELECT_RECORD: &str = "SELECT id, last_known_modified, last_checked, last_imported, metadata \
     FROM monitoring.data_sources WHERE id = $1";

// `last_known_modified` and `metadata.data_processed` only move forward unless the signal is
// being reset after a detection-method switch.
const UPSERT_RECORD: &str = r#"
INSERT INTO monitoring.data_sources (id, last_known_modified, last_checked, last_imported, metadata)
VALUES ($1, $2, $3, $4, COALESCE($5, '{}'::jsonb))
ON CONFLICT (id) DO UPDATE SET
    last_known_modified = CASE
        WHEN $6 THEN COALESCE(EXCLUDED.last_known_modified, monitoring.data_sources.last_known_modified)
        ELSE GREATEST(monitoring.data_sources.last_known_modified, EXCLUDED.last_known_modified)
    END,
    last_checked = COALESCE(EXCLUDED.last_checked, monitoring.data_sources.last_checked),
    last_imported = COALESCE(EXCLUDED.last_imported, monitoring.data_sources.last_imported),
    metadata = CASE
        WHEN $6 THEN (COALESCE(monitoring.data_sources.metadata, '{}'::jsonb) - 'data_processed' - 'check_method')
            || COALESCE($5, '{}'::jsonb)
        ELSE COALESCE(monitoring.data_sources.metadata, '{}'::jsonb) || COALESCE($5, '{}'::jsonb)
            || jsonb_strip_nulls(jsonb_build_object('data_processed', GREATEST(
                (monitoring.data_sources.metadata ->> 'data_processed')::timestamptz,
                ($5 ->> 'data_processed')::timestamptz
            )))
    END
"#;

#[derive(Debug, Clone)]
pub struct PgStalenessStore {
    pool: PgPool,
}

impl PgStalenessStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl StalenessStore for PgStalenessStore {
    async fn get(&self, source_id: &str) -> Result<Option<StalenessRecord>, StoreError> {
        let Some(row) = sqlx::query(SELECT_RECORD)
            .bind(source_id)
            .fetch_optional(&self.pool)
            .await?
        else {
            return Ok(None);
        };

        let metadata: Option<JsonValue> = row.try_get("metadata")?;
        let metadata = match metadata {
            Some(JsonValue::Null) | None => SourceMetadata::default(),
            Some(value) => serde_json::from_value(value).map_err(|source| StoreError::Metadata {
                source_id: source_id.to_string(),
                source,
            })?,
        };

        Ok(Some(StalenessRecord {
            source_id: row.try_get("id")?,
            last_known_modified: row.try_get::<Option<DateTime<Utc>>, _>("last_known_modified")?,
            last_checked: row.try_get::<Option<DateTime<Utc>>, _>("last_checked")?,
            last_imported: row.try_get::<Option<DateTime<Utc>>, _>("last_imported")?,
            metadata,
        }))
    }

    async fn upsert(&self, source_id: &str, update: &StalenessUpdate) -> Result<(), StoreError> {
        let metadata = update
            .metadata
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .map_err(|source| StoreError::Metadata {
                source_id: source_id.to_string(),
                source,
            })?;

        sqlx::query(UPSERT_RECORD)
            .bind(source_id)
            .bind(update.last_known_modified)
            .bind(update.last_checked)
            .bind(update.last_imported)
            .bind(metadata)
            .bind(update.reset_signal)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1 FROM monitoring.data_sources LIMIT 1")
            .fetch_optional(&self.pool)
            .await?;
        Ok(())
    }
}

/// Process-local store used by tests and `--dry-run` style tooling.
#[derive(Debug, Default)]
pub struct MemoryStalenessStore {
    records: Mutex<BTreeMap<String, StalenessRecord>>,
}

impl MemoryStalenessStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StalenessStore for MemoryStalenessStore {
    async fn get(&self, source_id: &str) -> Result<Option<StalenessRecord>, StoreError> {
        Ok(self.records.lock().await.get(source_id).cloned())
    }

    async fn upsert(&self, source_id: &str, update: &StalenessUpdate) -> Result<(), StoreError> {
        self.records
            .lock()
            .await
            .entry(source_id.to_string())
            .or_insert_with(|| StalenessRecord::new(source_id))
            .apply(update);
        Ok(())
    }
}
