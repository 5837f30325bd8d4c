//! Change detection: which sources have newer upstream data than what was last consumed.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use eduinfo_core::{
    parse_remote_timestamp, CheckMethod, CheckResult, SkipReason, SourceDescriptor, SourceMetadata,
    SourceType, StalenessRecord, StalenessUpdate,
};
use eduinfo_storage::{FetchError, RemoteProbe};
use futures::future::join_all;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::store::{StalenessStore, StoreError};

pub const DATA_EDUCATION_PROVIDER: &str = "data.education.gouv.fr";

#[derive(Debug, Error)]
pub enum DetectError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("unparseable {field} value {value:?}")]
    Timestamp { field: &'static str, value: String },
    #[error("unexpected catalog payload: {0}")]
    Payload(#[from] serde_json::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("cancelled")]
    Cancelled,
}

#[async_trait]
pub trait DetectionStrategy: Send + Sync {
    fn method(&self) -> CheckMethod;

    fn supports(&self, source: &SourceDescriptor) -> bool;

    /// `last` is `None` on a first check and after a detection-method switch.
    async fn check(
        &self,
        source: &SourceDescriptor,
        last: Option<&StalenessRecord>,
        checked_at: DateTime<Utc>,
    ) -> Result<CheckResult, DetectError>;
}

/// `HEAD` the source URL and compare `Last-Modified` with the stored signal.
pub struct HeaderStrategy {
    probe: Arc<dyn RemoteProbe>,
}

impl HeaderStrategy {
    pub fn new(probe: Arc<dyn RemoteProbe>) -> Self {
        Self { probe }
    }
}

#[async_trait]
impl DetectionStrategy for HeaderStrategy {
    fn method(&self) -> CheckMethod {
        CheckMethod::HttpLastModified
    }

    fn supports(&self, source: &SourceDescriptor) -> bool {
        matches!(source.source_type, SourceType::Csv | SourceType::Dataset)
    }

    async fn check(
        &self,
        source: &SourceDescriptor,
        last: Option<&StalenessRecord>,
        checked_at: DateTime<Utc>,
    ) -> Result<CheckResult, DetectError> {
        let mut result = CheckResult::for_source(source, checked_at);
        result.check_method = Some(self.method());
        result.last_known_modified = last.and_then(|r| r.last_known_modified);

        let Some(raw) = self.probe.last_modified(&source.url).await? else {
            result.reason = Some(SkipReason::NoLastModifiedHeader);
            return Ok(result);
        };
        let remote = parse_remote_timestamp(&raw).ok_or(DetectError::Timestamp {
            field: "Last-Modified",
            value: raw,
        })?;

        result.remote_modified = Some(remote);
        result.has_update = result
            .last_known_modified
            .map_or(true, |known| remote > known);
        Ok(result)
    }
}

/// Dataset facts published by the Opendatasoft catalog endpoint.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DatasetMetadata {
    pub modified: Option<DateTime<Utc>>,
    pub data_processed: Option<DateTime<Utc>>,
    pub metadata_processed: Option<DateTime<Utc>>,
    pub records_count: Option<u64>,
    pub date_observation: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CatalogDatasetPayload {
    #[serde(default)]
    metas: Option<CatalogMetas>,
}

#[derive(Debug, Default, Deserialize)]
struct CatalogMetas {
    #[serde(default)]
    default: Option<DefaultMetas>,
    #[serde(default, rename = "metadonnees-complementaires")]
    complementary: Option<ComplementaryMetas>,
}

#[derive(Debug, Default, Deserialize)]
struct DefaultMetas {
    modified: Option<String>,
    data_processed: Option<String>,
    metadata_processed: Option<String>,
    records_count: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ComplementaryMetas {
    #[serde(rename = "date-observation")]
    date_observation: Option<JsonValue>,
}

impl DatasetMetadata {
    pub fn from_payload(payload: JsonValue) -> Result<Self, DetectError> {
        let payload: CatalogDatasetPayload = serde_json::from_value(payload)?;
        let metas = payload.metas.unwrap_or_default();
        let defaults = metas.default.unwrap_or_default();

        let date_observation = metas
            .complementary
            .and_then(|c| c.date_observation)
            .and_then(|value| match value {
                JsonValue::Null => None,
                JsonValue::String(s) if s.trim().is_empty() => None,
                JsonValue::String(s) => Some(s),
                other => Some(other.to_string()),
            });

        Ok(Self {
            modified: parse_field("modified", defaults.modified)?,
            data_processed: parse_field("data_processed", defaults.data_processed)?,
            metadata_processed: parse_field("metadata_processed", defaults.metadata_processed)?,
            records_count: defaults.records_count,
            date_observation,
        })
    }
}

fn parse_field(
    field: &'static str,
    raw: Option<String>,
) -> Result<Option<DateTime<Utc>>, DetectError> {
    match raw {
        None => Ok(None),
        Some(value) if value.trim().is_empty() => Ok(None),
        Some(value) => parse_remote_timestamp(&value)
            .map(Some)
            .ok_or(DetectError::Timestamp { field, value }),
    }
}

/// Compare the catalog's `data_processed` date with the one consumed by the last import.
pub struct CatalogApiStrategy {
    probe: Arc<dyn RemoteProbe>,
    base_url: String,
}

impl CatalogApiStrategy {
    pub fn new(probe: Arc<dyn RemoteProbe>, base_url: impl Into<String>) -> Self {
        Self {
            probe,
            base_url: base_url.into(),
        }
    }

    pub fn dataset_url(&self, dataset_id: &str) -> String {
        format!(
            "{}/catalog/datasets/{}",
            self.base_url.trim_end_matches('/'),
            dataset_id
        )
    }
}

#[async_trait]
impl DetectionStrategy for CatalogApiStrategy {
    fn method(&self) -> CheckMethod {
        CheckMethod::ApiDataProcessed
    }

    fn supports(&self, source: &SourceDescriptor) -> bool {
        source
            .dataset_id
            .as_deref()
            .is_some_and(|id| !id.trim().is_empty())
    }

    async fn check(
        &self,
        source: &SourceDescriptor,
        last: Option<&StalenessRecord>,
        checked_at: DateTime<Utc>,
    ) -> Result<CheckResult, DetectError> {
        let dataset_id = source.dataset_id.as_deref().unwrap_or_default();
        let payload = self.probe.json(&self.dataset_url(dataset_id)).await?;
        let remote = DatasetMetadata::from_payload(payload)?;
        let stored = last.map(|r| &r.metadata);

        let mut result = CheckResult::for_source(source, checked_at);
        result.check_method = Some(self.method());
        result.last_known_modified = last.and_then(|r| r.last_known_modified);
        result.remote_modified = remote.modified;
        result.last_data_processed = stored.and_then(|m| m.data_processed);
        result.remote_data_processed = remote.data_processed;
        result.metadata_processed = remote.metadata_processed;
        result.records_count = remote.records_count;
        result.last_records_count = stored.and_then(|m| m.records_count);
        result.date_observation = remote.date_observation;

        result.details.record_count_changed = matches!(
            (result.records_count, result.last_records_count),
            (Some(remote), Some(known)) if remote != known
        );

        let Some(remote_data) = remote.data_processed else {
            result.reason = Some(SkipReason::NoDataProcessedDate);
            return Ok(result);
        };
        result.has_update = result
            .last_data_processed
            .map_or(true, |known| remote_data > known);

        let metadata_baseline = stored.and_then(|m| m.metadata_processed.or(m.data_processed));
        result.details.metadata_changed = !result.has_update
            && matches!(
                (remote.metadata_processed, metadata_baseline),
                (Some(remote), Some(known)) if remote > known
            );
        Ok(result)
    }
}

/// Provider-keyed strategies with a fallback for everything else.
pub struct StrategyRegistry {
    by_provider: HashMap<String, Arc<dyn DetectionStrategy>>,
    fallback: Arc<dyn DetectionStrategy>,
}

impl StrategyRegistry {
    pub fn new(fallback: Arc<dyn DetectionStrategy>) -> Self {
        Self {
            by_provider: HashMap::new(),
            fallback,
        }
    }

    /// Header checks for file sources, catalog checks for `data.education.gouv.fr` datasets.
    pub fn standard(probe: Arc<dyn RemoteProbe>, catalog_base: &str) -> Self {
        Self::new(Arc::new(HeaderStrategy::new(probe.clone()))).register(
            DATA_EDUCATION_PROVIDER,
            Arc::new(CatalogApiStrategy::new(probe, catalog_base)),
        )
    }

    pub fn register(mut self, provider: impl Into<String>, strategy: Arc<dyn DetectionStrategy>) -> Self {
        self.by_provider.insert(provider.into(), strategy);
        self
    }

    pub fn for_source(&self, source: &SourceDescriptor) -> Option<Arc<dyn DetectionStrategy>> {
        self.by_provider
            .get(&source.provider)
            .filter(|strategy| strategy.supports(source))
            .or_else(|| Some(&self.fallback).filter(|strategy| strategy.supports(source)))
            .cloned()
    }
}

pub struct ChangeDetector {
    strategies: StrategyRegistry,
    store: Arc<dyn StalenessStore>,
}

impl ChangeDetector {
    pub fn new(strategies: StrategyRegistry, store: Arc<dyn StalenessStore>) -> Self {
        Self { strategies, store }
    }

    /// Never fails: detection errors are reported on the result.
    pub async fn check_source(
        &self,
        source: &SourceDescriptor,
        cancel: &CancellationToken,
    ) -> CheckResult {
        let checked_at = Utc::now();
        if !source.enabled {
            return CheckResult::skipped(source, SkipReason::Disabled, checked_at);
        }

        let span = info_span!("check_source", source_id = %source.id);
        async {
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(DetectError::Cancelled),
                outcome = self.detect(source, checked_at) => outcome,
            };
            match outcome {
                Ok(result) => {
                    debug!(
                        has_update = result.has_update,
                        method = ?result.check_method,
                        reason = ?result.reason,
                        "source checked"
                    );
                    result
                }
                Err(err) => {
                    warn!(error = %err, "source check failed");
                    CheckResult::failed(source, err.to_string(), checked_at)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn detect(
        &self,
        source: &SourceDescriptor,
        checked_at: DateTime<Utc>,
    ) -> Result<CheckResult, DetectError> {
        let Some(strategy) = self.strategies.for_source(source) else {
            return Ok(CheckResult::skipped(
                source,
                SkipReason::UnsupportedCheckType,
                checked_at,
            ));
        };

        let record = self.store.get(&source.id).await?;
        let method = strategy.method();
        let method_changed = record
            .as_ref()
            .and_then(StalenessRecord::recorded_method)
            .is_some_and(|recorded| recorded != method);
        if method_changed {
            warn!(
                recorded = ?record.as_ref().and_then(StalenessRecord::recorded_method),
                method = %method,
                "detection method changed; treating stored signal as absent"
            );
        }
        let baseline = if method_changed { None } else { record.as_ref() };

        let mut result = strategy.check(source, baseline, checked_at).await?;
        result.method_changed = method_changed;
        Ok(result)
    }

    /// Results come back in input order.
    pub async fn check_all(
        &self,
        sources: &[SourceDescriptor],
        cancel: &CancellationToken,
    ) -> Vec<CheckResult> {
        join_all(sources.iter().map(|source| self.check_source(source, cancel))).await
    }

    /// Persist what a batch of checks observed. Errored and disabled results write nothing.
    pub async fn record_checks(&self, results: &[CheckResult]) -> Result<(), StoreError> {
        for result in results {
            if result.is_error() || result.is_disabled() {
                continue;
            }
            self.store
                .upsert(&result.source_id, &check_update(result))
                .await?;
        }
        Ok(())
    }

    pub async fn check_and_record(
        &self,
        sources: &[SourceDescriptor],
        cancel: &CancellationToken,
    ) -> Result<Vec<CheckResult>, StoreError> {
        let results = self.check_all(sources, cancel).await;
        self.record_checks(&results).await?;
        let updates = results.iter().filter(|r| r.has_update).count();
        info!(checked = results.len(), updates, "source checks recorded");
        Ok(results)
    }
}

/// Check-time write: `last_checked` and diagnostics always, the signal only when already consumed.
pub fn check_update(result: &CheckResult) -> StalenessUpdate {
    let mut metadata = SourceMetadata {
        metadata_processed: result.metadata_processed,
        records_count: result.records_count,
        date_observation: result.date_observation.clone(),
        ..Default::default()
    };
    if result.check_method == Some(CheckMethod::ApiDataProcessed) {
        metadata.modified = result.remote_modified;
    }

    let mut update = StalenessUpdate::checked(result.checked_at);
    let signal = result.remote_signal();
    if !result.has_update && !result.method_changed && signal.is_some() {
        update.last_known_modified = signal;
        metadata.check_method = result.check_method;
        if result.check_method == Some(CheckMethod::ApiDataProcessed) {
            metadata.data_processed = result.remote_data_processed;
        }
    }

    if !metadata.is_empty() {
        update.metadata = Some(metadata);
    }
    update
}

/// Post-processing write that marks the detected signal as consumed.
pub fn consumed_update(result: &CheckResult, imported_at: Option<DateTime<Utc>>) -> StalenessUpdate {
    let mut metadata = SourceMetadata {
        check_method: result.check_method,
        ..Default::default()
    };
    if result.check_method == Some(CheckMethod::ApiDataProcessed) {
        metadata.data_processed = result.remote_data_processed;
    }

    StalenessUpdate {
        last_imported: imported_at,
        ..Default::default()
    }
    .with_known_modified(result.remote_signal())
    .with_metadata(metadata)
    .resetting_signal(result.method_changed)
}
