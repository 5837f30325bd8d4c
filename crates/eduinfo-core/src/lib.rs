//! Core domain model for the eduInfo pipeline: source descriptors, staleness state and check results.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub const CRATE_NAME: &str = "eduinfo-core";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Csv,
    Dataset,
    Api,
}

/// Static description of one upstream open-data source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceDescriptor {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub api_url: Option<String>,
    pub provider: String,
    #[serde(default)]
    pub dataset_id: Option<String>,
    #[serde(rename = "type")]
    pub source_type: SourceType,
    #[serde(default)]
    pub importer: Option<String>,
    pub enabled: bool,
}

impl SourceDescriptor {
    pub fn display_name(&self) -> &str {
        if self.name.trim().is_empty() {
            &self.id
        } else {
            &self.name
        }
    }

    /// URL probed by reachability validation: API sources prefer their API endpoint.
    pub fn probe_url(&self) -> &str {
        match (self.source_type, self.api_url.as_deref()) {
            (SourceType::Api, Some(api_url)) => api_url,
            _ => &self.url,
        }
    }
}

/// How a remote change was detected. Stored alongside the signal it produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckMethod {
    HttpLastModified,
    ApiDataProcessed,
}

impl CheckMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::HttpLastModified => "http_last_modified",
            Self::ApiDataProcessed => "api_data_processed",
        }
    }
}

impl fmt::Display for CheckMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Non-error reasons for a check that reports no update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Disabled,
    NoLastModifiedHeader,
    NoDataProcessedDate,
    UnsupportedCheckType,
}

impl SkipReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disabled => "disabled",
            Self::NoLastModifiedHeader => "no_last_modified_header",
            Self::NoDataProcessedDate => "no_data_processed_date",
            Self::UnsupportedCheckType => "unsupported_check_type",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Provider-specific state kept in the monitoring table's `metadata` column.
///
/// Known keys are typed; anything else written by other tools survives a round trip in `extra`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SourceMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_processed: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata_processed: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub records_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_observation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check_method: Option<CheckMethod>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, JsonValue>,
}

impl SourceMetadata {
    /// Key-level merge: present values in `newer` win, absent ones keep the current value.
    /// `data_processed` is the consumed signal and only moves forward.
    pub fn merge(&mut self, newer: SourceMetadata) {
        self.data_processed = match (self.data_processed, newer.data_processed) {
            (Some(current), Some(observed)) => Some(current.max(observed)),
            (current, observed) => observed.or(current),
        };
        self.metadata_processed = newer.metadata_processed.or(self.metadata_processed);
        self.modified = newer.modified.or(self.modified);
        self.records_count = newer.records_count.or(self.records_count);
        if newer.date_observation.is_some() {
            self.date_observation = newer.date_observation;
        }
        self.check_method = newer.check_method.or(self.check_method);
        self.extra.extend(newer.extra);
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Persisted per-source monitoring state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StalenessRecord {
    pub source_id: String,
    pub last_known_modified: Option<DateTime<Utc>>,
    pub last_checked: Option<DateTime<Utc>>,
    pub last_imported: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: SourceMetadata,
}

impl StalenessRecord {
    pub fn new(source_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            last_known_modified: None,
            last_checked: None,
            last_imported: None,
            metadata: SourceMetadata::default(),
        }
    }

    /// Apply a partial update with COALESCE semantics.
    ///
    /// `last_known_modified` never moves backwards unless the update resets the signal after a
    /// detection-method switch; a reset also drops the stored `data_processed` and `check_method`
    /// before merging the new metadata.
    pub fn apply(&mut self, update: &StalenessUpdate) {
        if update.reset_signal {
            self.last_known_modified = update.last_known_modified.or(self.last_known_modified);
            self.metadata.data_processed = None;
            self.metadata.check_method = None;
            if let Some(metadata) = &update.metadata {
                self.metadata.merge(metadata.clone());
            }
        } else {
            self.last_known_modified = match (self.last_known_modified, update.last_known_modified) {
                (Some(current), Some(observed)) => Some(current.max(observed)),
                (current, observed) => observed.or(current),
            };
            if let Some(metadata) = &update.metadata {
                self.metadata.merge(metadata.clone());
            }
        }
        self.last_checked = update.last_checked.or(self.last_checked);
        self.last_imported = update.last_imported.or(self.last_imported);
    }

    pub fn recorded_method(&self) -> Option<CheckMethod> {
        self.metadata.check_method
    }
}

/// Partial write to a [`StalenessRecord`]; absent fields keep their stored value.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StalenessUpdate {
    pub last_known_modified: Option<DateTime<Utc>>,
    pub last_checked: Option<DateTime<Utc>>,
    pub last_imported: Option<DateTime<Utc>>,
    pub metadata: Option<SourceMetadata>,
    pub reset_signal: bool,
}

impl StalenessUpdate {
    pub fn checked(at: DateTime<Utc>) -> Self {
        Self {
            last_checked: Some(at),
            ..Default::default()
        }
    }

    pub fn imported(at: DateTime<Utc>) -> Self {
        Self {
            last_imported: Some(at),
            ..Default::default()
        }
    }

    pub fn with_known_modified(mut self, value: Option<DateTime<Utc>>) -> Self {
        self.last_known_modified = value;
        self
    }

    pub fn with_metadata(mut self, metadata: SourceMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn resetting_signal(mut self, reset: bool) -> Self {
        self.reset_signal = reset;
        self
    }
}

/// Operator-facing diagnostics. These never influence `has_update`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CheckDetails {
    pub metadata_changed: bool,
    pub record_count_changed: bool,
}

/// Outcome of checking one source for upstream changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    pub source_id: String,
    pub name: String,
    pub has_update: bool,
    pub check_method: Option<CheckMethod>,
    pub reason: Option<SkipReason>,
    pub error: Option<String>,
    pub last_known_modified: Option<DateTime<Utc>>,
    pub remote_modified: Option<DateTime<Utc>>,
    pub last_data_processed: Option<DateTime<Utc>>,
    pub remote_data_processed: Option<DateTime<Utc>>,
    pub metadata_processed: Option<DateTime<Utc>>,
    pub records_count: Option<u64>,
    pub last_records_count: Option<u64>,
    pub date_observation: Option<String>,
    pub url: String,
    pub importer: Option<String>,
    pub method_changed: bool,
    pub details: CheckDetails,
    pub checked_at: DateTime<Utc>,
}

impl CheckResult {
    pub fn for_source(source: &SourceDescriptor, checked_at: DateTime<Utc>) -> Self {
        Self {
            source_id: source.id.clone(),
            name: source.display_name().to_string(),
            has_update: false,
            check_method: None,
            reason: None,
            error: None,
            last_known_modified: None,
            remote_modified: None,
            last_data_processed: None,
            remote_data_processed: None,
            metadata_processed: None,
            records_count: None,
            last_records_count: None,
            date_observation: None,
            url: source.url.clone(),
            importer: source.importer.clone(),
            method_changed: false,
            details: CheckDetails::default(),
            checked_at,
        }
    }

    pub fn skipped(source: &SourceDescriptor, reason: SkipReason, checked_at: DateTime<Utc>) -> Self {
        Self {
            reason: Some(reason),
            ..Self::for_source(source, checked_at)
        }
    }

    pub fn failed(
        source: &SourceDescriptor,
        error: impl Into<String>,
        checked_at: DateTime<Utc>,
    ) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::for_source(source, checked_at)
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn is_disabled(&self) -> bool {
        self.reason == Some(SkipReason::Disabled)
    }

    /// The remote value that marks this source's data as consumed once imported.
    pub fn remote_signal(&self) -> Option<DateTime<Utc>> {
        match self.check_method? {
            CheckMethod::HttpLastModified => self.remote_modified,
            CheckMethod::ApiDataProcessed => self.remote_data_processed,
        }
    }
}

/// Parse timestamps as published by HTTP headers and catalog APIs.
///
/// Accepts RFC 3339, RFC 2822 / IMF-fixdate, naive ISO date-times (read as UTC) and bare dates.
pub fn parse_remote_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    if let Ok(ts) = DateTime::parse_from_rfc2822(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    if let Ok(ts) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(ts.and_utc());
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|d| d.and_utc())
}
