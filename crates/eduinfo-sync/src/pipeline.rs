//! Check → download → import → view refresh, with per-source failure isolation.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use eduinfo_core::CheckResult;
use eduinfo_importers::{ImportSummary, ImporterRegistry};
use eduinfo_storage::{Downloader, RefreshError, ViewRefreshTiming, ViewRefresher};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::detect::{consumed_update, ChangeDetector};
use crate::store::StalenessStore;
use crate::SourceRegistry;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineOptions {
    pub check_only: bool,
    pub dry_run: bool,
    /// Restrict the run to these ids. `None` means every configured source; disabled ones are skipped.
    pub source_ids: Option<Vec<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunAction {
    /// Nothing upstream changed.
    Idle,
    CheckOnly,
    DryRun,
    Processed,
    /// The run stopped before any source was processed.
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceOutcome {
    pub source_id: String,
    pub status: RunStatus,
    pub file: Option<PathBuf>,
    pub bytes: Option<u64>,
    pub import: Option<ImportSummary>,
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl SourceOutcome {
    fn failed(source_id: &str, error: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            source_id: source_id.to_string(),
            status: RunStatus::Error,
            file: None,
            bytes: None,
            import: None,
            error: Some(error.into()),
            duration_ms,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Success
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: RunStatus,
    pub action: RunAction,
    pub error: Option<String>,
    pub checks: Vec<CheckResult>,
    pub updates: Vec<CheckResult>,
    pub results: Vec<SourceOutcome>,
    pub views_refreshed: Vec<ViewRefreshTiming>,
}

impl PipelineReport {
    pub(crate) fn new(run_id: Uuid, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            started_at,
            finished_at: started_at,
            status: RunStatus::Success,
            action: RunAction::Aborted,
            error: None,
            checks: Vec::new(),
            updates: Vec::new(),
            results: Vec::new(),
            views_refreshed: Vec::new(),
        }
    }

    fn fail(mut self, error: impl Into<String>) -> Self {
        self.status = RunStatus::Error;
        self.error = Some(error.into());
        self.finish()
    }

    fn finish(mut self) -> Self {
        self.finished_at = Utc::now();
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Success
    }

    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|r| r.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.results.len() - self.succeeded()
    }

    pub fn check_errors(&self) -> usize {
        self.checks.iter().filter(|c| c.is_error()).count()
    }
}

pub struct Pipeline {
    registry: Arc<SourceRegistry>,
    detector: ChangeDetector,
    store: Arc<dyn StalenessStore>,
    downloader: Arc<dyn Downloader>,
    importers: ImporterRegistry,
    refresher: Arc<dyn ViewRefresher>,
    cancel: CancellationToken,
    run_lock: Mutex<()>,
}

impl Pipeline {
    pub fn new(
        registry: Arc<SourceRegistry>,
        detector: ChangeDetector,
        store: Arc<dyn StalenessStore>,
        downloader: Arc<dyn Downloader>,
        importers: ImporterRegistry,
        refresher: Arc<dyn ViewRefresher>,
    ) -> Self {
        Self {
            registry,
            detector,
            store,
            downloader,
            importers,
            refresher,
            cancel: CancellationToken::new(),
            run_lock: Mutex::new(()),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Detect and record, without downloading anything.
    pub async fn check(&self, source_ids: Option<&[String]>) -> Result<Vec<CheckResult>> {
        let sources = self.registry.select(source_ids)?;
        self.store
            .ping()
            .await
            .context("monitoring store is not reachable")?;
        self.detector
            .check_and_record(&sources, &self.cancel)
            .await
            .context("recording check results")
    }

    pub async fn refresh_views(&self) -> Result<Vec<ViewRefreshTiming>, RefreshError> {
        let span = info_span!("refresh_view", views = self.registry.views.len());
        self.refresher
            .refresh(&self.registry.views)
            .instrument(span)
            .await
    }

    /// Structural failures end up in the report's `error`; per-source failures in `results`.
    pub async fn run(&self, options: &PipelineOptions) -> PipelineReport {
        let _running = self.run_lock.lock().await;
        let run_id = Uuid::new_v4();
        let report = PipelineReport::new(run_id, Utc::now());
        let span = info_span!("pipeline_run", %run_id);
        self.run_inner(options, report).instrument(span).await
    }

    async fn run_inner(&self, options: &PipelineOptions, mut report: PipelineReport) -> PipelineReport {
        info!(
            check_only = options.check_only,
            dry_run = options.dry_run,
            "pipeline run started"
        );

        let checks = match self.check(options.source_ids.as_deref()).await {
            Ok(checks) => checks,
            Err(err) => {
                warn!(error = %format!("{err:#}"), "pipeline aborted during checks");
                return report.fail(format!("{err:#}"));
            }
        };
        report.updates = checks.iter().filter(|c| c.has_update).cloned().collect();
        report.checks = checks;
        if self.cancel.is_cancelled() {
            warn!("run cancelled during checks");
            return report.fail("cancelled");
        }

        if report.updates.is_empty() {
            info!("all data sources are up to date");
            report.action = RunAction::Idle;
            return report.finish();
        }
        info!(updates = report.updates.len(), "updates available");

        if options.check_only {
            report.action = RunAction::CheckOnly;
            return report.finish();
        }
        if options.dry_run {
            report.action = RunAction::DryRun;
            return report.finish();
        }

        report.action = RunAction::Processed;
        for update in &report.updates {
            let outcome = if self.cancel.is_cancelled() {
                SourceOutcome::failed(&update.source_id, "cancelled", 0)
            } else {
                self.process_source(update).await
            };
            report.results.push(outcome);
        }

        if self.cancel.is_cancelled() && report.succeeded() == 0 {
            warn!("run cancelled before any source was processed; skipping view refresh");
            return report.fail("cancelled");
        }

        match self.refresh_views().await {
            Ok(timings) => report.views_refreshed = timings,
            Err(err) => {
                warn!(error = %err, "materialized view refresh failed");
                return report.fail(format!("view refresh failed: {err}"));
            }
        }

        info!(
            succeeded = report.succeeded(),
            failed = report.failed(),
            "pipeline run complete"
        );
        report.finish()
    }

    async fn process_source(&self, update: &CheckResult) -> SourceOutcome {
        let started = Instant::now();
        let span = info_span!("process_source", source_id = %update.source_id);
        // A dropped import rolls its transaction back; a dropped download removes its partial file.
        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(anyhow!("cancelled")),
            result = self.download_and_import(update).instrument(span) => result,
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok((file, bytes, import)) => SourceOutcome {
                source_id: update.source_id.clone(),
                status: RunStatus::Success,
                file: Some(file),
                bytes: Some(bytes),
                import,
                error: None,
                duration_ms,
            },
            Err(err) => {
                warn!(source_id = %update.source_id, error = %format!("{err:#}"), "source failed");
                SourceOutcome::failed(&update.source_id, format!("{err:#}"), duration_ms)
            }
        }
    }

    async fn download_and_import(
        &self,
        update: &CheckResult,
    ) -> Result<(PathBuf, u64, Option<ImportSummary>)> {
        let source = self
            .registry
            .get(&update.source_id)
            .ok_or_else(|| anyhow!("source configuration not found: {}", update.source_id))?;

        let downloaded = self
            .downloader
            .download(source)
            .await
            .context("download failed")?;

        let import = match source.importer.as_deref() {
            Some(importer_id) => {
                let importer = self
                    .importers
                    .get(importer_id)
                    .ok_or_else(|| anyhow!("importer {importer_id} is not registered"))?;
                let summary = importer
                    .run(&downloaded.path)
                    .await
                    .with_context(|| format!("import with {importer_id} failed"))?;
                Some(summary)
            }
            None => {
                warn!("no importer configured, skipping import");
                None
            }
        };

        let imported_at = import.as_ref().map(|_| Utc::now());
        self.store
            .upsert(&source.id, &consumed_update(update, imported_at))
            .await
            .context("recording consumed update")?;

        Ok((downloaded.path, downloaded.size, import))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::StrategyRegistry;
    use crate::store::MemoryStalenessStore;
    use crate::testing::{source, ts, FakeDownloader, FakeImporter, FakeProbe, FakeRefresher};
    use eduinfo_core::{SourceDescriptor, StalenessUpdate};

    struct Harness {
        probe: Arc<FakeProbe>,
        store: Arc<MemoryStalenessStore>,
        downloader: Arc<FakeDownloader>,
        importer: Arc<FakeImporter>,
        refresher: Arc<FakeRefresher>,
        pipeline: Pipeline,
    }

    fn harness(sources: Vec<SourceDescriptor>) -> Harness {
        let probe = Arc::new(FakeProbe::default());
        for src in &sources {
            probe.set_header(&src.url, Some("Sat, 15 Jun 2024 00:00:00 GMT"));
        }
        let store = Arc::new(MemoryStalenessStore::new());
        let downloader = Arc::new(FakeDownloader::default());
        let importer = Arc::new(FakeImporter::new("csv_loader"));
        let refresher = Arc::new(FakeRefresher::default());

        let mut importers = ImporterRegistry::new();
        importers.register(importer.clone()).unwrap();

        let registry = Arc::new(SourceRegistry {
            views: vec![
                "mv_colleges_with_metrics".to_string(),
                "mv_lycees_with_metrics".to_string(),
            ],
            importers: Vec::new(),
            sources,
        });
        let detector = ChangeDetector::new(
            StrategyRegistry::standard(probe.clone(), "https://catalog.test/api/explore/v2.1"),
            store.clone(),
        );
        let pipeline = Pipeline::new(
            registry,
            detector,
            store.clone(),
            downloader.clone(),
            importers,
            refresher.clone(),
        );

        Harness {
            probe,
            store,
            downloader,
            importer,
            refresher,
            pipeline,
        }
    }

    fn imported_source(id: &str) -> SourceDescriptor {
        let mut src = source(id, "data.gouv.fr", None);
        src.importer = Some("csv_loader".to_string());
        src
    }

    #[tokio::test]
    async fn stale_sources_are_downloaded_imported_and_views_refreshed_once() {
        let h = harness(vec![imported_source("criminalite"), imported_source("onisep")]);

        let report = h.pipeline.run(&PipelineOptions::default()).await;

        assert_eq!(report.status, RunStatus::Success);
        assert_eq!(report.action, RunAction::Processed);
        assert_eq!(report.updates.len(), 2);
        assert_eq!(report.succeeded(), 2);
        assert_eq!(h.downloader.calls(), 2);
        assert_eq!(h.importer.calls(), 2);
        assert_eq!(h.refresher.calls(), 1);
        assert_eq!(report.views_refreshed.len(), 2);

        let record = h.store.get("criminalite").await.unwrap().unwrap();
        assert_eq!(record.last_known_modified, Some(ts(2024, 6, 15)));
        assert!(record.last_imported.is_some());
    }

    #[tokio::test]
    async fn download_failure_is_isolated_to_its_source() {
        let h = harness(vec![imported_source("criminalite"), imported_source("onisep")]);
        h.downloader.fail_for("criminalite");

        let report = h.pipeline.run(&PipelineOptions::default()).await;

        assert_eq!(report.status, RunStatus::Success);
        assert_eq!(report.results.len(), 2);
        assert_eq!(report.results[0].source_id, "criminalite");
        assert_eq!(report.results[0].status, RunStatus::Error);
        assert!(report.results[0].error.as_deref().unwrap().contains("download failed"));
        assert_eq!(report.results[1].status, RunStatus::Success);
        assert_eq!(h.refresher.calls(), 1);

        let failed = h.store.get("criminalite").await.unwrap().unwrap();
        assert_eq!(failed.last_imported, None);
        assert_eq!(failed.last_known_modified, None);
        let imported = h.store.get("onisep").await.unwrap().unwrap();
        assert!(imported.last_imported.is_some());
    }

    #[tokio::test]
    async fn import_failure_leaves_the_source_stale() {
        let h = harness(vec![imported_source("criminalite")]);
        h.importer.fail_next();

        let report = h.pipeline.run(&PipelineOptions::default()).await;
        assert_eq!(report.failed(), 1);

        let rerun = h.pipeline.run(&PipelineOptions::default()).await;
        assert_eq!(rerun.action, RunAction::Processed);
        assert_eq!(rerun.succeeded(), 1);
    }

    #[tokio::test]
    async fn second_run_without_remote_change_is_idle() {
        let h = harness(vec![imported_source("criminalite")]);

        let first = h.pipeline.run(&PipelineOptions::default()).await;
        let second = h.pipeline.run(&PipelineOptions::default()).await;

        assert_eq!(first.action, RunAction::Processed);
        assert_eq!(second.status, RunStatus::Success);
        assert_eq!(second.action, RunAction::Idle);
        assert!(second.updates.is_empty());
        assert_eq!(h.importer.calls(), 1);
        assert_eq!(h.refresher.calls(), 1);
    }

    #[tokio::test]
    async fn dry_run_and_check_only_never_touch_collaborators() {
        let h = harness(vec![imported_source("criminalite")]);

        let check_only = h
            .pipeline
            .run(&PipelineOptions {
                check_only: true,
                ..Default::default()
            })
            .await;
        let dry_run = h
            .pipeline
            .run(&PipelineOptions {
                dry_run: true,
                ..Default::default()
            })
            .await;

        assert_eq!(check_only.action, RunAction::CheckOnly);
        assert_eq!(dry_run.action, RunAction::DryRun);
        assert_eq!(dry_run.updates.len(), 1);
        assert_eq!(h.downloader.calls(), 0);
        assert_eq!(h.importer.calls(), 0);
        assert_eq!(h.refresher.calls(), 0);
        let record = h.store.get("criminalite").await.unwrap().unwrap();
        assert!(record.last_checked.is_some());
        assert_eq!(record.last_known_modified, None);
    }

    #[tokio::test]
    async fn nothing_stale_exits_idle_without_refresh() {
        let h = harness(vec![imported_source("criminalite")]);
        h.probe.set_header("https://example.test/criminalite.csv", None);

        let report = h.pipeline.run(&PipelineOptions::default()).await;

        assert_eq!(report.status, RunStatus::Success);
        assert_eq!(report.action, RunAction::Idle);
        assert_eq!(h.refresher.calls(), 0);
    }

    #[tokio::test]
    async fn unknown_source_ids_fail_the_run() {
        let h = harness(vec![imported_source("criminalite")]);

        let report = h
            .pipeline
            .run(&PipelineOptions {
                source_ids: Some(vec!["criminalite".to_string(), "nope".to_string()]),
                ..Default::default()
            })
            .await;

        assert_eq!(report.status, RunStatus::Error);
        assert!(report.error.unwrap().contains("nope"));
        assert_eq!(h.probe.calls(), 0);
    }

    #[tokio::test]
    async fn explicit_ids_restrict_the_run() {
        let h = harness(vec![imported_source("criminalite"), imported_source("onisep")]);

        let report = h
            .pipeline
            .run(&PipelineOptions {
                source_ids: Some(vec!["onisep".to_string()]),
                ..Default::default()
            })
            .await;

        assert_eq!(report.checks.len(), 1);
        assert_eq!(report.results[0].source_id, "onisep");
        assert!(h.store.get("criminalite").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn view_refresh_failure_is_a_run_error() {
        let h = harness(vec![imported_source("criminalite")]);
        h.refresher.fail_with("mv_lycees_with_metrics");

        let report = h.pipeline.run(&PipelineOptions::default()).await;

        assert_eq!(report.status, RunStatus::Error);
        assert_eq!(report.succeeded(), 1);
        assert!(report.error.unwrap().contains("mv_lycees_with_metrics"));
    }

    #[tokio::test]
    async fn download_only_sources_consume_the_signal_without_import() {
        let h = harness(vec![source("criminalite", "data.gouv.fr", None)]);

        let report = h.pipeline.run(&PipelineOptions::default()).await;

        assert_eq!(report.succeeded(), 1);
        assert!(report.results[0].import.is_none());
        assert_eq!(h.importer.calls(), 0);
        let record = h.store.get("criminalite").await.unwrap().unwrap();
        assert_eq!(record.last_imported, None);
        assert_eq!(record.last_known_modified, Some(ts(2024, 6, 15)));
    }

    #[tokio::test]
    async fn cancellation_interrupts_an_in_flight_download() {
        let h = harness(vec![imported_source("criminalite"), imported_source("onisep")]);
        h.downloader.stall_for("criminalite");
        let cancel = h.pipeline.cancellation_token();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            cancel.cancel();
        });

        let report = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            h.pipeline.run(&PipelineOptions::default()),
        )
        .await
        .expect("run should stop once cancelled");

        assert_eq!(report.status, RunStatus::Error);
        assert_eq!(report.error.as_deref(), Some("cancelled"));
        assert_eq!(report.results.len(), 2);
        assert!(report
            .results
            .iter()
            .all(|r| r.error.as_deref() == Some("cancelled")));
        assert_eq!(h.downloader.calls(), 1);
        assert_eq!(h.importer.calls(), 0);
        assert_eq!(h.refresher.calls(), 0);
        let record = h.store.get("criminalite").await.unwrap().unwrap();
        assert_eq!(record.last_known_modified, None);
    }

    #[tokio::test]
    async fn cancelled_run_aborts_before_processing() {
        let h = harness(vec![imported_source("criminalite")]);
        h.store
            .upsert("criminalite", &StalenessUpdate::checked(ts(2024, 1, 1)))
            .await
            .unwrap();
        h.pipeline.cancellation_token().cancel();

        let report = h.pipeline.run(&PipelineOptions::default()).await;

        assert_eq!(report.status, RunStatus::Error);
        assert_eq!(report.action, RunAction::Aborted);
        assert_eq!(report.error.as_deref(), Some("cancelled"));
        assert_eq!(report.check_errors(), 1);
        assert_eq!(h.downloader.calls(), 0);
        assert_eq!(h.refresher.calls(), 0);
    }
}
