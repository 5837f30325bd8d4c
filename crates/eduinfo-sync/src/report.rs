//! Operator-facing renderings of check results and pipeline runs.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use eduinfo_core::{CheckMethod, CheckResult};
use tokio::fs;

use crate::pipeline::{PipelineReport, RunAction, RunStatus};

fn when(ts: Option<DateTime<Utc>>, missing: &str) -> String {
    ts.map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| missing.to_string())
}

/// Short list of sources with new upstream data.
pub fn render_update_summary(updates: &[CheckResult]) -> String {
    if updates.is_empty() {
        return "All data sources are up to date\n".to_string();
    }
    let mut out = format!("{} update(s) available:\n\n", updates.len());
    for (index, update) in updates.iter().enumerate() {
        let _ = writeln!(out, "{}. {}", index + 1, update.name);
        let _ = writeln!(out, "   Source ID: {}", update.source_id);
        match update.check_method {
            Some(CheckMethod::ApiDataProcessed) => {
                let _ = writeln!(
                    out,
                    "   Data processed: {}",
                    when(update.remote_data_processed, "unknown")
                );
                if let Some(observed) = &update.date_observation {
                    let _ = writeln!(out, "   Data observation: {observed}");
                }
            }
            _ => {
                let _ = writeln!(
                    out,
                    "   Last known: {}",
                    when(update.last_known_modified, "Never")
                );
                let _ = writeln!(out, "   Modified: {}", when(update.remote_modified, "unknown"));
            }
        }
        if update.method_changed {
            let _ = writeln!(out, "   Detection method changed; previous signal ignored");
        }
        let _ = writeln!(out, "   URL: {}\n", update.url);
    }
    out
}

/// Every check result with method-specific detail.
pub fn render_check_details(results: &[CheckResult]) -> String {
    let rule = "-".repeat(70);
    let mut out = String::new();
    for result in results {
        if let Some(error) = &result.error {
            let _ = writeln!(out, "[error] {}: {error}\n", result.source_id);
            continue;
        }
        if result.is_disabled() {
            let _ = writeln!(out, "[skip] {}: disabled\n", result.source_id);
            continue;
        }

        let _ = writeln!(out, "{}", result.name);
        let _ = writeln!(out, "   ID: {}", result.source_id);
        let _ = writeln!(
            out,
            "   Check method: {}",
            result
                .check_method
                .map(|m| m.as_str())
                .unwrap_or("none")
        );
        if let Some(reason) = result.reason {
            let _ = writeln!(out, "   Reason: {reason}");
        }

        if result.check_method == Some(CheckMethod::ApiDataProcessed) {
            let _ = writeln!(out, "   Data processing dates:");
            let _ = writeln!(
                out,
                "      Last known: {}",
                when(result.last_data_processed, "Never checked")
            );
            let _ = writeln!(
                out,
                "      Remote:     {}",
                when(result.remote_data_processed, "unknown")
            );
            let _ = writeln!(out, "   Metadata dates:");
            let _ = writeln!(
                out,
                "      Last known: {}",
                when(result.last_known_modified, "Never")
            );
            let _ = writeln!(out, "      Remote:     {}", when(result.remote_modified, "unknown"));
            if let Some(observed) = &result.date_observation {
                let _ = writeln!(out, "   Data observation date: {observed}");
            }
            if let Some(count) = result.records_count {
                let marker = if result.details.record_count_changed {
                    " (changed)"
                } else {
                    ""
                };
                let _ = writeln!(out, "   Record count: {count}{marker}");
            }
            if result.has_update {
                let _ = writeln!(
                    out,
                    "   DATA UPDATE AVAILABLE: new data processed on {}",
                    when(result.remote_data_processed, "unknown")
                );
            } else {
                let _ = writeln!(out, "   No data update");
                if result.details.metadata_changed {
                    let _ = writeln!(
                        out,
                        "      (metadata modified on {}, but data has not changed)",
                        when(result.metadata_processed, "unknown")
                    );
                }
            }
        } else {
            let _ = writeln!(
                out,
                "   Last known modified: {}",
                when(result.last_known_modified, "Never")
            );
            let _ = writeln!(
                out,
                "   Remote modified:     {}",
                when(result.remote_modified, "Unknown")
            );
            let verdict = if result.has_update {
                "UPDATE AVAILABLE"
            } else {
                "No update detected"
            };
            let _ = writeln!(out, "   {verdict}");
        }
        if result.method_changed {
            let _ = writeln!(out, "   Detection method changed; stored signal reset");
        }
        let _ = writeln!(out, "{rule}");
    }
    out
}

pub fn render_pipeline_summary(report: &PipelineReport) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# eduInfo pipeline run\n");
    let _ = writeln!(out, "- Run ID: `{}`", report.run_id);
    let _ = writeln!(out, "- Started: {}", report.started_at);
    let _ = writeln!(out, "- Finished: {}", report.finished_at);
    let status = match report.status {
        RunStatus::Success => "success",
        RunStatus::Error => "error",
    };
    let action = match report.action {
        RunAction::Idle => "idle",
        RunAction::CheckOnly => "check only",
        RunAction::DryRun => "dry run",
        RunAction::Processed => "processed",
        RunAction::Aborted => "aborted",
    };
    let _ = writeln!(out, "- Status: {status}");
    let _ = writeln!(out, "- Action: {action}");
    if let Some(error) = &report.error {
        let _ = writeln!(out, "- Error: {error}");
    }
    let _ = writeln!(
        out,
        "- Checked: {} ({} errors), updates: {}",
        report.checks.len(),
        report.check_errors(),
        report.updates.len()
    );

    if !report.updates.is_empty() {
        let _ = writeln!(out, "\n## Updates\n");
        for update in &report.updates {
            let _ = writeln!(
                out,
                "- {}: {} -> {}",
                update.source_id,
                when(
                    match update.check_method {
                        Some(CheckMethod::ApiDataProcessed) => update.last_data_processed,
                        _ => update.last_known_modified,
                    },
                    "never"
                ),
                when(update.remote_signal(), "unknown")
            );
        }
    }

    if !report.results.is_empty() {
        let _ = writeln!(out, "\n## Sources\n");
        let _ = writeln!(out, "- Successful: {}", report.succeeded());
        let _ = writeln!(out, "- Failed: {}\n", report.failed());
        for result in &report.results {
            match (&result.error, &result.import) {
                (Some(error), _) => {
                    let _ = writeln!(out, "- {}: failed: {error}", result.source_id);
                }
                (None, Some(import)) => {
                    let _ = writeln!(
                        out,
                        "- {}: imported {} rows into {} ({} ms)",
                        result.source_id, import.rows, import.table, result.duration_ms
                    );
                }
                (None, None) => {
                    let _ = writeln!(
                        out,
                        "- {}: downloaded to {}, no importer",
                        result.source_id,
                        result
                            .file
                            .as_deref()
                            .map(|p| p.display().to_string())
                            .unwrap_or_default()
                    );
                }
            }
        }
    }

    if !report.views_refreshed.is_empty() {
        let _ = writeln!(out, "\n## Views refreshed\n");
        for view in &report.views_refreshed {
            let _ = writeln!(out, "- {} ({} ms)", view.view, view.duration_ms);
        }
    }
    out
}

/// Writes `<reports_dir>/<run_id>/pipeline_report.json` and `summary.md`.
pub async fn write_run_report(reports_dir: &Path, report: &PipelineReport) -> Result<PathBuf> {
    let run_dir = reports_dir.join(report.run_id.to_string());
    fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;

    let json = serde_json::to_vec_pretty(report).context("serializing pipeline report")?;
    fs::write(run_dir.join("pipeline_report.json"), json)
        .await
        .context("writing pipeline_report.json")?;
    fs::write(run_dir.join("summary.md"), render_pipeline_summary(report))
        .await
        .context("writing summary.md")?;

    Ok(run_dir)
}
