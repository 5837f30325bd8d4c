//! Reachability and CSV-shape validation of configured sources.

use eduinfo_core::{SourceDescriptor, SourceType};
use eduinfo_storage::HttpFetcher;
use futures::future::join_all;
use serde::Serialize;
use tracing::{info_span, Instrument};

const SAMPLE_LINES: usize = 5;

/// Shape of the first lines of a remote CSV.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CsvShape {
    pub valid: bool,
    pub separator: Option<char>,
    pub columns: usize,
    pub header: Option<String>,
    pub partial: bool,
    pub error: Option<String>,
}

impl CsvShape {
    fn invalid(error: impl Into<String>) -> Self {
        Self {
            valid: false,
            separator: None,
            columns: 0,
            header: None,
            partial: false,
            error: Some(error.into()),
        }
    }
}

/// Detect separator and column count from a header line. `;` takes precedence over `,`.
pub fn inspect_csv_sample(lines: &[String], partial: bool) -> CsvShape {
    let Some(header) = lines.first().map(|l| l.trim_start_matches('\u{feff}')) else {
        return CsvShape::invalid("empty response");
    };
    let separator = if header.contains(';') {
        Some(';')
    } else if header.contains(',') {
        Some(',')
    } else {
        None
    };

    CsvShape {
        valid: separator.is_some(),
        separator,
        columns: separator.map_or(0, |sep| header.split(sep).count()),
        header: Some(header.to_string()),
        partial,
        error: separator
            .is_none()
            .then(|| "header has no ';' or ',' separator".to_string()),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceValidation {
    pub source_id: String,
    pub name: String,
    pub url: String,
    pub skipped: bool,
    pub accessible: bool,
    pub status: Option<u16>,
    pub content_type: Option<String>,
    pub content_length: Option<u64>,
    pub last_modified: Option<String>,
    pub error: Option<String>,
    pub csv: Option<CsvShape>,
}

impl SourceValidation {
    fn new(source: &SourceDescriptor) -> Self {
        Self {
            source_id: source.id.clone(),
            name: source.display_name().to_string(),
            url: source.probe_url().to_string(),
            skipped: false,
            accessible: false,
            status: None,
            content_type: None,
            content_length: None,
            last_modified: None,
            error: None,
            csv: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.skipped || (self.accessible && self.csv.as_ref().map_or(true, |c| c.valid))
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ValidationReport {
    pub results: Vec<SourceValidation>,
}

impl ValidationReport {
    pub fn accessible(&self) -> usize {
        self.results.iter().filter(|r| !r.skipped && r.accessible).count()
    }

    pub fn unreachable(&self) -> usize {
        self.results.iter().filter(|r| !r.skipped && !r.accessible).count()
    }

    pub fn skipped(&self) -> usize {
        self.results.iter().filter(|r| r.skipped).count()
    }

    pub fn invalid_csv(&self) -> usize {
        self.results
            .iter()
            .filter(|r| r.csv.as_ref().is_some_and(|c| !c.valid))
            .count()
    }

    pub fn is_ok(&self) -> bool {
        self.results.iter().all(SourceValidation::is_ok)
    }

    pub fn render(&self) -> String {
        let mut out = String::from("Source validation\n=================\n\n");
        for r in &self.results {
            if r.skipped {
                out.push_str(&format!("- {} ({}): skipped, disabled\n", r.name, r.source_id));
                continue;
            }
            let verdict = if r.is_ok() { "ok" } else { "FAILED" };
            out.push_str(&format!("- {} ({}): {verdict}\n", r.name, r.source_id));
            out.push_str(&format!("    url: {}\n", r.url));
            if let Some(status) = r.status {
                out.push_str(&format!("    status: {status}\n"));
            }
            if let Some(error) = &r.error {
                out.push_str(&format!("    error: {error}\n"));
            }
            if r.accessible {
                out.push_str(&format!(
                    "    content type: {}\n    size: {}\n    last modified: {}\n",
                    r.content_type.as_deref().unwrap_or("unknown"),
                    format_size(r.content_length),
                    r.last_modified.as_deref().unwrap_or("unknown"),
                ));
            }
            if let Some(csv) = &r.csv {
                match csv.separator {
                    Some(sep) => out.push_str(&format!(
                        "    csv: {} columns, separator '{sep}'{}\n",
                        csv.columns,
                        if csv.partial { " (partial sample)" } else { "" }
                    )),
                    None => out.push_str(&format!(
                        "    csv: invalid ({})\n",
                        csv.error.as_deref().unwrap_or("unknown")
                    )),
                }
            }
        }
        out.push_str(&format!(
            "\nAccessible: {}  Unreachable: {}  Invalid CSV: {}  Skipped: {}\n",
            self.accessible(),
            self.unreachable(),
            self.invalid_csv(),
            self.skipped()
        ));
        out
    }
}

pub fn format_size(bytes: Option<u64>) -> String {
    match bytes {
        None | Some(0) => "unknown".to_string(),
        Some(b) if b > 1024 * 1024 => format!("{:.2} MB", b as f64 / 1024.0 / 1024.0),
        Some(b) => format!("{:.2} KB", b as f64 / 1024.0),
    }
}

pub async fn validate_sources(fetcher: &HttpFetcher, sources: &[SourceDescriptor]) -> ValidationReport {
    let results = join_all(sources.iter().map(|source| validate_source(fetcher, source))).await;
    ValidationReport { results }
}

async fn validate_source(fetcher: &HttpFetcher, source: &SourceDescriptor) -> SourceValidation {
    let mut result = SourceValidation::new(source);
    if !source.enabled {
        result.skipped = true;
        return result;
    }

    let span = info_span!("validate_source", source_id = %source.id);
    async move {
        match fetcher.head(source.probe_url()).await {
            Ok(head) => {
                result.status = Some(head.status.as_u16());
                result.accessible = head.status.is_success();
                result.content_type = head.content_type;
                result.content_length = head.content_length;
                result.last_modified = head.last_modified;
                result.url = head.final_url;
            }
            Err(err) => result.error = Some(err.to_string()),
        }

        if result.accessible && source.source_type == SourceType::Csv {
            result.csv = Some(match fetcher.sample_lines(&source.url, SAMPLE_LINES).await {
                Ok(sample) => inspect_csv_sample(&sample.lines, sample.partial),
                Err(err) => CsvShape::invalid(err.to_string()),
            });
        }
        result
    }
    .instrument(span)
    .await
}
