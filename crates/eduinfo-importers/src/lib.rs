//! Importer contract + the CSV bulk loader registered per source.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use eduinfo_core::SourceDescriptor;
use eduinfo_storage::{is_valid_identifier, TrackedTransaction};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tracing::{info, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "eduinfo-importers";

const COPY_CHUNK_BYTES: usize = 64 * 1024;

/// Registry entry describing how one downloaded file is loaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImporterSpec {
    pub id: String,
    pub table: String,
    #[serde(default = "default_delimiter")]
    pub delimiter: char,
    #[serde(default = "default_true")]
    pub truncate: bool,
    #[serde(default = "default_true")]
    pub header: bool,
    /// Source file encoding when not UTF-8, e.g. `LATIN1`.
    #[serde(default)]
    pub encoding: Option<String>,
}

fn default_delimiter() -> char {
    ';'
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImportSummary {
    pub importer: String,
    pub table: String,
    pub rows: u64,
    pub bytes: u64,
    pub duration_ms: u64,
}

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("file not found: {0}")]
    MissingFile(PathBuf),
    #[error("{0} has no data rows")]
    EmptyFile(PathBuf),
    #[error("malformed CSV {path}: {message}")]
    Malformed { path: PathBuf, message: String },
    #[error("i/o error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid importer configuration: {0}")]
    Config(String),
    #[error("storage error importing into {table}: {source}")]
    Storage {
        table: String,
        #[source]
        source: sqlx::Error,
    },
}

#[async_trait]
pub trait Importer: Send + Sync {
    fn id(&self) -> &str;

    /// Load `path` into the importer's tables. A failed run leaves them untouched.
    async fn run(&self, path: &Path) -> Result<ImportSummary, ImportError>;
}

/// Loads a delimited file with `COPY ... FROM STDIN` inside one transaction.
///
/// With `truncate` the target table is emptied in the same transaction, so readers see either the
/// previous rows or the new ones. Column order in the file must match the table.
pub struct CsvCopyImporter {
    spec: ImporterSpec,
    pool: PgPool,
    transaction_warn_after: Duration,
}

impl CsvCopyImporter {
    pub fn new(
        spec: ImporterSpec,
        pool: PgPool,
        transaction_warn_after: Duration,
    ) -> Result<Self, ImportError> {
        validate_spec(&spec)?;
        Ok(Self {
            spec,
            pool,
            transaction_warn_after,
        })
    }

    pub fn copy_statement(&self) -> String {
        let mut options = vec![
            "FORMAT csv".to_string(),
            format!("HEADER {}", self.spec.header),
            format!("DELIMITER '{}'", self.spec.delimiter),
        ];
        if let Some(encoding) = &self.spec.encoding {
            options.push(format!("ENCODING '{encoding}'"));
        }
        format!("COPY {} FROM STDIN WITH ({})", self.spec.table, options.join(", "))
    }

    async fn ensure_has_rows(&self, path: &Path) -> Result<(), ImportError> {
        let file = File::open(path).await.map_err(|source| match source.kind() {
            std::io::ErrorKind::NotFound => ImportError::MissingFile(path.to_path_buf()),
            _ => ImportError::Io {
                path: path.to_path_buf(),
                source,
            },
        })?;

        let mut lines = BufReader::new(file).lines();
        let mut seen = 0usize;
        let needed = if self.spec.header { 2 } else { 1 };
        while seen < needed {
            match lines.next_line().await {
                Ok(Some(line)) if line.trim().is_empty() => continue,
                Ok(Some(line)) => {
                    if seen == 0 && self.spec.header && !line.contains(self.spec.delimiter) {
                        return Err(ImportError::Malformed {
                            path: path.to_path_buf(),
                            message: format!(
                                "header has no {:?} delimiter",
                                self.spec.delimiter
                            ),
                        });
                    }
                    seen += 1;
                }
                Ok(None) => return Err(ImportError::EmptyFile(path.to_path_buf())),
                // Non UTF-8 header bytes are left to COPY's ENCODING handling.
                Err(err) if err.kind() == std::io::ErrorKind::InvalidData => return Ok(()),
                Err(source) => {
                    return Err(ImportError::Io {
                        path: path.to_path_buf(),
                        source,
                    })
                }
            }
        }
        Ok(())
    }

    fn storage_error(&self, source: sqlx::Error) -> ImportError {
        ImportError::Storage {
            table: self.spec.table.clone(),
            source,
        }
    }

    async fn copy_file(&self, path: &Path) -> Result<(u64, u64), ImportError> {
        let mut tx = TrackedTransaction::begin(
            &self.pool,
            format!("import {}", self.spec.id),
            self.transaction_warn_after,
        )
        .await
        .map_err(|source| self.storage_error(source))?;

        match self.load_into(&mut tx, path).await {
            Ok(counts) => {
                tx.commit()
                    .await
                    .map_err(|source| self.storage_error(source))?;
                Ok(counts)
            }
            Err(err) => {
                if let Err(rollback) = tx.rollback().await {
                    warn!(error = %rollback, "rollback after failed import did not complete");
                }
                Err(err)
            }
        }
    }

    /// Truncate (when configured) and stream the file through `COPY`. Nothing is committed here.
    async fn load_into(
        &self,
        tx: &mut TrackedTransaction,
        path: &Path,
    ) -> Result<(u64, u64), ImportError> {
        let storage = |source: sqlx::Error| self.storage_error(source);

        if self.spec.truncate {
            sqlx::query(&format!("TRUNCATE TABLE {}", self.spec.table))
                .execute(tx.conn())
                .await
                .map_err(storage)?;
        }

        let mut file = File::open(path).await.map_err(|source| ImportError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut copy = tx
            .conn()
            .copy_in_raw(&self.copy_statement())
            .await
            .map_err(storage)?;

        let mut buf = vec![0u8; COPY_CHUNK_BYTES];
        let mut bytes = 0u64;
        loop {
            let n = match file.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(source) => {
                    let _ = copy.abort(format!("reading {} failed", path.display())).await;
                    return Err(ImportError::Io {
                        path: path.to_path_buf(),
                        source,
                    });
                }
            };
            copy.send(&buf[..n]).await.map_err(storage)?;
            bytes += n as u64;
        }
        let rows = copy.finish().await.map_err(storage)?;
        Ok((rows, bytes))
    }
}

impl fmt::Debug for CsvCopyImporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CsvCopyImporter")
            .field("spec", &self.spec)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Importer for CsvCopyImporter {
    fn id(&self) -> &str {
        &self.spec.id
    }

    async fn run(&self, path: &Path) -> Result<ImportSummary, ImportError> {
        let span = info_span!("import", importer = %self.spec.id, table = %self.spec.table);
        async {
            let started = Instant::now();
            self.ensure_has_rows(path).await?;
            let (rows, bytes) = self.copy_file(path).await?;
            let duration_ms = started.elapsed().as_millis() as u64;
            info!(rows, bytes, duration_ms, file = %path.display(), "import committed");
            Ok(ImportSummary {
                importer: self.spec.id.clone(),
                table: self.spec.table.clone(),
                rows,
                bytes,
                duration_ms,
            })
        }
        .instrument(span)
        .await
    }
}

fn validate_spec(spec: &ImporterSpec) -> Result<(), ImportError> {
    if spec.id.trim().is_empty() {
        return Err(ImportError::Config("importer id is empty".to_string()));
    }
    if !is_valid_identifier(&spec.table) {
        return Err(ImportError::Config(format!(
            "importer {}: invalid table name {:?}",
            spec.id, spec.table
        )));
    }
    if !spec.delimiter.is_ascii() || matches!(spec.delimiter, '\'' | '"' | '\n' | '\r') {
        return Err(ImportError::Config(format!(
            "importer {}: unsupported delimiter {:?}",
            spec.id, spec.delimiter
        )));
    }
    if let Some(encoding) = &spec.encoding {
        if encoding.is_empty() || !encoding.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
            return Err(ImportError::Config(format!(
                "importer {}: invalid encoding {:?}",
                spec.id, encoding
            )));
        }
    }
    Ok(())
}

/// Importers keyed by id, resolved once at startup.
#[derive(Default, Clone)]
pub struct ImporterRegistry {
    importers: BTreeMap<String, Arc<dyn Importer>>,
}

impl ImporterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_specs(
        specs: &[ImporterSpec],
        pool: &PgPool,
        transaction_warn_after: Duration,
    ) -> Result<Self, ImportError> {
        let mut registry = Self::new();
        for spec in specs {
            let importer = CsvCopyImporter::new(spec.clone(), pool.clone(), transaction_warn_after)?;
            registry.register(Arc::new(importer))?;
        }
        Ok(registry)
    }

    pub fn register(&mut self, importer: Arc<dyn Importer>) -> Result<(), ImportError> {
        let id = importer.id().to_string();
        if self.importers.contains_key(&id) {
            return Err(ImportError::Config(format!("duplicate importer id {id}")));
        }
        self.importers.insert(id, importer);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Importer>> {
        self.importers.get(id).cloned()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.importers.keys().map(String::as_str)
    }

    /// Fail when any source names an importer that is not registered.
    pub fn ensure_resolvable<'a>(
        &self,
        sources: impl IntoIterator<Item = &'a SourceDescriptor>,
    ) -> Result<(), ImportError> {
        let missing = sources
            .into_iter()
            .filter_map(|s| {
                s.importer
                    .as_deref()
                    .filter(|id| !self.importers.contains_key(*id))
                    .map(|id| format!("{} -> {id}", s.id))
            })
            .collect::<Vec<_>>();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(ImportError::Config(format!(
                "unknown importer referenced by: {}",
                missing.join(", ")
            )))
        }
    }
}

impl fmt::Debug for ImporterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.importers.keys()).finish()
    }
}
