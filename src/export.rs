use chrono::{TimeZone, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Serialize;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{PResult, PipelineError};
use crate::recorder::{RecordingExport, Table};

/// Writes a finished recording to disk, one table per sensor group.
pub trait ExportWriter: Send + Sync {
    /// Returns the path of the artifact written.
    fn write(&self, export: &RecordingExport, device_id: &str) -> PResult<PathBuf>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ExportFormat {
    /// Single JSON workbook holding every table
    Json,
    /// Directory with one CSV file per table
    Csv,
}

pub fn writer_for(format: ExportFormat, dir: &Path, gzip: bool) -> Arc<dyn ExportWriter> {
    match format {
        ExportFormat::Json => Arc::new(JsonExportWriter::new(dir, gzip)),
        ExportFormat::Csv => Arc::new(CsvExportWriter::new(dir)),
    }
}

/// A recording snapshot bound to the writer that will persist it.
///
/// Owns everything it needs so the write can leave the pipeline task.
pub struct ExportJob {
    writer: Arc<dyn ExportWriter>,
    export: RecordingExport,
    device_id: String,
}

impl ExportJob {
    pub fn new(writer: Arc<dyn ExportWriter>, export: RecordingExport, device_id: &str) -> Self {
        ExportJob {
            writer,
            export,
            device_id: device_id.to_string(),
        }
    }

    pub fn rows(&self) -> usize {
        self.export.row_count()
    }

    /// Write on the current thread. Every failure is reported as `Export`.
    pub fn write(&self) -> PResult<PathBuf> {
        self.writer
            .write(&self.export, &self.device_id)
            .map_err(|e| match e {
                e @ PipelineError::Export(_) => e,
                other => PipelineError::Export(other.to_string()),
            })
    }

    /// Write on the blocking pool, returning the artifact path and row count.
    pub async fn run(self) -> PResult<(PathBuf, usize)> {
        let rows = self.rows();
        let path = tokio::task::spawn_blocking(move || self.write())
            .await
            .map_err(|e| PipelineError::Export(format!("export task failed: {e}")))??;
        Ok((path, rows))
    }
}

/// `YYYYMMDD_HHMMSS` (UTC) for the recording start.
pub fn start_stamp(started_at_ms: i64) -> String {
    Utc.timestamp_millis_opt(started_at_ms)
        .single()
        .map(|t| t.format("%Y%m%d_%H%M%S").to_string())
        .unwrap_or_else(|| "00000000_000000".to_string())
}

/// Artifact base name: `{device}_{YYYYMMDD_HHMMSS}`.
pub fn artifact_stem(device_id: &str, started_at_ms: i64) -> String {
    let device: String = device_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    let device = if device.is_empty() { "device".to_string() } else { device };
    format!("{}_{}", device, start_stamp(started_at_ms))
}

#[derive(Serialize)]
struct Workbook<'a> {
    device_id: &'a str,
    started_at: String,
    started_at_ms: i64,
    tables: Vec<Table>,
}

/// JSON workbook, optionally gzip compressed.
pub struct JsonExportWriter {
    dir: PathBuf,
    gzip: bool,
}

impl JsonExportWriter {
    pub fn new(dir: &Path, gzip: bool) -> Self {
        JsonExportWriter {
            dir: dir.to_path_buf(),
            gzip,
        }
    }
}

impl ExportWriter for JsonExportWriter {
    fn write(&self, export: &RecordingExport, device_id: &str) -> PResult<PathBuf> {
        fs::create_dir_all(&self.dir)?;
        let stem = artifact_stem(device_id, export.started_at_ms);
        let workbook = Workbook {
            device_id,
            started_at: Utc
                .timestamp_millis_opt(export.started_at_ms)
                .single()
                .map(|t| t.to_rfc3339())
                .unwrap_or_default(),
            started_at_ms: export.started_at_ms,
            tables: export.tables(),
        };

        let path = if self.gzip {
            let path = self.dir.join(format!("{stem}.json.gz"));
            let mut encoder = GzEncoder::new(File::create(&path)?, Compression::default());
            serde_json::to_writer_pretty(&mut encoder, &workbook)
                .map_err(|e| PipelineError::Export(e.to_string()))?;
            encoder.finish()?;
            path
        } else {
            let path = self.dir.join(format!("{stem}.json"));
            let mut writer = BufWriter::new(File::create(&path)?);
            serde_json::to_writer_pretty(&mut writer, &workbook)
                .map_err(|e| PipelineError::Export(e.to_string()))?;
            writer.flush()?;
            path
        };

        log::info!(
            "[EXPORT] Wrote {} rows in {} tables to {}",
            export.row_count(),
            workbook.tables.len(),
            path.display()
        );
        Ok(path)
    }
}

/// One CSV per table inside a `{device}_{stamp}` directory.
pub struct CsvExportWriter {
    dir: PathBuf,
}

impl CsvExportWriter {
    pub fn new(dir: &Path) -> Self {
        CsvExportWriter {
            dir: dir.to_path_buf(),
        }
    }
}

impl ExportWriter for CsvExportWriter {
    fn write(&self, export: &RecordingExport, device_id: &str) -> PResult<PathBuf> {
        let out_dir = self.dir.join(artifact_stem(device_id, export.started_at_ms));
        fs::create_dir_all(&out_dir)?;

        let tables = export.tables();
        for table in &tables {
            let mut writer = csv::Writer::from_path(out_dir.join(format!("{}.csv", table.name)))?;
            writer.write_record(&table.columns)?;
            for row in &table.rows {
                let mut record = Vec::with_capacity(row.cells.len() + 1);
                record.push(row.ts_ms.to_string());
                record.extend(
                    row.cells
                        .iter()
                        .map(|cell| cell.map(|v| v.to_string()).unwrap_or_default()),
                );
                writer.write_record(&record)?;
            }
            writer.flush()?;
        }

        log::info!(
            "[EXPORT] Wrote {} rows as {} CSV tables to {}",
            export.row_count(),
            tables.len(),
            out_dir.display()
        );
        Ok(out_dir)
    }
}
