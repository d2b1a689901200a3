use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use study_integrity_core::{RawTaskEvent, ReportRow, REPORT_COLUMNS};

/// Read a task-log export. Columns are matched by header name; columns the
/// checker does not use are ignored and empty cells read as absent.
pub fn read_task_log(path: &Path) -> Result<Vec<RawTaskEvent>> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("failed to open task log {}", path.display()))?;

    let mut events = Vec::new();
    for (index, record) in reader.deserialize::<RawTaskEvent>().enumerate() {
        let event = record.with_context(|| {
            format!("failed to parse task log {} at data row {}", path.display(), index + 1)
        })?;
        events.push(event);
    }

    tracing::info!(rows = events.len(), path = %path.display(), "read task log");
    Ok(events)
}

/// Render the report, header first even when there are no rows.
pub fn render_report(rows: &[ReportRow]) -> Result<Vec<u8>> {
    let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(Vec::new());
    writer.write_record(REPORT_COLUMNS).context("failed to write report header")?;
    for row in rows {
        writer.serialize(row).context("failed to write report row")?;
    }
    writer.into_inner().map_err(|err| anyhow::anyhow!("failed to flush report: {}", err.error()))
}

/// Write the report to `path` and return the SHA-256 of the bytes written.
pub fn write_report(path: &Path, rows: &[ReportRow]) -> Result<String> {
    let bytes = render_report(rows)?;
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent).with_context(|| {
            format!("failed to create report directory {}", parent.display())
        })?;
    }
    fs::write(path, &bytes)
        .with_context(|| format!("failed to write report {}", path.display()))?;
    Ok(sha256_hex(&bytes))
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}
