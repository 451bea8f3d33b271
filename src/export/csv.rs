//! Delimited-text export of uniform JSON rows.
//!
//! A field is quoted only when it contains a comma, quote or line break, with
//! inner quotes doubled. Nested values are written as compact JSON text.
//! A row consisting of a single empty field is written as `""` so that it reads
//! back as one empty value rather than a blank line.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use csv::{QuoteStyle, WriterBuilder};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::info;
use uuid::Uuid;

use crate::commands::batch::BatchReport;
use crate::transport::UpdateOutcome;

pub type Row = Map<String, Value>;

/// Column order of exported outcome files.
pub const OUTCOME_COLUMNS: [&str; 8] = [
    "success",
    "objectType",
    "recordId",
    "statusCode",
    "error",
    "timestamp",
    "updateData",
    "metadata",
];

/// Union of row keys in first-seen order.
pub fn infer_columns(rows: &[Row]) -> Vec<String> {
    let mut seen = HashSet::new();
    rows.iter()
        .flat_map(|row| row.keys())
        .filter(|key| seen.insert(key.as_str()))
        .cloned()
        .collect()
}

pub fn cell_text(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Bool(b)) => b.to_string(),
        Some(Value::Number(n)) => n.to_string(),
        Some(nested) => nested.to_string(),
    }
}

/// Write a header row followed by one row per record.
pub fn write_rows<W: Write>(writer: W, rows: &[Row], columns: Option<&[String]>) -> Result<()> {
    let columns = match columns {
        Some(columns) => columns.to_vec(),
        None => infer_columns(rows),
    };
    if columns.is_empty() {
        return Ok(());
    }

    let mut out = WriterBuilder::new()
        .quote_style(QuoteStyle::Necessary)
        .from_writer(writer);
    out.write_record(&columns).context("writing CSV header")?;
    for row in rows {
        out.write_record(columns.iter().map(|column| cell_text(row.get(column))))
            .context("writing CSV row")?;
    }
    out.flush().context("flushing CSV output")?;
    Ok(())
}

pub fn to_csv_string(rows: &[Row], columns: Option<&[String]>) -> Result<String> {
    let mut buf = Vec::new();
    write_rows(&mut buf, rows, columns)?;
    String::from_utf8(buf).context("CSV output is not UTF-8")
}

/// Write rows to `path`, creating the parent directory when needed.
pub fn export_to_file(path: &Path, rows: &[Row], columns: Option<&[String]>) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating output directory {}", parent.display()))?;
    }
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    write_rows(file, rows, columns)?;
    info!(path = %path.display(), rows = rows.len(), "CSV exported");
    Ok(())
}

pub fn outcome_rows(outcomes: &[UpdateOutcome]) -> Vec<Row> {
    outcomes
        .iter()
        .map(|outcome| {
            let mut row = Row::new();
            row.insert("success".into(), Value::Bool(outcome.success));
            row.insert("objectType".into(), Value::String(outcome.object_type.clone()));
            row.insert(
                "recordId".into(),
                outcome.record_id.clone().map(Value::String).unwrap_or(Value::Null),
            );
            row.insert(
                "statusCode".into(),
                outcome.status_code.map(Value::from).unwrap_or(Value::Null),
            );
            row.insert(
                "error".into(),
                outcome
                    .error
                    .as_ref()
                    .map(|e| Value::String(e.to_string()))
                    .unwrap_or(Value::Null),
            );
            row.insert("timestamp".into(), Value::String(outcome.timestamp.to_rfc3339()));
            row.insert("updateData".into(), Value::Object(outcome.update_data.clone()));
            row.insert("metadata".into(), Value::Object(outcome.metadata.clone()));
            row
        })
        .collect()
}

/// UTC second stamp plus a run id prefix, so runs started in the same second never share files.
pub fn run_stamp(run_id: Uuid) -> String {
    let simple = run_id.simple().to_string();
    format!("{}_{}", chrono::Utc::now().format("%Y%m%dT%H%M%SZ"), &simple[..8])
}

#[derive(Debug, Clone, Serialize)]
pub struct OutcomeFiles {
    pub successes: PathBuf,
    pub failures: PathBuf,
    pub summary: PathBuf,
}

/// Write the success list, failure list and a JSON summary into `dir`.
pub fn write_outcomes(dir: &Path, report: &BatchReport, stamp: &str) -> Result<OutcomeFiles> {
    let columns: Vec<String> = OUTCOME_COLUMNS.iter().map(|c| c.to_string()).collect();
    let files = OutcomeFiles {
        successes: dir.join(format!("successful_updates_{stamp}.csv")),
        failures: dir.join(format!("failed_updates_{stamp}.csv")),
        summary: dir.join(format!("update_summary_{stamp}.json")),
    };

    export_to_file(&files.successes, &outcome_rows(&report.successes), Some(&columns))?;
    export_to_file(&files.failures, &outcome_rows(&report.failures), Some(&columns))?;

    let summary = serde_json::to_vec_pretty(&report.summary()).context("serializing summary")?;
    fs::write(&files.summary, summary)
        .with_context(|| format!("writing {}", files.summary.display()))?;
    Ok(files)
}
