use std::collections::HashSet;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

pub const DEFAULT_METADATA_COLUMN: &str = "metadata";
pub const DEFAULT_ID_KEY: &str = "surveyId";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkippedRow {
    pub line: u64,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Extraction {
    pub ids: Vec<String>,
    pub skipped: Vec<SkippedRow>,
    pub rows_read: usize,
}

fn id_from_metadata(cell: &str, key: &str) -> Result<String, String> {
    let cell = cell.trim();
    if cell.is_empty() {
        return Err("empty metadata".into());
    }
    let metadata: Value = serde_json::from_str(cell).map_err(|e| format!("malformed metadata JSON: {e}"))?;
    let object = metadata
        .as_object()
        .ok_or_else(|| "metadata is not a JSON object".to_string())?;

    match object.get(key) {
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.trim().to_string()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        Some(Value::Null) | None => Err(format!("metadata has no {key:?}")),
        Some(other) => Err(format!("unsupported {key:?} value: {other}")),
    }
}

/// Pull identifiers out of a JSON metadata column, one row at a time.
///
/// Rows whose metadata cannot be parsed are skipped and reported; only a
/// missing column is fatal. Identifiers are de-duplicated in first-seen order.
pub fn extract_ids<R: Read>(reader: R, column: &str, key: &str) -> Result<Extraction> {
    let mut csv_reader = csv::ReaderBuilder::new().flexible(true).from_reader(reader);
    let headers = csv_reader.headers().context("reading CSV header")?.clone();
    let index = headers
        .iter()
        .position(|h| h.trim() == column)
        .ok_or_else(|| anyhow!("column {column:?} not found in CSV header"))?;

    let mut extraction = Extraction::default();
    let mut seen = HashSet::new();

    for record in csv_reader.records() {
        let record = match record {
            Ok(record) => record,
            Err(err) => {
                let line = err.position().map(|p| p.line()).unwrap_or(0);
                warn!(line, error = %err, "unreadable CSV row skipped");
                extraction.skipped.push(SkippedRow {
                    line,
                    reason: err.to_string(),
                });
                continue;
            }
        };
        extraction.rows_read += 1;
        let line = record.position().map(|p| p.line()).unwrap_or(0);

        match id_from_metadata(record.get(index).unwrap_or(""), key) {
            Ok(id) => {
                if seen.insert(id.clone()) {
                    extraction.ids.push(id);
                }
            }
            Err(reason) => {
                debug!(line, reason = %reason, "row skipped");
                extraction.skipped.push(SkippedRow { line, reason });
            }
        }
    }

    info!(
        rows = extraction.rows_read,
        ids = extraction.ids.len(),
        skipped = extraction.skipped.len(),
        "identifiers extracted"
    );
    Ok(extraction)
}

pub fn extract_ids_from_path(path: &Path, column: &str, key: &str) -> Result<Extraction> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    extract_ids(file, column, key).with_context(|| format!("extracting ids from {}", path.display()))
}
