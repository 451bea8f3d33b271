//! CSV output of update outcomes and identifier extraction from exported rows.

pub mod csv;
pub mod extract;

pub use self::csv::{export_to_file, outcome_rows, write_outcomes, write_rows, OutcomeFiles, Row};
pub use self::extract::{extract_ids, extract_ids_from_path, Extraction, SkippedRow};
