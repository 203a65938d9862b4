//! External-interface ingesters: binary CFG JSON, DWARF JSON, source CFG
//! CSV, opcode timing CSV and loop-skip annotation JSON.
//!
//! Out of the core analysis scope per the mapping specification (§3), but
//! required to drive the pipeline end to end from the CLI. Grounded on
//! §6's wire formats; parses with `serde_json`/`csv`, matching the
//! compiler's own front-end ingestion style (manual validation + a single
//! error enum per format, no derive-based strict schemas since the wire
//! formats mix optional/variant-typed fields).

pub mod annotations;
pub mod bin_json;
pub mod dwarf_json;
pub mod optime_csv;
pub mod src_csv;

use std::fmt;

#[derive(Debug)]
pub enum IngestError {
    Json(String),
    Csv(String),
    Schema(String),
    Io(std::io::Error),
}

impl fmt::Display for IngestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IngestError::Json(msg) => write!(f, "malformed JSON: {msg}"),
            IngestError::Csv(msg) => write!(f, "malformed CSV: {msg}"),
            IngestError::Schema(msg) => write!(f, "schema validation failed: {msg}"),
            IngestError::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for IngestError {}

impl From<std::io::Error> for IngestError {
    fn from(e: std::io::Error) -> Self {
        IngestError::Io(e)
    }
}

impl From<serde_json::Error> for IngestError {
    fn from(e: serde_json::Error) -> Self {
        IngestError::Json(e.to_string())
    }
}
