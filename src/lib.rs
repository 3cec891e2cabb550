//! Driving exam statistics: import delimited exports into a local SQLite store
//! and query them back with filters for tables, charts and printable reports.

pub mod commands;
pub mod config;
pub mod csv_source;
pub mod exam_import;
pub mod exam_record;
pub mod exam_store;
pub mod read_queries;
pub mod report_export;

use std::path::PathBuf;

pub use exam_import::{
    import_exam_file, import_exam_path, parse_count, parse_exam_file, preview_exam_file,
    ImportOutcome, ParsedExamFile,
};
pub use exam_record::{ExamRecord, Period, TextField};
pub use exam_store::{ExamStore, StoreStats};
pub use read_queries::{ExamFilter, ExamTable, ExamTableRow, ExamTypeTotals, LedgerEntry};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("could not read {}: {reason}", path.display())]
    UnreadableFile { path: PathBuf, reason: String },

    #[error("file is empty: {}", path.display())]
    EmptyFile { path: PathBuf },

    #[error("no valid rows found in {}", path.display())]
    NoValidRows { path: PathBuf },

    #[error("all periods in {} were already imported ({})", path.display(), format_periods(periods))]
    NothingToImport { path: PathBuf, periods: Vec<Period> },

    #[error("invalid filter: {0}")]
    InvalidFilter(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Stable code for machine-readable error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::UnreadableFile { .. } => "UNREADABLE_FILE",
            Error::EmptyFile { .. } => "EMPTY_FILE",
            Error::NoValidRows { .. } => "NO_VALID_ROWS",
            Error::NothingToImport { .. } => "NOTHING_TO_IMPORT",
            Error::InvalidFilter(_) => "INVALID_FILTER",
            Error::Config(_) => "CONFIG_ERROR",
            Error::Storage(_) => "STORAGE_ERROR",
            Error::Csv(_) => "CSV_ERROR",
            Error::Io(_) => "IO_ERROR",
            Error::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }
}

fn format_periods(periods: &[Period]) -> String {
    periods
        .iter()
        .map(Period::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}
