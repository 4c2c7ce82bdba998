use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while reading or writing EDF/EDF+ containers
#[derive(Debug, Error)]
pub enum EdfError {
    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid file format: {0}")]
    InvalidFormat(String),

    #[error("File contains format errors")]
    FormatError,

    #[error("Signal index {0} out of range")]
    InvalidSignalIndex(usize),

    #[error("Unsupported file type: {0}")]
    UnsupportedFileType(String),

    #[error("Invalid header size")]
    InvalidHeader,

    #[error("Invalid number of signals: {0}")]
    InvalidSignalCount(i32),

    #[error("Physical min equals physical max")]
    PhysicalMinEqualsMax,

    #[error("Digital min must be lower than digital max")]
    DigitalMinEqualsMax,
}

pub type Result<T> = std::result::Result<T, EdfError>;

/// Run-level errors. Only these abort a run; per-recording problems are
/// reported through the audit tables instead.
#[derive(Debug, Error)]
pub enum BidsError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Clinical sheet {path} is missing required columns: {missing:?}")]
    MissingColumns { path: PathBuf, missing: Vec<String> },

    #[error("Cannot read clinical sheet {path}: {source}")]
    ClinicalSheet {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("Cannot read clinical workbook {path}: {source}")]
    Workbook {
        path: PathBuf,
        #[source]
        source: calamine::Error,
    },

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Invalid glob pattern: {0}")]
    Pattern(#[from] glob::PatternError),
}

impl BidsError {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        BidsError::Io { path: path.into(), source }
    }
}
