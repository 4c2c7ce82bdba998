//! Run configuration, passed by reference to every component.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::BidsError;

/// Default size limit: recordings above 2 GiB are skipped.
pub const DEFAULT_MAX_FILE_SIZE: u64 = 2 * 1024 * 1024 * 1024;

/// Clinical sheet column names
///
/// Compared against the sheet headers after trimming, upper-casing and
/// replacing whitespace runs with `_`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ColumnNames {
    pub identifier: String,
    pub patient_name: String,
    pub birth_date: String,
    pub gender: String,
    pub test_name: String,
    pub result: String,
    /// Optional; the index works without it
    pub unit: String,
}

impl Default for ColumnNames {
    fn default() -> Self {
        ColumnNames {
            identifier: "DOC_NO".to_string(),
            patient_name: "PATIENT_NAME".to_string(),
            birth_date: "BIRTH_DATE".to_string(),
            gender: "GENDER".to_string(),
            test_name: "HFL_NAME".to_string(),
            result: "PARA_RESULT".to_string(),
            unit: "UNIT".to_string(),
        }
    }
}

/// Normalizes a sheet header or configured column name for comparison.
pub fn normalize_column(name: &str) -> String {
    name.trim()
        .to_uppercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Directory searched recursively for `*.edf` / `*.EDF`
    pub input_dir: PathBuf,
    /// BIDS dataset root
    pub bids_dir: PathBuf,
    /// Lab-result sheet (CSV, TSV or workbook); without it every recording is unmatched
    pub clinical_sheet: Option<PathBuf>,
    /// Defaults to `<bids_dir>/sourcedata/audit`
    pub audit_dir: Option<PathBuf>,
    pub task: String,
    /// Recordings larger than this many bytes are skipped
    pub max_file_size: u64,
    /// Reprocess recordings whose destination already exists
    pub overwrite: bool,
    /// Restrict channel labels to `[A-Za-z0-9_.-]` and backfill broken ranges
    pub sanitize_labels: bool,
    pub write_scans: bool,
    pub power_line_frequency: f64,
    pub dataset_name: String,
    pub authors: Vec<String>,
    pub columns: ColumnNames,
}

impl Default for RunConfig {
    fn default() -> Self {
        RunConfig {
            input_dir: PathBuf::from("."),
            bids_dir: PathBuf::from("bids"),
            clinical_sheet: None,
            audit_dir: None,
            task: "rest".to_string(),
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            overwrite: false,
            sanitize_labels: false,
            write_scans: false,
            power_line_frequency: 50.0,
            dataset_name: "EEG Clinical Dataset".to_string(),
            authors: Vec::new(),
            columns: ColumnNames::default(),
        }
    }
}

impl RunConfig {
    /// Loads a JSON configuration file. Missing keys take their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self, BidsError> {
        let text = fs::read_to_string(path).map_err(|e| BidsError::io(path, e))?;
        serde_json::from_str(&text)
            .map_err(|e| BidsError::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn audit_dir(&self) -> PathBuf {
        self.audit_dir
            .clone()
            .unwrap_or_else(|| self.bids_dir.join("sourcedata").join("audit"))
    }

    /// Checks what must hold before a run touches the output tree.
    pub fn validate(&self) -> Result<(), BidsError> {
        if !self.input_dir.is_dir() {
            return Err(BidsError::Config(format!(
                "Input directory {} does not exist",
                self.input_dir.display()
            )));
        }
        if self.task.is_empty() || !self.task.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(BidsError::Config(format!(
                "Task label {:?} must be non-empty and alphanumeric",
                self.task
            )));
        }
        if let Some(sheet) = &self.clinical_sheet {
            if !sheet.is_file() {
                return Err(BidsError::Config(format!(
                    "Clinical sheet {} does not exist",
                    sheet.display()
                )));
            }
        }
        if self.max_file_size == 0 {
            return Err(BidsError::Config("max_file_size must be positive".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_column_normalization() {
        assert_eq!(normalize_column("  patient name "), "PATIENT_NAME");
        assert_eq!(normalize_column("Doc\tNo"), "DOC_NO");
        assert_eq!(normalize_column("PARA_RESULT"), "PARA_RESULT");
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.json");
        fs::write(
            &path,
            r#"{ "task": "sleep", "overwrite": true, "columns": { "identifier": "HIS_ID" } }"#,
        )
        .unwrap();

        let config = RunConfig::from_json_file(&path).unwrap();
        assert_eq!(config.task, "sleep");
        assert!(config.overwrite);
        assert_eq!(config.columns.identifier, "HIS_ID");
        assert_eq!(config.columns.patient_name, "PATIENT_NAME");
        assert_eq!(config.max_file_size, DEFAULT_MAX_FILE_SIZE);
        assert_eq!(config.audit_dir(), PathBuf::from("bids/sourcedata/audit"));
    }

    #[test]
    fn test_bad_json_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        fs::write(&path, "{ task: ").unwrap();
        assert!(matches!(RunConfig::from_json_file(&path), Err(BidsError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_bad_task() {
        let dir = tempfile::tempdir().unwrap();
        let config = RunConfig {
            input_dir: dir.path().to_path_buf(),
            task: "resting-state".to_string(),
            ..RunConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
