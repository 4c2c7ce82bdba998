//! Append-only audit tables: mapping, skipped files and unmatched recordings.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use log::debug;
use serde::Serialize;

use crate::error::BidsError;

pub const MAPPING_FILE: &str = "mapping.csv";
pub const SKIPPED_FILE: &str = "skipped_files.csv";
pub const UNMATCHED_FILE: &str = "unmatched_edf_files.txt";

const MAPPING_COLUMNS: [&str; 7] = [
    "participant_id",
    "source_path",
    "anonymized_path",
    "original_identity",
    "status",
    "strategy",
    "detail",
];
const SKIPPED_COLUMNS: [&str; 3] = ["path", "size_bytes", "reason"];

/// One processed recording
#[derive(Debug, Clone, Serialize)]
pub struct MappingRow {
    pub participant_id: String,
    pub source_path: String,
    pub anonymized_path: String,
    /// Identity string as found in the header, kept verbatim
    pub original_identity: String,
    pub status: String,
    pub strategy: String,
    pub detail: String,
}

/// One recording that was not processed
#[derive(Debug, Clone, Serialize)]
pub struct SkippedRow {
    pub path: String,
    pub size_bytes: u64,
    pub reason: String,
}

/// Writes the audit tables of a run
///
/// Tables are opened in append mode so successive runs accumulate; the
/// header row is only written to a new or empty file. Every row is flushed
/// immediately.
pub struct AuditRecorder {
    dir: PathBuf,
    mapping: csv::Writer<File>,
    skipped: csv::Writer<File>,
    unmatched: BufWriter<File>,
}

fn open_table(path: &Path, headers: &[&str]) -> Result<csv::Writer<File>, BidsError> {
    let is_new = fs::metadata(path).map(|m| m.len() == 0).unwrap_or(true);
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| BidsError::io(path, e))?;

    let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(file);
    if is_new {
        writer.write_record(headers)?;
        writer.flush().map_err(|e| BidsError::io(path, e))?;
    }
    Ok(writer)
}

impl AuditRecorder {
    pub fn open(dir: &Path) -> Result<Self, BidsError> {
        fs::create_dir_all(dir).map_err(|e| BidsError::io(dir, e))?;

        let unmatched_path = dir.join(UNMATCHED_FILE);
        let unmatched = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&unmatched_path)
            .map_err(|e| BidsError::io(&unmatched_path, e))?;

        Ok(AuditRecorder {
            dir: dir.to_path_buf(),
            mapping: open_table(&dir.join(MAPPING_FILE), &MAPPING_COLUMNS)?,
            skipped: open_table(&dir.join(SKIPPED_FILE), &SKIPPED_COLUMNS)?,
            unmatched: BufWriter::new(unmatched),
        })
    }

    pub fn record_mapping(&mut self, row: &MappingRow) -> Result<(), BidsError> {
        self.mapping.serialize(row)?;
        self.mapping.flush().map_err(|e| BidsError::io(self.dir.join(MAPPING_FILE), e))?;
        debug!("mapping: {} -> {} ({})", row.source_path, row.participant_id, row.status);
        Ok(())
    }

    pub fn record_skipped(&mut self, row: &SkippedRow) -> Result<(), BidsError> {
        self.skipped.serialize(row)?;
        self.skipped.flush().map_err(|e| BidsError::io(self.dir.join(SKIPPED_FILE), e))?;
        debug!("skipped: {} ({})", row.path, row.reason);
        Ok(())
    }

    pub fn record_unmatched(&mut self, path: &Path) -> Result<(), BidsError> {
        let target = self.dir.join(UNMATCHED_FILE);
        writeln!(self.unmatched, "{}", path.display()).map_err(|e| BidsError::io(&target, e))?;
        self.unmatched.flush().map_err(|e| BidsError::io(&target, e))
    }

    /// Flushes every table
    pub fn finish(mut self) -> Result<(), BidsError> {
        self.mapping.flush().map_err(|e| BidsError::io(self.dir.join(MAPPING_FILE), e))?;
        self.skipped.flush().map_err(|e| BidsError::io(self.dir.join(SKIPPED_FILE), e))?;
        self.unmatched.flush().map_err(|e| BidsError::io(self.dir.join(UNMATCHED_FILE), e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapping_row(id: &str) -> MappingRow {
        MappingRow {
            participant_id: id.to_string(),
            source_path: "/in/a.edf".to_string(),
            anonymized_path: "/bids/sub-0001/eeg/sub-0001_task-rest_eeg.edf".to_string(),
            original_identity: "TRAN_THI_B_85".to_string(),
            status: "anonymized".to_string(),
            strategy: "chunked-rewrite".to_string(),
            detail: String::new(),
        }
    }

    #[test]
    fn test_tables_append_across_recorders() {
        let dir = tempfile::tempdir().unwrap();

        {
            let mut audit = AuditRecorder::open(dir.path()).unwrap();
            audit.record_mapping(&mapping_row("sub-0001")).unwrap();
            audit
                .record_skipped(&SkippedRow {
                    path: "/in/big.edf".to_string(),
                    size_bytes: 4096,
                    reason: "exceeds 1024 bytes".to_string(),
                })
                .unwrap();
            audit.record_unmatched(Path::new("/in/x.edf")).unwrap();
            audit.finish().unwrap();
        }

        let mut audit = AuditRecorder::open(dir.path()).unwrap();
        audit.record_mapping(&mapping_row("sub-0002")).unwrap();
        drop(audit);

        let mapping = fs::read_to_string(dir.path().join(MAPPING_FILE)).unwrap();
        let lines: Vec<&str> = mapping.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], MAPPING_COLUMNS.join(","));
        assert!(lines[2].starts_with("sub-0002,/in/a.edf,"));

        let skipped = fs::read_to_string(dir.path().join(SKIPPED_FILE)).unwrap();
        assert_eq!(skipped.lines().nth(1), Some("/in/big.edf,4096,exceeds 1024 bytes"));

        let unmatched = fs::read_to_string(dir.path().join(UNMATCHED_FILE)).unwrap();
        assert_eq!(unmatched, "/in/x.edf\n");
    }
}
