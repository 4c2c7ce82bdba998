//! Subject ID Allocator with a persisted key log.

use std::collections::HashMap;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use log::{debug, info, warn};

use crate::error::BidsError;

/// Width of the zero-padded subject code
pub const CODE_WIDTH: usize = 4;

/// File name of the persisted allocation log inside the audit directory
pub const SUBJECT_MAP_FILE: &str = "subject_map.tsv";

/// Per-source log of subject keys and run numbers
pub const RECORDING_MAP_FILE: &str = "recording_map.tsv";

/// What a subject code is allocated for
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SubjectKey {
    /// Matched recording: the clinical identifier
    Clinical(String),
    /// Unmatched recording: the source path
    Recording(PathBuf),
}

impl SubjectKey {
    pub fn parse(s: &str) -> Option<SubjectKey> {
        if let Some(id) = s.strip_prefix("doc:") {
            Some(SubjectKey::Clinical(id.to_string()))
        } else {
            s.strip_prefix("file:").map(|p| SubjectKey::Recording(PathBuf::from(p)))
        }
    }

    pub fn clinical_identifier(&self) -> Option<&str> {
        match self {
            SubjectKey::Clinical(id) => Some(id),
            SubjectKey::Recording(_) => None,
        }
    }
}

impl fmt::Display for SubjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubjectKey::Clinical(id) => write!(f, "doc:{}", id),
            SubjectKey::Recording(path) => write!(f, "file:{}", path.display()),
        }
    }
}

/// Anonymous subject code, displayed zero-padded (`0001`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubjectCode(pub u32);

impl SubjectCode {
    /// BIDS participant label, `sub-0001`
    pub fn label(&self) -> String {
        format!("sub-{}", self)
    }

    /// Parses `0001` or `sub-0001`
    pub fn parse(s: &str) -> Option<SubjectCode> {
        let digits = s.trim().strip_prefix("sub-").unwrap_or(s.trim());
        if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }
        digits.parse().ok().map(SubjectCode)
    }
}

impl fmt::Display for SubjectCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:0width$}", self.0, width = CODE_WIDTH)
    }
}

/// Maps subject keys to stable, monotonically increasing codes
///
/// A key keeps its code for the whole run, and across runs when the
/// allocator is opened on a directory with a key log. New codes start after
/// both the highest logged code and the number of `sub-*` directories
/// already present.
pub struct SubjectAllocator {
    codes: HashMap<SubjectKey, SubjectCode>,
    /// Allocation order, for stable iteration
    order: Vec<SubjectKey>,
    next_id: u32,
    log: Option<csv::Writer<File>>,
}

impl SubjectAllocator {
    /// In-memory allocator; the first code is `existing + 1`
    pub fn new(existing: u32) -> Self {
        SubjectAllocator {
            codes: HashMap::new(),
            order: Vec::new(),
            next_id: existing + 1,
            log: None,
        }
    }

    /// Opens the allocator for a dataset, resuming from `subject_map.tsv`
    /// in `audit_dir` and the subject directories under `bids_dir`.
    pub fn open(bids_dir: &Path, audit_dir: &Path) -> Result<Self, BidsError> {
        let existing_dirs = count_subject_dirs(bids_dir)?;
        let log_path = audit_dir.join(SUBJECT_MAP_FILE);

        let mut allocator = SubjectAllocator::new(0);
        let mut highest = 0;
        if log_path.is_file() {
            for (key, code) in read_key_log(&log_path)? {
                highest = highest.max(code.0);
                if !allocator.codes.contains_key(&key) {
                    allocator.order.push(key.clone());
                }
                allocator.codes.insert(key, code);
            }
        }
        allocator.next_id = existing_dirs.max(highest) + 1;

        allocator.log = Some(open_log(audit_dir, &log_path, &["key", "code"])?);

        info!(
            "Subject allocator: {} existing subject dirs, {} logged keys, next code {}",
            existing_dirs,
            allocator.codes.len(),
            SubjectCode(allocator.next_id)
        );
        Ok(allocator)
    }

    /// Returns the code for `key`, minting the next one on first use
    pub fn allocate(&mut self, key: &SubjectKey) -> Result<SubjectCode, BidsError> {
        if let Some(&code) = self.codes.get(key) {
            return Ok(code);
        }

        let code = SubjectCode(self.next_id);
        self.next_id += 1;

        if let Some(log) = self.log.as_mut() {
            log.write_record([key.to_string(), code.to_string()])?;
            log.flush().map_err(|e| BidsError::io(SUBJECT_MAP_FILE, e))?;
        }

        debug!("Allocated {} for {}", code.label(), key);
        self.codes.insert(key.clone(), code);
        self.order.push(key.clone());
        Ok(code)
    }

    pub fn get(&self, key: &SubjectKey) -> Option<SubjectCode> {
        self.codes.get(key).copied()
    }

    /// Every known association, previously logged ones included, in
    /// allocation order
    pub fn allocations(&self) -> impl Iterator<Item = (&SubjectKey, SubjectCode)> + '_ {
        self.order.iter().filter_map(move |k| self.codes.get(k).map(|&c| (k, c)))
    }

    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }
}

/// Where a source recording went in an earlier run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggedRecording {
    pub key: SubjectKey,
    pub run: Option<u32>,
}

/// Persisted source path -> (subject key, run) association
///
/// Makes "already processed" a property of the source file and keeps run
/// numbers stable: a recording that arrives in a later run gets the next
/// free run of its subject instead of shifting the existing ones.
#[derive(Default)]
pub struct RecordingLog {
    entries: HashMap<PathBuf, LoggedRecording>,
    log: Option<csv::Writer<File>>,
}

impl RecordingLog {
    /// Opens `recording_map.tsv` in `audit_dir`, creating it when missing
    pub fn open(audit_dir: &Path) -> Result<Self, BidsError> {
        let log_path = audit_dir.join(RECORDING_MAP_FILE);
        let mut entries = HashMap::new();

        if log_path.is_file() {
            let mut reader = csv::ReaderBuilder::new()
                .delimiter(b'\t')
                .flexible(true)
                .from_path(&log_path)?;
            for row in reader.records() {
                let row = row?;
                let key = row.get(1).and_then(SubjectKey::parse);
                let run = match row.get(2).map(str::trim) {
                    None | Some("") => Some(None),
                    Some(run) => run.parse::<u32>().ok().map(Some),
                };
                match (row.get(0), key, run) {
                    (Some(source), Some(key), Some(run)) => {
                        // 后写入的条目覆盖先前的
                        entries.insert(PathBuf::from(source), LoggedRecording { key, run });
                    }
                    _ => warn!("{}: ignoring malformed row {:?}", log_path.display(), row),
                }
            }
        }

        let log = open_log(audit_dir, &log_path, &["source", "key", "run"])?;
        debug!("Recording log: {} known sources", entries.len());
        Ok(RecordingLog { entries, log: Some(log) })
    }

    pub fn get(&self, source: &Path) -> Option<&LoggedRecording> {
        self.entries.get(source)
    }

    /// Highest run already used by `key`; an unnumbered recording counts as
    /// run 1. `None` when the key has no logged recording.
    pub fn highest_run(&self, key: &SubjectKey) -> Option<u32> {
        self.entries
            .values()
            .filter(|entry| &entry.key == key)
            .map(|entry| entry.run.unwrap_or(1))
            .max()
    }

    /// Remembers where `source` goes; a no-op when already logged identically
    pub fn record(&mut self, source: &Path, key: &SubjectKey, run: Option<u32>) -> Result<(), BidsError> {
        let entry = LoggedRecording { key: key.clone(), run };
        if self.entries.get(source) == Some(&entry) {
            return Ok(());
        }

        if let Some(log) = self.log.as_mut() {
            let run = run.map(|r| r.to_string()).unwrap_or_default();
            log.write_record([source.display().to_string(), key.to_string(), run])?;
            log.flush().map_err(|e| BidsError::io(RECORDING_MAP_FILE, e))?;
        }
        self.entries.insert(source.to_path_buf(), entry);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Opens a tab-separated log for appending, writing `headers` to a new file
fn open_log(audit_dir: &Path, log_path: &Path, headers: &[&str]) -> Result<csv::Writer<File>, BidsError> {
    fs::create_dir_all(audit_dir).map_err(|e| BidsError::io(audit_dir, e))?;
    let is_new = fs::metadata(log_path).map(|m| m.len() == 0).unwrap_or(true);
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .map_err(|e| BidsError::io(log_path, e))?;
    let mut writer = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .has_headers(false)
        .from_writer(file);
    if is_new {
        writer.write_record(headers)?;
        writer.flush().map_err(|e| BidsError::io(log_path, e))?;
    }
    Ok(writer)
}

fn count_subject_dirs(bids_dir: &Path) -> Result<u32, BidsError> {
    if !bids_dir.is_dir() {
        return Ok(0);
    }
    let entries = fs::read_dir(bids_dir).map_err(|e| BidsError::io(bids_dir, e))?;
    let count = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_dir())
        .filter(|entry| entry.file_name().to_string_lossy().starts_with("sub-"))
        .count();
    Ok(count as u32)
}

fn read_key_log(path: &Path) -> Result<Vec<(SubjectKey, SubjectCode)>, BidsError> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .flexible(true)
        .from_path(path)?;

    let mut entries = Vec::new();
    for row in reader.records() {
        let row = row?;
        let parsed = match (row.get(0), row.get(1)) {
            (Some(key), Some(code)) => SubjectKey::parse(key).zip(SubjectCode::parse(code)),
            _ => None,
        };
        match parsed {
            Some(entry) => entries.push(entry),
            None => warn!("{}: ignoring malformed row {:?}", path.display(), row),
        }
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_is_idempotent_and_unique() {
        let mut allocator = SubjectAllocator::new(0);
        let a = SubjectKey::Clinical("7".to_string());
        let b = SubjectKey::Recording(PathBuf::from("/in/x.edf"));

        let code_a = allocator.allocate(&a).unwrap();
        let code_b = allocator.allocate(&b).unwrap();
        assert_eq!(code_a.to_string(), "0001");
        assert_eq!(code_b.label(), "sub-0002");
        assert_eq!(allocator.allocate(&a).unwrap(), code_a);
        assert_eq!(allocator.len(), 2);
    }

    #[test]
    fn test_key_and_code_parsing() {
        assert_eq!(SubjectKey::parse("doc:7"), Some(SubjectKey::Clinical("7".to_string())));
        assert_eq!(
            SubjectKey::parse("file:/a/b.edf"),
            Some(SubjectKey::Recording(PathBuf::from("/a/b.edf")))
        );
        assert_eq!(SubjectKey::parse("7"), None);
        assert_eq!(SubjectCode::parse("sub-0012"), Some(SubjectCode(12)));
        assert_eq!(SubjectCode::parse("0003"), Some(SubjectCode(3)));
        assert_eq!(SubjectCode::parse("sub-"), None);
    }

    #[test]
    fn test_resumes_from_log_and_directories() {
        let dir = tempfile::tempdir().unwrap();
        let bids = dir.path().join("bids");
        let audit = bids.join("sourcedata").join("audit");

        {
            let mut allocator = SubjectAllocator::open(&bids, &audit).unwrap();
            allocator.allocate(&SubjectKey::Clinical("7".to_string())).unwrap();
            allocator.allocate(&SubjectKey::Clinical("9".to_string())).unwrap();
        }

        // three directories exist although only two codes were logged
        for i in 1..=3 {
            fs::create_dir_all(bids.join(format!("sub-{:04}", i))).unwrap();
        }

        let mut allocator = SubjectAllocator::open(&bids, &audit).unwrap();
        assert_eq!(allocator.get(&SubjectKey::Clinical("9".to_string())), Some(SubjectCode(2)));
        assert_eq!(allocator.allocate(&SubjectKey::Clinical("7".to_string())).unwrap(), SubjectCode(1));
        assert_eq!(allocator.allocate(&SubjectKey::Clinical("11".to_string())).unwrap(), SubjectCode(4));

        let log = fs::read_to_string(audit.join(SUBJECT_MAP_FILE)).unwrap();
        assert_eq!(log.lines().next(), Some("key\tcode"));
        assert_eq!(log.lines().count(), 4);
    }

    #[test]
    fn test_recording_log_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let patient = SubjectKey::Clinical("7".to_string());
        let stray = SubjectKey::Recording(PathBuf::from("/in/x.edf"));

        {
            let mut log = RecordingLog::open(dir.path()).unwrap();
            assert_eq!(log.highest_run(&patient), None);
            log.record(Path::new("/in/b.edf"), &patient, Some(1)).unwrap();
            log.record(Path::new("/in/c.edf"), &patient, Some(2)).unwrap();
            log.record(Path::new("/in/x.edf"), &stray, None).unwrap();
            log.record(Path::new("/in/x.edf"), &stray, None).unwrap();
        }

        let log = RecordingLog::open(dir.path()).unwrap();
        assert_eq!(log.len(), 3);
        assert_eq!(
            log.get(Path::new("/in/c.edf")),
            Some(&LoggedRecording { key: patient.clone(), run: Some(2) })
        );
        assert_eq!(log.highest_run(&patient), Some(2));
        assert_eq!(log.highest_run(&stray), Some(1));
        assert!(log.get(Path::new("/in/a.edf")).is_none());

        let text = fs::read_to_string(dir.path().join(RECORDING_MAP_FILE)).unwrap();
        assert_eq!(text.lines().count(), 4);
        assert_eq!(text.lines().nth(3), Some("/in/x.edf\tfile:/in/x.edf\t"));
    }

    #[test]
    fn test_start_counts_existing_directories_without_log() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("sub-0001")).unwrap();
        fs::create_dir_all(dir.path().join("sub-0002")).unwrap();
        fs::create_dir_all(dir.path().join("phenotype")).unwrap();

        let mut allocator = SubjectAllocator::open(dir.path(), &dir.path().join("audit")).unwrap();
        let code = allocator.allocate(&SubjectKey::Clinical("1".to_string())).unwrap();
        assert_eq!(code, SubjectCode(3));
    }
}
