//! BIDS dataset layout: per-recording sidecars and the root-level tables.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{Datelike, NaiveDate, NaiveDateTime};
use log::{debug, info};
use serde_json::{json, Value};

use crate::allocator::SubjectCode;
use crate::clinical::ClinicalRecord;
use crate::config::RunConfig;
use crate::error::BidsError;
use crate::identity::CandidateIdentity;
use crate::types::Sex;

pub const BIDS_VERSION: &str = "1.8.0";
pub const NOT_AVAILABLE: &str = "n/a";

const PARTICIPANTS_TSV: &str = "participants.tsv";
const PARTICIPANT_COLUMNS: [&str; 4] = ["participant_id", "age", "sex", "group"];
const PHENOTYPE_COLUMNS: [&str; 4] = ["participant_id", "test_name", "result", "unit"];
const CHANNEL_COLUMNS: [&str; 6] = ["name", "type", "units", "description", "sampling_frequency", "reference"];

/// One row of `participants.tsv`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipantRow {
    pub participant_id: String,
    pub age: String,
    pub sex: String,
    pub group: String,
}

impl ParticipantRow {
    /// Row for a subject; `clinical` is `None` for unmatched recordings
    pub fn new(code: SubjectCode, clinical: Option<&ClinicalRecord>, identity: &CandidateIdentity) -> Self {
        let birth = clinical.and_then(|r| r.birth_date);
        let sex = match clinical.and_then(|r| r.gender.as_deref()) {
            Some(gender) => Sex::parse(gender)
                .map(|s| s.as_bids().to_string())
                .unwrap_or_else(|| gender.to_lowercase()),
            None => identity
                .sex
                .map(|s| s.as_bids().to_string())
                .unwrap_or_else(|| NOT_AVAILABLE.to_string()),
        };

        ParticipantRow {
            participant_id: code.label(),
            age: compute_age(birth, identity.recorded_at),
            sex,
            group: NOT_AVAILABLE.to_string(),
        }
    }

    fn sort_key(&self) -> (u32, String) {
        let code = SubjectCode::parse(&self.participant_id).map_or(u32::MAX, |c| c.0);
        (code, self.participant_id.clone())
    }
}

/// Whole years between birth and recording, `n/a` when unknown or negative
pub fn compute_age(birth: Option<NaiveDate>, recorded_at: Option<NaiveDateTime>) -> String {
    let (birth, recorded) = match (birth, recorded_at) {
        (Some(b), Some(r)) => (b, r.date()),
        _ => return NOT_AVAILABLE.to_string(),
    };

    let mut age = recorded.year() - birth.year();
    if (recorded.month(), recorded.day()) < (birth.month(), birth.day()) {
        age -= 1;
    }
    if age < 0 {
        NOT_AVAILABLE.to_string()
    } else {
        age.to_string()
    }
}

/// `sub-0001_task-rest` or `sub-0001_task-rest_run-2`
pub fn entity_stem(code: SubjectCode, task: &str, run: Option<u32>) -> String {
    match run {
        Some(run) => format!("{}_task-{}_run-{}", code.label(), task, run),
        None => format!("{}_task-{}", code.label(), task),
    }
}

/// Receives subject-level metadata as the run proceeds
pub trait MetadataSink {
    /// Technical sidecars for one anonymized recording
    fn write_recording(
        &mut self,
        code: SubjectCode,
        run: Option<u32>,
        identity: &CandidateIdentity,
    ) -> Result<(), BidsError>;

    /// Dataset-level files, written once at the end of a run
    fn finish(&mut self, participants: &[ParticipantRow], phenotype: &[(SubjectCode, &ClinicalRecord)]) -> Result<(), BidsError>;
}

/// Writes the BIDS tree under the dataset root
pub struct BidsWriter {
    root: PathBuf,
    task: String,
    power_line_frequency: f64,
    write_scans: bool,
    dataset_name: String,
    authors: Vec<String>,
    /// subject -> (filename relative to the subject dir, acq_time)
    scans: BTreeMap<SubjectCode, Vec<(String, String)>>,
}

impl BidsWriter {
    pub fn new(config: &RunConfig) -> Self {
        BidsWriter {
            root: config.bids_dir.clone(),
            task: config.task.clone(),
            power_line_frequency: config.power_line_frequency,
            write_scans: config.write_scans,
            dataset_name: config.dataset_name.clone(),
            authors: config.authors.clone(),
            scans: BTreeMap::new(),
        }
    }

    pub fn subject_dir(&self, code: SubjectCode) -> PathBuf {
        self.root.join(code.label())
    }

    pub fn eeg_dir(&self, code: SubjectCode) -> PathBuf {
        self.subject_dir(code).join("eeg")
    }

    /// Destination of the anonymized recording
    pub fn recording_path(&self, code: SubjectCode, run: Option<u32>) -> PathBuf {
        self.eeg_dir(code)
            .join(format!("{}_eeg.edf", entity_stem(code, &self.task, run)))
    }

    fn eeg_sidecar(&self, identity: &CandidateIdentity) -> Value {
        if !identity.has_header() {
            return json!({
                "TaskName": self.task,
                "EEGReference": "unknown",
                "SamplingFrequency": NOT_AVAILABLE,
                "PowerLineFrequency": self.power_line_frequency,
                "EEGChannelCount": NOT_AVAILABLE,
                "SoftwareFilters": NOT_AVAILABLE,
                "RecordingDuration": NOT_AVAILABLE,
                "Note": "Recording header could not be read; original bytes retained without anonymization"
            });
        }

        json!({
            "TaskName": self.task,
            "EEGReference": "unknown",
            "SamplingFrequency": identity.sampling_rate,
            "PowerLineFrequency": self.power_line_frequency,
            "EEGChannelCount": identity.channels.len(),
            "SoftwareFilters": NOT_AVAILABLE,
            "RecordingDuration": identity.duration_seconds,
        })
    }

    fn write_scans_tables(&self) -> Result<(), BidsError> {
        for (code, rows) in &self.scans {
            let path = self.subject_dir(*code).join(format!("{}_scans.tsv", code.label()));

            let mut merged: BTreeMap<String, String> = read_tsv(&path)?
                .into_iter()
                .filter_map(|row| Some((row.get("filename")?.clone(), row.get("acq_time").cloned().unwrap_or_default())))
                .collect();
            for (filename, acq_time) in rows {
                merged.insert(filename.clone(), acq_time.clone());
            }

            let rows: Vec<[String; 2]> = merged.into_iter().map(|(f, t)| [f, t]).collect();
            write_tsv(&path, &["filename", "acq_time"], &rows)?;
        }
        Ok(())
    }

    /// Merges with an existing `participants.tsv`; rows from this run win
    fn write_participants(&self, participants: &[ParticipantRow]) -> Result<usize, BidsError> {
        let path = self.root.join(PARTICIPANTS_TSV);

        let mut merged: BTreeMap<String, ParticipantRow> = BTreeMap::new();
        for row in read_tsv(&path)? {
            let field = |name: &str| row.get(name).cloned().unwrap_or_else(|| NOT_AVAILABLE.to_string());
            let id = field("participant_id");
            merged.insert(
                id.clone(),
                ParticipantRow { participant_id: id, age: field("age"), sex: field("sex"), group: field("group") },
            );
        }
        for row in participants {
            merged.insert(row.participant_id.clone(), row.clone());
        }

        let mut rows: Vec<ParticipantRow> = merged.into_values().collect();
        rows.sort_by_key(ParticipantRow::sort_key);

        let table: Vec<[String; 4]> = rows
            .iter()
            .map(|r| [r.participant_id.clone(), r.age.clone(), r.sex.clone(), r.group.clone()])
            .collect();
        write_tsv(&path, &PARTICIPANT_COLUMNS, &table)?;

        write_json(
            &self.root.join("participants.json"),
            &json!({
                "participant_id": {"Description": "Unique participant identifier"},
                "age": {"Description": "Age of the participant in years at the time of recording", "Units": "years"},
                "sex": {
                    "Description": "Sex of the participant",
                    "Levels": {"male": "Male", "female": "Female", "n/a": "Not available"}
                },
                "group": {
                    "Description": "Group affiliation of the participant",
                    "Levels": {"n/a": "Not available"}
                }
            }),
        )?;
        Ok(rows.len())
    }

    fn write_phenotype(&self, phenotype: &[(SubjectCode, &ClinicalRecord)]) -> Result<(), BidsError> {
        let mut subjects: Vec<&(SubjectCode, &ClinicalRecord)> = phenotype.iter().collect();
        subjects.sort_by_key(|(code, _)| *code);

        let rows: Vec<[String; 4]> = subjects
            .iter()
            .flat_map(|(code, record)| {
                record.lab_results.iter().map(move |lab| {
                    [code.label(), lab.test_name.clone(), lab.result.clone(), lab.unit.clone()]
                })
            })
            .collect();

        let dir = self.root.join("phenotype");
        write_tsv(&dir.join("lab_results.tsv"), &PHENOTYPE_COLUMNS, &rows)?;
        write_json(
            &dir.join("lab_results.json"),
            &json!({
                "participant_id": {"Description": "Unique identifier for each participant"},
                "test_name": {"Description": "Name of the lab test"},
                "result": {"Description": "Result of the lab test"},
                "unit": {"Description": "Unit of measurement for the result"}
            }),
        )?;
        info!("Wrote {} lab result rows for {} subjects", rows.len(), subjects.len());
        Ok(())
    }
}

impl MetadataSink for BidsWriter {
    fn write_recording(
        &mut self,
        code: SubjectCode,
        run: Option<u32>,
        identity: &CandidateIdentity,
    ) -> Result<(), BidsError> {
        let dir = self.eeg_dir(code);
        let stem = entity_stem(code, &self.task, run);

        write_json(&dir.join(format!("{}_eeg.json", stem)), &self.eeg_sidecar(identity))?;

        let channels: Vec<[String; 6]> = identity
            .channels
            .iter()
            .map(|c| {
                [
                    c.name.clone(),
                    c.kind.clone(),
                    if c.units.is_empty() { NOT_AVAILABLE.to_string() } else { c.units.clone() },
                    format!("{} channel", c.kind),
                    c.sampling_frequency.to_string(),
                    "unknown".to_string(),
                ]
            })
            .collect();
        write_tsv(&dir.join(format!("{}_channels.tsv", stem)), &CHANNEL_COLUMNS, &channels)?;

        if self.write_scans {
            let filename = format!("eeg/{}_eeg.edf", stem);
            let acq_time = identity
                .recorded_at
                .map(|t| t.format("%Y-%m-%dT%H:%M:%S").to_string())
                .unwrap_or_else(|| NOT_AVAILABLE.to_string());
            self.scans.entry(code).or_default().push((filename, acq_time));
        }

        debug!("Sidecars written for {}", stem);
        Ok(())
    }

    fn finish(&mut self, participants: &[ParticipantRow], phenotype: &[(SubjectCode, &ClinicalRecord)]) -> Result<(), BidsError> {
        fs::create_dir_all(&self.root).map_err(|e| BidsError::io(&self.root, e))?;

        write_json(
            &self.root.join("dataset_description.json"),
            &json!({
                "Name": self.dataset_name,
                "BIDSVersion": BIDS_VERSION,
                "DatasetType": "raw",
                "Authors": self.authors,
            }),
        )?;

        let total = self.write_participants(participants)?;
        self.write_phenotype(phenotype)?;
        self.write_scans_tables()?;

        info!("Dataset root written: {} participants in {}", total, self.root.display());
        Ok(())
    }
}

fn write_json(path: &Path, value: &Value) -> Result<(), BidsError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| BidsError::io(parent, e))?;
    }
    let text = serde_json::to_string_pretty(value)?;
    fs::write(path, text + "\n").map_err(|e| BidsError::io(path, e))
}

fn write_tsv<R: AsRef<[String]>>(path: &Path, headers: &[&str], rows: &[R]) -> Result<(), BidsError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| BidsError::io(parent, e))?;
    }
    let mut writer = csv::WriterBuilder::new().delimiter(b'\t').from_path(path)?;
    writer.write_record(headers)?;
    for row in rows {
        writer.write_record(row.as_ref())?;
    }
    writer.flush().map_err(|e| BidsError::io(path, e))
}

/// Reads a headed TSV into column -> value maps; a missing file is empty
fn read_tsv(path: &Path) -> Result<Vec<BTreeMap<String, String>>, BidsError> {
    if !path.is_file() {
        return Ok(Vec::new());
    }
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .flexible(true)
        .from_path(path)?;
    let headers = reader.headers()?.clone();

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        rows.push(
            headers
                .iter()
                .zip(record.iter())
                .map(|(h, v)| (h.to_string(), v.to_string()))
                .collect(),
        );
    }
    Ok(rows)
}
