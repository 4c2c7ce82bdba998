//! Candidate identity extraction from an EDF header.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use chrono::NaiveDateTime;
use log::debug;
use regex::Regex;

use crate::error::Result;
use crate::normalize::normalize_name;
use crate::reader::EdfReader;
use crate::types::{EdfHeader, FileType, Sex};

/// Header field the raw identity string was taken from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentitySource {
    /// EDF+ patient name subfield, or the whole plain-EDF patient field
    LastName,
    /// EDF+ "additional" patient subfield
    FirstName,
    /// EDF+ patient code (hospital ID)
    PatientCode,
    FileStem,
}

impl fmt::Display for IdentitySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IdentitySource::LastName => "last_name",
            IdentitySource::FirstName => "first_name",
            IdentitySource::PatientCode => "patient_code",
            IdentitySource::FileStem => "file_stem",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelInfo {
    pub name: String,
    /// BIDS channel type; every signal is treated as `EEG`
    pub kind: String,
    pub units: String,
    pub sampling_frequency: f64,
}

/// Identity and technical metadata derived once per recording
#[derive(Debug, Clone)]
pub struct CandidateIdentity {
    pub source_path: PathBuf,
    /// Identity string as found, kept for the audit trail
    pub raw: String,
    pub source: IdentitySource,
    /// Normalized name; `None` when nothing usable was found
    pub name: Option<String>,
    /// Trailing 2-4 digits, a possible birth-year fragment
    pub birth_year_suffix: Option<String>,
    pub sex: Option<Sex>,
    /// Highest channel sampling rate in Hz
    pub sampling_rate: Option<f64>,
    pub channels: Vec<ChannelInfo>,
    pub recorded_at: Option<NaiveDateTime>,
    pub duration_seconds: Option<f64>,
    pub file_type: Option<FileType>,
}

impl CandidateIdentity {
    /// Placeholder identity for a recording whose header could not be read.
    /// Only the file name is known; no name or suffix is derived.
    pub fn unreadable(path: &Path) -> Self {
        CandidateIdentity {
            source_path: path.to_path_buf(),
            raw: file_stem(path),
            source: IdentitySource::FileStem,
            name: None,
            birth_year_suffix: None,
            sex: None,
            sampling_rate: None,
            channels: Vec::new(),
            recorded_at: None,
            duration_seconds: None,
            file_type: None,
        }
    }

    /// Whether the header was readable
    pub fn has_header(&self) -> bool {
        self.file_type.is_some()
    }

    /// Replaces channel names with the labels of the written recording
    pub fn rename_channels(&mut self, labels: &[String]) {
        for (channel, label) in self.channels.iter_mut().zip(labels) {
            channel.name = label.clone();
        }
    }
}

fn identity_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(.*?)_?(\d+)?$").expect("identity pattern is valid"))
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Splits `<name>[_]<digits>` into a display name and an optional
/// birth-year suffix. Digits only count as a suffix when there are 2 to 4.
pub fn split_identity(raw: &str) -> (String, Option<String>) {
    let raw = raw.trim();
    let fallback = || (raw.replace('_', " ").trim().to_string(), None);

    let caps = match identity_regex().captures(raw) {
        Some(caps) => caps,
        None => return fallback(),
    };

    match caps.get(2).map(|m| m.as_str()) {
        Some(digits) if (2..=4).contains(&digits.len()) => {
            let name = caps.get(1).map_or("", |m| m.as_str());
            (name.replace('_', " ").trim().to_string(), Some(digits.to_string()))
        }
        _ => fallback(),
    }
}

/// Reads the header of `path` and derives its candidate identity
///
/// # Errors
///
/// Any [`crate::EdfError`] from opening the container; callers treat this as
/// a parse failure and fall back to [`CandidateIdentity::unreadable`].
pub fn extract(path: &Path) -> Result<CandidateIdentity> {
    let reader = EdfReader::open(path)?;
    Ok(from_header(path, reader.header()))
}

/// Derives the candidate identity from an already parsed header
pub fn from_header(path: &Path, header: &EdfHeader) -> CandidateIdentity {
    let candidates = [
        (header.patient_name.trim(), IdentitySource::LastName),
        (header.patient_additional.trim(), IdentitySource::FirstName),
        (header.patient_code.trim(), IdentitySource::PatientCode),
    ];

    let stem = file_stem(path);
    let (raw, source) = candidates
        .into_iter()
        .find(|(value, _)| !value.is_empty())
        .map(|(value, source)| (value.to_string(), source))
        .unwrap_or((stem, IdentitySource::FileStem));

    let (name_part, birth_year_suffix) = split_identity(&raw);
    let name = Some(normalize_name(&name_part)).filter(|n| !n.is_empty());

    let channels: Vec<ChannelInfo> = header
        .signals
        .iter()
        .map(|s| ChannelInfo {
            name: s.label.clone(),
            kind: "EEG".to_string(),
            units: s.physical_dimension.clone(),
            sampling_frequency: s.sample_rate(header.datarecord_duration),
        })
        .collect();

    let sampling_rate = Some(header.max_sample_rate()).filter(|r| *r > 0.0);

    debug!(
        "{}: identity {:?} from {} -> name {:?}, suffix {:?}",
        path.display(), raw, source, name, birth_year_suffix
    );

    CandidateIdentity {
        source_path: path.to_path_buf(),
        raw,
        source,
        name,
        birth_year_suffix,
        sex: Sex::parse(&header.sex),
        sampling_rate,
        channels,
        recorded_at: Some(header.start_datetime()),
        duration_seconds: Some(header.duration_seconds()),
        file_type: Some(header.file_type),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doctest_utils::TestRecording;

    #[test]
    fn test_split_identity() {
        assert_eq!(split_identity("TRAN_THI_B_85"), ("TRAN THI B".to_string(), Some("85".to_string())));
        assert_eq!(split_identity("TRAN_THI_B1985"), ("TRAN THI B".to_string(), Some("1985".to_string())));
        assert_eq!(split_identity("TRAN THI B"), ("TRAN THI B".to_string(), None));
        assert_eq!(split_identity("TRAN THI B 85"), ("TRAN THI B".to_string(), Some("85".to_string())));
        // one digit or more than four is not a birth year
        assert_eq!(split_identity("BED_7"), ("BED 7".to_string(), None));
        assert_eq!(split_identity("20210305"), ("20210305".to_string(), None));
        assert_eq!(split_identity(""), (String::new(), None));
    }

    #[test]
    fn test_short_or_long_digit_groups_stay_in_name() {
        assert_eq!(split_identity("NAME_5"), ("NAME 5".to_string(), None));
        assert_eq!(split_identity("NAME5"), ("NAME5".to_string(), None));
        assert_eq!(split_identity("NAME_12345"), ("NAME 12345".to_string(), None));
    }

    #[test]
    fn test_extract_prefers_name_subfield() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rec.edf");
        TestRecording {
            patient_name: "Trần Thị B 85".to_string(),
            ..TestRecording::default()
        }
        .write(&path)
        .unwrap();

        let identity = extract(&path).unwrap();
        assert_eq!(identity.source, IdentitySource::LastName);
        assert_eq!(identity.raw, "Tr_n_Th__B_85");
        assert_eq!(identity.birth_year_suffix.as_deref(), Some("85"));
        assert_eq!(identity.sex, Some(Sex::Female));
        assert_eq!(identity.sampling_rate, Some(200.0));
        assert_eq!(identity.channels.len(), 2);
        assert_eq!(identity.channels[0].kind, "EEG");
        assert_eq!(identity.duration_seconds, Some(5.0));
    }

    #[test]
    fn test_falls_back_through_fields_to_file_stem() {
        let dir = tempfile::tempdir().unwrap();

        let path = dir.path().join("code.edf");
        TestRecording { patient_name: String::new(), ..TestRecording::default() }
            .write(&path)
            .unwrap();
        let identity = extract(&path).unwrap();
        assert_eq!(identity.source, IdentitySource::PatientCode);
        assert_eq!(identity.raw, "MRN-4711");

        let path = dir.path().join("LE_VAN_C_1990.edf");
        TestRecording {
            patient_name: String::new(),
            patient_code: String::new(),
            ..TestRecording::default()
        }
        .write(&path)
        .unwrap();
        let identity = extract(&path).unwrap();
        assert_eq!(identity.source, IdentitySource::FileStem);
        assert_eq!(identity.name.as_deref(), Some("LE VAN C"));
        assert_eq!(identity.birth_year_suffix.as_deref(), Some("1990"));
    }

    #[test]
    fn test_unreadable_has_no_name() {
        let identity = CandidateIdentity::unreadable(Path::new("/data/broken_85.edf"));
        assert_eq!(identity.raw, "broken_85");
        assert!(identity.name.is_none());
        assert!(identity.birth_year_suffix.is_none());
        assert!(!identity.has_header());
    }
}
