//! EDF anonymization with an ordered fallback chain.
//!
//! Each [`AnonymizeStrategy`] writes an anonymized copy of the source and
//! verifies it. [`Anonymizer`] tries the strategies in order, stops at the
//! first success and, when all of them fail, copies the source bytes
//! verbatim and flags the outcome as not anonymized.

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use thiserror::Error;

use crate::config::RunConfig;
use crate::error::EdfError;
use crate::reader::EdfReader;
use crate::types::{EdfHeader, FileType, SignalParam};
use crate::utils::pad_field;
use crate::writer::{edfplus_patient_field, edfplus_recording_field, EdfWriter};
use crate::EDFLIB_TIME_DIMENSION;

/// Suffix of the sibling temp file every strategy writes into
pub const TMP_SUFFIX: &str = ".tmp";

/// Longest channel label an EDF header can hold
pub const MAX_LABEL_LEN: usize = 16;

/// Why one strategy did not produce a verified anonymized file
#[derive(Debug, Error)]
pub enum AnonymizeFailure {
    #[error("cannot read source: {0}")]
    Read(#[source] EdfError),

    #[error("cannot write output: {0}")]
    Write(#[source] EdfError),

    #[error("unsupported input: {0}")]
    Unsupported(String),

    #[error("integrity mismatch: {0}")]
    Integrity(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// A verified anonymized output
#[derive(Debug, Clone)]
pub struct AnonymizedRecording {
    pub path: PathBuf,
    pub strategy: &'static str,
    /// Channel labels as written
    pub labels: Vec<String>,
    /// Samples per channel, equal to the source's
    pub samples_per_channel: Vec<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnonymizeStatus {
    Anonymized,
    /// Every strategy failed; the destination holds the original bytes
    CopiedUnanonymized,
    /// Not even the raw copy could be written
    Failed,
}

impl fmt::Display for AnonymizeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AnonymizeStatus::Anonymized => "anonymized",
            AnonymizeStatus::CopiedUnanonymized => "copied_unanonymized",
            AnonymizeStatus::Failed => "failed",
        })
    }
}

/// Result of running the whole chain for one recording
#[derive(Debug)]
pub struct AnonymizeOutcome {
    pub status: AnonymizeStatus,
    /// Name of the strategy that produced the destination, `raw-copy` for the
    /// final fallback
    pub strategy: Option<&'static str>,
    pub recording: Option<AnonymizedRecording>,
    pub failures: Vec<(&'static str, AnonymizeFailure)>,
}

impl AnonymizeOutcome {
    /// One-line summary of every failed attempt, for the audit table
    pub fn detail(&self) -> String {
        self.failures
            .iter()
            .map(|(name, failure)| format!("{}: {}", name, failure))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// One way of producing an anonymized copy
pub trait AnonymizeStrategy {
    fn name(&self) -> &'static str;

    /// Writes the anonymized copy of `src` to `dst` with name and patient
    /// code set to `subject`, then verifies it.
    fn apply(&self, src: &Path, dst: &Path, subject: &str) -> Result<AnonymizedRecording, AnonymizeFailure>;
}

/// Makes a channel label EDF friendly: `[A-Za-z0-9_.-]` only, at most 16
/// characters, `Channel_<index>` when nothing is left.
pub fn sanitize_label(label: &str, index: usize) -> String {
    let cleaned: String = label
        .trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.') { c } else { '_' })
        .take(MAX_LABEL_LEN)
        .collect();

    if cleaned.is_empty() {
        format!("Channel_{}", index)
    } else {
        cleaned
    }
}

/// Repairs calibration fields a writer would refuse
///
/// A degenerate digital range becomes the observed sample range (widened by
/// one when the channel is flat); a degenerate physical range takes the
/// digital range values.
pub fn backfill_ranges(signal: &mut SignalParam, samples: &[i32]) {
    if signal.digital_min >= signal.digital_max {
        let lo = samples.iter().copied().min().unwrap_or(i16::MIN as i32);
        let hi = samples.iter().copied().max().unwrap_or(i16::MAX as i32);
        let (lo, hi) = if lo < hi {
            (lo, hi)
        } else if hi < i16::MAX as i32 {
            (lo, hi + 1)
        } else {
            (lo - 1, hi)
        };
        debug!("{}: digital range backfilled to {}..{}", signal.label, lo, hi);
        signal.digital_min = lo;
        signal.digital_max = hi;
    }

    if signal.physical_min == signal.physical_max {
        debug!("{}: physical range backfilled from digital range", signal.label);
        signal.physical_min = signal.digital_min as f64;
        signal.physical_max = signal.digital_max as f64;
    }
}

/// Reopens `output` and compares it with the source header
fn verify_output(source: &EdfHeader, output: &Path, subject: &str) -> Result<EdfHeader, AnonymizeFailure> {
    let reader = EdfReader::open(output)
        .map_err(|e| AnonymizeFailure::Integrity(format!("output does not reopen: {}", e)))?;
    let written = reader.header();

    if written.signals.len() != source.signals.len() {
        return Err(AnonymizeFailure::Integrity(format!(
            "{} channels written, source has {}",
            written.signals.len(),
            source.signals.len()
        )));
    }
    if written.shape() != source.shape() {
        return Err(AnonymizeFailure::Integrity(format!(
            "sample counts {:?} differ from source {:?}",
            written.shape(),
            source.shape()
        )));
    }
    if written.patient_name != subject {
        return Err(AnonymizeFailure::Integrity(format!(
            "patient name reads back as {:?}",
            written.patient_name
        )));
    }
    if written.file_type.is_edfplus() {
        let leftovers = [
            &written.birthdate,
            &written.sex,
            &written.patient_additional,
            &written.admin_code,
            &written.technician,
            &written.equipment,
            &written.recording_additional,
        ];
        if written.patient_code != subject || leftovers.iter().any(|f| !f.is_empty()) {
            return Err(AnonymizeFailure::Integrity("identity fields not cleared".to_string()));
        }
    }

    Ok(written.clone())
}

/// Primary strategy: decode every record and write a fresh file
///
/// Digital values and calibration are copied unchanged, so physical values
/// are identical. Each output record holds each channel's own
/// samples-per-record, which keeps multi-rate recordings aligned. EDF+
/// sources are written as EDF+C with a fresh timekeeping signal (source
/// annotation text is not carried over); plain EDF stays plain EDF.
pub struct ChunkedRewrite {
    pub sanitize_labels: bool,
}

impl AnonymizeStrategy for ChunkedRewrite {
    fn name(&self) -> &'static str {
        "chunked-rewrite"
    }

    fn apply(&self, src: &Path, dst: &Path, subject: &str) -> Result<AnonymizedRecording, AnonymizeFailure> {
        let mut reader = EdfReader::open(src).map_err(AnonymizeFailure::Read)?;
        let source = reader.header().clone();

        if source.file_type == FileType::EdfPlusD {
            return Err(AnonymizeFailure::Unsupported(
                "discontinuous EDF+D cannot be rewritten record by record".to_string(),
            ));
        }
        if source.datarecord_duration <= 0 {
            return Err(AnonymizeFailure::Unsupported("data record duration is zero".to_string()));
        }

        let samples = reader.read_all_digital_samples().map_err(AnonymizeFailure::Read)?;
        drop(reader);

        let mut signals = source.signals.clone();
        if self.sanitize_labels {
            for (i, (signal, channel)) in signals.iter_mut().zip(&samples).enumerate() {
                signal.label = sanitize_label(&signal.label, i);
                backfill_ranges(signal, channel);
            }
        }

        let write = |e: EdfError| AnonymizeFailure::Write(e);
        let mut writer = EdfWriter::create(dst).map_err(write)?;
        writer
            .set_file_type(if source.file_type.is_edfplus() { FileType::EdfPlusC } else { FileType::Edf })
            .map_err(write)?;
        writer.set_patient_info(subject, "", "", subject).map_err(write)?;
        writer.set_recording_info("", "", "", "").map_err(write)?;
        writer.set_start_datetime(source.start_datetime()).map_err(write)?;
        writer
            .set_datarecord_duration(source.datarecord_duration as f64 / EDFLIB_TIME_DIMENSION as f64)
            .map_err(write)?;
        for signal in &signals {
            writer.add_signal(signal.clone()).map_err(write)?;
        }

        for record in 0..source.datarecords_in_file as usize {
            let chunk: Vec<&[i32]> = signals
                .iter()
                .zip(&samples)
                .map(|(signal, channel)| {
                    let n = signal.samples_per_record as usize;
                    &channel[record * n..(record + 1) * n]
                })
                .collect();
            writer.write_digital_samples(&chunk).map_err(write)?;
        }
        writer.finalize().map_err(write)?;

        let written = verify_output(&source, dst, subject)?;

        // 逐通道比较数字值
        let mut check = EdfReader::open(dst).map_err(AnonymizeFailure::Read)?;
        if check.read_all_digital_samples().map_err(AnonymizeFailure::Read)? != samples {
            return Err(AnonymizeFailure::Integrity("sample values changed".to_string()));
        }

        Ok(AnonymizedRecording {
            path: dst.to_path_buf(),
            strategy: self.name(),
            labels: written.signals.iter().map(|s| s.label.clone()).collect(),
            samples_per_channel: written.shape(),
        })
    }
}

/// Alternate strategy: copy the bytes and overwrite the patient and
/// recording header fields in place
///
/// Data records (annotation text included) stay untouched, so EDF+D and
/// files with unusual calibration survive.
pub struct HeaderPatch;

impl AnonymizeStrategy for HeaderPatch {
    fn name(&self) -> &'static str {
        "header-patch"
    }

    fn apply(&self, src: &Path, dst: &Path, subject: &str) -> Result<AnonymizedRecording, AnonymizeFailure> {
        let source = EdfReader::open(src).map_err(AnonymizeFailure::Read)?.header().clone();

        let (patient, recording) = if source.file_type.is_edfplus() {
            (
                edfplus_patient_field(subject, "", "", subject, ""),
                edfplus_recording_field(source.start_date, "", "", "", ""),
            )
        } else {
            (pad_field(subject, 80), pad_field("", 80))
        };

        fs::copy(src, dst)?;
        let mut file = OpenOptions::new().write(true).open(dst)?;
        file.seek(SeekFrom::Start(8))?;
        file.write_all(&patient)?;
        file.write_all(&recording)?;
        file.sync_all()?;
        drop(file);

        let written = verify_output(&source, dst, subject)?;

        Ok(AnonymizedRecording {
            path: dst.to_path_buf(),
            strategy: self.name(),
            labels: written.signals.iter().map(|s| s.label.clone()).collect(),
            samples_per_channel: written.shape(),
        })
    }
}

/// Runs the strategy chain for one recording at a time
pub struct Anonymizer {
    strategies: Vec<Box<dyn AnonymizeStrategy>>,
}

impl Anonymizer {
    /// The standard chain: chunked rewrite, then header patch
    pub fn new(config: &RunConfig) -> Self {
        Anonymizer::with_strategies(vec![
            Box::new(ChunkedRewrite { sanitize_labels: config.sanitize_labels }),
            Box::new(HeaderPatch),
        ])
    }

    pub fn with_strategies(strategies: Vec<Box<dyn AnonymizeStrategy>>) -> Self {
        Anonymizer { strategies }
    }

    /// Produces `dst` from `src`
    ///
    /// Every attempt writes `<dst>.tmp`, which is renamed over `dst` on
    /// success and removed on failure. Never returns an error: the outcome
    /// records what happened.
    pub fn anonymize(&self, src: &Path, dst: &Path, subject: &str) -> AnonymizeOutcome {
        let tmp = tmp_path(dst);
        let mut failures = Vec::new();

        for strategy in &self.strategies {
            remove_if_exists(&tmp);

            let attempt = strategy
                .apply(src, &tmp, subject)
                .and_then(|recording| fs::rename(&tmp, dst).map(|_| recording).map_err(AnonymizeFailure::from));

            match attempt {
                Ok(mut recording) => {
                    recording.path = dst.to_path_buf();
                    info!("{} -> {} ({})", src.display(), dst.display(), strategy.name());
                    return AnonymizeOutcome {
                        status: AnonymizeStatus::Anonymized,
                        strategy: Some(strategy.name()),
                        recording: Some(recording),
                        failures,
                    };
                }
                Err(failure) => {
                    warn!("{}: {} failed: {}", src.display(), strategy.name(), failure);
                    remove_if_exists(&tmp);
                    failures.push((strategy.name(), failure));
                }
            }
        }

        // 所有策略失败：原样复制并标记
        remove_if_exists(&tmp);
        let copied = fs::copy(src, &tmp).and_then(|_| fs::rename(&tmp, dst));
        match copied {
            Ok(()) => {
                warn!(
                    "{}: all anonymization strategies failed, original bytes copied to {}",
                    src.display(),
                    dst.display()
                );
                AnonymizeOutcome {
                    status: AnonymizeStatus::CopiedUnanonymized,
                    strategy: Some("raw-copy"),
                    recording: None,
                    failures,
                }
            }
            Err(e) => {
                remove_if_exists(&tmp);
                warn!("{}: raw copy failed: {}", src.display(), e);
                failures.push(("raw-copy", AnonymizeFailure::Io(e)));
                AnonymizeOutcome {
                    status: AnonymizeStatus::Failed,
                    strategy: None,
                    recording: None,
                    failures,
                }
            }
        }
    }
}

/// `<dst>.tmp`, next to the destination
pub fn tmp_path(dst: &Path) -> PathBuf {
    let mut name = dst.as_os_str().to_owned();
    name.push(TMP_SUFFIX);
    PathBuf::from(name)
}

fn remove_if_exists(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!("Cannot remove {}: {}", path.display(), e);
        }
    }
}
