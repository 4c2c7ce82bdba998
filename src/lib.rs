//! # edfbids
//!
//! Converts a clinic's EDF/EDF+ recordings and a lab-result spreadsheet into
//! an anonymized BIDS dataset.
//!
//! Every recording goes through the same sequence: its header yields a
//! candidate identity, the identity is matched against the clinical sheet,
//! the match (or the recording itself) gets a stable anonymous subject code,
//! and the file is rewritten with the subject code in place of every
//! identifying header field while the samples are copied unchanged.
//!
//! ## Quick Start
//!
//! ### Running a conversion
//!
//! ```rust
//! use edfbids::{pipeline, RunConfig};
//! # use edfbids::doctest_utils::create_simple_test_file;
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! # let tmp = tempfile::tempdir()?;
//! # let input = tmp.path().join("raw");
//! # std::fs::create_dir_all(&input)?;
//! # create_simple_test_file(input.join("rec.edf"))?;
//!
//! let config = RunConfig {
//!     input_dir: input.clone(),
//!     bids_dir: tmp.path().join("bids"),
//!     ..RunConfig::default()
//! };
//!
//! let summary = pipeline::run(&config)?;
//! assert_eq!(summary.processed, 1);
//! assert!(config.bids_dir.join("participants.tsv").is_file());
//! # Ok(())
//! # }
//! ```
//!
//! ### Reading an EDF+ header
//!
//! ```rust
//! use edfbids::{EdfReader, Result};
//! # use edfbids::doctest_utils::create_simple_test_file;
//!
//! fn main() -> Result<()> {
//!     # let tmp = tempfile::tempdir()?;
//!     # let path = tmp.path().join("test_data.edf");
//!     # create_simple_test_file(&path)?;
//!     let mut reader = EdfReader::open(&path)?;
//!
//!     let header = reader.header();
//!     println!("Patient: {}", header.patient_name);
//!     println!("Signals: {}", header.signals.len());
//!     println!("Duration: {:.2} s", header.duration_seconds());
//!
//!     let samples = reader.read_physical_samples(0, 256)?;
//!     assert_eq!(samples.len(), 256);
//!     Ok(())
//! }
//! ```
//!
//! ### Anonymizing a single recording
//!
//! ```rust
//! use edfbids::anonymize::{AnonymizeStatus, Anonymizer};
//! use edfbids::{EdfReader, RunConfig};
//! # use edfbids::doctest_utils::create_simple_test_file;
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! # let tmp = tempfile::tempdir()?;
//! # let src = tmp.path().join("src.edf");
//! # let dst = tmp.path().join("sub-0001_task-rest_eeg.edf");
//! # create_simple_test_file(&src)?;
//!
//! let anonymizer = Anonymizer::new(&RunConfig::default());
//! let outcome = anonymizer.anonymize(&src, &dst, "sub-0001");
//! assert_eq!(outcome.status, AnonymizeStatus::Anonymized);
//!
//! let header = EdfReader::open(&dst)?.header().clone();
//! assert_eq!(header.patient_name, "sub-0001");
//! assert!(header.birthdate.is_empty());
//! # Ok(())
//! # }
//! ```
//!
//! ## Physical vs Digital Values
//!
//! EDF stores 16-bit integers together with a linear calibration. The
//! anonymizer copies digital values and calibration verbatim, so physical
//! values are identical before and after:
//!
//! ```rust
//! use edfbids::SignalParam;
//!
//! let signal = SignalParam {
//!     label: "EEG Fp1".to_string(),
//!     samples_in_file: 1000,
//!     physical_max: 100.0,
//!     physical_min: -100.0,
//!     digital_max: 32767,
//!     digital_min: -32768,
//!     samples_per_record: 256,
//!     physical_dimension: "uV".to_string(),
//!     prefilter: "".to_string(),
//!     transducer: "".to_string(),
//! };
//!
//! let physical_value = signal.to_physical(16384);
//! assert!((physical_value - 50.0).abs() < 0.1);
//! assert!((signal.to_digital(25.0) - 8192).abs() <= 1);
//! ```

pub mod error;
pub mod types;
pub mod utils;
pub mod reader;
pub mod writer;

pub mod normalize;
pub mod identity;
pub mod clinical;
pub mod matcher;
pub mod allocator;
pub mod anonymize;
pub mod bids;
pub mod audit;
pub mod config;
pub mod pipeline;

#[doc(hidden)]
pub mod doctest_utils; // For internal doctest support

// Re-export main types for convenience
pub use error::{BidsError, EdfError, Result};
pub use types::{EdfHeader, FileType, Sex, SignalParam};
pub use reader::EdfReader;
pub use writer::EdfWriter;
pub use config::RunConfig;
pub use allocator::{SubjectAllocator, SubjectCode, SubjectKey};
pub use anonymize::{AnonymizeOutcome, AnonymizeStatus, Anonymizer};
pub use pipeline::RunSummary;

// Important constants
pub const EDFLIB_TIME_DIMENSION: i64 = 10_000_000; // 100 nanoseconds unit
pub const EDFLIB_MAXSIGNALS: usize = 4096;

/// Library version
///
/// ```rust
/// let version = edfbids::version();
/// assert!(version.contains('.'));
/// ```
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!version().is_empty());
    }
}
