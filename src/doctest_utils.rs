// Internal utilities for documentation tests and integration tests
// This file contains helpers that synthesize EDF recordings with known content

use crate::{EdfWriter, FileType, Result, SignalParam};
use chrono::{NaiveDate, NaiveDateTime};
use std::path::Path;

/// Description of a synthetic recording
///
/// Every channel gets a deterministic sawtooth of digital values, so tests
/// can compare a rewritten file against [`TestRecording::expected_samples`].
#[derive(Debug, Clone)]
pub struct TestRecording {
    /// Write plain EDF instead of EDF+C
    pub plain_edf: bool,
    pub patient_code: String,
    pub sex: String,
    pub birthdate: String,
    /// EDF+ name subfield, or the whole patient field for plain EDF
    pub patient_name: String,
    pub patient_additional: String,
    pub technician: String,
    pub labels: Vec<String>,
    /// Samples per one-second data record, one entry per label
    pub sample_rates: Vec<i32>,
    pub seconds: usize,
    pub start: NaiveDateTime,
}

impl Default for TestRecording {
    fn default() -> Self {
        TestRecording {
            plain_edf: false,
            patient_code: "MRN-4711".to_string(),
            sex: "F".to_string(),
            birthdate: "01-MAR-1985".to_string(),
            patient_name: "TEST PATIENT".to_string(),
            patient_additional: String::new(),
            technician: "Tech A".to_string(),
            labels: vec!["EEG Fp1".to_string(), "EEG Fp2".to_string()],
            sample_rates: vec![200, 200],
            seconds: 5,
            start: NaiveDate::from_ymd_opt(2021, 3, 5)
                .and_then(|d| d.and_hms_opt(10, 0, 0))
                .unwrap_or_default(),
        }
    }
}

impl TestRecording {
    /// Digital values the fixture writes, one vector per channel
    pub fn expected_samples(&self) -> Vec<Vec<i32>> {
        self.sample_rates
            .iter()
            .enumerate()
            .map(|(ch, &rate)| {
                (0..rate as usize * self.seconds)
                    .map(|i| ((i * 37 + ch * 1009) % 2001) as i32 - 1000)
                    .collect()
            })
            .collect()
    }

    /// Writes the recording and returns the digital samples it contains
    pub fn write<P: AsRef<Path>>(&self, path: P) -> Result<Vec<Vec<i32>>> {
        let mut writer = EdfWriter::create(&path)?;
        if self.plain_edf {
            writer.set_file_type(FileType::Edf)?;
        }
        writer.set_patient_info(&self.patient_code, &self.sex, &self.birthdate, &self.patient_name)?;
        writer.set_patient_additional(&self.patient_additional)?;
        writer.set_recording_info("ADM-1", &self.technician, "Nihon Kohden", "")?;
        writer.set_start_datetime(self.start)?;

        for (label, &rate) in self.labels.iter().zip(&self.sample_rates) {
            writer.add_signal(SignalParam {
                label: label.clone(),
                samples_in_file: 0,
                physical_max: 3276.7,
                physical_min: -3276.8,
                digital_max: 32767,
                digital_min: -32768,
                samples_per_record: rate,
                physical_dimension: "uV".to_string(),
                prefilter: "HP:0.1Hz LP:70Hz".to_string(),
                transducer: "AgAgCl electrode".to_string(),
            })?;
        }

        let samples = self.expected_samples();
        for second in 0..self.seconds {
            let record: Vec<&[i32]> = samples
                .iter()
                .zip(&self.sample_rates)
                .map(|(channel, &rate)| {
                    let rate = rate as usize;
                    &channel[second * rate..(second + 1) * rate]
                })
                .collect();
            writer.write_digital_samples(&record)?;
        }

        writer.finalize()?;
        Ok(samples)
    }
}

/// Creates a one-channel, one-second EDF+ file for documentation examples
pub fn create_simple_test_file<P: AsRef<Path>>(path: P) -> Result<()> {
    TestRecording {
        labels: vec!["EEG Fp1".to_string()],
        sample_rates: vec![256],
        seconds: 1,
        ..TestRecording::default()
    }
    .write(path)?;
    Ok(())
}
