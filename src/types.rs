use chrono::{NaiveDate, NaiveDateTime, NaiveTime};

use crate::error::{EdfError, Result};
use crate::EDFLIB_TIME_DIMENSION;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    /// 原始EDF，患者字段为自由文本
    Edf,
    /// EDF+ 连续记录
    EdfPlusC,
    /// EDF+ 非连续记录
    EdfPlusD,
}

impl FileType {
    pub fn is_edfplus(&self) -> bool {
        !matches!(self, FileType::Edf)
    }
}

#[derive(Debug, Clone)]
pub struct SignalParam {
    pub label: String,
    pub samples_in_file: i64,
    pub physical_max: f64,
    pub physical_min: f64,
    pub digital_max: i32,
    pub digital_min: i32,
    pub samples_per_record: i32,
    pub physical_dimension: String,
    pub prefilter: String,
    pub transducer: String,
}

impl SignalParam {
    /// 计算物理值转换参数
    pub fn bit_value(&self) -> f64 {
        (self.physical_max - self.physical_min) /
        (self.digital_max - self.digital_min) as f64
    }

    /// 计算偏移量
    pub fn offset(&self) -> f64 {
        self.physical_max / self.bit_value() - self.digital_max as f64
    }

    /// 将数字值转换为物理值
    pub fn to_physical(&self, digital_value: i32) -> f64 {
        self.bit_value() * (self.offset() + digital_value as f64)
    }

    /// 将物理值转换为数字值
    pub fn to_digital(&self, physical_value: f64) -> i32 {
        let digital = (physical_value / self.bit_value()) - self.offset();
        digital.round() as i32
    }

    /// Sampling frequency in Hz for the given data record duration
    /// (in 100 ns units).
    pub fn sample_rate(&self, datarecord_duration: i64) -> f64 {
        if datarecord_duration <= 0 {
            return 0.0;
        }
        self.samples_per_record as f64 * EDFLIB_TIME_DIMENSION as f64 / datarecord_duration as f64
    }

    /// Checks the calibration fields a writer needs.
    ///
    /// Readers accept degenerate headers so that damaged recordings can still
    /// be inspected; writers refuse them.
    pub fn validate(&self) -> Result<()> {
        if self.physical_min == self.physical_max {
            return Err(EdfError::PhysicalMinEqualsMax);
        }
        if self.digital_min >= self.digital_max {
            return Err(EdfError::DigitalMinEqualsMax);
        }
        if self.samples_per_record < 1 {
            return Err(EdfError::InvalidFormat(format!(
                "Signal '{}' has {} samples per record",
                self.label, self.samples_per_record
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sex {
    Male,
    Female,
}

impl Sex {
    /// Parses the EDF+ sex subfield (`M`/`F`).
    pub fn parse(s: &str) -> Option<Sex> {
        match s.trim().to_ascii_lowercase().as_str() {
            "m" | "male" => Some(Sex::Male),
            "f" | "female" => Some(Sex::Female),
            _ => None,
        }
    }

    pub fn as_bids(&self) -> &'static str {
        match self {
            Sex::Male => "male",
            Sex::Female => "female",
        }
    }
}

#[derive(Debug, Clone)]
pub struct EdfHeader {
    pub file_type: FileType,
    pub signals: Vec<SignalParam>,
    pub file_duration: i64,           // 文件持续时间（100纳秒为单位）
    pub start_date: NaiveDate,
    pub start_time: NaiveTime,
    pub datarecords_in_file: i64,
    pub datarecord_duration: i64,     // 数据记录持续时间（100纳秒为单位）

    // 患者字段（EDF+子字段，原始EDF时 patient_name 为整个字段）
    pub patient_code: String,
    pub sex: String,
    pub birthdate: String,
    pub patient_name: String,
    pub patient_additional: String,

    // 记录字段
    pub admin_code: String,
    pub technician: String,
    pub equipment: String,
    pub recording_additional: String,
}

impl EdfHeader {
    pub fn start_datetime(&self) -> NaiveDateTime {
        self.start_date.and_time(self.start_time)
    }

    /// Recording length in seconds.
    pub fn duration_seconds(&self) -> f64 {
        self.file_duration as f64 / EDFLIB_TIME_DIMENSION as f64
    }

    /// Highest per-channel sampling frequency, in Hz.
    pub fn max_sample_rate(&self) -> f64 {
        self.signals
            .iter()
            .map(|s| s.sample_rate(self.datarecord_duration))
            .fold(0.0, f64::max)
    }

    /// Per-channel sample counts, used to compare a rewritten file with its source.
    pub fn shape(&self) -> Vec<i64> {
        self.signals.iter().map(|s| s.samples_in_file).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signal() -> SignalParam {
        SignalParam {
            label: "EEG Fp1".to_string(),
            samples_in_file: 1000,
            physical_max: 100.0,
            physical_min: -100.0,
            digital_max: 32767,
            digital_min: -32768,
            samples_per_record: 200,
            physical_dimension: "uV".to_string(),
            prefilter: String::new(),
            transducer: String::new(),
        }
    }

    #[test]
    fn test_digital_physical_conversion() {
        let s = signal();
        let physical = s.to_physical(16384);
        assert!((physical - 50.0).abs() < 0.1);
        assert_eq!(s.to_digital(s.to_physical(1234)), 1234);
    }

    #[test]
    fn test_sample_rate_follows_record_duration() {
        let s = signal();
        assert_eq!(s.sample_rate(EDFLIB_TIME_DIMENSION), 200.0);
        assert_eq!(s.sample_rate(EDFLIB_TIME_DIMENSION / 2), 400.0);
        assert_eq!(s.sample_rate(0), 0.0);
    }

    #[test]
    fn test_validate_rejects_degenerate_calibration() {
        let mut s = signal();
        assert!(s.validate().is_ok());
        s.physical_max = s.physical_min;
        assert!(matches!(s.validate(), Err(EdfError::PhysicalMinEqualsMax)));

        let mut s = signal();
        s.digital_min = s.digital_max;
        assert!(matches!(s.validate(), Err(EdfError::DigitalMinEqualsMax)));
    }

    #[test]
    fn test_sex_parsing() {
        assert_eq!(Sex::parse("F"), Some(Sex::Female));
        assert_eq!(Sex::parse(" Male "), Some(Sex::Male));
        assert_eq!(Sex::parse("X"), None);
        assert_eq!(Sex::Female.as_bids(), "female");
    }
}
