use std::fs::File;
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::Path;
use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime, Timelike};

use crate::error::{EdfError, Result};
use crate::reader::ANNOTATION_LABEL;
use crate::types::{FileType, SignalParam};
use crate::utils::{encode_subfield, fit_number, month_abbrev, pad_field, to_ascii};
use crate::EDFLIB_TIME_DIMENSION;

/// TAL (Time-stamped Annotations Lists) bytes per data record in the
/// timekeeping annotation signal
const EDFLIB_ANNOTATION_BYTES: usize = 120;

/// EDF / EDF+C file writer
///
/// The writer is sequential: configure the header, add signals, then write
/// data records one at a time and call [`EdfWriter::finalize`], which patches
/// the record count into the header.
///
/// EDF+C output carries a single timekeeping annotation signal after the
/// ordinary signals. Plain EDF output has no annotation signal and writes
/// the patient name and recording text as free fields.
///
/// # Examples
///
/// ```rust
/// use edfbids::{EdfReader, EdfWriter, SignalParam};
///
/// let mut writer = EdfWriter::create("writer_doc.edf")?;
/// writer.set_patient_info("sub-0001", "", "", "sub-0001")?;
/// writer.add_signal(SignalParam {
///     label: "Fp1".to_string(),
///     samples_in_file: 0,
///     physical_max: 3276.7,
///     physical_min: -3276.8,
///     digital_max: 32767,
///     digital_min: -32768,
///     samples_per_record: 4,
///     physical_dimension: "uV".to_string(),
///     prefilter: String::new(),
///     transducer: String::new(),
/// })?;
///
/// // Two one-second records of raw digital values
/// writer.write_digital_samples(&[vec![1, 2, 3, 4]])?;
/// writer.write_digital_samples(&[vec![-4, -3, -2, -1]])?;
/// writer.finalize()?;
///
/// let mut reader = EdfReader::open("writer_doc.edf")?;
/// assert_eq!(reader.header().datarecords_in_file, 2);
/// assert_eq!(reader.header().patient_name, "sub-0001");
/// assert_eq!(reader.read_digital_samples(0, 8)?, vec![1, 2, 3, 4, -4, -3, -2, -1]);
///
/// # std::fs::remove_file("writer_doc.edf").ok();
/// # Ok::<(), edfbids::EdfError>(())
/// ```
pub struct EdfWriter {
    file: BufWriter<File>,
    file_type: FileType,
    signals: Vec<SignalParam>,
    start_date: NaiveDate,
    start_time: NaiveTime,
    datarecord_duration: i64,
    records_written: i64,
    header_written: bool,

    // 患者信息
    patient_code: String,
    sex: String,
    birthdate: String,
    patient_name: String,
    patient_additional: String,

    // 记录信息
    admin_code: String,
    technician: String,
    equipment: String,
    recording_additional: String,
}

impl EdfWriter {
    /// Creates a new EDF+C file writer
    ///
    /// The file is created (or truncated). Defaults: start 01-JAN-1985
    /// 00:00:00, one-second data records, every identity subfield unknown.
    ///
    /// # Errors
    ///
    /// * `EdfError::FileNotFound` - Cannot create file (permission issues, invalid path, etc.)
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::create(&path)
            .map_err(|e| EdfError::FileNotFound(format!("{}: {}", path.as_ref().display(), e)))?;

        Ok(EdfWriter {
            file: BufWriter::new(file),
            file_type: FileType::EdfPlusC,
            signals: Vec::new(),
            start_date: NaiveDate::from_ymd_opt(1985, 1, 1).unwrap_or_default(),
            start_time: NaiveTime::MIN,
            datarecord_duration: EDFLIB_TIME_DIMENSION, // 1秒
            records_written: 0,
            header_written: false,
            patient_code: String::new(),
            sex: String::new(),
            birthdate: String::new(),
            patient_name: String::new(),
            patient_additional: String::new(),
            admin_code: String::new(),
            technician: String::new(),
            equipment: String::new(),
            recording_additional: String::new(),
        })
    }

    fn ensure_configurable(&self, what: &str) -> Result<()> {
        if self.header_written {
            return Err(EdfError::InvalidFormat(format!("Cannot modify {} after writing header", what)));
        }
        Ok(())
    }

    /// Selects plain EDF or EDF+C output. EDF+D cannot be written.
    pub fn set_file_type(&mut self, file_type: FileType) -> Result<()> {
        self.ensure_configurable("file type")?;
        if file_type == FileType::EdfPlusD {
            return Err(EdfError::UnsupportedFileType("EDF+D output is not supported".to_string()));
        }
        self.file_type = file_type;
        Ok(())
    }

    /// Adds a signal definition
    ///
    /// # Errors
    ///
    /// * `EdfError::InvalidFormat` - Header already written, or digital range outside 16 bits
    /// * `EdfError::PhysicalMinEqualsMax` - Invalid physical range
    /// * `EdfError::DigitalMinEqualsMax` - Invalid digital range
    pub fn add_signal(&mut self, signal: SignalParam) -> Result<()> {
        self.ensure_configurable("signals")?;
        signal.validate()?;

        if signal.digital_min < i16::MIN as i32 || signal.digital_max > i16::MAX as i32 {
            return Err(EdfError::InvalidFormat(format!(
                "Signal '{}' digital range {}..{} exceeds 16 bits",
                signal.label, signal.digital_min, signal.digital_max
            )));
        }
        if self.signals.len() + 2 > crate::EDFLIB_MAXSIGNALS {
            return Err(EdfError::InvalidSignalCount(self.signals.len() as i32 + 1));
        }

        self.signals.push(signal);
        Ok(())
    }

    /// Sets the patient identification subfields
    ///
    /// Empty values are written as `X` (unknown). Spaces and non-ASCII
    /// characters become `_`.
    pub fn set_patient_info(&mut self, code: &str, sex: &str, birthdate: &str, name: &str) -> Result<()> {
        self.ensure_configurable("patient info")?;
        self.patient_code = code.to_string();
        self.sex = sex.to_string();
        self.birthdate = birthdate.to_string();
        self.patient_name = name.to_string();
        Ok(())
    }

    pub fn set_patient_additional(&mut self, additional: &str) -> Result<()> {
        self.ensure_configurable("patient info")?;
        self.patient_additional = additional.to_string();
        Ok(())
    }

    /// Sets the recording identification subfields
    pub fn set_recording_info(
        &mut self,
        admin_code: &str,
        technician: &str,
        equipment: &str,
        additional: &str,
    ) -> Result<()> {
        self.ensure_configurable("recording info")?;
        self.admin_code = admin_code.to_string();
        self.technician = technician.to_string();
        self.equipment = equipment.to_string();
        self.recording_additional = additional.to_string();
        Ok(())
    }

    /// Sets the recording start. EDF stores whole seconds only.
    pub fn set_start_datetime(&mut self, start: NaiveDateTime) -> Result<()> {
        self.ensure_configurable("start time")?;
        if !(1985..=2084).contains(&start.year()) {
            return Err(EdfError::InvalidFormat(format!(
                "Start year {} cannot be represented in an EDF header", start.year()
            )));
        }
        self.start_date = start.date();
        self.start_time = start.time().with_nanosecond(0).unwrap_or(start.time());
        Ok(())
    }

    /// Sets the data record duration in seconds
    ///
    /// # Errors
    ///
    /// * `EdfError::InvalidFormat` - Duration outside (0, 3600] seconds, or header written
    pub fn set_datarecord_duration(&mut self, duration_seconds: f64) -> Result<()> {
        self.ensure_configurable("data record duration")?;

        if duration_seconds <= 0.0 || duration_seconds > 3600.0 {
            return Err(EdfError::InvalidFormat("Data record duration must be between 0 and 3600 seconds".to_string()));
        }

        self.datarecord_duration = (duration_seconds * EDFLIB_TIME_DIMENSION as f64).round() as i64;
        Ok(())
    }

    fn annotation_signal(&self) -> Option<SignalParam> {
        if !self.file_type.is_edfplus() {
            return None;
        }
        Some(SignalParam {
            label: ANNOTATION_LABEL.to_string(),
            samples_in_file: 0,
            physical_max: 1.0,
            physical_min: -1.0,
            digital_max: 32767,
            digital_min: -32768,
            samples_per_record: (EDFLIB_ANNOTATION_BYTES / 2) as i32,
            physical_dimension: String::new(),
            prefilter: String::new(),
            transducer: String::new(),
        })
    }

    fn patient_field(&self) -> Vec<u8> {
        if !self.file_type.is_edfplus() {
            return pad_field(&self.patient_name, 80);
        }
        edfplus_patient_field(
            &self.patient_code,
            &self.sex,
            &self.birthdate,
            &self.patient_name,
            &self.patient_additional,
        )
    }

    fn recording_field(&self) -> Vec<u8> {
        if !self.file_type.is_edfplus() {
            return pad_field(&self.recording_additional, 80);
        }
        edfplus_recording_field(
            self.start_date,
            &self.admin_code,
            &self.technician,
            &self.equipment,
            &self.recording_additional,
        )
    }

    /// 写入头部（记录数先写 -1，在 finalize 时更新）
    fn write_header(&mut self) -> Result<()> {
        if self.header_written {
            return Ok(());
        }
        if self.signals.is_empty() {
            return Err(EdfError::InvalidSignalCount(0));
        }

        let mut all_signals = self.signals.clone();
        all_signals.extend(self.annotation_signal());

        let total_signals = all_signals.len();
        let header_size = (total_signals + 1) * 256;

        let mut main_header = Vec::with_capacity(256);
        main_header.extend(pad_field("0", 8));
        main_header.extend(self.patient_field());
        main_header.extend(self.recording_field());
        main_header.extend(pad_field(
            &format!("{:02}.{:02}.{:02}", self.start_date.day(), self.start_date.month(), self.start_date.year() % 100),
            8,
        ));
        main_header.extend(pad_field(
            &format!("{:02}.{:02}.{:02}", self.start_time.hour(), self.start_time.minute(), self.start_time.second()),
            8,
        ));
        main_header.extend(pad_field(&header_size.to_string(), 8));
        main_header.extend(pad_field(if self.file_type.is_edfplus() { "EDF+C" } else { "" }, 44));
        main_header.extend(pad_field("-1", 8));
        let duration_seconds = self.datarecord_duration as f64 / EDFLIB_TIME_DIMENSION as f64;
        main_header.extend(pad_field(&fit_number(duration_seconds, 8), 8));
        main_header.extend(pad_field(&total_signals.to_string(), 4));
        debug_assert_eq!(main_header.len(), 256);

        self.file.write_all(&main_header)?;
        self.write_signal_headers(&all_signals)?;

        self.header_written = true;
        Ok(())
    }

    /// 按照EDF的字段顺序写入信号头部，每个字段所有信号一起写
    fn write_signal_headers(&mut self, all_signals: &[SignalParam]) -> Result<()> {
        let mut block = Vec::with_capacity(all_signals.len() * 256);

        for signal in all_signals {
            block.extend(pad_field(&signal.label, 16));
        }
        for signal in all_signals {
            block.extend(pad_field(&signal.transducer, 80));
        }
        for signal in all_signals {
            block.extend(pad_field(&signal.physical_dimension, 8));
        }
        for signal in all_signals {
            block.extend(pad_field(&fit_number(signal.physical_min, 8), 8));
        }
        for signal in all_signals {
            block.extend(pad_field(&fit_number(signal.physical_max, 8), 8));
        }
        for signal in all_signals {
            block.extend(pad_field(&signal.digital_min.to_string(), 8));
        }
        for signal in all_signals {
            block.extend(pad_field(&signal.digital_max.to_string(), 8));
        }
        for signal in all_signals {
            block.extend(pad_field(&signal.prefilter, 80));
        }
        for signal in all_signals {
            block.extend(pad_field(&signal.samples_per_record.to_string(), 8));
        }
        for _ in all_signals {
            block.extend(pad_field("", 32));
        }

        self.file.write_all(&block)?;
        Ok(())
    }

    fn check_record_shape(&self, lengths: impl ExactSizeIterator<Item = usize>) -> Result<()> {
        if lengths.len() != self.signals.len() {
            return Err(EdfError::InvalidFormat("Sample count must match signal count".to_string()));
        }
        for (i, len) in lengths.enumerate() {
            let expected = self.signals[i].samples_per_record as usize;
            if len != expected {
                return Err(EdfError::InvalidFormat(format!(
                    "Signal {} expected {} samples per record, got {}", i, expected, len
                )));
            }
        }
        Ok(())
    }

    /// Writes one data record of raw digital values
    ///
    /// One slice per signal, each exactly `samples_per_record` long. Values
    /// are stored as given; they only need to fit in 16 bits.
    pub fn write_digital_samples<S: AsRef<[i32]>>(&mut self, samples: &[S]) -> Result<()> {
        self.check_record_shape(samples.iter().map(|s| s.as_ref().len()))?;

        let mut record = Vec::with_capacity(self.record_bytes());
        for (signal_idx, signal_samples) in samples.iter().enumerate() {
            for &value in signal_samples.as_ref() {
                let stored = i16::try_from(value).map_err(|_| {
                    EdfError::InvalidFormat(format!(
                        "Digital value {} of signal {} does not fit in 16 bits", value, signal_idx
                    ))
                })?;
                record.extend_from_slice(&stored.to_le_bytes());
            }
        }

        self.write_record(&record)
    }

    /// Writes one data record of physical values
    ///
    /// Values are converted with each signal's calibration and clamped to
    /// its digital range.
    pub fn write_samples<S: AsRef<[f64]>>(&mut self, samples: &[S]) -> Result<()> {
        self.check_record_shape(samples.iter().map(|s| s.as_ref().len()))?;

        let digital: Vec<Vec<i32>> = samples
            .iter()
            .zip(&self.signals)
            .map(|(values, signal)| {
                values
                    .as_ref()
                    .iter()
                    .map(|&v| signal.to_digital(v).max(signal.digital_min).min(signal.digital_max))
                    .collect()
            })
            .collect();

        self.write_digital_samples(&digital)
    }

    fn record_bytes(&self) -> usize {
        let signal_bytes: usize = self.signals.iter().map(|s| s.samples_per_record as usize * 2).sum();
        if self.file_type.is_edfplus() {
            signal_bytes + EDFLIB_ANNOTATION_BYTES
        } else {
            signal_bytes
        }
    }

    fn write_record(&mut self, signal_bytes: &[u8]) -> Result<()> {
        self.write_header()?;
        self.file.write_all(signal_bytes)?;

        if self.file_type.is_edfplus() {
            let tal = self.timekeeping_tal(self.records_written);
            self.file.write_all(&tal)?;
        }

        self.records_written += 1;
        Ok(())
    }

    /// 时间戳注释，格式: "+<onset>\x14\x14\x00"，用零填充到120字节
    fn timekeeping_tal(&self, record_index: i64) -> Vec<u8> {
        let onset = record_index as f64 * self.datarecord_duration as f64 / EDFLIB_TIME_DIMENSION as f64;
        let onset_str = if onset.fract() == 0.0 {
            format!("{}", onset as i64)
        } else {
            format!("{:.7}", onset).trim_end_matches('0').trim_end_matches('.').to_string()
        };

        let mut tal = Vec::with_capacity(EDFLIB_ANNOTATION_BYTES);
        tal.push(b'+');
        tal.extend_from_slice(onset_str.as_bytes());
        tal.extend_from_slice(&[0x14, 0x14, 0x00]);
        tal.resize(EDFLIB_ANNOTATION_BYTES, 0x00);
        tal
    }

    /// Number of data records written so far
    pub fn records_written(&self) -> i64 {
        self.records_written
    }

    /// Finalizes the file: writes the header if no record was written,
    /// flushes, and patches the data record count.
    pub fn finalize(mut self) -> Result<()> {
        self.write_header()?;
        self.file.flush()?;

        let mut file = self.file.into_inner().map_err(|e| e.into_error())?;
        file.seek(SeekFrom::Start(236))?;
        file.write_all(&pad_field(&self.records_written.to_string(), 8))?;
        file.flush()?;
        Ok(())
    }
}

/// 80-byte EDF+ patient field: "code sex birthdate name [additional]"
pub(crate) fn edfplus_patient_field(code: &str, sex: &str, birthdate: &str, name: &str, additional: &str) -> Vec<u8> {
    let mut field = format!(
        "{} {} {} {}",
        encode_subfield(code),
        encode_subfield(sex),
        encode_subfield(birthdate),
        encode_subfield(name),
    );
    if !additional.trim().is_empty() {
        field.push(' ');
        field.push_str(&to_ascii(additional.trim()));
    }
    pad_field(&field, 80)
}

/// 80-byte EDF+ recording field: "Startdate dd-MMM-yyyy admin technician equipment [additional]"
pub(crate) fn edfplus_recording_field(
    start_date: NaiveDate,
    admin_code: &str,
    technician: &str,
    equipment: &str,
    additional: &str,
) -> Vec<u8> {
    let mut field = format!(
        "Startdate {:02}-{}-{:04} {} {} {}",
        start_date.day(),
        month_abbrev(start_date.month()),
        start_date.year(),
        encode_subfield(admin_code),
        encode_subfield(technician),
        encode_subfield(equipment),
    );
    if !additional.trim().is_empty() {
        field.push(' ');
        field.push_str(&to_ascii(additional.trim()));
    }
    pad_field(&field, 80)
}
