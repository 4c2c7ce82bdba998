use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;
use chrono::{NaiveDate, NaiveTime};

use crate::types::{EdfHeader, FileType, SignalParam};
use crate::error::{EdfError, Result};
use crate::utils::{atoi_nonlocalized, atof_nonlocalized, decode_subfield, parse_edf_time};

/// Label that marks an EDF+ annotation signal
pub const ANNOTATION_LABEL: &str = "EDF Annotations";

/// EDF / EDF+ file reader
///
/// `EdfReader` opens plain EDF, EDF+C and EDF+D recordings, parses the
/// header and reads the stored samples of every ordinary signal. Annotation
/// signals are hidden from the signal list.
///
/// # Examples
///
/// ```rust
/// use edfbids::EdfReader;
///
/// # edfbids::doctest_utils::create_simple_test_file("reader_doc.edf")?;
/// let mut reader = EdfReader::open("reader_doc.edf")?;
///
/// let header = reader.header();
/// println!("Duration: {:.1} seconds", header.duration_seconds());
/// println!("Signals: {}", header.signals.len());
///
/// // Raw stored values, exactly as on disk
/// let digital = reader.read_digital_samples(0, 256)?;
/// assert_eq!(digital.len(), 256);
///
/// # std::fs::remove_file("reader_doc.edf").ok();
/// # Ok::<(), edfbids::EdfError>(())
/// ```
pub struct EdfReader {
    file: BufReader<File>,
    header: EdfHeader,
    /// 每个可见信号在数据记录中的位置信息（与 header.signals 一一对应）
    signal_info: Vec<SignalInfo>,
    /// 当前每个信号的样本位置指针
    sample_positions: Vec<i64>,
    /// 文件的头部大小
    header_size: usize,
    /// 每个数据记录的大小（字节）
    record_size: usize,
}

#[derive(Debug, Clone)]
struct SignalInfo {
    /// 信号在数据记录中的字节偏移
    buffer_offset: usize,
}

impl EdfReader {
    /// Opens an EDF or EDF+ file for reading
    ///
    /// # Errors
    ///
    /// * `EdfError::FileNotFound` - File doesn't exist or can't be opened
    /// * `EdfError::UnsupportedFileType` - Version field is not an EDF version
    /// * `EdfError::InvalidHeader` - Header size field doesn't match the signal count
    /// * `EdfError::InvalidSignalCount` - Invalid number of signals
    /// * `EdfError::InvalidFormat` - Truncated data section or malformed numeric fields
    ///
    /// ```rust
    /// use edfbids::{EdfError, EdfReader};
    ///
    /// match EdfReader::open("nonexistent.edf") {
    ///     Err(EdfError::FileNotFound(msg)) => println!("File not found: {}", msg),
    ///     other => panic!("unexpected: {:?}", other.map(|_| ())),
    /// }
    /// ```
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(&path)
            .map_err(|e| EdfError::FileNotFound(format!("{}: {}", path.as_ref().display(), e)))?;
        let file_len = file.metadata()?.len();

        let mut reader = BufReader::new(file);

        let parsed = Self::parse_header(&mut reader, file_len)?;
        let sample_positions = vec![0i64; parsed.header.signals.len()];

        Ok(EdfReader {
            file: reader,
            header: parsed.header,
            signal_info: parsed.signal_info,
            sample_positions,
            header_size: parsed.header_size,
            record_size: parsed.record_size,
        })
    }

    /// Gets a reference to the file header information
    pub fn header(&self) -> &EdfHeader {
        &self.header
    }

    /// Reads physical value samples from the specified signal
    ///
    /// Stored values are clamped to the signal's digital range before the
    /// conversion, so out-of-range values read as the range limits.
    pub fn read_physical_samples(&mut self, signal: usize, count: usize) -> Result<Vec<f64>> {
        let digital_samples = self.read_digital_samples(signal, count)?;

        let signal_param = &self.header.signals[signal];
        let physical_samples = digital_samples
            .into_iter()
            .map(|d| {
                let clamped = d.max(signal_param.digital_min).min(signal_param.digital_max);
                signal_param.to_physical(clamped)
            })
            .collect();

        Ok(physical_samples)
    }

    /// Reads digital value samples from the specified signal
    ///
    /// Digital values are the raw 16-bit integers stored in the file. They are
    /// returned unmodified (no clamping), which is what a bit-faithful copy
    /// needs. Reading advances the signal's position; see [`EdfReader::seek`].
    ///
    /// # Errors
    ///
    /// * `EdfError::InvalidSignalIndex` - Signal index is out of bounds
    /// * `EdfError::Io` - I/O error reading from file
    pub fn read_digital_samples(&mut self, signal: usize, count: usize) -> Result<Vec<i32>> {
        if signal >= self.header.signals.len() {
            return Err(EdfError::InvalidSignalIndex(signal));
        }

        if count == 0 {
            return Ok(Vec::new());
        }

        let buffer_offset = self.signal_info[signal].buffer_offset;
        let samples_per_record = self.header.signals[signal].samples_per_record as i64;
        if samples_per_record <= 0 {
            return Ok(Vec::new());
        }

        // 计算可读取的最大样本数
        let samples_in_file = samples_per_record * self.header.datarecords_in_file;
        let available_samples = (samples_in_file - self.sample_positions[signal]).max(0) as usize;
        let actual_count = count.min(available_samples);

        let mut samples = Vec::with_capacity(actual_count);

        while samples.len() < actual_count {
            let current_pos = self.sample_positions[signal];
            let record_index = current_pos / samples_per_record;
            let sample_in_record = current_pos % samples_per_record;

            // 计算文件偏移量
            let file_offset = self.header_size as u64
                + record_index as u64 * self.record_size as u64
                + buffer_offset as u64
                + sample_in_record as u64 * 2; // 每个样本2字节

            self.file.seek(SeekFrom::Start(file_offset))?;

            // 计算在当前记录中可以读取的样本数
            let samples_in_current_record = (samples_per_record - sample_in_record) as usize;
            let samples_to_read = (actual_count - samples.len()).min(samples_in_current_record);

            let mut buf = vec![0u8; samples_to_read * 2];
            self.file.read_exact(&mut buf)?;
            samples.extend(
                buf.chunks_exact(2)
                    .map(|b| i16::from_le_bytes([b[0], b[1]]) as i32),
            );

            self.sample_positions[signal] = current_pos + samples_to_read as i64;
        }

        Ok(samples)
    }

    /// Reads every data record once and returns all stored samples, one
    /// vector per visible signal.
    ///
    /// Does not move the per-signal positions used by
    /// [`EdfReader::read_digital_samples`].
    pub fn read_all_digital_samples(&mut self) -> Result<Vec<Vec<i32>>> {
        let mut channels: Vec<Vec<i32>> = self
            .header
            .signals
            .iter()
            .map(|s| Vec::with_capacity(s.samples_in_file.max(0) as usize))
            .collect();

        // 记录大小已在 open 时按文件长度校验过；没有记录时不分配缓冲区
        if self.header.datarecords_in_file == 0 {
            return Ok(channels);
        }

        self.file.seek(SeekFrom::Start(self.header_size as u64))?;
        let mut record = vec![0u8; self.record_size];

        for _ in 0..self.header.datarecords_in_file {
            self.file.read_exact(&mut record)?;

            for (idx, signal) in self.header.signals.iter().enumerate() {
                let start = self.signal_info[idx].buffer_offset;
                let end = start + signal.samples_per_record.max(0) as usize * 2;
                channels[idx].extend(
                    record[start..end]
                        .chunks_exact(2)
                        .map(|b| i16::from_le_bytes([b[0], b[1]]) as i32),
                );
            }
        }

        Ok(channels)
    }

    /// 设置指定信号的样本位置
    pub fn seek(&mut self, signal: usize, position: i64) -> Result<i64> {
        if signal >= self.header.signals.len() {
            return Err(EdfError::InvalidSignalIndex(signal));
        }

        let max_position = self.header.signals[signal].samples_in_file;
        let new_position = position.max(0).min(max_position);
        self.sample_positions[signal] = new_position;

        Ok(new_position)
    }

    /// 获取指定信号的当前样本位置
    pub fn tell(&self, signal: usize) -> Result<i64> {
        if signal >= self.header.signals.len() {
            return Err(EdfError::InvalidSignalIndex(signal));
        }

        Ok(self.sample_positions[signal])
    }

    /// 将指定信号的位置重置到开头
    pub fn rewind(&mut self, signal: usize) -> Result<()> {
        self.seek(signal, 0)?;
        Ok(())
    }

    /// 解析EDF/EDF+文件头部
    fn parse_header(reader: &mut BufReader<File>, file_len: u64) -> Result<ParsedHeader> {
        // 读取主头部（256字节）
        reader.seek(SeekFrom::Start(0))?;
        let mut main_header = vec![0u8; 256];
        reader.read_exact(&mut main_header)
            .map_err(|_| EdfError::InvalidFormat("File is shorter than the 256-byte main header".to_string()))?;

        let version = String::from_utf8_lossy(&main_header[0..8]);
        if version.trim() != "0" {
            return Err(EdfError::UnsupportedFileType(format!("Not an EDF file: {:?}", version.trim())));
        }

        // 解析信号数量
        let signals_str = String::from_utf8_lossy(&main_header[252..256]);
        let total_signal_count = atoi_nonlocalized(&signals_str);
        if total_signal_count < 1 || total_signal_count > crate::EDFLIB_MAXSIGNALS as i32 {
            return Err(EdfError::InvalidSignalCount(total_signal_count));
        }

        // 验证头部大小
        let header_size_str = String::from_utf8_lossy(&main_header[184..192]);
        let expected_header_size = (total_signal_count + 1) * 256;
        if atoi_nonlocalized(&header_size_str) != expected_header_size {
            return Err(EdfError::InvalidHeader);
        }

        // EDF+ 标识位于保留字段
        let reserved = String::from_utf8_lossy(&main_header[192..236]);
        let file_type = if reserved.starts_with("EDF+C") {
            FileType::EdfPlusC
        } else if reserved.starts_with("EDF+D") {
            FileType::EdfPlusD
        } else {
            FileType::Edf
        };

        let patient_field = String::from_utf8_lossy(&main_header[8..88]).trim().to_string();
        let recording_field = String::from_utf8_lossy(&main_header[88..168]).trim().to_string();

        let date_str = String::from_utf8_lossy(&main_header[168..176]);
        let time_str = String::from_utf8_lossy(&main_header[176..184]);
        let (start_date, start_time) = Self::parse_datetime(&date_str, &time_str)?;

        let datarecords_str = String::from_utf8_lossy(&main_header[236..244]);
        let declared_records = atoi_nonlocalized(&datarecords_str) as i64;

        let duration_str = String::from_utf8_lossy(&main_header[244..252]);
        let datarecord_duration = parse_edf_time(&duration_str)?;
        if datarecord_duration < 0 {
            return Err(EdfError::InvalidFormat(format!("Negative data record duration: {}", duration_str.trim())));
        }

        // 读取信号头部信息
        let mut signal_header = vec![0u8; total_signal_count as usize * 256];
        reader.read_exact(&mut signal_header)
            .map_err(|_| EdfError::InvalidFormat("Signal headers are truncated".to_string()))?;

        let (mut signals, signal_info, record_size) = Self::parse_signals(
            &signal_header,
            total_signal_count as usize,
            file_type.is_edfplus(),
        )?;
        if record_size == 0 {
            return Err(EdfError::InvalidFormat("Data records have zero size".to_string()));
        }

        let header_size = expected_header_size as usize;
        let data_len = file_len.saturating_sub(header_size as u64);
        let datarecords = if declared_records == -1 {
            // 记录数未写入（写入过程中断），根据文件长度推算
            (data_len / record_size as u64) as i64
        } else if declared_records < 0 {
            return Err(EdfError::InvalidFormat(format!("Invalid number of data records: {}", declared_records)));
        } else {
            declared_records
        };

        let data_needed = (datarecords as u64).checked_mul(record_size as u64);
        if data_needed.map_or(true, |needed| data_len < needed) {
            return Err(EdfError::InvalidFormat(format!(
                "File is truncated: {} data records declared, {} bytes of data present",
                datarecords, data_len
            )));
        }

        let file_duration = datarecord_duration.checked_mul(datarecords).ok_or_else(|| {
            EdfError::InvalidFormat(format!(
                "Recording duration overflows: {} records of {}",
                datarecords,
                duration_str.trim()
            ))
        })?;

        for signal in &mut signals {
            signal.samples_in_file = signal.samples_per_record as i64 * datarecords;
        }

        let mut header = EdfHeader {
            file_type,
            signals,
            file_duration,
            start_date,
            start_time,
            datarecords_in_file: datarecords,
            datarecord_duration,
            patient_code: String::new(),
            sex: String::new(),
            birthdate: String::new(),
            patient_name: String::new(),
            patient_additional: String::new(),
            admin_code: String::new(),
            technician: String::new(),
            equipment: String::new(),
            recording_additional: String::new(),
        };

        if file_type.is_edfplus() {
            Self::parse_edfplus_patient(&patient_field, &mut header);
            Self::parse_edfplus_recording(&recording_field, &mut header);
        } else {
            // 原始EDF：整个患者字段作为姓名
            header.patient_name = patient_field;
            header.recording_additional = recording_field;
        }

        Ok(ParsedHeader { header, signal_info, header_size, record_size })
    }

    /// 解析日期时间
    fn parse_datetime(date_str: &str, time_str: &str) -> Result<(NaiveDate, NaiveTime)> {
        // 解析日期 "dd.mm.yy"
        let date_parts: Vec<&str> = date_str.trim().split('.').collect();
        if date_parts.len() != 3 {
            return Err(EdfError::FormatError);
        }

        let day = atoi_nonlocalized(date_parts[0]);
        let month = atoi_nonlocalized(date_parts[1]);
        let year = {
            let yy = atoi_nonlocalized(date_parts[2]);
            if yy > 84 { 1900 + yy } else { 2000 + yy }
        };

        let start_date = NaiveDate::from_ymd_opt(year, month as u32, day as u32)
            .ok_or(EdfError::FormatError)?;

        // 解析时间 "hh.mm.ss"
        let time_parts: Vec<&str> = time_str.trim().split('.').collect();
        if time_parts.len() != 3 {
            return Err(EdfError::FormatError);
        }

        let hour = atoi_nonlocalized(time_parts[0]);
        let minute = atoi_nonlocalized(time_parts[1]);
        let second = atoi_nonlocalized(time_parts[2]);

        let start_time = NaiveTime::from_hms_opt(hour as u32, minute as u32, second as u32)
            .ok_or(EdfError::FormatError)?;

        Ok((start_date, start_time))
    }

    /// 解析信号参数
    ///
    /// Returns the visible signals, their byte offsets inside one data record
    /// and the total record size (annotation signals included).
    fn parse_signals(
        signal_header: &[u8],
        total_signal_count: usize,
        edfplus: bool,
    ) -> Result<(Vec<SignalParam>, Vec<SignalInfo>, usize)> {
        let mut signals = Vec::new();
        let mut signal_info = Vec::new();
        let mut buffer_offset = 0;

        let field = |start: usize, width: usize, i: usize| -> String {
            let offset = start + i * width;
            String::from_utf8_lossy(&signal_header[offset..offset + width]).trim().to_string()
        };

        for i in 0..total_signal_count {
            let n = total_signal_count;
            let label = field(0, 16, i);

            let samples_str = field(n * 216, 8, i);
            let samples_per_record = atoi_nonlocalized(&samples_str);
            if samples_per_record < 1 {
                return Err(EdfError::InvalidFormat(format!(
                    "Signal {} has invalid samples per record: {:?}", i, samples_str
                )));
            }

            // 只有非注释信号才添加到用户可见的信号列表中
            let is_annotation = edfplus && label == ANNOTATION_LABEL;
            if !is_annotation {
                signals.push(SignalParam {
                    label,
                    samples_in_file: 0,
                    transducer: field(n * 16, 80, i),
                    physical_dimension: field(n * 96, 8, i),
                    physical_min: atof_nonlocalized(&field(n * 104, 8, i)),
                    physical_max: atof_nonlocalized(&field(n * 112, 8, i)),
                    digital_min: atoi_nonlocalized(&field(n * 120, 8, i)),
                    digital_max: atoi_nonlocalized(&field(n * 128, 8, i)),
                    prefilter: field(n * 136, 80, i),
                    samples_per_record,
                });
                signal_info.push(SignalInfo { buffer_offset });
            }

            // 更新缓冲区偏移（每个样本2字节）
            buffer_offset += samples_per_record as usize * 2;
        }

        Ok((signals, signal_info, buffer_offset))
    }

    /// 解析EDF+患者字段: "code sex birthdate name additional"
    fn parse_edfplus_patient(patient_field: &str, header: &mut EdfHeader) {
        let parts: Vec<&str> = patient_field.split_whitespace().collect();
        let part = |i: usize| parts.get(i).map(|s| decode_subfield(s)).unwrap_or_default();

        header.patient_code = part(0);
        header.sex = part(1);
        header.birthdate = part(2);
        header.patient_name = part(3);
        header.patient_additional = parts.get(4..).map(|s| s.join(" ")).unwrap_or_default();
    }

    /// 解析EDF+记录字段: "Startdate dd-MMM-yyyy admincode technician equipment additional"
    fn parse_edfplus_recording(recording_field: &str, header: &mut EdfHeader) {
        let parts: Vec<&str> = recording_field.split_whitespace().collect();
        let part = |i: usize| parts.get(i).map(|s| decode_subfield(s)).unwrap_or_default();

        header.admin_code = part(2);
        header.technician = part(3);
        header.equipment = part(4);
        header.recording_additional = parts.get(5..).map(|s| s.join(" ")).unwrap_or_default();
    }
}

struct ParsedHeader {
    header: EdfHeader,
    signal_info: Vec<SignalInfo>,
    header_size: usize,
    record_size: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doctest_utils::TestRecording;
    use std::io::Write;

    #[test]
    fn test_plain_edf_patient_field_is_whole_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plain.edf");
        TestRecording {
            plain_edf: true,
            patient_name: "TRAN THI B 85".to_string(),
            ..TestRecording::default()
        }
        .write(&path)
        .unwrap();

        let reader = EdfReader::open(&path).unwrap();
        let header = reader.header();
        assert_eq!(header.file_type, FileType::Edf);
        assert_eq!(header.patient_name, "TRAN THI B 85");
        assert!(header.patient_code.is_empty());
    }

    #[test]
    fn test_unknown_subfields_read_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plus.edf");
        TestRecording {
            patient_code: String::new(),
            sex: String::new(),
            ..TestRecording::default()
        }
        .write(&path)
        .unwrap();

        let reader = EdfReader::open(&path).unwrap();
        let header = reader.header();
        assert_eq!(header.file_type, FileType::EdfPlusC);
        assert_eq!(header.patient_code, "");
        assert_eq!(header.sex, "");
        assert_eq!(header.patient_name, "TEST_PATIENT");
    }

    #[test]
    fn test_truncated_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.edf");
        TestRecording::default().write(&path).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        let mut file = File::create(&path).unwrap();
        file.write_all(&bytes[..bytes.len() - 10]).unwrap();
        drop(file);

        assert!(matches!(EdfReader::open(&path), Err(EdfError::InvalidFormat(_))));
    }

    #[test]
    fn test_unknown_record_count_is_derived_from_length() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("unfinished.edf");
        TestRecording { seconds: 3, ..TestRecording::default() }.write(&path).unwrap();

        let mut bytes = std::fs::read(&path).unwrap();
        bytes[236..244].copy_from_slice(b"-1      ");
        std::fs::write(&path, &bytes).unwrap();

        let reader = EdfReader::open(&path).unwrap();
        assert_eq!(reader.header().datarecords_in_file, 3);
    }

    fn plain_recording(path: &Path, seconds: usize) {
        TestRecording {
            plain_edf: true,
            labels: vec!["EEG Cz".to_string()],
            sample_rates: vec![1],
            seconds,
            ..TestRecording::default()
        }
        .write(path)
        .unwrap();
    }

    fn patch(path: &Path, offset: usize, bytes: &[u8]) {
        let mut data = std::fs::read(path).unwrap();
        data[offset..offset + bytes.len()].copy_from_slice(bytes);
        std::fs::write(path, &data).unwrap();
    }

    #[test]
    fn test_garbled_duration_field_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("garbled.edf");
        plain_recording(&path, 2);
        patch(&path, 244, b"1.12345\xff");

        assert!(matches!(EdfReader::open(&path), Err(EdfError::InvalidFormat(_))));
    }

    #[test]
    fn test_overflowing_duration_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("endless.edf");
        plain_recording(&path, 10_000);
        patch(&path, 244, b"99999999");

        assert!(matches!(EdfReader::open(&path), Err(EdfError::InvalidFormat(_))));
    }

    #[test]
    fn test_zero_records_with_huge_record_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.edf");
        plain_recording(&path, 1);
        patch(&path, 236, b"0       ");
        // samples per record of the only signal
        patch(&path, 256 + 216, b"99999999");

        let mut reader = EdfReader::open(&path).unwrap();
        assert_eq!(reader.header().datarecords_in_file, 0);
        assert_eq!(reader.read_all_digital_samples().unwrap(), vec![Vec::<i32>::new()]);
    }

    #[test]
    fn test_garbage_is_not_an_edf_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("garbage.edf");
        std::fs::write(&path, vec![0xAB; 600]).unwrap();
        assert!(EdfReader::open(&path).is_err());
    }
}
