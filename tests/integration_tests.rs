use edfbids::doctest_utils::TestRecording;
use edfbids::{EdfReader, EdfWriter, FileType, SignalParam};
use std::fs;

// 创建测试信号的辅助函数
fn create_test_eeg_signal(samples_per_record: i32) -> SignalParam {
    SignalParam {
        label: "EEG Fp1".to_string(),
        samples_in_file: 0,
        physical_max: 200.0,
        physical_min: -200.0,
        digital_max: 32767,
        digital_min: -32768,
        samples_per_record,
        physical_dimension: "uV".to_string(),
        prefilter: "HP:0.1Hz LP:70Hz".to_string(),
        transducer: "AgAgCl electrodes".to_string(),
    }
}

#[test]
fn test_basic_write_read_cycle() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("basic.edf");

    // 写入阶段
    let mut written = Vec::new();
    {
        let mut writer = EdfWriter::create(&path).unwrap();
        writer.set_patient_info("P001", "M", "01-JAN-1990", "Test Patient").unwrap();
        writer.add_signal(create_test_eeg_signal(256)).unwrap();

        // 写入5秒 10Hz 正弦波
        for second in 0..5 {
            let samples: Vec<f64> = (0..256)
                .map(|i| {
                    let t = (second * 256 + i) as f64 / 256.0;
                    50.0 * (2.0 * std::f64::consts::PI * 10.0 * t).sin()
                })
                .collect();
            written.extend_from_slice(&samples);
            writer.write_samples(&[samples]).unwrap();
        }
        writer.finalize().unwrap();
    }

    // 读取阶段
    let mut reader = EdfReader::open(&path).unwrap();
    let header = reader.header().clone();
    assert_eq!(header.file_type, FileType::EdfPlusC);
    assert_eq!(header.patient_name, "Test_Patient");
    assert_eq!(header.patient_code, "P001");
    assert_eq!(header.sex, "M");
    assert_eq!(header.birthdate, "01-JAN-1990");
    assert_eq!(header.signals.len(), 1);
    assert_eq!(header.signals[0].label, "EEG Fp1");
    assert_eq!(header.datarecords_in_file, 5);
    assert_eq!(header.signals[0].samples_in_file, 1280);
    assert!((header.duration_seconds() - 5.0).abs() < 1e-9);

    let samples = reader.read_physical_samples(0, 2000).unwrap();
    assert_eq!(samples.len(), 1280);
    let tolerance = header.signals[0].bit_value();
    for (read, expected) in samples.iter().zip(&written) {
        assert!((read - expected).abs() <= tolerance, "{} vs {}", read, expected);
    }
}

#[test]
fn test_multi_rate_channels_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("multi_rate.edf");

    let recording = TestRecording {
        labels: vec!["EEG C3".to_string(), "ECG".to_string(), "Resp".to_string()],
        sample_rates: vec![256, 128, 8],
        seconds: 3,
        ..TestRecording::default()
    };
    let expected = recording.write(&path).unwrap();

    let mut reader = EdfReader::open(&path).unwrap();
    assert_eq!(reader.header().shape(), vec![768, 384, 24]);
    assert_eq!(reader.header().max_sample_rate(), 256.0);
    assert_eq!(reader.header().signals[2].sample_rate(reader.header().datarecord_duration), 8.0);
    assert_eq!(reader.read_all_digital_samples().unwrap(), expected);

    // 逐通道读取与整体读取一致
    let ecg = reader.read_digital_samples(1, 1000).unwrap();
    assert_eq!(ecg, expected[1]);
}

#[test]
fn test_seek_and_tell() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("seek.edf");
    let expected = TestRecording::default().write(&path).unwrap();

    let mut reader = EdfReader::open(&path).unwrap();
    assert_eq!(reader.seek(0, 450).unwrap(), 450);
    let chunk = reader.read_digital_samples(0, 100).unwrap();
    assert_eq!(chunk, expected[0][450..550]);
    assert_eq!(reader.tell(0).unwrap(), 550);

    // 超出范围的位置被截断
    assert_eq!(reader.seek(0, 1_000_000).unwrap(), 1000);
    assert!(reader.read_digital_samples(0, 10).unwrap().is_empty());

    reader.rewind(0).unwrap();
    assert_eq!(reader.tell(0).unwrap(), 0);
    assert!(reader.read_digital_samples(5, 1).is_err());
}

#[test]
fn test_plain_edf_patient_field() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("plain.edf");

    TestRecording {
        plain_edf: true,
        patient_name: "NGUYEN_VAN_A_1979".to_string(),
        ..TestRecording::default()
    }
    .write(&path)
    .unwrap();

    let reader = EdfReader::open(&path).unwrap();
    let header = reader.header();
    assert_eq!(header.file_type, FileType::Edf);
    assert_eq!(header.patient_name, "NGUYEN_VAN_A_1979");
    assert!(header.patient_code.is_empty());
    assert_eq!(header.signals.len(), 2);

    // 普通EDF没有注释信号
    let bytes = fs::read(&path).unwrap();
    assert_eq!(&bytes[252..256], b"2   ");
}

#[test]
fn test_rejects_non_edf_input() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("junk.edf");
    fs::write(&path, b"this is not an EDF header at all").unwrap();
    assert!(EdfReader::open(&path).is_err());
    assert!(EdfReader::open(dir.path().join("missing.edf")).is_err());
}
