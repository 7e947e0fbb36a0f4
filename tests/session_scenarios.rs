use spectro_link::sensor::AS7265X_WAVELENGTHS;
use spectro_link::settings::LedSelection;
use spectro_link::transport::LineBuffer;
use spectro_link::{
    CancelToken, Gain, MockTransport, OnboardLed, ReadWorker, ReadingAssembler, SensorKind,
    SensorSettings, Session, SessionConfig, SessionError, SettingsError, Step,
};
use std::sync::Arc;
use std::time::Duration;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn psoc_host() -> MockTransport {
    MockTransport::new()
        .reply_to("ID", &["PSoC-Spectrometer"])
        .reply_to("ID-Spectrometer", &["AS7262"])
}

fn config() -> SessionConfig {
    SessionConfig::psoc()
        .read_timeout(Duration::from_millis(300))
        .line_timeout(Duration::from_millis(50))
}

fn identified(mock: &MockTransport) -> Session<MockTransport> {
    let session = Session::new(mock.clone(), config());
    session.identify().unwrap();
    session
}

#[test]
fn test_byte_stream_to_reading() {
    init_logging();
    let stream = b"AS7262 START READ\r\nAS7262 RAW DATA: [100,200,300,400,500,600]\r\ninteg ration cycles:50|x|16|\r\nAS7262 CAL DATA: [10,20,30,40,50,60]\r\nAS7262 END READ\r\n";

    let mut buffer = LineBuffer::new();
    let mut assembler = ReadingAssembler::new();
    let mut readings = Vec::new();
    // deliver in awkward chunks as a serial port would
    for chunk in stream.chunks(7) {
        buffer.push(chunk);
        while let Some(line) = buffer.next_line() {
            match assembler.push_line(&line) {
                Step::Complete(reading) => readings.push(reading),
                Step::Pending => {}
                other => panic!("unexpected step {:?}", other),
            }
        }
    }

    assert_eq!(readings.len(), 1);
    let reading = &readings[0];
    assert_eq!(reading.sensor(), SensorKind::As7262);
    assert_eq!(reading.gain(), Gain::X16);
    assert_eq!(reading.integration_cycles(), 50);
    assert_eq!(reading.raw_data(), &[100.0, 200.0, 300.0, 400.0, 500.0, 600.0]);
    assert!(!reading.saturated());
    let expected: Vec<f64> = [10.0, 20.0, 30.0, 40.0, 50.0, 60.0]
        .iter()
        .map(|c| c * 1000.0 / (50.0 * 2.8))
        .collect();
    assert_eq!(reading.norm_data(), expected.as_slice());
    assert_eq!(reading.wavelengths(), &[450, 500, 550, 570, 600, 650]);
}

#[test]
fn test_session_read_skips_noise_and_bad_frames() {
    init_logging();
    let mock = psoc_host().reply_to(
        "AS7262|READ_SINGLE",
        &[
            "debug: sensor woke up",
            "AS7262 START READ",
            "AS7262 RAW DATA: [1,2,abc]",
            "AS7262 END READ",
            "AS7262 START READ",
            "AS7262 RAW DATA: [1,2,3,4,5,6]",
            "AS7262 START READ",
            "AS7262 CAL DATA: [6,5,4,3,2,1]",
            "AS7262 RAW DATA: [1,2,3,4,5,70000]",
            "integration cycles:10|x|64|",
            "AS7262 END READ",
        ],
    );
    let session = identified(&mock);
    let reading = session.read_one(SensorKind::As7262, Duration::from_millis(300)).unwrap();
    assert!(reading.saturated());
    assert_eq!(reading.gain(), Gain::X64);
    assert_eq!(reading.calibrated_data()[0], 6.0);
    assert_eq!(mock.pending_lines(), 0);
}

#[test]
fn test_incomplete_frame_surfaces_to_caller() {
    let mock = psoc_host().reply_to(
        "AS7262|READ_SINGLE",
        &["AS7262 START READ", "AS7262 CAL DATA: [1,2,3,4,5,6]", "AS7262 END READ"],
    );
    let session = identified(&mock);
    match session.read_one(SensorKind::As7262, Duration::from_millis(300)) {
        Err(SessionError::IncompleteFrame { sensor, missing }) => {
            assert_eq!(sensor, SensorKind::As7262);
            assert_eq!(missing, "raw data");
        }
        other => panic!("unexpected {:?}", other),
    }
    assert!(session.is_connected());
}

#[test]
fn test_missing_gain_line_falls_back_to_commanded_settings() {
    let mock = psoc_host().reply_to(
        "AS7262|READ_SINGLE",
        &[
            "AS7262 START READ",
            "AS7262 RAW DATA: [1,2,3,4,5,6]",
            "AS7262 CAL DATA: [1,2,3,4,5,6]",
            "AS7262 END READ",
        ],
    );
    let session = identified(&mock);
    session.set_gain(SensorKind::As7262, Gain::X3_7).unwrap();
    session.set_integration_time(SensorKind::As7262, 56.0).unwrap();

    let reading = session.read_one(SensorKind::As7262, Duration::from_millis(300)).unwrap();
    assert_eq!(reading.gain(), Gain::X3_7);
    // 56 ms in 2.8 ms read cycles, although the host was told 10 cycles of 5.6 ms
    assert_eq!(reading.integration_cycles(), 20);
    assert!((reading.integration_time_ms() - 56.0).abs() < 1e-9);
    let expected: Vec<f64> = (1..=6).map(|c| c as f64 * 1000.0 / (20.0 * 2.8)).collect();
    assert_eq!(reading.norm_data(), expected.as_slice());
    assert!(mock.written().contains(&"AS7262|GAIN|1".to_string()));
    assert!(mock.written().contains(&"AS7262|INTEGRATE_TIME|010".to_string()));
}

#[test]
fn test_handshake_mismatch_blocks_sensor_commands() {
    let mock = MockTransport::new().reply_to("ID", &["Bootloader v2"]);
    let session = Session::new(mock.clone(), config());
    assert!(matches!(
        session.identify(),
        Err(SessionError::IdentityMismatch { .. })
    ));
    assert!(session.read_one(SensorKind::As7262, Duration::from_millis(10)).is_err());
    assert_eq!(mock.written(), vec!["ID".to_string()]);
}

#[test]
fn test_silent_device_times_out() {
    let mock = MockTransport::new();
    let session = Session::new(mock, config());
    assert!(matches!(
        session.identify(),
        Err(SessionError::IdentityMismatch { received, .. }) if received.is_empty()
    ));
}

#[test]
fn test_read_range_restores_settings() {
    let frame = [
        "AS7262 START READ",
        "AS7262 RAW DATA: [1,2,3,4,5,6]",
        "AS7262 CAL DATA: [1,2,3,4,5,6]",
        "integration cycles:3|x|1|",
        "AS7262 END READ",
    ];
    let mock = psoc_host().reply_to("AS7262|READ_SINGLE", &frame);
    let session = identified(&mock);
    let before = session.settings();

    let readings = session.read_range(SensorKind::As7262, &[20.0, 40.0, 80.0]).unwrap();
    assert_eq!(readings.len(), 3);
    assert_eq!(session.settings(), before);

    assert_eq!(
        integration_commands(&mock),
        vec![
            "AS7262|INTEGRATE_TIME|003",
            "AS7262|INTEGRATE_TIME|007",
            "AS7262|INTEGRATE_TIME|014",
            "AS7262|INTEGRATE_TIME|025",
        ]
    );
}

fn integration_commands(mock: &MockTransport) -> Vec<String> {
    mock.written()
        .into_iter()
        .filter(|c| c.contains("INTEGRATE_TIME"))
        .collect()
}

#[test]
fn test_failed_read_range_restores_device_integration_time() {
    let mock = psoc_host();
    let session = identified(&mock);
    let before = session.settings();

    assert!(matches!(
        session.read_range(SensorKind::As7262, &[20.0, 250.0]),
        Err(SessionError::DeviceTimeout { .. })
    ));
    assert_eq!(session.settings(), before);
    assert_eq!(
        integration_commands(&mock),
        vec!["AS7262|INTEGRATE_TIME|003", "AS7262|INTEGRATE_TIME|025"]
    );
}

#[test]
fn test_psoc_streaming_uses_firmware_commands_only() {
    let mock = psoc_host();
    let session = identified(&mock);

    session
        .start_device_streaming(SensorKind::As7262, Duration::from_millis(500))
        .unwrap();
    assert!(session.is_continuous());
    session.stop_device_streaming().unwrap();
    assert!(!session.is_continuous());

    assert!(matches!(
        session.set_indicator(SensorKind::As7262, true),
        Err(SessionError::Settings(SettingsError::Unsupported { .. }))
    ));
    assert_eq!(
        mock.written()[2..],
        ["SET_CONT_READ_PERIOD|00500".to_string(), "AS7262|START".to_string()]
    );
}

#[test]
fn test_auto_gain_raises_gain_for_dim_signal() {
    let mock = psoc_host().reply_to(
        "AS7262|READ_SINGLE",
        &[
            "AS7262 START READ",
            "AS7262 RAW DATA: [10,20,30,40,50,100]",
            "AS7262 CAL DATA: [1,2,3,4,5,6]",
            "integration cycles:50|x|1|",
            "AS7262 END READ",
        ],
    );
    let session = identified(&mock);
    assert_eq!(session.auto_gain(SensorKind::As7262).unwrap(), Gain::X64);
    assert_eq!(session.settings().gain, Gain::X64);
    assert_eq!(mock.written().last().map(String::as_str), Some("AS7262|GAIN|3"));
}

#[test]
fn test_micropython_triad_read() {
    let raw: Vec<String> = AS7265X_WAVELENGTHS.iter().map(|w| w.to_string()).collect();
    let raw_line = format!("AS7265X RAW DATA: [{}]", raw.join(","));
    let cal_line = format!("AS7265X CAL DATA: [{}]", raw.join(","));
    let mock = MockTransport::new()
        .reply_to("ID-Spectrometer", &["AS7265X"])
        .reply_to(
            "AS7265X_Read(50, [3], [0, 2])",
            &[
                "AS7265X START READ",
                raw_line.as_str(),
                cal_line.as_str(),
                "integration cycles:50|x|16|",
                "AS7265X END READ",
            ],
        );
    let session = Session::new(
        mock.clone(),
        SessionConfig::micropython().line_timeout(Duration::from_millis(50)),
    );
    session.identify().unwrap();
    let kind = session.attached_sensor().unwrap();
    assert_eq!(
        mock.written(),
        vec!["ID-Spectrometer", "as7265x, lp55231_1, lp55231_2 = init()"]
    );

    let leds = LedSelection::none()
        .onboard(OnboardLed::Uv)
        .onboard(OnboardLed::White)
        .lp55231_channel(3)
        .unwrap();
    let settings = SensorSettings::builder()
        .integration_time_ms(140.0)
        .leds(leds)
        .build()
        .unwrap();
    session.update_settings(settings);

    let reading = session.read_one(kind, Duration::from_millis(300)).unwrap();
    assert_eq!(reading.wavelengths().len(), 18);
    let presented: Vec<u32> = reading.raw_data().iter().map(|&v| v as u32).collect();
    assert_eq!(presented, reading.wavelengths());
    assert!(reading.wavelengths().windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn test_worker_hands_over_readings_and_stops() {
    init_logging();
    let frame = [
        "AS7262 START READ",
        "AS7262 RAW DATA: [1,2,3,4,5,6]",
        "AS7262 CAL DATA: [1,2,3,4,5,6]",
        "integration cycles:5|x|1|",
        "AS7262 END READ",
    ];
    let mock = psoc_host().reply_to("AS7262|READ_SINGLE", &frame);
    let session = Arc::new(identified(&mock));

    let cancel = CancelToken::new();
    let worker = ReadWorker::spawn(
        Arc::clone(&session),
        SensorKind::As7262,
        Duration::from_millis(200),
        cancel.clone(),
    )
    .unwrap();
    assert!(session.is_continuous());

    for _ in 0..2 {
        let reading = worker
            .recv_timeout(Duration::from_secs(5))
            .expect("worker produced a result")
            .unwrap();
        assert_eq!(reading.integration_cycles(), 5);
    }

    cancel.cancel();
    worker.stop();
    assert!(!session.is_continuous());
    assert!(session.is_connected());
}

#[test]
fn test_worker_exits_when_device_is_lost() {
    let mock = psoc_host();
    let session = Arc::new(identified(&mock));
    mock.inject_read_failure();

    let worker = ReadWorker::spawn(
        Arc::clone(&session),
        SensorKind::As7262,
        Duration::from_millis(200),
        CancelToken::new(),
    )
    .unwrap();

    match worker.recv_timeout(Duration::from_secs(5)) {
        Some(Err(e)) => assert!(!e.is_retryable()),
        other => panic!("expected a fatal error, got {:?}", other.map(|r| r.is_ok())),
    }
    assert!(worker.recv_timeout(Duration::from_millis(100)).is_none());
    assert!(!session.is_connected());
}
