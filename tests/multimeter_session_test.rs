//! Multimeter readings and configuration writes over loopback TCP.

use std::time::Duration;

use board_daq::mock::{MockBehavior, MockInstrument, ReplyScript};
use board_daq::scpi::MeterFunction;
use board_daq::{configure, measure_reading, MeasurementReport, ParseError};

#[tokio::test]
async fn test_reading_is_sanitized() {
    let mock = MockInstrument::start(MockBehavior::meter("\u{0}+4.99870E+00"))
        .await
        .unwrap();

    let reading = measure_reading(&mock.endpoint(2_000), &MeterFunction::DcVoltage.measure_query())
        .await
        .unwrap();

    assert_eq!(reading, "+4.99870E+00");
    assert_eq!(mock.received_commands().await, vec!["MEAS:VOLT:DC?"]);

    let report = MeasurementReport::from_reading(&Ok(reading));
    assert_eq!(report.value, Some(4.9987));
}

#[tokio::test]
async fn test_overload_reading_has_no_value() {
    let mock = MockInstrument::start(MockBehavior::meter("+9.90000000E+37"))
        .await
        .unwrap();

    let result = measure_reading(&mock.endpoint(2_000), &MeterFunction::Resistance.measure_query()).await;
    let report = MeasurementReport::from_reading(&result);

    assert!(report.is_success());
    assert_eq!(report.reading.as_deref(), Some("+9.90000000E+37"));
    assert_eq!(report.value, None);
}

#[tokio::test]
async fn test_first_chunk_wins() {
    let script = ReplyScript::new(&b"+1.000E-03\r\n"[..]).with_delay(Duration::from_millis(5));
    let script = ReplyScript {
        chunks: vec![script.chunks[0].clone(), "+2.000E-03\r\n".into()],
        ..script
    };
    let mock = MockInstrument::start(MockBehavior::Reply(script)).await.unwrap();

    let reading = measure_reading(&mock.endpoint(2_000), "MEAS:CURR:DC?").await.unwrap();
    assert_eq!(reading, "+1.000E-03");
}

#[tokio::test]
async fn test_closed_without_reply_is_empty() {
    let script = ReplyScript {
        chunks: Vec::new(),
        ..ReplyScript::new(Vec::new()).then_close()
    };
    let mock = MockInstrument::start(MockBehavior::Reply(script)).await.unwrap();

    let err = measure_reading(&mock.endpoint(2_000), "MEAS:VOLT:AC?").await.unwrap_err();
    assert_eq!(err.parse_error(), Some(&ParseError::Empty));
}

#[tokio::test]
async fn test_silent_meter_times_out() {
    let mock = MockInstrument::start(MockBehavior::Silent).await.unwrap();

    let err = measure_reading(&mock.endpoint(100), "MEAS:FREQ?").await.unwrap_err();
    assert_eq!(err.kind(), "timeout");

    let report = MeasurementReport::from_reading(&Err(err));
    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["status"], "error");
    assert_eq!(json["kind"], "timeout");
}

#[tokio::test]
async fn test_configure_writes_command_without_waiting() {
    let mock = MockInstrument::start(MockBehavior::Silent).await.unwrap();

    for function in [MeterFunction::Resistance, MeterFunction::Capacitance] {
        configure(&mock.endpoint(500), &function.configure_command())
            .await
            .unwrap();
    }

    assert!(mock.wait_for_lines(2, Duration::from_secs(1)).await);
    let mut commands = mock.received_commands().await;
    commands.sort();
    assert_eq!(commands, vec!["CONF:CAP", "CONF:RES"]);
    assert_eq!(mock.connection_count(), 2);
}
