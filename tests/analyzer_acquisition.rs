//! Trace acquisition through the E5071C driver over a scripted transport.

use exp_control::adapters::MockTransport;
use exp_control::instrument::E5071C;
use exp_control::measurement::{TraceAcquirer, TraceConfig};
use exp_control::ExpError;
use std::sync::Arc;

fn fdata(values: &[f64]) -> String {
    values
        .iter()
        .map(|v| format!("{:+.6E},{:+.6E}", v, 0.0))
        .collect::<Vec<_>>()
        .join(",")
}

fn config(points: usize, averages: u32) -> TraceConfig {
    TraceConfig {
        start_freq: 7.49e9,
        stop_freq: 7.494e9,
        num_points: points,
        averages,
        ..TraceConfig::default()
    }
}

fn setup() -> (TraceAcquirer, MockTransport) {
    let mock = MockTransport::new("TCPIP0::169.254.71.72::INSTR");
    mock.set_reply(":TRIG:SING;*OPC?", "+1");
    let vna = Arc::new(E5071C::new("vna", Arc::new(mock.clone())));
    (TraceAcquirer::new(vna), mock)
}

#[tokio::test]
async fn acquisition_follows_trigger_protocol() {
    let (acquirer, mock) = setup();
    mock.push_reply("CALC1:DATA:FDATA?", &fdata(&[-3.0, -10.0, -3.5, -4.0]));
    mock.push_reply("CALC1:DATA:FDATA?", &fdata(&[10.0, 0.0, -10.0, -20.0]));

    let trace = acquirer.acquire(&config(4, 3)).await.unwrap();
    assert_eq!(trace.magnitude(), &[-3.0, -10.0, -3.5, -4.0]);
    assert_eq!(trace.phase(), &[10.0, 0.0, -10.0, -20.0]);
    assert_eq!(trace.frequencies().len(), 4);

    let log = mock.call_log();
    assert_eq!(log.first().map(String::as_str), Some("write: TRIG:SOUR BUS"));
    assert_eq!(log.last().map(String::as_str), Some("write: TRIG:SOUR INT"));

    let position = |entry: &str| log.iter().position(|e| e == entry).unwrap();
    let triggers: Vec<usize> = log
        .iter()
        .enumerate()
        .filter(|(_, e)| e.as_str() == "query: :TRIG:SING;*OPC?")
        .map(|(i, _)| i)
        .collect();
    assert_eq!(triggers.len(), 3);
    assert!(position("write: SENS1:AVER:CLE") < triggers[0]);
    assert!(triggers[2] < position("write: CALC1:PAR1:SEL"));
    assert!(position("write: CALC1:PAR1:SEL") < position("write: CALC1:PAR2:SEL"));
}

#[tokio::test]
async fn wrong_point_count_is_protocol_error_and_trigger_resumes() {
    let (acquirer, mock) = setup();
    mock.set_reply("CALC1:DATA:FDATA?", &fdata(&[-3.0, -3.0, -3.0]));

    let err = acquirer.acquire(&config(4, 1)).await.unwrap_err();
    assert!(matches!(err, ExpError::Protocol { .. }));
    assert_eq!(
        mock.call_log().last().map(String::as_str),
        Some("write: TRIG:SOUR INT")
    );
}

#[tokio::test]
async fn trigger_timeout_is_instrument_fault_and_trigger_resumes() {
    let (acquirer, mock) = setup();
    mock.fail_on(":TRIG:SING");

    let err = acquirer.acquire(&config(4, 2)).await.unwrap_err();
    match err {
        ExpError::InstrumentFault { instrument, .. } => assert_eq!(instrument, "vna"),
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(
        mock.call_log().last().map(String::as_str),
        Some("write: TRIG:SOUR INT")
    );
}

#[tokio::test]
async fn invalid_config_sends_nothing() {
    let (acquirer, mock) = setup();
    let inverted = TraceConfig {
        start_freq: 8e9,
        stop_freq: 7e9,
        ..TraceConfig::default()
    };
    assert!(matches!(
        acquirer.acquire(&inverted).await,
        Err(ExpError::Config(_))
    ));
    assert!(mock.call_log().is_empty());
}
