//! End-to-end runs of the experiment session on the simulated lab.

use exp_control::config::Settings;
use exp_control::data::{read_trace_csv, TemperatureLogWriter};
use exp_control::experiment::{ExperimentSession, Instruments, SweepConfig};
use exp_control::instrument::sim::SimulatedLab;
use exp_control::measurement::TraceConfig;
use exp_control::{ErrorKind, SweepVariable};
use std::path::Path;
use std::time::Duration;

fn session(lab: &SimulatedLab, output_dir: &Path) -> ExperimentSession {
    let mut settings = Settings::default();
    settings.storage.output_dir = output_dir.to_path_buf();
    ExperimentSession::new(
        settings,
        Instruments::from_lab(lab),
        Some(SimulatedLab::calibration().unwrap()),
    )
}

fn trace() -> TraceConfig {
    TraceConfig {
        start_freq: 7.49e9,
        stop_freq: 7.51e9,
        num_points: 101,
        averages: 2,
        ..TraceConfig::default()
    }
}

fn field_sweep(high: f64, limit: f64) -> SweepConfig {
    SweepConfig {
        variable: SweepVariable::Field,
        low: 0.0,
        high,
        step: 2.0,
        hard_limit: limit,
        settle_time_seconds: 10.0,
    }
}

fn csv_files(dir: &Path) -> Vec<std::path::PathBuf> {
    let run_dir = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .find(|p| p.is_dir())
        .expect("run directory");
    let mut files: Vec<_> = std::fs::read_dir(run_dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect();
    files.sort();
    files
}

#[tokio::test(start_paused = true)]
async fn field_sweep_persists_one_file_per_setpoint() {
    let lab = SimulatedLab::new();
    let dir = tempfile::tempdir().unwrap();
    let session = session(&lab, dir.path());

    let outcome = session
        .run_sweep(&field_sweep(10.0, 100.0), &trace(), true)
        .await
        .unwrap();
    assert!(outcome.is_complete());
    assert_eq!(outcome.persisted, 5);

    let files = csv_files(dir.path());
    let names: Vec<_> = files
        .iter()
        .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
        .collect();
    assert_eq!(
        names,
        vec!["B_0.000.csv", "B_2.000.csv", "B_4.000.csv", "B_6.000.csv", "B_8.000.csv"]
    );

    for (file, record) in files.iter().zip(&outcome.records) {
        let stored = read_trace_csv(file).unwrap();
        assert_eq!(&stored, record.trace());
    }
    assert_eq!(lab.field.applied_level(), 0.0);
}

#[tokio::test(start_paused = true)]
async fn limit_abort_keeps_files_written_before_it() {
    let lab = SimulatedLab::new();
    let dir = tempfile::tempdir().unwrap();
    let session = session(&lab, dir.path());

    let outcome = session
        .run_sweep(&field_sweep(10.0, 5.0), &trace(), true)
        .await
        .unwrap();
    let failure = outcome.failure().unwrap();
    assert_eq!(failure.error.kind(), ErrorKind::SafetyLimit);
    assert_eq!(failure.setpoint, 6.0);

    assert_eq!(csv_files(dir.path()).len(), 3);
    assert_eq!(lab.field.levels(), vec![0.0, 2.0, 4.0]);
}

#[tokio::test(start_paused = true)]
async fn cancel_during_sweep_stops_at_next_boundary() {
    let lab = SimulatedLab::new();
    let dir = tempfile::tempdir().unwrap();
    let session = session(&lab, dir.path());
    let cancel = session.cancel_token();

    let sweep = field_sweep(100.0, 200.0);
    let tr = trace();
    let run = session.run_sweep(&sweep, &tr, false);
    let stopper = async {
        // inside the second settle period
        tokio::time::sleep(Duration::from_secs(15)).await;
        cancel.cancel();
    };
    let (outcome, ()) = tokio::join!(run, stopper);
    let outcome = outcome.unwrap();

    assert_eq!(outcome.failure().unwrap().error.kind(), ErrorKind::Cancelled);
    assert_eq!(outcome.records.len(), 1);
    assert_eq!(lab.field.levels(), vec![0.0, 2.0, 0.0]);
}

#[tokio::test(start_paused = true)]
async fn single_trace_with_background_from_file() {
    let lab = SimulatedLab::new();
    let dir = tempfile::tempdir().unwrap();
    let session = session(&lab, dir.path());
    let background_path = dir.path().join("background.csv");
    let output_path = dir.path().join("corrected.csv");

    let background = session
        .acquire_trace(&trace(), None, Some(&background_path))
        .await
        .unwrap();
    let corrected = session
        .acquire_trace(&trace(), Some(&background_path), Some(&output_path))
        .await
        .unwrap();

    assert!(corrected.magnitude().iter().all(|m| *m == 0.0));
    assert_eq!(corrected.phase(), background.phase());
    assert_eq!(read_trace_csv(&output_path).unwrap(), corrected);

    let mismatched = TraceConfig {
        num_points: 51,
        ..trace()
    };
    let err = session
        .acquire_trace(&mismatched, Some(&background_path), None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Config);
}

#[tokio::test(start_paused = true)]
async fn temperature_log_is_written() {
    let lab = SimulatedLab::new();
    lab.meter.set_resistances(1510.0, 1490.0);
    let dir = tempfile::tempdir().unwrap();
    let session = session(&lab, dir.path());
    let path = dir.path().join("temperature.csv");
    let mut log = TemperatureLogWriter::create(&path).unwrap();

    let samples = session
        .log_temperature(Duration::from_secs(2), 4, Some(&mut log))
        .await
        .unwrap();
    assert_eq!(samples.len(), 4);
    // halfway between 1000 Ω (4.2 K) and 2000 Ω (1.5 K)
    assert!((samples[0].temperature_k - 2.85).abs() < 1e-9);

    let contents = std::fs::read_to_string(&path).unwrap();
    assert_eq!(contents.lines().count(), 5);
}

#[tokio::test]
async fn simulated_session_from_settings() {
    let dir = tempfile::tempdir().unwrap();
    let mut settings = Settings::default();
    settings.storage.output_dir = dir.path().to_path_buf();
    let session = ExperimentSession::simulated(settings).unwrap();

    let sample = session.measure_temperature().await.unwrap();
    assert!((sample.temperature_k - 4.2).abs() < 1e-9);
}
