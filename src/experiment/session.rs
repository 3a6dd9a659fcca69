//! Experiment session
//!
//! The session owns every instrument handle and all state that lives across
//! operations (cancel token, global rotation step counter). Nothing here is
//! global; each CLI command builds one session and runs one operation.

use crate::adapters::{ScpiTransport, VisaTransport};
use crate::config::{InstrumentConfig, Settings};
use crate::core::{CancelToken, SweepVariable};
use crate::data::{read_trace_csv, write_trace_csv, CsvRecordWriter, RecordSink, TemperatureLogWriter};
use crate::error::{AppResult, ExpError};
use crate::experiment::sweep::{
    SweepConfig, SweepController, SweepFailure, SweepOutcome, SweepTermination,
};
use crate::instrument::sim::SimulatedLab;
use crate::instrument::{
    Er032m, FrequencySweepSource, Gs200, Keithley2400, ResistanceMeter, RotationDirection,
    RotationStage, SetpointSource, SteppingRotationStage, E5071C,
};
use crate::measurement::{
    CalibrationTable, ResistanceThermometer, TemperatureSample, Trace, TraceAcquirer, TraceConfig,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::time::{interval, sleep, Duration, MissedTickBehavior};
use tracing::{info, warn};

/// Wait after switching the current source on, before the first set-point.
pub const CURRENT_OUTPUT_SETTLE: Duration = Duration::from_secs(3);
/// Shortest accepted temperature logging interval.
pub const MIN_LOG_INTERVAL: Duration = Duration::from_secs(2);

/// Instrument handles by role; `None` when the role is not configured.
#[derive(Clone, Default)]
pub struct Instruments {
    pub analyzer: Option<Arc<dyn FrequencySweepSource>>,
    pub field: Option<Arc<dyn SetpointSource>>,
    pub current: Option<Arc<dyn SetpointSource>>,
    pub meter: Option<Arc<dyn ResistanceMeter>>,
    pub stage: Option<Arc<dyn RotationStage>>,
}

impl Instruments {
    /// Open and initialise every configured instrument over VISA.
    pub async fn connect(settings: &Settings) -> AppResult<Self> {
        let config = &settings.instruments;
        let mut instruments = Self::default();

        if let Some(vna) = &config.vna {
            let driver = E5071C::new("vna", open(vna).await?);
            driver.initialise().await?;
            instruments.analyzer = Some(Arc::new(driver));
        }
        if let Some(smu) = &config.smu {
            let driver = Keithley2400::new("smu", open(&smu.connection()).await?);
            driver
                .setup_four_wire_resistance(smu.compliance_voltage)
                .await?;
            instruments.meter = Some(Arc::new(driver));
        }
        if let Some(source) = &config.current_source {
            let driver = Gs200::new("current_source", open(source).await?);
            driver.initialise().await?;
            instruments.current = Some(Arc::new(driver));
        }
        if let Some(field) = &config.field_controller {
            let driver = Er032m::new("field_controller", open(&field.connection()).await?)
                .with_calibration(field.calibration)
                .with_zero_offset(field.zero_offset_gauss);
            driver.initialise().await?;
            instruments.field = Some(Arc::new(driver));
        }
        if let Some(stage) = &config.rotation_stage {
            let driver = SteppingRotationStage::new("rotation_stage", open(stage).await?);
            let identity = driver.identify().await?;
            info!(instrument = "rotation_stage", "connected to {}", identity.trim());
            instruments.stage = Some(Arc::new(driver));
        }
        Ok(instruments)
    }

    /// Handles onto a simulated lab.
    pub fn from_lab(lab: &SimulatedLab) -> Self {
        Self {
            analyzer: Some(lab.analyzer.clone()),
            field: Some(lab.field.clone()),
            current: Some(lab.current.clone()),
            meter: Some(lab.meter.clone()),
            stage: Some(lab.stage.clone()),
        }
    }
}

async fn open(config: &InstrumentConfig) -> AppResult<Arc<dyn ScpiTransport>> {
    let transport = VisaTransport::builder(&config.resource)
        .with_timeout(config.timeout())
        .with_terminator(&config.terminator)
        .open()
        .await?;
    Ok(Arc::new(transport))
}

fn require<T: ?Sized>(handle: &Option<Arc<T>>, role: &str) -> AppResult<Arc<T>> {
    handle
        .clone()
        .ok_or_else(|| ExpError::config(format!("no {} configured in [instruments]", role)))
}

#[derive(Serialize)]
struct TraceFileMetadata<'a> {
    timestamp: DateTime<Utc>,
    config: &'a TraceConfig,
    background: Option<&'a Path>,
}

pub struct ExperimentSession {
    settings: Settings,
    instruments: Instruments,
    calibration: Option<CalibrationTable>,
    cancel: CancelToken,
    rotation_steps: i64,
}

impl ExperimentSession {
    pub fn new(
        settings: Settings,
        instruments: Instruments,
        calibration: Option<CalibrationTable>,
    ) -> Self {
        Self {
            settings,
            instruments,
            calibration,
            cancel: CancelToken::new(),
            rotation_steps: 0,
        }
    }

    /// Connect to the hardware described by `settings` and load the
    /// thermometer calibration, if one is configured.
    pub async fn connect(settings: Settings) -> AppResult<Self> {
        settings.validate()?;
        let calibration = load_calibration(&settings)?;
        let instruments = Instruments::connect(&settings).await?;
        Ok(Self::new(settings, instruments, calibration))
    }

    /// Session on a fresh simulated lab. Uses the configured calibration file
    /// when there is one, the lab's own table otherwise.
    pub fn simulated(settings: Settings) -> AppResult<Self> {
        settings.validate()?;
        let calibration = match load_calibration(&settings)? {
            Some(table) => table,
            None => SimulatedLab::calibration()?,
        };
        let lab = SimulatedLab::new();
        Ok(Self::new(settings, Instruments::from_lab(&lab), Some(calibration)))
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Token that stops the current operation at its next step boundary.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Steps turned so far, anticlockwise positive.
    pub fn rotation_steps(&self) -> i64 {
        self.rotation_steps
    }

    /// Run a field or current sweep.
    ///
    /// When `save` is set and storage is enabled, records go to a fresh
    /// directory under `storage.output_dir`. A current sweep switches the
    /// source output on beforehand; if that fails the run is reported as
    /// failed at the first set-point. Afterwards the source is returned to zero
    /// (and a current source switched off), except after a safety-limit
    /// abort, which issues no further commands.
    pub async fn run_sweep(
        &self,
        sweep: &SweepConfig,
        trace: &TraceConfig,
        save: bool,
    ) -> AppResult<SweepOutcome> {
        let analyzer = require(&self.instruments.analyzer, "vna")?;
        let source = match sweep.variable {
            SweepVariable::Field => require(&self.instruments.field, "field_controller")?,
            SweepVariable::Current => require(&self.instruments.current, "current_source")?,
        };
        let controller = SweepController::new(source.clone(), analyzer)
            .with_cancel(self.cancel.clone())
            .retain_records(self.settings.storage.retain_records);
        controller.start(sweep, trace)?;

        let mut writer = if save && self.settings.storage.enabled {
            Some(CsvRecordWriter::new(self.run_directory(sweep.variable))?)
        } else {
            None
        };

        if sweep.variable == SweepVariable::Current {
            if let Err(error) = source.set_output(true).await {
                warn!(
                    instrument = %source.name(),
                    kind = %error.kind(),
                    error = %error,
                    "failed to enable output before sweep"
                );
                return_to_rest(source.as_ref()).await;
                return Ok(SweepOutcome {
                    records: Vec::new(),
                    persisted: 0,
                    termination: SweepTermination::Failed(SweepFailure {
                        setpoint: sweep.low,
                        error,
                    }),
                });
            }
            sleep(CURRENT_OUTPUT_SETTLE).await;
        }

        let sink = writer.as_mut().map(|w| w as &mut dyn RecordSink);
        let outcome = controller.run(sweep, trace, sink).await?;

        match outcome.failure() {
            Some(failure) if matches!(failure.error, ExpError::SafetyLimitExceeded { .. }) => {
                warn!(
                    instrument = %source.name(),
                    "safety abort: leaving source at its last applied set-point"
                );
            }
            _ => return_to_rest(source.as_ref()).await,
        }
        Ok(outcome)
    }

    /// Acquire one trace outside a sweep, optionally subtracting a background
    /// loaded from a trace file and saving the result.
    pub async fn acquire_trace(
        &self,
        trace: &TraceConfig,
        background: Option<&Path>,
        output: Option<&Path>,
    ) -> AppResult<Trace> {
        let analyzer = require(&self.instruments.analyzer, "vna")?;
        let background_trace = background.map(read_trace_csv).transpose()?;
        let acquirer = TraceAcquirer::new(analyzer).with_cancel(self.cancel.clone());
        let result = acquirer
            .acquire_with_background(trace, background_trace.as_ref())
            .await?;

        if let Some(path) = output {
            let metadata = TraceFileMetadata {
                timestamp: Utc::now(),
                config: trace,
                background,
            };
            write_trace_csv(path, &result, Some(&metadata))?;
            info!("trace saved to '{}'", path.display());
        }
        Ok(result)
    }

    pub fn thermometer(&self) -> AppResult<ResistanceThermometer> {
        let meter = require(&self.instruments.meter, "smu")?;
        let calibration = self.calibration.clone().ok_or_else(|| {
            ExpError::config("no thermometer.calibration_file configured")
        })?;
        ResistanceThermometer::new(meter, calibration, self.settings.excitation_current())
    }

    pub async fn measure_temperature(&self) -> AppResult<TemperatureSample> {
        let sample = self.thermometer()?.measure().await?;
        info!(
            resistance_ohm = sample.resistance_ohm,
            temperature_k = sample.temperature_k,
            "temperature measured"
        );
        Ok(sample)
    }

    /// Take `samples` temperature readings `interval` apart, appending each
    /// to `log`. Cancellation ends the log early and keeps what was taken.
    pub async fn log_temperature(
        &self,
        every: Duration,
        samples: usize,
        mut log: Option<&mut TemperatureLogWriter>,
    ) -> AppResult<Vec<TemperatureSample>> {
        if every < MIN_LOG_INTERVAL {
            return Err(ExpError::config(format!(
                "logging interval {:?} is shorter than {:?}",
                every, MIN_LOG_INTERVAL
            )));
        }
        if samples == 0 {
            return Err(ExpError::config("temperature log needs at least one sample"));
        }
        let thermometer = self.thermometer()?;

        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut collected = Vec::with_capacity(samples);
        for _ in 0..samples {
            ticker.tick().await;
            if self.cancel.is_cancelled() {
                info!("temperature log cancelled after {} samples", collected.len());
                break;
            }
            let sample = thermometer.measure().await?;
            if let Some(log) = log.as_deref_mut() {
                log.append(&sample)?;
            }
            info!(
                resistance_ohm = sample.resistance_ohm,
                temperature_k = sample.temperature_k,
                "temperature sample {}/{}",
                collected.len() + 1,
                samples
            );
            collected.push(sample);
        }
        Ok(collected)
    }

    /// Turn the stage by `steps` and return the updated global step counter.
    pub async fn rotate(&mut self, steps: u32, direction: RotationDirection) -> AppResult<i64> {
        let stage = require(&self.instruments.stage, "rotation_stage")?;
        stage.set_step_count(steps).await?;
        stage.step(direction).await?;

        let delta = i64::from(steps);
        match direction {
            RotationDirection::Anticlockwise => self.rotation_steps += delta,
            RotationDirection::Clockwise => self.rotation_steps -= delta,
        }
        info!(
            instrument = %stage.name(),
            steps,
            %direction,
            global_steps = self.rotation_steps,
            "rotated"
        );
        Ok(self.rotation_steps)
    }

    fn run_directory(&self, variable: SweepVariable) -> PathBuf {
        self.settings.storage.output_dir.join(format!(
            "{}_sweep_{}",
            variable,
            Utc::now().format("%Y%m%d_%H%M%S")
        ))
    }
}

fn load_calibration(settings: &Settings) -> AppResult<Option<CalibrationTable>> {
    settings
        .thermometer
        .calibration_file
        .as_ref()
        .map(CalibrationTable::from_csv_path)
        .transpose()
}

/// Zero the source and disable its output; failures are only logged.
async fn return_to_rest(source: &dyn SetpointSource) {
    if let Err(err) = source.zero().await {
        warn!(instrument = %source.name(), error = %err, "failed to zero source after sweep");
    }
    if source.variable() == SweepVariable::Current {
        if let Err(err) = source.set_output(false).await {
            warn!(instrument = %source.name(), error = %err, "failed to disable output after sweep");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::sim::SourceCommand;

    fn session(lab: &SimulatedLab, output_dir: &Path) -> ExperimentSession {
        let mut settings = Settings::default();
        settings.storage.output_dir = output_dir.to_path_buf();
        ExperimentSession::new(
            settings,
            Instruments::from_lab(lab),
            Some(SimulatedLab::calibration().unwrap()),
        )
    }

    fn small_trace() -> TraceConfig {
        TraceConfig {
            num_points: 21,
            ..TraceConfig::default()
        }
    }

    fn current_sweep(limit: f64) -> SweepConfig {
        SweepConfig {
            variable: SweepVariable::Current,
            low: 0.0,
            high: 2e-3,
            step: 5e-4,
            hard_limit: limit,
            settle_time_seconds: 8.0,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn current_sweep_brackets_output() {
        let lab = SimulatedLab::new();
        let dir = tempfile::tempdir().unwrap();
        let session = session(&lab, dir.path());

        let outcome = session
            .run_sweep(&current_sweep(0.2), &small_trace(), false)
            .await
            .unwrap();
        assert!(outcome.is_complete());

        let history = lab.current.history();
        assert_eq!(history.first(), Some(&SourceCommand::Output(true)));
        assert_eq!(
            &history[history.len() - 2..],
            &[SourceCommand::Level(0.0), SourceCommand::Output(false)]
        );
        assert_eq!(lab.current.levels().len(), 5);
        assert!(!lab.current.output_enabled());
    }

    #[tokio::test(start_paused = true)]
    async fn safety_abort_sends_nothing_further() {
        let lab = SimulatedLab::new();
        let dir = tempfile::tempdir().unwrap();
        let session = session(&lab, dir.path());

        let outcome = session
            .run_sweep(&current_sweep(8e-4), &small_trace(), false)
            .await
            .unwrap();
        assert_eq!(outcome.failure().unwrap().error.kind(), crate::error::ErrorKind::SafetyLimit);
        assert_eq!(lab.current.levels(), vec![0.0, 5e-4]);
        assert_eq!(lab.current.history().last(), Some(&SourceCommand::Level(5e-4)));
    }

    #[tokio::test(start_paused = true)]
    async fn output_fault_is_reported_at_first_setpoint() {
        let lab = SimulatedLab::new();
        lab.current.fail_after("output", 0);
        let dir = tempfile::tempdir().unwrap();
        let session = session(&lab, dir.path());

        let outcome = session
            .run_sweep(&current_sweep(0.2), &small_trace(), false)
            .await
            .unwrap();
        let failure = outcome.failure().unwrap();
        assert_eq!(failure.setpoint, 0.0);
        assert_eq!(failure.error.kind(), crate::error::ErrorKind::InstrumentFault);
        assert!(outcome.records.is_empty());
        assert_eq!(lab.current.levels(), vec![0.0]);
        assert_eq!(lab.analyzer.trigger_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn field_sweep_returns_to_zero_after_fault() {
        let lab = SimulatedLab::new();
        lab.analyzer.fail_after("read", 2);
        let dir = tempfile::tempdir().unwrap();
        let session = session(&lab, dir.path());
        let sweep = SweepConfig {
            low: 0.0,
            high: 10.0,
            step: 5.0,
            settle_time_seconds: 0.5,
            ..SweepConfig::default()
        };

        let outcome = session.run_sweep(&sweep, &small_trace(), false).await.unwrap();
        assert_eq!(outcome.failure().unwrap().setpoint, 5.0);
        assert_eq!(lab.field.levels(), vec![0.0, 5.0, 0.0]);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_instrument_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = Settings::default();
        settings.storage.output_dir = dir.path().to_path_buf();
        let session = ExperimentSession::new(settings, Instruments::default(), None);

        let result = session
            .run_sweep(&SweepConfig::default(), &small_trace(), false)
            .await;
        assert!(matches!(result, Err(ExpError::Config(_))));
        assert!(matches!(session.measure_temperature().await, Err(ExpError::Config(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn temperature_log_enforces_minimum_interval() {
        let lab = SimulatedLab::new();
        let dir = tempfile::tempdir().unwrap();
        let session = session(&lab, dir.path());

        let result = session
            .log_temperature(Duration::from_secs(1), 3, None)
            .await;
        assert!(matches!(result, Err(ExpError::Config(_))));

        let started = tokio::time::Instant::now();
        let samples = session
            .log_temperature(Duration::from_secs(2), 3, None)
            .await
            .unwrap();
        assert_eq!(samples.len(), 3);
        assert!(started.elapsed() >= Duration::from_secs(4));
        assert!(samples.iter().all(|s| (s.temperature_k - 4.2).abs() < 1e-9));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_temperature_log_stops_before_reading() {
        let lab = SimulatedLab::new();
        let dir = tempfile::tempdir().unwrap();
        let session = session(&lab, dir.path());
        session.cancel_token().cancel();

        let samples = session
            .log_temperature(Duration::from_secs(2), 3, None)
            .await
            .unwrap();
        assert!(samples.is_empty());
        assert_eq!(lab.meter.reading_count(), 0);
    }

    #[tokio::test]
    async fn rotation_tracks_global_steps() {
        let lab = SimulatedLab::new();
        let dir = tempfile::tempdir().unwrap();
        let mut session = session(&lab, dir.path());

        assert_eq!(session.rotate(50, RotationDirection::Anticlockwise).await.unwrap(), 50);
        assert_eq!(session.rotate(20, RotationDirection::Clockwise).await.unwrap(), 30);
        assert_eq!(session.rotation_steps(), 30);
        assert_eq!(lab.stage.position().await.unwrap(), -30);
    }
}
