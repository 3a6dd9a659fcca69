//! Independent-variable sweep with per-step trace acquisition.
//!
//! A sweep walks the half-open progression `low, low + step, ...` (stopping
//! before `high`, or exactly `[low]` when `low == high`). For every set-point:
//!
//! 1. check the cancel token, then the hard limit
//! 2. apply the set-point and wait the fixed settle time
//! 3. acquire a trace
//! 4. emit a [`SweepRecord`], persisted before the next step begins
//!
//! ```text
//! Idle -> Stepping -> (Acquiring -> Recording -> Stepping)* -> Complete
//!   \________\___________\______________________________-> Aborted
//! ```
//!
//! Any failure aborts the run without retry. Records produced before the
//! failure are kept and the failing set-point is reported.

use crate::core::{CancelToken, SweepVariable};
use crate::data::RecordSink;
use crate::error::{AppResult, ExpError};
use crate::instrument::{FrequencySweepSource, SetpointSource};
use crate::measurement::{Trace, TraceAcquirer, TraceConfig};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio::time::{sleep, Duration};
use tracing::{info, warn};

/// Upper bound on the number of set-points in one sweep.
pub const MAX_SETPOINTS: usize = 1_000_000;

/// Range, limit and settle time of one sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    #[serde(alias = "independent_variable")]
    pub variable: SweepVariable,
    pub low: f64,
    pub high: f64,
    pub step: f64,
    pub hard_limit: f64,
    pub settle_time_seconds: f64,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            variable: SweepVariable::Field,
            low: 0.0,
            high: 301.0,
            step: 2.0,
            hard_limit: 20002.0,
            settle_time_seconds: 10.0,
        }
    }
}

impl SweepConfig {
    pub fn validate(&self) -> AppResult<()> {
        let values = [
            self.low,
            self.high,
            self.step,
            self.hard_limit,
            self.settle_time_seconds,
        ];
        if values.iter().any(|v| !v.is_finite()) {
            return Err(ExpError::config("sweep parameters must be finite"));
        }
        if self.low > self.high {
            return Err(ExpError::config(format!(
                "sweep low {} exceeds high {}",
                self.low, self.high
            )));
        }
        if self.step <= 0.0 {
            return Err(ExpError::config(format!(
                "sweep step {} must be positive",
                self.step
            )));
        }
        if self.settle_time_seconds < 0.0 {
            return Err(ExpError::config("settle time must not be negative"));
        }
        Duration::try_from_secs_f64(self.settle_time_seconds).map_err(|e| {
            ExpError::config(format!(
                "settle time {} s is not a valid duration: {}",
                self.settle_time_seconds, e
            ))
        })?;
        let count = self.point_count();
        if count > MAX_SETPOINTS {
            return Err(ExpError::config(format!(
                "sweep has {} set-points, more than {}",
                count, MAX_SETPOINTS
            )));
        }
        Ok(())
    }

    /// Set-points in order. Not checked against the hard limit; that happens
    /// one step at a time during the run.
    pub fn setpoints(&self) -> AppResult<Vec<f64>> {
        self.validate()?;
        Ok((0..self.point_count())
            .map(|i| self.low + i as f64 * self.step)
            .collect())
    }

    pub fn settle_time(&self) -> AppResult<Duration> {
        self.validate()?;
        Ok(Duration::from_secs_f64(self.settle_time_seconds))
    }

    fn point_count(&self) -> usize {
        let span = self.high - self.low;
        if span <= 0.0 {
            return 1;
        }
        let exact = span / self.step;
        // Absorb rounding so that e.g. 0..0.3 by 0.1 stops before 0.3.
        (exact - 1e-9 * exact.max(1.0)).ceil().max(1.0) as usize
    }
}

/// Controller state; see the module docs for transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepState {
    Idle,
    Stepping,
    Acquiring,
    Recording,
    Complete,
    Aborted,
}

/// One measured step. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SweepRecord {
    variable: SweepVariable,
    setpoint: f64,
    trace: Trace,
    timestamp: DateTime<Utc>,
}

impl SweepRecord {
    pub fn new(variable: SweepVariable, setpoint: f64, trace: Trace) -> Self {
        Self {
            variable,
            setpoint,
            trace,
            timestamp: Utc::now(),
        }
    }

    pub fn variable(&self) -> SweepVariable {
        self.variable
    }

    pub fn setpoint(&self) -> f64 {
        self.setpoint
    }

    pub fn trace(&self) -> &Trace {
        &self.trace
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// File-name friendly label, e.g. `B_12.000`.
    pub fn label(&self) -> String {
        self.variable.label(self.setpoint)
    }
}

/// Why and where a run stopped early.
#[derive(Debug)]
pub struct SweepFailure {
    pub setpoint: f64,
    pub error: ExpError,
}

#[derive(Debug)]
pub enum SweepTermination {
    Completed,
    Failed(SweepFailure),
}

/// Result of [`SweepController::run`]: the records produced and how the run
/// ended.
#[derive(Debug)]
pub struct SweepOutcome {
    /// Records kept in memory; empty when retention is disabled.
    pub records: Vec<SweepRecord>,
    /// Records accepted by the sink.
    pub persisted: usize,
    pub termination: SweepTermination,
}

impl SweepOutcome {
    pub fn is_complete(&self) -> bool {
        matches!(self.termination, SweepTermination::Completed)
    }

    pub fn failure(&self) -> Option<&SweepFailure> {
        match &self.termination {
            SweepTermination::Completed => None,
            SweepTermination::Failed(failure) => Some(failure),
        }
    }

    pub fn into_result(self) -> AppResult<Vec<SweepRecord>> {
        match self.termination {
            SweepTermination::Completed => Ok(self.records),
            SweepTermination::Failed(failure) => Err(failure.error),
        }
    }
}

/// Drives one set-point source and one analyzer through a sweep.
pub struct SweepController {
    source: Arc<dyn SetpointSource>,
    analyzer: Arc<dyn FrequencySweepSource>,
    cancel: CancelToken,
    background: Option<Trace>,
    retain_records: bool,
}

impl SweepController {
    pub fn new(source: Arc<dyn SetpointSource>, analyzer: Arc<dyn FrequencySweepSource>) -> Self {
        Self {
            source,
            analyzer,
            cancel: CancelToken::new(),
            background: None,
            retain_records: true,
        }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Subtract `background` from every acquired trace.
    pub fn with_background(mut self, background: Trace) -> Self {
        self.background = Some(background);
        self
    }

    /// Keep records in [`SweepOutcome::records`] after they were persisted.
    pub fn retain_records(mut self, retain: bool) -> Self {
        self.retain_records = retain;
        self
    }

    /// Validate both configurations and return a lazy run positioned before
    /// the first set-point. No instrument command is issued here.
    pub fn start(&self, sweep: &SweepConfig, trace: &TraceConfig) -> AppResult<SweepRun<'_>> {
        let setpoints = sweep.setpoints()?;
        trace.validate()?;
        if self.source.variable() != sweep.variable {
            return Err(ExpError::config(format!(
                "sweep over {} cannot drive '{}', which sources {}",
                sweep.variable,
                self.source.name(),
                self.source.variable()
            )));
        }

        Ok(SweepRun {
            controller: self,
            acquirer: TraceAcquirer::new(self.analyzer.clone()).with_cancel(self.cancel.clone()),
            sweep: sweep.clone(),
            trace: trace.clone(),
            setpoints,
            next: 0,
            state: SweepState::Idle,
        })
    }

    /// Run the whole sweep, writing each record to `sink` before the next
    /// step.
    ///
    /// Returns `Err` only for invalid configuration; instrument, safety,
    /// storage and cancellation failures end up in
    /// [`SweepOutcome::termination`] together with the records produced so
    /// far.
    pub async fn run(
        &self,
        sweep: &SweepConfig,
        trace: &TraceConfig,
        mut sink: Option<&mut (dyn RecordSink + '_)>,
    ) -> AppResult<SweepOutcome> {
        let mut run = self.start(sweep, trace)?;
        let started = Instant::now();
        let mut records = Vec::new();
        let mut persisted = 0;

        let termination = loop {
            let setpoint = run.pending_setpoint();
            let record = match run.next_record().await {
                None => break SweepTermination::Completed,
                Some(Ok(record)) => record,
                Some(Err(error)) => {
                    break SweepTermination::Failed(SweepFailure {
                        setpoint: setpoint.unwrap_or(f64::NAN),
                        error,
                    })
                }
            };

            if let Some(sink) = sink.as_deref_mut() {
                if let Err(error) = sink.write_record(&record).await {
                    run.abort();
                    break SweepTermination::Failed(SweepFailure {
                        setpoint: record.setpoint(),
                        error,
                    });
                }
                persisted += 1;
            }
            if self.retain_records {
                records.push(record);
            }
        };

        if let Some(sink) = sink.as_deref_mut() {
            if let Err(err) = sink.finish().await {
                warn!(error = %err, "record sink failed to finish");
            }
        }

        match &termination {
            SweepTermination::Completed => info!(
                variable = %sweep.variable,
                points = run.completed(),
                elapsed_s = started.elapsed().as_secs_f64(),
                "sweep complete"
            ),
            SweepTermination::Failed(failure) => warn!(
                variable = %sweep.variable,
                setpoint = failure.setpoint,
                kind = %failure.error.kind(),
                error = %failure.error,
                "sweep aborted"
            ),
        }

        Ok(SweepOutcome {
            records,
            persisted,
            termination,
        })
    }
}

/// A sweep in progress, advanced one set-point per [`SweepRun::next_record`].
///
/// Runs cannot be resumed after `Aborted`; start a new one instead.
pub struct SweepRun<'a> {
    controller: &'a SweepController,
    acquirer: TraceAcquirer,
    sweep: SweepConfig,
    trace: TraceConfig,
    setpoints: Vec<f64>,
    next: usize,
    state: SweepState,
}

impl SweepRun<'_> {
    pub fn state(&self) -> SweepState {
        self.state
    }

    pub fn setpoints(&self) -> &[f64] {
        &self.setpoints
    }

    /// Set-point the next call to [`SweepRun::next_record`] will handle.
    pub fn pending_setpoint(&self) -> Option<f64> {
        match self.state {
            SweepState::Complete | SweepState::Aborted => None,
            _ => self.setpoints.get(self.next).copied(),
        }
    }

    /// Number of records produced so far.
    pub fn completed(&self) -> usize {
        self.next
    }

    /// Stop the run; later calls to [`SweepRun::next_record`] return `None`.
    pub fn abort(&mut self) {
        self.state = SweepState::Aborted;
    }

    /// Measure the next set-point. `None` once the run is complete or
    /// aborted.
    pub async fn next_record(&mut self) -> Option<AppResult<SweepRecord>> {
        if matches!(self.state, SweepState::Complete | SweepState::Aborted) {
            return None;
        }
        let Some(&setpoint) = self.setpoints.get(self.next) else {
            self.state = SweepState::Complete;
            return None;
        };

        match self.step(setpoint).await {
            Ok(record) => {
                self.next += 1;
                self.state = SweepState::Recording;
                Some(Ok(record))
            }
            Err(err) => {
                self.state = SweepState::Aborted;
                Some(Err(err))
            }
        }
    }

    async fn step(&mut self, setpoint: f64) -> AppResult<SweepRecord> {
        self.state = SweepState::Stepping;
        self.controller.cancel.check()?;
        if setpoint > self.sweep.hard_limit {
            return Err(ExpError::SafetyLimitExceeded {
                setpoint,
                limit: self.sweep.hard_limit,
            });
        }

        let variable = self.sweep.variable;
        info!(
            variable = %variable,
            setpoint,
            unit = variable.unit(),
            step = self.next + 1,
            of = self.setpoints.len(),
            "applying set-point"
        );
        let settle = self.sweep.settle_time()?;
        self.controller.source.set_level(setpoint).await?;
        sleep(settle).await;

        self.state = SweepState::Acquiring;
        let trace = self
            .acquirer
            .acquire_with_background(&self.trace, self.controller.background.as_ref())
            .await?;
        Ok(SweepRecord::new(variable, setpoint, trace))
    }
}
