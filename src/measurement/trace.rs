//! Frequency-domain trace acquisition.
//!
//! A [`TraceAcquirer`] runs one deterministic, fully averaged sweep:
//!
//! 1. suspend the analyzer's free-running trigger
//! 2. push the [`TraceConfig`]
//! 3. clear the average and issue `averages` acknowledged single triggers
//! 4. read magnitude (trace 1) and phase (trace 2)
//! 5. resume the free-running trigger
//!
//! Resuming is attempted even when steps 2-4 fail; the original error is the
//! one returned. The frequency axis is never read from the instrument, it is
//! the linear spacing used to configure it.

use crate::core::{linspace, CancelToken};
use crate::error::{AppResult, ExpError};
use crate::instrument::e5071c::{AVERAGES_RANGE, BANDWIDTH_RANGE_HZ, MAX_POINTS, POWER_RANGE_DBM};
use crate::instrument::{ensure_in_range, FrequencySweepSource, TraceChannel};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Scattering parameter measured on both traces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SParameter {
    S11,
    S12,
    S21,
    S22,
}

impl SParameter {
    pub fn as_str(&self) -> &'static str {
        match self {
            SParameter::S11 => "S11",
            SParameter::S12 => "S12",
            SParameter::S21 => "S21",
            SParameter::S22 => "S22",
        }
    }
}

impl fmt::Display for SParameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SParameter {
    type Err = ExpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().trim_matches('"').to_ascii_uppercase().as_str() {
            "S11" => Ok(SParameter::S11),
            "S12" => Ok(SParameter::S12),
            "S21" => Ok(SParameter::S21),
            "S22" => Ok(SParameter::S22),
            other => Err(ExpError::config(format!("unknown S-parameter '{}'", other))),
        }
    }
}

/// Settings for one frequency sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TraceConfig {
    pub start_freq: f64,
    pub stop_freq: f64,
    pub num_points: usize,
    pub bandwidth_hz: f64,
    pub averages: u32,
    pub selected_parameter: SParameter,
    /// Source power; left unchanged on the instrument when unset.
    pub power_dbm: Option<f64>,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            start_freq: 7e9,
            stop_freq: 8e9,
            num_points: 2001,
            bandwidth_hz: 1000.0,
            averages: 1,
            selected_parameter: SParameter::S21,
            power_dbm: None,
        }
    }
}

impl TraceConfig {
    pub fn validate(&self) -> AppResult<()> {
        if !self.start_freq.is_finite() || !self.stop_freq.is_finite() {
            return Err(ExpError::config("trace frequencies must be finite"));
        }
        if self.start_freq <= 0.0 {
            return Err(ExpError::config(format!(
                "start frequency {} Hz must be positive",
                self.start_freq
            )));
        }
        if self.start_freq >= self.stop_freq {
            return Err(ExpError::config(format!(
                "start frequency {} Hz must be below stop frequency {} Hz",
                self.start_freq, self.stop_freq
            )));
        }
        if self.num_points == 0 || self.num_points > MAX_POINTS {
            return Err(ExpError::config(format!(
                "point count {} outside [1, {}]",
                self.num_points, MAX_POINTS
            )));
        }
        if self.averages < AVERAGES_RANGE.0 || self.averages > AVERAGES_RANGE.1 {
            return Err(ExpError::config(format!(
                "average count {} outside [{}, {}]",
                self.averages, AVERAGES_RANGE.0, AVERAGES_RANGE.1
            )));
        }
        ensure_in_range(
            "trace",
            "bandwidth_hz",
            self.bandwidth_hz,
            BANDWIDTH_RANGE_HZ.0,
            BANDWIDTH_RANGE_HZ.1,
        )?;
        if let Some(power) = self.power_dbm {
            ensure_in_range("trace", "power_dbm", power, POWER_RANGE_DBM.0, POWER_RANGE_DBM.1)?;
        }
        if self.frequencies().windows(2).any(|w| w[0] >= w[1]) {
            return Err(ExpError::config(format!(
                "span {} Hz to {} Hz is too narrow for {} distinct points",
                self.start_freq, self.stop_freq, self.num_points
            )));
        }
        Ok(())
    }

    /// Linear frequency axis the analyzer is configured with.
    pub fn frequencies(&self) -> Vec<f64> {
        linspace(self.start_freq, self.stop_freq, self.num_points)
    }
}

/// Magnitude and phase against an ascending frequency axis, all of equal
/// length.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trace {
    frequencies: Vec<f64>,
    magnitude: Vec<f64>,
    phase: Vec<f64>,
}

impl Trace {
    pub fn new(frequencies: Vec<f64>, magnitude: Vec<f64>, phase: Vec<f64>) -> AppResult<Self> {
        if magnitude.len() != frequencies.len() || phase.len() != frequencies.len() {
            return Err(ExpError::config(format!(
                "trace arrays differ in length: {} frequencies, {} magnitude, {} phase",
                frequencies.len(),
                magnitude.len(),
                phase.len()
            )));
        }
        if frequencies.windows(2).any(|w| w[0] >= w[1]) {
            return Err(ExpError::config("trace frequencies must be strictly ascending"));
        }
        Ok(Self {
            frequencies,
            magnitude,
            phase,
        })
    }

    /// Frequencies in Hz.
    pub fn frequencies(&self) -> &[f64] {
        &self.frequencies
    }

    /// Magnitude in dB.
    pub fn magnitude(&self) -> &[f64] {
        &self.magnitude
    }

    /// Phase in degrees.
    pub fn phase(&self) -> &[f64] {
        &self.phase
    }

    pub fn len(&self) -> usize {
        self.frequencies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frequencies.is_empty()
    }

    /// Subtract `background` from the magnitude, point by point.
    pub fn subtract_background(&mut self, background: &Trace) -> AppResult<()> {
        check_background_axis(background, &self.frequencies)?;
        for (m, b) in self.magnitude.iter_mut().zip(&background.magnitude) {
            *m -= b;
        }
        Ok(())
    }
}

/// A background is usable only on the same frequency axis.
fn check_background_axis(background: &Trace, frequencies: &[f64]) -> AppResult<()> {
    if background.len() != frequencies.len() {
        return Err(ExpError::config(format!(
            "background has {} points, trace has {}",
            background.len(),
            frequencies.len()
        )));
    }
    let same_axis = background
        .frequencies
        .iter()
        .zip(frequencies)
        .all(|(a, b)| (a - b).abs() <= 1e-9 * b.abs().max(1.0));
    if !same_axis {
        return Err(ExpError::config(
            "background frequency axis does not match the trace",
        ));
    }
    Ok(())
}

/// Runs averaged sweeps on one analyzer.
pub struct TraceAcquirer {
    analyzer: Arc<dyn FrequencySweepSource>,
    cancel: CancelToken,
}

impl TraceAcquirer {
    pub fn new(analyzer: Arc<dyn FrequencySweepSource>) -> Self {
        Self {
            analyzer,
            cancel: CancelToken::new(),
        }
    }

    /// Check `cancel` before every averaging trigger.
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn analyzer_name(&self) -> &str {
        self.analyzer.name()
    }

    pub async fn acquire(&self, config: &TraceConfig) -> AppResult<Trace> {
        self.acquire_with_background(config, None).await
    }

    /// Acquire a trace and subtract `background` from its magnitude.
    ///
    /// Configuration and background are validated before the analyzer is
    /// touched.
    pub async fn acquire_with_background(
        &self,
        config: &TraceConfig,
        background: Option<&Trace>,
    ) -> AppResult<Trace> {
        config.validate()?;
        let frequencies = config.frequencies();
        if let Some(background) = background {
            check_background_axis(background, &frequencies)?;
        }

        let started = Instant::now();
        self.analyzer.suspend_continuous_trigger().await?;
        let sweep = self.sweep_and_read(config).await;
        let resumed = self.analyzer.resume_continuous_trigger().await;

        let (magnitude, phase) = match (sweep, resumed) {
            (Ok(data), Ok(())) => data,
            (Ok(_), Err(err)) => return Err(err),
            (Err(err), Ok(())) => return Err(err),
            (Err(err), Err(cleanup)) => {
                warn!(
                    instrument = %self.analyzer.name(),
                    error = %cleanup,
                    "failed to resume continuous trigger after aborted sweep"
                );
                return Err(err);
            }
        };

        let mut trace = Trace::new(frequencies, magnitude, phase)?;
        if let Some(background) = background {
            trace.subtract_background(background)?;
        }

        info!(
            instrument = %self.analyzer.name(),
            points = trace.len(),
            averages = config.averages,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "trace acquired"
        );
        Ok(trace)
    }

    async fn sweep_and_read(&self, config: &TraceConfig) -> AppResult<(Vec<f64>, Vec<f64>)> {
        self.analyzer.configure_sweep(config).await?;
        self.analyzer.clear_average().await?;
        for n in 1..=config.averages {
            self.cancel.check()?;
            self.analyzer.trigger_single().await?;
            debug!(instrument = %self.analyzer.name(), "sweep {}/{} complete", n, config.averages);
        }
        let magnitude = self.read_exact(TraceChannel::Magnitude, config.num_points).await?;
        let phase = self.read_exact(TraceChannel::Phase, config.num_points).await?;
        Ok((magnitude, phase))
    }

    async fn read_exact(&self, channel: TraceChannel, points: usize) -> AppResult<Vec<f64>> {
        let values = self.analyzer.read_channel(channel).await?;
        if values.len() != points {
            return Err(ExpError::protocol(
                self.analyzer.name(),
                format!(
                    "trace {} returned {} values, expected {}",
                    channel.index(),
                    values.len(),
                    points
                ),
            ));
        }
        Ok(values)
    }
}
