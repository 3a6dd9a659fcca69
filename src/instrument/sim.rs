//! Simulated instruments
//!
//! In-memory implementations of every capability trait, used by `expctl
//! --simulate` and by the test suites. All of them are deterministic.
//!
//! # Available simulations
//!
//! - `SimulatedAnalyzer` - network analyzer showing a Lorentzian resonance
//!   whose centre shifts with the level of the sources it is coupled to
//! - `SimulatedSource` - field or current source with a command history
//! - `SimulatedResistanceMeter` - four-wire ohmmeter with polarity-dependent
//!   readings (thermoelectric offset)
//! - `SimulatedRotationStage` - stepper stage with a position counter
//! - `SimulatedLab` - one of each, wired together
//!
//! Every simulation supports fault injection by operation name, so tests can
//! make e.g. the third trigger fail.
//!
//! # Timing
//!
//! - Analyzer: 20ms per triggered sweep
//! - Sources and meters: immediate

use super::capabilities::{
    FrequencySweepSource, ResistanceMeter, RotationDirection, RotationStage, SetpointSource,
    TraceChannel,
};
use crate::core::SweepVariable;
use crate::error::{AppResult, ExpError};
use crate::measurement::{CalibrationTable, TraceConfig};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::{sleep, Duration};

/// Shared handle to a simulated source's applied level.
pub type LevelHandle = Arc<RwLock<f64>>;

// =============================================================================
// Fault injection
// =============================================================================

/// Per-operation failure plan shared by all simulations.
#[derive(Default)]
struct FaultPlan {
    /// operation -> successful calls still allowed before it starts failing
    remaining: Mutex<HashMap<String, u32>>,
}

impl FaultPlan {
    fn fail_after(&self, operation: &str, successes: u32) {
        self.remaining.lock().insert(operation.to_string(), successes);
    }

    fn clear(&self) {
        self.remaining.lock().clear();
    }

    fn check(&self, instrument: &str, operation: &str) -> AppResult<()> {
        let mut remaining = self.remaining.lock();
        match remaining.get_mut(operation) {
            Some(0) => Err(ExpError::instrument(
                instrument,
                format!("simulated fault in {}", operation),
            )),
            Some(n) => {
                *n -= 1;
                Ok(())
            }
            None => Ok(()),
        }
    }
}

// =============================================================================
// SimulatedAnalyzer
// =============================================================================

/// Resonance shape of the simulated device under test.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Resonance {
    /// Centre frequency at zero applied level, Hz.
    pub centre_hz: f64,
    /// Full width at half maximum, Hz.
    pub linewidth_hz: f64,
    /// Dip depth below the baseline, dB.
    pub depth_db: f64,
    /// Off-resonance transmission, dB.
    pub baseline_db: f64,
}

impl Default for Resonance {
    fn default() -> Self {
        Self {
            centre_hz: 7.5e9,
            linewidth_hz: 2e6,
            depth_db: 20.0,
            baseline_db: -3.0,
        }
    }
}

impl Resonance {
    fn magnitude_db(&self, frequency: f64, centre: f64) -> f64 {
        let x = 2.0 * (frequency - centre) / self.linewidth_hz;
        self.baseline_db - self.depth_db / (1.0 + x * x)
    }

    fn phase_deg(&self, frequency: f64, centre: f64) -> f64 {
        let x = 2.0 * (frequency - centre) / self.linewidth_hz;
        -x.atan().to_degrees()
    }
}

/// Simulated network analyzer
///
/// The resonance centre is `centre_hz + sum(level * shift)` over all coupled
/// sources, evaluated when a sweep is triggered.
pub struct SimulatedAnalyzer {
    name: String,
    resonance: Resonance,
    couplings: Vec<(LevelHandle, f64)>,
    sweep_time: Duration,
    config: Mutex<Option<TraceConfig>>,
    data: Mutex<Option<(Vec<f64>, Vec<f64>)>>,
    continuous: Mutex<bool>,
    triggers: Mutex<u32>,
    short_read: Mutex<Option<usize>>,
    faults: FaultPlan,
}

impl SimulatedAnalyzer {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            resonance: Resonance::default(),
            couplings: Vec::new(),
            sweep_time: Duration::from_millis(20),
            config: Mutex::new(None),
            data: Mutex::new(None),
            continuous: Mutex::new(true),
            triggers: Mutex::new(0),
            short_read: Mutex::new(None),
            faults: FaultPlan::default(),
        }
    }

    pub fn with_resonance(mut self, resonance: Resonance) -> Self {
        self.resonance = resonance;
        self
    }

    /// Shift the resonance by `hz_per_unit` for every unit of `level`.
    pub fn coupled_to(mut self, level: LevelHandle, hz_per_unit: f64) -> Self {
        self.couplings.push((level, hz_per_unit));
        self
    }

    pub fn with_sweep_time(mut self, sweep_time: Duration) -> Self {
        self.sweep_time = sweep_time;
        self
    }

    /// Fail `operation` after `successes` more successful calls. Operations:
    /// `suspend`, `resume`, `configure`, `clear_average`, `trigger`, `read`.
    pub fn fail_after(&self, operation: &str, successes: u32) {
        self.faults.fail_after(operation, successes);
    }

    pub fn clear_faults(&self) {
        self.faults.clear();
    }

    /// Return only `points` values from every channel read.
    pub fn truncate_reads_to(&self, points: usize) {
        *self.short_read.lock() = Some(points);
    }

    pub fn is_continuous(&self) -> bool {
        *self.continuous.lock()
    }

    /// Total single-sweep triggers since creation.
    pub fn trigger_count(&self) -> u32 {
        *self.triggers.lock()
    }

    pub fn current_centre_hz(&self) -> f64 {
        self.resonance.centre_hz
            + self
                .couplings
                .iter()
                .map(|(level, shift)| *level.read() * shift)
                .sum::<f64>()
    }
}

#[async_trait]
impl FrequencySweepSource for SimulatedAnalyzer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn suspend_continuous_trigger(&self) -> AppResult<()> {
        self.faults.check(&self.name, "suspend")?;
        *self.continuous.lock() = false;
        Ok(())
    }

    async fn resume_continuous_trigger(&self) -> AppResult<()> {
        self.faults.check(&self.name, "resume")?;
        *self.continuous.lock() = true;
        Ok(())
    }

    async fn configure_sweep(&self, config: &TraceConfig) -> AppResult<()> {
        self.faults.check(&self.name, "configure")?;
        *self.config.lock() = Some(config.clone());
        *self.data.lock() = None;
        Ok(())
    }

    async fn clear_average(&self) -> AppResult<()> {
        self.faults.check(&self.name, "clear_average")?;
        *self.data.lock() = None;
        Ok(())
    }

    async fn trigger_single(&self) -> AppResult<()> {
        self.faults.check(&self.name, "trigger")?;
        let config = self
            .config
            .lock()
            .clone()
            .ok_or_else(|| ExpError::instrument(&self.name, "triggered before configuration"))?;

        sleep(self.sweep_time).await;

        let centre = self.current_centre_hz();
        let frequencies = config.frequencies();
        let magnitude = frequencies
            .iter()
            .map(|&f| self.resonance.magnitude_db(f, centre))
            .collect();
        let phase = frequencies
            .iter()
            .map(|&f| self.resonance.phase_deg(f, centre))
            .collect();
        *self.data.lock() = Some((magnitude, phase));
        *self.triggers.lock() += 1;
        Ok(())
    }

    async fn read_channel(&self, channel: TraceChannel) -> AppResult<Vec<f64>> {
        self.faults.check(&self.name, "read")?;
        let data = self.data.lock();
        let (magnitude, phase) = data
            .as_ref()
            .ok_or_else(|| ExpError::instrument(&self.name, "no sweep data available"))?;
        let mut values = match channel {
            TraceChannel::Magnitude => magnitude.clone(),
            TraceChannel::Phase => phase.clone(),
        };
        if let Some(points) = *self.short_read.lock() {
            values.truncate(points);
        }
        Ok(values)
    }
}

// =============================================================================
// SimulatedSource
// =============================================================================

/// Command received by a [`SimulatedSource`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SourceCommand {
    Level(f64),
    Output(bool),
}

/// Simulated field or current source
pub struct SimulatedSource {
    name: String,
    variable: SweepVariable,
    level: LevelHandle,
    output: Mutex<bool>,
    history: Mutex<Vec<SourceCommand>>,
    faults: FaultPlan,
}

impl SimulatedSource {
    pub fn new(name: impl Into<String>, variable: SweepVariable) -> Self {
        Self {
            name: name.into(),
            variable,
            level: Arc::new(RwLock::new(0.0)),
            output: Mutex::new(false),
            history: Mutex::new(Vec::new()),
            faults: FaultPlan::default(),
        }
    }

    /// Applied level, shared with coupled analyzers.
    pub fn level_handle(&self) -> LevelHandle {
        self.level.clone()
    }

    pub fn applied_level(&self) -> f64 {
        *self.level.read()
    }

    pub fn output_enabled(&self) -> bool {
        *self.output.lock()
    }

    pub fn history(&self) -> Vec<SourceCommand> {
        self.history.lock().clone()
    }

    /// Every level commanded, in order.
    pub fn levels(&self) -> Vec<f64> {
        self.history
            .lock()
            .iter()
            .filter_map(|cmd| match cmd {
                SourceCommand::Level(v) => Some(*v),
                SourceCommand::Output(_) => None,
            })
            .collect()
    }

    pub fn clear_history(&self) {
        self.history.lock().clear();
    }

    /// Fail `operation` (`set_level`, `level` or `output`) after `successes`
    /// more successful calls.
    pub fn fail_after(&self, operation: &str, successes: u32) {
        self.faults.fail_after(operation, successes);
    }

    pub fn clear_faults(&self) {
        self.faults.clear();
    }
}

#[async_trait]
impl SetpointSource for SimulatedSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn variable(&self) -> SweepVariable {
        self.variable
    }

    async fn set_level(&self, value: f64) -> AppResult<()> {
        self.faults.check(&self.name, "set_level")?;
        *self.level.write() = value;
        self.history.lock().push(SourceCommand::Level(value));
        Ok(())
    }

    async fn level(&self) -> AppResult<f64> {
        self.faults.check(&self.name, "level")?;
        Ok(self.applied_level())
    }

    async fn set_output(&self, enabled: bool) -> AppResult<()> {
        self.faults.check(&self.name, "output")?;
        *self.output.lock() = enabled;
        self.history.lock().push(SourceCommand::Output(enabled));
        Ok(())
    }
}

// =============================================================================
// SimulatedResistanceMeter
// =============================================================================

/// Simulated four-wire ohmmeter
///
/// Returns `positive_ohm` while sourcing a positive current and
/// `negative_ohm` while sourcing a negative one. Reading with the output off
/// is an instrument fault.
pub struct SimulatedResistanceMeter {
    name: String,
    positive_ohm: Mutex<f64>,
    negative_ohm: Mutex<f64>,
    current: Mutex<f64>,
    output: Mutex<bool>,
    readings: Mutex<u32>,
    faults: FaultPlan,
}

impl SimulatedResistanceMeter {
    pub fn new(name: impl Into<String>, positive_ohm: f64, negative_ohm: f64) -> Self {
        Self {
            name: name.into(),
            positive_ohm: Mutex::new(positive_ohm),
            negative_ohm: Mutex::new(negative_ohm),
            current: Mutex::new(0.0),
            output: Mutex::new(false),
            readings: Mutex::new(0),
            faults: FaultPlan::default(),
        }
    }

    pub fn set_resistances(&self, positive_ohm: f64, negative_ohm: f64) {
        *self.positive_ohm.lock() = positive_ohm;
        *self.negative_ohm.lock() = negative_ohm;
    }

    pub fn output_enabled(&self) -> bool {
        *self.output.lock()
    }

    pub fn reading_count(&self) -> u32 {
        *self.readings.lock()
    }

    /// Fail `operation` (`source`, `output` or `read`) after `successes`
    /// more successful calls.
    pub fn fail_after(&self, operation: &str, successes: u32) {
        self.faults.fail_after(operation, successes);
    }
}

#[async_trait]
impl ResistanceMeter for SimulatedResistanceMeter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn set_source_current(&self, amps: f64) -> AppResult<()> {
        self.faults.check(&self.name, "source")?;
        *self.current.lock() = amps;
        Ok(())
    }

    async fn set_output(&self, enabled: bool) -> AppResult<()> {
        self.faults.check(&self.name, "output")?;
        *self.output.lock() = enabled;
        Ok(())
    }

    async fn read_resistance(&self) -> AppResult<f64> {
        self.faults.check(&self.name, "read")?;
        if !*self.output.lock() {
            return Err(ExpError::instrument(&self.name, "read with output disabled"));
        }
        *self.readings.lock() += 1;
        if *self.current.lock() >= 0.0 {
            Ok(*self.positive_ohm.lock())
        } else {
            Ok(*self.negative_ohm.lock())
        }
    }
}

// =============================================================================
// SimulatedRotationStage
// =============================================================================

/// Simulated stepper stage; the controller counts clockwise steps as positive.
pub struct SimulatedRotationStage {
    name: String,
    step_count: Mutex<u32>,
    position: Mutex<i64>,
    faults: FaultPlan,
}

impl SimulatedRotationStage {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            step_count: Mutex::new(0),
            position: Mutex::new(0),
            faults: FaultPlan::default(),
        }
    }

    pub fn fail_after(&self, operation: &str, successes: u32) {
        self.faults.fail_after(operation, successes);
    }
}

#[async_trait]
impl RotationStage for SimulatedRotationStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn set_step_count(&self, steps: u32) -> AppResult<()> {
        self.faults.check(&self.name, "set_step_count")?;
        *self.step_count.lock() = steps;
        Ok(())
    }

    async fn step(&self, direction: RotationDirection) -> AppResult<()> {
        self.faults.check(&self.name, "step")?;
        let steps = i64::from(*self.step_count.lock());
        let mut position = self.position.lock();
        match direction {
            RotationDirection::Clockwise => *position += steps,
            RotationDirection::Anticlockwise => *position -= steps,
        }
        Ok(())
    }

    async fn position(&self) -> AppResult<i64> {
        self.faults.check(&self.name, "position")?;
        Ok(*self.position.lock())
    }

    async fn reset_position(&self) -> AppResult<()> {
        self.faults.check(&self.name, "reset")?;
        *self.position.lock() = 0;
        Ok(())
    }
}

// =============================================================================
// SimulatedLab
// =============================================================================

/// Resonance shift per gauss of applied field.
pub const FIELD_SHIFT_HZ_PER_GAUSS: f64 = 50e3;
/// Resonance shift per ampere through the sample line.
pub const CURRENT_SHIFT_HZ_PER_AMP: f64 = 1e8;

/// One of every simulated instrument, with the analyzer coupled to both
/// sources.
pub struct SimulatedLab {
    pub analyzer: Arc<SimulatedAnalyzer>,
    pub field: Arc<SimulatedSource>,
    pub current: Arc<SimulatedSource>,
    pub meter: Arc<SimulatedResistanceMeter>,
    pub stage: Arc<SimulatedRotationStage>,
}

impl SimulatedLab {
    pub fn new() -> Self {
        let field = Arc::new(SimulatedSource::new("field_controller", SweepVariable::Field));
        let current = Arc::new(SimulatedSource::new("current_source", SweepVariable::Current));
        let analyzer = Arc::new(
            SimulatedAnalyzer::new("vna")
                .coupled_to(field.level_handle(), FIELD_SHIFT_HZ_PER_GAUSS)
                .coupled_to(current.level_handle(), CURRENT_SHIFT_HZ_PER_AMP),
        );
        Self {
            analyzer,
            field,
            current,
            meter: Arc::new(SimulatedResistanceMeter::new("smu", 1005.0, 995.0)),
            stage: Arc::new(SimulatedRotationStage::new("rotation_stage")),
        }
    }

    /// RuOx-like calibration: resistance rises as the sample cools.
    /// The default meter readings average to 1000 Ω, i.e. 4.2 K.
    pub fn calibration() -> AppResult<CalibrationTable> {
        CalibrationTable::new(vec![
            (100.0, 300.0),
            (200.0, 77.0),
            (500.0, 20.0),
            (1000.0, 4.2),
            (2000.0, 1.5),
            (5000.0, 0.3),
        ])
    }
}

impl Default for SimulatedLab {
    fn default() -> Self {
        Self::new()
    }
}
