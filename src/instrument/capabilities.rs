//! Static capability interfaces, one per instrument role.
//!
//! Each trait covers exactly what the sweep and measurement layers need from
//! an instrument kind. Drivers implement them over a [`super::ScpiChannel`];
//! the simulated lab implements them in memory.

use crate::core::SweepVariable;
use crate::error::{AppResult, ExpError};
use crate::measurement::TraceConfig;
use async_trait::async_trait;
use std::fmt;
use std::str::FromStr;

/// Formatted data slot on the network analyzer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceChannel {
    /// Log magnitude, dB.
    Magnitude,
    /// Phase, degrees.
    Phase,
}

impl TraceChannel {
    /// One-based trace index on the instrument.
    pub fn index(&self) -> u8 {
        match self {
            TraceChannel::Magnitude => 1,
            TraceChannel::Phase => 2,
        }
    }
}

/// Capability for network analyzers that take triggered frequency sweeps.
#[async_trait]
pub trait FrequencySweepSource: Send + Sync {
    fn name(&self) -> &str;

    /// Stop the free-running trigger so sweeps only happen on request.
    async fn suspend_continuous_trigger(&self) -> AppResult<()>;

    async fn resume_continuous_trigger(&self) -> AppResult<()>;

    /// Push span, point count, bandwidth, averaging and S-parameter.
    async fn configure_sweep(&self, config: &TraceConfig) -> AppResult<()>;

    /// Reset the running average accumulator.
    async fn clear_average(&self) -> AppResult<()>;

    /// Run one sweep; returns only after the instrument acknowledges completion.
    async fn trigger_single(&self) -> AppResult<()>;

    /// Formatted data for one trace, positionally aligned to the frequency axis.
    async fn read_channel(&self, channel: TraceChannel) -> AppResult<Vec<f64>>;
}

/// Capability for the instrument that drives the swept quantity.
#[async_trait]
pub trait SetpointSource: Send + Sync {
    fn name(&self) -> &str;

    fn variable(&self) -> SweepVariable;

    async fn set_level(&self, value: f64) -> AppResult<()>;

    async fn level(&self) -> AppResult<f64>;

    async fn set_output(&self, enabled: bool) -> AppResult<()>;

    /// Return the source to its rest level.
    async fn zero(&self) -> AppResult<()> {
        self.set_level(0.0).await
    }
}

/// Capability for a source-measure unit used as a four-wire ohmmeter.
#[async_trait]
pub trait ResistanceMeter: Send + Sync {
    fn name(&self) -> &str;

    async fn set_source_current(&self, amps: f64) -> AppResult<()>;

    async fn set_output(&self, enabled: bool) -> AppResult<()>;

    async fn read_resistance(&self) -> AppResult<f64>;
}

/// Rotation sense, viewed from above.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationDirection {
    Clockwise,
    Anticlockwise,
}

impl FromStr for RotationDirection {
    type Err = ExpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "right" | "clockwise" | "cw" => Ok(RotationDirection::Clockwise),
            "left" | "anticlockwise" | "counterclockwise" | "ccw" => {
                Ok(RotationDirection::Anticlockwise)
            }
            other => Err(ExpError::config(format!("unknown rotation direction '{}'", other))),
        }
    }
}

impl fmt::Display for RotationDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RotationDirection::Clockwise => write!(f, "right"),
            RotationDirection::Anticlockwise => write!(f, "left"),
        }
    }
}

/// Capability for a stepper-driven sample rotation stage.
#[async_trait]
pub trait RotationStage: Send + Sync {
    fn name(&self) -> &str;

    /// Number of motor steps taken by the next [`RotationStage::step`].
    async fn set_step_count(&self, steps: u32) -> AppResult<()>;

    async fn step(&self, direction: RotationDirection) -> AppResult<()>;

    /// Controller-side position counter, in steps.
    async fn position(&self) -> AppResult<i64>;

    async fn reset_position(&self) -> AppResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotation_direction_aliases() {
        assert_eq!("left".parse::<RotationDirection>().unwrap(), RotationDirection::Anticlockwise);
        assert_eq!("CW".parse::<RotationDirection>().unwrap(), RotationDirection::Clockwise);
        assert!("up".parse::<RotationDirection>().is_err());
    }

    #[test]
    fn trace_channel_indices() {
        assert_eq!(TraceChannel::Magnitude.index(), 1);
        assert_eq!(TraceChannel::Phase.index(), 2);
    }
}
