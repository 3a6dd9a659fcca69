//! Bruker ER 032M field controller driver
//!
//! The controller sits behind a Prologix-style GPIB-USB bridge that is
//! configured with `++` commands. Fields are commanded as `CF<value>` with two
//! decimals, after applying the Hall-probe calibration factor and the
//! controller's zero-field offset.
//!
//! The controller is set-only: there is no field readback, so
//! [`SetpointSource::level`] reports the last commanded field.

use super::capabilities::SetpointSource;
use super::ScpiChannel;
use crate::adapters::ScpiTransport;
use crate::core::SweepVariable;
use crate::error::{AppResult, ExpError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info};

/// Commanded units per gauss of applied field.
pub const DEFAULT_CALIBRATION: f64 = 1.371742112;
/// Controller value that produces zero field at the sample.
pub const DEFAULT_ZERO_OFFSET_GAUSS: f64 = 102.10;

pub struct Er032m {
    io: ScpiChannel,
    calibration: f64,
    zero_offset: f64,
    last_field: Mutex<Option<f64>>,
}

impl Er032m {
    pub fn new(name: impl Into<String>, transport: Arc<dyn ScpiTransport>) -> Self {
        Self {
            io: ScpiChannel::new(name, transport),
            calibration: DEFAULT_CALIBRATION,
            zero_offset: DEFAULT_ZERO_OFFSET_GAUSS,
            last_field: Mutex::new(None),
        }
    }

    pub fn with_calibration(mut self, calibration: f64) -> Self {
        self.calibration = calibration;
        self
    }

    pub fn with_zero_offset(mut self, zero_offset: f64) -> Self {
        self.zero_offset = zero_offset;
        self
    }

    /// Put the bridge in controller mode and zero the field.
    pub async fn initialise(&self) -> AppResult<()> {
        {
            let io = self.io.lock().await;
            for command in ["++mode 1", "++auto 0", "++eos 0", "++eoi 1"] {
                io.write(command).await?;
            }
        }
        self.zero_field().await?;
        info!(instrument = %self.io.name(), "field controller initialised at zero field");
        Ok(())
    }

    /// Controller value for a field at the sample.
    pub fn command_value(&self, gauss: f64) -> f64 {
        self.zero_offset + gauss * self.calibration
    }

    pub async fn set_field(&self, gauss: f64) -> AppResult<()> {
        if !gauss.is_finite() {
            return Err(ExpError::config(format!("field {} is not finite", gauss)));
        }
        self.io
            .write(&format!("CF{:+.2}", self.command_value(gauss)))
            .await?;
        *self.last_field.lock() = Some(gauss);
        Ok(())
    }

    pub async fn zero_field(&self) -> AppResult<()> {
        self.set_field(0.0).await
    }

    pub fn last_field(&self) -> Option<f64> {
        *self.last_field.lock()
    }
}

#[async_trait]
impl SetpointSource for Er032m {
    fn name(&self) -> &str {
        self.io.name()
    }

    fn variable(&self) -> SweepVariable {
        SweepVariable::Field
    }

    async fn set_level(&self, value: f64) -> AppResult<()> {
        self.set_field(value).await
    }

    async fn level(&self) -> AppResult<f64> {
        Ok(self.last_field().unwrap_or(0.0))
    }

    /// No output stage: disabling drives the field to zero, enabling is a no-op.
    async fn set_output(&self, enabled: bool) -> AppResult<()> {
        if enabled {
            debug!(instrument = %self.io.name(), "field controller has no output switch");
            Ok(())
        } else {
            self.zero_field().await
        }
    }
}
