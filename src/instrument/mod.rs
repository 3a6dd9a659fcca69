//! Instrument drivers and capability interfaces.
//!
//! Drivers translate typed operations into SCPI-style command strings and
//! parse the replies. The measurement and sweep layers never see a driver
//! type directly; they depend only on the traits in [`capabilities`], so the
//! same sequencing runs against real hardware or the simulated lab in
//! [`sim`].

pub mod capabilities;
pub mod e5071c;
pub mod er032m;
pub mod gs200;
pub mod keithley_2400;
pub mod rotation_stage;
pub mod sim;

pub use capabilities::{
    FrequencySweepSource, ResistanceMeter, RotationDirection, RotationStage, SetpointSource,
    TraceChannel,
};
pub use e5071c::E5071C;
pub use er032m::Er032m;
pub use gs200::Gs200;
pub use keithley_2400::Keithley2400;
pub use rotation_stage::SteppingRotationStage;

use crate::adapters::ScpiTransport;
use crate::error::{AppResult, ExpError};
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tracing::debug;

/// Serialized command channel to one instrument.
///
/// Single commands lock the channel for their own duration. Multi-command
/// sequences that must not interleave (select a trace, then read it) take
/// the lock once with [`ScpiChannel::lock`].
pub struct ScpiChannel {
    name: String,
    transport: Arc<dyn ScpiTransport>,
    gate: Mutex<()>,
}

impl ScpiChannel {
    pub fn new(name: impl Into<String>, transport: Arc<dyn ScpiTransport>) -> Self {
        Self {
            name: name.into(),
            transport,
            gate: Mutex::new(()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn lock(&self) -> ScpiGuard<'_> {
        ScpiGuard {
            channel: self,
            _gate: self.gate.lock().await,
        }
    }

    pub async fn write(&self, command: &str) -> AppResult<()> {
        self.lock().await.write(command).await
    }

    pub async fn query(&self, command: &str) -> AppResult<String> {
        self.lock().await.query(command).await
    }

    pub async fn query_f64(&self, command: &str) -> AppResult<f64> {
        let reply = self.query(command).await?;
        parse_f64(&self.name, &reply)
    }
}

/// Exclusive access to a [`ScpiChannel`] for a command sequence.
pub struct ScpiGuard<'a> {
    channel: &'a ScpiChannel,
    _gate: MutexGuard<'a, ()>,
}

impl ScpiGuard<'_> {
    pub async fn write(&self, command: &str) -> AppResult<()> {
        debug!(instrument = %self.channel.name, "write {}", command);
        self.channel
            .transport
            .write(command)
            .await
            .map_err(|e| self.attribute(e))
    }

    pub async fn query(&self, command: &str) -> AppResult<String> {
        let reply = self
            .channel
            .transport
            .query(command)
            .await
            .map_err(|e| self.attribute(e))?;
        debug!(instrument = %self.channel.name, "query {} -> {}", command, reply);
        Ok(reply)
    }

    /// Report transport faults under the instrument's logical name.
    fn attribute(&self, err: ExpError) -> ExpError {
        match err {
            ExpError::InstrumentFault { message, .. } => {
                ExpError::instrument(&self.channel.name, message)
            }
            other => other,
        }
    }
}

/// Parse a numeric reply; anything else is a protocol error.
pub(crate) fn parse_f64(instrument: &str, reply: &str) -> AppResult<f64> {
    reply
        .trim()
        .parse::<f64>()
        .map_err(|_| ExpError::protocol(instrument, format!("expected a number, got '{}'", reply.trim())))
}

/// Parse a comma-separated list of numbers.
pub(crate) fn parse_f64_list(instrument: &str, reply: &str) -> AppResult<Vec<f64>> {
    let trimmed = reply.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    trimmed
        .split(',')
        .map(|field| parse_f64(instrument, field))
        .collect()
}

/// Reject a setting outside the instrument's accepted range.
pub(crate) fn ensure_in_range(
    instrument: &str,
    parameter: &str,
    value: f64,
    min: f64,
    max: f64,
) -> AppResult<()> {
    if !value.is_finite() || value < min || value > max {
        return Err(ExpError::config(format!(
            "{} {} = {} outside [{}, {}]",
            instrument, parameter, value, min, max
        )));
    }
    Ok(())
}
