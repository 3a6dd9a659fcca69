//! Arduino-driven bipolar stepper rotation stage
//!
//! Every command is answered with a human-readable line, so all of them are
//! sent as queries and the reply is logged. Numeric replies are extracted by
//! keeping only digits and minus signs. Roughly 50 steps make 4.5 degrees.

use super::capabilities::{RotationDirection, RotationStage};
use super::ScpiChannel;
use crate::adapters::ScpiTransport;
use crate::error::{AppResult, ExpError};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// Line terminator the stage firmware expects.
pub const TERMINATOR: &str = "\r\n";

pub struct SteppingRotationStage {
    io: ScpiChannel,
}

impl SteppingRotationStage {
    pub fn new(name: impl Into<String>, transport: Arc<dyn ScpiTransport>) -> Self {
        Self {
            io: ScpiChannel::new(name, transport),
        }
    }

    pub async fn identify(&self) -> AppResult<String> {
        self.io.query("*IDN?").await
    }

    /// Currently configured step count.
    pub async fn step_count(&self) -> AppResult<u32> {
        let value = self.query_int("stepper_steps?").await?;
        u32::try_from(value).map_err(|_| {
            ExpError::protocol(self.io.name(), format!("negative step count {}", value))
        })
    }

    async fn command(&self, command: &str) -> AppResult<()> {
        let reply = self.io.query(command).await?;
        debug!(instrument = %self.io.name(), "{} -> {}", command, reply.trim());
        Ok(())
    }

    async fn query_int(&self, command: &str) -> AppResult<i64> {
        let reply = self.io.query(command).await?;
        extract_int(&reply).ok_or_else(|| {
            ExpError::protocol(self.io.name(), format!("no integer in reply '{}'", reply.trim()))
        })
    }
}

/// Keep only digits and minus signs, then parse.
fn extract_int(reply: &str) -> Option<i64> {
    let digits: String = reply
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '-')
        .collect();
    digits.parse().ok()
}

#[async_trait]
impl RotationStage for SteppingRotationStage {
    fn name(&self) -> &str {
        self.io.name()
    }

    async fn set_step_count(&self, steps: u32) -> AppResult<()> {
        self.command(&format!("stepper_steps {}", steps)).await
    }

    async fn step(&self, direction: RotationDirection) -> AppResult<()> {
        match direction {
            RotationDirection::Clockwise => self.command("stepright").await,
            RotationDirection::Anticlockwise => self.command("stepleft").await,
        }
    }

    async fn position(&self) -> AppResult<i64> {
        self.query_int("position?").await
    }

    async fn reset_position(&self) -> AppResult<()> {
        self.command("resetposition").await
    }
}
