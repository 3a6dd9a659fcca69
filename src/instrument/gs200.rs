//! Yokogawa GS200 DC current source driver

use super::capabilities::SetpointSource;
use super::ScpiChannel;
use crate::adapters::ScpiTransport;
use crate::core::SweepVariable;
use crate::error::AppResult;
use async_trait::async_trait;
use std::sync::Arc;

pub struct Gs200 {
    io: ScpiChannel,
}

impl Gs200 {
    pub fn new(name: impl Into<String>, transport: Arc<dyn ScpiTransport>) -> Self {
        Self {
            io: ScpiChannel::new(name, transport),
        }
    }

    /// Switch to current-source mode, zero the level and disable the output.
    pub async fn initialise(&self) -> AppResult<()> {
        self.io.write(":SOUR:FUNC CURR").await?;
        self.set_current(0.0).await?;
        self.set_output_enabled(false).await
    }

    pub async fn set_current(&self, amps: f64) -> AppResult<()> {
        self.io.write(&format!(":SOUR:LEV {:.6E}", amps)).await
    }

    pub async fn current(&self) -> AppResult<f64> {
        self.io.query_f64(":SOUR:LEV?").await
    }

    pub async fn set_output_enabled(&self, enabled: bool) -> AppResult<()> {
        let state = if enabled { "ON" } else { "OFF" };
        self.io.write(&format!(":OUTP {}", state)).await
    }

    pub async fn output_enabled(&self) -> AppResult<bool> {
        Ok(self.io.query_f64(":OUTP?").await? != 0.0)
    }
}

#[async_trait]
impl SetpointSource for Gs200 {
    fn name(&self) -> &str {
        self.io.name()
    }

    fn variable(&self) -> SweepVariable {
        SweepVariable::Current
    }

    async fn set_level(&self, value: f64) -> AppResult<()> {
        self.set_current(value).await
    }

    async fn level(&self) -> AppResult<f64> {
        self.current().await
    }

    async fn set_output(&self, enabled: bool) -> AppResult<()> {
        self.set_output_enabled(enabled).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MockTransport;

    #[tokio::test]
    async fn level_commands() {
        let mock = MockTransport::new("USB0::0x0B21::0x0039::91L752855::INSTR");
        let source = Gs200::new("current_source", Arc::new(mock.clone()));

        source.set_level(5e-4).await.unwrap();
        source.set_output(true).await.unwrap();
        assert_eq!(mock.writes(), vec![":SOUR:LEV 5.000000E-4", ":OUTP ON"]);

        mock.set_reply(":SOUR:LEV?", "+5.00000E-04");
        assert!((source.level().await.unwrap() - 5e-4).abs() < 1e-12);
    }

    #[tokio::test]
    async fn initialise_leaves_output_off_at_zero() {
        let mock = MockTransport::new("gs200");
        let source = Gs200::new("current_source", Arc::new(mock.clone()));
        source.initialise().await.unwrap();
        assert_eq!(
            mock.writes(),
            vec![":SOUR:FUNC CURR", ":SOUR:LEV 0.000000E0", ":OUTP OFF"]
        );
    }
}
