//! Keithley 2400 source-measure unit driver
//!
//! Used as a four-wire ohmmeter for the sample thermometer: the unit sources a
//! fixed current and `:READ?` returns a reading whose first two fields are the
//! measured voltage and current.

use super::capabilities::ResistanceMeter;
use super::{parse_f64_list, ScpiChannel};
use crate::adapters::ScpiTransport;
use crate::error::{AppResult, ExpError};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

/// Safe excitation current applied while the unit is being configured.
pub const SETUP_CURRENT_A: f64 = 10e-6;

/// Sourced quantity; the sense function is set to the complementary one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFunction {
    Voltage,
    Current,
}

pub struct Keithley2400 {
    io: ScpiChannel,
}

impl Keithley2400 {
    pub fn new(name: impl Into<String>, transport: Arc<dyn ScpiTransport>) -> Self {
        Self {
            io: ScpiChannel::new(name, transport),
        }
    }

    /// Manual four-wire resistance mode, slow integration, beeper off.
    pub async fn setup_four_wire_resistance(&self, compliance_voltage: f64) -> AppResult<()> {
        {
            let io = self.io.lock().await;
            for command in [
                ":*RST",
                "FUNC \"RES\"",
                "RES:MODE MAN",
                ":SENS:RES:NPLC 10",
                ":SYST:RSEN ON",
                ":SYST:BEEP:STAT 0",
            ] {
                io.write(command).await?;
            }
        }
        self.set_current(SETUP_CURRENT_A).await?;
        self.set_voltage_compliance(compliance_voltage).await?;

        info!(instrument = %self.io.name(), "four-wire resistance mode configured");
        Ok(())
    }

    pub async fn reset(&self) -> AppResult<()> {
        self.io.write(":*RST").await
    }

    pub async fn set_current(&self, amps: f64) -> AppResult<()> {
        self.io.write(&format!(":SOUR:CURR:LEV {:.8}", amps)).await
    }

    pub async fn current(&self) -> AppResult<f64> {
        Ok(self.read_fields().await?[1])
    }

    pub async fn set_voltage(&self, volts: f64) -> AppResult<()> {
        self.io.write(&format!(":SOUR:VOLT:LEV {:.8}", volts)).await
    }

    pub async fn voltage(&self) -> AppResult<f64> {
        Ok(self.read_fields().await?[0])
    }

    pub async fn set_voltage_compliance(&self, volts: f64) -> AppResult<()> {
        self.io.write(&format!("SENS:VOLT:PROT {}", volts)).await
    }

    pub async fn voltage_compliance(&self) -> AppResult<f64> {
        self.io.query_f64("SENS:VOLT:PROT?").await
    }

    pub async fn set_current_compliance(&self, amps: f64) -> AppResult<()> {
        self.io.write(&format!("SENS:CURR:PROT {}", amps)).await
    }

    pub async fn current_compliance(&self) -> AppResult<f64> {
        self.io.query_f64("SENS:CURR:PROT?").await
    }

    pub async fn set_voltage_range(&self, volts: f64) -> AppResult<()> {
        self.io.write(&format!("SOUR:VOLT:RANG {}", volts)).await
    }

    pub async fn voltage_range(&self) -> AppResult<f64> {
        self.io.query_f64("SENS:VOLT:RANG?").await
    }

    pub async fn set_current_range(&self, amps: f64) -> AppResult<()> {
        self.io.write(&format!("SOUR:CURR:RANG {}", amps)).await
    }

    pub async fn current_range(&self) -> AppResult<f64> {
        self.io.query_f64("SENS:CURR:RANG?").await
    }

    pub async fn set_output_enabled(&self, enabled: bool) -> AppResult<()> {
        self.io
            .write(&format!(":OUTP:STAT {}", u8::from(enabled)))
            .await
    }

    pub async fn output_enabled(&self) -> AppResult<bool> {
        Ok(self.io.query_f64(":OUTP:STAT?").await? != 0.0)
    }

    /// Select the sourced quantity and sense the complementary one.
    pub async fn set_source_function(&self, function: SourceFunction) -> AppResult<()> {
        let (source, sense) = match function {
            SourceFunction::Voltage => ("VOLT", "CURR"),
            SourceFunction::Current => ("CURR", "VOLT"),
        };
        let io = self.io.lock().await;
        io.write(&format!(":SENS:FUNC \"{}\"", sense)).await?;
        io.write(&format!(":SOUR:FUNC {}", source)).await
    }

    pub async fn source_function(&self) -> AppResult<String> {
        self.io.query(":SOUR:FUNC?").await
    }

    pub async fn set_sense_function(&self, function: &str) -> AppResult<()> {
        self.io.write(&format!(":SENS:FUNC \"{}\"", function)).await
    }

    pub async fn sense_function(&self) -> AppResult<String> {
        self.io.query(":SENS:FUNC?").await
    }

    /// Integration time for voltage measurements, in power-line cycles.
    pub async fn set_voltage_nplc(&self, cycles: f64) -> AppResult<()> {
        self.io.write(&format!("SENS:VOLT:NPLC {}", cycles)).await
    }

    pub async fn voltage_nplc(&self) -> AppResult<f64> {
        self.io.query_f64("SENS:VOLT:NPLC?").await
    }

    pub async fn set_current_nplc(&self, cycles: f64) -> AppResult<()> {
        self.io.write(&format!("SENS:CURR:NPLC {}", cycles)).await
    }

    pub async fn current_nplc(&self) -> AppResult<f64> {
        self.io.query_f64("SENS:CURR:NPLC?").await
    }

    /// Measured voltage divided by measured current.
    pub async fn resistance(&self) -> AppResult<f64> {
        let fields = self.read_fields().await?;
        Ok(fields[0] / fields[1])
    }

    /// `:READ?` reply, guaranteed to hold at least voltage and current.
    async fn read_fields(&self) -> AppResult<Vec<f64>> {
        let reply = self.io.query(":READ?").await?;
        let fields = parse_f64_list(self.io.name(), &reply)?;
        if fields.len() < 2 {
            return Err(ExpError::protocol(
                self.io.name(),
                format!("reading '{}' has fewer than two fields", reply),
            ));
        }
        Ok(fields)
    }
}

#[async_trait]
impl ResistanceMeter for Keithley2400 {
    fn name(&self) -> &str {
        self.io.name()
    }

    async fn set_source_current(&self, amps: f64) -> AppResult<()> {
        self.set_current(amps).await
    }

    async fn set_output(&self, enabled: bool) -> AppResult<()> {
        self.set_output_enabled(enabled).await
    }

    async fn read_resistance(&self) -> AppResult<f64> {
        self.resistance().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MockTransport;

    fn smu() -> (Keithley2400, MockTransport) {
        let mock = MockTransport::new("GPIB0::25::INSTR");
        (Keithley2400::new("smu", Arc::new(mock.clone())), mock)
    }

    #[tokio::test]
    async fn resistance_is_voltage_over_current() {
        let (smu, mock) = smu();
        mock.set_reply(":READ?", "1.000000E-03,1.000000E-05,9.91E+37,1234.5,2.15E+05");
        let r = smu.resistance().await.unwrap();
        assert!((r - 100.0).abs() < 1e-9);
        assert!((smu.voltage().await.unwrap() - 1e-3).abs() < 1e-15);
        assert!((smu.current().await.unwrap() - 1e-5).abs() < 1e-15);
    }

    #[tokio::test]
    async fn short_reading_is_a_protocol_error() {
        let (smu, mock) = smu();
        mock.set_reply(":READ?", "1.0E-03");
        assert!(matches!(smu.resistance().await, Err(ExpError::Protocol { .. })));
    }

    #[tokio::test]
    async fn source_function_sets_complementary_sense() {
        let (smu, mock) = smu();
        smu.set_source_function(SourceFunction::Current).await.unwrap();
        assert_eq!(mock.writes(), vec![":SENS:FUNC \"VOLT\"", ":SOUR:FUNC CURR"]);
    }

    #[tokio::test]
    async fn four_wire_setup_ends_with_safe_current_and_compliance() {
        let (smu, mock) = smu();
        smu.setup_four_wire_resistance(10e-3).await.unwrap();

        let writes = mock.writes();
        assert_eq!(writes.first().map(String::as_str), Some(":*RST"));
        assert!(writes.contains(&":SYST:RSEN ON".to_string()));
        assert_eq!(
            &writes[writes.len() - 2..],
            &[":SOUR:CURR:LEV 0.00001000".to_string(), "SENS:VOLT:PROT 0.01".to_string()]
        );
    }

    #[tokio::test]
    async fn output_toggle_uses_numeric_state() {
        let (smu, mock) = smu();
        smu.set_output(true).await.unwrap();
        smu.set_output(false).await.unwrap();
        assert_eq!(mock.writes(), vec![":OUTP:STAT 1", ":OUTP:STAT 0"]);
    }
}
