//! Keysight E5071C vector network analyzer driver
//!
//! The analyzer is set up with two traces on channel 1 that measure the same
//! S-parameter: trace 1 formatted as log magnitude (dB), trace 2 as phase
//! (degrees). Formatted data is read as ASCII with `CALC1:DATA:FDATA?`, which
//! returns one value pair per point; the first value of each pair is the
//! datum.
//!
//! ## Configuration
//!
//! ```toml
//! [instruments.vna]
//! resource = "TCPIP0::169.254.71.72::INSTR"
//! timeout_ms = 5000
//! ```

use super::capabilities::{FrequencySweepSource, TraceChannel};
use super::{ensure_in_range, parse_f64, parse_f64_list, ScpiChannel};
use crate::adapters::ScpiTransport;
use crate::error::{AppResult, ExpError};
use crate::measurement::{SParameter, TraceConfig};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

/// Output power range, dBm.
pub const POWER_RANGE_DBM: (f64, f64) = (-150.0, 10.0);
/// IF bandwidth range, Hz.
pub const BANDWIDTH_RANGE_HZ: (f64, f64) = (1.0, 1e6);
/// Averaging factor range.
pub const AVERAGES_RANGE: (u32, u32) = (1, 999);
/// Largest supported sweep point count.
pub const MAX_POINTS: usize = 20_001;

/// Trigger source for channel 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerSource {
    /// Free-running internal trigger.
    Internal,
    /// Sweeps only on bus (software) trigger.
    Bus,
}

impl TriggerSource {
    fn as_scpi(&self) -> &'static str {
        match self {
            TriggerSource::Internal => "INT",
            TriggerSource::Bus => "BUS",
        }
    }
}

fn on_off(enabled: bool) -> &'static str {
    if enabled {
        "ON"
    } else {
        "OFF"
    }
}

/// E5071C instrument implementation
pub struct E5071C {
    io: ScpiChannel,
}

impl E5071C {
    pub fn new(name: impl Into<String>, transport: Arc<dyn ScpiTransport>) -> Self {
        Self {
            io: ScpiChannel::new(name, transport),
        }
    }

    /// Reset and bring the analyzer into the two-trace magnitude/phase layout.
    pub async fn initialise(&self) -> AppResult<()> {
        let io = self.io.lock().await;
        for command in [
            "*RST",
            "SENS1:SWE:TYPE LIN",
            "SENS1:SWE:TIME:AUTO ON",
            "TRIG:SOUR INT",
            "SENS1:AVER ON",
            "CALC1:PAR:COUN 2",
            "CALC1:PAR1:DEF S11",
            "CALC1:PAR1:SEL",
            "CALC1:FORM MLOG",
            "CALC1:PAR2:DEF S11",
            "CALC1:PAR2:SEL",
            "CALC1:FORM PHAS",
            "INIT1:CONT ON",
        ] {
            io.write(command).await?;
        }
        drop(io);

        info!(instrument = %self.io.name(), "network analyzer initialised");
        Ok(())
    }

    pub async fn reset(&self) -> AppResult<()> {
        self.io.write("*RST").await
    }

    pub async fn identify(&self) -> AppResult<String> {
        self.io.query("*IDN?").await
    }

    pub async fn set_power(&self, dbm: f64) -> AppResult<()> {
        ensure_in_range(self.io.name(), "power", dbm, POWER_RANGE_DBM.0, POWER_RANGE_DBM.1)?;
        self.io.write(&format!("SOUR:POW {:.4}", dbm)).await
    }

    pub async fn power(&self) -> AppResult<f64> {
        self.io.query_f64("SOUR:POW?").await
    }

    pub async fn set_bandwidth(&self, hz: f64) -> AppResult<()> {
        ensure_in_range(
            self.io.name(),
            "bandwidth",
            hz,
            BANDWIDTH_RANGE_HZ.0,
            BANDWIDTH_RANGE_HZ.1,
        )?;
        self.io.write(&format!("SENS:BAND {:.4}", hz)).await
    }

    pub async fn bandwidth(&self) -> AppResult<f64> {
        self.io.query_f64("SENS:BAND?").await
    }

    pub async fn set_averages(&self, count: u32) -> AppResult<()> {
        ensure_in_range(
            self.io.name(),
            "averages",
            f64::from(count),
            f64::from(AVERAGES_RANGE.0),
            f64::from(AVERAGES_RANGE.1),
        )?;
        self.io.write(&format!("SENS:AVER:COUN {}", count)).await
    }

    pub async fn averages(&self) -> AppResult<u32> {
        let value = self.io.query_f64("SENS:AVER:COUN?").await?;
        Ok(value.round() as u32)
    }

    pub async fn set_start(&self, hz: f64) -> AppResult<()> {
        self.io.write(&format!("SENS:FREQ:START {:.4}", hz)).await
    }

    pub async fn start(&self) -> AppResult<f64> {
        self.io.query_f64("SENS:FREQ:START?").await
    }

    pub async fn set_stop(&self, hz: f64) -> AppResult<()> {
        self.io.write(&format!("SENS:FREQ:STOP {:.4}", hz)).await
    }

    pub async fn stop(&self) -> AppResult<f64> {
        self.io.query_f64("SENS:FREQ:STOP?").await
    }

    pub async fn set_center(&self, hz: f64) -> AppResult<()> {
        self.io.write(&format!("SENS:FREQ:CENTER {:.4}", hz)).await
    }

    pub async fn center(&self) -> AppResult<f64> {
        self.io.query_f64("SENS:FREQ:CENTER?").await
    }

    pub async fn set_span(&self, hz: f64) -> AppResult<()> {
        self.io.write(&format!("SENS:FREQ:SPAN {:.4}", hz)).await
    }

    pub async fn span(&self) -> AppResult<f64> {
        self.io.query_f64("SENS:FREQ:SPAN?").await
    }

    pub async fn set_points(&self, points: usize) -> AppResult<()> {
        if points == 0 || points > MAX_POINTS {
            return Err(ExpError::config(format!(
                "{} point count {} outside [1, {}]",
                self.io.name(),
                points,
                MAX_POINTS
            )));
        }
        self.io.write(&format!("SENS:SWE:POIN {}", points)).await
    }

    pub async fn points(&self) -> AppResult<usize> {
        let value = self.io.query_f64("SENS:SWE:POIN?").await?;
        Ok(value.round() as usize)
    }

    /// Select the measured S-parameter for both traces.
    pub async fn set_measure(&self, parameter: SParameter) -> AppResult<()> {
        let io = self.io.lock().await;
        io.write(&format!("CALC1:PAR1:DEF {}", parameter)).await?;
        io.write(&format!("CALC1:PAR2:DEF {}", parameter)).await
    }

    pub async fn measure(&self) -> AppResult<SParameter> {
        let reply = self.io.query("CALC:PAR:DEF?").await?;
        reply
            .trim()
            .trim_matches('"')
            .parse()
            .map_err(|_| ExpError::protocol(self.io.name(), format!("unknown S-parameter '{}'", reply)))
    }

    pub async fn set_trigger_source(&self, source: TriggerSource) -> AppResult<()> {
        self.io.write(&format!("TRIG:SOUR {}", source.as_scpi())).await
    }

    pub async fn set_continuous_initiate(&self, enabled: bool) -> AppResult<()> {
        self.io.write(&format!("INIT1:CONT {}", on_off(enabled))).await
    }

    pub async fn set_rf_output(&self, enabled: bool) -> AppResult<()> {
        self.io.write(&format!("OUTP {}", on_off(enabled))).await
    }
}

#[async_trait]
impl FrequencySweepSource for E5071C {
    fn name(&self) -> &str {
        self.io.name()
    }

    async fn suspend_continuous_trigger(&self) -> AppResult<()> {
        self.set_trigger_source(TriggerSource::Bus).await
    }

    async fn resume_continuous_trigger(&self) -> AppResult<()> {
        self.set_trigger_source(TriggerSource::Internal).await
    }

    async fn configure_sweep(&self, config: &TraceConfig) -> AppResult<()> {
        if let Some(power) = config.power_dbm {
            self.set_power(power).await?;
        }
        self.set_points(config.num_points).await?;
        self.set_bandwidth(config.bandwidth_hz).await?;
        self.set_averages(config.averages).await?;

        let io = self.io.lock().await;
        io.write("FORM:DATA ASC").await?;
        io.write(&format!("SENS:FREQ:START {:.4}", config.start_freq)).await?;
        io.write(&format!("SENS:FREQ:STOP {:.4}", config.stop_freq)).await?;
        io.write(&format!("CALC1:PAR1:DEF {}", config.selected_parameter)).await?;
        io.write(&format!("CALC1:PAR2:DEF {}", config.selected_parameter)).await?;
        io.write("SENS1:AVER ON").await
    }

    async fn clear_average(&self) -> AppResult<()> {
        self.io.write("SENS1:AVER:CLE").await
    }

    async fn trigger_single(&self) -> AppResult<()> {
        let reply = self.io.query(":TRIG:SING;*OPC?").await?;
        let acknowledged = parse_f64(self.io.name(), &reply)?;
        if acknowledged != 1.0 {
            return Err(ExpError::protocol(
                self.io.name(),
                format!("unexpected operation-complete reply '{}'", reply),
            ));
        }
        Ok(())
    }

    async fn read_channel(&self, channel: TraceChannel) -> AppResult<Vec<f64>> {
        let io = self.io.lock().await;
        io.write(&format!("CALC1:PAR{}:SEL", channel.index())).await?;
        let reply = io.query("CALC1:DATA:FDATA?").await?;
        drop(io);

        let values = parse_f64_list(self.io.name(), &reply)?;
        if values.len() % 2 != 0 {
            return Err(ExpError::protocol(
                self.io.name(),
                format!("FDATA reply has odd value count {}", values.len()),
            ));
        }
        Ok(values.into_iter().step_by(2).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MockTransport;

    fn analyzer() -> (E5071C, MockTransport) {
        let mock = MockTransport::new("TCPIP0::169.254.71.72::INSTR");
        (E5071C::new("vna", Arc::new(mock.clone())), mock)
    }

    #[tokio::test]
    async fn power_is_range_checked_before_writing() {
        let (vna, mock) = analyzer();
        assert!(matches!(vna.set_power(20.0).await, Err(ExpError::Config(_))));
        assert!(mock.writes().is_empty());

        vna.set_power(-30.0).await.unwrap();
        assert_eq!(mock.writes(), vec!["SOUR:POW -30.0000"]);
    }

    #[tokio::test]
    async fn measure_defines_both_traces() {
        let (vna, mock) = analyzer();
        vna.set_measure(SParameter::S21).await.unwrap();
        assert_eq!(mock.writes(), vec!["CALC1:PAR1:DEF S21", "CALC1:PAR2:DEF S21"]);

        mock.set_reply("CALC:PAR:DEF?", "\"S21\"");
        assert_eq!(vna.measure().await.unwrap(), SParameter::S21);
    }

    #[tokio::test]
    async fn trigger_control_maps_to_trigger_source() {
        let (vna, mock) = analyzer();
        vna.suspend_continuous_trigger().await.unwrap();
        vna.resume_continuous_trigger().await.unwrap();
        assert_eq!(mock.writes(), vec!["TRIG:SOUR BUS", "TRIG:SOUR INT"]);
    }

    #[tokio::test]
    async fn trigger_single_waits_for_acknowledgement() {
        let (vna, mock) = analyzer();
        mock.push_reply(":TRIG:SING;*OPC?", "+1");
        vna.trigger_single().await.unwrap();

        mock.push_reply(":TRIG:SING;*OPC?", "0");
        assert!(matches!(vna.trigger_single().await, Err(ExpError::Protocol { .. })));
    }

    #[tokio::test]
    async fn read_channel_takes_first_value_of_each_pair() {
        let (vna, mock) = analyzer();
        mock.push_reply("CALC1:DATA:FDATA?", "-1.5,0,-2.5,0,-3.5,0");

        let values = vna.read_channel(TraceChannel::Phase).await.unwrap();
        assert_eq!(values, vec![-1.5, -2.5, -3.5]);
        assert_eq!(mock.writes(), vec!["CALC1:PAR2:SEL"]);
    }

    #[tokio::test]
    async fn read_channel_rejects_garbage() {
        let (vna, mock) = analyzer();
        mock.push_reply("CALC1:DATA:FDATA?", "-1.5,0,NaNx,0");
        assert!(matches!(
            vna.read_channel(TraceChannel::Magnitude).await,
            Err(ExpError::Protocol { .. })
        ));
    }

    #[tokio::test]
    async fn configure_sweep_pushes_span_points_and_averaging() {
        let (vna, mock) = analyzer();
        let config = TraceConfig {
            start_freq: 7.49e9,
            stop_freq: 7.494e9,
            num_points: 2001,
            bandwidth_hz: 1000.0,
            averages: 4,
            selected_parameter: SParameter::S21,
            power_dbm: None,
        };
        vna.configure_sweep(&config).await.unwrap();

        let writes = mock.writes();
        assert!(writes.contains(&"SENS:SWE:POIN 2001".to_string()));
        assert!(writes.contains(&"SENS:BAND 1000.0000".to_string()));
        assert!(writes.contains(&"SENS:AVER:COUN 4".to_string()));
        assert!(writes.contains(&"SENS:FREQ:START 7490000000.0000".to_string()));
        assert!(writes.contains(&"SENS:FREQ:STOP 7494000000.0000".to_string()));
        assert!(writes.contains(&"CALC1:PAR2:DEF S21".to_string()));
        assert!(!writes.iter().any(|w| w.starts_with("SOUR:POW")));
    }
}
