//! Configuration using Figment
//!
//! Settings are merged from, lowest to highest precedence:
//! 1. built-in defaults
//! 2. a TOML file (`expctl.toml` unless given explicitly)
//! 3. environment variables prefixed with `EXPCTL_`, `__` separating levels
//!
//! ```text
//! EXPCTL_APPLICATION__LOG_LEVEL=debug
//! EXPCTL_SWEEP__HARD_LIMIT=500
//! EXPCTL_INSTRUMENTS__VNA__RESOURCE="TCPIP0::169.254.71.72::INSTR"
//! ```
//!
//! # Example file
//!
//! ```toml
//! [storage]
//! output_dir = "data/run7"
//!
//! [instruments.vna]
//! resource = "TCPIP0::169.254.71.72::INSTR"
//!
//! [instruments.field_controller]
//! resource = "ASRL21::INSTR"
//!
//! [sweep]
//! variable = "field"
//! low = 0.0
//! high = 301.0
//! step = 2.0
//! hard_limit = 20002.0
//! settle_time_seconds = 10.0
//!
//! [trace]
//! start_freq = 7.0e9
//! stop_freq = 8.0e9
//! num_points = 2001
//! ```

use crate::error::{AppResult, ExpError};
use crate::experiment::SweepConfig;
use crate::instrument::er032m::{DEFAULT_CALIBRATION, DEFAULT_ZERO_OFFSET_GAUSS};
use crate::instrument::keithley_2400::SETUP_CURRENT_A;
use crate::measurement::TraceConfig;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "expctl.toml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub application: ApplicationConfig,
    pub storage: StorageConfig,
    pub instruments: InstrumentsConfig,
    /// Default sweep, overridden per run from the command line.
    pub sweep: SweepConfig,
    /// Default trace settings.
    pub trace: TraceConfig,
    pub thermometer: ThermometerConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    pub name: String,
    /// Used when `RUST_LOG` is not set.
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "expctl".to_string(),
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub enabled: bool,
    pub output_dir: PathBuf,
    /// Keep sweep records in memory after they were written.
    pub retain_records: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            output_dir: PathBuf::from("data"),
            retain_records: true,
        }
    }
}

/// Connection blocks; an absent block means the instrument is not used.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstrumentsConfig {
    pub vna: Option<InstrumentConfig>,
    pub smu: Option<SmuConfig>,
    pub current_source: Option<InstrumentConfig>,
    pub field_controller: Option<FieldControllerConfig>,
    pub rotation_stage: Option<InstrumentConfig>,
}

/// VISA connection of one instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentConfig {
    /// VISA resource string (e.g. "GPIB0::25::INSTR")
    pub resource: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_terminator")]
    pub terminator: String,
}

impl InstrumentConfig {
    pub fn new(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            timeout_ms: default_timeout_ms(),
            terminator: default_terminator(),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Source-measure unit used as thermometer readout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SmuConfig {
    pub resource: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_terminator")]
    pub terminator: String,
    /// Thermometer excitation, A.
    #[serde(default = "default_excitation_current")]
    pub excitation_current: f64,
    /// Voltage compliance, V.
    #[serde(default = "default_compliance_voltage")]
    pub compliance_voltage: f64,
}

impl SmuConfig {
    pub fn connection(&self) -> InstrumentConfig {
        InstrumentConfig {
            resource: self.resource.clone(),
            timeout_ms: self.timeout_ms,
            terminator: self.terminator.clone(),
        }
    }
}

/// Field controller behind the GPIB-USB bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldControllerConfig {
    pub resource: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_terminator")]
    pub terminator: String,
    /// Commanded units per gauss.
    #[serde(default = "default_field_calibration")]
    pub calibration: f64,
    #[serde(default = "default_zero_offset")]
    pub zero_offset_gauss: f64,
}

impl FieldControllerConfig {
    pub fn connection(&self) -> InstrumentConfig {
        InstrumentConfig {
            resource: self.resource.clone(),
            timeout_ms: self.timeout_ms,
            terminator: self.terminator.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThermometerConfig {
    /// CSV with `resistance_ohm,temperature_k` columns.
    pub calibration_file: Option<PathBuf>,
}

fn default_timeout_ms() -> u64 {
    5000
}

fn default_terminator() -> String {
    "\n".to_string()
}

fn default_excitation_current() -> f64 {
    SETUP_CURRENT_A
}

fn default_compliance_voltage() -> f64 {
    10e-3
}

fn default_field_calibration() -> f64 {
    DEFAULT_CALIBRATION
}

fn default_zero_offset() -> f64 {
    DEFAULT_ZERO_OFFSET_GAUSS
}

// ============================================================================
// Loading and validation
// ============================================================================

impl Settings {
    /// Load from [`DEFAULT_CONFIG_FILE`] and the environment.
    pub fn load_default() -> AppResult<Self> {
        Self::load(DEFAULT_CONFIG_FILE)
    }

    /// Load from `path` and the environment, then validate. A missing file
    /// leaves the defaults in place.
    pub fn load<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let settings: Self = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("EXPCTL_").split("__"))
            .extract()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(ExpError::config(format!(
                "invalid log_level '{}', must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.storage.enabled && self.storage.output_dir.as_os_str().is_empty() {
            return Err(ExpError::config("storage.output_dir cannot be empty"));
        }

        let instruments = &self.instruments;
        let connections = [
            ("vna", instruments.vna.clone()),
            ("smu", instruments.smu.as_ref().map(SmuConfig::connection)),
            ("current_source", instruments.current_source.clone()),
            (
                "field_controller",
                instruments
                    .field_controller
                    .as_ref()
                    .map(FieldControllerConfig::connection),
            ),
            ("rotation_stage", instruments.rotation_stage.clone()),
        ];
        for (name, connection) in connections {
            if let Some(connection) = connection {
                if connection.resource.trim().is_empty() {
                    return Err(ExpError::config(format!(
                        "instruments.{}.resource cannot be empty",
                        name
                    )));
                }
                if connection.timeout_ms == 0 {
                    return Err(ExpError::config(format!(
                        "instruments.{}.timeout_ms must be > 0",
                        name
                    )));
                }
            }
        }

        if let Some(smu) = &instruments.smu {
            if !(smu.excitation_current.is_finite() && smu.excitation_current > 0.0) {
                return Err(ExpError::config(format!(
                    "instruments.smu.excitation_current {} must be positive",
                    smu.excitation_current
                )));
            }
            if !(smu.compliance_voltage.is_finite() && smu.compliance_voltage > 0.0) {
                return Err(ExpError::config(format!(
                    "instruments.smu.compliance_voltage {} must be positive",
                    smu.compliance_voltage
                )));
            }
        }
        if let Some(field) = &instruments.field_controller {
            if !field.calibration.is_finite() || field.calibration == 0.0 {
                return Err(ExpError::config(
                    "instruments.field_controller.calibration must be finite and non-zero",
                ));
            }
            if !field.zero_offset_gauss.is_finite() {
                return Err(ExpError::config(
                    "instruments.field_controller.zero_offset_gauss must be finite",
                ));
            }
        }

        self.sweep.validate()?;
        self.trace.validate()?;
        Ok(())
    }

    /// Excitation current for the thermometer, from the SMU block or the
    /// driver default.
    pub fn excitation_current(&self) -> f64 {
        self.instruments
            .smu
            .as_ref()
            .map_or(SETUP_CURRENT_A, |smu| smu.excitation_current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::SweepVariable;
    use figment::Jail;

    fn load(path: &str) -> Result<Settings, figment::Error> {
        Settings::load(path).map_err(|e| figment::Error::from(e.to_string()))
    }

    #[test]
    fn defaults_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.excitation_current(), 10e-6);
    }

    #[test]
    fn missing_file_keeps_defaults() {
        Jail::expect_with(|_jail| {
            let settings = load("absent.toml")?;
            assert_eq!(settings, Settings::default());
            Ok(())
        });
    }

    #[test]
    fn file_and_env_are_merged() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "expctl.toml",
                r#"
                [storage]
                output_dir = "runs"

                [instruments.smu]
                resource = "GPIB0::25::INSTR"

                [instruments.field_controller]
                resource = "ASRL21::INSTR"
                zero_offset_gauss = 100.0

                [sweep]
                variable = "current"
                low = 0.0
                high = 0.01
                step = 0.0005
                hard_limit = 0.2
                settle_time_seconds = 8.0
                "#,
            )?;
            jail.set_env("EXPCTL_SWEEP__HARD_LIMIT", "0.1");
            jail.set_env("EXPCTL_APPLICATION__LOG_LEVEL", "debug");

            let settings = load("expctl.toml")?;
            assert_eq!(settings.storage.output_dir, PathBuf::from("runs"));
            assert_eq!(settings.sweep.variable, SweepVariable::Current);
            assert_eq!(settings.sweep.hard_limit, 0.1);
            assert_eq!(settings.application.log_level, "debug");

            let smu = settings.instruments.smu.as_ref().unwrap();
            assert_eq!(smu.timeout_ms, 5000);
            assert_eq!(smu.compliance_voltage, 10e-3);
            let field = settings.instruments.field_controller.as_ref().unwrap();
            assert_eq!(field.calibration, DEFAULT_CALIBRATION);
            assert_eq!(field.zero_offset_gauss, 100.0);
            assert!(settings.instruments.vna.is_none());
            Ok(())
        });
    }

    #[test]
    fn invalid_values_are_rejected() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "bad.toml",
                r#"
                [trace]
                start_freq = 8.0e9
                stop_freq = 7.0e9
                "#,
            )?;
            assert!(Settings::load("bad.toml").is_err());

            jail.create_file("level.toml", "[application]\nlog_level = \"loud\"\n")?;
            assert!(matches!(Settings::load("level.toml"), Err(ExpError::Config(_))));
            Ok(())
        });
    }

    #[test]
    fn empty_resource_is_rejected() {
        let mut settings = Settings::default();
        settings.instruments.vna = Some(InstrumentConfig::new(" "));
        assert!(settings.validate().is_err());
    }
}
