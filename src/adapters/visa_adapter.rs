//! VISA transport for GPIB/USB/Ethernet/serial instruments
//!
//! Wraps the visa-rs crate and runs the blocking VISA calls on Tokio's
//! blocking thread pool.
//!
//! Supports resource strings like:
//! - "GPIB0::25::INSTR" (GPIB interface)
//! - "USB0::0x0B21::0x0039::91L752855::INSTR" (USB)
//! - "TCPIP0::169.254.71.72::INSTR" (Ethernet/LXI)
//! - "ASRL23::INSTR" (serial)

use super::ScpiTransport;
use crate::error::{AppResult, ExpError};
use async_trait::async_trait;
use std::time::Duration;

#[cfg(feature = "instrument_visa")]
use std::sync::Arc;
#[cfg(feature = "instrument_visa")]
use tokio::sync::Mutex;
#[cfg(feature = "instrument_visa")]
use tracing::debug;

/// Builder for [`VisaTransport`].
pub struct VisaTransportBuilder {
    resource: String,
    timeout: Duration,
    terminator: String,
}

impl VisaTransportBuilder {
    pub fn new(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            timeout: Duration::from_secs(5),
            terminator: "\n".to_string(),
        }
    }

    /// Set read/write timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set line terminator appended to every command
    pub fn with_terminator(mut self, terminator: impl Into<String>) -> Self {
        self.terminator = terminator.into();
        self
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn terminator(&self) -> &str {
        &self.terminator
    }

    /// Open the VISA session.
    #[cfg(feature = "instrument_visa")]
    pub async fn open(self) -> AppResult<VisaTransport> {
        use std::ffi::CString;
        use visa_rs::prelude::*;

        let resource = self.resource.clone();
        let timeout = self.timeout;
        let instrument = tokio::task::spawn_blocking(move || {
            let rm = DefaultRM::new().map_err(|e| {
                ExpError::instrument(&resource, format!("VISA resource manager: {}", e))
            })?;
            let c_string = CString::new(resource.clone())
                .map_err(|e| ExpError::config(format!("invalid resource string: {}", e)))?;
            let visa_string = visa_rs::VisaString::from(c_string);
            rm.open(&visa_string, AccessMode::NO_LOCK, timeout)
                .map_err(|e| ExpError::instrument(&resource, format!("open failed: {}", e)))
        })
        .await
        .map_err(|e| ExpError::instrument(&self.resource, format!("VISA open task panicked: {}", e)))??;

        debug!(
            "VISA resource '{}' opened with {}ms timeout",
            self.resource,
            self.timeout.as_millis()
        );

        Ok(VisaTransport {
            resource: self.resource,
            terminator: self.terminator,
            instrument: Arc::new(Mutex::new(instrument)),
        })
    }

    #[cfg(not(feature = "instrument_visa"))]
    pub async fn open(self) -> AppResult<VisaTransport> {
        Err(ExpError::FeatureNotEnabled("instrument_visa".to_string()))
    }
}

/// VISA session to one instrument.
///
/// The session sits behind a mutex, so commands from concurrent callers are
/// executed one at a time.
pub struct VisaTransport {
    resource: String,
    #[cfg_attr(not(feature = "instrument_visa"), allow(dead_code))]
    terminator: String,
    #[cfg(feature = "instrument_visa")]
    instrument: Arc<Mutex<visa_rs::Instrument>>,
}

impl VisaTransport {
    pub fn builder(resource: impl Into<String>) -> VisaTransportBuilder {
        VisaTransportBuilder::new(resource)
    }
}

#[cfg(feature = "instrument_visa")]
#[async_trait]
impl ScpiTransport for VisaTransport {
    async fn write(&self, command: &str) -> AppResult<()> {
        use std::io::Write;

        let instrument = self.instrument.clone();
        let resource = self.resource.clone();
        let line = format!("{}{}", command, self.terminator);
        let command_for_log = command.to_string();

        tokio::task::spawn_blocking(move || {
            let mut guard = instrument.blocking_lock();
            guard
                .write_all(line.as_bytes())
                .map_err(|e| ExpError::instrument(&resource, format!("write '{}': {}", command_for_log, e)))?;
            debug!("VISA write sent: {}", command_for_log);
            Ok::<(), ExpError>(())
        })
        .await
        .map_err(|e| ExpError::instrument(&self.resource, format!("VISA write task panicked: {}", e)))?
    }

    async fn query(&self, command: &str) -> AppResult<String> {
        use std::io::{BufRead, BufReader, Write};

        let instrument = self.instrument.clone();
        let resource = self.resource.clone();
        let line = format!("{}{}", command, self.terminator);
        let command_for_log = command.to_string();

        tokio::task::spawn_blocking(move || {
            let mut guard = instrument.blocking_lock();
            guard
                .write_all(line.as_bytes())
                .map_err(|e| ExpError::instrument(&resource, format!("write '{}': {}", command_for_log, e)))?;

            let mut response = String::new();
            BufReader::new(&mut *guard)
                .read_line(&mut response)
                .map_err(|e| ExpError::instrument(&resource, format!("read after '{}': {}", command_for_log, e)))?;

            let response = response.trim().to_string();
            debug!("VISA query '{}' -> '{}'", command_for_log, response);
            Ok::<String, ExpError>(response)
        })
        .await
        .map_err(|e| ExpError::instrument(&self.resource, format!("VISA query task panicked: {}", e)))?
    }

    fn resource(&self) -> &str {
        &self.resource
    }
}

#[cfg(not(feature = "instrument_visa"))]
#[async_trait]
impl ScpiTransport for VisaTransport {
    async fn write(&self, _command: &str) -> AppResult<()> {
        Err(ExpError::FeatureNotEnabled("instrument_visa".to_string()))
    }

    async fn query(&self, _command: &str) -> AppResult<String> {
        Err(ExpError::FeatureNotEnabled("instrument_visa".to_string()))
    }

    fn resource(&self) -> &str {
        &self.resource
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults() {
        let builder = VisaTransport::builder("GPIB0::25::INSTR");
        assert_eq!(builder.resource(), "GPIB0::25::INSTR");
        assert_eq!(builder.timeout(), Duration::from_secs(5));
        assert_eq!(builder.terminator(), "\n");
    }

    #[test]
    fn builder_overrides() {
        let builder = VisaTransport::builder("ASRL23::INSTR")
            .with_timeout(Duration::from_millis(2000))
            .with_terminator("\r\n");
        assert_eq!(builder.timeout(), Duration::from_millis(2000));
        assert_eq!(builder.terminator(), "\r\n");
    }

    #[cfg(not(feature = "instrument_visa"))]
    #[tokio::test]
    async fn open_without_feature_reports_missing_feature() {
        let result = VisaTransport::builder("TCPIP0::169.254.71.72::INSTR").open().await;
        assert!(matches!(result, Err(ExpError::FeatureNotEnabled(_))));
    }
}
