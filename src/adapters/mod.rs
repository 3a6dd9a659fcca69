//! Transport adapters for SCPI-style instruments.
//!
//! An adapter moves ASCII commands and replies between the host and one
//! instrument. It knows nothing about command sets; the drivers in
//! [`crate::instrument`] build on top of it.

pub mod mock;
pub mod visa_adapter;

pub use mock::MockTransport;
pub use visa_adapter::{VisaTransport, VisaTransportBuilder};

use crate::error::AppResult;
use async_trait::async_trait;

/// Raw command passthrough to one instrument.
///
/// Every failure (I/O error, timeout, closed session) is reported as
/// [`crate::error::ExpError::InstrumentFault`].
#[async_trait]
pub trait ScpiTransport: Send + Sync {
    /// Send a command without reading a reply.
    async fn write(&self, command: &str) -> AppResult<()>;

    /// Send a command and return the trimmed reply line.
    async fn query(&self, command: &str) -> AppResult<String>;

    /// Resource identifier, used in error messages.
    fn resource(&self) -> &str;
}
