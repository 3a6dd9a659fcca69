//! Single measurements built from instrument capabilities.
//!
//! - [`trace`]: one averaged frequency sweep on a network analyzer, returned
//!   as a [`Trace`] on an analytically constructed frequency axis.
//! - [`thermometer`]: reversed-polarity four-wire resistance measurement
//!   mapped to temperature through a [`CalibrationTable`].

pub mod thermometer;
pub mod trace;

pub use thermometer::{CalibrationTable, ResistanceThermometer, TemperatureSample};
pub use trace::{SParameter, Trace, TraceAcquirer, TraceConfig};
