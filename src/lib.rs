//! Core library for the `expctl` instrument-control tool.
//!
//! This library drives microwave resonance measurements: a network analyzer
//! takes averaged frequency sweeps while a field controller or current source
//! steps through a range of set-points, with a four-wire resistance
//! thermometer and a stepper rotation stage alongside.
//!
//! - [`adapters`]: transports carrying SCPI-style text (VISA, mock)
//! - [`instrument`]: capability traits, drivers, and the simulated lab
//! - [`measurement`]: trace acquisition and thermometry
//! - [`experiment`]: the sweep state machine and the experiment session
//! - [`data`]: CSV persistence of records, traces and temperature logs
//! - [`config`]: figment-based settings

pub mod adapters;
pub mod config;
pub mod core;
pub mod data;
pub mod error;
pub mod experiment;
pub mod instrument;
pub mod measurement;

pub use crate::core::{CancelToken, SweepVariable};
pub use crate::error::{AppResult, ErrorKind, ExpError};
