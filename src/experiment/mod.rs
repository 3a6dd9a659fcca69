//! Experiment orchestration.
//!
//! - [`sweep`]: the set-point sweep state machine and its records
//! - [`session`]: owns the instruments and all mutable run state, and
//!   composes sweeps, traces, thermometry and rotation into runnable
//!   operations

pub mod session;
pub mod sweep;

pub use session::{ExperimentSession, Instruments};
pub use sweep::{
    SweepConfig, SweepController, SweepFailure, SweepOutcome, SweepRecord, SweepRun, SweepState,
    SweepTermination,
};
