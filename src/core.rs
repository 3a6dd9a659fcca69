//! Core value types shared by the instrument, measurement and sweep layers.

use crate::error::{AppResult, ExpError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Physical quantity driven by a sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SweepVariable {
    /// Applied magnetic field, in gauss.
    Field,
    /// Source current, in amperes.
    Current,
}

impl SweepVariable {
    pub fn unit(&self) -> &'static str {
        match self {
            SweepVariable::Field => "G",
            SweepVariable::Current => "A",
        }
    }

    /// Short symbol used in file labels (`B_12.000`, `I_0.000500`).
    pub fn symbol(&self) -> &'static str {
        match self {
            SweepVariable::Field => "B",
            SweepVariable::Current => "I",
        }
    }

    /// Human-readable label for a set-point of this variable.
    pub fn label(&self, setpoint: f64) -> String {
        match self {
            SweepVariable::Field => format!("{}_{:.3}", self.symbol(), setpoint),
            SweepVariable::Current => format!("{}_{:.6}", self.symbol(), setpoint),
        }
    }
}

impl fmt::Display for SweepVariable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SweepVariable::Field => write!(f, "field"),
            SweepVariable::Current => write!(f, "current"),
        }
    }
}

impl FromStr for SweepVariable {
    type Err = ExpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "field" | "b" => Ok(SweepVariable::Field),
            "current" | "i" => Ok(SweepVariable::Current),
            other => Err(ExpError::config(format!(
                "unknown sweep variable '{}' (expected 'field' or 'current')",
                other
            ))),
        }
    }
}

/// Cooperative cancellation flag.
///
/// Long-running operations poll the token at step boundaries only; a blocked
/// instrument call is never interrupted.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Returns `Err(ExpError::Cancelled)` once cancellation was requested.
    pub fn check(&self) -> AppResult<()> {
        if self.is_cancelled() {
            Err(ExpError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// `n` evenly spaced samples over the closed interval `[start, stop]`.
///
/// The last sample is exactly `stop`; a single sample is `start`.
pub fn linspace(start: f64, stop: f64, n: usize) -> Vec<f64> {
    match n {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step = (stop - start) / (n - 1) as f64;
            let mut values: Vec<f64> = (0..n).map(|i| start + step * i as f64).collect();
            values[n - 1] = stop;
            values
        }
    }
}
