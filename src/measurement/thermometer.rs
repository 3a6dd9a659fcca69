//! Four-wire resistance thermometry.
//!
//! Each measurement reads the sensor twice, once with `+I` and once with
//! `-I`, and averages the two to cancel thermoelectric offset voltages. The
//! output is switched off after every reading, also when the reading fails.

use crate::error::{AppResult, ExpError};
use crate::instrument::ResistanceMeter;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

/// Monotonic resistance-to-temperature mapping with linear interpolation.
///
/// Points are kept sorted by resistance. A single-point table only maps its
/// own resistance.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationTable {
    points: Vec<(f64, f64)>,
}

#[derive(Debug, Deserialize)]
struct CalibrationRow {
    resistance_ohm: f64,
    temperature_k: f64,
}

impl CalibrationTable {
    /// Build from `(resistance_ohm, temperature_k)` pairs listed with strictly
    /// increasing or strictly decreasing resistance.
    pub fn new(points: Vec<(f64, f64)>) -> AppResult<Self> {
        if points.is_empty() {
            return Err(ExpError::config("calibration table is empty"));
        }
        if points
            .iter()
            .any(|(r, t)| !r.is_finite() || !t.is_finite() || *r < 0.0 || *t < 0.0)
        {
            return Err(ExpError::config(
                "calibration entries must be finite and non-negative",
            ));
        }
        let increasing = points.windows(2).all(|w| w[0].0 < w[1].0);
        let decreasing = points.windows(2).all(|w| w[0].0 > w[1].0);
        if !increasing && !decreasing {
            return Err(ExpError::config(
                "calibration resistances must be strictly monotonic",
            ));
        }

        let mut points = points;
        if !increasing {
            points.reverse();
        }
        Ok(Self { points })
    }

    /// Load a CSV file with `resistance_ohm,temperature_k` columns; lines
    /// starting with `#` are ignored.
    pub fn from_csv_path(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref();
        let file = std::fs::File::open(path).map_err(|e| {
            ExpError::config(format!("cannot open calibration file {}: {}", path.display(), e))
        })?;
        Self::from_reader(file)
    }

    pub fn from_reader<R: Read>(reader: R) -> AppResult<Self> {
        let mut csv = csv::ReaderBuilder::new()
            .comment(Some(b'#'))
            .trim(csv::Trim::All)
            .from_reader(reader);
        let points = csv
            .deserialize::<CalibrationRow>()
            .map(|row| {
                row.map(|r| (r.resistance_ohm, r.temperature_k))
                    .map_err(|e| ExpError::config(format!("invalid calibration row: {}", e)))
            })
            .collect::<AppResult<Vec<_>>>()?;
        Self::new(points)
    }

    /// Temperature for `resistance`, or `None` outside the calibrated range.
    pub fn temperature(&self, resistance: f64) -> Option<f64> {
        if !resistance.is_finite() {
            return None;
        }
        let (min_r, max_r) = self.range();
        if resistance < min_r || resistance > max_r {
            return None;
        }
        if let [(_, t)] = self.points.as_slice() {
            return Some(*t);
        }

        let upper = self
            .points
            .partition_point(|(r, _)| *r < resistance)
            .clamp(1, self.points.len() - 1);
        let (r0, t0) = self.points[upper - 1];
        let (r1, t1) = self.points[upper];
        Some(t0 + (resistance - r0) * (t1 - t0) / (r1 - r0))
    }

    /// Lowest and highest calibrated resistance.
    pub fn range(&self) -> (f64, f64) {
        let first = self.points[0].0;
        let last = self.points[self.points.len() - 1].0;
        (first, last)
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// One thermometer reading.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TemperatureSample {
    pub timestamp: DateTime<Utc>,
    pub resistance_ohm: f64,
    pub temperature_k: f64,
}

pub struct ResistanceThermometer {
    meter: Arc<dyn ResistanceMeter>,
    calibration: CalibrationTable,
    excitation_current: f64,
}

impl ResistanceThermometer {
    pub fn new(
        meter: Arc<dyn ResistanceMeter>,
        calibration: CalibrationTable,
        excitation_current: f64,
    ) -> AppResult<Self> {
        if !excitation_current.is_finite() || excitation_current <= 0.0 {
            return Err(ExpError::config(format!(
                "excitation current {} A must be positive",
                excitation_current
            )));
        }
        Ok(Self {
            meter,
            calibration,
            excitation_current,
        })
    }

    pub fn calibration(&self) -> &CalibrationTable {
        &self.calibration
    }

    /// Mean of the `+I` and `-I` readings.
    pub async fn measure_resistance(&self) -> AppResult<f64> {
        let forward = self.read_at(self.excitation_current).await?;
        let reverse = self.read_at(-self.excitation_current).await?;
        debug!(
            instrument = %self.meter.name(),
            forward_ohm = forward,
            reverse_ohm = reverse,
            "reversed-polarity readings"
        );
        Ok((forward + reverse) / 2.0)
    }

    pub async fn measure(&self) -> AppResult<TemperatureSample> {
        let resistance = self.measure_resistance().await?;
        let temperature = self.calibration.temperature(resistance).ok_or_else(|| {
            let (min_r, max_r) = self.calibration.range();
            ExpError::instrument(
                self.meter.name(),
                format!(
                    "resistance {} Ω outside calibrated range [{}, {}] Ω",
                    resistance, min_r, max_r
                ),
            )
        })?;
        Ok(TemperatureSample {
            timestamp: Utc::now(),
            resistance_ohm: resistance,
            temperature_k: temperature,
        })
    }

    /// Sample temperature in kelvin.
    pub async fn measure_temperature(&self) -> AppResult<f64> {
        Ok(self.measure().await?.temperature_k)
    }

    async fn read_at(&self, current: f64) -> AppResult<f64> {
        self.meter.set_source_current(current).await?;
        self.meter.set_output(true).await?;
        let reading = self.meter.read_resistance().await;
        let switched_off = self.meter.set_output(false).await;

        let resistance = match (reading, switched_off) {
            (Ok(r), Ok(())) => r,
            (Ok(_), Err(err)) => return Err(err),
            (Err(err), Ok(())) => return Err(err),
            (Err(err), Err(cleanup)) => {
                warn!(
                    instrument = %self.meter.name(),
                    error = %cleanup,
                    "failed to disable output after failed reading"
                );
                return Err(err);
            }
        };

        if !resistance.is_finite() || resistance < 0.0 {
            return Err(ExpError::instrument(
                self.meter.name(),
                format!("unphysical resistance reading {}", resistance),
            ));
        }
        Ok(resistance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::sim::{SimulatedLab, SimulatedResistanceMeter};

    fn thermometer(r_pos: f64, r_neg: f64, table: CalibrationTable) -> (ResistanceThermometer, Arc<SimulatedResistanceMeter>) {
        let meter = Arc::new(SimulatedResistanceMeter::new("smu", r_pos, r_neg));
        (
            ResistanceThermometer::new(meter.clone(), table, 10e-6).unwrap(),
            meter,
        )
    }

    #[tokio::test]
    async fn averages_reversed_polarity_readings() {
        let table = CalibrationTable::new(vec![(101.0, 4.2)]).unwrap();
        let (thermometer, meter) = thermometer(100.0, 102.0, table);

        assert_eq!(thermometer.measure_temperature().await.unwrap(), 4.2);
        assert_eq!(meter.reading_count(), 2);
        assert!(!meter.output_enabled());
    }

    #[tokio::test]
    async fn negative_reading_is_an_instrument_fault() {
        let (thermometer, _) = thermometer(100.0, -5.0, SimulatedLab::calibration().unwrap());
        assert!(matches!(
            thermometer.measure_resistance().await,
            Err(ExpError::InstrumentFault { .. })
        ));
    }

    #[tokio::test]
    async fn nan_reading_is_an_instrument_fault() {
        let (thermometer, _) = thermometer(f64::NAN, 100.0, SimulatedLab::calibration().unwrap());
        assert!(thermometer.measure_resistance().await.is_err());
    }

    #[tokio::test]
    async fn output_is_disabled_after_failed_read() {
        let (thermometer, meter) = thermometer(100.0, 100.0, SimulatedLab::calibration().unwrap());
        meter.fail_after("read", 0);
        assert!(thermometer.measure_resistance().await.is_err());
        assert!(!meter.output_enabled());
    }

    #[tokio::test]
    async fn out_of_range_resistance_is_reported() {
        let (thermometer, _) = thermometer(50.0, 50.0, SimulatedLab::calibration().unwrap());
        assert!(matches!(
            thermometer.measure().await,
            Err(ExpError::InstrumentFault { .. })
        ));
    }

    #[test]
    fn interpolates_between_points() {
        let table = CalibrationTable::new(vec![(1000.0, 4.0), (500.0, 20.0), (100.0, 300.0)]).unwrap();
        assert_eq!(table.range(), (100.0, 1000.0));
        assert_eq!(table.temperature(500.0), Some(20.0));
        assert!((table.temperature(750.0).unwrap() - 12.0).abs() < 1e-12);
        assert_eq!(table.temperature(1000.0), Some(4.0));
        assert_eq!(table.temperature(1000.1), None);
    }

    #[test]
    fn single_point_table_matches_exactly() {
        let table = CalibrationTable::new(vec![(101.0, 4.2)]).unwrap();
        assert_eq!(table.temperature(101.0), Some(4.2));
        assert_eq!(table.temperature(101.5), None);
    }

    #[test]
    fn rejects_non_monotonic_table() {
        assert!(CalibrationTable::new(vec![(1.0, 1.0), (3.0, 2.0), (2.0, 3.0)]).is_err());
        assert!(CalibrationTable::new(vec![(1.0, 1.0), (1.0, 2.0)]).is_err());
        assert!(CalibrationTable::new(Vec::new()).is_err());
    }

    #[test]
    fn loads_csv_with_comments() {
        let csv = "# RuOx sensor\nresistance_ohm,temperature_k\n100, 300\n1000, 4.2\n";
        let table = CalibrationTable::from_reader(csv.as_bytes()).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.temperature(100.0), Some(300.0));
    }

    #[test]
    fn loads_csv_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cal.csv");
        std::fs::write(&path, "resistance_ohm,temperature_k\n2000,1.5\n1000,4.2\n").unwrap();
        let table = CalibrationTable::from_csv_path(&path).unwrap();
        assert_eq!(table.range(), (1000.0, 2000.0));
        assert!(CalibrationTable::from_csv_path(dir.path().join("missing.csv")).is_err());
    }
}
