use polars::prelude::*;

use crate::sensor::{permute, SensorKind};
use crate::settings::Gain;

/// Highest raw count a channel can report before the 16-bit ADC clips
pub const SATURATION_LEVEL: f64 = 65_000.0;

/// Milliseconds per firmware integration tick, used to normalize calibrated counts
pub const MS_PER_INTEGRATION_CYCLE: f64 = 2.8;

const WAVELENGTH_COLUMN_NAME: &str = "wavelength_nm";
const RAW_COLUMN_NAME: &str = "raw";
const CALIBRATED_COLUMN_NAME: &str = "calibrated";
const NORMALIZED_COLUMN_NAME: &str = "normalized";

/// True if any raw channel exceeds [`SATURATION_LEVEL`]
pub fn check_saturation(raw_data: &[f64]) -> bool {
    raw_data.iter().any(|&v| v > SATURATION_LEVEL)
}

/// Scale calibrated counts to a per-millisecond basis
pub fn normalize(calibrated_data: &[f64], integration_cycles: u32) -> Vec<f64> {
    let scale = integration_cycles as f64 * MS_PER_INTEGRATION_CYCLE;
    calibrated_data.iter().map(|&c| c * 1000.0 / scale).collect()
}

/// One completed read cycle.
///
/// Channels are presented in ascending wavelength order. Values are only built by
/// the assembler once the end-of-read marker has been seen.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    sensor: SensorKind,
    wavelengths: Vec<u32>,
    raw_data: Vec<f64>,
    calibrated_data: Vec<f64>,
    norm_data: Vec<f64>,
    gain: Gain,
    integration_cycles: u32,
    saturated: bool,
    sort_index: Option<&'static [usize]>,
}

impl Reading {
    /// Build a reading from channel-ordered data, applying the sensor's sort index.
    ///
    /// Lengths must already match the sensor's channel count.
    pub(crate) fn from_channel_order(
        sensor: SensorKind,
        raw_data: Vec<f64>,
        calibrated_data: Vec<f64>,
        norm_data: Vec<f64>,
        gain: Gain,
        integration_cycles: u32,
        saturated: bool,
    ) -> Self {
        let sort_index = sensor.sort_index();

        let (wavelengths, raw_data, calibrated_data, norm_data) = match sort_index {
            Some(index) => (
                permute(sensor.wavelengths(), index),
                permute(&raw_data, index),
                permute(&calibrated_data, index),
                permute(&norm_data, index),
            ),
            None => (sensor.wavelengths().to_vec(), raw_data, calibrated_data, norm_data),
        };

        Self {
            sensor,
            wavelengths,
            raw_data,
            calibrated_data,
            norm_data,
            gain,
            integration_cycles,
            saturated,
            sort_index,
        }
    }

    pub fn sensor(&self) -> SensorKind {
        self.sensor
    }

    pub fn wavelengths(&self) -> &[u32] {
        &self.wavelengths
    }

    pub fn raw_data(&self) -> &[f64] {
        &self.raw_data
    }

    pub fn calibrated_data(&self) -> &[f64] {
        &self.calibrated_data
    }

    pub fn norm_data(&self) -> &[f64] {
        &self.norm_data
    }

    pub fn gain(&self) -> Gain {
        self.gain
    }

    pub fn integration_cycles(&self) -> u32 {
        self.integration_cycles
    }

    /// Integration time the device used, in milliseconds
    pub fn integration_time_ms(&self) -> f64 {
        self.integration_cycles as f64 * MS_PER_INTEGRATION_CYCLE
    }

    pub fn saturated(&self) -> bool {
        self.saturated
    }

    /// The permutation that was applied to reach wavelength order, if any
    pub fn sort_index(&self) -> Option<&'static [usize]> {
        self.sort_index
    }

    pub fn max_raw(&self) -> f64 {
        self.raw_data.iter().copied().fold(f64::NEG_INFINITY, f64::max)
    }

    /// One row per channel, ascending wavelength
    pub fn to_frame(&self) -> Result<DataFrame, PolarsError> {
        let wavelengths: Vec<u32> = self.wavelengths.clone();
        DataFrame::new(vec![
            Series::new(WAVELENGTH_COLUMN_NAME.into(), wavelengths).into(),
            Series::new(RAW_COLUMN_NAME.into(), self.raw_data.clone()).into(),
            Series::new(CALIBRATED_COLUMN_NAME.into(), self.calibrated_data.clone()).into(),
            Series::new(NORMALIZED_COLUMN_NAME.into(), self.norm_data.clone()).into(),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensor::AS7265X_WAVELENGTHS;

    #[test]
    fn test_check_saturation() {
        assert!(!check_saturation(&[0.0, 65_000.0]));
        assert!(check_saturation(&[0.0, 65_000.5]));
        assert!(!check_saturation(&[]));
    }

    #[test]
    fn test_normalize_formula() {
        let norm = normalize(&[10.0, 20.0, 28.0], 50);
        for (n, c) in norm.iter().zip([10.0, 20.0, 28.0]) {
            assert_eq!(*n, c * 1000.0 / (50.0 * 2.8));
        }
    }

    #[test]
    fn test_as7265x_reading_sorted_once() {
        // value = wavelength so sorted output must equal sorted wavelengths
        let raw: Vec<f64> = AS7265X_WAVELENGTHS.iter().map(|&w| w as f64).collect();
        let norm = normalize(&raw, 10);
        let reading = Reading::from_channel_order(
            SensorKind::As7265x,
            raw.clone(),
            raw,
            norm,
            Gain::X1,
            10,
            false,
        );

        let mut expected: Vec<u32> = AS7265X_WAVELENGTHS.to_vec();
        expected.sort_unstable();
        assert_eq!(reading.wavelengths(), expected.as_slice());
        let raw_as_u32: Vec<u32> = reading.raw_data().iter().map(|&v| v as u32).collect();
        assert_eq!(raw_as_u32, expected);
        assert!(reading.sort_index().is_some());
    }

    #[test]
    fn test_to_frame() {
        let data = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let reading = Reading::from_channel_order(
            SensorKind::As7262,
            data.clone(),
            data.clone(),
            normalize(&data, 1),
            Gain::X64,
            1,
            check_saturation(&data),
        );
        let df = reading.to_frame().unwrap();
        assert_eq!(df.height(), 6);
        assert_eq!(df.width(), 4);
        assert!(df.column(NORMALIZED_COLUMN_NAME).is_ok());
    }
}
