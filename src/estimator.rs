//! The common shape of every power estimate, and the trait the estimators
//! implement so the comparison code does not care which one it is holding.

use serde::Serialize;
use thiserror::Error;

use crate::config::SensorConfig;
use crate::frame_decoder::GoertzelRecord;

/// Things that stop an estimate from being computed.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AnalysisError {
    /// The sample buffer is shorter than one node frame
    #[error("Insufficient raw data samples: {found}. Expected at least {required}.")]
    InsufficientSamples {
        /// Samples supplied
        found: usize,
        /// Samples needed
        required: usize,
    },
    /// The sample rate is zero, negative or not a number
    #[error("invalid sample rate {0}")]
    InvalidSampleRate(f64),
}

/// The power at one frequency, in the three units the analysis reports.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PowerEstimate {
    /// Frequency in Hz
    pub frequency: f64,
    /// Power in ADC counts²
    pub power_adc: f64,
    /// Power in g²
    pub power_g2: f64,
    /// Power in (m/s²)²
    pub power_ms2: f64,
}

impl PowerEstimate {
    /// Builds an estimate from a power in ADC counts², deriving the
    /// physical units from `sensor`.
    pub fn from_adc_power(frequency: f64, power_adc: f64, sensor: &SensorConfig) -> Self {
        let power_g2 = sensor.adc_power_to_g2(power_adc);
        Self {
            frequency,
            power_adc,
            power_g2,
            power_ms2: sensor.g2_to_ms2(power_g2),
        }
    }
}

/// What an estimator gets to look at: a raw ADC sample buffer and the rows
/// the node reported. The rows also name the target frequencies.
#[derive(Debug, Clone, Copy)]
pub struct AnalysisInput<'a> {
    /// Raw ADC readings, oldest first
    pub samples: &'a [f64],
    /// The node's reported rows, one per target frequency
    pub records: &'a [GoertzelRecord],
}

impl<'a> AnalysisInput<'a> {
    /// Bundles the two inputs.
    pub fn new(samples: &'a [f64], records: &'a [GoertzelRecord]) -> Self {
        Self { samples, records }
    }

    /// The target frequencies, in record order.
    pub fn target_frequencies(&self) -> Vec<f64> {
        self.records.iter().map(|r| r.frequency).collect()
    }

    /// The first `frame_len` samples, the same window the node used.
    pub fn frame(&self, frame_len: usize) -> Result<&'a [f64], AnalysisError> {
        if self.samples.len() < frame_len {
            return Err(AnalysisError::InsufficientSamples {
                found: self.samples.len(),
                required: frame_len,
            });
        }
        Ok(&self.samples[..frame_len])
    }
}

/// Something that produces one [`PowerEstimate`] per target frequency.
pub trait PowerEstimator {
    /// Short label used in reports and logs.
    fn name(&self) -> &'static str;

    /// One estimate per target frequency, in the order of
    /// [`AnalysisInput::target_frequencies`].
    fn estimate(&self, input: &AnalysisInput<'_>) -> Result<Vec<PowerEstimate>, AnalysisError>;
}
