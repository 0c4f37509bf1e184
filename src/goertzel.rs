//! Host-side Goertzel filters.
//!
//! [`GoertzelEngine`] has two entry points. The fixed-point one takes the
//! recurrence state a sensor node reported and finishes the computation the
//! way the node's integer arithmetic does, so the host and the node agree to
//! the last bit. The basic one runs the whole floating point recurrence over
//! a raw sample buffer, giving an estimate that does not depend on anything
//! the node computed.

use log::debug;
use std::f64::consts::PI;

use crate::config::SensorConfig;
use crate::estimator::{AnalysisError, AnalysisInput, PowerEstimate, PowerEstimator};
use crate::frame_decoder::GoertzelRecord;

/// The node's power term in integer arithmetic.
///
/// `cross = (c·Q1·Q2) >> cross_shift` and
/// `raw = (Q1² + Q2² − cross) >> shift`, both arithmetic shifts, so negative
/// intermediates floor toward −∞ like the node's. A negative result is
/// clamped to zero. Intermediates beyond `i128` saturate.
pub fn fixed_point_power(q1: i64, q2: i64, c: i64, cross_shift: u32, shift: u32) -> u64 {
    let (q1, q2, c) = (i128::from(q1), i128::from(q2), i128::from(c));
    let product = (c * q1).checked_mul(q2).unwrap_or_else(|| {
        if (c < 0) ^ (q1 < 0) ^ (q2 < 0) {
            i128::MIN
        } else {
            i128::MAX
        }
    });
    let cross = product >> cross_shift.min(127);
    let raw = (q1 * q1).saturating_add(q2 * q2).saturating_sub(cross) >> shift.min(127);
    u64::try_from(raw.max(0)).unwrap_or(u64::MAX)
}

/// The DFT bin the node's filter is tuned to for `frequency`.
pub fn target_bin(frequency: f64, sample_rate: f64, frame_len: usize) -> f64 {
    (frame_len as f64 * frequency / sample_rate).round()
}

/// `2·cos(2πk/N)` for the bin nearest to `frequency`.
pub fn coefficient(frequency: f64, sample_rate: f64, frame_len: usize) -> f64 {
    let k = target_bin(frequency, sample_rate, frame_len);
    2.0 * (2.0 * PI * k / frame_len as f64).cos()
}

/// Goertzel power computations parameterised by the sensor constants.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GoertzelEngine {
    sensor: SensorConfig,
}

impl GoertzelEngine {
    /// An engine for the given sensor.
    pub fn new(sensor: SensorConfig) -> Self {
        Self { sensor }
    }

    /// The constants in use.
    pub fn sensor(&self) -> &SensorConfig {
        &self.sensor
    }

    /// `(2/N)²`, the window normalisation both entry points apply.
    pub fn window_gain(&self) -> f64 {
        (2.0 / self.sensor.frame_len as f64).powi(2)
    }

    /// The integer power the node would compute from its reported state.
    pub fn raw_power(&self, q1: i64, q2: i64, c: i64) -> u64 {
        fixed_point_power(
            q1,
            q2,
            c,
            self.sensor.cross_term_shift,
            self.sensor.fixed_point_shift,
        )
    }

    /// Window-normalised power in ADC counts² from reported node state.
    ///
    /// `q0` is part of the node's reported state but does not enter the
    /// power term.
    pub fn power(&self, _q0: i64, q1: i64, q2: i64, c: i64) -> f64 {
        self.raw_power(q1, q2, c) as f64 * self.window_gain()
    }

    /// The node-equivalent estimate for one reported row.
    pub fn node_estimate(&self, record: &GoertzelRecord) -> PowerEstimate {
        let power = self.power(record.q0, record.q1, record.q2, record.coefficient);
        PowerEstimate::from_adc_power(record.frequency, power, &self.sensor)
    }

    /// Runs the two-pole recurrence over all of `samples` and returns the
    /// window-normalised power at `frequency`, in the units of the samples
    /// squared.
    pub fn basic_goertzel(&self, samples: &[f64], frequency: f64) -> Result<f64, AnalysisError> {
        let sample_rate = self.sensor.sample_rate;
        if !(sample_rate.is_finite() && sample_rate > 0.0) {
            return Err(AnalysisError::InvalidSampleRate(sample_rate));
        }
        if samples.is_empty() {
            return Err(AnalysisError::InsufficientSamples {
                found: 0,
                required: 1,
            });
        }

        let n = samples.len();
        let coeff = coefficient(frequency, sample_rate, n);
        let (mut q1, mut q2) = (0.0, 0.0);
        for &x in samples {
            let q0 = x + coeff * q1 - q2;
            q2 = q1;
            q1 = q0;
        }

        Ok((q1 * q1 + q2 * q2 - coeff * q1 * q2) * (2.0 / n as f64).powi(2))
    }

    /// The edge-equivalent estimate at `frequency`, computed from the first
    /// frame of raw ADC samples with the zero offset removed.
    pub fn edge_estimate(
        &self,
        samples: &[f64],
        frequency: f64,
    ) -> Result<PowerEstimate, AnalysisError> {
        let frame = self.centred_frame(samples)?;
        let power = self.basic_goertzel(&frame, frequency)?;
        Ok(PowerEstimate::from_adc_power(frequency, power, &self.sensor))
    }

    /// The first `frame_len` samples minus the ADC zero offset.
    pub(crate) fn centred_frame(&self, samples: &[f64]) -> Result<Vec<f64>, AnalysisError> {
        let frame = AnalysisInput::new(samples, &[]).frame(self.sensor.frame_len.max(1))?;
        Ok(frame.iter().map(|x| x - self.sensor.zero_offset).collect())
    }

    /// This engine as the node-equivalent [`PowerEstimator`].
    pub fn fixed_point(&self) -> FixedPointEstimator {
        FixedPointEstimator {
            engine: self.clone(),
        }
    }

    /// This engine as the edge-equivalent [`PowerEstimator`].
    pub fn basic(&self) -> BasicGoertzelEstimator {
        BasicGoertzelEstimator {
            engine: self.clone(),
        }
    }
}

/// Finishes the node's own computation from the rows it reported.
#[derive(Debug, Clone)]
pub struct FixedPointEstimator {
    engine: GoertzelEngine,
}

impl PowerEstimator for FixedPointEstimator {
    fn name(&self) -> &'static str {
        "node"
    }

    fn estimate(&self, input: &AnalysisInput<'_>) -> Result<Vec<PowerEstimate>, AnalysisError> {
        Ok(input
            .records
            .iter()
            .map(|r| self.engine.node_estimate(r))
            .collect())
    }
}

/// Recomputes every target frequency from the raw samples.
#[derive(Debug, Clone)]
pub struct BasicGoertzelEstimator {
    engine: GoertzelEngine,
}

impl PowerEstimator for BasicGoertzelEstimator {
    fn name(&self) -> &'static str {
        "edge"
    }

    fn estimate(&self, input: &AnalysisInput<'_>) -> Result<Vec<PowerEstimate>, AnalysisError> {
        let frame = self.engine.centred_frame(input.samples)?;
        debug!(
            "Basic Goertzel over {} samples for {} targets",
            frame.len(),
            input.records.len()
        );

        input
            .target_frequencies()
            .into_iter()
            .map(|f| {
                let power = self.engine.basic_goertzel(&frame, f)?;
                Ok(PowerEstimate::from_adc_power(f, power, self.engine.sensor()))
            })
            .collect()
    }
}
