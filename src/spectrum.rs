//! A plain discrete Fourier transform, used as ground truth for the
//! Goertzel paths.
//!
//! Every bin costs a full pass over the buffer, so a frame of N samples costs
//! O(N²). That is fine for one node frame and nothing else.

use log::debug;
use std::f64::consts::PI;

use crate::config::SensorConfig;
use crate::estimator::{AnalysisError, AnalysisInput, PowerEstimate, PowerEstimator};
use crate::goertzel::GoertzelEngine;

/// A one-sided power spectrum: bins `0..N/2`, each `(2/N·|X[k]|)²`, with the
/// DC bin zeroed.
#[derive(Debug, Clone, PartialEq)]
pub struct Spectrum {
    bin_width: f64,
    powers: Vec<f64>,
}

impl Spectrum {
    /// Transforms `samples` taken at `sample_rate`.
    pub fn compute(samples: &[f64], sample_rate: f64) -> Result<Self, AnalysisError> {
        if !(sample_rate.is_finite() && sample_rate > 0.0) {
            return Err(AnalysisError::InvalidSampleRate(sample_rate));
        }
        let n = samples.len();
        if n < 2 {
            return Err(AnalysisError::InsufficientSamples {
                found: n,
                required: 2,
            });
        }

        let scale = 2.0 / n as f64;
        let mut powers: Vec<f64> = (0..n / 2)
            .map(|k| {
                let (re, im) = samples
                    .iter()
                    .enumerate()
                    .fold((0.0, 0.0), |(re, im), (i, &x)| {
                        let angle = -2.0 * PI * (k * i) as f64 / n as f64;
                        (re + x * angle.cos(), im + x * angle.sin())
                    });
                (scale * (re * re + im * im).sqrt()).powi(2)
            })
            .collect();
        powers[0] = 0.0;

        Ok(Self {
            bin_width: sample_rate / n as f64,
            powers,
        })
    }

    /// Hz between adjacent bins.
    pub fn bin_width(&self) -> f64 {
        self.bin_width
    }

    /// Bin powers, lowest frequency first.
    pub fn powers(&self) -> &[f64] {
        &self.powers
    }

    /// Centre frequency of bin `index`.
    pub fn frequency_of(&self, index: usize) -> f64 {
        index as f64 * self.bin_width
    }

    /// `(frequency, power)` for every bin.
    pub fn bins(&self) -> impl Iterator<Item = (f64, f64)> + '_ {
        self.powers
            .iter()
            .enumerate()
            .map(|(i, &p)| (self.frequency_of(i), p))
    }

    /// The bin whose centre is closest to `frequency`. On a tie the lower
    /// bin wins.
    pub fn nearest_bin(&self, frequency: f64) -> usize {
        let mut best = 0;
        for i in 1..self.powers.len() {
            let distance = (self.frequency_of(i) - frequency).abs();
            if distance < (self.frequency_of(best) - frequency).abs() {
                best = i;
            }
        }
        best
    }

    /// Power of the bin nearest to `frequency`.
    pub fn power_at(&self, frequency: f64) -> f64 {
        self.powers[self.nearest_bin(frequency)]
    }
}

/// Computes the reference estimate for each target frequency from one node
/// frame of raw ADC samples.
#[derive(Debug, Clone, Default)]
pub struct ReferenceSpectrumEngine {
    sensor: SensorConfig,
}

impl ReferenceSpectrumEngine {
    /// An engine for the given sensor.
    pub fn new(sensor: SensorConfig) -> Self {
        Self { sensor }
    }

    /// The spectrum of the first frame of `samples` in ADC counts², zero
    /// offset removed.
    pub fn spectrum(&self, samples: &[f64]) -> Result<Spectrum, AnalysisError> {
        let frame = GoertzelEngine::new(self.sensor.clone()).centred_frame(samples)?;
        Spectrum::compute(&frame, self.sensor.sample_rate)
    }

    /// One estimate per entry of `targets`, read off the nearest bin.
    pub fn estimates(
        &self,
        samples: &[f64],
        targets: &[f64],
    ) -> Result<Vec<PowerEstimate>, AnalysisError> {
        let spectrum = self.spectrum(samples)?;
        debug!(
            "Reference spectrum: {} bins of {:.3} Hz",
            spectrum.powers().len(),
            spectrum.bin_width()
        );
        Ok(targets
            .iter()
            .map(|&f| PowerEstimate::from_adc_power(f, spectrum.power_at(f), &self.sensor))
            .collect())
    }
}

impl PowerEstimator for ReferenceSpectrumEngine {
    fn name(&self) -> &'static str {
        "reference"
    }

    fn estimate(&self, input: &AnalysisInput<'_>) -> Result<Vec<PowerEstimate>, AnalysisError> {
        self.estimates(input.samples, &input.target_frequencies())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dc_is_removed_and_bins_are_one_sided() {
        let samples = vec![3.0; 64];
        let spectrum = Spectrum::compute(&samples, 64.0).unwrap();
        assert_eq!(spectrum.powers().len(), 32);
        assert_eq!(spectrum.bin_width(), 1.0);
        assert!(spectrum.powers().iter().all(|&p| p.abs() < 1e-18));
    }

    #[test]
    fn tone_lands_in_its_bin() {
        let n = 128;
        let samples: Vec<f64> = (0..n)
            .map(|i| 2.0 * (2.0 * PI * 10.0 * i as f64 / n as f64).cos())
            .collect();
        let spectrum = Spectrum::compute(&samples, n as f64).unwrap();
        assert!((spectrum.powers()[10] - 4.0).abs() < 1e-9);
        assert!(spectrum.powers()[11] < 1e-12);
        assert_eq!(spectrum.bins().nth(10), Some((10.0, spectrum.powers()[10])));
    }

    #[test]
    fn nearest_bin_prefers_lower_on_tie() {
        let spectrum = Spectrum::compute(&[0.0; 8], 8.0).unwrap();
        assert_eq!(spectrum.nearest_bin(1.5), 1);
        assert_eq!(spectrum.nearest_bin(1.6), 2);
        assert_eq!(spectrum.nearest_bin(-4.0), 0);
        assert_eq!(spectrum.nearest_bin(100.0), 3);
    }

    #[test]
    fn rejects_degenerate_input() {
        assert!(matches!(
            Spectrum::compute(&[1.0], 10.0),
            Err(AnalysisError::InsufficientSamples { found: 1, .. })
        ));
        assert!(matches!(
            Spectrum::compute(&[1.0, 2.0], f64::NAN),
            Err(AnalysisError::InvalidSampleRate(r)) if r.is_nan()
        ));
    }

    #[test]
    fn agrees_with_basic_goertzel_on_bin_centred_tone() {
        let sensor = SensorConfig::default();
        let freq = 30.0 * sensor.sample_rate / sensor.frame_len as f64;
        let samples: Vec<f64> = (0..sensor.frame_len)
            .map(|n| {
                sensor.zero_offset
                    + 80.0 * (2.0 * PI * freq * n as f64 / sensor.sample_rate).sin()
                    + 20.0 * (2.0 * PI * 3.0 * freq * n as f64 / sensor.sample_rate).cos()
            })
            .collect();

        let reference = ReferenceSpectrumEngine::new(sensor.clone());
        let goertzel = GoertzelEngine::new(sensor);
        for target in [freq, 3.0 * freq] {
            let dft = reference.estimates(&samples, &[target]).unwrap()[0];
            let edge = goertzel.edge_estimate(&samples, target).unwrap();
            assert!((dft.power_adc - edge.power_adc).abs() < 1e-6 * edge.power_adc);
            assert!((dft.power_g2 - edge.power_g2).abs() < 1e-6 * edge.power_g2);
        }
    }
}
