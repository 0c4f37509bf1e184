//! Statistics for putting two power estimates side by side.
//!
//! The building blocks are [`percent_difference`], least squares
//! [`RegressionModel`]s and the Pearson [`Correlation`]. The
//! [`ComparisonAnalyzer`] ties them together: given a raw sample buffer and
//! the rows the node reported, it produces node, edge and reference
//! estimates per frequency and says how well the node agrees with the edge.

use log::{debug, info};
use serde::Serialize;
use statrs::distribution::{ContinuousCDF, StudentsT};
use thiserror::Error;

use crate::config::SensorConfig;
use crate::estimator::{AnalysisError, AnalysisInput, PowerEstimate, PowerEstimator};
use crate::frame_decoder::GoertzelRecord;
use crate::goertzel::GoertzelEngine;
use crate::spectrum::ReferenceSpectrumEngine;

/// Frequencies closer than this are treated as the same target.
const FREQUENCY_TOLERANCE: f64 = 1e-6;

/// Things that stop a comparison.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ComparisonError {
    /// All x values are identical, so no line can be fitted
    #[error("regression is undefined: x has zero variance")]
    Undefined,
    /// The two series differ in length
    #[error("series lengths differ: {0} x values, {1} y values")]
    LengthMismatch(usize, usize),
    /// Not enough points for the statistic
    #[error("need at least {required} points, got {found}")]
    TooFewPoints {
        /// Points supplied
        found: usize,
        /// Points needed
        required: usize,
    },
    /// An estimator failed
    #[error(transparent)]
    Analysis(#[from] AnalysisError),
}

/// `100·(a − b)/b`, or zero when `b` is zero.
pub fn percent_difference(a: f64, b: f64) -> f64 {
    if b == 0.0 {
        0.0
    } else {
        100.0 * (a - b) / b
    }
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

fn check_series(x: &[f64], y: &[f64], required: usize) -> Result<(), ComparisonError> {
    if x.len() != y.len() {
        return Err(ComparisonError::LengthMismatch(x.len(), y.len()));
    }
    if x.len() < required {
        return Err(ComparisonError::TooFewPoints {
            found: x.len(),
            required,
        });
    }
    Ok(())
}

/// One frequency seen by two estimators.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ComparisonRecord {
    /// Target frequency in Hz
    pub frequency: f64,
    /// The estimate under test
    pub estimate: PowerEstimate,
    /// The estimate it is measured against
    pub baseline: PowerEstimate,
    /// `percent_difference(estimate, baseline)` on the g² values
    pub difference_percent: f64,
}

/// Pairs each estimate in `estimates` with the baseline at the same
/// frequency. Estimates with no baseline are left out.
pub fn compare(estimates: &[PowerEstimate], baselines: &[PowerEstimate]) -> Vec<ComparisonRecord> {
    estimates
        .iter()
        .filter_map(|e| {
            let baseline = baselines
                .iter()
                .find(|b| (b.frequency - e.frequency).abs() < FREQUENCY_TOLERANCE);
            if baseline.is_none() {
                debug!("No baseline at {} Hz", e.frequency);
            }
            baseline.map(|b| ComparisonRecord {
                frequency: e.frequency,
                estimate: *e,
                baseline: *b,
                difference_percent: percent_difference(e.power_g2, b.power_g2),
            })
        })
        .collect()
}

/// A straight line fitted by ordinary least squares.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RegressionModel {
    /// Change in y per unit x
    pub slope: f64,
    /// y at x = 0
    pub intercept: f64,
    /// Coefficient of determination, `None` when y is constant
    pub r_squared: Option<f64>,
    /// Smallest x the model was fitted on
    pub x_min: f64,
    /// Largest x the model was fitted on
    pub x_max: f64,
}

impl RegressionModel {
    /// Fits `y = slope·x + intercept` to the pairs `(x[i], y[i])`.
    pub fn fit(x: &[f64], y: &[f64]) -> Result<Self, ComparisonError> {
        check_series(x, y, 2)?;

        let (mean_x, mean_y) = (mean(x), mean(y));
        let (numerator, denominator) =
            x.iter()
                .zip(y)
                .fold((0.0, 0.0), |(num, den), (&xi, &yi)| {
                    (
                        num + (xi - mean_x) * (yi - mean_y),
                        den + (xi - mean_x).powi(2),
                    )
                });
        if denominator == 0.0 {
            return Err(ComparisonError::Undefined);
        }

        let slope = numerator / denominator;
        let intercept = mean_y - slope * mean_x;

        let ss_tot: f64 = y.iter().map(|yi| (yi - mean_y).powi(2)).sum();
        let ss_res: f64 = x
            .iter()
            .zip(y)
            .map(|(xi, yi)| (yi - (slope * xi + intercept)).powi(2))
            .sum();
        let r_squared = (ss_tot != 0.0).then(|| 1.0 - ss_res / ss_tot);

        Ok(Self {
            slope,
            intercept,
            r_squared,
            x_min: x.iter().copied().fold(f64::INFINITY, f64::min),
            x_max: x.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        })
    }

    /// A model with known coefficients and no fitting data behind it.
    pub fn fixed(slope: f64, intercept: f64) -> Self {
        Self {
            slope,
            intercept,
            r_squared: None,
            x_min: f64::NAN,
            x_max: f64::NAN,
        }
    }

    /// `slope·x + intercept`.
    pub fn predict(&self, x: f64) -> f64 {
        self.slope * x + self.intercept
    }

    /// Whether `x` lies outside the fitted range. Always true for a
    /// [`fixed`](Self::fixed) model.
    pub fn is_extrapolation(&self, x: f64) -> bool {
        !(x >= self.x_min && x <= self.x_max)
    }

    /// Predictions for `xs`, each flagged when it is outside the fitted
    /// range.
    pub fn extrapolate(&self, xs: &[f64]) -> Vec<Prediction> {
        xs.iter()
            .map(|&x| Prediction {
                x,
                y: self.predict(x),
                extrapolated: self.is_extrapolation(x),
            })
            .collect()
    }
}

/// One value read off a [`RegressionModel`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Prediction {
    /// Input
    pub x: f64,
    /// Predicted output
    pub y: f64,
    /// The input lies outside the data the model was fitted on
    pub extrapolated: bool,
}

/// Pearson correlation with a two tailed significance test.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Correlation {
    /// Pearson's r
    pub r: f64,
    /// Probability of an |r| at least this large from uncorrelated data
    pub p_value: f64,
    /// Number of pairs
    pub n: usize,
}

impl Correlation {
    /// Correlates `x` with `y`. A constant series gives `r = 0`.
    pub fn pearson(x: &[f64], y: &[f64]) -> Result<Self, ComparisonError> {
        check_series(x, y, 2)?;

        let n = x.len() as f64;
        let sum_x: f64 = x.iter().sum();
        let sum_y: f64 = y.iter().sum();
        let sum_xy: f64 = x.iter().zip(y).map(|(a, b)| a * b).sum();
        let sum_x2: f64 = x.iter().map(|a| a * a).sum();
        let sum_y2: f64 = y.iter().map(|a| a * a).sum();

        let numerator = n * sum_xy - sum_x * sum_y;
        let denominator = ((n * sum_x2 - sum_x.powi(2)) * (n * sum_y2 - sum_y.powi(2))).sqrt();
        let r = if denominator == 0.0 {
            0.0
        } else {
            (numerator / denominator).clamp(-1.0, 1.0)
        };

        Ok(Self {
            r,
            p_value: p_value_for_r(r, x.len()),
            n: x.len(),
        })
    }
}

/// Two tailed p-value of `r` over `n` pairs, from Student's t with `n − 2`
/// degrees of freedom.
fn p_value_for_r(r: f64, n: usize) -> f64 {
    if n < 3 {
        return 1.0;
    }
    if r.abs() >= 1.0 {
        return 0.0;
    }

    let df = (n - 2) as f64;
    let t = r * df.sqrt() / (1.0 - r * r).sqrt();
    match StudentsT::new(0.0, 1.0, df) {
        Ok(dist) => 2.0 * (1.0 - dist.cdf(t.abs())),
        Err(_) => 1.0,
    }
}

/// Which rows take part in a comparison run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ComparisonOptions {
    /// Ignore rows above this frequency
    pub freq_limit: Option<f64>,
    /// When not empty, only these frequencies take part
    pub selected: Vec<f64>,
}

impl ComparisonOptions {
    fn admits(&self, frequency: f64) -> bool {
        let under_limit = self.freq_limit.map_or(true, |limit| frequency <= limit);
        let selected = self.selected.is_empty()
            || self
                .selected
                .iter()
                .any(|s| (s - frequency).abs() < FREQUENCY_TOLERANCE);
        under_limit && selected
    }
}

/// All three estimates at one frequency.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ComparisonRow {
    /// Target frequency in Hz
    pub frequency: f64,
    /// Fixed-point result from the node's own state
    pub node: PowerEstimate,
    /// Basic Goertzel over the raw samples
    pub edge: PowerEstimate,
    /// Nearest DFT bin over the raw samples
    pub reference: PowerEstimate,
    /// Node relative to edge, in percent
    pub difference_percent: f64,
}

/// Everything a comparison run produces.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComparisonReport {
    /// One row per admitted frequency, in record order
    pub rows: Vec<ComparisonRow>,
    /// Node against edge across all rows, when there are enough rows
    pub correlation: Option<Correlation>,
    /// Node power (g²) fitted against edge power (g²), when defined
    pub regression: Option<RegressionModel>,
}

impl ComparisonReport {
    /// Mean of the absolute percentage differences.
    pub fn mean_abs_difference(&self) -> Option<f64> {
        if self.rows.is_empty() {
            return None;
        }
        let total: f64 = self.rows.iter().map(|r| r.difference_percent.abs()).sum();
        Some(total / self.rows.len() as f64)
    }
}

/// Runs the estimators over one capture and compares them.
#[derive(Debug, Clone, Default)]
pub struct ComparisonAnalyzer {
    goertzel: GoertzelEngine,
    reference: ReferenceSpectrumEngine,
}

impl ComparisonAnalyzer {
    /// An analyzer for the given sensor.
    pub fn new(sensor: SensorConfig) -> Self {
        Self {
            goertzel: GoertzelEngine::new(sensor.clone()),
            reference: ReferenceSpectrumEngine::new(sensor),
        }
    }

    /// Compares any two estimators over the same input.
    pub fn compare_estimators(
        &self,
        estimator: &dyn PowerEstimator,
        baseline: &dyn PowerEstimator,
        input: &AnalysisInput<'_>,
    ) -> Result<Vec<ComparisonRecord>, ComparisonError> {
        debug!("Comparing {} against {}", estimator.name(), baseline.name());
        let estimates = estimator.estimate(input)?;
        let baselines = baseline.estimate(input)?;
        Ok(compare(&estimates, &baselines))
    }

    /// Node, edge and reference estimates for every admitted row, plus the
    /// node against edge statistics.
    pub fn run(
        &self,
        samples: &[f64],
        records: &[GoertzelRecord],
        options: &ComparisonOptions,
    ) -> Result<ComparisonReport, ComparisonError> {
        let admitted: Vec<GoertzelRecord> = records
            .iter()
            .filter(|r| options.admits(r.frequency))
            .copied()
            .collect();
        let input = AnalysisInput::new(samples, &admitted);

        let node = self.goertzel.fixed_point().estimate(&input)?;
        let edge = self.goertzel.basic().estimate(&input)?;
        let reference = self.reference.estimate(&input)?;

        let rows: Vec<ComparisonRow> = node
            .iter()
            .zip(&edge)
            .zip(&reference)
            .map(|((n, e), r)| ComparisonRow {
                frequency: n.frequency,
                node: *n,
                edge: *e,
                reference: *r,
                difference_percent: percent_difference(n.power_g2, e.power_g2),
            })
            .collect();

        let node_g2: Vec<f64> = rows.iter().map(|r| r.node.power_g2).collect();
        let edge_g2: Vec<f64> = rows.iter().map(|r| r.edge.power_g2).collect();
        let correlation = Correlation::pearson(&edge_g2, &node_g2).ok();
        let regression = RegressionModel::fit(&edge_g2, &node_g2).ok();

        info!(
            "Compared {} of {} frequencies (r = {})",
            rows.len(),
            records.len(),
            correlation.map_or("n/a".to_owned(), |c| format!("{:.4}", c.r))
        );

        Ok(ComparisonReport {
            rows,
            correlation,
            regression,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::PI;

    fn estimate(frequency: f64, power_g2: f64) -> PowerEstimate {
        PowerEstimate {
            frequency,
            power_adc: 0.0,
            power_g2,
            power_ms2: 0.0,
        }
    }

    #[test]
    fn percent_difference_handles_zero_baseline() {
        assert_eq!(percent_difference(110.0, 100.0), 10.0);
        assert_eq!(percent_difference(50.0, 100.0), -50.0);
        assert_eq!(percent_difference(5.0, 0.0), 0.0);
        assert_eq!(percent_difference(0.0, 0.0), 0.0);
    }

    #[test]
    fn records_compared_against_themselves_are_identical() {
        let records = [
            GoertzelRecord {
                frequency: 662.0,
                coefficient: 15217,
                q0: 6993149,
                q1: 6993149,
                q2: 5254142,
            },
            GoertzelRecord {
                frequency: 1000.0,
                coefficient: 13740,
                q0: 10,
                q1: 400000,
                q2: -250000,
            },
        ];
        let analyzer = ComparisonAnalyzer::default();
        let node = analyzer.goertzel.fixed_point();
        let input = AnalysisInput::new(&[], &records);

        let result = analyzer.compare_estimators(&node, &node, &input).unwrap();
        assert_eq!(result.len(), 2);
        assert!(result.iter().all(|r| r.difference_percent == 0.0));
    }

    #[test]
    fn compare_pairs_by_frequency() {
        let a = [estimate(100.0, 2.0), estimate(200.0, 3.0), estimate(300.0, 1.0)];
        let b = [estimate(300.0, 2.0), estimate(100.0, 1.0)];
        let result = compare(&a, &b);
        assert_eq!(result.len(), 2);
        assert_eq!(result[0].frequency, 100.0);
        assert_eq!(result[0].difference_percent, 100.0);
        assert_eq!(result[1].frequency, 300.0);
        assert_eq!(result[1].difference_percent, -50.0);
    }

    #[test]
    fn regression_recovers_exact_line() {
        let x = [1.0, 2.0, 3.0, 4.0, 10.0];
        let y: Vec<f64> = x.iter().map(|x| 2.0 * x + 1.0).collect();
        let model = RegressionModel::fit(&x, &y).unwrap();
        assert!((model.slope - 2.0).abs() < 1e-12);
        assert!((model.intercept - 1.0).abs() < 1e-12);
        assert!((model.r_squared.unwrap() - 1.0).abs() < 1e-12);

        let two = RegressionModel::fit(&[0.0, 1.0], &[1.0, 3.0]).unwrap();
        assert!((two.slope - 2.0).abs() < 1e-12);
    }

    #[test]
    fn regression_degenerate_inputs() {
        assert_eq!(
            RegressionModel::fit(&[3.0, 3.0, 3.0], &[1.0, 2.0, 3.0]),
            Err(ComparisonError::Undefined)
        );
        assert_eq!(
            RegressionModel::fit(&[1.0], &[1.0]),
            Err(ComparisonError::TooFewPoints {
                found: 1,
                required: 2
            })
        );
        assert_eq!(
            RegressionModel::fit(&[1.0, 2.0], &[1.0]),
            Err(ComparisonError::LengthMismatch(2, 1))
        );

        let flat = RegressionModel::fit(&[1.0, 2.0, 3.0], &[4.0, 4.0, 4.0]).unwrap();
        assert_eq!(flat.slope, 0.0);
        assert_eq!(flat.r_squared, None);
    }

    #[test]
    fn extrapolation_is_flagged() {
        let model = RegressionModel::fit(&[100.0, 1000.0], &[10.0, 100.0]).unwrap();
        let predictions = model.extrapolate(&[500.0, 2000.0]);
        assert!((predictions[0].y - 50.0).abs() < 1e-9);
        assert!(!predictions[0].extrapolated);
        assert!((predictions[1].y - 200.0).abs() < 1e-9);
        assert!(predictions[1].extrapolated);

        assert!(RegressionModel::fixed(1.0, 0.0).is_extrapolation(0.0));
    }

    #[test]
    fn correlation_and_significance() {
        let x: Vec<f64> = (0..20).map(f64::from).collect();
        let up: Vec<f64> = x.iter().map(|v| 3.0 * v - 2.0).collect();
        let down: Vec<f64> = x.iter().map(|v| -v).collect();

        let c = Correlation::pearson(&x, &up).unwrap();
        assert!((c.r - 1.0).abs() < 1e-12);
        assert!(c.p_value < 1e-9);
        assert_eq!(c.n, 20);
        assert!((Correlation::pearson(&x, &down).unwrap().r + 1.0).abs() < 1e-12);

        let flat = Correlation::pearson(&x, &[1.0; 20]).unwrap();
        assert_eq!(flat.r, 0.0);
        assert!((flat.p_value - 1.0).abs() < 1e-12);

        // r = 0.5 over 30 pairs is significant at 1%
        let p = p_value_for_r(0.5, 30);
        assert!(p > 0.001 && p < 0.01);
    }

    #[test]
    fn run_filters_and_compares() {
        let sensor = SensorConfig::default();
        let samples: Vec<f64> = (0..sensor.frame_len)
            .map(|n| {
                let t = n as f64 / sensor.sample_rate;
                sensor.zero_offset
                    + 100.0 * (2.0 * PI * 250.0 * t).sin()
                    + 40.0 * (2.0 * PI * 1000.0 * t).sin()
            })
            .collect();
        let row = |frequency| GoertzelRecord {
            frequency,
            coefficient: 0,
            q0: 0,
            q1: 0,
            q2: 0,
        };
        let records = [row(250.0), row(1000.0), row(2000.0)];
        let analyzer = ComparisonAnalyzer::new(sensor);

        let report = analyzer
            .run(
                &samples,
                &records,
                &ComparisonOptions {
                    freq_limit: Some(1500.0),
                    selected: vec![],
                },
            )
            .unwrap();
        assert_eq!(report.rows.len(), 2);
        assert_eq!(report.rows[1].frequency, 1000.0);
        // zero node power is -100% of a nonzero edge power
        assert!((report.rows[0].difference_percent + 100.0).abs() < 1e-9);
        assert!(report.rows[0].edge.power_g2 > report.rows[1].edge.power_g2);
        assert!(report.rows[0].reference.power_g2 > report.rows[1].reference.power_g2);
        assert_eq!(report.mean_abs_difference(), Some(100.0));

        let selected = analyzer
            .run(
                &samples,
                &records,
                &ComparisonOptions {
                    freq_limit: None,
                    selected: vec![2000.0],
                },
            )
            .unwrap();
        assert_eq!(selected.rows.len(), 1);
        assert!(selected.correlation.is_none());
        assert!(selected.regression.is_none());
    }

    #[test]
    fn run_needs_a_full_frame() {
        let analyzer = ComparisonAnalyzer::default();
        let err = analyzer
            .run(&[512.0; 100], &[], &ComparisonOptions::default())
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Insufficient raw data samples: 100. Expected at least 480."
        );
    }
}
