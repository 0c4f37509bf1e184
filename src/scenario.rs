//! Energy and latency of the two ways of getting a spectrum off the node.
//!
//! In the streaming scenario the node ships every raw sample and the host
//! does the maths; in the on-node scenario the node runs the Goertzel filter
//! itself and only ships the table. Both were measured at a handful of frame
//! sizes. Other sizes are read off fixed linear models of those
//! measurements.

use serde::Serialize;

use crate::comparison::{percent_difference, RegressionModel};

/// Measured energy per frame in mJ: (size, streaming, on node).
const ENERGY_MJ: [(u32, f64, f64); 5] = [
    (100, 8.432024, 3.7971663),
    (250, 19.249107, 5.570224),
    (480, 38.213902, 8.583681),
    (600, 46.186567, 9.261920),
    (1000, 78.265910, 14.412746),
];

/// Measured latency per frame in ms: (size, streaming, on node).
const LATENCY_MS: [(u32, f64, f64); 5] = [
    (100, 45.2, 23.8),
    (250, 89.7, 41.3),
    (480, 156.4, 67.9),
    (600, 187.3, 78.2),
    (1000, 298.6, 112.4),
];

/// The sizes that were measured.
pub const MEASURED_SIZES: [u32; 5] = [100, 250, 480, 600, 1000];

/// What is being compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    /// Energy per frame, mJ
    Energy,
    /// Time per frame, ms
    Latency,
}

impl Metric {
    /// Display unit.
    pub fn unit(&self) -> &'static str {
        match self {
            Metric::Energy => "mJ",
            Metric::Latency => "ms",
        }
    }

    fn table(&self) -> &'static [(u32, f64, f64)] {
        match self {
            Metric::Energy => &ENERGY_MJ,
            Metric::Latency => &LATENCY_MS,
        }
    }

    /// Models used for sizes that were not measured, as
    /// (streaming, on node).
    fn models(&self) -> (RegressionModel, RegressionModel) {
        match self {
            Metric::Energy => (
                RegressionModel::fixed(0.0777, 0.8965),
                RegressionModel::fixed(0.0142, 2.4681),
            ),
            Metric::Latency => (
                RegressionModel::fixed(0.297, 15.2),
                RegressionModel::fixed(0.108, 12.8),
            ),
        }
    }
}

/// Both scenarios at one frame size.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ScenarioPoint {
    /// Samples per frame
    pub size: u32,
    /// Streaming raw samples to the host
    pub streaming: f64,
    /// Goertzel on the node
    pub on_node: f64,
    /// `streaming − on_node`
    pub savings: f64,
    /// Savings as a percentage of `streaming`
    pub savings_percent: f64,
    /// Read off a model rather than measured
    pub extrapolated: bool,
}

impl ScenarioPoint {
    fn new(size: u32, streaming: f64, on_node: f64, extrapolated: bool) -> Self {
        Self {
            size,
            streaming,
            on_node,
            savings: streaming - on_node,
            savings_percent: -percent_difference(on_node, streaming),
            extrapolated,
        }
    }
}

/// Averages over the analysed sizes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ScenarioSummary {
    /// Mean of [`ScenarioPoint::savings`]
    pub average_savings: f64,
    /// Mean of [`ScenarioPoint::savings_percent`]
    pub average_savings_percent: f64,
}

/// Each scenario fitted against frame size.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ScenarioRegression {
    /// Streaming against size
    pub streaming: RegressionModel,
    /// On node against size
    pub on_node: RegressionModel,
}

/// The result of [`analyze`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScenarioAnalysis {
    /// What was compared
    pub metric: Metric,
    /// One point per requested size, in request order
    pub points: Vec<ScenarioPoint>,
    /// `None` when no sizes were requested
    pub summary: Option<ScenarioSummary>,
    /// Energy only, and only when at least two distinct sizes were requested
    pub regression: Option<ScenarioRegression>,
}

/// Both scenarios at `size`, measured where possible.
pub fn point(metric: Metric, size: u32) -> ScenarioPoint {
    match metric.table().iter().find(|(s, _, _)| *s == size) {
        Some(&(_, streaming, on_node)) => ScenarioPoint::new(size, streaming, on_node, false),
        None => {
            let (streaming, on_node) = metric.models();
            let x = f64::from(size);
            ScenarioPoint::new(size, streaming.predict(x), on_node.predict(x), true)
        }
    }
}

/// Compares the scenarios over `sizes`.
pub fn analyze(metric: Metric, sizes: &[u32]) -> ScenarioAnalysis {
    let points: Vec<ScenarioPoint> = sizes.iter().map(|&s| point(metric, s)).collect();

    let summary = (!points.is_empty()).then(|| {
        let n = points.len() as f64;
        ScenarioSummary {
            average_savings: points.iter().map(|p| p.savings).sum::<f64>() / n,
            average_savings_percent: points.iter().map(|p| p.savings_percent).sum::<f64>() / n,
        }
    });

    let regression = match metric {
        Metric::Energy => {
            let x: Vec<f64> = points.iter().map(|p| f64::from(p.size)).collect();
            let streaming: Vec<f64> = points.iter().map(|p| p.streaming).collect();
            let on_node: Vec<f64> = points.iter().map(|p| p.on_node).collect();
            RegressionModel::fit(&x, &streaming)
                .and_then(|s| Ok((s, RegressionModel::fit(&x, &on_node)?)))
                .ok()
                .map(|(streaming, on_node)| ScenarioRegression { streaming, on_node })
        }
        Metric::Latency => None,
    };

    ScenarioAnalysis {
        metric,
        points,
        summary,
        regression,
    }
}
