//! goertzel-link is the host side of a vibration sensor node that runs a
//! Goertzel filter on the node itself and prints the results over a serial
//! line, instead of streaming every raw sample to the host.
//!
//! The crate does two jobs. On the streaming side, a [`SerialLinkManager`]
//! owns the one serial connection, a [`FrameDecoder`](frame_decoder) turns
//! the node's tab separated table into [`GoertzelRecord`]s, and a
//! [`Broadcaster`] fans the decoded batches and link status out to every
//! consumer. On the analysis side, the node's fixed-point arithmetic is
//! replayed on the host ([`GoertzelEngine`]) and checked against a basic
//! floating point Goertzel filter and a plain DFT
//! ([`ReferenceSpectrumEngine`]) computed from a raw capture of the same
//! signal; the [`ComparisonAnalyzer`] reports how closely they agree.
//!
//! Two binaries sit on top: `goertzel-link`, a command line tool for
//! listening, bridging and offline analysis, and `monitor`, a live terminal
//! chart of the node's output.

#![warn(missing_docs)]
pub mod args;
pub mod broadcaster;
pub mod comparison;
pub mod config;
pub mod dummy_node;
pub mod estimator;
pub mod frame_decoder;
pub mod goertzel;
pub mod gui;
pub mod recording;
pub mod scenario;
pub mod serial_link;
pub mod session;
pub mod spectrum;

pub use broadcaster::{Broadcaster, LinkEvent};
pub use comparison::ComparisonAnalyzer;
pub use config::Settings;
pub use estimator::{PowerEstimate, PowerEstimator};
pub use frame_decoder::{DecodedBatch, GoertzelRecord};
pub use goertzel::GoertzelEngine;
pub use serial_link::{LinkError, LinkState, SerialLinkManager};
pub use spectrum::ReferenceSpectrumEngine;
