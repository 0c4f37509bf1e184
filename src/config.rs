//! Runtime settings, read from a [ron] file.
//!
//! Every field has a default, so a settings file only needs to mention what
//! differs from the stock sensor node:
//!
//! ```text
//! (
//!     link: (read_timeout_ms: 50),
//!     sensor: (sensitivity: 0.52, frame_len: 512),
//! )
//! ```

use serde::{Deserialize, Serialize};
use std::{fs::File, io::Read, path::Path, time::Duration};
use thiserror::Error;

use crate::frame_decoder::DEFAULT_MAX_FRAME_BYTES;

/// Things that go wrong while loading or writing settings.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// The file is not valid RON for [`Settings`]
    #[error("ron error: {0}")]
    Ron(#[from] ron::de::SpannedError),
    /// The settings could not be rendered
    #[error("ron serialization error: {0}")]
    Serialize(#[from] ron::Error),
}

/// All settings, grouped by the part of the system that consumes them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Serial link behaviour
    pub link: LinkConfig,
    /// Sensor and node constants used by the power estimators
    pub sensor: SensorConfig,
}

impl Settings {
    /// Reads settings from the path provided.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let mut handle = File::open(path)?;
        Self::from_reader(&mut handle)
    }

    /// Reads settings from the [Read]able object provided.
    pub fn from_reader(reader: &mut impl Read) -> Result<Self, ConfigError> {
        let mut text = String::new();
        reader.read_to_string(&mut text)?;
        Self::from_ron(&text)
    }

    /// Parses settings from RON text.
    pub fn from_ron(text: &str) -> Result<Self, ConfigError> {
        Ok(ron::de::from_str(text)?)
    }

    /// Renders the settings as pretty RON.
    pub fn to_ron(&self) -> Result<String, ConfigError> {
        Ok(ron::ser::to_string_pretty(
            self,
            ron::ser::PrettyConfig::default(),
        )?)
    }
}

/// Settings for the serial link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Baud rates a connect request may ask for
    pub accepted_baud_rates: Vec<u32>,
    /// How long a single read blocks before the reader checks for shutdown
    pub read_timeout_ms: u64,
    /// Bytes held back waiting for a newline before decoding anyway
    pub max_frame_bytes: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            accepted_baud_rates: vec![9600, 19200, 38400, 57600, 115200],
            read_timeout_ms: 100,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

impl LinkConfig {
    /// The read timeout as a [Duration].
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Whether `baud_rate` is one of the accepted rates.
    pub fn accepts(&self, baud_rate: u32) -> bool {
        self.accepted_baud_rates.contains(&baud_rate)
    }
}

/// Constants of the accelerometer, the node's ADC and the node's Goertzel
/// implementation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    /// ADC reference / sensor supply, in volts
    pub supply_voltage: f64,
    /// Accelerometer sensitivity, in volts per g
    pub sensitivity: f64,
    /// ADC resolution in bits
    pub adc_bits: u32,
    /// ADC reading at 0 g
    pub zero_offset: f64,
    /// Right shift applied to the node's power sum
    pub fixed_point_shift: u32,
    /// Right shift applied to the coefficient cross term
    pub cross_term_shift: u32,
    /// Samples per Goertzel frame on the node
    pub frame_len: usize,
    /// Node sampling rate in Hz
    pub sample_rate: f64,
    /// Converts g² into (m/s²)²
    pub unit_multiplier: f64,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            supply_voltage: 3.0,
            sensitivity: 0.56,
            adc_bits: 10,
            zero_offset: 512.0,
            fixed_point_shift: 18,
            cross_term_shift: 13,
            frame_len: 480,
            sample_rate: 10923.0,
            unit_multiplier: 96.1704,
        }
    }
}

impl SensorConfig {
    /// Largest ADC reading, `2^bits - 1`.
    pub fn adc_max(&self) -> f64 {
        2f64.powi(self.adc_bits as i32) - 1.0
    }

    /// Sensor transfer constant `k`: g per ADC count.
    pub fn transfer_constant(&self) -> f64 {
        self.supply_voltage / (self.sensitivity * self.adc_max())
    }

    /// Converts a power in ADC counts² to g².
    pub fn adc_power_to_g2(&self, power: f64) -> f64 {
        power * self.transfer_constant().powi(2)
    }

    /// Converts a power in g² to (m/s²)².
    pub fn g2_to_ms2(&self, power: f64) -> f64 {
        power * self.unit_multiplier
    }

    /// Converts one ADC reading to acceleration in g.
    pub fn adc_to_acceleration(&self, adc: f64) -> f64 {
        (adc - self.zero_offset) * self.transfer_constant()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_stock_node() {
        let sensor = SensorConfig::default();
        assert_eq!(sensor.adc_max(), 1023.0);
        let k = 3.0 / (0.56 * 1023.0);
        assert!((sensor.transfer_constant() - k).abs() < 1e-15);
        assert!((sensor.adc_power_to_g2(2.0) - 2.0 * k * k).abs() < 1e-15);
        assert!((sensor.g2_to_ms2(1.0) - 96.1704).abs() < 1e-12);
        assert_eq!(sensor.adc_to_acceleration(512.0), 0.0);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let settings =
            Settings::from_ron("(link: (read_timeout_ms: 50), sensor: (frame_len: 512))").unwrap();
        assert_eq!(settings.link.read_timeout(), Duration::from_millis(50));
        assert!(settings.link.accepts(115200));
        assert_eq!(settings.sensor.frame_len, 512);
        assert_eq!(settings.sensor.fixed_point_shift, 18);
    }

    #[test]
    fn write_and_read_path() {
        let mut tempfile = tempfile::NamedTempFile::new().unwrap();
        let mut settings = Settings::default();
        settings.link.accepted_baud_rates = vec![115200];
        settings.sensor.sensitivity = 0.52;

        tempfile
            .write_all(settings.to_ron().unwrap().as_bytes())
            .unwrap();
        let read = Settings::from_path(tempfile.path()).unwrap();
        assert_eq!(read, settings);
        assert!(!read.link.accepts(9600));
    }

    #[test]
    fn bad_file_is_an_error() {
        assert!(matches!(
            Settings::from_ron("(link: 12)"),
            Err(ConfigError::Ron(_))
        ));
        assert!(matches!(
            Settings::from_path("/definitely/not/here.ron"),
            Err(ConfigError::Io(_))
        ));
    }
}
