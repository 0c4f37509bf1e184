use thiserror::Error;

/// Failures of the terminal front-ends.
#[derive(Debug, Error)]
pub enum TuiError {
    /// The terminal could not be driven
    #[error("terminal io error: {0}")]
    Io(#[from] std::io::Error),
    /// There is nothing to choose from
    #[error("no serial devices found")]
    NoDevices,
}
