use std::io;
use thiserror::Error;

/// Unrecoverable bus failures.
///
/// Anything that can be reported as an [`Event`](crate::Event) and survived
/// never becomes a `BusError`; these terminate the bus engine.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("alert signal error: {0}")]
    Alert(#[source] io::Error),

    #[error("alert signal stream ended unexpectedly")]
    AlertClosed,

    #[error("I2C adapter does not support plain I2C transfers")]
    Unsupported,

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("bus is closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read configuration: {0}")]
    Io(#[from] io::Error),

    #[error("malformed configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("{field} must be {requirement}")]
    Invalid {
        field: &'static str,
        requirement: &'static str,
    },
}
