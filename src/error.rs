//! Error types for drishti-vio.

use thiserror::Error;

/// Drishti error type.
#[derive(Error, Debug)]
pub enum DrishtiError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Calibration error: {0}")]
    Calibration(String),

    #[error("Map error: {0}")]
    Map(String),

    #[error("Engine error: {0}")]
    Engine(String),
}

impl From<serde_yaml::Error> for DrishtiError {
    fn from(e: serde_yaml::Error) -> Self {
        DrishtiError::Calibration(e.to_string())
    }
}

impl From<basic_toml::Error> for DrishtiError {
    fn from(e: basic_toml::Error) -> Self {
        DrishtiError::Config(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DrishtiError>;
