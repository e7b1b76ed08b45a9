//! Error types for noisy-channel detection and robust referencing.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Shape mismatch: expected {expected} channels, got {actual}")]
    ShapeMismatch { expected: usize, actual: usize },

    #[error("Duplicate channel identifier: {0}")]
    DuplicateChannel(String),

    #[error("Too few channels available to reliably perform RANSAC: need {required}, have {available}")]
    InsufficientChannels { required: usize, available: usize },

    #[error("Could not perform a robust reference: only {usable} usable channels")]
    TooManyBad { usable: usize },

    #[error("Interpolation error: {0}")]
    Interpolation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Error::Config(e.to_string())
    }
}
