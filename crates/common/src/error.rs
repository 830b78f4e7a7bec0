//! Common error types for RecServe
//!
//! This module defines all error types used across the backend.
//! Every error maps to an [`ErrorKind`] so a failed request can be answered
//! with a response that names the failure class.

use std::fmt;
use thiserror::Error;

/// Main error type for RecServe
#[derive(Error, Debug)]
pub enum RecServeError {
    /// Malformed configuration value
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Input/output arity, datatype or shape mismatch in a model declaration
    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    /// Request carries more samples than the model's max batch size
    #[error("Batch overflow: request has {sample_count} samples, max batch size is {max_batch_size}")]
    BatchOverflow {
        sample_count: usize,
        max_batch_size: usize,
    },

    /// Memory acquisition, device selection or copy failure
    #[error("Device resource error: {0}")]
    DeviceResource(String),

    /// Failure reported by the parameter server, embedding cache or scoring engine
    #[error("External scoring error: {0}")]
    ExternalScoring(String),

    /// Malformed request tensors
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML deserialization errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Layered settings errors
    #[error("Settings error: {0}")]
    Settings(#[from] config::ConfigError),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Coarse failure class reported to the host and used as a metric label
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Configuration,
    ShapeMismatch,
    BatchOverflow,
    DeviceResource,
    ExternalScoring,
    InvalidInput,
    Internal,
}

impl ErrorKind {
    /// Stable label for responses and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Configuration => "configuration",
            ErrorKind::ShapeMismatch => "shape_mismatch",
            ErrorKind::BatchOverflow => "batch_overflow",
            ErrorKind::DeviceResource => "device_resource",
            ErrorKind::ExternalScoring => "external_scoring",
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl RecServeError {
    /// Classify the error
    pub fn kind(&self) -> ErrorKind {
        match self {
            RecServeError::Configuration(_)
            | RecServeError::Yaml(_)
            | RecServeError::Settings(_) => ErrorKind::Configuration,
            RecServeError::ShapeMismatch(_) => ErrorKind::ShapeMismatch,
            RecServeError::BatchOverflow { .. } => ErrorKind::BatchOverflow,
            RecServeError::DeviceResource(_) => ErrorKind::DeviceResource,
            RecServeError::ExternalScoring(_) => ErrorKind::ExternalScoring,
            RecServeError::InvalidInput(_) => ErrorKind::InvalidInput,
            RecServeError::Io(_)
            | RecServeError::Serialization(_)
            | RecServeError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        RecServeError::Configuration(msg.into())
    }

    /// Create a shape mismatch error
    pub fn shape_mismatch(msg: impl Into<String>) -> Self {
        RecServeError::ShapeMismatch(msg.into())
    }

    /// Create a batch overflow error
    pub fn batch_overflow(sample_count: usize, max_batch_size: usize) -> Self {
        RecServeError::BatchOverflow {
            sample_count,
            max_batch_size,
        }
    }

    /// Create a device resource error
    pub fn device_resource(msg: impl Into<String>) -> Self {
        RecServeError::DeviceResource(msg.into())
    }

    /// Create an external scoring error
    pub fn external_scoring(msg: impl Into<String>) -> Self {
        RecServeError::ExternalScoring(msg.into())
    }

    /// Create an invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        RecServeError::InvalidInput(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        RecServeError::Internal(msg.into())
    }
}

/// Result type alias for RecServe operations
pub type Result<T> = std::result::Result<T, RecServeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            RecServeError::batch_overflow(100, 64).kind(),
            ErrorKind::BatchOverflow
        );
        assert_eq!(
            RecServeError::configuration("bad").kind(),
            ErrorKind::Configuration
        );
        assert_eq!(
            RecServeError::external_scoring("engine down").kind().as_str(),
            "external_scoring"
        );
    }

    #[test]
    fn test_batch_overflow_message() {
        let err = RecServeError::batch_overflow(100, 64);
        assert_eq!(
            err.to_string(),
            "Batch overflow: request has 100 samples, max batch size is 64"
        );
    }
}
