//! RecServe common library
//!
//! This crate contains shared code used by the RecServe backend: the error
//! taxonomy, configuration types and Prometheus metrics.

pub mod config;
pub mod datatype;
pub mod error;
pub mod metrics;

// Re-export commonly used types
pub use config::{BackendSettings, KeyWidth, ModelConfig, ModelDeclaration, TensorSpec};
pub use datatype::DataType;
pub use error::{ErrorKind, RecServeError, Result};
pub use metrics::{MetricsRegistry, METRICS};
