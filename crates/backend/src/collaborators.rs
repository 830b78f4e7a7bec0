//! Call contracts of the external embedding subsystem
//!
//! The parameter server, the embedding cache and the scoring engine live
//! outside this crate. They are consumed only through these traits, and every
//! call returns a `Result` so a failure can be confined to one request.

use crate::key::EmbeddingKey;
use recserve_common::Result;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Process-wide embedding parameter store
pub trait ParameterServer<K: EmbeddingKey>: Send + Sync {
    /// Models whose tables this server holds
    fn model_names(&self) -> &[String];

    /// Write the embedding vector of each key into `out`, `embedding_size` floats per key
    fn lookup(&self, model_name: &str, keys: &[K], embedding_size: usize, out: &mut [f32])
        -> Result<()>;
}

/// Per-instance embedding cache in front of the parameter server
pub trait EmbeddingCache<K: EmbeddingKey>: Send + Sync {
    /// Embedding vector width served by this cache
    fn embedding_size(&self) -> usize;

    /// Write the embedding vector of each key into `out`
    fn lookup(&self, keys: &[K], out: &mut [f32]) -> Result<()>;
}

/// A scoring call over one staged request
#[derive(Debug, Clone, Copy)]
pub struct PredictBatch<'a, K> {
    /// Dense features, `sample_count * dense_feature_count` values
    pub dense: &'a [f32],

    /// Categorical keys, addressed by `row_offsets`
    pub keys: &'a [K],

    /// CSR offsets into `keys`, `sample_count * slot_count + 1` values
    pub row_offsets: &'a [i32],

    /// Number of samples in the request
    pub sample_count: usize,
}

/// Loaded model that turns staged features into scores
pub trait ScoringEngine<K: EmbeddingKey>: Send + Sync {
    /// Write exactly `batch.sample_count` scores into `output`
    ///
    /// Blocks the calling thread until scoring finishes.
    fn predict(&self, batch: PredictBatch<'_, K>, output: &mut [f32]) -> Result<()>;
}

/// Parameters handed to the cache subsystem when an instance is built
#[derive(Debug, Clone)]
pub struct CacheSpec {
    /// Device the cache lives on
    pub device_id: i32,

    /// Whether the device cache is enabled
    pub cache_enabled: bool,

    /// Fraction of the table to cache
    pub cache_ratio: f32,

    /// Model topology path
    pub topology_path: PathBuf,

    /// Instance name
    pub instance_name: String,

    /// Model name
    pub model_name: String,

    /// Embedding vector width
    pub embedding_size: usize,
}

/// Constructor entry points of the external subsystem
pub trait CollaboratorFactory<K: EmbeddingKey>: Send + Sync {
    /// Build the parameter server for every hosted model
    fn create_parameter_server(
        &self,
        topology_paths: &[PathBuf],
        model_names: &[String],
    ) -> Result<Arc<dyn ParameterServer<K>>>;

    /// Build an instance's embedding cache
    fn create_embedding_cache(
        &self,
        parameter_server: Arc<dyn ParameterServer<K>>,
        spec: &CacheSpec,
    ) -> Result<Arc<dyn EmbeddingCache<K>>>;

    /// Load the scoring engine bound to a live cache
    fn load_scoring_engine(
        &self,
        topology_path: &Path,
        device_id: i32,
        cache: Arc<dyn EmbeddingCache<K>>,
    ) -> Result<Box<dyn ScoringEngine<K>>>;
}
