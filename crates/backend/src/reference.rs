//! In-process reference collaborators
//!
//! A deterministic stand-in for the external embedding subsystem, used by the
//! replay binary, tests and benchmarks. Embedding vectors are derived from a
//! hash of (model, key, dimension) instead of trained tables, and the scoring
//! engine is a fixed linear model over dense features and slot-pooled
//! embeddings.

use crate::collaborators::{
    CacheSpec, CollaboratorFactory, EmbeddingCache, ParameterServer, PredictBatch, ScoringEngine,
};
use crate::key::EmbeddingKey;
use parking_lot::Mutex;
use recserve_common::{RecServeError, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Nominal embedding table rows the cache ratio applies to
pub const DEFAULT_TABLE_ROWS: usize = 1 << 20;

fn mix(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    x = (x ^ (x >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    x ^ (x >> 31)
}

/// Map a hash to a value in [-0.5, 0.5)
fn unit(hash: u64) -> f32 {
    ((hash >> 40) as f32 / (1u64 << 24) as f32) - 0.5
}

fn name_seed(name: &str) -> u64 {
    name.bytes().fold(0xCBF2_9CE4_8422_2325, |acc, b| {
        (acc ^ b as u64).wrapping_mul(0x0100_0000_01B3)
    })
}

fn key_bits<K: EmbeddingKey>(key: K) -> u64 {
    key.to_i64().map(|v| v as u64).unwrap_or(0)
}

/// Factory producing the reference collaborators for both key widths
#[derive(Debug)]
pub struct ReferenceCollaborators {
    table_rows: usize,
    parameter_servers: AtomicUsize,
    caches: AtomicUsize,
    engines: AtomicUsize,
}

impl ReferenceCollaborators {
    /// Create a factory with the default nominal table size
    pub fn new() -> Self {
        Self::with_table_rows(DEFAULT_TABLE_ROWS)
    }

    /// Create a factory whose caches size themselves against `table_rows`
    pub fn with_table_rows(table_rows: usize) -> Self {
        Self {
            table_rows,
            parameter_servers: AtomicUsize::new(0),
            caches: AtomicUsize::new(0),
            engines: AtomicUsize::new(0),
        }
    }

    /// Parameter servers built so far
    pub fn parameter_servers_created(&self) -> usize {
        self.parameter_servers.load(Ordering::Relaxed)
    }

    /// Embedding caches built so far
    pub fn caches_created(&self) -> usize {
        self.caches.load(Ordering::Relaxed)
    }

    /// Scoring engines loaded so far
    pub fn engines_loaded(&self) -> usize {
        self.engines.load(Ordering::Relaxed)
    }
}

impl Default for ReferenceCollaborators {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: EmbeddingKey> CollaboratorFactory<K> for ReferenceCollaborators {
    fn create_parameter_server(
        &self,
        topology_paths: &[PathBuf],
        model_names: &[String],
    ) -> Result<Arc<dyn ParameterServer<K>>> {
        if topology_paths.len() != model_names.len() {
            return Err(RecServeError::external_scoring(format!(
                "{} topology paths for {} models",
                topology_paths.len(),
                model_names.len()
            )));
        }
        self.parameter_servers.fetch_add(1, Ordering::Relaxed);
        Ok(Arc::new(ReferenceParameterServer::new(model_names.to_vec())))
    }

    fn create_embedding_cache(
        &self,
        parameter_server: Arc<dyn ParameterServer<K>>,
        spec: &CacheSpec,
    ) -> Result<Arc<dyn EmbeddingCache<K>>> {
        if !parameter_server.model_names().contains(&spec.model_name) {
            return Err(RecServeError::external_scoring(format!(
                "parameter server holds no table for model {}",
                spec.model_name
            )));
        }
        let capacity = if spec.cache_enabled {
            (self.table_rows as f64 * spec.cache_ratio as f64) as usize
        } else {
            0
        };
        info!(
            "Creating embedding cache for {} on device {}: enabled={}, capacity={} rows",
            spec.instance_name, spec.device_id, spec.cache_enabled, capacity
        );
        self.caches.fetch_add(1, Ordering::Relaxed);
        Ok(Arc::new(HostEmbeddingCache::new(
            parameter_server,
            spec.model_name.clone(),
            spec.embedding_size,
            spec.cache_enabled,
            capacity,
        )))
    }

    fn load_scoring_engine(
        &self,
        topology_path: &Path,
        device_id: i32,
        cache: Arc<dyn EmbeddingCache<K>>,
    ) -> Result<Box<dyn ScoringEngine<K>>> {
        info!(
            "Loading reference scoring engine from {} on device {}",
            topology_path.display(),
            device_id
        );
        self.engines.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(LinearScoringEngine::new(
            cache,
            name_seed(&topology_path.to_string_lossy()),
        )))
    }
}

/// Parameter server deriving embeddings from a hash
#[derive(Debug)]
pub struct ReferenceParameterServer {
    model_names: Vec<String>,
    lookups: AtomicU64,
}

impl ReferenceParameterServer {
    pub fn new(model_names: Vec<String>) -> Self {
        Self {
            model_names,
            lookups: AtomicU64::new(0),
        }
    }

    /// Keys looked up so far
    pub fn lookups(&self) -> u64 {
        self.lookups.load(Ordering::Relaxed)
    }
}

impl<K: EmbeddingKey> ParameterServer<K> for ReferenceParameterServer {
    fn model_names(&self) -> &[String] {
        &self.model_names
    }

    fn lookup(
        &self,
        model_name: &str,
        keys: &[K],
        embedding_size: usize,
        out: &mut [f32],
    ) -> Result<()> {
        if !self.model_names.iter().any(|m| m == model_name) {
            return Err(RecServeError::external_scoring(format!(
                "unknown model {}",
                model_name
            )));
        }
        if out.len() != keys.len() * embedding_size {
            return Err(RecServeError::external_scoring(format!(
                "output holds {} values, {} keys of width {} need {}",
                out.len(),
                keys.len(),
                embedding_size,
                keys.len() * embedding_size
            )));
        }

        let seed = name_seed(model_name);
        for (key, vector) in keys.iter().zip(out.chunks_exact_mut(embedding_size.max(1))) {
            let base = mix(seed ^ key_bits(*key));
            for (j, value) in vector.iter_mut().enumerate() {
                *value = unit(mix(base.wrapping_add(j as u64)));
            }
        }
        self.lookups.fetch_add(keys.len() as u64, Ordering::Relaxed);
        Ok(())
    }
}

/// Host-memory embedding cache that admits rows until full
pub struct HostEmbeddingCache<K: EmbeddingKey> {
    server: Arc<dyn ParameterServer<K>>,
    model_name: String,
    embedding_size: usize,
    enabled: bool,
    capacity: usize,
    rows: Mutex<HashMap<K, Vec<f32>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<K: EmbeddingKey> HostEmbeddingCache<K> {
    pub fn new(
        server: Arc<dyn ParameterServer<K>>,
        model_name: String,
        embedding_size: usize,
        enabled: bool,
        capacity: usize,
    ) -> Self {
        Self {
            server,
            model_name,
            embedding_size,
            enabled,
            capacity,
            rows: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// (hits, misses) so far
    pub fn stats(&self) -> (u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }

    /// Rows currently cached
    pub fn len(&self) -> usize {
        self.rows.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K: EmbeddingKey> EmbeddingCache<K> for HostEmbeddingCache<K> {
    fn embedding_size(&self) -> usize {
        self.embedding_size
    }

    fn lookup(&self, keys: &[K], out: &mut [f32]) -> Result<()> {
        let width = self.embedding_size;
        if !self.enabled {
            self.misses.fetch_add(keys.len() as u64, Ordering::Relaxed);
            return self.server.lookup(&self.model_name, keys, width, out);
        }
        if out.len() != keys.len() * width {
            return Err(RecServeError::external_scoring(format!(
                "output holds {} values, expected {}",
                out.len(),
                keys.len() * width
            )));
        }

        let mut missing = Vec::new();
        {
            let rows = self.rows.lock();
            for (i, key) in keys.iter().enumerate() {
                match rows.get(key) {
                    Some(row) => out[i * width..(i + 1) * width].copy_from_slice(row),
                    None => missing.push(i),
                }
            }
        }

        self.hits
            .fetch_add((keys.len() - missing.len()) as u64, Ordering::Relaxed);
        if missing.is_empty() {
            return Ok(());
        }
        self.misses.fetch_add(missing.len() as u64, Ordering::Relaxed);

        let missing_keys: Vec<K> = missing.iter().map(|&i| keys[i]).collect();
        let mut fetched = vec![0.0f32; missing_keys.len() * width];
        self.server
            .lookup(&self.model_name, &missing_keys, width, &mut fetched)?;

        let mut rows = self.rows.lock();
        for (n, &i) in missing.iter().enumerate() {
            let row = &fetched[n * width..(n + 1) * width];
            out[i * width..(i + 1) * width].copy_from_slice(row);
            if rows.len() < self.capacity {
                rows.insert(keys[i], row.to_vec());
            }
        }
        debug!(
            "Cache lookup: {} keys, {} misses, {} rows cached",
            keys.len(),
            missing.len(),
            rows.len()
        );
        Ok(())
    }
}

/// Linear model over dense features and sum-pooled slot embeddings
pub struct LinearScoringEngine<K: EmbeddingKey> {
    cache: Arc<dyn EmbeddingCache<K>>,
    seed: u64,
}

impl<K: EmbeddingKey> LinearScoringEngine<K> {
    pub fn new(cache: Arc<dyn EmbeddingCache<K>>, seed: u64) -> Self {
        Self { cache, seed }
    }

    fn dense_weight(&self, feature: usize) -> f32 {
        unit(mix(self.seed ^ (feature as u64).wrapping_mul(0x1000_0001)))
    }

    fn embedding_weight(&self, slot: usize, dim: usize) -> f32 {
        unit(mix(!self.seed ^ (((slot as u64) << 32) | dim as u64)))
    }
}

impl<K: EmbeddingKey> ScoringEngine<K> for LinearScoringEngine<K> {
    fn predict(&self, batch: PredictBatch<'_, K>, output: &mut [f32]) -> Result<()> {
        let samples = batch.sample_count;
        if samples == 0 {
            return Err(RecServeError::external_scoring("empty batch"));
        }
        if output.len() < samples {
            return Err(RecServeError::external_scoring(format!(
                "output holds {} values for {} samples",
                output.len(),
                samples
            )));
        }
        if batch.dense.len() % samples != 0 {
            return Err(RecServeError::external_scoring(
                "dense features do not divide evenly into samples",
            ));
        }
        let offsets = batch.row_offsets;
        if offsets.is_empty() || (offsets.len() - 1) % samples != 0 {
            return Err(RecServeError::external_scoring(format!(
                "{} row offsets cannot describe {} samples",
                offsets.len(),
                samples
            )));
        }
        let dense_width = batch.dense.len() / samples;
        let slots = (offsets.len() - 1) / samples;

        if offsets[0] != 0 || offsets.windows(2).any(|w| w[1] < w[0]) {
            return Err(RecServeError::external_scoring(
                "row offsets must start at 0 and never decrease",
            ));
        }
        let key_count = offsets[offsets.len() - 1] as usize;
        if key_count > batch.keys.len() {
            return Err(RecServeError::external_scoring(format!(
                "row offsets address {} keys, only {} staged",
                key_count,
                batch.keys.len()
            )));
        }

        let width = self.cache.embedding_size();
        let mut embeddings = vec![0.0f32; key_count * width];
        self.cache
            .lookup(&batch.keys[..key_count], &mut embeddings)?;

        for (s, score) in output[..samples].iter_mut().enumerate() {
            let mut logit = 0.0f32;
            for (i, &x) in batch.dense[s * dense_width..(s + 1) * dense_width]
                .iter()
                .enumerate()
            {
                logit += x * self.dense_weight(i);
            }
            for slot in 0..slots {
                let row = s * slots + slot;
                let (start, end) = (offsets[row] as usize, offsets[row + 1] as usize);
                for k in start..end {
                    for (j, &e) in embeddings[k * width..(k + 1) * width].iter().enumerate() {
                        logit += e * self.embedding_weight(slot, j);
                    }
                }
            }
            *score = 1.0 / (1.0 + (-logit).exp());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(enabled: bool, capacity: usize) -> HostEmbeddingCache<u32> {
        let server: Arc<dyn ParameterServer<u32>> =
            Arc::new(ReferenceParameterServer::new(vec!["m".to_string()]));
        HostEmbeddingCache::new(server, "m".to_string(), 4, enabled, capacity)
    }

    #[test]
    fn test_embeddings_are_deterministic() {
        let server = ReferenceParameterServer::new(vec!["m".to_string()]);
        let mut a = vec![0.0f32; 8];
        let mut b = vec![0.0f32; 8];
        ParameterServer::<u32>::lookup(&server, "m", &[7, 9], 4, &mut a).unwrap();
        ParameterServer::<u32>::lookup(&server, "m", &[7, 9], 4, &mut b).unwrap();
        assert_eq!(a, b);
        assert_ne!(a[..4], a[4..]);
        assert!(a.iter().all(|v| (-0.5..0.5).contains(v)));
        assert_eq!(server.lookups(), 4);
    }

    #[test]
    fn test_cache_hits_after_admission() {
        let cache = cache(true, 16);
        let mut out = vec![0.0f32; 8];
        cache.lookup(&[1, 2], &mut out).unwrap();
        let first = out.clone();
        cache.lookup(&[1, 2], &mut out).unwrap();

        assert_eq!(out, first);
        assert_eq!(cache.stats(), (2, 2));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_full_cache_stops_admitting() {
        let cache = cache(true, 1);
        let mut out = vec![0.0f32; 12];
        cache.lookup(&[1, 2, 3], &mut out).unwrap();
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_disabled_cache_passes_through() {
        let cache = cache(false, 16);
        let mut out = vec![0.0f32; 4];
        cache.lookup(&[5], &mut out).unwrap();
        cache.lookup(&[5], &mut out).unwrap();
        assert_eq!(cache.stats(), (0, 2));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_predict_scores_each_sample() {
        let engine = LinearScoringEngine::new(Arc::new(cache(true, 64)), 42);
        let dense = [0.5f32, -1.0, 0.25, 2.0];
        let keys = [1u32, 2, 3];
        let offsets = [0, 1, 2, 2, 3];
        let mut output = [0.0f32; 2];

        engine
            .predict(
                PredictBatch {
                    dense: &dense,
                    keys: &keys,
                    row_offsets: &offsets,
                    sample_count: 2,
                },
                &mut output,
            )
            .unwrap();

        assert!(output.iter().all(|p| *p > 0.0 && *p < 1.0));
    }

    #[test]
    fn test_predict_rejects_bad_offsets() {
        let engine = LinearScoringEngine::new(Arc::new(cache(true, 64)), 42);
        let mut output = [0.0f32; 1];
        let err = engine
            .predict(
                PredictBatch {
                    dense: &[1.0],
                    keys: &[1u32],
                    row_offsets: &[0, 5],
                    sample_count: 1,
                },
                &mut output,
            )
            .unwrap_err();
        assert_eq!(err.kind(), recserve_common::ErrorKind::ExternalScoring);
    }
}
