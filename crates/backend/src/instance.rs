//! Per (model, device) execution context
//!
//! An instance owns its staging buffers, an embedding-cache handle and a
//! scoring-engine handle. Construction order is buffers, then cache, then
//! scoring engine, because the engine needs a live cache.
//!
//! Buffers are grouped into a small pool of independent buffer sets. A request
//! holds one set from staging until its output is emitted, so each set carries
//! at most one in-flight request.

use crate::buffer::DeviceBuffer;
use crate::collaborators::{
    CacheSpec, CollaboratorFactory, EmbeddingCache, ParameterServer, ScoringEngine,
};
use crate::key::EmbeddingKey;
use crate::memory::{DeviceAllocator, MemoryClass};
use crate::registry::ParameterServerRegistry;
use crossbeam::channel::{bounded, Receiver, Sender};
use parking_lot::{Mutex, MutexGuard};
use recserve_common::{KeyWidth, ModelConfig, RecServeError, Result, METRICS};
use std::ops::{Deref, DerefMut};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// The four staging buffers of one in-flight request
#[derive(Debug)]
pub struct BufferSet<K: EmbeddingKey> {
    /// Dense features, `max_batch_size * dense_feature_count` floats
    pub dense: DeviceBuffer<f32>,

    /// Categorical keys, `max_batch_size * categorical_feature_count` keys
    pub keys: DeviceBuffer<K>,

    /// CSR row offsets, `max_batch_size * slot_count + 1` values
    pub row_offsets: DeviceBuffer<i32>,

    /// Scores, `max_batch_size` floats
    pub predictions: DeviceBuffer<f32>,
}

impl<K: EmbeddingKey> BufferSet<K> {
    /// Reserve and allocate every buffer for `config`
    pub fn allocate(config: &ModelConfig, allocator: &Arc<dyn DeviceAllocator>) -> Result<Self> {
        let mut dense = DeviceBuffer::new(MemoryClass::Device, allocator.clone());
        dense.reserve(&[config.max_batch_size, config.dense_feature_count]);
        dense.allocate()?;

        let mut keys = DeviceBuffer::new(MemoryClass::PinnedHost, allocator.clone());
        keys.reserve(&[config.max_batch_size, config.categorical_feature_count]);
        keys.allocate()?;

        let mut row_offsets = DeviceBuffer::new(MemoryClass::Device, allocator.clone());
        row_offsets.reserve(&[config.row_offset_capacity()]);
        row_offsets.allocate()?;

        let mut predictions = DeviceBuffer::new(MemoryClass::Device, allocator.clone());
        predictions.reserve(&[config.prediction_capacity()]);
        predictions.allocate()?;

        Ok(Self {
            dense,
            keys,
            row_offsets,
            predictions,
        })
    }
}

/// Byte capacities shared by every set of a pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferCapacities {
    pub dense_bytes: usize,
    pub categorical_bytes: usize,
    pub row_offset_bytes: usize,
    pub prediction_bytes: usize,
}

/// Fixed pool of buffer sets handed out by index
pub struct BufferPool<K: EmbeddingKey> {
    sets: Vec<Mutex<BufferSet<K>>>,
    free_tx: Sender<usize>,
    free_rx: Receiver<usize>,
    capacities: BufferCapacities,
}

impl<K: EmbeddingKey> BufferPool<K> {
    /// Allocate `size` buffer sets for `config`
    pub fn new(config: &ModelConfig, size: usize, allocator: &Arc<dyn DeviceAllocator>) -> Result<Self> {
        if size == 0 {
            return Err(RecServeError::configuration("buffer pool needs at least one set"));
        }

        let (free_tx, free_rx) = bounded(size);
        let mut sets = Vec::with_capacity(size);
        for index in 0..size {
            sets.push(Mutex::new(BufferSet::allocate(config, allocator)?));
            free_tx
                .send(index)
                .map_err(|_| RecServeError::internal("buffer pool free list closed"))?;
        }

        let capacities = {
            let first = sets[0].lock();
            BufferCapacities {
                dense_bytes: first.dense.capacity_bytes(),
                categorical_bytes: first.keys.capacity_bytes(),
                row_offset_bytes: first.row_offsets.capacity_bytes(),
                prediction_bytes: first.predictions.capacity_bytes(),
            }
        };

        Ok(Self {
            sets,
            free_tx,
            free_rx,
            capacities,
        })
    }

    /// Number of buffer sets
    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    /// Sets not currently held by a request
    pub fn available(&self) -> usize {
        self.free_rx.len()
    }

    /// Capacities of each set
    pub fn capacities(&self) -> BufferCapacities {
        self.capacities
    }

    /// Take a free set, blocking until one is released
    pub fn acquire(&self) -> Result<PooledBufferSet<'_, K>> {
        let index = self
            .free_rx
            .recv()
            .map_err(|_| RecServeError::internal("buffer pool free list closed"))?;
        let set = self.sets[index].lock();
        Ok(PooledBufferSet {
            index,
            set,
            free_tx: &self.free_tx,
        })
    }
}

/// A buffer set on loan from the pool, returned on drop
pub struct PooledBufferSet<'a, K: EmbeddingKey> {
    index: usize,
    set: MutexGuard<'a, BufferSet<K>>,
    free_tx: &'a Sender<usize>,
}

impl<K: EmbeddingKey> PooledBufferSet<'_, K> {
    /// Slot index within the pool
    pub fn index(&self) -> usize {
        self.index
    }
}

impl<K: EmbeddingKey> Deref for PooledBufferSet<'_, K> {
    type Target = BufferSet<K>;

    fn deref(&self) -> &Self::Target {
        &self.set
    }
}

impl<K: EmbeddingKey> DerefMut for PooledBufferSet<'_, K> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.set
    }
}

impl<K: EmbeddingKey> Drop for PooledBufferSet<'_, K> {
    fn drop(&mut self) {
        // The set unlocks right after this; a waiter that wins the index blocks briefly on the lock
        if self.free_tx.send(self.index).is_err() {
            warn!("Buffer set {} could not be returned to the pool", self.index);
        }
    }
}

/// Execution context of one model on one device
pub struct InstanceContext<K: EmbeddingKey> {
    /// Instance name
    name: String,

    /// Device the instance runs on
    device_id: i32,

    /// Model parameters
    config: ModelConfig,

    /// Scoring engine, closed before its cache
    engine: Box<dyn ScoringEngine<K>>,

    /// Embedding cache
    cache: Arc<dyn EmbeddingCache<K>>,

    /// Staging buffers
    pool: BufferPool<K>,
}

impl<K: EmbeddingKey> InstanceContext<K> {
    /// Build the instance: buffers, then cache, then scoring engine
    pub fn new(
        config: ModelConfig,
        name: impl Into<String>,
        device_id: i32,
        parameter_server: Arc<dyn ParameterServer<K>>,
        factory: &dyn CollaboratorFactory<K>,
        allocator: Arc<dyn DeviceAllocator>,
    ) -> Result<Self> {
        let name = name.into();
        if config.key_width != K::WIDTH {
            return Err(RecServeError::configuration(format!(
                "model {} uses {} keys, instance was built for {} keys",
                config.name,
                config.key_width,
                K::WIDTH
            )));
        }

        info!(
            "Creating instance {} of model {} on device {}",
            name, config.name, device_id
        );
        allocator.select_device(device_id)?;

        let pool = BufferPool::new(&config, config.buffer_sets, &allocator)?;
        debug!(
            "Allocated {} buffer sets: {:?}",
            pool.len(),
            pool.capacities()
        );

        let spec = CacheSpec {
            device_id,
            cache_enabled: config.gpu_cache_enabled,
            cache_ratio: config.cache_size_ratio,
            topology_path: config.topology_config_path.clone(),
            instance_name: name.clone(),
            model_name: config.name.clone(),
            embedding_size: config.embedding_vector_size,
        };
        let cache = factory.create_embedding_cache(parameter_server, &spec)?;
        info!("Embedding cache created for instance {}", name);

        let engine =
            factory.load_scoring_engine(&config.topology_config_path, device_id, cache.clone())?;
        info!("Scoring engine loaded for instance {}", name);

        METRICS.instance.instances_loaded.inc();

        Ok(Self {
            name,
            device_id,
            config,
            engine,
            cache,
            pool,
        })
    }

    /// Instance name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Device identifier
    pub fn device_id(&self) -> i32 {
        self.device_id
    }

    /// Model parameters
    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Scoring engine handle
    pub fn engine(&self) -> &dyn ScoringEngine<K> {
        self.engine.as_ref()
    }

    /// Embedding cache handle
    pub fn cache(&self) -> &Arc<dyn EmbeddingCache<K>> {
        &self.cache
    }

    /// Staging buffer pool
    pub fn pool(&self) -> &BufferPool<K> {
        &self.pool
    }
}

impl<K: EmbeddingKey> Drop for InstanceContext<K> {
    fn drop(&mut self) {
        METRICS.instance.instances_loaded.dec();
        info!("Releasing instance {} on device {}", self.name, self.device_id);
    }
}

/// A loaded instance of either key width
pub enum ModelInstance {
    Int32(InstanceContext<u32>),
    Int64(InstanceContext<i64>),
}

impl ModelInstance {
    /// Acquire the shared parameter server and build an instance for the
    /// key width in `config`
    #[allow(clippy::too_many_arguments)]
    pub fn load<F>(
        config: ModelConfig,
        name: impl Into<String>,
        device_id: i32,
        registry: &ParameterServerRegistry,
        factory: &F,
        topology_paths: &[PathBuf],
        model_names: &[String],
        allocator: Arc<dyn DeviceAllocator>,
    ) -> Result<Self>
    where
        F: CollaboratorFactory<u32> + CollaboratorFactory<i64>,
    {
        match config.key_width {
            KeyWidth::Bits32 => {
                let server = registry.acquire::<u32>(factory, topology_paths, model_names)?;
                Ok(ModelInstance::Int32(InstanceContext::new(
                    config, name, device_id, server, factory, allocator,
                )?))
            }
            KeyWidth::Bits64 => {
                let server = registry.acquire::<i64>(factory, topology_paths, model_names)?;
                Ok(ModelInstance::Int64(InstanceContext::new(
                    config, name, device_id, server, factory, allocator,
                )?))
            }
        }
    }

    /// Key width the instance was built for
    pub fn key_width(&self) -> KeyWidth {
        match self {
            ModelInstance::Int32(_) => KeyWidth::Bits32,
            ModelInstance::Int64(_) => KeyWidth::Bits64,
        }
    }

    /// Instance name
    pub fn name(&self) -> &str {
        match self {
            ModelInstance::Int32(ctx) => ctx.name(),
            ModelInstance::Int64(ctx) => ctx.name(),
        }
    }

    /// Model parameters
    pub fn config(&self) -> &ModelConfig {
        match self {
            ModelInstance::Int32(ctx) => ctx.config(),
            ModelInstance::Int64(ctx) => ctx.config(),
        }
    }

    /// Buffer capacities of each buffer set
    pub fn capacities(&self) -> BufferCapacities {
        match self {
            ModelInstance::Int32(ctx) => ctx.pool().capacities(),
            ModelInstance::Int64(ctx) => ctx.pool().capacities(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::round_up_to_stride;
    use crate::memory::HostAllocator;
    use crate::reference::ReferenceCollaborators;
    use recserve_common::ErrorKind;
    use std::collections::BTreeMap;

    fn config(pairs: &[(&str, &str)]) -> ModelConfig {
        let params: BTreeMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ModelConfig::from_parameters("criteo", &params).unwrap()
    }

    fn load(config: ModelConfig, width: KeyWidth) -> Result<ModelInstance> {
        let registry = ParameterServerRegistry::new(width);
        let factory = ReferenceCollaborators::new();
        ModelInstance::load(
            config,
            "criteo_0",
            0,
            &registry,
            &factory,
            &[PathBuf::from("/models/criteo.json")],
            &["criteo".to_string()],
            Arc::new(HostAllocator::new()),
        )
    }

    #[test]
    fn test_buffer_capacities() {
        let config = config(&[
            ("slots", "26"),
            ("des_feature_num", "13"),
            ("cat_feature_num", "26"),
        ]);
        let instance = load(config, KeyWidth::Bits32).unwrap();
        let caps = instance.capacities();

        assert_eq!(instance.key_width(), KeyWidth::Bits32);
        assert_eq!(caps.dense_bytes, round_up_to_stride(64 * 13 * 4));
        assert_eq!(caps.categorical_bytes, round_up_to_stride(64 * 26 * 4));
        assert_eq!(caps.row_offset_bytes, round_up_to_stride((64 * 26 + 1) * 4));
        assert_eq!(caps.prediction_bytes, round_up_to_stride(64 * 4));
    }

    #[test]
    fn test_long_keys_select_wide_buffer() {
        let config = config(&[("embeddingkey_long_type", "true"), ("cat_feature_num", "26")]);
        let instance = load(config, KeyWidth::Bits64).unwrap();

        assert!(matches!(instance, ModelInstance::Int64(_)));
        assert_eq!(
            instance.capacities().categorical_bytes,
            round_up_to_stride(64 * 26 * 8)
        );
    }

    #[test]
    fn test_key_width_disagreement_rejected() {
        let config = config(&[("embeddingkey_long_type", "true")]);
        let err = load(config, KeyWidth::Bits32).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn test_allocation_failure_prevents_instance() {
        let registry = ParameterServerRegistry::new(KeyWidth::Bits32);
        let factory = ReferenceCollaborators::new();
        let err = ModelInstance::load(
            config(&[]),
            "criteo_0",
            0,
            &registry,
            &factory,
            &[PathBuf::from("/models/criteo.json")],
            &["criteo".to_string()],
            Arc::new(HostAllocator::new().with_limit(1024)),
        )
        .err()
        .unwrap();

        assert_eq!(err.kind(), ErrorKind::DeviceResource);
        assert_eq!(factory.caches_created(), 0);
        assert_eq!(factory.engines_loaded(), 0);
    }

    #[test]
    fn test_pool_hands_out_each_set_once() {
        let allocator: Arc<dyn DeviceAllocator> = Arc::new(HostAllocator::new());
        let pool = BufferPool::<u32>::new(&config(&[]), 2, &allocator).unwrap();

        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert_ne!(a.index(), b.index());
        assert_eq!(pool.available(), 0);

        drop(a);
        assert_eq!(pool.available(), 1);
        drop(b);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn test_empty_pool_rejected() {
        let allocator: Arc<dyn DeviceAllocator> = Arc::new(HostAllocator::new());
        assert!(BufferPool::<u32>::new(&config(&[]), 0, &allocator).is_err());
    }
}
