//! Process-wide parameter server registry
//!
//! The registry is an explicit object owned by the backend and passed by
//! reference into instance construction. The parameter server it holds is
//! built on first use, for the single key width selected by the process, and
//! shared read-only by every instance afterwards.

use crate::collaborators::{CollaboratorFactory, ParameterServer};
use crate::key::EmbeddingKey;
use parking_lot::RwLock;
use recserve_common::{KeyWidth, RecServeError, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// A parameter server handle of either key width
#[derive(Clone)]
pub enum SharedParameterServer {
    /// 32-bit keyed
    Int32(Arc<dyn ParameterServer<u32>>),

    /// 64-bit keyed
    Int64(Arc<dyn ParameterServer<i64>>),
}

impl SharedParameterServer {
    /// Key width of the handle
    pub fn key_width(&self) -> KeyWidth {
        match self {
            SharedParameterServer::Int32(_) => KeyWidth::Bits32,
            SharedParameterServer::Int64(_) => KeyWidth::Bits64,
        }
    }
}

/// Registry of the process's parameter server
pub struct ParameterServerRegistry {
    /// Key width every model in the process must use
    key_width: KeyWidth,

    /// Lazily constructed handle
    handle: RwLock<Option<SharedParameterServer>>,
}

impl ParameterServerRegistry {
    /// Create an empty registry for the process key width
    pub fn new(key_width: KeyWidth) -> Self {
        info!("Parameter server registry created for {} keys", key_width);
        Self {
            key_width,
            handle: RwLock::new(None),
        }
    }

    /// Key width selected for the process
    pub fn key_width(&self) -> KeyWidth {
        self.key_width
    }

    /// Whether the parameter server has been constructed
    pub fn is_initialized(&self) -> bool {
        self.handle.read().is_some()
    }

    /// Return the shared handle for `K`, constructing it on first use
    ///
    /// Fails with a configuration error if `K` is not the process key width.
    pub fn acquire<K: EmbeddingKey>(
        &self,
        factory: &dyn CollaboratorFactory<K>,
        topology_paths: &[PathBuf],
        model_names: &[String],
    ) -> Result<Arc<dyn ParameterServer<K>>> {
        if K::WIDTH != self.key_width {
            return Err(RecServeError::configuration(format!(
                "process is configured for {} embedding keys, cannot serve {} keys",
                self.key_width,
                K::WIDTH
            )));
        }

        if let Some(shared) = self.handle.read().as_ref() {
            return K::unshare(shared).ok_or_else(|| {
                RecServeError::internal("registered parameter server has the wrong key width")
            });
        }

        let mut slot = self.handle.write();
        // Another caller may have won the race between the two locks
        if let Some(shared) = slot.as_ref() {
            return K::unshare(shared).ok_or_else(|| {
                RecServeError::internal("registered parameter server has the wrong key width")
            });
        }

        info!(
            "Creating {} key parameter server for models {:?}",
            K::WIDTH,
            model_names
        );
        let server = factory.create_parameter_server(topology_paths, model_names)?;
        *slot = Some(K::share(server.clone()));
        info!("Parameter server created successfully");

        Ok(server)
    }
}
