//! Backend lifecycle: process, model and instance loading
//!
//! The backend owns the parameter-server registry for the process key width,
//! the parsed configuration of every loaded model and the live instances.

use crate::collaborators::CollaboratorFactory;
use crate::instance::ModelInstance;
use crate::memory::DeviceAllocator;
use crate::registry::ParameterServerRegistry;
use parking_lot::RwLock;
use recserve_common::{BackendSettings, ModelConfig, ModelDeclaration, RecServeError, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// A serving backend built on a collaborator factory `F`
pub struct Backend<F> {
    settings: BackendSettings,
    registry: ParameterServerRegistry,
    factory: F,
    allocator: Arc<dyn DeviceAllocator>,
    models: RwLock<HashMap<String, Arc<ModelConfig>>>,
    instances: RwLock<HashMap<String, Arc<ModelInstance>>>,
}

impl<F> Backend<F>
where
    F: CollaboratorFactory<u32> + CollaboratorFactory<i64>,
{
    /// Initialize the backend for the process key width in `settings`
    pub fn initialize(
        settings: BackendSettings,
        factory: F,
        allocator: Arc<dyn DeviceAllocator>,
    ) -> Result<Self> {
        settings.validate()?;
        info!(
            "Initializing backend: {} keys, {} hosted models",
            settings.key_width(),
            settings.models.len()
        );

        Ok(Self {
            registry: ParameterServerRegistry::new(settings.key_width()),
            settings,
            factory,
            allocator,
            models: RwLock::new(HashMap::new()),
            instances: RwLock::new(HashMap::new()),
        })
    }

    /// Validate and parse a model declaration
    ///
    /// The model's key width must match the process key width. A missing
    /// topology path is taken from the hosted-model settings.
    pub fn load_model(&self, declaration: &ModelDeclaration) -> Result<Arc<ModelConfig>> {
        let mut config = ModelConfig::from_declaration(declaration)?;

        if config.key_width != self.registry.key_width() {
            return Err(RecServeError::configuration(format!(
                "model {} declares {} keys but the process serves {} keys",
                config.name,
                config.key_width,
                self.registry.key_width()
            )));
        }

        if config.topology_config_path.as_os_str().is_empty() {
            if let Some(hosted) = self.settings.models.iter().find(|m| m.name == config.name) {
                config.topology_config_path = hosted.topology.clone();
            }
        }

        let config = Arc::new(config);
        self.models
            .write()
            .insert(config.name.clone(), config.clone());
        info!("Model {} loaded", config.name);
        Ok(config)
    }

    /// Build an instance of a loaded model on `device_id`
    pub fn load_instance(&self, model_name: &str, device_id: i32) -> Result<Arc<ModelInstance>> {
        let config = self.model(model_name).ok_or_else(|| {
            RecServeError::configuration(format!("model {} is not loaded", model_name))
        })?;

        let instance_name = format!("{}_{}", model_name, device_id);
        if self.instances.read().contains_key(&instance_name) {
            return Err(RecServeError::configuration(format!(
                "instance {} is already loaded",
                instance_name
            )));
        }

        let (topology_paths, model_names) = self.topology_union();
        let instance = Arc::new(ModelInstance::load(
            (*config).clone(),
            instance_name.clone(),
            device_id,
            &self.registry,
            &self.factory,
            &topology_paths,
            &model_names,
            self.allocator.clone(),
        )?);

        self.instances
            .write()
            .insert(instance_name, instance.clone());
        Ok(instance)
    }

    /// Drop an instance; its buffers are released once the last handle goes
    pub fn unload_instance(&self, instance_name: &str) -> bool {
        let removed = self.instances.write().remove(instance_name).is_some();
        if removed {
            info!("Instance {} unloaded", instance_name);
        }
        removed
    }

    /// Drop a model and every instance of it
    pub fn unload_model(&self, model_name: &str) -> bool {
        self.instances
            .write()
            .retain(|_, instance| instance.config().name != model_name);
        let removed = self.models.write().remove(model_name).is_some();
        if removed {
            info!("Model {} unloaded", model_name);
        }
        removed
    }

    /// Parsed configuration of a loaded model
    pub fn model(&self, model_name: &str) -> Option<Arc<ModelConfig>> {
        self.models.read().get(model_name).cloned()
    }

    /// A live instance by name
    pub fn instance(&self, instance_name: &str) -> Option<Arc<ModelInstance>> {
        self.instances.read().get(instance_name).cloned()
    }

    /// Names of the live instances
    pub fn instance_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.instances.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Process settings
    pub fn settings(&self) -> &BackendSettings {
        &self.settings
    }

    /// Parameter-server registry
    pub fn registry(&self) -> &ParameterServerRegistry {
        &self.registry
    }

    /// Collaborator factory
    pub fn factory(&self) -> &F {
        &self.factory
    }

    /// Topology paths and names of every hosted model, falling back to the
    /// loaded models when the settings list none
    fn topology_union(&self) -> (Vec<std::path::PathBuf>, Vec<String>) {
        if !self.settings.models.is_empty() {
            return self.settings.topology_union();
        }
        let models = self.models.read();
        let mut loaded: Vec<_> = models.values().collect();
        loaded.sort_by(|a, b| a.name.cmp(&b.name));
        loaded
            .into_iter()
            .map(|m| (m.topology_config_path.clone(), m.name.clone()))
            .unzip()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::HostAllocator;
    use crate::reference::ReferenceCollaborators;
    use crate::request::{InferenceRequest, InputTensor};
    use recserve_common::config::HostedModel;
    use recserve_common::{DataType, ErrorKind, KeyWidth};
    use std::path::PathBuf;

    fn declaration(name: &str, long_keys: bool) -> ModelDeclaration {
        let yaml = format!(
            r#"
name: {name}
max_batch_size: 64
input:
  - {{ name: DES, data_type: TYPE_FP32, dims: [-1] }}
  - {{ name: CATCOLUMN, data_type: {key_type}, dims: [-1] }}
  - {{ name: ROWINDEX, data_type: TYPE_INT32, dims: [-1] }}
output:
  - {{ name: OUTPUT0, data_type: TYPE_FP32, dims: [-1] }}
parameters:
  slots: "2"
  des_feature_num: "3"
  cat_feature_num: "2"
  embedding_vector_size: "8"
  embeddingkey_long_type: "{long_keys}"
"#,
            key_type = if long_keys { "TYPE_INT64" } else { "TYPE_UINT32" },
        );
        serde_yaml::from_str(&yaml).unwrap()
    }

    fn backend(long_keys: bool) -> Backend<ReferenceCollaborators> {
        let settings = BackendSettings {
            support_long_embedding_key: long_keys,
            models: ["wdl", "dcn"]
                .iter()
                .map(|name| HostedModel {
                    name: name.to_string(),
                    topology: PathBuf::from(format!("/models/{}/1/{}.json", name, name)),
                    declaration: None,
                    device_ids: vec![0],
                })
                .collect(),
            ..Default::default()
        };
        Backend::initialize(
            settings,
            ReferenceCollaborators::new(),
            Arc::new(HostAllocator::new().with_device_count(2)),
        )
        .unwrap()
    }

    #[test]
    fn test_models_share_one_parameter_server() {
        let backend = backend(false);
        backend.load_model(&declaration("wdl", false)).unwrap();
        backend.load_model(&declaration("dcn", false)).unwrap();

        backend.load_instance("wdl", 0).unwrap();
        backend.load_instance("wdl", 1).unwrap();
        backend.load_instance("dcn", 0).unwrap();

        assert_eq!(backend.factory().parameter_servers_created(), 1);
        assert_eq!(backend.factory().caches_created(), 3);
        assert_eq!(backend.instance_names(), vec!["dcn_0", "wdl_0", "wdl_1"]);
        assert_eq!(
            backend.model("wdl").unwrap().topology_config_path,
            PathBuf::from("/models/wdl/1/wdl.json")
        );
    }

    #[test]
    fn test_shape_mismatch_prevents_load() {
        let backend = backend(false);
        let mut decl = declaration("wdl", false);
        decl.output[0].data_type = DataType::Fp64;

        let err = backend.load_model(&decl).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ShapeMismatch);
        assert!(backend.model("wdl").is_none());

        let err = backend.load_instance("wdl", 0).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert_eq!(backend.factory().caches_created(), 0);
        assert!(!backend.registry().is_initialized());
    }

    #[test]
    fn test_key_width_must_match_process() {
        let backend = backend(false);
        let err = backend.load_model(&declaration("wdl", true)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn test_long_key_backend_serves_requests() {
        let backend = backend(true);
        assert_eq!(backend.registry().key_width(), KeyWidth::Bits64);
        backend.load_model(&declaration("dcn", true)).unwrap();
        let instance = backend.load_instance("dcn", 1).unwrap();

        let request = InferenceRequest::new(
            "r0",
            vec![
                InputTensor::from_f32("DES", vec![1, 3], &[0.1, 0.2, 0.3]),
                InputTensor::from_i64("CATCOLUMN", vec![2], &[1 << 33, 5]),
                InputTensor::from_i32("ROWINDEX", vec![3], &[0, 1, 2]),
            ],
        );
        let report = instance.execute(&[request]);
        assert_eq!(report.responses[0].scores().unwrap().len(), 1);
    }

    #[test]
    fn test_invalid_device_rejected() {
        let backend = backend(false);
        backend.load_model(&declaration("wdl", false)).unwrap();
        let err = backend.load_instance("wdl", 5).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::DeviceResource);
    }

    #[test]
    fn test_unload() {
        let backend = backend(false);
        backend.load_model(&declaration("wdl", false)).unwrap();
        backend.load_instance("wdl", 0).unwrap();
        assert!(backend.load_instance("wdl", 0).is_err());

        assert!(backend.unload_model("wdl"));
        assert!(backend.instance("wdl_0").is_none());
        assert!(!backend.unload_instance("wdl_0"));
    }
}
