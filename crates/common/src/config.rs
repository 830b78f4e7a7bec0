//! Configuration structures for RecServe
//!
//! Three layers of configuration exist:
//! - [`BackendSettings`]: process-level settings, loaded from a YAML file with
//!   `RECSERVE__*` environment overrides.
//! - [`ModelDeclaration`]: the host's per-model declaration (tensor list plus a
//!   flat string-valued parameter map).
//! - [`ModelConfig`]: the parsed, validated parameters derived from a declaration.

use crate::datatype::DataType;
use crate::error::{RecServeError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::info;

/// Parameter keys understood in a model declaration
pub mod keys {
    pub const MAX_BATCH_SIZE: &str = "max_batch_size";
    pub const SLOTS: &str = "slots";
    pub const DENSE_FEATURES: &str = "des_feature_num";
    pub const CATEGORICAL_FEATURES: &str = "cat_feature_num";
    pub const EMBEDDING_VECTOR_SIZE: &str = "embedding_vector_size";
    pub const MAX_NNZ: &str = "max_nnz";
    pub const TOPOLOGY: &str = "config";
    pub const GPU_CACHE: &str = "gpucache";
    pub const GPU_CACHE_RATIO: &str = "gpucacheper";
    pub const LONG_KEY: &str = "embeddingkey_long_type";
    pub const BUFFER_SETS: &str = "buffer_sets";
}

/// Bit width of categorical feature identifiers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyWidth {
    /// 32-bit keys
    #[default]
    Bits32,

    /// 64-bit keys
    Bits64,
}

impl KeyWidth {
    /// Select the width from a "long key" flag
    pub fn from_long_flag(long: bool) -> Self {
        if long {
            KeyWidth::Bits64
        } else {
            KeyWidth::Bits32
        }
    }

    /// Number of bits
    pub fn bits(&self) -> u32 {
        match self {
            KeyWidth::Bits32 => 32,
            KeyWidth::Bits64 => 64,
        }
    }

    /// Number of bytes per key
    pub fn bytes(&self) -> usize {
        self.bits() as usize / 8
    }
}

impl fmt::Display for KeyWidth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-bit", self.bits())
    }
}

/// Process-level backend settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendSettings {
    /// Select 64-bit embedding keys for every model in the process
    #[serde(default)]
    pub support_long_embedding_key: bool,

    /// Models hosted by this process
    #[serde(default)]
    pub models: Vec<HostedModel>,

    /// Tracing filter directive
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

/// A model hosted by the process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostedModel {
    /// Model name
    pub name: String,

    /// Topology path handed to the parameter server
    pub topology: PathBuf,

    /// Path of the model declaration file
    #[serde(skip_serializing_if = "Option::is_none")]
    pub declaration: Option<PathBuf>,

    /// Devices to create an instance on
    #[serde(default = "default_device_ids")]
    pub device_ids: Vec<i32>,
}

fn default_log_filter() -> String {
    "recserve_backend=info,recserve_common=info".to_string()
}

fn default_device_ids() -> Vec<i32> {
    vec![0]
}

impl BackendSettings {
    /// Load settings from a file layered with `RECSERVE__*` environment overrides
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let settings: BackendSettings = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(
                config::Environment::with_prefix("RECSERVE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| {
                RecServeError::configuration(format!(
                    "Failed to read settings file {}: {}",
                    path.display(),
                    e
                ))
            })?
            .try_deserialize()?;

        settings.validate()?;
        Ok(settings)
    }

    /// Load settings from environment variables only
    pub fn from_env() -> Result<Self> {
        let settings: BackendSettings = config::Config::builder()
            .add_source(
                config::Environment::with_prefix("RECSERVE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        settings.validate()?;
        Ok(settings)
    }

    /// Validate settings
    pub fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for model in &self.models {
            if model.name.is_empty() {
                return Err(RecServeError::configuration("Hosted model with empty name"));
            }
            if !seen.insert(model.name.as_str()) {
                return Err(RecServeError::configuration(format!(
                    "Model {} is listed twice",
                    model.name
                )));
            }
            if model.topology.as_os_str().is_empty() {
                return Err(RecServeError::configuration(format!(
                    "Model {} has no topology path",
                    model.name
                )));
            }
        }
        Ok(())
    }

    /// Key width selected for the whole process
    pub fn key_width(&self) -> KeyWidth {
        KeyWidth::from_long_flag(self.support_long_embedding_key)
    }

    /// Topology paths and model names of every hosted model, in listing order
    pub fn topology_union(&self) -> (Vec<PathBuf>, Vec<String>) {
        self.models
            .iter()
            .map(|m| (m.topology.clone(), m.name.clone()))
            .unzip()
    }
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            support_long_embedding_key: false,
            models: Vec::new(),
            log_filter: default_log_filter(),
        }
    }
}

/// Declared input or output tensor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorSpec {
    /// Tensor name
    pub name: String,

    /// Element datatype
    pub data_type: DataType,

    /// Dimensions, -1 marks a variable extent
    pub dims: Vec<i64>,
}

/// A declared parameter value, either bare or wrapped as `{string_value: ...}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    Plain(String),
    Wrapped { string_value: String },
}

impl ParameterValue {
    pub fn as_str(&self) -> &str {
        match self {
            ParameterValue::Plain(s) => s,
            ParameterValue::Wrapped { string_value } => string_value,
        }
    }
}

/// The host's declaration of a model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelDeclaration {
    /// Model name
    pub name: String,

    /// Maximum batch size, 0 disables first-dimension batching
    #[serde(default)]
    pub max_batch_size: i64,

    /// Declared inputs, in order: dense, categorical-index, row-offset
    #[serde(default)]
    pub input: Vec<TensorSpec>,

    /// Declared outputs
    #[serde(default)]
    pub output: Vec<TensorSpec>,

    /// String-valued parameters
    #[serde(default)]
    pub parameters: BTreeMap<String, ParameterValue>,
}

impl ModelDeclaration {
    /// Load a declaration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            RecServeError::configuration(format!(
                "Failed to read model declaration {}: {}",
                path.display(),
                e
            ))
        })?;
        Ok(serde_yaml::from_str(&content)?)
    }

    /// Flatten the parameter map to plain strings
    pub fn flat_parameters(&self) -> BTreeMap<String, String> {
        self.parameters
            .iter()
            .map(|(k, v)| (k.clone(), v.as_str().to_string()))
            .collect()
    }

    /// Check the tensor contract: 3 inputs, 1 output, matching datatype and shape
    pub fn validate(&self) -> Result<()> {
        info!(
            "Validating model declaration {}: {} inputs, {} outputs",
            self.name,
            self.input.len(),
            self.output.len()
        );

        if self.input.len() != 3 {
            return Err(RecServeError::shape_mismatch(format!(
                "expected 3 inputs, got {}",
                self.input.len()
            )));
        }
        if self.output.len() != 1 {
            return Err(RecServeError::shape_mismatch(format!(
                "expected 1 output, got {}",
                self.output.len()
            )));
        }

        let input = &self.input[0];
        let output = &self.output[0];

        if input.data_type != output.data_type {
            return Err(RecServeError::shape_mismatch(format!(
                "expected input and output datatype to match, got {} and {}",
                input.data_type, output.data_type
            )));
        }
        if input.dims != output.dims {
            return Err(RecServeError::shape_mismatch(format!(
                "expected input and output shape to match, got {:?} and {:?}",
                input.dims, output.dims
            )));
        }

        Ok(())
    }
}

/// Parsed, validated per-model parameters
#[derive(Debug, Clone, PartialEq)]
pub struct ModelConfig {
    /// Model name
    pub name: String,

    /// Upper bound on samples per request
    pub max_batch_size: usize,

    /// Number of categorical slots
    pub slot_count: usize,

    /// Dense features per sample
    pub dense_feature_count: usize,

    /// Categorical features per sample
    pub categorical_feature_count: usize,

    /// Embedding vector width
    pub embedding_vector_size: usize,

    /// Maximum non-zero keys per slot
    pub max_nnz_per_slot: usize,

    /// Fraction of the embedding table kept in the device cache
    pub cache_size_ratio: f32,

    /// Categorical key width
    pub key_width: KeyWidth,

    /// Whether the device embedding cache is enabled
    pub gpu_cache_enabled: bool,

    /// Topology path handed to the cache and scoring engine
    pub topology_config_path: PathBuf,

    /// Number of independent buffer sets per instance
    pub buffer_sets: usize,

    /// Whether the host batches requests along the first dimension
    pub supports_first_dim_batching: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            max_batch_size: 64,
            slot_count: 10,
            dense_feature_count: 50,
            categorical_feature_count: 50,
            embedding_vector_size: 64,
            max_nnz_per_slot: 3,
            cache_size_ratio: 0.5,
            key_width: KeyWidth::Bits32,
            gpu_cache_enabled: false,
            topology_config_path: PathBuf::new(),
            buffer_sets: 1,
            supports_first_dim_batching: true,
        }
    }
}

impl ModelConfig {
    /// Validate a declaration and parse its parameters
    ///
    /// Shape violations fail with `ShapeMismatch`, malformed values with
    /// `Configuration`. Either way the model never loads.
    pub fn from_declaration(declaration: &ModelDeclaration) -> Result<Self> {
        declaration.validate()?;

        let mut params = declaration.flat_parameters();
        if declaration.max_batch_size > 0 {
            params.insert(
                keys::MAX_BATCH_SIZE.to_string(),
                declaration.max_batch_size.to_string(),
            );
        }

        let mut config = Self::from_parameters(&declaration.name, &params)?;
        config.supports_first_dim_batching = declaration.max_batch_size > 0;
        Ok(config)
    }

    /// Parse a flat string-valued parameter map; absent keys take their defaults
    pub fn from_parameters(name: &str, params: &BTreeMap<String, String>) -> Result<Self> {
        let defaults = ModelConfig::default();

        let config = ModelConfig {
            name: name.to_string(),
            max_batch_size: parse_count(params, keys::MAX_BATCH_SIZE, defaults.max_batch_size)?,
            slot_count: parse_count(params, keys::SLOTS, defaults.slot_count)?,
            dense_feature_count: parse_count(
                params,
                keys::DENSE_FEATURES,
                defaults.dense_feature_count,
            )?,
            categorical_feature_count: parse_count(
                params,
                keys::CATEGORICAL_FEATURES,
                defaults.categorical_feature_count,
            )?,
            embedding_vector_size: parse_count(
                params,
                keys::EMBEDDING_VECTOR_SIZE,
                defaults.embedding_vector_size,
            )?,
            max_nnz_per_slot: parse_count(params, keys::MAX_NNZ, defaults.max_nnz_per_slot)?,
            cache_size_ratio: parse_ratio(
                params,
                keys::GPU_CACHE_RATIO,
                defaults.cache_size_ratio,
            )?,
            key_width: KeyWidth::from_long_flag(parse_bool(params, keys::LONG_KEY, false)?),
            gpu_cache_enabled: parse_bool(params, keys::GPU_CACHE, defaults.gpu_cache_enabled)?,
            topology_config_path: params
                .get(keys::TOPOLOGY)
                .map(PathBuf::from)
                .unwrap_or_default(),
            buffer_sets: parse_count(params, keys::BUFFER_SETS, defaults.buffer_sets)?,
            supports_first_dim_batching: defaults.supports_first_dim_batching,
        };
        config.check_capacities()?;

        info!(
            model = %config.name,
            max_batch_size = config.max_batch_size,
            slots = config.slot_count,
            dense = config.dense_feature_count,
            categorical = config.categorical_feature_count,
            embedding_size = config.embedding_vector_size,
            max_nnz = config.max_nnz_per_slot,
            key_width = %config.key_width,
            gpu_cache = config.gpu_cache_enabled,
            cache_ratio = config.cache_size_ratio,
            topology = %config.topology_config_path.display(),
            "Parsed model configuration"
        );

        Ok(config)
    }

    /// Fail with `Configuration` if any staging buffer size overflows `usize`
    ///
    /// The capacity helpers below rely on this having passed.
    pub fn check_capacities(&self) -> Result<()> {
        let mbs = self.max_batch_size;
        let buffers = [
            ("dense", mbs.checked_mul(self.dense_feature_count), 4),
            (
                "categorical",
                mbs.checked_mul(self.categorical_feature_count),
                self.key_width.bytes(),
            ),
            (
                "row offset",
                mbs.checked_mul(self.slot_count).and_then(|n| n.checked_add(1)),
                4,
            ),
            ("prediction", Some(mbs), 4),
        ];

        for (buffer, elements, width) in buffers {
            let bytes = elements
                .and_then(|n| n.checked_mul(width))
                .and_then(|b| b.checked_next_multiple_of(32));
            if bytes.is_none() {
                return Err(RecServeError::configuration(format!(
                    "{} buffer for max_batch_size {} does not fit in memory",
                    buffer, mbs
                )));
            }
        }
        Ok(())
    }

    /// Element capacity of the dense-feature buffer
    pub fn dense_capacity(&self) -> usize {
        self.max_batch_size * self.dense_feature_count
    }

    /// Element capacity of the categorical-index buffer
    pub fn categorical_capacity(&self) -> usize {
        self.max_batch_size * self.categorical_feature_count
    }

    /// Element capacity of the row-offset buffer
    pub fn row_offset_capacity(&self) -> usize {
        self.max_batch_size * self.slot_count + 1
    }

    /// Element capacity of the prediction buffer
    pub fn prediction_capacity(&self) -> usize {
        self.max_batch_size
    }
}

fn parse_count(params: &BTreeMap<String, String>, key: &str, default: usize) -> Result<usize> {
    let Some(raw) = params.get(key) else {
        return Ok(default);
    };
    let value: usize = raw.trim().parse().map_err(|_| {
        RecServeError::configuration(format!("{} must be a positive integer, got {:?}", key, raw))
    })?;
    if value == 0 {
        return Err(RecServeError::configuration(format!(
            "{} must be a positive integer, got 0",
            key
        )));
    }
    Ok(value)
}

fn parse_ratio(params: &BTreeMap<String, String>, key: &str, default: f32) -> Result<f32> {
    let Some(raw) = params.get(key) else {
        return Ok(default);
    };
    let value: f32 = raw.trim().parse().map_err(|_| {
        RecServeError::configuration(format!("{} must be a number, got {:?}", key, raw))
    })?;
    if !value.is_finite() || !(0.0..=1.0).contains(&value) {
        return Err(RecServeError::configuration(format!(
            "{} must lie in [0, 1], got {}",
            key, value
        )));
    }
    Ok(value)
}

fn parse_bool(params: &BTreeMap<String, String>, key: &str, default: bool) -> Result<bool> {
    let Some(raw) = params.get(key) else {
        return Ok(default);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(RecServeError::configuration(format!(
            "{} must be true or false, got {:?}",
            key, raw
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::io::Write;

    const DECLARATION: &str = r#"
name: criteo
max_batch_size: 64
input:
  - name: DES
    data_type: TYPE_FP32
    dims: [-1]
  - name: CATCOLUMN
    data_type: TYPE_UINT32
    dims: [-1]
  - name: ROWINDEX
    data_type: TYPE_INT32
    dims: [-1]
output:
  - name: OUTPUT0
    data_type: TYPE_FP32
    dims: [-1]
parameters:
  slots:
    string_value: "26"
  des_feature_num: "13"
  cat_feature_num: "26"
  embedding_vector_size: "16"
  max_nnz: "2"
  config: /models/criteo/1/criteo.json
  gpucache: "true"
  gpucacheper: "0.25"
"#;

    fn params(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults_when_keys_absent() {
        let config = ModelConfig::from_parameters("m", &BTreeMap::new()).unwrap();
        assert_eq!(config.max_batch_size, 64);
        assert_eq!(config.slot_count, 10);
        assert_eq!(config.dense_feature_count, 50);
        assert_eq!(config.categorical_feature_count, 50);
        assert_eq!(config.embedding_vector_size, 64);
        assert_eq!(config.max_nnz_per_slot, 3);
        assert_eq!(config.cache_size_ratio, 0.5);
        assert_eq!(config.key_width, KeyWidth::Bits32);
        assert!(!config.gpu_cache_enabled);
        assert_eq!(config.buffer_sets, 1);
    }

    #[test]
    fn test_parse_declaration() {
        let declaration: ModelDeclaration = serde_yaml::from_str(DECLARATION).unwrap();
        let config = ModelConfig::from_declaration(&declaration).unwrap();

        assert_eq!(config.name, "criteo");
        assert_eq!(config.slot_count, 26);
        assert_eq!(config.dense_feature_count, 13);
        assert_eq!(config.embedding_vector_size, 16);
        assert_eq!(config.max_nnz_per_slot, 2);
        assert!(config.gpu_cache_enabled);
        assert_eq!(config.cache_size_ratio, 0.25);
        assert_eq!(
            config.topology_config_path,
            PathBuf::from("/models/criteo/1/criteo.json")
        );
        assert!(config.supports_first_dim_batching);
        assert_eq!(config.row_offset_capacity(), 64 * 26 + 1);
    }

    #[test]
    fn test_long_key_flag() {
        let config =
            ModelConfig::from_parameters("m", &params(&[("embeddingkey_long_type", "true")]))
                .unwrap();
        assert_eq!(config.key_width, KeyWidth::Bits64);
        assert_eq!(config.key_width.bytes(), 8);
    }

    #[test]
    fn test_key_width_defaults_to_32_bits() {
        assert_eq!(KeyWidth::default(), KeyWidth::Bits32);
        assert_eq!(KeyWidth::default().bytes(), 4);
        assert_eq!(KeyWidth::from_long_flag(false), KeyWidth::default());
    }

    #[test]
    fn test_malformed_numbers_rejected() {
        for (key, value) in [
            ("slots", "twenty"),
            ("des_feature_num", "-3"),
            ("max_nnz", "0"),
            ("gpucacheper", "abc"),
            ("gpucacheper", "1.5"),
            ("gpucache", "yes"),
        ] {
            let err = ModelConfig::from_parameters("m", &params(&[(key, value)])).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Configuration, "{}={}", key, value);
        }
    }

    #[test]
    fn test_oversized_capacities_rejected() {
        for pairs in [
            &[("max_batch_size", "4611686018427387904"), ("des_feature_num", "13")][..],
            &[("max_batch_size", "18446744073709551615")][..],
            // only the 64-bit key buffer overflows here
            &[
                ("max_batch_size", "2305843009213693952"),
                ("des_feature_num", "1"),
                ("cat_feature_num", "1"),
                ("slots", "1"),
                ("embeddingkey_long_type", "true"),
            ][..],
        ] {
            let err = ModelConfig::from_parameters("m", &params(pairs)).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Configuration, "{:?}", pairs);
        }

        let config =
            ModelConfig::from_parameters("m", &params(&[("max_batch_size", "1048576")])).unwrap();
        assert_eq!(config.dense_capacity(), 1048576 * 50);
    }

    #[test]
    fn test_dtype_mismatch_rejected() {
        let mut declaration: ModelDeclaration = serde_yaml::from_str(DECLARATION).unwrap();
        declaration.output[0].data_type = DataType::Fp64;

        let err = ModelConfig::from_declaration(&declaration).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ShapeMismatch);
    }

    #[test]
    fn test_arity_and_shape_mismatch_rejected() {
        let mut declaration: ModelDeclaration = serde_yaml::from_str(DECLARATION).unwrap();
        declaration.input.pop();
        assert_eq!(declaration.validate().unwrap_err().kind(), ErrorKind::ShapeMismatch);

        let mut declaration: ModelDeclaration = serde_yaml::from_str(DECLARATION).unwrap();
        declaration.output[0].dims = vec![1];
        assert_eq!(declaration.validate().unwrap_err().kind(), ErrorKind::ShapeMismatch);
    }

    #[test]
    fn test_settings_from_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        write!(
            file,
            r#"
support_long_embedding_key: true
models:
  - name: criteo
    topology: /models/criteo/1/criteo.json
    device_ids: [0, 1]
  - name: avazu
    topology: /models/avazu/1/avazu.json
"#
        )
        .unwrap();

        let settings = BackendSettings::from_file(file.path()).unwrap();
        assert_eq!(settings.key_width(), KeyWidth::Bits64);
        assert_eq!(settings.models[0].device_ids, vec![0, 1]);
        assert_eq!(settings.models[1].device_ids, vec![0]);

        let (paths, names) = settings.topology_union();
        assert_eq!(names, vec!["criteo".to_string(), "avazu".to_string()]);
        assert_eq!(paths[1], PathBuf::from("/models/avazu/1/avazu.json"));
    }

    #[test]
    fn test_settings_reject_duplicate_models() {
        let settings = BackendSettings {
            models: vec![
                HostedModel {
                    name: "a".to_string(),
                    topology: PathBuf::from("/a.json"),
                    declaration: None,
                    device_ids: vec![0],
                },
                HostedModel {
                    name: "a".to_string(),
                    topology: PathBuf::from("/b.json"),
                    declaration: None,
                    device_ids: vec![0],
                },
            ],
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }
}
