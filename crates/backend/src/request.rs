//! Request and response types exchanged with the host

use recserve_common::{DataType, ErrorKind, RecServeError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Request identifier
pub type RequestId = String;

/// Name of the single scoring output
pub const DEFAULT_OUTPUT: &str = "OUTPUT0";

/// Host-supplied input tensor, kept as raw little-endian bytes
#[derive(Debug, Clone, PartialEq)]
pub struct InputTensor {
    /// Tensor name
    pub name: String,

    /// Element datatype
    pub data_type: DataType,

    /// Declared shape
    pub shape: Vec<i64>,

    /// Contents
    pub data: Vec<u8>,
}

macro_rules! input_constructor {
    ($fn_name:ident, $ty:ty, $dtype:expr) => {
        /// Build a tensor from typed values
        pub fn $fn_name(name: impl Into<String>, shape: Vec<i64>, values: &[$ty]) -> Self {
            Self {
                name: name.into(),
                data_type: $dtype,
                shape,
                data: values.iter().flat_map(|v| v.to_le_bytes()).collect(),
            }
        }
    };
}

impl InputTensor {
    input_constructor!(from_f32, f32, DataType::Fp32);
    input_constructor!(from_i32, i32, DataType::Int32);
    input_constructor!(from_u32, u32, DataType::Uint32);
    input_constructor!(from_i64, i64, DataType::Int64);

    /// Size of the contents in bytes
    pub fn byte_size(&self) -> usize {
        self.data.len()
    }

    /// Number of elements, `None` if the byte size is not a whole number of elements
    pub fn element_count(&self) -> Option<usize> {
        let width = self.data_type.size();
        (width != 0 && self.data.len() % width == 0).then(|| self.data.len() / width)
    }
}

/// One scoring request: dense, categorical-index and row-offset inputs, in order
#[derive(Debug, Clone)]
pub struct InferenceRequest {
    /// Request identifier
    pub id: RequestId,

    /// Input tensors
    pub inputs: Vec<InputTensor>,

    /// Outputs the host asked for; empty means validate only
    pub requested_outputs: Vec<String>,
}

impl InferenceRequest {
    /// Create a request asking for the scoring output
    pub fn new(id: impl Into<RequestId>, inputs: Vec<InputTensor>) -> Self {
        Self {
            id: id.into(),
            inputs,
            requested_outputs: vec![DEFAULT_OUTPUT.to_string()],
        }
    }

    /// Ask for no output
    pub fn without_outputs(mut self) -> Self {
        self.requested_outputs.clear();
        self
    }
}

/// Scores returned for a request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputTensor {
    pub name: String,
    pub data_type: DataType,
    pub shape: Vec<i64>,
    pub data: Vec<f32>,
}

/// Failure reported for a single request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseError {
    /// Failure class label
    pub kind: String,

    /// Human-readable description
    pub message: String,
}

impl ResponseError {
    /// Failure class
    pub fn is(&self, kind: ErrorKind) -> bool {
        self.kind == kind.as_str()
    }
}

impl From<&RecServeError> for ResponseError {
    fn from(err: &RecServeError) -> Self {
        Self {
            kind: err.kind().as_str().to_string(),
            message: err.to_string(),
        }
    }
}

/// Response sent back for one request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InferenceResponse {
    /// Identifier of the request this answers
    pub request_id: RequestId,

    /// Output tensors
    pub outputs: Vec<OutputTensor>,

    /// Informational parameters
    pub parameters: BTreeMap<String, serde_json::Value>,

    /// Set when the request failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ResponseError>,
}

impl InferenceResponse {
    /// Whether the request succeeded
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    /// Scores of the first output, if any
    pub fn scores(&self) -> Option<&[f32]> {
        self.outputs.first().map(|o| o.data.as_slice())
    }
}
