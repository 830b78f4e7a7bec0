//! RecServe Backend
//!
//! Serving bridge between a model-serving host and a recommendation scoring
//! engine backed by an embedding cache. Stages request tensors into
//! fixed-capacity buffers, runs the scoring call and answers every request
//! individually, so one bad request never fails its siblings.

pub mod backend;
pub mod buffer;
pub mod collaborators;
pub mod instance;
pub mod key;
pub mod memory;
pub mod processor;
pub mod reference;
pub mod registry;
pub mod request;

pub use backend::Backend;
pub use buffer::{get_num_elements, DeviceBuffer, RESERVATION_STRIDE};
pub use collaborators::{CollaboratorFactory, EmbeddingCache, ParameterServer, ScoringEngine};
pub use instance::{InstanceContext, ModelInstance};
pub use key::EmbeddingKey;
pub use memory::{DeviceAllocator, HostAllocator, MemoryClass};
pub use processor::{ExecutionReport, RequestBatchProcessor, RequestPhase};
pub use reference::ReferenceCollaborators;
pub use registry::ParameterServerRegistry;
pub use request::{InferenceRequest, InferenceResponse, InputTensor};
