//! Embedding key abstraction
//!
//! The categorical-index path is written once, generic over the key type.
//! The width is picked when an instance is constructed.

use crate::buffer::Element;
use crate::collaborators::ParameterServer;
use crate::registry::SharedParameterServer;
use num_traits::PrimInt;
use recserve_common::{DataType, KeyWidth};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

/// Integer type used as a categorical feature identifier
pub trait EmbeddingKey: Element + PrimInt + Hash + Debug + Default {
    /// Width of this key type
    const WIDTH: KeyWidth;

    /// Whether a request tensor of `dtype` can be staged as this key type
    fn accepts(dtype: DataType) -> bool;

    /// Wrap a typed parameter server for the process-wide registry
    fn share(server: Arc<dyn ParameterServer<Self>>) -> SharedParameterServer;

    /// Recover the typed parameter server, `None` if it was built for the other width
    fn unshare(shared: &SharedParameterServer) -> Option<Arc<dyn ParameterServer<Self>>>;
}

impl EmbeddingKey for u32 {
    const WIDTH: KeyWidth = KeyWidth::Bits32;

    fn accepts(dtype: DataType) -> bool {
        matches!(dtype, DataType::Uint32 | DataType::Int32)
    }

    fn share(server: Arc<dyn ParameterServer<Self>>) -> SharedParameterServer {
        SharedParameterServer::Int32(server)
    }

    fn unshare(shared: &SharedParameterServer) -> Option<Arc<dyn ParameterServer<Self>>> {
        match shared {
            SharedParameterServer::Int32(server) => Some(server.clone()),
            SharedParameterServer::Int64(_) => None,
        }
    }
}

impl EmbeddingKey for i64 {
    const WIDTH: KeyWidth = KeyWidth::Bits64;

    fn accepts(dtype: DataType) -> bool {
        matches!(dtype, DataType::Int64 | DataType::Uint64)
    }

    fn share(server: Arc<dyn ParameterServer<Self>>) -> SharedParameterServer {
        SharedParameterServer::Int64(server)
    }

    fn unshare(shared: &SharedParameterServer) -> Option<Arc<dyn ParameterServer<Self>>> {
        match shared {
            SharedParameterServer::Int64(server) => Some(server.clone()),
            SharedParameterServer::Int32(_) => None,
        }
    }
}
