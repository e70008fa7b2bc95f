//! Backends turn an open request into a connected transport.

mod kube;

use async_trait::async_trait;

use crate::session::{ConnectionMode, Target};
use crate::transport::{Transport, TransportError};

pub use kube::KubeBackend;

/// Everything a backend needs to open one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenRequest {
    pub mode: ConnectionMode,
    pub target: Target,
    /// Resolved argv for exec sessions.
    pub command: Vec<String>,
}

/// Opens remote streams.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn open(&self, request: &OpenRequest) -> Result<Transport, TransportError>;
}
