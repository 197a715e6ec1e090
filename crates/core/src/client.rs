//! Abstract cluster client used by engines and the remediator.

use serde_json::Value as Json;

use crate::{Manifest, ObjectId};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    #[error("{0} not found")]
    NotFound(ObjectId),
    #[error("{0} already exists")]
    AlreadyExists(ObjectId),
    /// Optimistic concurrency failure (stale resourceVersion).
    #[error("conflict on {id}: {message}")]
    Conflict { id: ObjectId, message: String },
    #[error("unknown type: {0}")]
    UnknownType(String),
    #[error("api error: {0}")]
    Api(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("request timed out after {0:?}")]
    Timeout(std::time::Duration),
}

impl ClientError {
    /// Errors caused by a stale view of the object rather than by the server.
    pub fn is_conflict(&self) -> bool {
        matches!(self, ClientError::NotFound(_) | ClientError::AlreadyExists(_) | ClientError::Conflict { .. })
    }
}

/// get/create/update/delete by identity. Safe for concurrent use.
#[async_trait::async_trait]
pub trait ClusterClient: Send + Sync {
    /// Live object body, `None` when it does not exist.
    async fn get(&self, id: &ObjectId) -> Result<Option<Json>, ClientError>;
    async fn create(&self, obj: &Manifest) -> Result<Json, ClientError>;
    /// Converge an existing object onto `obj`.
    async fn update(&self, obj: &Manifest) -> Result<Json, ClientError>;
    async fn delete(&self, id: &ObjectId) -> Result<(), ClientError>;
}
