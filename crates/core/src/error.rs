use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ClusterId;

/// Classified failures reported by a cluster API client.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum ClientError {
    #[error("network: {0}")]
    Network(String),
    #[error("auth: {0}")]
    Auth(String),
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("server: {0}")]
    Server(String),
    /// The server answered with something that cannot be decoded or keyed.
    #[error("malformed: {0}")]
    Malformed(String),
}

impl ClientError {
    pub fn is_transient(&self) -> bool { matches!(self, ClientError::Network(_) | ClientError::Server(_)) }
}

/// Engine-level errors surfaced to observers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum CabinError {
    #[error("duplicate cluster: {0} is already registered")]
    DuplicateCluster(String),
    #[error("cluster not found: {0}")]
    ClusterNotFound(ClusterId),
    #[error("entity not found: {0}")]
    EntityNotFound(String),
    #[error("invalid label format: {0}")]
    InvalidLabelFormat(String),
    #[error("invalid replicas: {requested} (allowed 1..={max})")]
    InvalidReplicas { requested: u32, max: u32 },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("rolling update needs exactly one container, found {0}")]
    UnsupportedMultiContainer(usize),
    #[error("missing source configuration: {0}")]
    MissingSourceConfiguration(String),
    #[error("unsupported kind: {0}")]
    UnsupportedKind(String),
    #[error("mutation failed: {reason}")]
    MutationFailed { reason: String },
    #[error("mutation timed out after {0:?}")]
    MutationTimedOut(Duration),
    #[error("malformed response: {0}")]
    MalformedResponse(String),
    #[error("cluster {0} was removed while the operation was in flight")]
    ClusterRemoved(ClusterId),
    #[error("remote: {0}")]
    Remote(ClientError),
}

impl CabinError {
    /// Detected locally before any network call; never retried.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            CabinError::InvalidLabelFormat(_)
                | CabinError::InvalidReplicas { .. }
                | CabinError::InvalidArgument(_)
                | CabinError::UnsupportedMultiContainer(_)
                | CabinError::MissingSourceConfiguration(_)
                | CabinError::UnsupportedKind(_)
        )
    }
}

impl From<ClientError> for CabinError {
    fn from(e: ClientError) -> Self {
        match e {
            ClientError::Malformed(m) => CabinError::MalformedResponse(m),
            other => CabinError::Remote(other),
        }
    }
}

pub type CabinResult<T> = Result<T, CabinError>;
