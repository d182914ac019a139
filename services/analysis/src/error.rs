//! Error taxonomy shared by the orchestration components.

use thiserror::Error;

/// No credential could be produced, or the store rejected the one we had.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthenticationError {
    #[error("No credential strategy succeeded: {}", .attempts.join("; "))]
    NoCredential { attempts: Vec<String> },

    #[error("Document store rejected credential (HTTP {status})")]
    Rejected { status: u16 },
}

/// Errors surfaced by the document store client
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error(transparent)]
    Authentication(#[from] AuthenticationError),

    #[error("Transient network failure: {0}")]
    TransientNetwork(String),

    #[error("Document store returned HTTP {status}: {message}")]
    RemoteService { status: u16, message: String },

    #[error("Data consistency violation: {0}")]
    DataConsistency(String),

    #[error("Failed to serialize document: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Only transport-level failures are safe to retry with the same request
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::TransientNetwork(_))
    }

    pub fn is_authentication(&self) -> bool {
        matches!(self, StoreError::Authentication(_))
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

/// Errors from the vision analysis capability
#[derive(Error, Debug, Clone)]
pub enum AnalysisError {
    #[error("Analysis timed out after {0}s")]
    Timeout(u64),

    #[error("Analysis transport failure: {0}")]
    Transport(String),

    #[error("Analysis service returned HTTP {status}: {message}")]
    RemoteService { status: u16, message: String },

    #[error("Invalid analysis response: {0}")]
    InvalidResponse(String),
}

/// Errors from the object store capability
#[derive(Error, Debug, Clone)]
pub enum ObjectStoreError {
    #[error("Object store failure: {0}")]
    Backend(String),
}
