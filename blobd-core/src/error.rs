use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, BlobError>;

#[derive(Error, Debug)]
pub enum BlobError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("BLOB not found: {0}")]
    NotFound(String),

    #[error("Failed to find a unique key for BLOB of job {job} (last tried {path})")]
    KeyCollisionExhausted { job: String, path: String },

    #[error("BLOB size exceeds the maximum size (2 GB): {0} bytes")]
    TooLarge(u64),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Blob store error: {0}")]
    Store(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Data corruption: expected {expected}, got {actual}")]
    Corrupted { expected: String, actual: String },

    #[error("Server error ({kind}): {message}")]
    Remote { kind: String, message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("BLOB server is shut down")]
    ShutDown,
}

impl BlobError {
    /// Stable identifier of the failure class, carried in ERROR frames.
    pub fn kind(&self) -> &'static str {
        match self {
            BlobError::Io(_) => "io",
            BlobError::Protocol(_) => "protocol",
            BlobError::NotFound(_) => "not_found",
            BlobError::KeyCollisionExhausted { .. } => "key_collision_exhausted",
            BlobError::TooLarge(_) => "too_large",
            BlobError::InvalidRequest(_) => "invalid_request",
            BlobError::Store(_) => "store",
            BlobError::Config(_) => "config",
            BlobError::Tls(_) => "tls",
            BlobError::Timeout(_) => "timeout",
            BlobError::Corrupted { .. } => "corrupted",
            BlobError::Remote { .. } => "remote",
            BlobError::Serialization(_) => "serialization",
            BlobError::ShutDown => "shut_down",
        }
    }

    /// Kind reported by the server, if this error came out of an ERROR frame.
    pub fn remote_kind(&self) -> Option<&str> {
        match self {
            BlobError::Remote { kind, .. } => Some(kind.as_str()),
            _ => None,
        }
    }
}

impl From<rustls::Error> for BlobError {
    fn from(err: rustls::Error) -> Self {
        BlobError::Tls(err.to_string())
    }
}

/// Payload of an ERROR frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub kind: String,
    pub message: String,
}

impl From<&BlobError> for ErrorPayload {
    fn from(err: &BlobError) -> Self {
        match err {
            // forward what the remote side said instead of wrapping it twice
            BlobError::Remote { kind, message } => Self {
                kind: kind.clone(),
                message: message.clone(),
            },
            other => Self {
                kind: other.kind().to_string(),
                message: other.to_string(),
            },
        }
    }
}

impl From<ErrorPayload> for BlobError {
    fn from(payload: ErrorPayload) -> Self {
        BlobError::Remote {
            kind: payload.kind,
            message: payload.message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_payload_keeps_kind_and_message() {
        let err = BlobError::NotFound("t-00/none".to_string());
        let payload = ErrorPayload::from(&err);
        assert_eq!(payload.kind, "not_found");
        assert!(payload.message.contains("t-00/none"));

        let remote = BlobError::from(payload.clone());
        assert_eq!(remote.remote_kind(), Some("not_found"));
        assert_eq!(ErrorPayload::from(&remote), payload);
    }
}
