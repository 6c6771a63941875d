use thiserror::Error;

use crate::types::SourceId;

pub type Result<T> = std::result::Result<T, IngestError>;

#[derive(Error, Debug)]
pub enum IngestError {
    /// Network failure, HTTP 429 or 5xx. Retried with bounded backoff.
    #[error("Transient fetch error from {source_id}: {message}")]
    TransientFetch {
        source_id: SourceId,
        status: Option<u16>,
        message: String,
    },

    /// A fetch or run exceeded its deadline. Treated as transient.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Credentials rejected. Fatal to the run; needs rotation.
    #[error("Authentication failed for {source_id}: {message}")]
    Auth { source_id: SourceId, message: String },

    /// Response could not be interpreted. Fatal to the run.
    #[error("Malformed response from {source_id}: {message}")]
    MalformedResponse { source_id: SourceId, message: String },

    /// A single record failed normalization. Absorbed by the normalizer.
    #[error("Validation error: {0}")]
    Validation(String),

    /// CAS on a canonical row kept losing. Indicates a bug in write discipline.
    #[error("Merge conflict on {natural_key}: {message}")]
    MergeConflict { natural_key: String, message: String },

    /// Cursor, canonical or landing store unavailable.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Another run for this source holds the lease.
    #[error("A fetch run for {0} is already in progress")]
    RunInProgress(SourceId),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl IngestError {
    /// Whether the failure is worth retrying with the same cursor.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            IngestError::TransientFetch { .. } | IngestError::Timeout(_)
        )
    }

    /// Failures an operator must act on.
    pub fn needs_operator(&self) -> bool {
        matches!(
            self,
            IngestError::Auth { .. }
                | IngestError::MalformedResponse { .. }
                | IngestError::MergeConflict { .. }
                | IngestError::Storage(_)
                | IngestError::Config(_)
        )
    }

    pub fn transient(source_id: &SourceId, status: Option<u16>, message: impl Into<String>) -> Self {
        IngestError::TransientFetch {
            source_id: source_id.clone(),
            status,
            message: message.into(),
        }
    }

    pub fn malformed(source_id: &SourceId, message: impl Into<String>) -> Self {
        IngestError::MalformedResponse {
            source_id: source_id.clone(),
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for IngestError {
    fn from(err: std::io::Error) -> Self {
        IngestError::Storage(err.to_string())
    }
}
