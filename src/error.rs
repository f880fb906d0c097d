//! Error types for face matching jobs.
//!
//! Failures are split by blast radius: [`ItemError`] covers one candidate and
//! never aborts a job, while [`JobError`] is either rejected up front
//! (`InvalidSpec`, `NotFound`) or terminates the run with status `error`.

use thiserror::Error;

/// Errors from the face recognition provider.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// Throttling, timeouts and other failures worth retrying.
    #[error("provider temporarily unavailable: {0}")]
    Transient(String),

    /// Undecodable image, missing collection that cannot be created, bad request.
    #[error("provider rejected request ({code}): {message}")]
    Permanent {
        /// Provider-reported error code (e.g. `InvalidImage`).
        code: String,
        /// A description of the failure.
        message: String,
    },
}

impl ProviderError {
    /// Code reported for images the provider could not decode.
    pub const INVALID_IMAGE: &'static str = "InvalidImage";

    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Transient(_))
    }

    /// True when the provider refused the image itself rather than the request.
    pub fn is_invalid_image(&self) -> bool {
        matches!(self, ProviderError::Permanent { code, .. } if code == Self::INVALID_IMAGE)
    }
}

/// Errors from the object source (candidate enumeration and downloads).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("storage unavailable for {path}: {message}")]
    Unavailable { path: String, message: String },
}

/// Errors from the progress and metadata stores.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("no record for {0}")]
    NotFound(String),

    #[error("store error: {0}")]
    Other(String),
}

/// Failure of a single candidate. Logged and counted as scanned, never fatal.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ItemError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// Transient failures persisted past the retry budget.
    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: ProviderError },

    #[error("metadata update failed: {0}")]
    Metadata(String),
}

/// Job-level errors.
#[derive(Debug, Error)]
pub enum JobError {
    /// Malformed job input, rejected before any background work starts.
    #[error("invalid job spec: {0}")]
    InvalidSpec(String),

    #[error("job not found: {0}")]
    NotFound(String),

    /// Infrastructure failure outside the per-item loop.
    #[error("job failed: {0}")]
    Fatal(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, JobError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_error_classification() {
        assert!(ProviderError::Transient("throttled".into()).is_transient());

        let invalid = ProviderError::Permanent {
            code: ProviderError::INVALID_IMAGE.to_string(),
            message: "bad bytes".into(),
        };
        assert!(!invalid.is_transient());
        assert!(invalid.is_invalid_image());

        let missing = ProviderError::Permanent {
            code: "ResourceNotFound".into(),
            message: "no collection".into(),
        };
        assert!(!missing.is_invalid_image());
    }

    #[test]
    fn test_item_error_messages() {
        let err = ItemError::RetriesExhausted {
            attempts: 3,
            last: ProviderError::Transient("throttled".into()),
        };
        assert_eq!(
            err.to_string(),
            "gave up after 3 attempts: provider temporarily unavailable: throttled"
        );
    }
}
