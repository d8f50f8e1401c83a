use relindex_storage::{ErrorKind, StorageError};
use thiserror::Error;

use crate::config::ConfigError;
use crate::indexer::BulkOutcome;

pub type Result<T> = std::result::Result<T, SyncError>;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Storage error: {0}")]
    Storage(StorageError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Size limit exceeded: {size} bytes over limit of {limit} bytes")]
    SizeLimitExceeded { size: u64, limit: u64 },

    #[error("Notification delivery failed on topic {topic}: {source}")]
    NotificationDelivery {
        topic: String,
        #[source]
        source: Box<SyncError>,
    },

    #[error("Reindex failed for {failed} of {total} relation chunks on {relation_type}")]
    ReindexFailed {
        relation_type: String,
        failed: usize,
        total: usize,
    },

    #[error(
        "Bulk queue drain interrupted after {} succeeded and {} failed: {source}",
        .outcome.succeeded,
        .outcome.failed
    )]
    DrainInterrupted {
        outcome: BulkOutcome,
        #[source]
        source: Box<SyncError>,
    },

    #[error("Index error: {0}")]
    Index(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<StorageError> for SyncError {
    fn from(err: StorageError) -> Self {
        if err.is_not_found() {
            SyncError::NotFound(err.message)
        } else {
            SyncError::Storage(err)
        }
    }
}

impl SyncError {
    pub fn index<E: std::fmt::Display>(e: E) -> Self {
        Self::Index(e.to_string())
    }

    pub fn validation<E: std::fmt::Display>(e: E) -> Self {
        Self::Validation(e.to_string())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, SyncError::NotFound(_))
    }

    /// Classify this error for retry decisions
    pub fn category(&self) -> ErrorCategory {
        match self {
            SyncError::Storage(e) => match e.kind {
                ErrorKind::Database | ErrorKind::Transaction | ErrorKind::RevisionConflict => {
                    ErrorCategory::Transient
                }
                _ => ErrorCategory::Permanent,
            },
            SyncError::Index(_) | SyncError::ReindexFailed { .. } => ErrorCategory::Transient,
            SyncError::NotificationDelivery { source, .. }
            | SyncError::DrainInterrupted { source, .. } => source.category(),
            SyncError::Io(_) => ErrorCategory::Infrastructure,
            SyncError::Other(_) => ErrorCategory::Transient,
            SyncError::NotFound(_)
            | SyncError::SizeLimitExceeded { .. }
            | SyncError::Validation(_)
            | SyncError::Config(_)
            | SyncError::Serialization(_) => ErrorCategory::Permanent,
        }
    }
}

/// Error category for retry logic
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ErrorCategory {
    /// Transient error - retry automatically (e.g., index unavailable, lock contention)
    Transient,
    /// Permanent error - don't retry (e.g., invalid document, missing record)
    Permanent,
    /// Infrastructure error - alert ops (e.g., disk full)
    Infrastructure,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Transient => "transient",
            ErrorCategory::Permanent => "permanent",
            ErrorCategory::Infrastructure => "infrastructure",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "transient" => Ok(ErrorCategory::Transient),
            "permanent" => Ok(ErrorCategory::Permanent),
            "infrastructure" => Ok(ErrorCategory::Infrastructure),
            _ => Err(SyncError::validation(format!(
                "Invalid error category: {}",
                s
            ))),
        }
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self, ErrorCategory::Permanent)
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_category_roundtrip() {
        for category in &[
            ErrorCategory::Transient,
            ErrorCategory::Permanent,
            ErrorCategory::Infrastructure,
        ] {
            let parsed = ErrorCategory::from_str(category.as_str()).unwrap();
            assert_eq!(*category, parsed);
        }
        assert!(ErrorCategory::from_str("invalid").is_err());
    }

    #[test]
    fn test_storage_not_found_maps_to_not_found() {
        let err: SyncError = StorageError::not_found("abcde-12345").into();
        assert!(err.is_not_found());
        assert_eq!(err.category(), ErrorCategory::Permanent);

        let err: SyncError = StorageError::database("locked").into();
        assert!(matches!(err, SyncError::Storage(_)));
        assert_eq!(err.category(), ErrorCategory::Transient);
    }

    #[test]
    fn test_delivery_error_inherits_category() {
        let err = SyncError::NotificationDelivery {
            topic: "mock-records".to_string(),
            source: Box::new(SyncError::index("cluster unavailable")),
        };
        assert_eq!(err.category(), ErrorCategory::Transient);
        assert!(err.to_string().contains("mock-records"));
    }

    #[test]
    fn test_interrupted_drain_keeps_counts() {
        let err = SyncError::DrainInterrupted {
            outcome: BulkOutcome {
                succeeded: 3,
                failed: 1,
                retried: 1,
                dead_lettered: 0,
            },
            source: Box::new(StorageError::database("locked").into()),
        };
        assert_eq!(err.category(), ErrorCategory::Transient);
        assert!(err.to_string().contains("3 succeeded and 1 failed"));
    }

    #[test]
    fn test_size_limit_message() {
        let err = SyncError::SizeLimitExceeded {
            size: 2048,
            limit: 1024,
        };
        assert!(err.to_string().contains("2048"));
        assert!(!err.category().is_retryable());
    }
}
