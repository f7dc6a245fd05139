//! Crate-wide error type.
//!
//! Every engine operation returns [`CoreError`]. Store adapters convert their
//! native failures into [`CoreError::StoreUnavailable`] so callers can apply
//! the two-tier policy: cache failures are recovered locally, persistent and
//! object store failures on write paths are surfaced.

use thiserror::Error;

/// Which backing store produced a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    KeyValue,
    Persistent,
    Object,
}

impl std::fmt::Display for StoreKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreKind::KeyValue => write!(f, "key-value store"),
            StoreKind::Persistent => write!(f, "persistent store"),
            StoreKind::Object => write!(f, "object store"),
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum CoreError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("{kind} {id} is {current}, cannot {action}")]
    InvalidState {
        kind: &'static str,
        id: String,
        current: String,
        action: &'static str,
    },

    #[error("{store} unavailable: {message}")]
    StoreUnavailable { store: StoreKind, message: String },

    /// The object was written but the row referencing it was not.
    #[error("orphan artifact {bucket}/{path}: {message}")]
    OrphanArtifact {
        bucket: String,
        path: String,
        message: String,
    },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("batch stopped after {created} of {requested} executions: {reason}")]
    PartialBatch {
        created: usize,
        requested: usize,
        created_ids: Vec<i64>,
        reason: String,
    },
}

pub type Result<T> = std::result::Result<T, CoreError>;

impl CoreError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        CoreError::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        CoreError::Validation(msg.into())
    }

    pub fn kv(err: impl std::fmt::Display) -> Self {
        CoreError::StoreUnavailable {
            store: StoreKind::KeyValue,
            message: err.to_string(),
        }
    }

    pub fn persistent(err: impl std::fmt::Display) -> Self {
        CoreError::StoreUnavailable {
            store: StoreKind::Persistent,
            message: err.to_string(),
        }
    }

    pub fn object(err: impl std::fmt::Display) -> Self {
        CoreError::StoreUnavailable {
            store: StoreKind::Object,
            message: err.to_string(),
        }
    }

    /// True for failures of the cache tier, which callers may always recover from.
    pub fn is_cache_failure(&self) -> bool {
        matches!(
            self,
            CoreError::StoreUnavailable {
                store: StoreKind::KeyValue,
                ..
            }
        )
    }
}

impl From<rusqlite::Error> for CoreError {
    fn from(e: rusqlite::Error) -> Self {
        CoreError::persistent(e)
    }
}

impl From<r2d2::Error> for CoreError {
    fn from(e: r2d2::Error) -> Self {
        CoreError::persistent(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_name_the_offender() {
        let e = CoreError::InvalidState {
            kind: "execution",
            id: "7".into(),
            current: "passed".into(),
            action: "complete",
        };
        assert_eq!(e.to_string(), "execution 7 is passed, cannot complete");

        let e = CoreError::not_found("config", "minio_bucket");
        assert_eq!(e.to_string(), "config not found: minio_bucket");
    }

    #[test]
    fn test_cache_failure_classification() {
        assert!(CoreError::kv("connection refused").is_cache_failure());
        assert!(!CoreError::persistent("disk full").is_cache_failure());
        assert!(!CoreError::validation("suite is required").is_cache_failure());
    }
}
