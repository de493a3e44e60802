//! Error types for the trainer-storage crate.

use thiserror::Error;

/// Errors from storage drivers, checkpoint handling and dataset helpers.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Unsupported storage URI '{uri}': {reason}")]
    InvalidUri { uri: String, reason: String },

    #[error("Invalid object key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("Object not found: {key}")]
    NotFound { key: String },

    #[error("Dataset error: {0}")]
    Dataset(String),

    #[error("Object store error: {0}")]
    ObjectStore(#[from] object_store::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StorageError {
    pub fn dataset(msg: impl Into<String>) -> Self {
        Self::Dataset(msg.into())
    }

    pub fn not_found(key: impl Into<String>) -> Self {
        Self::NotFound { key: key.into() }
    }

    /// Map an object-store failure on `key`, keeping "not found" distinct.
    pub(crate) fn from_store(err: object_store::Error, key: &str) -> Self {
        match err {
            object_store::Error::NotFound { .. } => Self::not_found(key),
            other => Self::ObjectStore(other),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_not_found_is_mapped() {
        let err = object_store::Error::NotFound {
            path: "checkpoints/step-000001.json".into(),
            source: "missing".into(),
        };
        let mapped = StorageError::from_store(err, "checkpoints/step-000001.json");
        assert!(mapped.is_not_found());
        assert_eq!(mapped.to_string(), "Object not found: checkpoints/step-000001.json");
    }

    #[test]
    fn test_other_store_errors_pass_through() {
        let err = object_store::Error::NotImplemented;
        assert!(matches!(
            StorageError::from_store(err, "k"),
            StorageError::ObjectStore(_)
        ));
    }
}
