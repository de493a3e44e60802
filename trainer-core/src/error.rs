//! Error types for the trainer control plane.
//!
//! Uses `thiserror` for public API error types. The variants mirror how callers
//! are expected to branch: validation problems are never retried, `NotFound`
//! and `Conflict` are surfaced distinctly, and everything else coming out of
//! the execution backend is propagated as-is.

use std::path::PathBuf;

/// Top-level error type for the trainer core library.
#[derive(Debug, thiserror::Error)]
pub enum TrainerError {
    #[error("Runner error: {0}")]
    Runner(#[from] RunnerError),

    #[error("Manifest error: {0}")]
    Manifest(#[from] ManifestError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Callback error: {0}")]
    Callback(#[from] CallbackError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl TrainerError {
    /// Whether the error means the job (or backend resource) does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, TrainerError::Runner(RunnerError::NotFound { .. }))
    }

    /// Whether the error is a name collision in the execution backend.
    pub fn is_conflict(&self) -> bool {
        matches!(self, TrainerError::Runner(RunnerError::Conflict { .. }))
    }
}

/// Errors from job submission, status lookup and cancellation.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("Job not found: {job_id}")]
    NotFound { job_id: String },

    #[error("{kind} {name} already exists")]
    Conflict { kind: String, name: String },

    #[error("Invalid job specification: {message}")]
    Validation { message: String },

    #[error("Backend request failed: {message}")]
    Backend { message: String },

    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RunnerError {
    pub fn not_found(job_id: impl Into<String>) -> Self {
        Self::NotFound {
            job_id: job_id.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }
}

/// Errors raised while translating a request into a manifest.
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Backend '{backend}' rejected the request: {reason}")]
    Unsupported { backend: String, reason: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ManifestError {
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn unsupported(backend: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Unsupported {
            backend: backend.into(),
            reason: reason.into(),
        }
    }
}

/// Errors from the configuration system.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Configuration parse error: {0}")]
    Parse(#[from] Box<figment::Error>),
}

/// Errors from outbound webhook delivery. These are logged, never returned
/// from runner operations.
#[derive(Debug, thiserror::Error)]
pub enum CallbackError {
    #[error("Webhook request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Webhook returned HTTP {status}")]
    Status { status: u16 },

    #[error("Webhook delivery failed: {message}")]
    Delivery { message: String },
}

/// A type alias for results using the top-level `TrainerError`.
pub type Result<T> = std::result::Result<T, TrainerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_runner() {
        let err = TrainerError::Runner(RunnerError::not_found("job-123"));
        assert_eq!(err.to_string(), "Runner error: Job not found: job-123");
        assert!(err.is_not_found());
        assert!(!err.is_conflict());
    }

    #[test]
    fn test_error_display_conflict() {
        let err = TrainerError::Runner(RunnerError::Conflict {
            kind: "TrainJob".into(),
            name: "nemo-job-1".into(),
        });
        assert_eq!(
            err.to_string(),
            "Runner error: TrainJob nemo-job-1 already exists"
        );
        assert!(err.is_conflict());
    }

    #[test]
    fn test_error_display_manifest() {
        let err = TrainerError::Manifest(ManifestError::unsupported(
            "nemo",
            "at least one GPU is required",
        ));
        assert_eq!(
            err.to_string(),
            "Manifest error: Backend 'nemo' rejected the request: at least one GPU is required"
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: TrainerError = io.into();
        assert!(matches!(err, TrainerError::Io(_)));
    }
}
