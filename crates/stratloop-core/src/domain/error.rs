//! Error taxonomy for stratloop.
//!
//! Only transport and resource failures are errors. Extraction misses,
//! exhausted repair budgets and unrepairable fixes are ordinary outcomes of
//! the loop and are returned as values (see `controller::RepairOutcome`).

use std::path::PathBuf;

use stratloop_llm::LlmError;

/// Failures of the Execution Adapter that prevent a run from happening at
/// all. A strategy that runs and exits non-zero is not an `ExecutionError`.
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("cannot persist strategy to {path}: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("strategy run exceeded {limit_secs}s and was killed")]
    Timeout { limit_secs: u64 },

    #[error("io error while running strategy: {0}")]
    Io(#[from] std::io::Error),
}

/// Top-level stratloop errors.
#[derive(Debug, thiserror::Error)]
pub enum ForgeError {
    #[error("text-generation service failed: {0}")]
    Service(#[from] LlmError),

    #[error("execution failed: {0}")]
    Execution(#[from] ExecutionError),

    #[error("no current strategy; generate one first")]
    NoStrategy,

    #[error("invalid conversation: {0}")]
    InvalidConversation(String),

    #[error("invalid extraction rule `{pattern}`: {reason}")]
    InvalidRule { pattern: String, reason: String },

    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for stratloop operations.
pub type Result<T> = std::result::Result<T, ForgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forge_error_display() {
        let err = ForgeError::NoStrategy;
        assert!(err.to_string().contains("no current strategy"));

        let err = ForgeError::InvalidConversation("first message is user".to_string());
        assert!(err.to_string().contains("invalid conversation"));
    }

    #[test]
    fn test_service_error_wraps_llm_error() {
        let err: ForgeError = LlmError::EmptyResponse.into();
        assert!(matches!(err, ForgeError::Service(LlmError::EmptyResponse)));
        assert!(err.to_string().contains("empty response"));
    }

    #[test]
    fn test_execution_error_display() {
        let err = ExecutionError::Spawn {
            program: "python3".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "not found"),
        };
        let msg = ForgeError::from(err).to_string();
        assert!(msg.contains("cannot spawn python3"));
    }

    #[test]
    fn test_digest_mismatch_error() {
        let err = ForgeError::DigestMismatch {
            expected: "abc123".to_string(),
            actual: "def456".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("abc123"));
        assert!(msg.contains("def456"));
    }
}
