//! Error types for the remote service boundary.

use thiserror::Error;

/// Maximum length of a response body echoed back inside an error.
const MAX_ERROR_BODY_LEN: usize = 200;

/// Errors produced while talking to the text-generation service or the
/// prompt server.
#[derive(Error, Debug)]
pub enum LlmError {
    /// No API key configured
    #[error("no API key configured (set OPENAI_API_KEY)")]
    MissingApiKey,

    /// Transport-level failure (connect, TLS, timeout, body read)
    #[error("HTTP error: {0}")]
    Http(String),

    /// The service answered with a non-success status
    #[error("service returned {status}: {body}")]
    Status { status: u16, body: String },

    /// The service answered but the payload was not what we expected
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    /// The service answered with no text at all
    #[error("service returned an empty response")]
    EmptyResponse,

    /// Prompt template could not be retrieved
    #[error("template {name} unavailable: {reason}")]
    Template { name: String, reason: String },

    /// JSON parsing error
    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<reqwest::Error> for LlmError {
    fn from(err: reqwest::Error) -> Self {
        LlmError::Http(err.to_string())
    }
}

impl LlmError {
    /// Build a `Status` error, truncating and redacting the body so that
    /// credentials echoed by a misbehaving proxy never reach logs.
    pub fn status(status: u16, body: &str) -> Self {
        LlmError::Status {
            status,
            body: sanitize_body(body),
        }
    }
}

fn sanitize_body(body: &str) -> String {
    const SECRET_PATTERNS: &[&str] = &["api_key", "apikey", "secret", "bearer", "sk-"];

    let truncated: String = body.chars().take(MAX_ERROR_BODY_LEN).collect();
    let lower = truncated.to_lowercase();
    if SECRET_PATTERNS.iter().any(|p| lower.contains(p)) {
        return "(response details redacted)".to_string();
    }
    truncated
}

/// Result type for service operations.
pub type LlmResult<T> = std::result::Result<T, LlmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_body_is_truncated() {
        let body = "x".repeat(1000);
        match LlmError::status(500, &body) {
            LlmError::Status { status, body } => {
                assert_eq!(status, 500);
                assert_eq!(body.len(), MAX_ERROR_BODY_LEN);
            }
            other => panic!("expected Status, got {:?}", other),
        }
    }

    #[test]
    fn test_status_body_with_key_is_redacted() {
        let err = LlmError::status(401, "invalid key sk-abc123");
        assert!(err.to_string().contains("redacted"));
        assert!(!err.to_string().contains("sk-abc123"));
    }

    #[test]
    fn test_template_error_display() {
        let err = LlmError::Template {
            name: "SYSTEM_PROMPT".to_string(),
            reason: "status 404".to_string(),
        };
        assert!(err.to_string().contains("SYSTEM_PROMPT"));
        assert!(err.to_string().contains("404"));
    }
}
