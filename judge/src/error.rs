use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::SubmissionId;

/// Engine-level failures surfaced to callers instead of a verdict
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unsupported language: {0}")]
    UnsupportedLanguage(String),
    #[error("malformed request: {0}")]
    MalformedRequest(String),
    #[error("judge queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },
    #[error("judge engine is shutting down")]
    ShuttingDown,
    #[error("unknown submission {0}")]
    UnknownSubmission(SubmissionId),
}

impl EngineError {
    /// Stable error code for the outward-facing contract
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::UnsupportedLanguage(_) => "unsupported_language",
            EngineError::MalformedRequest(_) => "malformed_request",
            EngineError::QueueFull { .. } => "queue_full",
            EngineError::ShuttingDown => "shutting_down",
            EngineError::UnknownSubmission(_) => "unknown_submission",
        }
    }

    /// Whether the caller may retry the same request later
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::QueueFull { .. })
    }
}

/// Wire shape of an engine error
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    pub retryable: bool,
}

impl From<&EngineError> for ErrorBody {
    fn from(err: &EngineError) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
            retryable: err.is_retryable(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(
            EngineError::UnsupportedLanguage("cobol".into()).code(),
            "unsupported_language"
        );
        assert_eq!(EngineError::QueueFull { capacity: 1 }.code(), "queue_full");
        assert!(EngineError::QueueFull { capacity: 1 }.is_retryable());
        assert!(!EngineError::ShuttingDown.is_retryable());
    }

    #[test]
    fn test_error_body() {
        let body = ErrorBody::from(&EngineError::QueueFull { capacity: 8 });
        assert_eq!(body.code, "queue_full");
        assert!(body.retryable);
        assert_eq!(body.message, "judge queue is full (capacity 8)");
    }
}
