//! Categorized service errors and the wire error envelope.
//!
//! Every failure that crosses the tool boundary is one of six stable
//! categories. Tool handlers serialize errors into an [`ErrorEnvelope`] so
//! callers always receive `{code, message, category, details?, timestamp}`.

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

/// Stable error categories returned in every error envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ErrorCategory {
    Auth,
    Param,
    Resource,
    Execution,
    System,
    Security,
}

/// A categorized service error with a stable code.
///
/// The `code` is a short machine-stable identifier (e.g. `INVALID_PARAM`,
/// `EXECUTION_NOT_FOUND`); the message is human/LLM-readable context.
#[derive(Debug, Error)]
#[error("[{code}] {message}")]
pub struct ServiceError {
    pub category: ErrorCategory,
    pub code: &'static str,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl ServiceError {
    pub fn param(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Param, code, message)
    }

    pub fn resource(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Resource, code, message)
    }

    pub fn execution(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Execution, code, message)
    }

    pub fn system(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::System, code, message)
    }

    pub fn security(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Security, code, message)
    }

    fn new(category: ErrorCategory, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            category,
            code,
            message: message.into(),
            details: None,
        }
    }

    /// Attach structured details to the error.
    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Convert into the wire envelope, stamping the current time.
    pub fn envelope(&self) -> ErrorEnvelope {
        ErrorEnvelope {
            code: self.code,
            message: self.message.clone(),
            category: self.category,
            details: self.details.clone(),
            timestamp: Utc::now(),
        }
    }
}

/// The error payload placed in tool responses.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorEnvelope {
    pub code: &'static str,
    pub message: String,
    pub category: ErrorCategory,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

/// Shorthand result type used throughout the core.
pub type Result<T> = std::result::Result<T, ServiceError>;

impl From<std::io::Error> for ServiceError {
    fn from(e: std::io::Error) -> Self {
        ServiceError::system("IO_ERROR", e.to_string())
    }
}
