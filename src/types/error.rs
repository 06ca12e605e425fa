//! Error types for Covenant
//!
//! Every protocol error carries a machine-readable kind plus a human
//! message; `status_code()` maps the taxonomy onto HTTP responses.

use hyper::StatusCode;

/// Main error type for consent exchange operations
#[derive(Debug, thiserror::Error)]
pub enum CovenantError {
    /// A referenced Service/Purpose/DUE/Identifier/ConsentExchange does not
    /// exist. The message always names the missing entity.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Malformed or missing caller input (e.g. ENODATATYPES, ETOKENSIZE).
    #[error("Invalid request [{code}]: {message}")]
    InvalidRequest { code: String, message: String },

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// A resume step was invoked on a consent already past that point
    /// (e.g. ECONSENTALREADYVERIFIED).
    #[error("Conflict [{code}]: {message}")]
    Conflict { code: String, message: String },

    /// An outbound POST to a partner endpoint failed. Distinct class so the
    /// caller knows the failure is not local; carries the target URL.
    #[error("Dependency failed calling {url}: {detail}")]
    Dependency { url: String, detail: String },

    /// A signed consent envelope was absent, malformed, or failed
    /// verification. Never treated as valid.
    #[error("Signed consent decode error: {0}")]
    Decode(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CovenantError {
    pub fn invalid(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn conflict(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Conflict {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Convert error to HTTP status code
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::Conflict { .. } => StatusCode::CONFLICT,
            Self::Dependency { .. } => StatusCode::FAILED_DEPENDENCY,
            Self::Decode(_) => StatusCode::BAD_REQUEST,
            Self::Database(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Http(_) => StatusCode::BAD_REQUEST,
            Self::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Machine-readable kind for the JSON error envelope
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "resource-not-found",
            Self::InvalidRequest { .. } => "invalid-request",
            Self::Unauthorized(_) => "unauthorized",
            Self::Forbidden(_) => "forbidden",
            Self::Conflict { .. } => "conflict",
            Self::Dependency { .. } => "dependency-failed",
            Self::Decode(_) => "decode-error",
            Self::Database(_) => "database-error",
            Self::Http(_) => "http-error",
            Self::Config(_) => "config-error",
            Self::Internal(_) => "internal-error",
        }
    }

    /// Optional machine code carried by invalid-request/conflict errors
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::InvalidRequest { code, .. } | Self::Conflict { code, .. } => Some(code),
            _ => None,
        }
    }
}

impl From<std::io::Error> for CovenantError {
    fn from(err: std::io::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for CovenantError {
    fn from(err: serde_json::Error) -> Self {
        Self::Http(format!("JSON error: {}", err))
    }
}

impl From<hyper::Error> for CovenantError {
    fn from(err: hyper::Error) -> Self {
        Self::Internal(format!("HTTP error: {}", err))
    }
}

impl From<mongodb::error::Error> for CovenantError {
    fn from(err: mongodb::error::Error) -> Self {
        Self::Database(err.to_string())
    }
}

/// Result type alias for consent exchange operations
pub type Result<T> = std::result::Result<T, CovenantError>;
