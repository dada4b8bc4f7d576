use thiserror::Error;

/// Application-wide error type, consolidating all possible errors into a single enum.
///
/// Every variant renders a message that can be shown to the user as-is.
#[derive(Debug, Clone, Error)]
pub enum AppError {
    /// Represents configuration errors (missing API key, malformed settings, no model selected).
    #[error("Configuration error: {0}")]
    Config(String),

    /// Represents data validation errors (e.g., invalid extraction options).
    #[error("Validation error: {0}")]
    Validation(String),

    /// The requested model name is not present in the registry.
    #[error("Model '{0}' is not registered")]
    UnknownModel(String),

    /// The requested model is registered but currently marked unavailable.
    #[error("Model '{0}' is not available, test its connection or enable it first")]
    ModelUnavailable(String),

    /// Represents connectivity failures (DNS, connection reset, TLS).
    #[error("Network error: {0}")]
    Transport(String),

    /// Represents errors from operations that did not complete in time.
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// A provider rejected the request; `message` is already normalized.
    #[error("{provider} error: {message}")]
    Provider { provider: String, message: String },

    /// The provider answered but the payload was empty or malformed.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Represents unexpected internal errors that indicate a bug.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn provider(provider: &str, message: impl Into<String>) -> Self {
        AppError::Provider {
            provider: provider.to_string(),
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::InvalidResponse(format!("JSON error: {}", err))
    }
}

impl From<url::ParseError> for AppError {
    fn from(err: url::ParseError) -> Self {
        AppError::Config(format!("URL parse error: {}", err))
    }
}

impl From<validator::ValidationErrors> for AppError {
    fn from(err: validator::ValidationErrors) -> Self {
        AppError::Validation(format!("Validation errors: {}", err))
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            AppError::Timeout(format!("HTTP request timed out: {}", err))
        } else if err.is_decode() {
            AppError::InvalidResponse(format!("failed to decode response: {}", err))
        } else {
            AppError::Transport(format!("HTTP error: {}", err))
        }
    }
}
