//! Error types for the rating service
//!
//! Pattern adapted from the gateway error module: string-carrying variants
//! per collaborator, with `From` conversions for the client libraries.

/// Main error type for rating operations
#[derive(Debug, thiserror::Error)]
pub enum RatingError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("NATS error: {0}")]
    Nats(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Workspace {workspace} model version {found} does not match supported {supported}")]
    VersionMismatch {
        workspace: String,
        found: String,
        supported: String,
    },

    #[error("Calculator for workspace {0} is closing")]
    Closing(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RatingError {
    /// Whether the transport should redeliver the message that caused this error
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Nats(_) | Self::Database(_) | Self::Http(_) | Self::Closing(_) | Self::Internal(_)
        )
    }
}

// Implement From conversions for common error types

impl From<std::io::Error> for RatingError {
    fn from(err: std::io::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for RatingError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(format!("JSON error: {}", err))
    }
}

impl From<bson::ser::Error> for RatingError {
    fn from(err: bson::ser::Error) -> Self {
        Self::Serialization(format!("BSON encode error: {}", err))
    }
}

impl From<bson::de::Error> for RatingError {
    fn from(err: bson::de::Error) -> Self {
        Self::Serialization(format!("BSON decode error: {}", err))
    }
}

impl From<mongodb::error::Error> for RatingError {
    fn from(err: mongodb::error::Error) -> Self {
        Self::Database(err.to_string())
    }
}

impl From<async_nats::Error> for RatingError {
    fn from(err: async_nats::Error) -> Self {
        Self::Nats(err.to_string())
    }
}

impl From<reqwest::Error> for RatingError {
    fn from(err: reqwest::Error) -> Self {
        Self::Http(err.to_string())
    }
}

impl From<jsonwebtoken::errors::Error> for RatingError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        Self::Auth(format!("JWT error: {}", err))
    }
}

/// Result type alias for rating operations
pub type Result<T> = std::result::Result<T, RatingError>;
