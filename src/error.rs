use crate::vault::crypto::CryptoError;
use thiserror::Error;

/// Application-wide error types
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("OAuth error: {0}")]
    OAuth(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Credential decryption failed: {0}")]
    Decryption(#[from] CryptoError),

    #[error("Authentication required")]
    AuthRequired,

    #[error("Discord credentials expired, please sign in again")]
    AuthExpired,

    #[error("Rate limit exceeded")]
    RateLimited { retry_after: Option<f64> },

    #[error("Admission queue full")]
    QueueFull { wait_ms: Option<u64> },

    #[error("Timed out waiting for an admission slot")]
    QueueTimeout,

    #[error("Discord returned {status}: {message}")]
    Provider { status: u16, message: String },

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn oauth<S: Into<String>>(msg: S) -> Self {
        Self::OAuth(msg.into())
    }

    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }

    /// Seconds the caller should back off, when known.
    pub fn retry_after(&self) -> Option<f64> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            Self::QueueFull { wait_ms } => wait_ms.map(|ms| ms as f64 / 1000.0),
            _ => None,
        }
    }

    /// Whether the caller should treat this as backpressure.
    pub fn is_rate_limit(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::QueueFull { .. } | Self::QueueTimeout
        )
    }
}

/// Result type alias using AppError
pub type AppResult<T> = Result<T, AppError>;

/// Convert AppError to HTTP status codes for web responses
impl AppError {
    pub fn status_code(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Self::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Http(_) => StatusCode::BAD_GATEWAY,
            Self::OAuth(_) => StatusCode::BAD_GATEWAY,
            Self::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Decryption(_) => StatusCode::UNAUTHORIZED,
            Self::AuthRequired => StatusCode::UNAUTHORIZED,
            Self::AuthExpired => StatusCode::UNAUTHORIZED,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::QueueFull { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::QueueTimeout => StatusCode::TOO_MANY_REQUESTS,
            Self::Provider { .. } => StatusCode::BAD_GATEWAY,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl axum::response::IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        let mut body = serde_json::json!({
            "error": self.to_string(),
            "code": status.as_u16()
        });
        if let Some(retry_after) = self.retry_after() {
            body["retry_after"] = serde_json::json!(retry_after);
        }
        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;

    #[test]
    fn test_backpressure_maps_to_429() {
        for err in [
            AppError::RateLimited { retry_after: Some(2.5) },
            AppError::QueueFull { wait_ms: Some(1500) },
            AppError::QueueTimeout,
        ] {
            assert!(err.is_rate_limit());
            assert_eq!(err.status_code(), StatusCode::TOO_MANY_REQUESTS);
        }
    }

    #[test]
    fn test_retry_after_hint() {
        assert_eq!(AppError::QueueFull { wait_ms: Some(1500) }.retry_after(), Some(1.5));
        assert_eq!(AppError::AuthExpired.retry_after(), None);
    }
}
