use thiserror::Error;

#[derive(Error, Debug)]
pub enum StreamError {
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("JSON parsing error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("API error: {code} - {message}")]
    ApiError { code: u16, message: String },

    #[error("Authentication error: {0}")]
    AuthError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Subscription error: {0}")]
    SubscriptionError(String),

    #[error("Configuration error: {0}")]
    ConfigError(#[from] crate::core::config::ConfigError),
}

impl StreamError {
    /// Whether this error was raised by the stream connection or handshake
    /// rather than by local validation.
    pub fn is_connection(&self) -> bool {
        matches!(
            self,
            Self::ConnectionError(_) | Self::HttpError(_) | Self::ApiError { .. } | Self::AuthError(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_classification() {
        assert!(StreamError::ConnectionError("closed".to_string()).is_connection());
        assert!(StreamError::ApiError {
            code: 401,
            message: "unauthorized".to_string()
        }
        .is_connection());
        assert!(!StreamError::ValidationError("empty".to_string()).is_connection());
        assert!(!StreamError::ParseError("bad".to_string()).is_connection());
    }

    #[test]
    fn test_display() {
        let err = StreamError::ApiError {
            code: 500,
            message: "boom".to_string(),
        };
        assert_eq!(err.to_string(), "API error: 500 - boom");
    }
}
