use crate::core::config::ClientConfig;
use crate::core::errors::StreamError;
use secrecy::{ExposeSecret, Secret};
use std::collections::HashMap;
use std::sync::Arc;

/// Result type for signing operations: headers to attach to the request
pub type SignatureResult = Result<HashMap<String, String>, StreamError>;

/// Source of OAuth bearer tokens.
///
/// Token acquisition and refresh live outside this crate; the streaming
/// engine only asks for the current token whenever it issues a handshake.
pub trait TokenProvider: Send + Sync {
    fn access_token(&self) -> Result<Secret<String>, StreamError>;
}

/// A token fixed at construction time
pub struct StaticTokenProvider {
    token: Secret<String>,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: Secret::new(token.into()),
        }
    }
}

impl TokenProvider for StaticTokenProvider {
    fn access_token(&self) -> Result<Secret<String>, StreamError> {
        if self.token.expose_secret().is_empty() {
            return Err(StreamError::AuthError("access token is empty".to_string()));
        }
        Ok(self.token.clone())
    }
}

impl TokenProvider for ClientConfig {
    fn access_token(&self) -> Result<Secret<String>, StreamError> {
        if !self.has_credentials() {
            return Err(StreamError::AuthError(
                "no access token configured".to_string(),
            ));
        }
        Ok(self.access_token.clone())
    }
}

/// Signer trait for request authentication
pub trait Signer: Send + Sync {
    /// Produce the headers that authenticate a request
    ///
    /// # Arguments
    /// * `method` - HTTP method (GET, POST, etc.)
    /// * `endpoint` - API endpoint path
    fn sign_request(&self, method: &str, endpoint: &str) -> SignatureResult;
}

/// Attaches `Authorization: Bearer <token>` from a [`TokenProvider`]
pub struct BearerSigner {
    provider: Arc<dyn TokenProvider>,
}

impl BearerSigner {
    pub fn new(provider: Arc<dyn TokenProvider>) -> Self {
        Self { provider }
    }
}

impl Signer for BearerSigner {
    fn sign_request(&self, _method: &str, _endpoint: &str) -> SignatureResult {
        let token = self.provider.access_token()?;
        let mut headers = HashMap::new();
        headers.insert(
            "Authorization".to_string(),
            format!("Bearer {}", token.expose_secret()),
        );
        Ok(headers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bearer_header() {
        let signer = BearerSigner::new(Arc::new(StaticTokenProvider::new("abc123")));
        let headers = signer
            .sign_request("POST", "/markets/events/session")
            .unwrap();
        assert_eq!(headers.get("Authorization").unwrap(), "Bearer abc123");
    }

    #[test]
    fn test_empty_token_rejected() {
        let signer = BearerSigner::new(Arc::new(StaticTokenProvider::new("")));
        let result = signer.sign_request("POST", "/markets/events/session");
        assert!(matches!(result, Err(StreamError::AuthError(_))));
    }

    #[test]
    fn test_client_config_provides_token() {
        let config = ClientConfig::new("from-config".to_string());
        assert_eq!(config.access_token(), "from-config");
        let provided = TokenProvider::access_token(&config).unwrap();
        assert_eq!(provided.expose_secret(), "from-config");
    }
}
