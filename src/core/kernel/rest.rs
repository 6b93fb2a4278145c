use crate::core::errors::StreamError;
use crate::core::kernel::signer::Signer;
use async_trait::async_trait;
use reqwest::{Client, Method, Response};
use serde_json::Value;
use std::sync::Arc;
use tracing::{instrument, trace};

/// Authenticated request issuer used for the session handshakes.
///
/// Only the POST surface the streaming engine needs is modeled here; the
/// snapshot, account and trading endpoints are served elsewhere.
#[async_trait]
pub trait RestClient: Send + Sync {
    /// Make a POST request with form-encoded parameters
    ///
    /// # Arguments
    /// * `endpoint` - The API endpoint path
    /// * `form` - Form parameters as key-value pairs
    /// * `authenticated` - Whether to sign the request
    ///
    /// # Returns
    /// The response body as a JSON value
    async fn post(
        &self,
        endpoint: &str,
        form: &[(&str, &str)],
        authenticated: bool,
    ) -> Result<Value, StreamError>;
}

/// Configuration for the REST client
#[derive(Clone, Debug)]
pub struct RestClientConfig {
    /// Base URL for the API
    pub base_url: String,
    /// Request timeout in seconds
    pub timeout_seconds: u64,
    /// User agent string to include in requests
    pub user_agent: String,
}

impl RestClientConfig {
    pub fn new(base_url: String) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout_seconds: 30,
            user_agent: format!("tradier-stream/{}", env!("CARGO_PKG_VERSION")),
        }
    }

    /// Set the request timeout
    pub fn with_timeout(mut self, timeout_seconds: u64) -> Self {
        self.timeout_seconds = timeout_seconds;
        self
    }

    pub fn with_user_agent(mut self, user_agent: String) -> Self {
        self.user_agent = user_agent;
        self
    }
}

/// Builder for creating REST client instances
pub struct RestClientBuilder {
    config: RestClientConfig,
    signer: Option<Arc<dyn Signer>>,
}

impl RestClientBuilder {
    pub fn new(config: RestClientConfig) -> Self {
        Self {
            config,
            signer: None,
        }
    }

    /// Set the signer for authenticated requests
    pub fn with_signer(mut self, signer: Arc<dyn Signer>) -> Self {
        self.signer = Some(signer);
        self
    }

    pub fn build(self) -> Result<ReqwestRest, StreamError> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(self.config.timeout_seconds))
            .user_agent(&self.config.user_agent)
            .build()?;

        Ok(ReqwestRest {
            client,
            config: self.config,
            signer: self.signer,
        })
    }
}

/// Implementation of `RestClient` using reqwest
#[derive(Clone)]
pub struct ReqwestRest {
    client: Client,
    config: RestClientConfig,
    signer: Option<Arc<dyn Signer>>,
}

impl std::fmt::Debug for ReqwestRest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReqwestRest")
            .field("config", &self.config)
            .field("has_signer", &self.signer.is_some())
            .finish_non_exhaustive()
    }
}

impl ReqwestRest {
    fn build_url(&self, endpoint: &str) -> String {
        format!("{}{}", self.config.base_url, endpoint)
    }

    #[instrument(skip(self, response), fields(status = %response.status()))]
    async fn handle_response(&self, response: Response) -> Result<Value, StreamError> {
        let status = response.status();
        let response_text = response.text().await.map_err(|e| {
            StreamError::ConnectionError(format!("Failed to read response body: {}", e))
        })?;

        trace!("Response body: {}", response_text);

        if status.is_success() {
            Ok(serde_json::from_str(&response_text)?)
        } else if status.as_u16() == 401 || status.as_u16() == 403 {
            Err(StreamError::AuthError(format!(
                "{} rejected the access token: {}",
                status, response_text
            )))
        } else {
            Err(StreamError::ApiError {
                code: status.as_u16(),
                message: response_text,
            })
        }
    }

    #[instrument(skip(self, form), fields(method = %method, endpoint = %endpoint))]
    async fn make_request(
        &self,
        method: Method,
        endpoint: &str,
        form: &[(&str, &str)],
        authenticated: bool,
    ) -> Result<Value, StreamError> {
        let url = self.build_url(endpoint);
        let mut request = self
            .client
            .request(method.clone(), &url)
            .header("Accept", "application/json");

        if authenticated {
            let signer = self.signer.as_ref().ok_or_else(|| {
                StreamError::AuthError(
                    "Authentication required but no signer provided".to_string(),
                )
            })?;
            for (key, value) in signer.sign_request(method.as_str(), endpoint)? {
                request = request.header(&key, &value);
            }
        }

        if !form.is_empty() {
            request = request.form(form);
        }

        let response = request
            .send()
            .await
            .map_err(|e| StreamError::ConnectionError(format!("Request failed: {}", e)))?;

        self.handle_response(response).await
    }
}

#[async_trait]
impl RestClient for ReqwestRest {
    #[instrument(skip(self, form), fields(endpoint = %endpoint, param_count = form.len()))]
    async fn post(
        &self,
        endpoint: &str,
        form: &[(&str, &str)],
        authenticated: bool,
    ) -> Result<Value, StreamError> {
        self.make_request(Method::POST, endpoint, form, authenticated)
            .await
    }
}
