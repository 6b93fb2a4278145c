use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::env;
use std::time::Duration;

pub const PRODUCTION_BASE_URL: &str = "https://api.tradier.com/v1";
pub const SANDBOX_BASE_URL: &str = "https://sandbox.tradier.com/v1";

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub access_token: Secret<String>,
    pub sandbox: bool,
    pub base_url: Option<String>,
    pub timeout_seconds: u64,
}

// Custom Serialize implementation - never expose the token in serialization
impl Serialize for ClientConfig {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        use serde::ser::SerializeStruct;
        let mut state = serializer.serialize_struct("ClientConfig", 4)?;
        state.serialize_field("access_token", "[REDACTED]")?;
        state.serialize_field("sandbox", &self.sandbox)?;
        state.serialize_field("base_url", &self.base_url)?;
        state.serialize_field("timeout_seconds", &self.timeout_seconds)?;
        state.end()
    }
}

impl<'de> Deserialize<'de> for ClientConfig {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct ClientConfigHelper {
            access_token: String,
            #[serde(default)]
            sandbox: bool,
            base_url: Option<String>,
            #[serde(default = "default_timeout_seconds")]
            timeout_seconds: u64,
        }

        let helper = ClientConfigHelper::deserialize(deserializer)?;
        Ok(Self {
            access_token: Secret::new(helper.access_token),
            sandbox: helper.sandbox,
            base_url: helper.base_url,
            timeout_seconds: helper.timeout_seconds,
        })
    }
}

const fn default_timeout_seconds() -> u64 {
    30
}

impl ClientConfig {
    /// Create a new configuration with an access token
    #[must_use]
    pub fn new(access_token: String) -> Self {
        Self {
            access_token: Secret::new(access_token),
            sandbox: false,
            base_url: None,
            timeout_seconds: default_timeout_seconds(),
        }
    }

    /// Create configuration from environment variables
    ///
    /// Expected environment variables:
    /// - `{PREFIX}_ACCESS_TOKEN` (e.g., `TRADIER_ACCESS_TOKEN`)
    /// - `{PREFIX}_SANDBOX` (optional, defaults to false)
    /// - `{PREFIX}_BASE_URL` (optional)
    /// - `{PREFIX}_TIMEOUT` (optional, seconds)
    pub fn from_env(prefix: &str) -> Result<Self, ConfigError> {
        let prefix = prefix.to_uppercase();
        let token_var = format!("{}_ACCESS_TOKEN", prefix);
        let sandbox_var = format!("{}_SANDBOX", prefix);
        let base_url_var = format!("{}_BASE_URL", prefix);
        let timeout_var = format!("{}_TIMEOUT", prefix);

        let access_token =
            env::var(&token_var).map_err(|_| ConfigError::MissingEnvironmentVariable(token_var))?;
        if access_token.trim().is_empty() {
            return Err(ConfigError::InvalidConfiguration(
                "access token is empty".to_string(),
            ));
        }

        let sandbox = env::var(&sandbox_var)
            .unwrap_or_else(|_| "false".to_string())
            .parse::<bool>()
            .unwrap_or(false);

        let timeout_seconds = match env::var(&timeout_var) {
            Ok(raw) => raw.parse::<u64>().map_err(|e| {
                ConfigError::InvalidConfiguration(format!("{} is not a number: {}", timeout_var, e))
            })?,
            Err(_) => default_timeout_seconds(),
        };

        Ok(Self {
            access_token: Secret::new(access_token),
            sandbox,
            base_url: env::var(&base_url_var).ok(),
            timeout_seconds,
        })
    }

    /// Create configuration from a `.env` file and environment variables.
    ///
    /// A missing file is not an error; system environment variables are used.
    ///
    /// **Security Warning**: Never commit .env files to version control!
    #[cfg(feature = "env-file")]
    pub fn from_env_file(prefix: &str) -> Result<Self, ConfigError> {
        Self::from_env_file_with_path(prefix, ".env")
    }

    /// Create configuration from a specific `.env` file path
    #[cfg(feature = "env-file")]
    pub fn from_env_file_with_path(prefix: &str, env_file_path: &str) -> Result<Self, ConfigError> {
        match dotenv::from_path(env_file_path) {
            Ok(()) => {}
            Err(dotenv::Error::Io(io_err)) if io_err.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(ConfigError::InvalidConfiguration(format!(
                    "Failed to load .env file '{}': {}",
                    env_file_path, e
                )));
            }
        }

        Self::from_env(prefix)
    }

    /// Use the sandbox environment
    #[must_use]
    pub const fn sandbox(mut self, sandbox: bool) -> Self {
        self.sandbox = sandbox;
        self
    }

    /// Set custom base URL
    #[must_use]
    pub fn base_url(mut self, base_url: String) -> Self {
        self.base_url = Some(base_url);
        self
    }

    #[must_use]
    pub const fn timeout_seconds(mut self, timeout_seconds: u64) -> Self {
        self.timeout_seconds = timeout_seconds;
        self
    }

    /// Base URL the handshake requests are issued against
    pub fn api_base_url(&self) -> &str {
        match self.base_url.as_deref() {
            Some(url) => url,
            None if self.sandbox => SANDBOX_BASE_URL,
            None => PRODUCTION_BASE_URL,
        }
    }

    pub fn has_credentials(&self) -> bool {
        !self.access_token.expose_secret().is_empty()
    }

    /// Get access token (use carefully - exposes secret)
    pub fn access_token(&self) -> &str {
        self.access_token.expose_secret()
    }
}

/// Streaming behaviour knobs. Replaced wholesale through
/// `StreamingService::set_config`; the background task reads a fresh copy
/// whenever it needs one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    pub auto_reconnect: bool,
    pub reconnect_delay_ms: u64,
    pub max_reconnect_attempts: u32,
    pub heartbeat_interval_ms: u64,
    pub filter_duplicates: bool,
    /// Number of recent event keys remembered per symbol for duplicate suppression
    pub dedup_capacity: usize,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            reconnect_delay_ms: 5_000,
            max_reconnect_attempts: 10,
            heartbeat_interval_ms: 30_000,
            filter_duplicates: true,
            dedup_capacity: 128,
        }
    }
}

impl StreamingConfig {
    pub const fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    /// Heartbeat period; a zero interval is clamped to one millisecond.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }

    #[must_use]
    pub const fn with_auto_reconnect(mut self, auto_reconnect: bool) -> Self {
        self.auto_reconnect = auto_reconnect;
        self
    }

    #[must_use]
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self
    }

    #[must_use]
    pub const fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    #[must_use]
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self
    }

    #[must_use]
    pub const fn with_filter_duplicates(mut self, filter_duplicates: bool) -> Self {
        self.filter_duplicates = filter_duplicates;
        self
    }

    #[must_use]
    pub const fn with_dedup_capacity(mut self, capacity: usize) -> Self {
        self.dedup_capacity = capacity;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingEnvironmentVariable(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
}
