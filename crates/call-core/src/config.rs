//! Call core configuration.
//!
//! Configuration is loaded from environment variables. The optional API
//! token is redacted in Debug output.

use common::secret::SecretString;
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Default time allowed for the signaling socket to report `connected`.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;

/// Default time allowed for the media transport to reach `connected`.
pub const DEFAULT_TRANSPORT_TIMEOUT_MS: u64 = 10_000;

/// Default renegotiation debounce window.
pub const DEFAULT_NEGOTIATION_DEBOUNCE_MS: u64 = 20;

/// Default timeout for a single control-plane HTTP request.
pub const DEFAULT_HTTP_TIMEOUT_MS: u64 = 10_000;

/// Default platform reported when registering a push token.
pub const DEFAULT_DEVICE_PLATFORM: &str = "ios";

/// Call core configuration.
#[derive(Clone)]
pub struct Config {
    /// Control-plane base URL, without a trailing slash.
    pub api_base_url: String,

    /// Signaling connect timeout (default: 10s).
    pub connect_timeout: Duration,

    /// Media transport connect timeout (default: 10s).
    pub transport_timeout: Duration,

    /// Renegotiation debounce window (default: 20ms).
    pub negotiation_debounce: Duration,

    /// Per-request HTTP timeout (default: 10s).
    pub http_timeout: Duration,

    /// Platform sent with push-token registration (default: "ios").
    pub device_platform: String,

    /// Pre-provisioned bearer token, if any.
    pub api_token: Option<SecretString>,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("api_base_url", &self.api_base_url)
            .field("connect_timeout", &self.connect_timeout)
            .field("transport_timeout", &self.transport_timeout)
            .field("negotiation_debounce", &self.negotiation_debounce)
            .field("http_timeout", &self.http_timeout)
            .field("device_platform", &self.device_platform)
            .field(
                "api_token",
                &self.api_token.as_ref().map(|_| "[REDACTED]"),
            )
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl Config {
    /// Configuration with every optional value at its default.
    #[must_use]
    pub fn new(api_base_url: impl Into<String>) -> Self {
        Self {
            api_base_url: api_base_url.into().trim_end_matches('/').to_string(),
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            transport_timeout: Duration::from_millis(DEFAULT_TRANSPORT_TIMEOUT_MS),
            negotiation_debounce: Duration::from_millis(DEFAULT_NEGOTIATION_DEBOUNCE_MS),
            http_timeout: Duration::from_millis(DEFAULT_HTTP_TIMEOUT_MS),
            device_platform: DEFAULT_DEVICE_PLATFORM.to_string(),
            api_token: None,
        }
    }

    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let api_base_url = vars
            .get("CALL_API_BASE_URL")
            .ok_or_else(|| ConfigError::MissingEnvVar("CALL_API_BASE_URL".to_string()))?;

        if !(api_base_url.starts_with("http://") || api_base_url.starts_with("https://")) {
            return Err(ConfigError::InvalidValue(format!(
                "CALL_API_BASE_URL must be an http(s) URL, got '{api_base_url}'"
            )));
        }

        let mut config = Self::new(api_base_url.as_str());

        config.connect_timeout = parse_millis(
            vars,
            "CALL_CONNECT_TIMEOUT_MS",
            DEFAULT_CONNECT_TIMEOUT_MS,
        )?;
        config.transport_timeout = parse_millis(
            vars,
            "CALL_TRANSPORT_TIMEOUT_MS",
            DEFAULT_TRANSPORT_TIMEOUT_MS,
        )?;
        config.negotiation_debounce = parse_millis(
            vars,
            "CALL_NEGOTIATION_DEBOUNCE_MS",
            DEFAULT_NEGOTIATION_DEBOUNCE_MS,
        )?;
        config.http_timeout =
            parse_millis(vars, "CALL_HTTP_TIMEOUT_MS", DEFAULT_HTTP_TIMEOUT_MS)?;

        if let Some(platform) = vars.get("CALL_DEVICE_PLATFORM") {
            config.device_platform.clone_from(platform);
        }

        config.api_token = vars
            .get("CALL_API_TOKEN")
            .filter(|token| !token.is_empty())
            .map(|token| SecretString::from(token.clone()));

        Ok(config)
    }
}

fn parse_millis(
    vars: &HashMap<String, String>,
    name: &str,
    default: u64,
) -> Result<Duration, ConfigError> {
    match vars.get(name) {
        None => Ok(Duration::from_millis(default)),
        Some(raw) => raw.parse::<u64>().map(Duration::from_millis).map_err(|e| {
            ConfigError::InvalidValue(format!("{name} must be milliseconds: {e}"))
        }),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use common::secret::ExposeSecret;

    fn base_vars() -> HashMap<String, String> {
        HashMap::from([(
            "CALL_API_BASE_URL".to_string(),
            "https://api.example.com/".to_string(),
        )])
    }

    #[test]
    fn test_from_vars_success_with_defaults() {
        let config = Config::from_vars(&base_vars()).expect("Config should load successfully");

        assert_eq!(config.api_base_url, "https://api.example.com");
        assert_eq!(
            config.connect_timeout,
            Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS)
        );
        assert_eq!(
            config.transport_timeout,
            Duration::from_millis(DEFAULT_TRANSPORT_TIMEOUT_MS)
        );
        assert_eq!(config.negotiation_debounce, Duration::from_millis(20));
        assert_eq!(config.http_timeout, Duration::from_secs(10));
        assert_eq!(config.device_platform, "ios");
        assert!(config.api_token.is_none());
    }

    #[test]
    fn test_from_vars_success_with_custom_values() {
        let mut vars = base_vars();
        vars.insert("CALL_CONNECT_TIMEOUT_MS".to_string(), "2500".to_string());
        vars.insert("CALL_TRANSPORT_TIMEOUT_MS".to_string(), "4000".to_string());
        vars.insert("CALL_NEGOTIATION_DEBOUNCE_MS".to_string(), "50".to_string());
        vars.insert("CALL_HTTP_TIMEOUT_MS".to_string(), "3000".to_string());
        vars.insert("CALL_DEVICE_PLATFORM".to_string(), "android".to_string());
        vars.insert("CALL_API_TOKEN".to_string(), "token-abc".to_string());

        let config = Config::from_vars(&vars).expect("Config should load successfully");

        assert_eq!(config.connect_timeout, Duration::from_millis(2500));
        assert_eq!(config.transport_timeout, Duration::from_millis(4000));
        assert_eq!(config.negotiation_debounce, Duration::from_millis(50));
        assert_eq!(config.http_timeout, Duration::from_millis(3000));
        assert_eq!(config.device_platform, "android");
        assert_eq!(
            config.api_token.as_ref().map(|t| t.expose_secret().to_string()),
            Some("token-abc".to_string())
        );
    }

    #[test]
    fn test_from_vars_missing_base_url() {
        let result = Config::from_vars(&HashMap::new());
        assert!(matches!(result, Err(ConfigError::MissingEnvVar(v)) if v == "CALL_API_BASE_URL"));
    }

    #[test]
    fn test_from_vars_rejects_non_http_base_url() {
        let mut vars = base_vars();
        vars.insert("CALL_API_BASE_URL".to_string(), "ftp://nope".to_string());

        let result = Config::from_vars(&vars);
        assert!(matches!(result, Err(ConfigError::InvalidValue(_))));
    }

    #[test]
    fn test_from_vars_rejects_bad_timeout() {
        let mut vars = base_vars();
        vars.insert("CALL_CONNECT_TIMEOUT_MS".to_string(), "soon".to_string());

        let result = Config::from_vars(&vars);
        assert!(
            matches!(result, Err(ConfigError::InvalidValue(msg)) if msg.contains("CALL_CONNECT_TIMEOUT_MS"))
        );
    }

    #[test]
    fn test_debug_redacts_api_token() {
        let mut vars = base_vars();
        vars.insert("CALL_API_TOKEN".to_string(), "super-secret-token".to_string());
        let config = Config::from_vars(&vars).expect("Config should load successfully");

        let debug_output = format!("{config:?}");

        assert!(debug_output.contains("[REDACTED]"));
        assert!(!debug_output.contains("super-secret-token"));
    }
}
