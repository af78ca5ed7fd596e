use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;

/// Immutable settings for one [`ObjectClient`](crate::om::ObjectClient)
#[derive(Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Server base URL; endpoint names are appended as path segments
    pub server_url: String,
    /// Shared secret used to sign every request
    pub secret_key: Vec<u8>,
    /// Timeout for one request/response round trip
    pub request_timeout: Duration,
    /// TCP connect timeout
    pub connect_timeout: Duration,
    /// Skip TLS certificate verification
    pub insecure_tls: bool,
}

impl ClientConfig {
    /// Create a config with default timeouts
    pub fn new(server_url: impl Into<String>, secret_key: impl Into<Vec<u8>>) -> Self {
        Self {
            server_url: server_url.into(),
            secret_key: secret_key.into(),
            request_timeout: Duration::from_secs(default_request_timeout()),
            connect_timeout: Duration::from_secs(default_connect_timeout()),
            insecure_tls: false,
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_insecure_tls(mut self, insecure: bool) -> Self {
        self.insecure_tls = insecure;
        self
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("server_url", &self.server_url)
            .field("secret_key", &"<redacted>")
            .field("request_timeout", &self.request_timeout)
            .field("connect_timeout", &self.connect_timeout)
            .field("insecure_tls", &self.insecure_tls)
            .finish()
    }
}

/// Object manager server profile
#[derive(Clone, Serialize, Deserialize)]
pub struct Profile {
    /// Server base URL
    pub server_url: String,

    /// Shared secret key
    pub secret_key: String,
}

impl fmt::Debug for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Profile")
            .field("server_url", &self.server_url)
            .field("secret_key", &"<redacted>")
            .finish()
    }
}

/// HTTP transport settings shared by all profiles
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,

    /// Connect timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,

    /// Disable TLS certificate verification
    #[serde(default)]
    pub insecure_tls: bool,
}

fn default_request_timeout() -> u64 {
    300
}

fn default_connect_timeout() -> u64 {
    10
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            request_timeout: default_request_timeout(),
            connect_timeout: default_connect_timeout(),
            insecure_tls: false,
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Named server profiles
    #[serde(default)]
    pub profiles: HashMap<String, Profile>,

    /// Profile used when none is named
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_profile: Option<String>,

    /// Transport settings
    #[serde(default)]
    pub http: HttpConfig,
}

impl Config {
    /// Create a new empty configuration
    pub fn new() -> Self {
        Self {
            profiles: HashMap::new(),
            default_profile: None,
            http: HttpConfig::default(),
        }
    }

    /// Get a profile by name, or the default profile if not specified
    pub fn get_profile(&self, name: Option<&str>) -> Option<&Profile> {
        if let Some(name) = name {
            self.profiles.get(name)
        } else if let Some(default) = &self.default_profile {
            self.profiles.get(default)
        } else {
            self.profiles.values().next()
        }
    }

    /// Build the client settings for a profile
    pub fn client_config(&self, name: Option<&str>) -> Result<ClientConfig> {
        let profile = self
            .get_profile(name)
            .ok_or_else(|| anyhow::anyhow!("No profile found in configuration"))?;

        Ok(ClientConfig::new(profile.server_url.clone(), profile.secret_key.as_bytes())
            .with_request_timeout(Duration::from_secs(self.http.request_timeout))
            .with_connect_timeout(Duration::from_secs(self.http.connect_timeout))
            .with_insecure_tls(self.http.insecure_tls))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

/// Load configuration from a YAML file
pub fn load_from_yaml<P: AsRef<Path>>(path: P) -> Result<Config> {
    let content = std::fs::read_to_string(path.as_ref())
        .context(format!("Failed to read config file: {:?}", path.as_ref()))?;

    let config: Config =
        serde_yaml::from_str(&content).context("Failed to parse YAML configuration")?;

    Ok(config)
}

/// Load configuration from environment variables
///
/// - OM_SERVER_URL (required)
/// - OM_SECRET_KEY (required)
/// - OM_REQUEST_TIMEOUT (optional, seconds)
/// - OM_CONNECT_TIMEOUT (optional, seconds)
/// - OM_INSECURE_TLS (optional, `true` or `1`)
pub fn load_from_env() -> Result<Config> {
    // Try to load .env file if it exists (don't fail if it doesn't)
    let _ = dotenvy::dotenv();

    config_from_env_vars()
}

/// Build the configuration from the process environment only, without
/// consulting a `.env` file
pub fn config_from_env_vars() -> Result<Config> {
    let mut config = Config::new();

    let server_url =
        std::env::var("OM_SERVER_URL").context("OM_SERVER_URL environment variable not set")?;
    if server_url.trim().is_empty() {
        anyhow::bail!("OM_SERVER_URL is empty");
    }

    let secret_key =
        std::env::var("OM_SECRET_KEY").context("OM_SECRET_KEY environment variable not set")?;

    config.profiles.insert(
        "default".to_string(),
        Profile {
            server_url: server_url.trim().to_string(),
            secret_key,
        },
    );
    config.default_profile = Some("default".to_string());

    if let Ok(timeout) = std::env::var("OM_REQUEST_TIMEOUT") {
        if let Ok(val) = timeout.parse() {
            config.http.request_timeout = val;
        }
    }

    if let Ok(timeout) = std::env::var("OM_CONNECT_TIMEOUT") {
        if let Ok(val) = timeout.parse() {
            config.http.connect_timeout = val;
        }
    }

    if let Ok(insecure) = std::env::var("OM_INSECURE_TLS") {
        config.http.insecure_tls = insecure == "true" || insecure == "1";
    }

    Ok(config)
}

/// Load configuration from file or environment
///
/// Tries the YAML file first when a path is given, otherwise falls back to
/// environment variables, which define a single profile named `default`.
///
/// # Arguments
/// * `config_path` - Optional path to YAML config file
/// * `profile_name` - Optional profile name to use
pub fn load_config(config_path: Option<&str>, profile_name: Option<&str>) -> Result<Config> {
    let (mut config, source) = match config_path {
        Some(path) => (load_from_yaml(path)?, "config file"),
        None => (load_from_env()?, "environment"),
    };

    // If a specific profile is requested, make it the default
    if let Some(name) = profile_name {
        if !config.profiles.contains_key(name) {
            anyhow::bail!("Profile '{}' not found in {}", name, source);
        }
        config.default_profile = Some(name.to_string());
    }

    Ok(config)
}
