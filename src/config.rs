use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use smartmarks_core::sync::DEFAULT_REQUEST_TIMEOUT;
use smartmarks_core::{HostedConfig, SyncOptions};

/// Source of a configuration value
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigSource {
    Default,
    File,
    Environment,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigSource::Default => write!(f, "default"),
            ConfigSource::File => write!(f, "file"),
            ConfigSource::Environment => write!(f, "environment"),
        }
    }
}

/// A configuration value with its source
#[derive(Debug, Clone, Serialize)]
pub struct ConfigValue<T> {
    pub value: T,
    pub source: ConfigSource,
}

impl<T> ConfigValue<T> {
    pub fn new(value: T, source: ConfigSource) -> Self {
        Self { value, source }
    }
}

/// Application configuration with source tracking
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    /// Hosted project URL (e.g., "https://abc.example.co")
    pub server_url: ConfigValue<Option<String>>,
    /// Public API key for the project
    pub anon_key: ConfigValue<Option<String>>,
    /// Access token of the signed-in user
    pub access_token: ConfigValue<Option<String>>,
    /// Id of the signed-in user; bookmarks are scoped to it
    pub user_id: ConfigValue<Option<String>>,
    /// Upper bound for each request to the hosted service
    pub request_timeout_secs: ConfigValue<u64>,
    /// Config file path used (if any)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_file: Option<PathBuf>,
}

/// Internal struct for deserializing config file
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct ConfigFile {
    server_url: Option<String>,
    anon_key: Option<String>,
    access_token: Option<String>,
    user_id: Option<String>,
    request_timeout_secs: Option<u64>,
}

impl Config {
    /// Load configuration with priority: env vars > config file > defaults
    pub fn load(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let mut server_url = ConfigValue::new(None, ConfigSource::Default);
        let mut anon_key = ConfigValue::new(None, ConfigSource::Default);
        let mut access_token = ConfigValue::new(None, ConfigSource::Default);
        let mut user_id = ConfigValue::new(None, ConfigSource::Default);
        let mut request_timeout_secs =
            ConfigValue::new(DEFAULT_REQUEST_TIMEOUT.as_secs(), ConfigSource::Default);
        let mut config_file = None;

        // Try to load from config file
        let path = config_path.unwrap_or_else(Self::default_config_path);
        if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadError(path.clone(), e))?;
            // A file holding only comments is an empty document, not a mapping.
            let file_config: ConfigFile = if is_blank_yaml(&contents) {
                ConfigFile::default()
            } else {
                serde_yaml::from_str(&contents)
                    .map_err(|e| ConfigError::ParseError(path.clone(), e))?
            };

            config_file = Some(path.clone());

            if let Some(url) = file_config.server_url {
                server_url = ConfigValue::new(Some(url), ConfigSource::File);
            }
            if let Some(key) = file_config.anon_key {
                anon_key = ConfigValue::new(Some(key), ConfigSource::File);
            }
            if let Some(token) = file_config.access_token {
                access_token = ConfigValue::new(Some(token), ConfigSource::File);
            }
            if let Some(user) = file_config.user_id {
                user_id = ConfigValue::new(Some(user), ConfigSource::File);
            }
            if let Some(secs) = file_config.request_timeout_secs {
                request_timeout_secs = ConfigValue::new(secs, ConfigSource::File);
            }
        }

        // Apply environment variable overrides
        if let Ok(url) = std::env::var("SMARTMARKS_URL") {
            server_url = ConfigValue::new(Some(url), ConfigSource::Environment);
        }
        if let Ok(key) = std::env::var("SMARTMARKS_ANON_KEY") {
            anon_key = ConfigValue::new(Some(key), ConfigSource::Environment);
        }
        if let Ok(token) = std::env::var("SMARTMARKS_ACCESS_TOKEN") {
            access_token = ConfigValue::new(Some(token), ConfigSource::Environment);
        }
        if let Ok(user) = std::env::var("SMARTMARKS_USER_ID") {
            user_id = ConfigValue::new(Some(user), ConfigSource::Environment);
        }
        if let Ok(secs) = std::env::var("SMARTMARKS_REQUEST_TIMEOUT_SECS") {
            let secs = secs
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidValue("SMARTMARKS_REQUEST_TIMEOUT_SECS", secs))?;
            request_timeout_secs = ConfigValue::new(secs, ConfigSource::Environment);
        }

        Ok(Self {
            server_url,
            anon_key,
            access_token,
            user_id,
            request_timeout_secs,
            config_file,
        })
    }

    /// Connection settings for the hosted store. Fails naming the first
    /// missing setting.
    pub fn hosted(&self) -> Result<HostedConfig, ConfigError> {
        Ok(HostedConfig {
            url: required(&self.server_url, "server_url", "SMARTMARKS_URL")?,
            anon_key: required(&self.anon_key, "anon_key", "SMARTMARKS_ANON_KEY")?,
            access_token: required(&self.access_token, "access_token", "SMARTMARKS_ACCESS_TOKEN")?,
        })
    }

    pub fn owner_id(&self) -> Result<String, ConfigError> {
        required(&self.user_id, "user_id", "SMARTMARKS_USER_ID")
    }

    pub fn sync_options(&self) -> SyncOptions {
        SyncOptions {
            request_timeout: Duration::from_secs(self.request_timeout_secs.value.max(1)),
        }
    }

    /// Copy safe to print: keys and tokens are cut down to their last four
    /// characters.
    pub fn redacted(&self) -> Self {
        let mut config = self.clone();
        config.anon_key.value = config.anon_key.value.as_deref().map(redact);
        config.access_token.value = config.access_token.value.as_deref().map(redact);
        config
    }

    /// Default config directory (platform-specific):
    /// - Linux: ~/.config/smartmarks/
    /// - macOS: ~/Library/Application Support/smartmarks/
    /// - Windows: %APPDATA%/smartmarks/
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("smartmarks")
    }

    /// Default config file path (platform-specific config dir + config.yaml)
    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join("config.yaml")
    }
}

fn required(
    value: &ConfigValue<Option<String>>,
    name: &'static str,
    env_var: &'static str,
) -> Result<String, ConfigError> {
    value
        .value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or(ConfigError::Missing(name, env_var))
}

fn is_blank_yaml(contents: &str) -> bool {
    contents.lines().all(|line| {
        let line = line.trim();
        line.is_empty() || line.starts_with('#')
    })
}

fn redact(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= 8 {
        return "****".to_string();
    }
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("****{}", tail)
}

#[derive(Debug)]
pub enum ConfigError {
    ReadError(PathBuf, std::io::Error),
    ParseError(PathBuf, serde_yaml::Error),
    InvalidValue(&'static str, String),
    Missing(&'static str, &'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::ReadError(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::InvalidValue(name, value) => {
                write!(f, "Invalid value for {}: '{}'", name, value)
            }
            ConfigError::Missing(name, env_var) => write!(
                f,
                "'{}' is not configured. Set it in the config file or via {}",
                name, env_var
            ),
        }
    }
}

impl std::error::Error for ConfigError {}
