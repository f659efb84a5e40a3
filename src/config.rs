//! Client configuration
//!
//! Settings are resolved once, at construction time, from three layers:
//! built-in defaults, an optional source (a JSON configuration file or the
//! settings of a local server instance), and overrides supplied by the
//! running process. The result is an immutable
//! [`ClientConfig`] shared by every component of the client.

use std::convert::Infallible;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{ClientError, Result};

/// Placeholder server URL; a configuration still using it is rejected
pub const PLACEHOLDER_SERVER_URL: &str = "https://mediaserver";

/// Default chunk size for uploads and downloads (25 MiB)
pub const DEFAULT_CHUNK_SIZE: usize = 26_214_400;

static SITE_URL_SETTING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"SITE_URL\s*=\s*['|"]{1}(.*)['|"]{1}\n"#).expect("site url pattern is valid")
});
static MASTER_API_KEY_SETTING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"MASTER_API_KEY\s*=\s*['|"]{1}(.*)['|"]{1}\n"#).expect("api key pattern is valid")
});

/// Where the file layer of the configuration comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    /// JSON configuration file
    File(PathBuf),
    /// Settings of the server instance installed for a local unix user
    UnixUser(String),
}

impl FromStr for ConfigSource {
    type Err = Infallible;

    /// `unix:<user>` selects a unix user, anything else is a file path
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s.strip_prefix("unix:") {
            Some(user) => ConfigSource::UnixUser(user.to_string()),
            None => ConfigSource::File(PathBuf::from(s)),
        })
    }
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigSource::File(path) => write!(f, "{}", path.display()),
            ConfigSource::UnixUser(user) => write!(f, "unix:{}", user),
        }
    }
}

/// Proxy settings for API requests
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxySettings {
    /// Proxy for plain HTTP requests (empty string disables it)
    #[serde(default)]
    pub http: Option<String>,
    /// Proxy for HTTPS requests (empty string disables it)
    #[serde(default)]
    pub https: Option<String>,
}

/// Resolved client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Logging level name (TRACE, DEBUG, INFO, WARN, ERROR)
    pub log_level: String,
    /// Base URL of the server, without trailing slash
    pub server_url: String,
    /// API key of the user account
    pub api_key: String,
    /// Origin name attached to media created by this client
    pub client_id: String,
    /// Language requested for API messages
    pub language: Option<String>,
    /// Reuse one persistent connection pool for all requests
    pub use_session: bool,
    /// Number of retries after a retryable failure (0 disables retrying)
    pub max_retry: u32,
    /// Status codes that must never be retried
    pub retry_except: Vec<u16>,
    /// Check the server TLS certificate
    pub verify_ssl: bool,
    /// Default per-request timeout
    pub timeout: Duration,
    /// Proxies; `None` uses the environment's proxies
    pub proxies: Option<ProxySettings>,
    /// Buffer size used when writing downloads to disk
    pub download_chunk_size: usize,
    /// Chunk size for chunked uploads and size ceiling for batch uploads
    pub upload_chunk_size: usize,
    /// Maximum number of files per batch upload request
    pub upload_max_files: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            log_level: "INFO".to_string(),
            server_url: PLACEHOLDER_SERVER_URL.to_string(),
            api_key: String::new(),
            client_id: "rust-api-client_<host>".to_string(),
            language: Some("en".to_string()),
            use_session: true,
            max_retry: 0,
            retry_except: vec![401, 403, 404],
            verify_ssl: true,
            timeout: Duration::from_secs(10),
            proxies: None,
            download_chunk_size: DEFAULT_CHUNK_SIZE,
            upload_chunk_size: DEFAULT_CHUNK_SIZE,
            upload_max_files: 100,
        }
    }
}

/// One configuration layer; every field is optional
///
/// Field names in configuration files use the upper-case form
/// (`SERVER_URL`, `MAX_RETRY`, ...). Unknown keys are ignored.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct ConfigOverrides {
    pub log_level: Option<String>,
    pub server_url: Option<String>,
    pub api_key: Option<String>,
    pub client_id: Option<String>,
    pub language: Option<String>,
    pub use_session: Option<bool>,
    pub max_retry: Option<u32>,
    pub retry_except: Option<Vec<u16>>,
    pub verify_ssl: Option<bool>,
    /// Timeout in seconds
    pub timeout: Option<u64>,
    pub proxies: Option<ProxySettings>,
    pub download_chunk_size: Option<usize>,
    pub upload_chunk_size: Option<usize>,
    pub upload_max_files: Option<usize>,
}

impl ConfigOverrides {
    /// Read a JSON configuration file
    ///
    /// Returns `Ok(None)` if the file does not exist or is empty.
    pub fn from_file(path: &Path) -> Result<Option<Self>> {
        let Some(value) = read_json_file(path)? else {
            return Ok(None);
        };
        if !value.is_object() {
            return Err(ClientError::config_error(format!(
                "The configuration in \"{}\" is not an object",
                path.display()
            )));
        }
        if value.as_object().is_some_and(|m| m.is_empty()) {
            debug!("Config file \"{}\" is empty", path.display());
            return Ok(None);
        }
        let overrides = serde_json::from_value(value).map_err(|e| {
            ClientError::config_error(format!("Invalid configuration in \"{}\": {}", path.display(), e))
        })?;
        debug!("Config file \"{}\" loaded", path.display());
        Ok(Some(overrides))
    }

    /// Server URL and master API key of the instance run by a unix user
    pub fn from_unix_user(user: &str) -> Result<Self> {
        let user = user.trim();
        if user.is_empty() {
            return Err(ClientError::config_error("Invalid unix user provided"));
        }
        let path = PathBuf::from(format!("/home/{}/msinstance/conf/mssettings.py", user));
        info!("Retrieving configuration from user \"{}\" instance", user);
        Self::from_instance_settings(&path)
    }

    /// Read `SITE_URL` and `MASTER_API_KEY` from an instance settings file
    ///
    /// The file is scanned, never evaluated.
    pub fn from_instance_settings(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(ClientError::config_error(format!(
                "Instance settings file \"{}\" does not exist",
                path.display()
            )));
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| ClientError::config_error(format!("Failed to read \"{}\": {}", path.display(), e)))?
            .replace('\r', "");

        let setting = |pattern: &Regex, name: &str| {
            pattern
                .captures(&content)
                .and_then(|c| c.get(1))
                .map(|m| m.as_str().to_string())
                .ok_or_else(|| {
                    ClientError::config_error_with_field(
                        format!("No {} in instance settings \"{}\"", name, path.display()),
                        name,
                    )
                })
        };
        Ok(Self {
            server_url: Some(setting(&SITE_URL_SETTING, "SITE_URL")?),
            api_key: Some(setting(&MASTER_API_KEY_SETTING, "MASTER_API_KEY")?),
            ..Self::default()
        })
    }

    /// Read the layer a configuration source points to
    pub fn from_source(source: &ConfigSource) -> Result<Option<Self>> {
        match source {
            ConfigSource::File(path) => Self::from_file(path),
            ConfigSource::UnixUser(user) => Self::from_unix_user(user).map(Some),
        }
    }
}

impl ClientConfig {
    /// Resolve a configuration from defaults, an optional source and process overrides
    pub fn load(source: Option<&ConfigSource>, overrides: &ConfigOverrides) -> Result<Self> {
        let mut config = Self::default();
        if let Some(source) = source {
            if let Some(layer) = ConfigOverrides::from_source(source)? {
                config.apply(&layer);
            }
        }
        config.apply(overrides);
        config.finalize();
        Ok(config)
    }

    /// Build a configuration from defaults and process overrides only
    pub fn from_overrides(overrides: &ConfigOverrides) -> Self {
        let mut config = Self::default();
        config.apply(overrides);
        config.finalize();
        config
    }

    /// Apply one layer on top of the current values
    pub fn apply(&mut self, layer: &ConfigOverrides) {
        if let Some(v) = &layer.log_level {
            self.log_level = v.clone();
        }
        if let Some(v) = &layer.server_url {
            self.server_url = v.clone();
        }
        if let Some(v) = &layer.api_key {
            self.api_key = v.clone();
        }
        if let Some(v) = &layer.client_id {
            self.client_id = v.clone();
        }
        if let Some(v) = &layer.language {
            self.language = if v.is_empty() { None } else { Some(v.clone()) };
        }
        if let Some(v) = layer.use_session {
            self.use_session = v;
        }
        if let Some(v) = layer.max_retry {
            self.max_retry = v;
        }
        if let Some(v) = &layer.retry_except {
            self.retry_except = v.clone();
        }
        if let Some(v) = layer.verify_ssl {
            self.verify_ssl = v;
        }
        if let Some(v) = layer.timeout {
            self.timeout = Duration::from_secs(v);
        }
        if let Some(v) = &layer.proxies {
            self.proxies = Some(v.clone());
        }
        if let Some(v) = layer.download_chunk_size {
            self.download_chunk_size = v;
        }
        if let Some(v) = layer.upload_chunk_size {
            self.upload_chunk_size = v;
        }
        if let Some(v) = layer.upload_max_files {
            self.upload_max_files = v;
        }
    }

    fn finalize(&mut self) {
        self.server_url = self.server_url.trim_end_matches('/').to_string();
        if self.client_id.contains("<host>") {
            let host = hostname::get()
                .map(|h| h.to_string_lossy().into_owned())
                .unwrap_or_else(|_| "unknown".to_string());
            self.client_id = self.client_id.replace("<host>", &host);
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.server_url.is_empty() || self.server_url == PLACEHOLDER_SERVER_URL {
            return Err(ClientError::config_error_with_field(
                "The server URL is not set, please configure it",
                "SERVER_URL",
            ));
        }
        url::Url::parse(&self.server_url).map_err(|e| {
            ClientError::config_error_with_field(format!("Invalid server URL: {}", e), "SERVER_URL")
        })?;
        if self.upload_chunk_size == 0 {
            return Err(ClientError::config_error_with_field("must be at least 1", "UPLOAD_CHUNK_SIZE"));
        }
        if self.download_chunk_size == 0 {
            return Err(ClientError::config_error_with_field("must be at least 1", "DOWNLOAD_CHUNK_SIZE"));
        }
        if self.upload_max_files == 0 {
            return Err(ClientError::config_error_with_field("must be at least 1", "UPLOAD_MAX_FILES"));
        }
        Ok(())
    }

    /// Parsed logging level (INFO if the configured name is unknown)
    pub fn tracing_level(&self) -> tracing::Level {
        self.log_level.parse().unwrap_or(tracing::Level::INFO)
    }
}

/// Persist a single key in a JSON configuration file
///
/// The file is created if missing; keys are written sorted.
pub fn write_override(path: &Path, key: &str, value: serde_json::Value) -> Result<()> {
    let mut map = match read_json_file(path)? {
        Some(serde_json::Value::Object(map)) => map,
        Some(_) => {
            return Err(ClientError::config_error(format!(
                "The configuration in \"{}\" is not an object",
                path.display()
            )))
        }
        None => serde_json::Map::new(),
    };
    map.insert(key.to_string(), value.clone());
    let content = serde_json::to_string_pretty(&serde_json::Value::Object(map))
        .map_err(|e| ClientError::config_error(e.to_string()))?;
    std::fs::write(path, content)
        .map_err(|e| ClientError::storage_error_full("Failed to write configuration", path.display().to_string(), e.to_string()))?;
    info!("Configuration file \"{}\" updated: \"{}\" set to {}", path.display(), key, value);
    Ok(())
}

fn read_json_file(path: &Path) -> Result<Option<serde_json::Value>> {
    if !path.exists() {
        debug!("Config file {} does not exist", path.display());
        return Ok(None);
    }
    let content = std::fs::read_to_string(path)
        .map_err(|e| ClientError::storage_error_full("Failed to read configuration", path.display().to_string(), e.to_string()))?;
    let content = strip_comments(&content);
    if content.trim().is_empty() {
        return Ok(None);
    }
    serde_json::from_str(&content)
        .map(Some)
        .map_err(|e| ClientError::config_error(format!("Invalid JSON in \"{}\": {}", path.display(), e)))
}

fn strip_comments(content: &str) -> String {
    // Only whole-line comments, URLs contain "//" too.
    content
        .lines()
        .filter(|line| !line.trim_start().starts_with("//"))
        .collect::<Vec<_>>()
        .join("\n")
}
