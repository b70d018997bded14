//! Profile-based broker configuration
//!
//! A single TOML file can describe several MQTT brokers ("profiles"). Common
//! settings live directly under `[mqtt]` and each `[mqtt.profiles.<name>]`
//! table overrides them. The profiles listed as active are resolved into
//! immutable [`BrokerConfig`] values; the first active profile is the primary.
//!
//! ```toml
//! [mqtt]
//! active_profiles = ["local", "public"]
//! client_id_prefix = "demo"
//! keepalive_secs = 30
//!
//! [mqtt.profiles.local]
//! host = "localhost"
//! port = 1883
//!
//! [mqtt.profiles.public]
//! url = "mqtts://broker.example.com:8883"
//! username_env = "PUBLIC_MQTT_USER"
//! password_env = "PUBLIC_MQTT_PASS"
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use url::Url;

/// Default configuration file name, searched for upwards from the working directory
pub const DEFAULT_CONFIG_FILE: &str = "simcity.toml";

/// Comma-separated list of active profiles, overrides the file
pub const PROFILES_ENV: &str = "SIMCITY_MQTT_PROFILES";

const DEFAULT_PROFILE: &str = "local";
const DEFAULT_HOST: &str = "localhost";
const DEFAULT_PORT: u16 = 1883;
const DEFAULT_TLS_PORT: u16 = 8883;
const DEFAULT_CLIENT_ID_PREFIX: &str = "simcity";
const DEFAULT_KEEPALIVE_SECS: u64 = 60;
const DEFAULT_BASE_TOPIC: &str = "simulated-city";
const DEFAULT_MAX_PACKET_SIZE: usize = 256 * 1024;

/// Shortest keep-alive interval the MQTT client accepts
pub const MIN_KEEPALIVE_SECS: u64 = 5;

/// Local secrets file, loaded before credentials are resolved
pub const DOTENV_FILE: &str = ".env";

/// Connection descriptor for one broker profile
///
/// Built once at load time and never mutated. Credentials are resolved from
/// environment variables; the password is skipped when serializing and
/// redacted from `Debug` output.
#[derive(Clone, PartialEq, Eq, Serialize)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub tls: bool,
    pub username: Option<String>,
    #[serde(skip_serializing)]
    pub password: Option<String>,
    pub client_id_prefix: String,
    /// Keep-alive interval in seconds (at least [`MIN_KEEPALIVE_SECS`])
    pub keepalive_secs: u64,
    /// Prefix for every topic built from this profile
    pub base_topic: String,
    /// Default quality of service level (0, 1 or 2)
    pub qos: u8,
    /// Largest PUBLISH packet accepted, topic and headers included, in bytes
    pub max_packet_size: usize,
}

impl BrokerConfig {
    /// Plaintext broker on localhost:1883 with all defaults
    pub fn local() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            tls: false,
            username: None,
            password: None,
            client_id_prefix: DEFAULT_CLIENT_ID_PREFIX.to_string(),
            keepalive_secs: DEFAULT_KEEPALIVE_SECS,
            base_topic: DEFAULT_BASE_TOPIC.to_string(),
            qos: 0,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
        }
    }

    /// `host:port` for log lines
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self::local()
    }
}

impl fmt::Debug for BrokerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("tls", &self.tls)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("client_id_prefix", &self.client_id_prefix)
            .field("keepalive_secs", &self.keepalive_secs)
            .field("base_topic", &self.base_topic)
            .field("qos", &self.qos)
            .field("max_packet_size", &self.max_packet_size)
            .finish()
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Unknown MQTT profile '{name}'. Available: {available}")]
    UnknownProfile { name: String, available: String },
    #[error("Invalid profile name: '{0}' must match [a-zA-Z0-9._-]+")]
    InvalidProfileName(String),
    #[error("Invalid broker URL '{0}'")]
    InvalidBrokerUrl(String),
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },
    #[error("No active MQTT profiles configured")]
    NoActiveProfiles,
}

impl ConfigError {
    fn invalid(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            key: key.into(),
            message: message.into(),
        }
    }
}

/// File layout: only the `[mqtt]` table is read, other tables are ignored
#[derive(Debug, Default, Deserialize)]
struct RawConfigFile {
    #[serde(default)]
    mqtt: RawMqttSection,
}

#[derive(Debug, Default, Deserialize)]
struct RawMqttSection {
    active_profiles: Option<Vec<String>>,
    profile: Option<String>,
    profiles: Option<HashMap<String, ProfileSection>>,
    #[serde(flatten)]
    common: ProfileSection,
}

/// Settings that may appear under `[mqtt]` and in every profile table
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct ProfileSection {
    /// `mqtt://host[:port]` or `mqtts://host[:port]`; sets host, port and tls
    pub url: Option<String>,
    pub host: Option<String>,
    pub port: Option<i64>,
    pub tls: Option<bool>,
    /// Environment variable holding the username
    pub username_env: Option<String>,
    /// Environment variable holding the password
    pub password_env: Option<String>,
    pub client_id_prefix: Option<String>,
    pub keepalive_secs: Option<i64>,
    pub base_topic: Option<String>,
    pub qos: Option<i64>,
    pub max_packet_size: Option<i64>,
}

impl ProfileSection {
    /// Profile values win, common values fill the gaps
    fn merged_over(&self, common: &ProfileSection) -> ProfileSection {
        ProfileSection {
            url: self.url.clone().or_else(|| common.url.clone()),
            host: self.host.clone().or_else(|| common.host.clone()),
            port: self.port.or(common.port),
            tls: self.tls.or(common.tls),
            username_env: self
                .username_env
                .clone()
                .or_else(|| common.username_env.clone()),
            password_env: self
                .password_env
                .clone()
                .or_else(|| common.password_env.clone()),
            client_id_prefix: self
                .client_id_prefix
                .clone()
                .or_else(|| common.client_id_prefix.clone()),
            keepalive_secs: self.keepalive_secs.or(common.keepalive_secs),
            base_topic: self.base_topic.clone().or_else(|| common.base_topic.clone()),
            qos: self.qos.or(common.qos),
            max_packet_size: self.max_packet_size.or(common.max_packet_size),
        }
    }

    /// Resolve into a validated [`BrokerConfig`], reading credentials from the environment
    fn into_broker_config(self, profile: &str) -> Result<BrokerConfig, ConfigError> {
        let key = |field: &str| format!("mqtt.profiles.{profile}.{field}");
        let mut config = BrokerConfig::local();

        if let Some(url) = &self.url {
            let (host, port, tls) = parse_broker_url(url)?;
            config.host = host;
            config.port = port;
            config.tls = tls;
        }
        if let Some(host) = self.host {
            config.host = host;
        }
        if let Some(tls) = self.tls {
            config.tls = tls;
        }
        if let Some(port) = self.port {
            config.port = u16::try_from(port)
                .ok()
                .filter(|p| *p != 0)
                .ok_or_else(|| ConfigError::invalid(key("port"), "must be between 1 and 65535"))?;
        }
        if config.host.trim().is_empty() {
            return Err(ConfigError::invalid(key("host"), "must not be empty"));
        }

        if let Some(prefix) = self.client_id_prefix {
            config.client_id_prefix = prefix;
        }
        if let Some(keepalive) = self.keepalive_secs {
            if keepalive < MIN_KEEPALIVE_SECS as i64 {
                return Err(ConfigError::invalid(
                    key("keepalive_secs"),
                    format!("must be >= {MIN_KEEPALIVE_SECS}"),
                ));
            }
            config.keepalive_secs = keepalive as u64;
        }
        if let Some(base_topic) = self.base_topic {
            config.base_topic = base_topic;
        }
        if let Some(qos) = self.qos {
            if !(0..=2).contains(&qos) {
                return Err(ConfigError::invalid(key("qos"), "must be 0, 1 or 2"));
            }
            config.qos = qos as u8;
        }
        if let Some(size) = self.max_packet_size {
            if size <= 0 {
                return Err(ConfigError::invalid(key("max_packet_size"), "must be > 0"));
            }
            config.max_packet_size = size as usize;
        }

        config.username = env_var_optional(self.username_env.as_deref());
        config.password = env_var_optional(self.password_env.as_deref());

        Ok(config)
    }
}

/// All active broker profiles, in activation order
#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    active_profiles: Vec<String>,
    profiles: HashMap<String, BrokerConfig>,
}

impl AppConfig {
    /// Load configuration, searching parent directories for bare file names
    ///
    /// A missing file is not an error: the built-in `local` profile is used.
    /// Variables from a `.env` next to the config file (or in the working
    /// directory or its parents) are loaded first, so `username_env` and
    /// `password_env` can point at secrets kept out of version control.
    /// Variables already set in the environment are never overridden.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let resolved = resolve_config_path(path.as_ref());
        load_dotenv(&resolved);
        if !resolved.exists() {
            tracing::debug!(path = %resolved.display(), "Config file not found, using defaults");
            return Self::from_toml_str("");
        }
        Self::load_from_file(&resolved)
    }

    /// Load configuration from exactly this file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        tracing::debug!(path = %path.display(), "Loaded config file");
        Self::from_toml_str(&content)
    }

    /// Parse configuration text, honouring [`PROFILES_ENV`]
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let env_profiles = std::env::var(PROFILES_ENV).ok();
        Self::parse_with_profiles(content, env_profiles.as_deref())
    }

    /// Parse configuration text with an explicit active-profile override
    pub fn parse_with_profiles(
        content: &str,
        profiles_override: Option<&str>,
    ) -> Result<Self, ConfigError> {
        let raw: RawConfigFile = toml::from_str(content)?;
        let section = raw.mqtt;
        let active = resolve_active_profiles(&section, profiles_override);

        let mut profiles = HashMap::new();
        for name in &active {
            validate_profile_name(name)?;
            let selected = match &section.profiles {
                None if name == DEFAULT_PROFILE => ProfileSection::default(),
                maybe_profiles => {
                    let available = maybe_profiles.as_ref();
                    available
                        .and_then(|p| p.get(name))
                        .cloned()
                        .ok_or_else(|| ConfigError::UnknownProfile {
                            name: name.clone(),
                            available: available_names(available),
                        })?
                }
            };
            let config = selected
                .merged_over(&section.common)
                .into_broker_config(name)?;
            profiles.insert(name.clone(), config);
        }

        Self::from_parts(
            active
                .into_iter()
                .filter_map(|name| profiles.remove(&name).map(|cfg| (name, cfg)))
                .collect(),
        )
    }

    /// Build from already-resolved profiles; the first entry is the primary
    pub fn from_parts(profiles: Vec<(String, BrokerConfig)>) -> Result<Self, ConfigError> {
        if profiles.is_empty() {
            return Err(ConfigError::NoActiveProfiles);
        }

        let mut active_profiles = Vec::with_capacity(profiles.len());
        let mut map = HashMap::with_capacity(profiles.len());
        for (name, config) in profiles {
            validate_profile_name(&name)?;
            if map.insert(name.clone(), config).is_none() {
                active_profiles.push(name);
            }
        }

        Ok(Self {
            active_profiles,
            profiles: map,
        })
    }

    /// Name of the primary (first active) profile
    pub fn primary_name(&self) -> &str {
        &self.active_profiles[0]
    }

    /// The primary broker profile
    pub fn primary(&self) -> &BrokerConfig {
        &self.profiles[self.primary_name()]
    }

    pub fn profile(&self, name: &str) -> Option<&BrokerConfig> {
        self.profiles.get(name)
    }

    pub fn active_profiles(&self) -> &[String] {
        &self.active_profiles
    }

    /// Profiles in activation order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &BrokerConfig)> {
        self.active_profiles
            .iter()
            .map(move |name| (name.as_str(), &self.profiles[name]))
    }
}

fn resolve_active_profiles(
    section: &RawMqttSection,
    profiles_override: Option<&str>,
) -> Vec<String> {
    if let Some(list) = profiles_override {
        let names: Vec<String> = list
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        if !names.is_empty() {
            return names;
        }
    }

    if let Some(active) = &section.active_profiles {
        return active
            .iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
    }

    match &section.profile {
        Some(profile) if !profile.trim().is_empty() => vec![profile.trim().to_string()],
        _ => vec![DEFAULT_PROFILE.to_string()],
    }
}

fn available_names(profiles: Option<&HashMap<String, ProfileSection>>) -> String {
    let mut names: Vec<&str> = profiles
        .map(|p| p.keys().map(String::as_str).collect())
        .unwrap_or_default();
    names.sort_unstable();
    names.join(", ")
}

fn validate_profile_name(name: &str) -> Result<(), ConfigError> {
    let valid_chars = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-');

    if name.is_empty() || !valid_chars {
        return Err(ConfigError::InvalidProfileName(name.to_string()));
    }
    Ok(())
}

/// Split a `mqtt://` / `mqtts://` URL into host, port and TLS flag
fn parse_broker_url(raw: &str) -> Result<(String, u16, bool), ConfigError> {
    let url = Url::parse(raw).map_err(|_| ConfigError::InvalidBrokerUrl(raw.to_string()))?;
    let tls = match url.scheme() {
        "mqtt" | "tcp" => false,
        "mqtts" | "ssl" => true,
        _ => return Err(ConfigError::InvalidBrokerUrl(raw.to_string())),
    };
    let host = url
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| ConfigError::InvalidBrokerUrl(raw.to_string()))?;
    let port = url
        .port()
        .unwrap_or(if tls { DEFAULT_TLS_PORT } else { DEFAULT_PORT });
    Ok((host.to_string(), port, tls))
}

/// Load `.env` files without overriding variables that are already set
fn load_dotenv(config_path: &Path) {
    let beside_config = config_path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .map(|dir| dir.join(DOTENV_FILE));
    if let Some(env_file) = beside_config.filter(|p| p.exists()) {
        match dotenvy::from_path(&env_file) {
            Ok(()) => tracing::debug!(path = %env_file.display(), "Loaded .env file"),
            Err(e) => {
                tracing::warn!(path = %env_file.display(), "Ignoring unreadable .env file: {}", e)
            }
        }
    }

    if let Ok(path) = dotenvy::dotenv() {
        tracing::debug!(path = %path.display(), "Loaded .env file");
    }
}

fn env_var_optional(name: Option<&str>) -> Option<String> {
    name.and_then(|n| std::env::var(n).ok())
}

/// Resolve a config path the way notebooks expect
///
/// Absolute paths and paths that exist are used as-is. A bare file name that
/// does not exist in the working directory is looked up in each ancestor.
pub fn resolve_config_path(path: &Path) -> PathBuf {
    if path.is_absolute() || path.exists() {
        return path.to_path_buf();
    }

    let is_bare_name = path
        .parent()
        .map(|p| p.as_os_str().is_empty())
        .unwrap_or(true);
    if !is_bare_name {
        return path.to_path_buf();
    }

    if let Ok(cwd) = std::env::current_dir() {
        for dir in cwd.ancestors() {
            let candidate = dir.join(path);
            if candidate.exists() {
                return candidate;
            }
        }
    }

    path.to_path_buf()
}
