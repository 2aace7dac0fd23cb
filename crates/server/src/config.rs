use std::{
    env,
    net::{IpAddr, SocketAddr},
    str::FromStr,
};

use serde::{de::Error as DeError, Deserialize, Deserializer, Serialize};
use sessionward_core::{MAX_DEVICES_PER_USER, REFRESH_TOKEN_TTL_DAYS, SUSPICION_HISTORY_WINDOW};

/// Ten years; keeps expiry arithmetic on timestamps in range.
const MAX_REFRESH_TTL_DAYS: u32 = 3650;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid bind address: {0}")]
    InvalidBindAddr(String),
    #[error("invalid session setting: {0}")]
    InvalidSession(String),
    #[error("invalid trusted proxy address: {0}")]
    InvalidTrustedProxy(String),
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub bind_addr: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct SessionConfig {
    /// Base64url-encoded 32-byte Ed25519 signing key for access tokens.
    pub active_signing_key: Option<String>,
    /// Base64url-encoded verifying keys still accepted after a rotation.
    pub fallback_verifying_keys: Vec<String>,
    pub access_token_ttl_secs: u64,
    pub refresh_ttl_days: u32,
    pub max_devices_per_user: usize,
    pub history_window: usize,
    pub purge_interval_secs: u64,
    pub cookie_name: String,
    pub cookie_secure: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            active_signing_key: None,
            fallback_verifying_keys: Vec::new(),
            access_token_ttl_secs: 900,
            refresh_ttl_days: REFRESH_TOKEN_TTL_DAYS as u32,
            max_devices_per_user: MAX_DEVICES_PER_USER,
            history_window: SUSPICION_HISTORY_WINDOW,
            purge_interval_secs: 3600,
            cookie_name: "refresh_token".to_string(),
            cookie_secure: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct NetworkConfig {
    /// Honor `x-forwarded-for` / `x-real-ip` when resolving the client address.
    pub trust_forwarded_headers: bool,
    /// When non-empty, forwarding headers are only honored for these peers.
    pub trusted_proxies: Vec<String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            trust_forwarded_headers: true,
            trusted_proxies: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct GeoConfig {
    /// JSON network table; without one every address resolves to no location.
    pub database_path: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct BootstrapAdminConfig {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: Option<String>,
    pub host: String,
    pub port: u16,
    pub log_format: LogFormat,
    pub metrics: MetricsConfig,
    pub database_url: Option<String>,
    pub session: SessionConfig,
    pub network: NetworkConfig,
    pub geo: GeoConfig,
    pub bootstrap_admin: Option<BootstrapAdminConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: None,
            host: "0.0.0.0".to_string(),
            port: 8080,
            log_format: LogFormat::Compact,
            metrics: MetricsConfig::default(),
            database_url: None,
            session: SessionConfig::default(),
            network: NetworkConfig::default(),
            geo: GeoConfig::default(),
            bootstrap_admin: None,
        }
    }
}

/// Values supplied on the command line; each one replaces the layered value.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub bind_addr: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub log_format: Option<LogFormat>,
    pub metrics_enabled: Option<bool>,
    pub metrics_bind_addr: Option<String>,
    pub database_url: Option<String>,
    pub session_signing_key: Option<String>,
    pub session_fallback_verifying_keys: Option<Vec<String>>,
    pub max_devices_per_user: Option<usize>,
    pub cookie_secure: Option<bool>,
    pub trust_forwarded_headers: Option<bool>,
    pub geo_database_path: Option<String>,
}

impl ServerConfig {
    const ENV_PREFIX: &'static str = "SESSIONWARD_SERVER";

    pub fn load() -> Result<Self, ConfigError> {
        let defaults = ServerConfig::default();

        let builder = config::Config::builder()
            .add_source(config::File::with_name("config/server").required(false))
            .add_source(config::File::with_name("config/server.local").required(false))
            .add_source(
                config::Environment::with_prefix(Self::ENV_PREFIX)
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("session.fallback_verifying_keys")
                    .with_list_parse_key("network.trusted_proxies")
                    .try_parsing(true),
            )
            .set_default("host", defaults.host.clone())?
            .set_default("port", defaults.port as i64)?
            .set_default("log_format", defaults.log_format.as_str())?
            .set_default("metrics.enabled", defaults.metrics.enabled)?;

        let settings: ServerConfig = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn apply_overrides(&mut self, overrides: &CliOverrides) -> Result<(), ConfigError> {
        if let Some(bind_addr) = &overrides.bind_addr {
            self.bind_addr = Some(bind_addr.clone());
        }
        if let Some(host) = &overrides.host {
            self.host = host.clone();
        }
        if let Some(port) = overrides.port {
            self.port = port;
        }
        if let Some(log_format) = overrides.log_format {
            self.log_format = log_format;
        }
        if let Some(enabled) = overrides.metrics_enabled {
            self.metrics.enabled = enabled;
        }
        if let Some(addr) = &overrides.metrics_bind_addr {
            self.metrics.bind_addr = Some(addr.clone());
        }
        if let Some(url) = &overrides.database_url {
            self.database_url = Some(url.clone());
        }
        if let Some(key) = &overrides.session_signing_key {
            self.session.active_signing_key = Some(key.clone());
        }
        if let Some(keys) = &overrides.session_fallback_verifying_keys {
            self.session.fallback_verifying_keys = keys.clone();
        }
        if let Some(max) = overrides.max_devices_per_user {
            self.session.max_devices_per_user = max;
        }
        if let Some(secure) = overrides.cookie_secure {
            self.session.cookie_secure = secure;
        }
        if let Some(trust) = overrides.trust_forwarded_headers {
            self.network.trust_forwarded_headers = trust;
        }
        if let Some(path) = &overrides.geo_database_path {
            self.geo.database_path = Some(path.clone());
        }
        self.validate()
    }

    pub fn listener_addr(&self) -> Result<SocketAddr, ConfigError> {
        if let Some(addr) = &self.bind_addr {
            return addr
                .parse()
                .map_err(|_| ConfigError::InvalidBindAddr(addr.clone()));
        }

        let addr = format!("{}:{}", self.host, self.port);
        addr.parse().map_err(|_| ConfigError::InvalidBindAddr(addr))
    }

    pub fn log_format(&self) -> LogFormat {
        self.log_format
    }

    /// Trusted proxy peers, already validated by [`ServerConfig::validate`].
    pub fn trusted_proxies(&self) -> Vec<IpAddr> {
        self.network
            .trusted_proxies
            .iter()
            .filter_map(|raw| raw.trim().parse().ok())
            .collect()
    }

    /// Names of the `SESSIONWARD_SERVER__*` variables present in the process
    /// environment, lowercased and without the prefix.
    pub fn environment_override_keys() -> Vec<String> {
        let prefix = format!("{}__", Self::ENV_PREFIX);
        let mut keys: Vec<String> = env::vars()
            .filter_map(|(key, _)| {
                key.strip_prefix(&prefix)
                    .map(|rest| rest.replace("__", ".").to_ascii_lowercase())
            })
            .collect();
        keys.sort();
        keys
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::InvalidBindAddr("port cannot be zero".into()));
        }
        if let Some(addr) = &self.metrics.bind_addr {
            addr.parse::<SocketAddr>()
                .map_err(|_| ConfigError::InvalidBindAddr(addr.clone()))?;
        }

        let session = &self.session;
        if session.max_devices_per_user == 0 {
            return Err(ConfigError::InvalidSession(
                "max_devices_per_user must be at least 1".into(),
            ));
        }
        if session.access_token_ttl_secs == 0 {
            return Err(ConfigError::InvalidSession(
                "access_token_ttl_secs must be positive".into(),
            ));
        }
        if session.refresh_ttl_days == 0 {
            return Err(ConfigError::InvalidSession(
                "refresh_ttl_days must be positive".into(),
            ));
        }
        if session.refresh_ttl_days > MAX_REFRESH_TTL_DAYS {
            return Err(ConfigError::InvalidSession(format!(
                "refresh_ttl_days must be at most {MAX_REFRESH_TTL_DAYS}"
            )));
        }
        if session.history_window == 0 {
            return Err(ConfigError::InvalidSession(
                "history_window must be at least 1".into(),
            ));
        }
        if session.cookie_name.trim().is_empty() {
            return Err(ConfigError::InvalidSession(
                "cookie_name cannot be empty".into(),
            ));
        }

        for proxy in &self.network.trusted_proxies {
            proxy
                .trim()
                .parse::<IpAddr>()
                .map_err(|_| ConfigError::InvalidTrustedProxy(proxy.clone()))?;
        }
        Ok(())
    }
}

impl LogFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogFormat::Compact => "compact",
            LogFormat::Json => "json",
        }
    }
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "compact" => Ok(LogFormat::Compact),
            other => Err(format!("unsupported log format '{other}'")),
        }
    }
}

impl<'de> Deserialize<'de> for LogFormat {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        LogFormat::from_str(&value).map_err(D::Error::custom)
    }
}
