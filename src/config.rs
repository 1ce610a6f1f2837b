// config.rs
use secrecy::SecretString;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_address")]
    pub address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Seeds the `server-url` setting when it is not set explicitly.
    #[serde(default)]
    pub public_url: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            port: default_port(),
            public_url: None,
        }
    }
}

/// Postgres connection; without a URL records are kept in memory.
#[derive(Debug, Deserialize, Default)]
pub struct DatabaseConfig {
    pub url: Option<SecretString>,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

#[derive(Debug, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_session_ttl")]
    pub session_ttl_minutes: u64,
    /// Forces the `Secure` cookie attribute regardless of the request scheme.
    #[serde(default)]
    pub secure_cookies: bool,
    /// Signs the SAML relay-state cookie; random per process when unset.
    pub state_secret: Option<SecretString>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            session_ttl_minutes: default_session_ttl(),
            secure_cookies: false,
            state_secret: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CatalogConfig {
    #[serde(default = "default_cache_root")]
    pub cache_root: PathBuf,
    #[serde(default = "default_icon_cache")]
    pub icon_cache: PathBuf,
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_secs: u64,
    #[serde(default = "default_http_timeout")]
    pub http_timeout_secs: u64,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            cache_root: default_cache_root(),
            icon_cache: default_icon_cache(),
            refresh_interval_secs: default_refresh_interval(),
            http_timeout_secs: default_http_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProvisionerConfig {
    #[serde(default = "default_driver_dir")]
    pub driver_dir: PathBuf,
    #[serde(default = "default_metadata_dir")]
    pub metadata_dir: PathBuf,
    #[serde(default = "default_backoff_base")]
    pub backoff_base_secs: u64,
    #[serde(default = "default_backoff_max")]
    pub backoff_max_secs: u64,
    /// Deadline for a single engine-driver call.
    #[serde(default = "default_driver_timeout")]
    pub driver_timeout_secs: u64,
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            driver_dir: default_driver_dir(),
            metadata_dir: default_metadata_dir(),
            backoff_base_secs: default_backoff_base(),
            backoff_max_secs: default_backoff_max(),
            driver_timeout_secs: default_driver_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Global configuration
#[derive(Debug, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub auth: SessionConfig,
    #[serde(default)]
    pub catalog: CatalogConfig,
    #[serde(default)]
    pub provisioner: ProvisionerConfig,
    /// Initial values for runtime settings, e.g. `server-url`.
    #[serde(default)]
    pub settings: BTreeMap<String, String>,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load config from `config/default.toml` (or `path`) and `CORRAL__*` environment variables
    pub fn load(path: Option<&str>) -> anyhow::Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path.unwrap_or("config/default")).required(path.is_some()))
            .add_source(config::Environment::with_prefix("CORRAL").separator("__"))
            .build()?;

        let cfg: Config = settings.try_deserialize()?;
        Ok(cfg)
    }
}

fn default_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_max_connections() -> u32 {
    10
}

fn default_session_ttl() -> u64 {
    960
}

fn default_cache_root() -> PathBuf {
    PathBuf::from("./management-state/catalog-cache")
}

fn default_icon_cache() -> PathBuf {
    PathBuf::from("./management-state/catalog-icons")
}

fn default_refresh_interval() -> u64 {
    300
}

fn default_http_timeout() -> u64 {
    30
}

fn default_driver_dir() -> PathBuf {
    PathBuf::from("./management-state/kontainer-drivers/")
}

fn default_metadata_dir() -> PathBuf {
    PathBuf::from("./management-state/driver-metadata/")
}

fn default_backoff_base() -> u64 {
    30
}

fn default_backoff_max() -> u64 {
    600
}

fn default_driver_timeout() -> u64 {
    1800
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_workers() -> usize {
    5
}
