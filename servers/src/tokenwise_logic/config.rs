use clap::Parser;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use url::Url;

pub const DEFAULT_CONFIG_FILE: &str = "server_tokenwise.conf";
pub const DEFAULT_TOKEN_CONTRACT: &str = "9BB6NFEcjBCtnNLFko2FqVQBq8HHM13kCyYcdQbgpump";

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default)]
#[clap(about = "TokenWise live wallet monitoring server", version)]
pub struct Config {
    #[clap(long, env = "TOKENWISE_PORT", help = "Port to listen on for HTTP and websocket clients.")]
    pub port: Option<u16>,

    #[clap(long, env = "TOKENWISE_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "TOKENWISE_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "TOKENWISE_LOG_LEVEL", help = "Default log filter (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "SOLANA_RPC_URL", help = "Solana JSON-RPC endpoint.")]
    pub rpc_url: Option<String>,

    #[clap(long, env = "TOKEN_CONTRACT", help = "Mint address of the tracked token.")]
    pub token_contract: Option<String>,

    #[clap(long, env = "DATABASE_URL", help = "Postgres connection string. In-memory storage when unset.")]
    pub database_url: Option<String>,

    #[clap(long, env = "TOKENWISE_DB_POOL_SIZE", help = "Maximum number of pooled database connections.")]
    pub db_pool_size: Option<usize>,

    #[clap(long, env = "TOKENWISE_CYCLE_PERIOD_SECS", help = "Seconds between monitor cycles.")]
    pub cycle_period_secs: Option<u64>,

    #[clap(long, env = "TOKENWISE_DISCOVERY_INTERVAL_SECS", help = "Seconds between holder discoveries.")]
    pub discovery_interval_secs: Option<u64>,

    #[clap(long, env = "TOKENWISE_TOP_N", help = "Number of top holders to track.")]
    pub top_n: Option<usize>,

    #[clap(long, env = "TOKENWISE_RPC_TIMEOUT_SECS", help = "Per-attempt RPC timeout in seconds.")]
    pub rpc_timeout_secs: Option<u64>,

    #[clap(long, env = "TOKENWISE_RPC_MAX_RETRIES", help = "RPC attempts before giving up.")]
    pub rpc_max_retries: Option<u32>,

    #[clap(long, env = "TOKENWISE_RPC_INITIAL_BACKOFF_MS", help = "Backoff after the first failed RPC attempt, doubled each time.")]
    pub rpc_initial_backoff_ms: Option<u64>,

    #[clap(long, env = "TOKENWISE_IDLE_TIMEOUT_SECS", help = "Seconds of client silence before a keepalive is pushed.")]
    pub idle_timeout_secs: Option<u64>,

    #[clap(long, env = "TOKENWISE_EVENT_SOURCE", help = "Where transaction events come from: synthetic or chain.")]
    pub event_source: Option<String>,

    #[clap(long, env = "TLS_CERT_PATH", help = "Path to the TLS certificate file.")]
    pub tls_cert_path: Option<PathBuf>,

    #[clap(long, env = "TLS_KEY_PATH", help = "Path to the TLS private key file.")]
    pub tls_key_path: Option<PathBuf>,
}

impl Config {
    // Merge two Config structs, where 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            port: other.port.or(self.port),
            config_path: other.config_path.or(self.config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            rpc_url: other.rpc_url.or(self.rpc_url),
            token_contract: other.token_contract.or(self.token_contract),
            database_url: other.database_url.or(self.database_url),
            db_pool_size: other.db_pool_size.or(self.db_pool_size),
            cycle_period_secs: other.cycle_period_secs.or(self.cycle_period_secs),
            discovery_interval_secs: other.discovery_interval_secs.or(self.discovery_interval_secs),
            top_n: other.top_n.or(self.top_n),
            rpc_timeout_secs: other.rpc_timeout_secs.or(self.rpc_timeout_secs),
            rpc_max_retries: other.rpc_max_retries.or(self.rpc_max_retries),
            rpc_initial_backoff_ms: other.rpc_initial_backoff_ms.or(self.rpc_initial_backoff_ms),
            idle_timeout_secs: other.idle_timeout_secs.or(self.idle_timeout_secs),
            event_source: other.event_source.or(self.event_source),
            tls_cert_path: other.tls_cert_path.or(self.tls_cert_path),
            tls_key_path: other.tls_key_path.or(self.tls_key_path),
        }
    }

    fn defaults() -> Config {
        Config {
            port: Some(8000),
            log_dir: Some(PathBuf::from("./logs")),
            log_level: Some("info".to_string()),
            db_pool_size: Some(16),
            cycle_period_secs: Some(5),
            discovery_interval_secs: Some(6 * 60 * 60),
            top_n: Some(100),
            rpc_timeout_secs: Some(30),
            rpc_max_retries: Some(3),
            rpc_initial_backoff_ms: Some(5000),
            idle_timeout_secs: Some(30),
            event_source: Some("synthetic".to_string()),
            ..Default::default()
        }
    }
}

/// Whether a config file was used, for the startup log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    File(PathBuf),
    Missing(PathBuf),
    Unreadable(PathBuf, String),
}

/// Defaults, then the JSON config file, then environment and command line.
pub fn load_config() -> (Config, ConfigSource) {
    load_config_with(Config::parse())
}

pub fn load_config_with(cli: Config) -> (Config, ConfigSource) {
    let config_file_path = cli
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

    let mut current_config = Config::defaults();
    let source = match read_config_file(&config_file_path) {
        Ok(Some(file_config)) => {
            current_config = current_config.merge(file_config);
            ConfigSource::File(config_file_path)
        }
        Ok(None) => ConfigSource::Missing(config_file_path),
        Err(reason) => ConfigSource::Unreadable(config_file_path, reason),
    };

    (current_config.merge(cli), source)
}

fn read_config_file(path: &Path) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path).map_err(|e| e.to_string())?;
    serde_json::from_str::<Config>(&raw).map(Some).map_err(|e| e.to_string())
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required setting `{0}`")]
    Missing(&'static str),
    #[error("invalid rpc_url {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("`{0}` must be greater than zero")]
    Zero(&'static str),
    #[error("unknown event_source {0:?}, expected `synthetic` or `chain`")]
    UnknownEventSource(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventSourceKind {
    Synthetic,
    Chain,
}

#[derive(Debug, Clone)]
pub struct TlsPaths {
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// Validated runtime settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub port: u16,
    pub log_dir: PathBuf,
    pub log_level: String,
    pub rpc_url: Url,
    pub token_contract: String,
    /// True when `token_contract` fell back to the built-in mint.
    pub token_defaulted: bool,
    pub database_url: Option<String>,
    pub db_pool_size: usize,
    pub cycle_period: Duration,
    pub discovery_interval: Duration,
    pub top_n: usize,
    pub rpc_timeout: Duration,
    pub rpc_max_retries: u32,
    pub rpc_initial_backoff: Duration,
    pub idle_timeout: Duration,
    pub event_source: EventSourceKind,
    pub tls: Option<TlsPaths>,
}

impl TryFrom<Config> for Settings {
    type Error = ConfigError;

    fn try_from(config: Config) -> Result<Self, Self::Error> {
        let defaults = Config::defaults();

        let raw_url = config.rpc_url.ok_or(ConfigError::Missing("rpc_url"))?;
        let rpc_url = Url::parse(&raw_url).map_err(|e| ConfigError::InvalidUrl {
            url: raw_url.clone(),
            reason: e.to_string(),
        })?;
        if !matches!(rpc_url.scheme(), "http" | "https") {
            return Err(ConfigError::InvalidUrl {
                url: raw_url,
                reason: "scheme must be http or https".to_string(),
            });
        }

        let cycle_period_secs = config.cycle_period_secs.or(defaults.cycle_period_secs).unwrap_or(5);
        if cycle_period_secs == 0 {
            return Err(ConfigError::Zero("cycle_period_secs"));
        }
        let rpc_max_retries = config.rpc_max_retries.or(defaults.rpc_max_retries).unwrap_or(3);
        if rpc_max_retries == 0 {
            return Err(ConfigError::Zero("rpc_max_retries"));
        }

        let event_source = match config.event_source.as_deref().unwrap_or("synthetic") {
            "synthetic" => EventSourceKind::Synthetic,
            "chain" => EventSourceKind::Chain,
            other => return Err(ConfigError::UnknownEventSource(other.to_string())),
        };

        let token_defaulted = config.token_contract.is_none();
        let tls = match (config.tls_cert_path, config.tls_key_path) {
            (Some(cert), Some(key)) => Some(TlsPaths { cert, key }),
            _ => None,
        };

        Ok(Settings {
            port: config.port.or(defaults.port).unwrap_or(8000),
            log_dir: config.log_dir.or(defaults.log_dir).unwrap_or_else(|| PathBuf::from("./logs")),
            log_level: config.log_level.or(defaults.log_level).unwrap_or_else(|| "info".to_string()),
            rpc_url,
            token_contract: config
                .token_contract
                .unwrap_or_else(|| DEFAULT_TOKEN_CONTRACT.to_string()),
            token_defaulted,
            database_url: config.database_url.filter(|url| !url.trim().is_empty()),
            db_pool_size: config.db_pool_size.or(defaults.db_pool_size).unwrap_or(16).max(1),
            cycle_period: Duration::from_secs(cycle_period_secs),
            discovery_interval: Duration::from_secs(
                config.discovery_interval_secs.or(defaults.discovery_interval_secs).unwrap_or(21600),
            ),
            top_n: config.top_n.or(defaults.top_n).unwrap_or(100),
            rpc_timeout: Duration::from_secs(config.rpc_timeout_secs.or(defaults.rpc_timeout_secs).unwrap_or(30)),
            rpc_max_retries,
            rpc_initial_backoff: Duration::from_millis(
                config.rpc_initial_backoff_ms.or(defaults.rpc_initial_backoff_ms).unwrap_or(5000),
            ),
            idle_timeout: Duration::from_secs(config.idle_timeout_secs.or(defaults.idle_timeout_secs).unwrap_or(30)),
            event_source,
            tls,
        })
    }
}
