//! Configuration Module
//!
//! TOML configuration for conformq with support for:
//! - Target address (host, port) for the peer connection
//! - Broker/client under-test invocation (command, args, environment)
//! - Timing knobs (startup delay, receive/connect/accept timeouts)
//! - Bridge scenario commands and config files
//! - Optional TLS settings for secure-listener scenarios
//! - Environment variable overrides (CONFORMQ_* prefix)

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

use crate::transport::TlsClientConfig;


/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> String {
    let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}").unwrap();
    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        std::env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .to_string()
}

/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Config crate error
    Config(config::ConfigError),
    /// Validation error
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub log: LogConfig,
    /// Peer address configuration
    pub target: TargetConfig,
    /// Timing knobs
    pub timing: TimingConfig,
    /// Broker under test
    pub broker: UnderTestConfig,
    /// Client under test
    pub client: UnderTestConfig,
    /// Bridge scenario pieces
    pub bridge: BridgeScenarioConfig,
    /// TLS settings for secure-listener scenarios
    pub tls: Option<TlsConfig>,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "warn".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Where the peer connection happens
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TargetConfig {
    /// Host for broker scenarios; bind address for client scenarios
    #[serde(default = "default_host")]
    pub host: IpAddr,
    /// Conventional test port
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> IpAddr {
    "127.0.0.1".parse().unwrap()
}

fn default_port() -> u16 {
    1888
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl TargetConfig {
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

/// Timing knobs. The startup delay is the sole mitigation for the race
/// between process start and socket connect; raise it on slow machines.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    #[serde(with = "humantime_serde", default = "default_startup_delay")]
    pub startup_delay: Duration,
    #[serde(with = "humantime_serde", default = "default_recv_timeout")]
    pub recv_timeout: Duration,
    #[serde(with = "humantime_serde", default = "default_recv_timeout")]
    pub connect_timeout: Duration,
    #[serde(with = "humantime_serde", default = "default_accept_timeout")]
    pub accept_timeout: Duration,
}

fn default_startup_delay() -> Duration {
    crate::harness::DEFAULT_STARTUP_DELAY
}

fn default_recv_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_accept_timeout() -> Duration {
    Duration::from_secs(10)
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            startup_delay: default_startup_delay(),
            recv_timeout: default_recv_timeout(),
            connect_timeout: default_recv_timeout(),
            accept_timeout: default_accept_timeout(),
        }
    }
}

/// Invocation of a process under test. Arguments are passed through
/// verbatim; environment entries are forwarded, never interpreted.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct UnderTestConfig {
    /// Executable path
    pub command: String,
    /// Extra arguments appended to the scenario's own
    pub args: Vec<String>,
    /// Environment variables (library/module search paths and the like)
    pub env: HashMap<String, String>,
}

/// Pieces of the bridged-broker scenario: two broker config files and a
/// helper publisher driven mid-scenario
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct BridgeScenarioConfig {
    /// Config file for the broker the framework talks to
    pub primary_config: String,
    /// Config file for the bridging broker
    pub secondary_config: String,
    /// Publisher helper run once the bridge is up
    pub helper_command: String,
    /// Environment for the helper
    pub helper_env: HashMap<String, String>,
}

/// TLS settings for scenarios that connect to a secure listener
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct TlsConfig {
    /// Path to the CA certificate file (PEM format)
    pub ca_cert: String,
    /// Name the server certificate must present
    #[serde(default = "default_server_name")]
    pub server_name: String,
    /// Broker configuration file that enables the secure listener
    pub broker_config: String,
}

fn default_server_name() -> String {
    "localhost".to_string()
}

impl TlsConfig {
    pub fn to_client_config(&self) -> TlsClientConfig {
        TlsClientConfig {
            ca_cert_path: self.ca_cert.clone(),
            server_name: self.server_name.clone(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file with environment variable
    /// substitution, then apply CONFORMQ_* environment overrides.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            .set_default("log.level", "warn")?
            .set_default("target.host", "127.0.0.1")?
            .set_default("target.port", 1888)?;

        // Load from file with env var substitution
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let substituted = substitute_env_vars(&content);
                builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // File doesn't exist, use defaults
            }
            Err(e) => return Err(ConfigError::Io(e)),
        }

        // Override with environment variables (CONFORMQ__TARGET__PORT, etc.)
        // Double underscore separates nested keys
        let cfg = builder
            .add_source(
                Environment::with_prefix("CONFORMQ")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a string (for testing, no env var support)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timing.recv_timeout.is_zero() {
            return Err(ConfigError::Validation(
                "recv_timeout must be nonzero".to_string(),
            ));
        }
        if self.timing.accept_timeout.is_zero() {
            return Err(ConfigError::Validation(
                "accept_timeout must be nonzero".to_string(),
            ));
        }
        Ok(())
    }
}
