//! Configuration module for switchyard.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::time::Duration;

/// Service exposed on the listening socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Mode {
    /// Raw byte relay to a fixed backend.
    Proxy,
    /// Length-prefixed frame echo.
    FramedEcho,
    /// HTTP demo router.
    Http,
    /// Plain byte echo on the tokio runtime.
    Echo,
}

impl Mode {
    fn default_port(self) -> u16 {
        match self {
            Mode::Proxy => 9000,
            Mode::FramedEcho | Mode::Http | Mode::Echo => 8080,
        }
    }
}

/// Completion reactor backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RuntimeType {
    /// Readiness (epoll/kqueue) driven completions via mio.
    Mio,
    /// Linux io_uring.
    IoUring,
}

/// Command-line arguments for the gateway
#[derive(Parser, Debug, Default)]
#[command(name = "switchyard")]
#[command(version = "0.1.0")]
#[command(about = "A completion-driven TCP relay gateway", long_about = None)]
pub struct CliArgs {
    /// Address to listen on (e.g., 127.0.0.1)
    pub address: Option<String>,

    /// Port to listen on (0-65535)
    pub port: Option<u16>,

    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Service to run on the listening socket
    #[arg(short, long, value_enum)]
    pub mode: Option<Mode>,

    /// Backend address for proxy mode (e.g., 127.0.0.1:8080)
    #[arg(short, long)]
    pub backend: Option<String>,

    /// Number of worker threads blocked on the reactor
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Reactor backend
    #[arg(short, long, value_enum)]
    pub runtime: Option<RuntimeType>,

    /// Size of a single receive buffer and of a single send chunk
    #[arg(long)]
    pub buffer_size: Option<usize>,

    /// Bound on every blocking wait, so shutdown is observed
    #[arg(long)]
    pub poll_timeout_ms: Option<u64>,

    /// Timeout for dialing the backend
    #[arg(long)]
    pub connect_timeout_ms: Option<u64>,

    /// io_uring submission queue entries
    #[arg(long)]
    pub ring_size: Option<u32>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener and runtime configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_address")]
    pub address: String,
    pub port: Option<u16>,
    #[serde(default = "default_mode")]
    pub mode: Mode,
    #[serde(default = "default_runtime")]
    pub runtime: RuntimeType,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
    #[serde(default = "default_ring_size")]
    pub ring_size: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            port: None,
            mode: default_mode(),
            runtime: default_runtime(),
            workers: default_workers(),
            buffer_size: default_buffer_size(),
            poll_timeout_ms: default_poll_timeout_ms(),
            ring_size: default_ring_size(),
        }
    }
}

/// Proxy backend configuration
#[derive(Debug, Deserialize)]
pub struct BackendConfig {
    #[serde(default = "default_backend")]
    pub address: String,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            address: default_backend(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
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

fn default_address() -> String {
    "127.0.0.1".to_string()
}

fn default_mode() -> Mode {
    Mode::Proxy
}

fn default_runtime() -> RuntimeType {
    RuntimeType::Mio
}

fn default_workers() -> usize {
    2
}

fn default_buffer_size() -> usize {
    4096
}

fn default_poll_timeout_ms() -> u64 {
    1000
}

fn default_ring_size() -> u32 {
    1024
}

fn default_backend() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub mode: Mode,
    pub runtime: RuntimeType,
    pub listen: SocketAddr,
    pub backend: SocketAddr,
    pub workers: usize,
    pub buffer_size: usize,
    pub poll_timeout: Duration,
    pub connect_timeout: Duration,
    pub ring_size: u32,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Self::merge(cli, toml_config)
    }

    /// Merge CLI args over a parsed TOML file and validate the result.
    pub fn merge(cli: CliArgs, file: TomlConfig) -> Result<Self, ConfigError> {
        let mode = cli.mode.unwrap_or(file.server.mode);
        let address = cli.address.unwrap_or(file.server.address);
        let port = cli
            .port
            .or(file.server.port)
            .unwrap_or_else(|| mode.default_port());

        let listen = resolve(&format!("{address}:{port}"))?;
        let backend = resolve(&cli.backend.unwrap_or(file.backend.address))?;

        let workers = cli.workers.unwrap_or(file.server.workers);
        if workers == 0 {
            return Err(ConfigError::Invalid("workers must be at least 1"));
        }

        let buffer_size = cli.buffer_size.unwrap_or(file.server.buffer_size);
        if buffer_size == 0 {
            return Err(ConfigError::Invalid("buffer_size must be non-zero"));
        }

        let poll_timeout_ms = cli.poll_timeout_ms.unwrap_or(file.server.poll_timeout_ms);
        if poll_timeout_ms == 0 {
            return Err(ConfigError::Invalid("poll_timeout_ms must be non-zero"));
        }

        Ok(Config {
            mode,
            runtime: cli.runtime.unwrap_or(file.server.runtime),
            listen,
            backend,
            workers,
            buffer_size,
            poll_timeout: Duration::from_millis(poll_timeout_ms),
            connect_timeout: Duration::from_millis(
                cli.connect_timeout_ms
                    .unwrap_or(file.backend.connect_timeout_ms),
            ),
            ring_size: cli.ring_size.unwrap_or(file.server.ring_size),
            log_level: cli.log_level.unwrap_or(file.logging.level),
        })
    }

    /// Loopback configuration on an ephemeral port, used by the runtime tests.
    #[cfg(test)]
    pub fn local(mode: Mode) -> Self {
        Config {
            mode,
            runtime: RuntimeType::Mio,
            listen: "127.0.0.1:0".parse().unwrap(),
            backend: "127.0.0.1:8080".parse().unwrap(),
            workers: 2,
            buffer_size: 4096,
            poll_timeout: Duration::from_millis(50),
            connect_timeout: Duration::from_secs(2),
            ring_size: 256,
            log_level: "debug".to_string(),
        }
    }
}

fn resolve(addr: &str) -> Result<SocketAddr, ConfigError> {
    addr.to_socket_addrs()
        .ok()
        .and_then(|mut addrs| addrs.next())
        .ok_or_else(|| ConfigError::InvalidAddress(addr.to_string()))
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    InvalidAddress(String),
    Invalid(&'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::InvalidAddress(addr) => write!(f, "Invalid address '{addr}'"),
            ConfigError::Invalid(reason) => write!(f, "Invalid configuration: {reason}"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::merge(CliArgs::default(), TomlConfig::default()).unwrap();
        assert_eq!(config.mode, Mode::Proxy);
        assert_eq!(config.listen, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(config.backend, "127.0.0.1:8080".parse().unwrap());
        assert_eq!(config.workers, 2);
        assert_eq!(config.buffer_size, 4096);
        assert_eq!(config.runtime, RuntimeType::Mio);
    }

    #[test]
    fn test_mode_default_port() {
        let cli = CliArgs {
            mode: Some(Mode::Http),
            ..Default::default()
        };
        let config = Config::merge(cli, TomlConfig::default()).unwrap();
        assert_eq!(config.listen.port(), 8080);
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            address = "0.0.0.0"
            port = 9100
            mode = "framed-echo"
            runtime = "io-uring"
            workers = 4

            [backend]
            address = "127.0.0.1:7000"

            [logging]
            level = "debug"
        "#;

        let file: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(file.server.mode, Mode::FramedEcho);
        assert_eq!(file.server.runtime, RuntimeType::IoUring);

        let config = Config::merge(CliArgs::default(), file).unwrap();
        assert_eq!(config.listen, "0.0.0.0:9100".parse().unwrap());
        assert_eq!(config.backend, "127.0.0.1:7000".parse().unwrap());
        assert_eq!(config.workers, 4);
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn test_cli_overrides_toml() {
        let file: TomlConfig = toml::from_str("[server]\nport = 9100\nworkers = 4\n").unwrap();
        let cli = CliArgs {
            address: Some("127.0.0.1".to_string()),
            port: Some(9200),
            workers: Some(8),
            ..Default::default()
        };
        let config = Config::merge(cli, file).unwrap();
        assert_eq!(config.listen.port(), 9200);
        assert_eq!(config.workers, 8);
    }

    #[test]
    fn test_positional_port_range() {
        assert!(CliArgs::try_parse_from(["switchyard", "127.0.0.1", "65535"]).is_ok());
        assert!(CliArgs::try_parse_from(["switchyard", "127.0.0.1", "65536"]).is_err());
        assert!(CliArgs::try_parse_from(["switchyard", "127.0.0.1", "-1"]).is_err());
    }

    #[test]
    fn test_invalid_values() {
        let cli = CliArgs {
            workers: Some(0),
            ..Default::default()
        };
        assert!(matches!(
            Config::merge(cli, TomlConfig::default()),
            Err(ConfigError::Invalid(_))
        ));

        let cli = CliArgs {
            backend: Some("not an address".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            Config::merge(cli, TomlConfig::default()),
            Err(ConfigError::InvalidAddress(_))
        ));
    }
}
