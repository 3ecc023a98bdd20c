//! Configuration module for the multiplexing server.
//!
//! The bind address and port are positional command-line arguments. Tuning
//! knobs come from optional flags or an optional TOML file; CLI values take
//! precedence over file values, which take precedence over defaults.

use clap::error::ErrorKind;
use clap::{CommandFactory, Parser};
use serde::Deserialize;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments for the server
#[derive(Parser, Debug)]
#[command(name = "server")]
#[command(version = "0.1.0")]
#[command(about = "A readiness-multiplexed one-shot TCP server", long_about = None)]
pub struct CliArgs {
    /// IPv4 address to bind to
    pub host: Ipv4Addr,

    /// Port to listen on
    pub port: u16,

    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Maximum number of simultaneously registered connections
    #[arg(short = 'm', long)]
    pub max_connections: Option<usize>,

    /// Maximum bytes taken from a single request; the rest is ignored
    #[arg(short = 'r', long)]
    pub max_request_size: Option<usize>,

    /// Close connections idle for this many milliseconds (0 = never)
    #[arg(short = 't', long)]
    pub idle_timeout_ms: Option<u64>,

    /// Listen backlog
    #[arg(short = 'b', long)]
    pub backlog: Option<i32>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Registry capacity; derived from the descriptor limit when absent
    pub max_connections: Option<usize>,
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    #[serde(default = "default_max_request_size")]
    pub max_request_size: usize,
    /// Idle timeout in milliseconds (0 = disabled)
    #[serde(default)]
    pub idle_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_connections: None,
            backlog: default_backlog(),
            max_request_size: default_max_request_size(),
            idle_timeout_ms: 0,
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

fn default_backlog() -> i32 {
    50
}

fn default_max_request_size() -> usize {
    10_000
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Capacity used when the descriptor limit cannot be read (classic `FD_SETSIZE`).
const FALLBACK_MAX_CONNECTIONS: usize = 1024;

/// Descriptors kept back for stdio, the listener and the poller itself.
const RESERVED_DESCRIPTORS: usize = 16;

/// Derive the registry capacity from the soft `RLIMIT_NOFILE` limit.
fn default_max_connections() -> usize {
    let mut limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    let ret = unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) };
    if ret != 0 || limit.rlim_cur == libc::RLIM_INFINITY {
        return FALLBACK_MAX_CONNECTIONS;
    }

    let soft = usize::try_from(limit.rlim_cur).unwrap_or(usize::MAX);
    match soft.checked_sub(RESERVED_DESCRIPTORS) {
        Some(n) if n > 0 => n,
        _ => FALLBACK_MAX_CONNECTIONS,
    }
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: SocketAddrV4,
    pub max_connections: usize,
    pub max_request_size: usize,
    pub idle_timeout: Option<Duration>,
    pub backlog: i32,
    pub log_level: String,
}

impl Config {
    /// Load configuration from the process arguments and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(std::env::args_os())
    }

    /// Load configuration from an explicit argument list.
    ///
    /// A wrong number of positional arguments yields `ConfigError::Usage`,
    /// which the caller reports without treating it as a failure.
    pub fn from_args<I, T>(args: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString>,
    {
        let args: Vec<std::ffi::OsString> = args.into_iter().map(Into::into).collect();
        if let Some(count) = positional_count(&args) {
            if count != POSITIONAL_ARGS {
                return Err(ConfigError::Usage(usage()));
            }
        }

        let cli = match CliArgs::try_parse_from(args) {
            Ok(cli) => cli,
            Err(e) => match e.kind() {
                ErrorKind::MissingRequiredArgument
                | ErrorKind::UnknownArgument
                | ErrorKind::TooManyValues => {
                    return Err(ConfigError::Usage(usage()));
                }
                _ => return Err(ConfigError::Cli(e)),
            },
        };

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

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let server = toml_config.server;

        let max_connections = cli
            .max_connections
            .or(server.max_connections)
            .unwrap_or_else(default_max_connections);
        if max_connections == 0 {
            return Err(ConfigError::Invalid("max_connections must be at least 1"));
        }

        let max_request_size = cli.max_request_size.unwrap_or(server.max_request_size);
        if max_request_size == 0 {
            return Err(ConfigError::Invalid("max_request_size must be at least 1"));
        }

        let backlog = cli.backlog.unwrap_or(server.backlog);
        if backlog <= 0 {
            return Err(ConfigError::Invalid("backlog must be positive"));
        }

        let idle_timeout = match cli.idle_timeout_ms.unwrap_or(server.idle_timeout_ms) {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        };

        Ok(Config {
            listen: SocketAddrV4::new(cli.host, cli.port),
            max_connections,
            max_request_size,
            idle_timeout,
            backlog,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        })
    }
}

/// Host and port.
const POSITIONAL_ARGS: usize = 2;

/// Flags that take no value.
const SWITCHES: &[&str] = &["-h", "--help", "-V", "--version"];

/// Count positional arguments without interpreting their values.
///
/// Returns `None` when help or version output was requested, which clap
/// handles regardless of the positional count.
fn positional_count(args: &[std::ffi::OsString]) -> Option<usize> {
    let mut count = 0;
    let mut rest = args.iter().skip(1).map(|a| a.to_string_lossy());
    while let Some(arg) = rest.next() {
        if arg == "--" {
            return Some(count + rest.count());
        }
        if SWITCHES.contains(&&*arg) {
            return None;
        }
        if let Some(long) = arg.strip_prefix("--") {
            if !long.contains('=') {
                rest.next();
            }
        } else if arg.len() > 1 && arg.starts_with('-') {
            // Short options carry their value attached (`-m5`) or as the next argument.
            if arg.len() == 2 {
                rest.next();
            }
        } else {
            count += 1;
        }
    }
    Some(count)
}

/// Render the one-line usage message.
pub fn usage() -> String {
    CliArgs::command().render_usage().to_string()
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    /// Wrong positional argument count; carries the usage text.
    Usage(String),
    Cli(clap::Error),
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    Invalid(&'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Usage(usage) => write!(f, "{usage}"),
            ConfigError::Cli(e) => write!(f, "{e}"),
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
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
        let config = TomlConfig::default();
        assert_eq!(config.server.backlog, 50);
        assert_eq!(config.server.max_request_size, 10_000);
        assert_eq!(config.server.idle_timeout_ms, 0);
        assert!(config.server.max_connections.is_none());
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            max_connections = 256
            backlog = 128
            max_request_size = 4096
            idle_timeout_ms = 5000

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.max_connections, Some(256));
        assert_eq!(config.server.backlog, 128);
        assert_eq!(config.server.max_request_size, 4096);
        assert_eq!(config.server.idle_timeout_ms, 5000);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_positional_args() {
        let config = Config::from_args(["server", "127.0.0.1", "8080"]).unwrap();
        assert_eq!(config.listen, "127.0.0.1:8080".parse::<SocketAddrV4>().unwrap());
        assert_eq!(config.max_request_size, 10_000);
        assert_eq!(config.backlog, 50);
        assert!(config.idle_timeout.is_none());
        assert!(config.max_connections > 0);
    }

    #[test]
    fn test_wrong_arg_count_is_usage() {
        for args in [
            vec!["server"],
            vec!["server", "127.0.0.1"],
            vec!["server", "127.0.0.1", "8080", "extra"],
            vec!["server", "8080"],
            vec!["server", "not-an-ip"],
            vec!["server", "127.0.0.1", "--max-connections", "4"],
            vec!["server", "127.0.0.1", "8080", "--", "9090"],
        ] {
            match Config::from_args(args) {
                Err(ConfigError::Usage(text)) => assert!(text.contains("server")),
                other => panic!("unexpected: {:?}", other),
            }
        }
    }

    #[test]
    fn test_option_values_are_not_positionals() {
        let config = Config::from_args([
            "server",
            "--max-connections",
            "4",
            "127.0.0.1",
            "-r16",
            "--backlog=8",
            "-t",
            "100",
            "8080",
        ])
        .unwrap();
        assert_eq!(config.listen, "127.0.0.1:8080".parse::<SocketAddrV4>().unwrap());
        assert_eq!(config.max_connections, 4);
        assert_eq!(config.max_request_size, 16);
        assert_eq!(config.backlog, 8);
        assert_eq!(config.idle_timeout, Some(Duration::from_millis(100)));
    }

    #[test]
    fn test_help_is_left_to_clap() {
        match Config::from_args(["server", "--help"]) {
            Err(ConfigError::Cli(e)) => assert_eq!(e.kind(), ErrorKind::DisplayHelp),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_invalid_values_are_errors() {
        assert!(matches!(
            Config::from_args(["server", "not-an-ip", "8080"]),
            Err(ConfigError::Cli(_))
        ));
        assert!(matches!(
            Config::from_args(["server", "127.0.0.1", "70000"]),
            Err(ConfigError::Cli(_))
        ));
        assert!(matches!(
            Config::from_args(["server", "127.0.0.1", "8080", "--max-connections", "0"]),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_cli_overrides() {
        let config = Config::from_args([
            "server",
            "0.0.0.0",
            "9000",
            "--max-connections",
            "2",
            "--max-request-size",
            "16",
            "--idle-timeout-ms",
            "250",
        ])
        .unwrap();
        assert_eq!(config.max_connections, 2);
        assert_eq!(config.max_request_size, 16);
        assert_eq!(config.idle_timeout, Some(Duration::from_millis(250)));
    }

    #[test]
    fn test_cli_takes_precedence_over_toml() {
        let cli = CliArgs::try_parse_from(["server", "127.0.0.1", "1", "--backlog", "7"]).unwrap();
        let toml_config: TomlConfig = toml::from_str(
            r#"
            [server]
            backlog = 99
            max_connections = 3
            "#,
        )
        .unwrap();

        let config = Config::merge(cli, toml_config).unwrap();
        assert_eq!(config.backlog, 7);
        assert_eq!(config.max_connections, 3);
    }
}
