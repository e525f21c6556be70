//! Configuration for the service binaries.
//!
//! Values come from positional command-line arguments, an optional TOML
//! file and built-in defaults, in that order of precedence.

use crate::protocols::postgres::query_log;
use crate::runtime::{Endpoint, DEFAULT_MAX_EVENTS};
use clap::Args;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Which binary is loading the configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Service {
    Echo,
    TcpProxy,
    PsqlProxy,
}

impl Service {
    pub fn name(self) -> &'static str {
        match self {
            Service::Echo => "echo",
            Service::TcpProxy => "tcp_proxy",
            Service::PsqlProxy => "psql_proxy",
        }
    }

    fn default_port(self) -> u16 {
        match self {
            Service::Echo | Service::TcpProxy => 1234,
            Service::PsqlProxy => 1235,
        }
    }
}

/// Flags shared by every binary.
#[derive(Args, Debug, Default)]
pub struct CommonArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// Values given positionally on the command line.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub target_host: Option<String>,
    pub target_port: Option<u16>,
    pub log_path: Option<PathBuf>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub upstream: UpstreamSection,
    #[serde(default)]
    pub query_log: QueryLogSection,
    #[serde(default)]
    pub reactor: ReactorSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

/// Listening socket
#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ServerSection {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub backlog: Option<i32>,
}

/// Proxy target
#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct UpstreamSection {
    pub host: Option<String>,
    pub port: Option<u16>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct QueryLogSection {
    pub path: Option<PathBuf>,
    pub buffer_size: Option<usize>,
    pub flush_interval_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ReactorSection {
    pub poll_timeout_ms: Option<u64>,
    pub max_events: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct LoggingSection {
    pub level: Option<String>,
}

impl TomlConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::FileRead(path.to_path_buf(), e))?;
        toml::from_str(&contents).map_err(|e| ConfigError::TomlParse(path.to_path_buf(), e))
    }
}

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_BACKLOG: i32 = 1024;
const DEFAULT_UPSTREAM_PORT: u16 = 5432;
const DEFAULT_QUERY_LOG: &str = "/tmp/query.log";
const DEFAULT_FLUSH_INTERVAL_MS: u64 = 100;
const DEFAULT_POLL_TIMEOUT_MS: u64 = 10;
const DEFAULT_LOG_LEVEL: &str = "info";

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: Endpoint,
    pub backlog: i32,
    pub upstream: Endpoint,
    pub query_log: PathBuf,
    pub query_log_capacity: usize,
    pub flush_interval: Duration,
    pub poll_timeout: Duration,
    pub max_events: usize,
    pub log_level: String,
}

impl Config {
    /// Read the file named by `--config`, if any, and merge it with the
    /// command line.
    pub fn load(
        service: Service,
        overrides: Overrides,
        common: &CommonArgs,
    ) -> Result<Self, ConfigError> {
        let file = match &common.config {
            Some(path) => TomlConfig::from_file(path)?,
            None => TomlConfig::default(),
        };
        Self::merge(service, overrides, common.log_level.clone(), file)
    }

    fn merge(
        service: Service,
        overrides: Overrides,
        log_level: Option<String>,
        file: TomlConfig,
    ) -> Result<Self, ConfigError> {
        let config = Config {
            listen: Endpoint::new(
                overrides
                    .host
                    .or(file.server.host)
                    .unwrap_or_else(|| DEFAULT_HOST.to_string()),
                overrides
                    .port
                    .or(file.server.port)
                    .unwrap_or(service.default_port()),
            ),
            backlog: file.server.backlog.unwrap_or(DEFAULT_BACKLOG),
            upstream: Endpoint::new(
                overrides
                    .target_host
                    .or(file.upstream.host)
                    .unwrap_or_else(|| DEFAULT_HOST.to_string()),
                overrides
                    .target_port
                    .or(file.upstream.port)
                    .unwrap_or(DEFAULT_UPSTREAM_PORT),
            ),
            query_log: overrides
                .log_path
                .or(file.query_log.path)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_QUERY_LOG)),
            query_log_capacity: file
                .query_log
                .buffer_size
                .unwrap_or(query_log::DEFAULT_CAPACITY),
            flush_interval: Duration::from_millis(
                file.query_log
                    .flush_interval_ms
                    .unwrap_or(DEFAULT_FLUSH_INTERVAL_MS),
            ),
            poll_timeout: Duration::from_millis(
                file.reactor
                    .poll_timeout_ms
                    .unwrap_or(DEFAULT_POLL_TIMEOUT_MS),
            ),
            max_events: file.reactor.max_events.unwrap_or(DEFAULT_MAX_EVENTS),
            log_level: log_level
                .or(file.logging.level)
                .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string()),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.query_log_capacity <= 2 {
            return Err(ConfigError::Invalid(format!(
                "query_log.buffer_size must exceed 2, got {}",
                self.query_log_capacity
            )));
        }
        if self.max_events == 0 {
            return Err(ConfigError::Invalid(
                "reactor.max_events must be positive".to_string(),
            ));
        }
        if self.backlog <= 0 {
            return Err(ConfigError::Invalid(format!(
                "server.backlog must be positive, got {}",
                self.backlog
            )));
        }
        Ok(())
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, #[source] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config =
            Config::merge(Service::Echo, Overrides::default(), None, TomlConfig::default())
                .unwrap();
        assert_eq!(config.listen.to_string(), "127.0.0.1:1234");
        assert_eq!(config.upstream.to_string(), "127.0.0.1:5432");
        assert_eq!(config.backlog, 1024);
        assert_eq!(config.query_log, PathBuf::from("/tmp/query.log"));
        assert_eq!(config.query_log_capacity, 2048);
        assert_eq!(config.flush_interval, Duration::from_millis(100));
        assert_eq!(config.poll_timeout, Duration::from_millis(10));
        assert_eq!(config.max_events, 1024);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_psql_default_port() {
        let config = Config::merge(
            Service::PsqlProxy,
            Overrides::default(),
            None,
            TomlConfig::default(),
        )
        .unwrap();
        assert_eq!(config.listen.port, 1235);
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            host = "0.0.0.0"
            port = 6000
            backlog = 64

            [upstream]
            host = "db.internal"
            port = 5433

            [query_log]
            path = "/var/log/queries.log"
            buffer_size = 65536
            flush_interval_ms = 250

            [reactor]
            poll_timeout_ms = 5
            max_events = 256

            [logging]
            level = "debug"
        "#;

        let file: TomlConfig = toml::from_str(toml_str).unwrap();
        let config = Config::merge(Service::PsqlProxy, Overrides::default(), None, file).unwrap();
        assert_eq!(config.listen.to_string(), "0.0.0.0:6000");
        assert_eq!(config.backlog, 64);
        assert_eq!(config.upstream.to_string(), "db.internal:5433");
        assert_eq!(config.query_log, PathBuf::from("/var/log/queries.log"));
        assert_eq!(config.query_log_capacity, 65536);
        assert_eq!(config.flush_interval, Duration::from_millis(250));
        assert_eq!(config.poll_timeout, Duration::from_millis(5));
        assert_eq!(config.max_events, 256);
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn test_command_line_wins() {
        let file: TomlConfig = toml::from_str(
            r#"
            [server]
            port = 6000
            [logging]
            level = "debug"
            "#,
        )
        .unwrap();
        let overrides = Overrides {
            port: Some(7000),
            target_host: Some("10.0.0.5".to_string()),
            ..Overrides::default()
        };
        let config =
            Config::merge(Service::TcpProxy, overrides, Some("warn".to_string()), file).unwrap();
        assert_eq!(config.listen.port, 7000);
        assert_eq!(config.upstream.to_string(), "10.0.0.5:5432");
        assert_eq!(config.log_level, "warn");
    }

    #[test]
    fn test_invalid_values_rejected() {
        let file: TomlConfig = toml::from_str("[query_log]\nbuffer_size = 2\n").unwrap();
        let err = Config::merge(Service::PsqlProxy, Overrides::default(), None, file).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_unknown_key_rejected() {
        assert!(toml::from_str::<TomlConfig>("[server]\nlisten = \"x\"\n").is_err());
    }

    #[test]
    fn test_missing_file() {
        let common = CommonArgs {
            config: Some(PathBuf::from("/nonexistent/relay.toml")),
            log_level: None,
        };
        let err = Config::load(Service::Echo, Overrides::default(), &common).unwrap_err();
        assert!(matches!(err, ConfigError::FileRead(..)));
        assert!(err.to_string().contains("/nonexistent/relay.toml"));
    }
}
