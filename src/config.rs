//! Configuration & CLI surface: a validated `ServerConfig` plus the
//! `clap`-derived flags that build one, covering bind address, port,
//! connection-log destination, verbosity, and log format.

use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

/// Verbosity of the structured process log. Does not affect the
/// connection log's own verbosity rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum, Default)]
#[serde(rename_all = "lowercase")]
pub enum Verbosity {
    Quiet,
    #[default]
    Default,
    Verbose,
}

impl Verbosity {
    pub fn tracing_level(self) -> tracing::Level {
        match self {
            Verbosity::Quiet => tracing::Level::WARN,
            Verbosity::Default => tracing::Level::INFO,
            Verbosity::Verbose => tracing::Level::DEBUG,
        }
    }
}

/// Process-log rendering, distinct from the connection log's fixed
/// comma-separated format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Validated server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: IpAddr,
    pub port: u16,
    pub logfile: Option<PathBuf>,
    pub verbosity: Verbosity,
    pub log_format: LogFormat,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 69,
            logfile: None,
            verbosity: Verbosity::Default,
            log_format: LogFormat::Text,
        }
    }
}

impl ServerConfig {
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }
}

/// Command-line flags. Precedence: built-in defaults, then
/// `--config` file contents, then individually-given flags, each
/// overriding the previous layer field-by-field.
#[derive(Debug, Parser)]
#[command(name = "tftpd", about = "A pluggable-storage TFTP (RFC 1350) server")]
pub struct Cli {
    /// TOML config file to load before applying the flags below.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Listening port.
    #[arg(long)]
    pub port: Option<u16>,

    /// Listening host address.
    #[arg(long)]
    pub bind: Option<IpAddr>,

    /// Connection log destination. Unset means stdout.
    #[arg(long)]
    pub logfile: Option<PathBuf>,

    /// Raise process-log verbosity to debug.
    #[arg(long, conflicts_with = "quiet")]
    pub verbose: bool,

    /// Lower process-log verbosity to warn only.
    #[arg(long, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Process-log rendering.
    #[arg(long, value_enum)]
    pub log_format: Option<LogFormat>,

    /// Write a default TOML config to this path and exit.
    #[arg(long)]
    pub init_config: Option<PathBuf>,

    /// Load and validate configuration, print the result, and exit
    /// without binding the listener.
    #[arg(long)]
    pub check_config: bool,
}

impl Cli {
    /// Fold `--config`'s file contents (if given) and then this CLI
    /// invocation's explicit flags onto [`ServerConfig::default`].
    pub fn resolve(&self) -> Result<ServerConfig, ConfigError> {
        let mut config = match &self.config {
            Some(path) => load_config(path)?,
            None => ServerConfig::default(),
        };

        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(bind) = self.bind {
            config.bind = bind;
        }
        if self.logfile.is_some() {
            config.logfile = self.logfile.clone();
        }
        if self.verbose {
            config.verbosity = Verbosity::Verbose;
        } else if self.quiet {
            config.verbosity = Verbosity::Quiet;
        }
        if let Some(format) = self.log_format {
            config.log_format = format;
        }

        Ok(config)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("could not read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("could not parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

pub fn load_config(path: &Path) -> Result<ServerConfig, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

pub fn write_default_config(path: &Path) -> Result<(), ConfigError> {
    let config = ServerConfig::default();
    let text = toml::to_string_pretty(&config)
        .map_err(|e| ConfigError::Invalid(format!("could not render default config: {e}")))?;
    std::fs::write(path, text).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })
}

/// Validate a resolved configuration before the listener binds:
/// the port must be nonzero, and a configured log file's parent
/// directory must already exist.
pub fn validate_config(config: &ServerConfig) -> Result<(), ConfigError> {
    if config.port == 0 {
        return Err(ConfigError::Invalid(
            "port must be nonzero; this server must advertise a fixed well-known port".into(),
        ));
    }
    if let Some(path) = &config.logfile {
        let parent = path.parent().filter(|p| !p.as_os_str().is_empty());
        if let Some(parent) = parent {
            if !parent.is_dir() {
                return Err(ConfigError::Invalid(format!(
                    "logfile parent directory {} does not exist",
                    parent.display()
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir() -> PathBuf {
        let mut dir = std::env::temp_dir();
        dir.push(format!("tftpd-config-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn defaults_bind_port_69() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 69);
        assert_eq!(config.logfile, None);
    }

    #[test]
    fn parses_minimal_toml() {
        let dir = temp_dir();
        let path = dir.join("tftpd.toml");
        std::fs::write(&path, "port = 6969\n").unwrap();
        let config = load_config(&path).unwrap();
        assert_eq!(config.port, 6969);
        assert_eq!(config.bind, IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    }

    #[test]
    fn cli_flag_overrides_config_file() {
        let dir = temp_dir();
        let path = dir.join("tftpd.toml");
        std::fs::write(&path, "port = 6969\n").unwrap();

        let cli = Cli {
            config: Some(path),
            port: Some(6970),
            bind: None,
            logfile: None,
            verbose: false,
            quiet: false,
            log_format: None,
            init_config: None,
            check_config: false,
        };
        let resolved = cli.resolve().unwrap();
        assert_eq!(resolved.port, 6970);
    }

    #[test]
    fn unset_flag_leaves_config_file_value() {
        let dir = temp_dir();
        let path = dir.join("tftpd.toml");
        std::fs::write(&path, "port = 6969\n").unwrap();

        let cli = Cli {
            config: Some(path),
            port: None,
            bind: None,
            logfile: None,
            verbose: false,
            quiet: false,
            log_format: None,
            init_config: None,
            check_config: false,
        };
        let resolved = cli.resolve().unwrap();
        assert_eq!(resolved.port, 6969);
    }

    #[test]
    fn rejects_zero_port() {
        let config = ServerConfig {
            port: 0,
            ..Default::default()
        };
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn rejects_logfile_with_missing_parent() {
        let config = ServerConfig {
            logfile: Some(PathBuf::from("/no/such/directory/tftpd.log")),
            ..Default::default()
        };
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn accepts_logfile_with_existing_parent() {
        let dir = temp_dir();
        let config = ServerConfig {
            logfile: Some(dir.join("tftpd.log")),
            ..Default::default()
        };
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn write_default_config_round_trips() {
        let dir = temp_dir();
        let path = dir.join("default.toml");
        write_default_config(&path).unwrap();
        let loaded = load_config(&path).unwrap();
        assert_eq!(loaded.port, ServerConfig::default().port);
    }
}
