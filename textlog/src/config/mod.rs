//! Configuration for the `textlog` binary.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/textlog/config.toml`)
//! 4. Compiled defaults
//!
//! Missing config file is not an error (defaults are used). An explicit
//! `--config` path that doesn't exist is an error.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::channel::SessionConfig;

const SECS_PER_DAY: u64 = 24 * 60 * 60;

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse the TOML configuration.
    #[error("failed to parse config file: {0}")]
    ParseToml(#[from] toml::de::Error),
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    store: StoreFileConfig,
    session: SessionFileConfig,
}

/// `[store]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct StoreFileConfig {
    path: Option<PathBuf>,
    retention_days: Option<u64>,
}

/// `[session]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct SessionFileConfig {
    step_timeout_secs: Option<u64>,
    signal_buffer: Option<usize>,
}

// ---------------------------------------------------------------------------
// Resolved configuration
// ---------------------------------------------------------------------------

/// Fully resolved configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextlogConfig {
    /// SQLite index location.
    pub store_path: PathBuf,
    /// Per-session tunables, including the sweep retention.
    pub session: SessionConfig,
}

impl Default for TextlogConfig {
    fn default() -> Self {
        Self {
            store_path: default_store_path(),
            session: SessionConfig::default(),
        }
    }
}

impl TextlogConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the explicit config file cannot be read
    /// or if any config file present cannot be parsed.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Ok(Self::resolve(cli, &file))
    }

    /// Priority: CLI > file > default.
    fn resolve(cli: &CliArgs, file: &ConfigFile) -> Self {
        let defaults = Self::default();

        let retention = cli
            .retention_days
            .or(file.store.retention_days)
            .map_or(defaults.session.retention, |days| {
                Duration::from_secs(days.saturating_mul(SECS_PER_DAY))
            });
        // 0 disables the watchdog.
        let step_timeout = file
            .session
            .step_timeout_secs
            .map_or(defaults.session.step_timeout, |secs| {
                (secs > 0).then(|| Duration::from_secs(secs))
            });

        Self {
            store_path: cli
                .db
                .clone()
                .or_else(|| file.store.path.clone())
                .unwrap_or(defaults.store_path),
            session: SessionConfig {
                step_timeout,
                signal_buffer: file
                    .session
                    .signal_buffer
                    .unwrap_or(defaults.session.signal_buffer),
                retention,
            },
        }
    }
}

/// Options shared by every subcommand.
#[derive(clap::Args, Debug, Default)]
pub struct CliArgs {
    /// Path to config file (default: `~/.config/textlog/config.toml`).
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Path to the SQLite index.
    #[arg(long, env = "TEXTLOG_DB", global = true)]
    pub db: Option<PathBuf>,

    /// Days a pending entry may stay unacknowledged before the sweep
    /// acknowledges it.
    #[arg(long, global = true)]
    pub retention_days: Option<u64>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "TEXTLOG_LOG", global = true)]
    pub log_level: String,

    /// Path to log file (default: stderr).
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

fn default_store_path() -> PathBuf {
    dirs::data_dir().map_or_else(
        || PathBuf::from("index.sqlite"),
        |dir| dir.join("textlog").join("index.sqlite"),
    )
}

/// Load and parse a TOML config file.
///
/// If `explicit_path` is `Some`, the file must exist (error if not).
/// If `explicit_path` is `None`, the default path is tried and missing file
/// is treated as empty config.
fn load_config_file(explicit_path: Option<&Path>) -> Result<ConfigFile, ConfigError> {
    let path = if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    } else {
        let Some(config_dir) = dirs::config_dir() else {
            return Ok(ConfigFile::default());
        };
        config_dir.join("textlog").join("config.toml")
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
