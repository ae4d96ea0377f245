//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{num::NonZeroUsize, path::PathBuf, str::FromStr, time::Duration};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::infra::persist::{CURRENT_VERSION, DEFAULT_KEY};

mod cli;

pub use cli::{CliArgs, Command, Overrides, PurgeArgs, SessionArgs};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "querysync";
const ENV_PREFIX: &str = "QUERYSYNC";
const DEFAULT_KEEP_UNUSED_FOR_SECS: u64 = 60;
const DEFAULT_MAX_IDLE_ENTRIES: usize = 256;
const DEFAULT_PERSISTENCE_DIR: &str = ".querysync";

#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub cache: CacheSettings,
    pub persistence: PersistenceSettings,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub default_ttl: Option<Duration>,
    pub keep_unused_for: Duration,
    pub max_idle_entries: NonZeroUsize,
    pub serializable_check: bool,
    pub ignored_actions: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct PersistenceSettings {
    pub enabled: bool,
    pub directory: PathBuf,
    pub key: String,
    pub version: u32,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Resolve configuration from files, environment, and CLI overrides.
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    if let Some(command) = cli.command.as_ref() {
        raw.apply_overrides(command.overrides());
    }

    Settings::from_raw(raw)
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        Ok(Self {
            logging: build_logging_settings(raw.logging)?,
            cache: build_cache_settings(raw.cache)?,
            persistence: build_persistence_settings(raw.persistence)?,
        })
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            logging: LoggingSettings {
                level: LevelFilter::INFO,
                format: LogFormat::Compact,
            },
            cache: CacheSettings {
                default_ttl: None,
                keep_unused_for: Duration::from_secs(DEFAULT_KEEP_UNUSED_FOR_SECS),
                max_idle_entries: NonZeroUsize::new(DEFAULT_MAX_IDLE_ENTRIES)
                    .unwrap_or(NonZeroUsize::MIN),
                serializable_check: true,
                ignored_actions: Vec::new(),
            },
            persistence: PersistenceSettings {
                enabled: false,
                directory: PathBuf::from(DEFAULT_PERSISTENCE_DIR),
                key: DEFAULT_KEY.to_string(),
                version: CURRENT_VERSION,
            },
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    cache: RawCacheSettings,
    persistence: RawPersistenceSettings,
}

impl RawSettings {
    fn apply_overrides(&mut self, overrides: &Overrides) {
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(directory) = overrides.persistence_directory.as_ref() {
            self.persistence.directory = Some(directory.clone());
            self.persistence.enabled = Some(true);
        }
        if let Some(key) = overrides.persistence_key.as_ref() {
            self.persistence.key = Some(key.clone());
        }
        if let Some(version) = overrides.persistence_version {
            self.persistence.version = Some(version);
        }
    }
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let default_ttl = match cache.default_ttl_seconds {
        Some(0) => {
            return Err(LoadError::invalid(
                "cache.default_ttl_seconds",
                "must be greater than zero; omit it to disable expiry",
            ));
        }
        Some(seconds) => Some(Duration::from_secs(seconds)),
        None => None,
    };

    // Zero is allowed and evicts as soon as the last subscriber leaves.
    let keep_unused_for = Duration::from_secs(
        cache
            .keep_unused_for_seconds
            .unwrap_or(DEFAULT_KEEP_UNUSED_FOR_SECS),
    );

    let max_idle_entries = non_zero_usize(
        cache.max_idle_entries.unwrap_or(DEFAULT_MAX_IDLE_ENTRIES),
        "cache.max_idle_entries",
    )?;

    let mut ignored_actions = Vec::with_capacity(cache.ignored_actions.len());
    for action in cache.ignored_actions {
        let trimmed = action.trim();
        if trimmed.is_empty() {
            return Err(LoadError::invalid(
                "cache.ignored_actions",
                "action types must not be blank",
            ));
        }
        ignored_actions.push(trimmed.to_string());
    }

    Ok(CacheSettings {
        default_ttl,
        keep_unused_for,
        max_idle_entries,
        serializable_check: cache.serializable_check.unwrap_or(true),
        ignored_actions,
    })
}

fn build_persistence_settings(
    persistence: RawPersistenceSettings,
) -> Result<PersistenceSettings, LoadError> {
    let directory = persistence
        .directory
        .unwrap_or_else(|| PathBuf::from(DEFAULT_PERSISTENCE_DIR));
    if directory.as_os_str().is_empty() {
        return Err(LoadError::invalid(
            "persistence.directory",
            "must not be empty",
        ));
    }

    let key = persistence
        .key
        .map(|key| key.trim().to_string())
        .unwrap_or_else(|| DEFAULT_KEY.to_string());
    if key.is_empty() {
        return Err(LoadError::invalid("persistence.key", "must not be blank"));
    }

    Ok(PersistenceSettings {
        enabled: persistence.enabled.unwrap_or(false),
        directory,
        key,
        version: persistence.version.unwrap_or(CURRENT_VERSION),
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    default_ttl_seconds: Option<u64>,
    keep_unused_for_seconds: Option<u64>,
    max_idle_entries: Option<usize>,
    serializable_check: Option<bool>,
    ignored_actions: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawPersistenceSettings {
    enabled: Option<bool>,
    directory: Option<PathBuf>,
    key: Option<String>,
    version: Option<u32>,
}

fn non_zero_usize(value: usize, key: &'static str) -> Result<NonZeroUsize, LoadError> {
    NonZeroUsize::new(value).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}
