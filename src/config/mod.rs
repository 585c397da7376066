//! Configuration layer: typed settings with layered precedence (file → env).

use std::num::NonZeroUsize;
use std::path::Path;
use std::str::FromStr;

use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;


const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "riserva";
const DEFAULT_CACHE_CAPACITY: usize = 50;

/// Fully validated application settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub cache: CacheSettings,
    pub logging: LoggingSettings,
}

/// Holding-cache settings.
#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub capacity: NonZeroUsize,
}

/// Logging settings.
#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Compact,
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

/// Load settings using the configured precedence (file → environment).
///
/// Missing files are not errors; defaults apply for every unset key. An
/// explicitly supplied `config_file` must exist.
pub fn load(config_file: Option<&Path>) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = config_file {
        builder = builder.add_source(File::from(path).required(true));
    }

    builder = builder.add_source(Environment::with_prefix("RISERVA").separator("__"));

    let raw: RawSettings = builder.build()?.try_deserialize()?;
    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    cache: RawCacheSettings,
    logging: RawLoggingSettings,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    capacity: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings { cache, logging } = raw;

        let cache = build_cache_settings(cache)?;
        let logging = build_logging_settings(logging)?;

        Ok(Self { cache, logging })
    }
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let capacity = cache.capacity.unwrap_or(DEFAULT_CACHE_CAPACITY);
    let capacity = NonZeroUsize::new(capacity)
        .ok_or_else(|| LoadError::invalid("cache.capacity", "must be greater than zero"))?;

    Ok(CacheSettings { capacity })
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
