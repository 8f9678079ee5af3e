//! Configuration layer: typed settings with layered precedence (file → env).
//!
//! Sources, later ones winning:
//!
//! 1. `genpage.toml` (or `.yaml`, `.json`, …) in the working directory, if present.
//! 2. An explicit file passed to [`load`], which must exist.
//! 3. `GENPAGE__SECTION__KEY` environment variables, e.g.
//!    `GENPAGE__BACKEND__KIND=memcached`.

use std::{
    path::Path,
    str::FromStr,
    time::Duration,
};

use config::{Config, Environment, File, FileFormat};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::{
    backend::{DEFAULT_MAX_ENTRIES, DEFAULT_MAX_ITEM_BYTES, DEFAULT_POOL_SIZE},
    cache::WatchPolicy,
};

const LOCAL_CONFIG_BASENAME: &str = "genpage";
const ENV_PREFIX: &str = "GENPAGE";
const DEFAULT_TTL_SECS: u64 = 300;
const DEFAULT_MEMCACHED_ADDRESS: &str = "127.0.0.1:11211";
const DEFAULT_IO_TIMEOUT_MS: u64 = 1_000;
const DEFAULT_LOCALE: &str = "en-us";

#[derive(Debug, Clone)]
pub struct Settings {
    pub cache: CacheSettings,
    pub backend: BackendSettings,
    pub invalidation: WatchPolicy,
    pub locale: LocaleSettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub disabled: bool,
    pub key_prefix: String,
    /// Lifetime of pages wrapped with the default TTL.
    pub default_ttl: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Memory,
    Memcached,
}

#[derive(Debug, Clone)]
pub struct BackendSettings {
    pub kind: BackendKind,
    pub address: String,
    pub io_timeout: Duration,
    /// Entry limit of the in-process store.
    pub max_entries: usize,
    /// memcached connections open at once.
    pub pool_size: usize,
    /// Largest memcached value accepted in a reply.
    pub max_item_bytes: usize,
}

#[derive(Debug, Clone)]
pub struct LocaleSettings {
    pub default: String,
    pub supported: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    /// Adds a `genpage=debug` directive so cache hits, misses and keys are
    /// traced regardless of `level`.
    pub debug: bool,
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
pub fn load(config_file: Option<&Path>) -> Result<Settings, LoadError> {
    let mut builder =
        Config::builder().add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = config_file {
        builder = builder.add_source(File::from(path).required(true));
    }

    builder = builder.add_source(
        Environment::with_prefix(ENV_PREFIX)
            .separator("__")
            .try_parsing(true)
            .list_separator(",")
            .with_list_parse_key("invalidation.types")
            .with_list_parse_key("locale.supported"),
    );

    let raw: RawSettings = builder.build()?.try_deserialize()?;
    Settings::from_raw(raw)
}

/// Parses settings from a TOML document alone, ignoring files and environment.
pub fn from_toml(source: &str) -> Result<Settings, LoadError> {
    let raw: RawSettings = Config::builder()
        .add_source(File::from_str(source, FileFormat::Toml))
        .build()?
        .try_deserialize()?;
    Settings::from_raw(raw)
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            cache: CacheSettings {
                disabled: false,
                key_prefix: String::new(),
                default_ttl: Duration::from_secs(DEFAULT_TTL_SECS),
            },
            backend: BackendSettings {
                kind: BackendKind::Memory,
                address: DEFAULT_MEMCACHED_ADDRESS.to_owned(),
                io_timeout: Duration::from_millis(DEFAULT_IO_TIMEOUT_MS),
                max_entries: DEFAULT_MAX_ENTRIES,
                pool_size: DEFAULT_POOL_SIZE,
                max_item_bytes: DEFAULT_MAX_ITEM_BYTES,
            },
            invalidation: WatchPolicy::default(),
            locale: LocaleSettings {
                default: DEFAULT_LOCALE.to_owned(),
                supported: Vec::new(),
            },
            logging: LoggingSettings {
                level: LevelFilter::INFO,
                debug: false,
                format: LogFormat::Compact,
            },
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    cache: RawCacheSettings,
    backend: RawBackendSettings,
    invalidation: RawInvalidationSettings,
    locale: RawLocaleSettings,
    logging: RawLoggingSettings,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    disabled: Option<bool>,
    key_prefix: Option<String>,
    default_ttl_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawBackendSettings {
    kind: Option<String>,
    address: Option<String>,
    io_timeout_ms: Option<u64>,
    max_entries: Option<usize>,
    pool_size: Option<usize>,
    max_item_bytes: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawInvalidationSettings {
    mode: Option<String>,
    types: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLocaleSettings {
    default: Option<String>,
    supported: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    debug: Option<bool>,
    json: Option<bool>,
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            cache,
            backend,
            invalidation,
            locale,
            logging,
        } = raw;

        Ok(Self {
            cache: build_cache_settings(cache)?,
            backend: build_backend_settings(backend)?,
            invalidation: build_watch_policy(invalidation)?,
            locale: build_locale_settings(locale)?,
            logging: build_logging_settings(logging)?,
        })
    }
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let secs = cache.default_ttl_seconds.unwrap_or(DEFAULT_TTL_SECS);
    if secs == 0 {
        return Err(LoadError::invalid(
            "cache.default_ttl_seconds",
            "must be greater than zero; wrap views with a TTL of 0 to keep pages indefinitely",
        ));
    }

    Ok(CacheSettings {
        disabled: cache.disabled.unwrap_or(false),
        key_prefix: cache.key_prefix.unwrap_or_default(),
        default_ttl: Duration::from_secs(secs),
    })
}

fn build_backend_settings(backend: RawBackendSettings) -> Result<BackendSettings, LoadError> {
    let kind = match backend.kind.as_deref().map(str::to_ascii_lowercase).as_deref() {
        None | Some("memory") => BackendKind::Memory,
        Some("memcached") => BackendKind::Memcached,
        Some(other) => {
            return Err(LoadError::invalid(
                "backend.kind",
                format!("expected `memory` or `memcached`, got `{other}`"),
            ));
        }
    };

    let address = backend
        .address
        .unwrap_or_else(|| DEFAULT_MEMCACHED_ADDRESS.to_owned());
    if kind == BackendKind::Memcached && address.trim().is_empty() {
        return Err(LoadError::invalid("backend.address", "must not be empty"));
    }

    let timeout_ms = backend.io_timeout_ms.unwrap_or(DEFAULT_IO_TIMEOUT_MS);
    if timeout_ms == 0 {
        return Err(LoadError::invalid(
            "backend.io_timeout_ms",
            "must be greater than zero",
        ));
    }

    Ok(BackendSettings {
        kind,
        address,
        io_timeout: Duration::from_millis(timeout_ms),
        max_entries: positive("backend.max_entries", backend.max_entries, DEFAULT_MAX_ENTRIES)?,
        pool_size: positive("backend.pool_size", backend.pool_size, DEFAULT_POOL_SIZE)?,
        max_item_bytes: positive(
            "backend.max_item_bytes",
            backend.max_item_bytes,
            DEFAULT_MAX_ITEM_BYTES,
        )?,
    })
}

fn positive(key: &'static str, value: Option<usize>, default: usize) -> Result<usize, LoadError> {
    match value.unwrap_or(default) {
        0 => Err(LoadError::invalid(key, "must be greater than zero")),
        n => Ok(n),
    }
}

fn build_watch_policy(invalidation: RawInvalidationSettings) -> Result<WatchPolicy, LoadError> {
    if let Some(label) = invalidation
        .types
        .iter()
        .flatten()
        .find(|label| !is_entity_label(label))
    {
        return Err(LoadError::invalid(
            "invalidation.types",
            format!("`{label}` is not an `app.Model` label"),
        ));
    }

    match invalidation.mode.as_deref().map(str::to_ascii_lowercase).as_deref() {
        None | Some("watch") => Ok(WatchPolicy::watch(invalidation.types.unwrap_or_default())),
        Some("ignore") => Ok(match invalidation.types {
            Some(types) => WatchPolicy::ignore(types),
            None => WatchPolicy::ignore_internal(),
        }),
        Some(other) => Err(LoadError::invalid(
            "invalidation.mode",
            format!("expected `watch` or `ignore`, got `{other}`"),
        )),
    }
}

fn is_entity_label(label: &str) -> bool {
    label
        .split_once('.')
        .is_some_and(|(app, model)| !app.is_empty() && !model.is_empty() && !model.contains('.'))
}

fn build_locale_settings(locale: RawLocaleSettings) -> Result<LocaleSettings, LoadError> {
    let default = locale
        .default
        .unwrap_or_else(|| DEFAULT_LOCALE.to_owned())
        .trim()
        .to_ascii_lowercase();
    if default.is_empty() {
        return Err(LoadError::invalid("locale.default", "must not be empty"));
    }

    Ok(LocaleSettings {
        default,
        supported: locale.supported.unwrap_or_default(),
    })
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

    Ok(LoggingSettings {
        level,
        debug: logging.debug.unwrap_or(false),
        format,
    })
}
