use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use sentry::types::Dsn;
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;

/// How log lines are rendered on `stderr`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// `pretty` when a user is watching, `simplified` otherwise.
    Auto,
    /// Multi-line, colored output.
    Pretty,
    /// One line per event, without colors.
    Simplified,
    /// One JSON object per line.
    Json,
}

/// Log level and format of the cache and its tools.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The log level for the fetch cache.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
        }
    }
}

/// Statsd reporting.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// `host:port` of the statsd server. Defaults to `$STATSD_SERVER`, reporting is off
    /// without it.
    pub statsd: Option<String>,
    /// Prepended to every metric name.
    pub prefix: String,
    /// Tags sent with every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "fetchcache".into(),
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Fine-tuning of the two cache tiers and the startup purge.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct CacheConfigs {
    /// Maximum number of entries held by the in-memory tier.
    ///
    /// Defaults to `10_000`.
    pub in_memory_capacity: u64,

    /// How long after startup the purge of expired persistent entries runs.
    ///
    /// Defaults to `5s`.
    #[serde(with = "humantime_serde")]
    pub purge_delay: Duration,

    /// A startup purge is skipped if another one ran less than this long ago.
    ///
    /// Defaults to `1m`.
    #[serde(with = "humantime_serde")]
    pub purge_guard: Duration,
}

impl Default for CacheConfigs {
    fn default() -> Self {
        Self {
            in_memory_capacity: 10_000,
            purge_delay: Duration::from_secs(5),
            purge_guard: Duration::from_secs(60),
        }
    }
}

/// Timeouts of the default HTTP transport.
///
/// The cache itself has no timeout layer, a hung transport call leaves its waiters pending.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct TransportConfig {
    /// The timeout for establishing a connection.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// The total timeout of a single request.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Which directory to use for the persistent tier. Default is to keep everything in memory.
    pub cache_dir: Option<PathBuf>,

    /// The identifier of the running build.
    ///
    /// Persisted entries written by a different build are purged before the first read.
    pub build: String,

    /// Prefix of every persisted payload key.
    pub key_prefix: String,

    /// Fine-tune cache tiers and purging.
    pub caches: CacheConfigs,

    /// Timeouts of the HTTP transport.
    pub transport: TransportConfig,

    /// Configuration for internal logging.
    pub logging: Logging,

    /// Configuration for reporting metrics to a statsd instance.
    pub metrics: Metrics,

    /// DSN to report internal errors to
    pub sentry_dsn: Option<Dsn>,
}

/// Default value for the "build" configuration.
fn default_build() -> String {
    option_env!("FETCHCACHE_BUILD")
        .unwrap_or(env!("CARGO_PKG_VERSION"))
        .to_owned()
}

impl Default for Config {
    fn default() -> Self {
        Config {
            cache_dir: None,
            build: default_build(),
            key_prefix: "fetchcache:".to_owned(),
            caches: CacheConfigs::default(),
            transport: TransportConfig::default(),
            logging: Logging::default(),
            metrics: Metrics::default(),
            sentry_dsn: None,
        }
    }
}

impl Config {
    pub fn get(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            ),
            None => Ok(Config::default()),
        }
    }

    fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading config file")?;
        // check for empty files explicitly
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        serde_yaml::from_str(&config).context("failed to parse config YAML")
    }
}

#[derive(Debug)]
struct LevelFilterVisitor;

impl de::Visitor<'_> for LevelFilterVisitor {
    type Value = LevelFilter;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> std::fmt::Result {
        write!(
            formatter,
            r#"one of the strings "off", "error", "warn", "info", "debug", or "trace""#
        )
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        match v {
            "off" => Ok(LevelFilter::OFF),
            "error" => Ok(LevelFilter::ERROR),
            "warn" => Ok(LevelFilter::WARN),
            "info" => Ok(LevelFilter::INFO),
            "debug" => Ok(LevelFilter::DEBUG),
            "trace" => Ok(LevelFilter::TRACE),
            _ => Err(de::Error::unknown_variant(
                v,
                &["off", "error", "warn", "info", "debug", "trace"],
            )),
        }
    }
}

fn deserialize_level_filter<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<LevelFilter, D::Error> {
    deserializer.deserialize_str(LevelFilterVisitor)
}
