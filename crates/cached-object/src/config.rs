use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;

/// How concurrent updates with caller supplied deltas are processed.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateMode {
    /// Every delta is queued and applied in submission order.
    #[default]
    Sequential,
    /// At most one update is queued behind the running one. Concurrent requests attach to that
    /// queued update and share its single outcome; their own deltas are discarded.
    Coalesced,
}

/// Configuration of a single [`CachedObject`](crate::CachedObject).
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct CachedObjectConfig {
    /// Used in logs and as a metrics tag.
    pub name: String,

    /// Interval between automatic refreshes. `None` disables them.
    #[serde(with = "humantime_serde")]
    pub refresh_interval: Option<Duration>,

    /// Random variation applied to every refresh interval, as a fraction of it.
    ///
    /// A jitter of `0.1` spreads a `60s` interval over `54s..=66s`.
    pub refresh_jitter: f64,

    /// Interval between automatic incremental update pulls. `None` disables them.
    #[serde(with = "humantime_serde")]
    pub update_interval: Option<Duration>,

    /// Maximum duration of a single initialization attempt.
    #[serde(with = "humantime_serde")]
    pub initialize_timeout: Option<Duration>,

    /// Maximum duration of a single refresh.
    #[serde(with = "humantime_serde")]
    pub refresh_timeout: Option<Duration>,

    /// Maximum duration of a single update.
    #[serde(with = "humantime_serde")]
    pub update_timeout: Option<Duration>,

    pub update_mode: UpdateMode,
}

impl Default for CachedObjectConfig {
    fn default() -> Self {
        Self {
            name: "cached_object".into(),
            refresh_interval: None,
            refresh_jitter: 0.0,
            update_interval: None,
            initialize_timeout: None,
            refresh_timeout: None,
            update_timeout: None,
            update_mode: UpdateMode::default(),
        }
    }
}

impl CachedObjectConfig {
    pub fn get(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            ),
            None => Ok(Self::default()),
        }
    }

    pub fn from_reader(reader: impl std::io::Read) -> Result<Self> {
        from_yaml_reader(reader)
    }
}

/// Controls the log format
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// With colors
    Pretty,
    /// Simplified log output
    Simplified,
    /// Dump out JSON lines
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LevelFilter::INFO,
            format: LogFormat::Simplified,
        }
    }
}

/// Control the metrics.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// host/port of statsd instance
    pub statsd: Option<String>,
    /// The prefix that should be added to all metrics.
    pub prefix: String,
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            statsd: std::env::var("STATSD_SERVER").ok(),
            prefix: "cached_object".into(),
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Parses a YAML document, rejecting empty input.
pub fn from_yaml_reader<T: de::DeserializeOwned>(mut reader: impl std::io::Read) -> Result<T> {
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

#[derive(Debug)]
struct LevelFilterVisitor;

impl de::Visitor<'_> for LevelFilterVisitor {
    type Value = LevelFilter;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
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
