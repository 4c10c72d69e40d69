use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use sentry::types::Dsn;
use serde::{Deserialize, Deserializer, Serialize, de};
use tracing::level_filters::LevelFilter;

/// Controls the log format
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other)
    Auto,
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
pub struct Logging {
    /// The log level for fetchcache.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
    /// When set to true, backtraces are forced on.
    pub enable_backtraces: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
            enable_backtraces: true,
        }
    }
}

/// Control the metrics.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// host/port of statsd instance
    pub statsd: Option<String>,
    /// The prefix that should be added to all metrics.
    pub prefix: String,
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
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

/// How requests interact with the persistent response cache.
///
/// Only [`ReturnCacheElseLoad`](Self::ReturnCacheElseLoad) and
/// [`ReturnCacheOnly`](Self::ReturnCacheOnly) allow responses to be persisted.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CachePolicy {
    /// Defer to whatever the protocol headers say.
    UseProtocol,
    /// Always go to the network and never persist the response.
    AlwaysLoad,
    /// Use stored data when it exists, load from the network otherwise.
    #[default]
    ReturnCacheElseLoad,
    /// Use stored data only, never touch the network.
    ReturnCacheOnly,
}

impl CachePolicy {
    /// Whether this policy is one of the two "return cache data" variants.
    pub fn returns_cache_data(self) -> bool {
        matches!(self, Self::ReturnCacheElseLoad | Self::ReturnCacheOnly)
    }
}

/// Tunables of the resource cache.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    /// Cross-fade duration used by the display layer. Not read by the cache itself.
    #[serde(with = "humantime_serde")]
    pub fade_duration: Duration,

    /// Maximum age of a persisted response before it has to be fetched again.
    ///
    /// A value of zero drops the persistent store and stops persisting responses.
    #[serde(with = "humantime_serde")]
    pub disk_cache_max_age: Duration,

    /// Timeout for a single network fetch.
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,

    /// The default policy of the transport and of requests that do not specify one.
    pub cache_policy: CachePolicy,

    /// Capacity (in bytes) of the persistent store.
    pub disk_capacity: u64,

    /// The largest fraction of [`disk_capacity`](Self::disk_capacity) a single response may
    /// occupy to be eligible for persistence.
    pub max_entry_size_fraction: f64,

    /// Keep pending observers of in-flight downloads when the memory cache is evicted.
    ///
    /// By default, eviction drops the whole entry including its waiters, which then never
    /// receive a result.
    pub retain_observers_on_evict: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            fade_duration: Duration::from_millis(100),
            disk_cache_max_age: Duration::from_secs(60 * 60 * 24 * 7),
            request_timeout: Duration::from_secs(60),
            cache_policy: CachePolicy::ReturnCacheElseLoad,
            disk_capacity: 50 * 1024 * 1024,
            max_entry_size_fraction: 0.05,
            retain_observers_on_evict: false,
        }
    }
}

/// See the README for more information on config values.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Which directory to use for the persistent response cache. Default is not to persist.
    pub cache_dir: Option<PathBuf>,

    /// Configuration for internal logging.
    pub logging: Logging,

    /// Configuration for reporting metrics to a statsd instance.
    pub metrics: Metrics,

    /// DSN to report internal errors to
    pub sentry_dsn: Option<Dsn>,

    /// Fine-tune the resource cache.
    pub caches: CacheConfig,

    /// The `Accept` header sent with every request.
    pub accept: String,

    /// The `User-Agent` header sent with every request.
    pub user_agent: String,
}

impl Config {
    /// Return a cache directory `dir`, it is joined with the configured base cache directory.
    ///
    /// If there is no base cache directory configured this means no persistence should happen
    /// and this returns None.
    pub fn cache_dir<P>(&self, dir: P) -> Option<PathBuf>
    where
        P: AsRef<Path>,
    {
        self.cache_dir.as_ref().map(|base| base.join(dir))
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            cache_dir: None,
            logging: Logging::default(),
            metrics: Metrics::default(),
            sentry_dsn: None,
            caches: CacheConfig::default(),
            accept: "*/*".to_owned(),
            user_agent: concat!("fetchcache/", env!("CARGO_PKG_VERSION")).to_owned(),
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_config_defaults() {
        let cfg = Config::get(None).unwrap();
        assert_eq!(cfg.caches, CacheConfig::default());
        assert_eq!(
            cfg.caches.disk_cache_max_age,
            Duration::from_secs(604_800)
        );
        assert_eq!(cfg.caches.request_timeout, Duration::from_secs(60));
        assert_eq!(cfg.caches.cache_policy, CachePolicy::ReturnCacheElseLoad);
        assert_eq!(cfg.caches.disk_capacity, 52_428_800);
        assert_eq!(cfg.caches.max_entry_size_fraction, 0.05);
        assert!(cfg.cache_dir.is_none());
    }

    #[test]
    fn test_partial_cache_config() {
        // Setting individual values should not affect the other defaults.
        let yaml = r#"
            caches:
              disk_cache_max_age: 1h
              cache_policy: always_load
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(cfg.caches.disk_cache_max_age, Duration::from_secs(3600));
        assert_eq!(cfg.caches.cache_policy, CachePolicy::AlwaysLoad);
        assert_eq!(cfg.caches.request_timeout, Duration::from_secs(60));
        assert_eq!(cfg.caches.disk_capacity, 50 * 1024 * 1024);
        assert!(!cfg.caches.retain_observers_on_evict);
    }

    #[test]
    fn test_zero_max_age() {
        let yaml = r#"
            caches:
              disk_cache_max_age: 0s
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(cfg.caches.disk_cache_max_age, Duration::ZERO);
    }

    #[test]
    fn test_logging_level() {
        let yaml = r#"
            logging:
              level: debug
              format: json
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(cfg.logging.level, LevelFilter::DEBUG);
        assert_eq!(cfg.logging.format, LogFormat::Json);

        let yaml = r#"
            logging:
              level: loud
        "#;
        assert!(Config::from_reader(yaml.as_bytes()).is_err());
    }

    #[test]
    fn test_cache_dir() {
        let yaml = r#"
            cache_dir: /var/cache/fetchcache
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(
            cfg.cache_dir("responses"),
            Some(PathBuf::from("/var/cache/fetchcache/responses"))
        );
        assert_eq!(Config::default().cache_dir("responses"), None);
    }

    #[test]
    fn test_returns_cache_data() {
        assert!(CachePolicy::ReturnCacheElseLoad.returns_cache_data());
        assert!(CachePolicy::ReturnCacheOnly.returns_cache_data());
        assert!(!CachePolicy::AlwaysLoad.returns_cache_data());
        assert!(!CachePolicy::UseProtocol.returns_cache_data());
    }

    #[test]
    fn test_unknown_fields() {
        // Unknown fields should not cause failure
        let yaml = r#"
            caches:
              not_a_tunable: 1h
        "#;
        let cfg = Config::from_reader(yaml.as_bytes());
        assert!(cfg.is_ok());
    }

    #[test]
    fn test_empty_file() {
        // Empty files aren't supported
        let yaml = r#""#;
        let result = Config::from_reader(yaml.as_bytes());
        assert!(result.is_err());
    }
}
