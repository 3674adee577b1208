use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

/// Controls the log format.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other).
    Auto,
    /// With colors.
    Pretty,
    /// Simplified log output.
    Simplified,
    /// Dump out JSON lines.
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The log level filter, `RUST_LOG` syntax.
    pub level: String,
    /// Controls the log format.
    pub format: LogFormat,
    /// When set to true, backtraces are forced on.
    pub enable_backtraces: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: "info".into(),
            format: LogFormat::Auto,
            enable_backtraces: true,
        }
    }
}

/// Tuning for the memcached cluster client.
#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(default)]
pub struct MemcachedConfig {
    /// The timeout for establishing a connection to a node.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// The timeout for a single get/set/delete round-trip.
    #[serde(with = "humantime_serde")]
    pub op_timeout: Duration,

    /// Idle connections kept per node.
    pub pool_size: usize,

    /// Consecutive errors after which a node is declared down.
    pub failure_threshold: u32,

    /// How long a down node is skipped before it is probed again.
    #[serde(with = "humantime_serde")]
    pub retry_dead_after: Duration,
}

impl Default for MemcachedConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(500),
            op_timeout: Duration::from_secs(1),
            pool_size: 4,
            failure_threshold: 3,
            retry_dead_after: Duration::from_secs(10),
        }
    }
}

/// Runtime configuration for one rampart instance.
///
/// Loaded from an optional YAML file; the command line overrides the
/// `upstream`, `memcached`, `port` and `metrics_port` fields afterwards.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Origin base URL (`host:port/path`); `http://` is prepended if the
    /// scheme is absent.
    pub upstream: Option<String>,

    /// Memcached cluster nodes as `host:port`.
    pub memcached: Vec<String>,

    /// Listen port of the reverse proxy.
    pub port: u16,

    /// Listen port of the metrics endpoint, if any.
    pub metrics_port: Option<u16>,

    /// Configuration for internal logging.
    pub logging: Logging,

    /// Tuning for the memcached client.
    pub memcached_client: MemcachedConfig,

    /// Total timeout for one origin request, headers and body.
    #[serde(with = "humantime_serde")]
    pub origin_timeout: Duration,

    /// Expiry of the advisory refresh lock, so a crashed updater cannot
    /// wedge a fingerprint.
    #[serde(with = "humantime_serde")]
    pub lock_ttl: Duration,

    /// Query parameter keys removed during canonicalisation (exact match).
    pub strip_params: BTreeSet<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            upstream: None,
            memcached: vec!["localhost:11211".into()],
            port: 8080,
            metrics_port: None,
            logging: Logging::default(),
            memcached_client: MemcachedConfig::default(),
            origin_timeout: Duration::from_secs(30),
            lock_ttl: Duration::from_secs(30),
            strip_params: BTreeSet::new(),
        }
    }
}

/// An error loading or validating the configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to open configuration file")]
    Io(#[from] std::io::Error),
    #[error("failed to parse YAML")]
    Parsing(#[from] serde_yaml::Error),
}

impl Config {
    /// Loads the config from a path or returns the default config.
    pub fn get(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::from_reader(fs::File::open(path)?),
            None => Ok(Config::default()),
        }
    }

    fn from_reader(reader: impl std::io::Read) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_reader(reader)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = Config::get(None).unwrap();
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.memcached, vec!["localhost:11211".to_string()]);
        assert_eq!(cfg.origin_timeout, Duration::from_secs(30));
        assert_eq!(cfg.lock_ttl, Duration::from_secs(30));
        assert!(cfg.metrics_port.is_none());
    }

    #[test]
    fn test_partial_overrides_keep_other_defaults() {
        let yaml = r#"
            upstream: backend.internal:9000/api
            memcached:
              - cache-1:11211
              - cache-2:11211
            origin_timeout: 5s
            strip_params:
              - utm_source
              - utm_medium
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(cfg.upstream.as_deref(), Some("backend.internal:9000/api"));
        assert_eq!(cfg.memcached.len(), 2);
        assert_eq!(cfg.origin_timeout, Duration::from_secs(5));
        assert!(cfg.strip_params.contains("utm_source"));
        // untouched sections keep their defaults
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.memcached_client.pool_size, 4);
        assert_eq!(cfg.logging.format, LogFormat::Auto);
    }
}
