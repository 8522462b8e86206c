//! Configuration for the load generator.
//!
//! Configuration is loaded from multiple sources with the following precedence (highest to
//! lowest):
//!
//! 1. Command line options of the `run` command
//! 2. Environment variables (prefixed with `KVLOAD__`)
//! 3. YAML configuration file (specified via `-c` or `--config` flag)
//! 4. Defaults
//!
//! # Environment Variables
//!
//! Environment variables use `KVLOAD__` as a prefix and double underscores (`__`) to denote nested
//! configuration structures. For example:
//!
//! - `KVLOAD__TARGET=kv-1.example.com:9999` sets the primary target
//! - `KVLOAD__RATE=500` sets the request rate
//! - `KVLOAD__METRICS__REPORT_INTERVAL=30s` sets the console report interval
//!
//! # YAML Configuration File
//!
//! ```yaml
//! target: kv-1.example.com:9999
//! rate: 500
//!
//! metrics:
//!   report_interval: 30s
//! ```

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use figment::providers::{Env, Format, Serialized, Yaml};
use kvload_service::LoadConfig;
use secrecy::{CloneableSecret, SecretBox, SerializableSecret, zeroize::Zeroize};
use serde::{Deserialize, Serialize};
use tracing::level_filters::LevelFilter;

/// Environment variable prefix for all configuration options.
const ENV_PREFIX: &str = "KVLOAD__";

/// Newtype around `String` that may protect against accidental logging of secrets in our
/// configuration struct. Use with [`secrecy::SecretBox`].
#[derive(Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ConfigSecret(String);

impl ConfigSecret {
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl From<&str> for ConfigSecret {
    fn from(str: &str) -> Self {
        ConfigSecret(str.to_string())
    }
}

impl fmt::Debug for ConfigSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        write!(f, "[redacted]")
    }
}

impl CloneableSecret for ConfigSecret {}
impl SerializableSecret for ConfigSecret {}
impl Zeroize for ConfigSecret {
    fn zeroize(&mut self) {
        self.0.zeroize();
    }
}

/// Runtime configuration for the Tokio async runtime.
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Runtime {
    /// Number of worker threads of the runtime.
    ///
    /// Load workers are tasks on this runtime, so this bounds how many of them make progress in
    /// parallel.
    ///
    /// # Default
    ///
    /// The number of CPU cores on the host machine.
    ///
    /// # Environment Variable
    ///
    /// `KVLOAD__RUNTIME__WORKER_THREADS`
    pub worker_threads: usize,
}

impl Default for Runtime {
    fn default() -> Self {
        Self {
            worker_threads: num_cpus::get(),
        }
    }
}

/// [Sentry](https://sentry.io/) error reporting configuration.
///
/// Sentry is disabled unless a DSN is provided.
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Sentry {
    /// Sentry DSN. When `None`, the integration is disabled.
    ///
    /// # Environment Variable
    ///
    /// `KVLOAD__SENTRY__DSN`
    pub dsn: Option<SecretBox<ConfigSecret>>,

    /// Environment name attached to all events.
    ///
    /// # Environment Variable
    ///
    /// `KVLOAD__SENTRY__ENVIRONMENT`
    pub environment: Option<Cow<'static, str>>,

    /// Sample rate for error events, between `0.0` and `1.0`.
    ///
    /// # Default
    ///
    /// `1.0`
    pub sample_rate: f32,

    /// Sample rate for performance traces, between `0.0` and `1.0`.
    ///
    /// # Default
    ///
    /// `0.01`
    pub traces_sample_rate: f32,
}

impl Sentry {
    /// Returns whether Sentry integration is enabled.
    pub fn is_enabled(&self) -> bool {
        self.dsn.is_some()
    }
}

impl Default for Sentry {
    fn default() -> Self {
        Self {
            dsn: None,
            environment: None,
            sample_rate: 1.0,
            traces_sample_rate: 0.01,
        }
    }
}

/// Log output format.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Chooses [`LogFormat::Pretty`] for TTY, otherwise [`LogFormat::Simplified`].
    Auto,
    /// Pretty printing with colors.
    Pretty,
    /// Simplified plain text output.
    Simplified,
    /// JSON lines.
    Json,
}

/// The logging format parse error.
#[derive(Clone, Debug)]
pub struct FormatParseError(String);

impl fmt::Display for FormatParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            r#"error parsing "{}" as format: expected one of "auto", "pretty", "simplified", "json""#,
            self.0
        )
    }
}

impl std::error::Error for FormatParseError {}

impl std::str::FromStr for LogFormat {
    type Err = FormatParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let result = match s {
            "" => LogFormat::Auto,
            s if s.eq_ignore_ascii_case("auto") => LogFormat::Auto,
            s if s.eq_ignore_ascii_case("pretty") => LogFormat::Pretty,
            s if s.eq_ignore_ascii_case("simplified") => LogFormat::Simplified,
            s if s.eq_ignore_ascii_case("json") => LogFormat::Json,
            s => return Err(FormatParseError(s.into())),
        };

        Ok(result)
    }
}

mod display_fromstr {
    pub fn serialize<T, S>(value: &T, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
        T: std::fmt::Display,
    {
        serializer.collect_str(&value)
    }

    pub fn deserialize<'de, T, D>(deserializer: D) -> Result<T, D::Error>
    where
        D: serde::Deserializer<'de>,
        T: std::str::FromStr,
        <T as std::str::FromStr>::Err: std::fmt::Display,
    {
        use serde::Deserialize;
        let s = <std::borrow::Cow<'de, str>>::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Logging configuration. Logs are always written to stderr.
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Logging {
    /// Minimum log level to output.
    ///
    /// `RUST_LOG` provides more granular control per module if needed.
    ///
    /// # Default
    ///
    /// `INFO`
    ///
    /// # Environment Variable
    ///
    /// `KVLOAD__LOGGING__LEVEL`
    #[serde(with = "display_fromstr")]
    pub level: LevelFilter,

    /// Log output format. See [`LogFormat`].
    ///
    /// # Environment Variable
    ///
    /// `KVLOAD__LOGGING__FORMAT`
    pub format: LogFormat,
}

impl Default for Logging {
    fn default() -> Self {
        Self {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
        }
    }
}

/// Metrics configuration.
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Metrics {
    /// Datadog API key. Metrics are only submitted to Datadog when this is set.
    ///
    /// # Environment Variable
    ///
    /// `KVLOAD__METRICS__DATADOG_KEY`
    pub datadog_key: Option<SecretBox<ConfigSecret>>,

    /// Global tags applied to all Datadog metrics.
    ///
    /// # Environment Variables
    ///
    /// Each tag is set individually, for example `KVLOAD__METRICS__TAGS__REGION=us`.
    pub tags: BTreeMap<String, String>,

    /// Interval between two latency summaries logged to the console.
    ///
    /// # Default
    ///
    /// `10s`
    #[serde(with = "humantime_serde")]
    pub report_interval: Duration,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            datadog_key: None,
            tags: BTreeMap::new(),
            report_interval: Duration::from_secs(10),
        }
    }
}

/// Configuration of the `fetch` command.
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Fetch {
    /// Prefix marking paths on the remote filesystem.
    ///
    /// Paths starting with this prefix are copied to [`cache_path`](Self::cache_path). Prefixes
    /// shorter than two characters are ignored and all paths are treated as local.
    ///
    /// # Environment Variable
    ///
    /// `KVLOAD__FETCH__REMOTE_PREFIX`
    pub remote_prefix: Option<String>,

    /// Local directory holding copies of remote files.
    ///
    /// # Default
    ///
    /// `"cache"` (relative to the working directory)
    pub cache_path: PathBuf,

    /// Program and leading arguments used to copy a remote file.
    ///
    /// The remote path and the local destination are appended as the final two arguments.
    ///
    /// # Default
    ///
    /// `["hadoop", "fs", "-copyToLocal"]`
    pub copy_command: Vec<String>,
}

impl Default for Fetch {
    fn default() -> Self {
        Self {
            remote_prefix: None,
            cache_path: PathBuf::from("cache"),
            copy_command: vec!["hadoop".into(), "fs".into(), "-copyToLocal".into()],
        }
    }
}

/// Main configuration struct of the load generator.
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Address of the primary target.
    ///
    /// Accepts `name=address` to set the name used in logs and metrics. Missing schemes and paths
    /// are filled in, see [`TargetAddress`](crate::http::TargetAddress).
    ///
    /// # Default
    ///
    /// `localhost:9999`
    pub target: String,

    /// Address of the optional diff target.
    ///
    /// When set, every request is mirrored to this target and the responses are compared.
    pub diff: Option<String>,

    /// Name of the collection to request.
    ///
    /// # Default
    ///
    /// `testdata`
    pub collection: String,

    /// Number of concurrent workers.
    ///
    /// # Default
    ///
    /// `8`
    pub workers: usize,

    /// Target request rate in requests per second.
    ///
    /// # Default
    ///
    /// `100`
    pub rate: u32,

    /// Number of random keys kept for sampling.
    ///
    /// # Default
    ///
    /// `1000`
    pub sample_size: u64,

    /// Interval between two refreshes of the sampled keys.
    ///
    /// # Default
    ///
    /// `60s`
    #[serde(with = "humantime_serde")]
    pub key_refresh_interval: Duration,

    /// Configuration of the async runtime.
    pub runtime: Runtime,

    /// Logging configuration.
    pub logging: Logging,

    /// Sentry configuration.
    pub sentry: Sentry,

    /// Metrics configuration.
    pub metrics: Metrics,

    /// Configuration of the `fetch` command.
    pub fetch: Fetch,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            target: "localhost:9999".into(),
            diff: None,
            collection: "testdata".into(),
            workers: 8,
            rate: 100,
            sample_size: 1000,
            key_refresh_interval: kvload_service::service::DEFAULT_KEY_REFRESH_INTERVAL,

            runtime: Runtime::default(),
            logging: Logging::default(),
            sentry: Sentry::default(),
            metrics: Metrics::default(),
            fetch: Fetch::default(),
        }
    }
}

/// Values given on the command line, taking precedence over all other sources.
#[derive(Debug, Default, Serialize)]
pub struct Overrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diff: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub collection: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workers: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sample_size: Option<u64>,
}

impl Config {
    /// Loads configuration from defaults, the optional YAML file and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with(path, &Overrides::default())
    }

    /// Like [`load`](Self::load), with command line `overrides` merged last.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The YAML configuration file cannot be read or parsed
    /// - Environment variables contain invalid values
    pub fn load_with(path: Option<&Path>, overrides: &Overrides) -> Result<Self> {
        let mut figment = figment::Figment::from(Serialized::defaults(Config::default()));
        if let Some(path) = path {
            figment = figment.merge(Yaml::file(path));
        }
        let config = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .merge(Serialized::defaults(overrides))
            .extract()?;

        Ok(config)
    }

    /// Returns the parameters of the load service.
    pub fn load_config(&self) -> LoadConfig {
        LoadConfig {
            collection: self.collection.clone(),
            workers: self.workers,
            rate: self.rate,
            sample_size: self.sample_size,
            key_refresh_interval: self.key_refresh_interval,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use secrecy::ExposeSecret;

    use super::*;

    #[test]
    fn defaults() {
        figment::Jail::expect_with(|_jail| {
            let config = Config::load(None).unwrap();

            assert_eq!(config.target, "localhost:9999");
            assert_eq!(config.diff, None);
            assert_eq!(config.collection, "testdata");
            assert_eq!(config.workers, 8);
            assert_eq!(config.rate, 100);
            assert_eq!(config.sample_size, 1000);
            assert_eq!(config.key_refresh_interval, Duration::from_secs(60));
            assert_eq!(config.metrics.report_interval, Duration::from_secs(10));
            assert!(!config.sentry.is_enabled());

            Ok(())
        });
    }

    #[test]
    fn configurable_via_env() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("KVLOAD__TARGET", "primary=kv-1:9999");
            jail.set_env("KVLOAD__DIFF", "kv-2:9999");
            jail.set_env("KVLOAD__RATE", "250");
            jail.set_env("KVLOAD__KEY_REFRESH_INTERVAL", "5m");
            jail.set_env("KVLOAD__LOGGING__LEVEL", "debug");
            jail.set_env("KVLOAD__LOGGING__FORMAT", "json");
            jail.set_env("KVLOAD__METRICS__DATADOG_KEY", "abcde");
            jail.set_env("KVLOAD__METRICS__TAGS__FOO", "bar");
            jail.set_env("KVLOAD__FETCH__REMOTE_PREFIX", "hdfs://");

            let config = Config::load(None).unwrap();

            assert_eq!(config.target, "primary=kv-1:9999");
            assert_eq!(config.diff.as_deref(), Some("kv-2:9999"));
            assert_eq!(config.rate, 250);
            assert_eq!(config.key_refresh_interval, Duration::from_secs(300));
            assert_eq!(config.logging.level, LevelFilter::DEBUG);
            assert_eq!(config.logging.format, LogFormat::Json);
            assert_eq!(
                config.metrics.datadog_key.unwrap().expose_secret().as_str(),
                "abcde"
            );
            assert_eq!(config.metrics.tags, [("foo".into(), "bar".into())].into());
            assert_eq!(config.fetch.remote_prefix.as_deref(), Some("hdfs://"));

            Ok(())
        });
    }

    #[test]
    fn configurable_via_yaml() {
        let mut tempfile = tempfile::NamedTempFile::new().unwrap();
        tempfile
            .write_all(
                br#"
            target: kv-1:9999
            collection: users
            workers: 4
            sentry:
                dsn: abcde
                environment: staging
            fetch:
                cache_path: /var/cache/kvload
                copy_command: [cp]
            "#,
            )
            .unwrap();

        figment::Jail::expect_with(|_jail| {
            let config = Config::load(Some(tempfile.path())).unwrap();

            assert_eq!(config.target, "kv-1:9999");
            assert_eq!(config.collection, "users");
            assert_eq!(config.workers, 4);
            assert_eq!(config.sentry.dsn.unwrap().expose_secret().as_str(), "abcde");
            assert_eq!(config.sentry.environment.as_deref(), Some("staging"));
            assert_eq!(config.fetch.cache_path, Path::new("/var/cache/kvload"));
            assert_eq!(config.fetch.copy_command, ["cp"]);

            Ok(())
        });
    }

    #[test]
    fn overrides_take_precedence() {
        let mut tempfile = tempfile::NamedTempFile::new().unwrap();
        tempfile.write_all(b"workers: 4\nrate: 10\n").unwrap();

        figment::Jail::expect_with(|jail| {
            jail.set_env("KVLOAD__WORKERS", "6");
            jail.set_env("KVLOAD__SAMPLE_SIZE", "50");

            let overrides = Overrides {
                workers: Some(2),
                ..Default::default()
            };
            let config = Config::load_with(Some(tempfile.path()), &overrides).unwrap();

            // Env should overwrite the yaml config, and the command line both.
            assert_eq!(config.workers, 2);
            assert_eq!(config.sample_size, 50);
            assert_eq!(config.rate, 10);

            Ok(())
        });
    }

    #[test]
    fn rejects_invalid_log_format() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("KVLOAD__LOGGING__FORMAT", "xml");
            assert!(Config::load(None).is_err());
            Ok(())
        });
    }

    #[test]
    fn secrets_are_redacted() {
        let secret = ConfigSecret::from("hunter2");
        assert_eq!(format!("{secret:?}"), "[redacted]");
    }
}
