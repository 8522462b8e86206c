use std::env;
use std::io::IsTerminal;

use secrecy::ExposeSecret;
use sentry::integrations::tracing as sentry_tracing;
use tracing::Level;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{EnvFilter, Layer, prelude::*};

use crate::config::{Config, LogFormat};

/// Initializes Datadog metrics if an API key is configured.
///
/// The returned flusher must be flushed before exiting to submit buffered metrics.
pub fn init_metrics(config: &Config) -> std::io::Result<Option<merni::DatadogFlusher>> {
    let Some(api_key) = &config.metrics.datadog_key else {
        return Ok(None);
    };

    let mut builder = merni::datadog(api_key.expose_secret().as_str()).prefix("kvload.");
    for (k, v) in &config.metrics.tags {
        builder = builder.global_tag(k, v);
    }
    builder.try_init().map(Some)
}

/// Initializes Sentry if a DSN is configured.
pub fn init_sentry(config: &Config) -> Option<sentry::ClientInitGuard> {
    let sentry_config = &config.sentry;
    let dsn = sentry_config.dsn.as_ref()?;

    Some(sentry::init(sentry::ClientOptions {
        dsn: dsn.expose_secret().as_str().parse().ok(),
        release: sentry::release_name!(),
        environment: sentry_config.environment.clone(),
        sample_rate: sentry_config.sample_rate,
        traces_sample_rate: sentry_config.traces_sample_rate,
        enable_logs: true,
        ..Default::default()
    }))
}

/// Installs the global tracing subscriber writing to stderr.
pub fn init_tracing(config: &Config) {
    // Same as the default filter, except it converts warnings into events
    // and also sends everything at or above INFO as logs instead of breadcrumbs.
    let sentry_layer = config.sentry.is_enabled().then(|| {
        sentry_tracing::layer().event_filter(|metadata| match *metadata.level() {
            Level::ERROR | Level::WARN => {
                sentry_tracing::EventFilter::Event | sentry_tracing::EventFilter::Log
            }
            Level::INFO => sentry_tracing::EventFilter::Log,
            Level::DEBUG | Level::TRACE => sentry_tracing::EventFilter::Ignore,
        })
    });

    let format = resolve_format(config.logging.format, std::io::stderr().is_terminal());
    let format_layer = match format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .json()
            .flatten_event(true)
            .boxed(),
        LogFormat::Simplified => tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .with_target(true)
            .boxed(),
        LogFormat::Pretty | LogFormat::Auto => tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .compact()
            .boxed(),
    };

    let (level, env_filter) = parse_rust_log(config.logging.level);
    tracing_subscriber::registry()
        .with(format_layer.with_filter(level))
        .with(sentry_layer)
        .with(env_filter)
        .init();
}

/// Chooses a concrete format for [`LogFormat::Auto`].
fn resolve_format(format: LogFormat, is_terminal: bool) -> LogFormat {
    match format {
        LogFormat::Auto if is_terminal => LogFormat::Pretty,
        LogFormat::Auto => LogFormat::Simplified,
        format => format,
    }
}

/// Returns the level to log at and the filter for dependencies.
///
/// A plain level in `RUST_LOG` overrides the configured level. Any other value of `RUST_LOG` is
/// used literally as filter, so all directives can be overridden if needed.
fn parse_rust_log(configured: LevelFilter) -> (LevelFilter, EnvFilter) {
    let level = match env::var(EnvFilter::DEFAULT_ENV) {
        Ok(value) => match value.parse::<LevelFilter>() {
            Ok(level) => level,
            Err(_) => return (LevelFilter::TRACE, EnvFilter::new(value)),
        },
        Err(_) => configured,
    };

    // This is the maximum verbosity that will be logged, we filter this down to `level`.
    let env_filter = EnvFilter::new(
        "INFO,\
        kvload=TRACE,\
        kvload_cli=TRACE,\
        kvload_service=TRACE,\
        ",
    );

    (level, env_filter)
}
