//! The `run` command: generates load until the process is asked to terminate.

use std::sync::Arc;

use anyhow::{Context, Result};
use kvload_service::{BoxedConnect, Connect, LoadService, RunStats};
use tokio::signal::unix::SignalKind;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::http::{HttpConnect, TargetAddress};
use crate::report::{self, ReportingMetrics};

/// Creates the load service and its metrics sink from the configuration.
///
/// No target is contacted yet.
pub fn build(config: &Config) -> Result<(LoadService, Arc<ReportingMetrics>)> {
    let primary = TargetAddress::parse(&config.target);
    let diff = config.diff.as_deref().map(TargetAddress::parse);
    match &diff {
        Some(diff) => tracing::info!(%primary, %diff, "comparing targets"),
        None => tracing::info!(%primary, "resolved target"),
    }

    let primary: BoxedConnect = Box::new(HttpConnect::new(primary));
    let diff = diff.map(|address| Box::new(HttpConnect::new(address)) as BoxedConnect);

    let metrics = Arc::new(ReportingMetrics::new(
        primary.name(),
        diff.as_ref().map(|connect| connect.name().to_owned()),
    ));

    let service = LoadService::new(config.load_config(), primary, diff, metrics.clone())
        .context("invalid load configuration")?;

    Ok((service, metrics))
}

/// Loads the initial keys and generates load until `token` is cancelled.
///
/// Fails if the initial keys cannot be loaded. Any later failure is logged and does not stop the
/// load generation.
pub async fn generate_load(config: &Config, token: CancellationToken) -> Result<RunStats> {
    let (service, metrics) = build(config)?;
    service
        .bootstrap()
        .await
        .context("failed to load initial keys")?;

    let reporter_token = token.child_token();
    let reporter = tokio::spawn(report::report_loop(
        metrics,
        config.metrics.report_interval,
        reporter_token.clone(),
    ));

    let result = service.run(token).await;
    reporter_token.cancel();
    if let Err(error) = reporter.await {
        tracing::error!(
            error = &error as &dyn std::error::Error,
            "console reporter failed"
        );
    }

    let stats = result?;
    tracing::info!(?stats, "load generation finished");
    Ok(stats)
}

/// Runs the load generator until SIGINT or SIGTERM is received.
pub async fn run(config: Config) -> Result<()> {
    let token = CancellationToken::new();

    tokio::spawn({
        let token = token.clone();
        async move {
            elegant_departure::get_shutdown_guard().wait().await;
            tracing::info!("Shutting down ...");
            token.cancel();
        }
    });

    let mut load = tokio::spawn(async move { generate_load(&config, token).await });

    let departure = elegant_departure::tokio::depart()
        .on_termination()
        .on_sigint()
        .on_signal(SignalKind::hangup());

    let result = tokio::select! {
        result = &mut load => result,
        _ = departure => load.await,
    };

    result.context("load generator panicked")??;
    tracing::info!("Shutdown complete");
    Ok(())
}
