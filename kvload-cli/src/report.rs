//! Metrics reporting of the binary.
//!
//! [`ReportingMetrics`] aggregates everything locally for the console summary and forwards each
//! update to `merni`, which submits to Datadog if it was initialized.

use std::sync::Arc;
use std::time::{Duration, Instant};

use kvload_service::metrics::{Counter, Gauge, Timer};
use kvload_service::{LocalMetrics, MetricsSink, Role};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// A metrics sink tagging latencies and failures with the target's name.
#[derive(Debug)]
pub struct ReportingMetrics {
    local: Arc<LocalMetrics>,
    primary: String,
    diff: Option<String>,
}

impl ReportingMetrics {
    /// Creates a sink for the named primary and optional diff target.
    pub fn new(primary: impl Into<String>, diff: Option<String>) -> Self {
        Self {
            local: Arc::new(LocalMetrics::new()),
            primary: primary.into(),
            diff,
        }
    }

    /// Returns the local aggregate of all updates.
    pub fn local(&self) -> &Arc<LocalMetrics> {
        &self.local
    }

    pub(crate) fn target_name(&self, role: Role) -> &str {
        match role {
            Role::Primary => &self.primary,
            Role::Diff => self.diff.as_deref().unwrap_or(role.as_str()),
        }
    }
}

impl MetricsSink for ReportingMetrics {
    fn record_duration(&self, timer: Timer, since: Instant) {
        let elapsed = since.elapsed();
        self.local.record_duration(timer, since);

        let Timer::Rtt(role) = timer;
        merni::distribution!(
            "request.duration"@s: elapsed,
            "target" => self.target_name(role),
            "role" => role.as_str()
        );
    }

    fn increment_counter(&self, counter: Counter, n: u64) {
        self.local.increment_counter(counter, n);

        match counter {
            Counter::Dropped => {
                merni::counter!("request.dropped": n);
            }
            Counter::Diffs => {
                merni::counter!("request.diverged": n);
            }
            Counter::Failures(role) => {
                merni::counter!(
                    "request.failed": n,
                    "target" => self.target_name(role),
                    "role" => role.as_str()
                );
            }
        }
    }

    fn set_gauge(&self, gauge: Gauge, value: u64) {
        self.local.set_gauge(gauge, value);

        match gauge {
            Gauge::QueueSize => {
                merni::gauge!("queue.size": value);
            }
        }
    }
}

/// Logs a summary of `metrics` every `interval` until `token` is cancelled.
///
/// A final summary is logged on cancellation.
pub async fn report_loop(
    metrics: Arc<ReportingMetrics>,
    interval: Duration,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => log_summary(&metrics),
        }
    }

    log_summary(&metrics);
}

fn log_summary(metrics: &ReportingMetrics) {
    let snapshot = metrics.local.snapshot();

    let rtt = &snapshot.primary_rtt;
    tracing::info!(
        target_name = %metrics.primary,
        requests = rtt.count,
        avg = ?rtt.avg,
        p50 = ?rtt.p50,
        p90 = ?rtt.p90,
        p99 = ?rtt.p99,
        failures = snapshot.primary_failures,
        dropped = snapshot.dropped,
        queue_size = snapshot.queue_size,
        "primary latency"
    );

    if let Some(diff) = &metrics.diff {
        let rtt = &snapshot.diff_rtt;
        tracing::info!(
            target_name = %diff,
            requests = rtt.count,
            avg = ?rtt.avg,
            p50 = ?rtt.p50,
            p90 = ?rtt.p90,
            p99 = ?rtt.p99,
            failures = snapshot.diff_failures,
            diffs = snapshot.diffs,
            "diff latency"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forwards_to_local_metrics() {
        let metrics = ReportingMetrics::new("primary", Some("candidate".into()));
        metrics.record_duration(Timer::Rtt(Role::Diff), Instant::now());
        metrics.increment_counter(Counter::Failures(Role::Primary), 2);
        metrics.set_gauge(Gauge::QueueSize, 5);

        let snapshot = metrics.local().snapshot();
        assert_eq!(snapshot.diff_rtt.count, 1);
        assert_eq!(snapshot.primary_failures, 2);
        assert_eq!(snapshot.queue_size, 5);
    }

    #[test]
    fn names_targets_by_role() {
        let metrics = ReportingMetrics::new("kv-1", None);
        assert_eq!(metrics.target_name(Role::Primary), "kv-1");
        assert_eq!(metrics.target_name(Role::Diff), "diff");
    }

    #[tokio::test(start_paused = true)]
    async fn reporter_stops_on_cancellation() {
        let token = CancellationToken::new();
        let handle = tokio::spawn(report_loop(
            Arc::new(ReportingMetrics::new("primary", None)),
            Duration::from_secs(10),
            token.clone(),
        ));

        tokio::time::sleep(Duration::from_secs(25)).await;
        token.cancel();
        handle.await.unwrap();
    }
}
