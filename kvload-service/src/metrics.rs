//! Metrics emitted by the load service.
//!
//! The service reports through the [`MetricsSink`] trait and does not care where the values end
//! up. [`LocalMetrics`] aggregates everything in-process, which is what tests and the console
//! reporter use.

use std::fmt::{self, Debug};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use sketches_ddsketch::DDSketch;

use crate::target::Role;

/// Latency timers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Timer {
    /// Round-trip time of a single-key fetch against the given target.
    Rtt(Role),
}

/// Monotonic counters.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Counter {
    /// Permits discarded because the queue was full.
    Dropped,
    /// Requests for which the diff target disagreed with the primary target.
    Diffs,
    /// Failed calls against the given target.
    Failures(Role),
}

/// Point-in-time gauges.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Gauge {
    /// Number of permits waiting in the queue.
    QueueSize,
}

/// Receives metric updates from the load service.
pub trait MetricsSink: Debug + Send + Sync + 'static {
    /// Records the time elapsed since `since` into the given timer.
    fn record_duration(&self, timer: Timer, since: Instant);

    /// Increments the given counter by `n`.
    fn increment_counter(&self, counter: Counter, n: u64);

    /// Sets the given gauge to `value`.
    fn set_gauge(&self, gauge: Gauge, value: u64);
}

/// Aggregates metrics in memory.
#[derive(Default)]
pub struct LocalMetrics {
    primary_rtt: Mutex<DDSketch>,
    diff_rtt: Mutex<DDSketch>,

    dropped: AtomicU64,
    diffs: AtomicU64,
    primary_failures: AtomicU64,
    diff_failures: AtomicU64,

    queue_size: AtomicU64,
}

impl LocalMetrics {
    /// Creates an empty aggregator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the current value of a counter.
    pub fn counter(&self, counter: Counter) -> u64 {
        self.counter_cell(counter).load(Ordering::Relaxed)
    }

    /// Returns the last value set for a gauge.
    pub fn gauge(&self, gauge: Gauge) -> u64 {
        match gauge {
            Gauge::QueueSize => self.queue_size.load(Ordering::Relaxed),
        }
    }

    /// Returns the number of durations recorded into a timer.
    pub fn timer_count(&self, timer: Timer) -> usize {
        // NB: We intentionally use unwrap and crash if the mutexes are poisoned.
        self.sketch(timer).lock().unwrap().count()
    }

    /// Captures a summary of everything recorded so far.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            primary_rtt: TimerSummary::from_sketch(&self.primary_rtt.lock().unwrap()),
            diff_rtt: TimerSummary::from_sketch(&self.diff_rtt.lock().unwrap()),
            dropped: self.counter(Counter::Dropped),
            diffs: self.counter(Counter::Diffs),
            primary_failures: self.counter(Counter::Failures(Role::Primary)),
            diff_failures: self.counter(Counter::Failures(Role::Diff)),
            queue_size: self.gauge(Gauge::QueueSize),
        }
    }

    fn sketch(&self, timer: Timer) -> &Mutex<DDSketch> {
        match timer {
            Timer::Rtt(Role::Primary) => &self.primary_rtt,
            Timer::Rtt(Role::Diff) => &self.diff_rtt,
        }
    }

    fn counter_cell(&self, counter: Counter) -> &AtomicU64 {
        match counter {
            Counter::Dropped => &self.dropped,
            Counter::Diffs => &self.diffs,
            Counter::Failures(Role::Primary) => &self.primary_failures,
            Counter::Failures(Role::Diff) => &self.diff_failures,
        }
    }
}

impl Debug for LocalMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalMetrics")
            .field("primary_rtt", &self.timer_count(Timer::Rtt(Role::Primary)))
            .field("diff_rtt", &self.timer_count(Timer::Rtt(Role::Diff)))
            .field("dropped", &self.dropped)
            .field("diffs", &self.diffs)
            .field("primary_failures", &self.primary_failures)
            .field("diff_failures", &self.diff_failures)
            .field("queue_size", &self.queue_size)
            .finish()
    }
}

impl MetricsSink for LocalMetrics {
    fn record_duration(&self, timer: Timer, since: Instant) {
        let elapsed = since.elapsed().as_secs_f64();
        self.sketch(timer).lock().unwrap().add(elapsed);
    }

    fn increment_counter(&self, counter: Counter, n: u64) {
        self.counter_cell(counter).fetch_add(n, Ordering::Relaxed);
    }

    fn set_gauge(&self, gauge: Gauge, value: u64) {
        match gauge {
            Gauge::QueueSize => self.queue_size.store(value, Ordering::Relaxed),
        }
    }
}

/// A summary of all values recorded into a [`LocalMetrics`] instance.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MetricsSnapshot {
    /// Latency of the primary target.
    pub primary_rtt: TimerSummary,
    /// Latency of the diff target.
    pub diff_rtt: TimerSummary,
    /// Total dropped permits.
    pub dropped: u64,
    /// Total detected divergences.
    pub diffs: u64,
    /// Total failed calls against the primary target.
    pub primary_failures: u64,
    /// Total failed calls against the diff target.
    pub diff_failures: u64,
    /// Last observed queue size.
    pub queue_size: u64,
}

/// Count and percentiles of a latency timer.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct TimerSummary {
    /// Number of recorded durations.
    pub count: usize,
    /// Mean duration, if anything was recorded.
    pub avg: Option<Duration>,
    /// Median duration.
    pub p50: Option<Duration>,
    /// 90th percentile.
    pub p90: Option<Duration>,
    /// 99th percentile.
    pub p99: Option<Duration>,
}

impl TimerSummary {
    fn from_sketch(sketch: &DDSketch) -> Self {
        let count = sketch.count();
        if count == 0 {
            return Self::default();
        }

        let quantile = |q| {
            sketch
                .quantile(q)
                .ok()
                .flatten()
                .map(|secs| Duration::from_secs_f64(secs.max(0.0)))
        };

        Self {
            count,
            avg: sketch
                .sum()
                .map(|sum| Duration::from_secs_f64((sum / count as f64).max(0.0))),
            p50: quantile(0.5),
            p90: quantile(0.9),
            p99: quantile(0.99),
        }
    }
}
