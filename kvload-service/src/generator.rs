//! The ticking producer of send permits.
//!
//! [`RateGenerator`] is the load-shedding point of the service: it pushes one permit per tick and
//! discards it when the queue is full, so backpressure never slows the schedule down.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::metrics::{Counter, Gauge, MetricsSink};
use crate::queue::{PermitQueue, Push};

/// Totals of a [`RateGenerator::run`].
///
/// `ticks` always equals `enqueued + dropped`, except for the final tick that observed a closed
/// queue, which is counted in `ticks` only.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GeneratorStats {
    /// Number of ticks observed.
    pub ticks: u64,
    /// Permits handed to the queue.
    pub enqueued: u64,
    /// Permits discarded because the queue was full.
    pub dropped: u64,
}

/// Emits permits into a [`PermitQueue`] at a fixed rate.
#[derive(Debug)]
pub struct RateGenerator {
    period: Duration,
    queue: PermitQueue,
    metrics: Arc<dyn MetricsSink>,
}

impl RateGenerator {
    /// Creates a generator emitting `rate` permits per second.
    pub fn new(rate: u32, queue: PermitQueue, metrics: Arc<dyn MetricsSink>) -> Result<Self> {
        if rate == 0 {
            return Err(Error::InvalidConfig("rate must be at least 1".into()));
        }

        let period = Duration::from_secs(1) / rate;
        if period.is_zero() {
            return Err(Error::InvalidConfig(format!(
                "rate {rate} exceeds one permit per nanosecond"
            )));
        }

        Ok(Self {
            period,
            queue,
            metrics,
        })
    }

    /// Returns the time between two ticks.
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Performs a single tick: reports the queue size, then pushes one permit.
    ///
    /// When the queue is full, the permit is discarded and the drop counter incremented.
    pub fn tick(&self) -> Push {
        self.metrics
            .set_gauge(Gauge::QueueSize, self.queue.len() as u64);

        let push = self.queue.try_push();
        if push == Push::Full {
            self.metrics.increment_counter(Counter::Dropped, 1);
        }
        push
    }

    /// Ticks until `token` is cancelled or the queue is closed.
    pub async fn run(&self, token: CancellationToken) -> GeneratorStats {
        let mut stats = GeneratorStats::default();
        let mut ticker = tokio::time::interval(self.period);
        // Ticks that fall behind are skipped rather than bursted.
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::debug!(period = ?self.period, "starting generator");

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }

            stats.ticks += 1;
            match self.tick() {
                Push::Enqueued => stats.enqueued += 1,
                Push::Full => stats.dropped += 1,
                Push::Closed => {
                    tracing::warn!("permit queue closed, stopping generator");
                    break;
                }
            }
        }

        tracing::debug!(?stats, "generator stopped");
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::LocalMetrics;
    use crate::queue::queue_capacity;

    fn setup(rate: u32, workers: usize) -> (RateGenerator, PermitQueue, Arc<LocalMetrics>) {
        let queue = PermitQueue::new(queue_capacity(rate, workers).unwrap()).unwrap();
        let metrics = Arc::new(LocalMetrics::new());
        let generator = RateGenerator::new(rate, queue.clone(), metrics.clone()).unwrap();
        (generator, queue, metrics)
    }

    #[test]
    fn period_follows_rate() {
        let (generator, _, _) = setup(10, 1);
        assert_eq!(generator.period(), Duration::from_millis(100));

        let (generator, _, _) = setup(3, 1);
        assert_eq!(generator.period(), Duration::from_nanos(333_333_333));
    }

    #[test]
    fn rejects_zero_rate() {
        let queue = PermitQueue::new(1).unwrap();
        assert!(RateGenerator::new(0, queue, Arc::new(LocalMetrics::new())).is_err());
    }

    #[test]
    fn rejects_sub_nanosecond_period() {
        let metrics = Arc::new(LocalMetrics::new());
        let result = RateGenerator::new(2_000_000_000, PermitQueue::new(1).unwrap(), metrics);
        assert!(matches!(result, Err(Error::InvalidConfig(_))));

        let metrics = Arc::new(LocalMetrics::new());
        let generator =
            RateGenerator::new(1_000_000_000, PermitQueue::new(1).unwrap(), metrics).unwrap();
        assert_eq!(generator.period(), Duration::from_nanos(1));
    }

    #[test]
    fn every_tick_enqueues_or_drops() {
        let (generator, queue, metrics) = setup(2, 1);

        for tick in 1..=5u64 {
            let before = (queue.len(), metrics.counter(Counter::Dropped));
            match generator.tick() {
                Push::Enqueued => assert_eq!(queue.len(), before.0 + 1),
                Push::Full => assert_eq!(metrics.counter(Counter::Dropped), before.1 + 1),
                Push::Closed => panic!("queue closed"),
            }
            assert_eq!(queue.len() as u64 + metrics.counter(Counter::Dropped), tick);
        }

        assert_eq!(queue.len(), 2);
        assert_eq!(metrics.counter(Counter::Dropped), 3);
    }

    #[test]
    fn tick_reports_queue_size_before_push() {
        let (generator, _queue, metrics) = setup(4, 1);
        generator.tick();
        generator.tick();
        generator.tick();
        assert_eq!(metrics.gauge(Gauge::QueueSize), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn sheds_load_when_workers_are_stuck() {
        // No consumers are popping, so the queue fills up and further ticks are dropped.
        let (generator, queue, metrics) = setup(10, 2);
        assert_eq!(queue.capacity(), 20);

        let token = CancellationToken::new();
        let canceller = {
            let token = token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(4050)).await;
                token.cancel();
            })
        };

        let stats = generator.run(token).await;
        canceller.await.unwrap();

        assert_eq!(queue.len(), 20);
        assert_eq!(stats.enqueued, 20);
        assert_eq!(stats.ticks, stats.enqueued + stats.dropped);
        assert_eq!(stats.dropped, metrics.counter(Counter::Dropped));
        // Ticks at 0ms, 100ms, ..., 4000ms.
        assert_eq!(stats.ticks, 41);
        assert_eq!(stats.dropped, 21);
    }

    #[tokio::test(start_paused = true)]
    async fn queue_full_within_two_seconds() {
        let (generator, queue, _metrics) = setup(10, 2);
        let token = CancellationToken::new();
        let handle = {
            let token = token.clone();
            tokio::spawn(async move { generator.run(token).await })
        };

        tokio::time::sleep(Duration::from_millis(2050)).await;
        assert_eq!(queue.len(), 20);

        token.cancel();
        let stats = handle.await.unwrap();
        assert_eq!(stats.ticks, stats.enqueued + stats.dropped);
    }

    #[tokio::test(start_paused = true)]
    async fn stops_when_queue_closes() {
        let (generator, queue, _metrics) = setup(10, 1);
        queue.close();

        let stats = generator.run(CancellationToken::new()).await;
        assert_eq!(stats.ticks, 1);
        assert_eq!(stats.enqueued + stats.dropped, 0);
    }
}
