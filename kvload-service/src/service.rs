//! The dispatch engine tying key cache, generator and workers together.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::diff::DiffComparator;
use crate::error::{Error, Result};
use crate::generator::{GeneratorStats, RateGenerator};
use crate::keys::KeyCache;
use crate::metrics::MetricsSink;
use crate::queue::{PermitQueue, queue_capacity};
use crate::target::BoxedConnect;
use crate::worker::{WorkerContext, WorkerPool, WorkerStats};

/// Default interval between two key refreshes.
pub const DEFAULT_KEY_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

/// Parameters of a load run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoadConfig {
    /// Name of the collection to request keys from.
    pub collection: String,
    /// Number of concurrent workers.
    pub workers: usize,
    /// Target request rate in requests per second.
    pub rate: u32,
    /// Number of random keys to keep in the key cache.
    pub sample_size: u64,
    /// Interval between two key refreshes.
    pub key_refresh_interval: Duration,
}

/// Totals of a completed [`LoadService::run`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RunStats {
    /// Totals of the rate generator.
    pub generator: GeneratorStats,
    /// Combined totals of all workers.
    pub workers: WorkerStats,
}

/// Generates load against a primary target and optionally mirrors it to a diff target.
#[derive(Debug)]
pub struct LoadService {
    config: LoadConfig,
    keys: Arc<KeyCache>,
    generator: RateGenerator,
    context: Arc<WorkerContext>,
}

impl LoadService {
    /// Creates the service without contacting any target yet.
    ///
    /// The key cache receives its own connection to the primary target.
    pub fn new(
        config: LoadConfig,
        primary: BoxedConnect,
        diff: Option<BoxedConnect>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Self> {
        let capacity = queue_capacity(config.rate, config.workers)?;
        let queue = PermitQueue::new(capacity)?;

        let keys = Arc::new(KeyCache::new(
            config.collection.clone(),
            config.sample_size,
            primary.connect()?,
        ));
        let generator = RateGenerator::new(config.rate, queue.clone(), Arc::clone(&metrics))?;

        let context = Arc::new(WorkerContext {
            keys: Arc::clone(&keys),
            queue,
            comparator: DiffComparator::new(Arc::clone(&metrics)),
            metrics,
            primary,
            diff,
        });

        Ok(Self {
            config,
            keys,
            generator,
            context,
        })
    }

    /// Returns the capacity of the permit queue.
    pub fn queue_capacity(&self) -> usize {
        self.context.queue.capacity()
    }

    /// Performs the initial key load.
    ///
    /// This must succeed before [`run`](Self::run). It is the only operation whose failure is
    /// meant to stop the process.
    pub async fn bootstrap(&self) -> Result<usize> {
        let count = self.keys.load().await?;
        tracing::info!(
            collection = %self.config.collection,
            count,
            "loaded initial keys"
        );
        Ok(count)
    }

    /// Runs the generator, the workers and the key refresh until `token` is cancelled.
    pub async fn run(&self, token: CancellationToken) -> Result<RunStats> {
        if self.keys.snapshot().is_none() {
            return Err(Error::NoKeysAvailable);
        }

        // Stops the workers and the refresh loop once the generator returns, for whatever reason.
        let token = token.child_token();

        let pool = WorkerPool::spawn(
            self.config.workers,
            Arc::clone(&self.context),
            token.clone(),
        )?;

        let refresh = tokio::spawn({
            let keys = Arc::clone(&self.keys);
            let period = self.config.key_refresh_interval;
            let token = token.clone();
            async move { keys.refresh_loop(period, token).await }
        });

        tracing::info!(
            primary = self.context.primary.name(),
            diff = self.context.diff.as_ref().map(|diff| diff.name()),
            rate = self.config.rate,
            workers = pool.len(),
            capacity = self.queue_capacity(),
            "sending requests"
        );

        let generator = self.generator.run(token.clone()).await;
        token.cancel();

        let workers = pool.join().await;
        if let Err(error) = refresh.await {
            tracing::error!(
                error = &error as &dyn std::error::Error,
                "key refresh task failed"
            );
        }

        Ok(RunStats { generator, workers })
    }
}
