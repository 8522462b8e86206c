//! The fixed pool of workers executing requests.
//!
//! Every worker owns private connections to the primary and, optionally, the diff target. It
//! waits for a permit, samples a key, sends the request to the primary target and then, in diff
//! mode, sends the identical request to the diff target and compares both responses. Failed calls
//! are logged and abandoned, the worker then waits for the next permit.

use std::sync::Arc;
use std::time::Instant;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::diff::DiffComparator;
use crate::error::{Error, Result};
use crate::keys::KeyCache;
use crate::metrics::{Counter, MetricsSink, Timer};
use crate::queue::PermitQueue;
use crate::target::{BoxedConnect, BoxedTarget, Role, SingleKeyRequest, SingleKeyResponse};

/// Number of keys sampled for a single-key fetch.
const KEYS_PER_REQUEST: usize = 1;

/// Resources shared by all workers of a pool.
#[derive(Debug)]
pub struct WorkerContext {
    /// Source of the keys to request.
    pub keys: Arc<KeyCache>,
    /// Queue of send permits.
    pub queue: PermitQueue,
    /// Receives latencies and failure counts.
    pub metrics: Arc<dyn MetricsSink>,
    /// Compares primary and diff responses.
    pub comparator: DiffComparator,
    /// Opens connections to the primary target.
    pub primary: BoxedConnect,
    /// Opens connections to the diff target, if diff mode is enabled.
    pub diff: Option<BoxedConnect>,
}

/// What happened to a single permit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// The primary call succeeded and no comparison was made.
    Sent,
    /// Both calls succeeded and the responses were equal.
    Matched,
    /// Both calls succeeded and the responses diverged.
    Diverged,
    /// A call failed and the attempt was abandoned.
    Failed(Role),
    /// No keys were available to build a request.
    NoKeys,
}

/// Totals over all permits a worker processed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WorkerStats {
    /// Permits taken from the queue.
    pub processed: u64,
    /// Attempts abandoned because a call failed.
    pub failures: u64,
    /// Requests whose responses diverged.
    pub divergences: u64,
}

impl WorkerStats {
    fn record(&mut self, outcome: Outcome) {
        self.processed += 1;
        match outcome {
            Outcome::Failed(_) | Outcome::NoKeys => self.failures += 1,
            Outcome::Diverged => self.divergences += 1,
            Outcome::Sent | Outcome::Matched => (),
        }
    }

    fn merge(&mut self, other: WorkerStats) {
        self.processed += other.processed;
        self.failures += other.failures;
        self.divergences += other.divergences;
    }
}

/// A running pool of workers.
#[derive(Debug)]
pub struct WorkerPool {
    handles: Vec<JoinHandle<WorkerStats>>,
}

impl WorkerPool {
    /// Connects and spawns `size` workers that consume permits until `token` is cancelled or the
    /// queue is closed.
    ///
    /// Fails without spawning anything if any connection cannot be opened.
    pub fn spawn(
        size: usize,
        context: Arc<WorkerContext>,
        token: CancellationToken,
    ) -> Result<Self> {
        if size == 0 {
            return Err(Error::InvalidConfig("at least one worker is required".into()));
        }

        let workers = (0..size)
            .map(|id| Worker::connect(id, Arc::clone(&context)))
            .collect::<Result<Vec<_>>>()?;

        let handles = workers
            .into_iter()
            .map(|worker| tokio::spawn(worker.run(token.clone())))
            .collect();

        Ok(Self { handles })
    }

    /// Returns the number of workers in this pool.
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Returns `true` if the pool has no workers.
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Waits for all workers to stop and returns their combined stats.
    pub async fn join(self) -> WorkerStats {
        let mut total = WorkerStats::default();
        for handle in self.handles {
            match handle.await {
                Ok(stats) => total.merge(stats),
                Err(error) => tracing::error!(
                    error = &error as &dyn std::error::Error,
                    "worker task failed"
                ),
            }
        }
        total
    }
}

#[derive(Debug)]
struct Worker {
    id: usize,
    context: Arc<WorkerContext>,
    primary: BoxedTarget,
    diff: Option<BoxedTarget>,
}

impl Worker {
    fn connect(id: usize, context: Arc<WorkerContext>) -> Result<Self> {
        let primary = context.primary.connect()?;
        let diff = match &context.diff {
            Some(connect) => Some(connect.connect()?),
            None => None,
        };

        Ok(Self {
            id,
            context,
            primary,
            diff,
        })
    }

    async fn run(self, token: CancellationToken) -> WorkerStats {
        let mut stats = WorkerStats::default();
        tracing::trace!(worker = self.id, "worker started");

        loop {
            let permit = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                permit = self.context.queue.pop() => permit,
            };

            if permit.is_none() {
                break;
            }

            let outcome = self.send_one().await;
            tracing::trace!(worker = self.id, ?outcome, "permit processed");
            stats.record(outcome);
        }

        tracing::trace!(worker = self.id, ?stats, "worker stopped");
        stats
    }

    async fn send_one(&self) -> Outcome {
        let context = &self.context;

        let sorted_keys = match context.keys.sample(KEYS_PER_REQUEST) {
            Ok(keys) => keys,
            Err(error) => {
                tracing::error!(
                    error = &error as &dyn std::error::Error,
                    "cannot build request"
                );
                return Outcome::NoKeys;
            }
        };
        let request = SingleKeyRequest {
            collection: context.keys.collection().to_owned(),
            sorted_keys,
        };

        let Some(primary) = self.fetch(Role::Primary, &self.primary, &request).await else {
            return Outcome::Failed(Role::Primary);
        };

        let Some(diff_target) = &self.diff else {
            return Outcome::Sent;
        };
        let Some(diff) = self.fetch(Role::Diff, diff_target, &request).await else {
            return Outcome::Failed(Role::Diff);
        };

        match context.comparator.compare(&request, &primary, &diff) {
            Some(_) => Outcome::Diverged,
            None => Outcome::Matched,
        }
    }

    /// Sends the request and records its latency, or logs and counts the failure.
    async fn fetch(
        &self,
        role: Role,
        target: &BoxedTarget,
        request: &SingleKeyRequest,
    ) -> Option<SingleKeyResponse> {
        let metrics = &self.context.metrics;

        let start = Instant::now();
        match target.get_values_single(request).await {
            Ok(response) => {
                metrics.record_duration(Timer::Rtt(role), start);
                Some(response)
            }
            Err(error) => {
                metrics.increment_counter(Counter::Failures(role), 1);
                tracing::error!(
                    error = &error as &dyn std::error::Error,
                    worker = self.id,
                    target = %role,
                    "error fetching value"
                );
                None
            }
        }
    }
}
