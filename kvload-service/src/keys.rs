//! The shared cache of sample keys that requests are built from.
//!
//! [`KeyCache`] owns the current [`KeySnapshot`] behind a read/write lock. Workers sample from it
//! concurrently under the shared lock, while [`KeyCache::load`] swaps in a complete new snapshot
//! under the exclusive lock. Readers therefore see either the old or the new snapshot, never a
//! mixture of both.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use bytes::Bytes;
use rand::Rng;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::target::{BoxedTarget, InfoRequest};

/// An immutable, non-empty set of sample keys.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeySnapshot {
    keys: Arc<[Bytes]>,
}

impl KeySnapshot {
    /// Creates a snapshot from the given keys.
    ///
    /// Returns `None` if `keys` is empty.
    pub fn new(keys: Vec<Bytes>) -> Option<Self> {
        if keys.is_empty() {
            return None;
        }

        Some(Self { keys: keys.into() })
    }

    /// Returns the number of keys in this snapshot.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Always `false`, snapshots are never empty.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Returns the keys in their original order.
    pub fn keys(&self) -> &[Bytes] {
        &self.keys
    }
}

/// Holds the current key snapshot of a collection and refreshes it from a target.
#[derive(Debug)]
pub struct KeyCache {
    collection: String,
    sample_size: u64,
    source: BoxedTarget,
    snapshot: RwLock<Option<KeySnapshot>>,
}

impl KeyCache {
    /// Creates an empty cache that lists keys of `collection` through `source`.
    ///
    /// The cache cannot be sampled until [`load`](Self::load) succeeded once.
    pub fn new(collection: impl Into<String>, sample_size: u64, source: BoxedTarget) -> Self {
        Self {
            collection: collection.into(),
            sample_size,
            source,
            snapshot: RwLock::new(None),
        }
    }

    /// Returns the name of the collection keys are drawn from.
    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Fetches a fresh sample of keys and publishes it as the new snapshot.
    ///
    /// Returns the number of keys in the new snapshot. On any error the previous snapshot is
    /// retained unchanged.
    pub async fn load(&self) -> Result<usize> {
        let request = InfoRequest {
            collection: self.collection.clone(),
            sample_size: self.sample_size,
        };

        let infos = self.source.get_info(&request).await?;
        let keys = infos
            .into_iter()
            .next()
            .map(|info| info.random_keys)
            .unwrap_or_default();

        let snapshot = KeySnapshot::new(keys).ok_or_else(|| Error::EmptyKeySet {
            collection: self.collection.clone(),
        })?;

        let count = snapshot.len();
        self.publish(snapshot);
        Ok(count)
    }

    /// Replaces the current snapshot.
    pub fn publish(&self, snapshot: KeySnapshot) {
        // NB: We intentionally use unwrap and crash if the lock is poisoned.
        *self.snapshot.write().unwrap() = Some(snapshot);
    }

    /// Returns the current snapshot, if one was published.
    pub fn snapshot(&self) -> Option<KeySnapshot> {
        self.snapshot.read().unwrap().clone()
    }

    /// Draws `n` keys uniformly at random, with replacement, from the current snapshot.
    ///
    /// The keys are returned in ascending order of their position in the snapshot.
    pub fn sample(&self, n: usize) -> Result<Vec<Bytes>> {
        self.sample_with(&mut rand::rng(), n)
    }

    /// Like [`sample`](Self::sample), but draws indices from the given RNG.
    pub fn sample_with<R: Rng + ?Sized>(&self, rng: &mut R, n: usize) -> Result<Vec<Bytes>> {
        let guard = self.snapshot.read().unwrap();
        let snapshot = guard.as_ref().ok_or(Error::NoKeysAvailable)?;

        let mut indexes: Vec<usize> = (0..n)
            .map(|_| rng.random_range(0..snapshot.len()))
            .collect();
        indexes.sort_unstable();

        Ok(indexes
            .into_iter()
            .map(|index| snapshot.keys[index].clone())
            .collect())
    }

    /// Reloads the snapshot every `period` until `token` is cancelled.
    ///
    /// The first reload happens one period after the call, since the initial load is expected to
    /// have happened during startup. Failures are logged and the previous snapshot stays in place.
    pub async fn refresh_loop(&self, period: Duration, token: CancellationToken) {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }

            tracing::debug!(collection = %self.collection, "fetching new keys");
            tokio::select! {
                _ = token.cancelled() => break,
                result = self.load() => match result {
                    Ok(count) => tracing::info!(count, "refreshed key snapshot"),
                    Err(error) => tracing::error!(
                        error = &error as &dyn std::error::Error,
                        "failed to refresh keys, keeping previous snapshot"
                    ),
                },
            }
        }

        tracing::debug!("key refresh stopped");
    }
}
