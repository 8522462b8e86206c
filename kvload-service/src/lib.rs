//! The load generation engine.
//!
//! A [`LoadService`] replays single-key fetches against a key-value target at a fixed rate. Keys
//! are sampled from a periodically refreshed [`KeyCache`], permits flow from a [`RateGenerator`]
//! through a bounded [`PermitQueue`] to a fixed [`WorkerPool`], and excess permits are shed rather
//! than queued without bound. In diff mode, every request is also sent to a second target and the
//! two responses are compared structurally by a [`DiffComparator`].
//!
//! This crate does not know about any transport. Targets are provided through the [`Connect`] and
//! [`Target`] traits, and metrics leave through [`MetricsSink`].
#![warn(missing_docs)]
#![warn(missing_debug_implementations)]

pub mod diff;
pub mod error;
pub mod generator;
pub mod keys;
pub mod metrics;
pub mod queue;
pub mod service;
pub mod target;
pub mod worker;

#[cfg(test)]
mod testutils;

pub use diff::{DiffComparator, DivergenceEvent, Mismatch, MismatchKind};
pub use error::{Error, Result};
pub use generator::{GeneratorStats, RateGenerator};
pub use keys::{KeyCache, KeySnapshot};
pub use metrics::{LocalMetrics, MetricsSink, MetricsSnapshot};
pub use queue::{PermitQueue, queue_capacity};
pub use service::{LoadConfig, LoadService, RunStats};
pub use target::{BoxedConnect, BoxedTarget, Connect, Role, Target, TargetError, TargetResult};
pub use worker::{WorkerPool, WorkerStats};
