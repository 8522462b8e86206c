//! In-memory target for unit tests.
//!
//! [`FakeTarget`] is [`Clone`] so tests can keep a handle for inspection and fault injection while
//! the service owns boxed connections to the same state.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};

use crate::target::{
    BoxedTarget, CollectionInfo, Connect, InfoRequest, SingleKeyRequest, SingleKeyResponse,
    Target, TargetError, TargetResult,
};

#[derive(Debug, Default)]
struct FakeState {
    keys: Mutex<Vec<Bytes>>,
    value_suffix: Mutex<Bytes>,
    fail_info: AtomicBool,
    failing_fetches: AtomicUsize,
    info_calls: AtomicUsize,
    fetch_calls: AtomicUsize,
    connections: AtomicUsize,
}

#[derive(Clone, Debug, Default)]
pub(crate) struct FakeTarget {
    name: &'static str,
    state: Arc<FakeState>,
}

impl FakeTarget {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            state: Arc::default(),
        }
    }

    /// Creates a target serving `count` keys named `{prefix}-{index}`.
    pub fn with_keys(name: &'static str, prefix: &str, count: usize) -> Self {
        let target = Self::new(name);
        target.set_keys(prefix, count);
        target
    }

    pub fn set_keys(&self, prefix: &str, count: usize) {
        let keys = (0..count)
            .map(|i| Bytes::from(format!("{prefix}-{i:05}")))
            .collect();
        *self.state.keys.lock().unwrap() = keys;
    }

    /// Appends `suffix` to every value served from now on.
    pub fn set_value_suffix(&self, suffix: &'static str) {
        *self.state.value_suffix.lock().unwrap() = Bytes::from_static(suffix.as_bytes());
    }

    pub fn fail_info(&self, fail: bool) {
        self.state.fail_info.store(fail, Ordering::SeqCst);
    }

    /// Makes the next `count` value fetches fail with a transport error.
    pub fn fail_next_fetches(&self, count: usize) {
        self.state.failing_fetches.store(count, Ordering::SeqCst);
    }

    pub fn info_calls(&self) -> usize {
        self.state.info_calls.load(Ordering::SeqCst)
    }

    pub fn fetch_calls(&self) -> usize {
        self.state.fetch_calls.load(Ordering::SeqCst)
    }

    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Target for FakeTarget {
    async fn get_info(&self, request: &InfoRequest) -> TargetResult<Vec<CollectionInfo>> {
        self.state.info_calls.fetch_add(1, Ordering::SeqCst);
        if self.state.fail_info.load(Ordering::SeqCst) {
            return Err(TargetError::other("injected info failure"));
        }

        let keys = self.state.keys.lock().unwrap().clone();
        if keys.is_empty() {
            return Ok(vec![]);
        }

        let sample = keys.into_iter().take(request.sample_size as usize).collect();
        Ok(vec![CollectionInfo {
            name: request.collection.clone(),
            random_keys: sample,
        }])
    }

    async fn get_values_single(
        &self,
        request: &SingleKeyRequest,
    ) -> TargetResult<SingleKeyResponse> {
        self.state.fetch_calls.fetch_add(1, Ordering::SeqCst);

        let failing = self
            .state
            .failing_fetches
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(TargetError::Transport {
                context: "injected fetch failure".into(),
                cause: "connection reset".into(),
            });
        }

        let suffix = self.state.value_suffix.lock().unwrap().clone();
        let values = request
            .sorted_keys
            .iter()
            .enumerate()
            .map(|(index, key)| {
                let mut value = BytesMut::from(&key[..]);
                value.extend_from_slice(&suffix);
                (index as i32, value.freeze())
            })
            .collect();

        Ok(SingleKeyResponse {
            key_count: request.sorted_keys.len() as i32,
            values,
        })
    }
}

impl Connect for FakeTarget {
    fn name(&self) -> &str {
        self.name
    }

    fn connect(&self) -> TargetResult<BoxedTarget> {
        self.state.connections.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(self.clone()))
    }
}
