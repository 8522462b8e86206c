//! An in-process fake key-value target for integration tests.
//!
//! ```
//! use kvload_test::server::TestServer;
//!
//! #[tokio::main]
//! async fn main() {
//!     let server = TestServer::with_keys("key", 100).await;
//!     let address = server.address();
//!     // point the load generator at `address`...
//! }
//! ```
//!
//! The server speaks the JSON protocol of the `kvload` HTTP transport: `POST {address}/getInfo`
//! answers with a sample of the configured keys, and `POST {address}/getValuesSingle` echoes
//! every requested key as its value, followed by an optional suffix. Giving two servers different
//! suffixes makes every response diverge.

use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use axum::Router;
use axum::extract::{Json, State};
use axum::http::StatusCode;
use axum::routing::post;
use bytes::{Bytes, BytesMut};
use kvload_service::target::{CollectionInfo, InfoRequest, SingleKeyRequest, SingleKeyResponse};

/// The path under which the fake target is served.
pub const RPC_PATH: &str = "/rpc/HFileService";

#[derive(Debug, Default)]
struct Store {
    keys: RwLock<Vec<Bytes>>,
    value_suffix: RwLock<Bytes>,
    fail_fetches: AtomicBool,
    info_requests: AtomicUsize,
    fetch_requests: AtomicUsize,
}

/// An in-process fake target listening on a random port on localhost.
///
/// The server is stopped when dropped.
#[derive(Debug)]
pub struct TestServer {
    handle: tokio::task::JoinHandle<()>,
    socket: SocketAddr,
    store: Arc<Store>,
}

impl TestServer {
    /// Starts a server that does not know any keys.
    pub async fn new() -> Self {
        let addr = SocketAddr::from(([127, 0, 0, 1], 0));
        let listener = TcpListener::bind(addr).unwrap();
        listener.set_nonblocking(true).unwrap();
        let socket = listener.local_addr().unwrap();

        let store = Arc::new(Store::default());
        let app = Router::new()
            .route(&format!("{RPC_PATH}/getInfo"), post(get_info))
            .route(&format!("{RPC_PATH}/getValuesSingle"), post(get_values_single))
            .with_state(Arc::clone(&store));

        let handle = tokio::spawn(async move {
            let listener = tokio::net::TcpListener::from_std(listener).unwrap();
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            handle,
            socket,
            store,
        }
    }

    /// Starts a server with `count` keys named `{prefix}-{index}`.
    pub async fn with_keys(prefix: &str, count: usize) -> Self {
        let server = Self::new().await;
        server.set_keys(prefix, count);
        server
    }

    /// Replaces the keys served from now on.
    pub fn set_keys(&self, prefix: &str, count: usize) {
        let keys = (0..count)
            .map(|index| Bytes::from(format!("{prefix}-{index:05}")))
            .collect();
        *self.store.keys.write().unwrap() = keys;
    }

    /// Appends `suffix` to every value served from now on.
    pub fn set_value_suffix(&self, suffix: &str) {
        *self.store.value_suffix.write().unwrap() = Bytes::copy_from_slice(suffix.as_bytes());
    }

    /// Makes value fetches fail with `503 Service Unavailable` while `fail` is set.
    pub fn fail_fetches(&self, fail: bool) {
        self.store.fail_fetches.store(fail, Ordering::SeqCst);
    }

    /// Returns the number of key listings served.
    pub fn info_requests(&self) -> usize {
        self.store.info_requests.load(Ordering::SeqCst)
    }

    /// Returns the number of value fetches received, including failed ones.
    pub fn fetch_requests(&self) -> usize {
        self.store.fetch_requests.load(Ordering::SeqCst)
    }

    /// Returns the base address of the RPC service.
    pub fn address(&self) -> String {
        self.url(RPC_PATH)
    }

    /// Returns a full URL pointing to the given path.
    ///
    /// This URL uses `localhost` as hostname.
    pub fn url(&self, path: &str) -> String {
        let path = path.trim_start_matches('/');
        format!("http://localhost:{}/{}", self.socket.port(), path)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn get_info(
    State(store): State<Arc<Store>>,
    Json(request): Json<InfoRequest>,
) -> Json<Vec<CollectionInfo>> {
    store.info_requests.fetch_add(1, Ordering::SeqCst);

    let keys = store.keys.read().unwrap();
    if keys.is_empty() {
        return Json(vec![]);
    }

    Json(vec![CollectionInfo {
        name: request.collection,
        random_keys: keys
            .iter()
            .take(request.sample_size as usize)
            .cloned()
            .collect(),
    }])
}

async fn get_values_single(
    State(store): State<Arc<Store>>,
    Json(request): Json<SingleKeyRequest>,
) -> Result<Json<SingleKeyResponse>, StatusCode> {
    store.fetch_requests.fetch_add(1, Ordering::SeqCst);
    if store.fail_fetches.load(Ordering::SeqCst) {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }

    let suffix = store.value_suffix.read().unwrap().clone();
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

    Ok(Json(SingleKeyResponse {
        key_count: request.sorted_keys.len() as i32,
        values,
    }))
}
