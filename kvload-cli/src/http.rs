//! The HTTP/JSON transport to key-value targets.
//!
//! Every RPC method is a `POST` of the JSON encoded request to `{address}/{method}`, answered with
//! the JSON encoded response. Any non-success status is a failed call.

use std::fmt;
use std::sync::Arc;

use kvload_service::target::{
    BoxedTarget, CollectionInfo, Connect, InfoRequest, SingleKeyRequest, SingleKeyResponse,
    Target, TargetError, TargetResult,
};
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Path of the RPC service, used for addresses that do not specify one.
pub const DEFAULT_RPC_PATH: &str = "/rpc/HFileService";

/// A normalized target address along with the name it is reported under.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TargetAddress {
    /// Name used in logs and metric tags.
    pub name: String,
    /// Full base URL of the RPC service.
    pub url: String,
}

impl TargetAddress {
    /// Parses an address given on the command line or in the configuration.
    ///
    /// `name=address` sets the name explicitly. Otherwise, the name is derived from the address by
    /// stripping `http://` and replacing `.`, `:` and `/` with underscores. Addresses without a path
    /// receive [`DEFAULT_RPC_PATH`], and addresses without a scheme are assumed to be `http://`.
    pub fn parse(spec: &str) -> Self {
        let (name, address) = match spec.split_once('=') {
            Some((name, address)) => (name.to_owned(), address),
            None => (derive_name(spec), spec),
        };

        let mut url = address.to_owned();
        if !has_path(address) {
            tracing::info!(address, "address has no path, appending {DEFAULT_RPC_PATH}");
            url.push_str(DEFAULT_RPC_PATH);
        }
        if !url.starts_with("http") {
            url.insert_str(0, "http://");
        }

        Self { name, url }
    }
}

impl fmt::Display for TargetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.url)
    }
}

fn derive_name(address: &str) -> String {
    address.replace("http://", "").replace(['.', ':', '/'], "_")
}

fn has_path(address: &str) -> bool {
    let authority_and_path = address
        .split_once("://")
        .map_or(address, |(_scheme, rest)| rest);
    authority_and_path.contains('/')
}

/// Opens HTTP connections to a single target.
///
/// Every connection uses its own HTTP client, so no two connections share a connection pool.
#[derive(Debug)]
pub struct HttpConnect {
    address: TargetAddress,
}

impl HttpConnect {
    /// Creates a connector for the given address.
    pub fn new(address: TargetAddress) -> Self {
        Self { address }
    }
}

impl Connect for HttpConnect {
    fn name(&self) -> &str {
        &self.address.name
    }

    fn connect(&self) -> TargetResult<BoxedTarget> {
        let http = reqwest::Client::builder()
            .pool_max_idle_per_host(1)
            .build()
            .map_err(|cause| TargetError::Transport {
                context: format!("failed to create HTTP client for {}", self.address),
                cause: Box::new(cause),
            })?;

        Ok(Box::new(HttpTarget {
            base: self.address.url.trim_end_matches('/').into(),
            http,
        }))
    }
}

/// A single connection to a target speaking the HTTP/JSON protocol.
#[derive(Debug)]
pub struct HttpTarget {
    base: Arc<str>,
    http: reqwest::Client,
}

impl HttpTarget {
    async fn call<Req, Resp>(&self, method: &str, request: &Req) -> TargetResult<Resp>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let url = format!("{}/{method}", self.base);

        let response = self
            .http
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|cause| TargetError::Transport {
                context: format!("failed to call {url}"),
                cause: Box::new(cause),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(TargetError::Status {
                status: status.as_u16(),
                context: url,
            });
        }

        response.json().await.map_err(|cause| TargetError::Decode {
            context: format!("invalid {method} response"),
            cause: Box::new(cause),
        })
    }
}

#[async_trait::async_trait]
impl Target for HttpTarget {
    async fn get_info(&self, request: &InfoRequest) -> TargetResult<Vec<CollectionInfo>> {
        self.call("getInfo", request).await
    }

    async fn get_values_single(
        &self,
        request: &SingleKeyRequest,
    ) -> TargetResult<SingleKeyResponse> {
        self.call("getValuesSingle", request).await
    }
}
