//! The RPC surface of a key-value target as seen by the load generator.
//!
//! The load service never talks to the network itself. It consumes a [`Target`] for each
//! connection it needs and obtains those connections through a [`Connect`] implementation, which
//! is provided by the transport layer.

use std::collections::BTreeMap;
use std::fmt::{self, Debug};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A type-erased [`Target`] connection.
pub type BoxedTarget = Box<dyn Target>;

/// A type-erased [`Connect`] implementation.
pub type BoxedConnect = Box<dyn Connect>;

/// A single connection to a key-value serving target.
#[async_trait::async_trait]
pub trait Target: Debug + Send + Sync + 'static {
    /// Lists information about a collection, including a random sample of its keys.
    async fn get_info(&self, request: &InfoRequest) -> TargetResult<Vec<CollectionInfo>>;

    /// Fetches the values for a sorted list of keys from a single collection.
    async fn get_values_single(&self, request: &SingleKeyRequest)
    -> TargetResult<SingleKeyResponse>;
}

/// Opens private connections to a target.
///
/// Every call must return a connection that is not shared with any previously returned one.
pub trait Connect: Debug + Send + Sync + 'static {
    /// Human readable name of the target, used in logs and metric tags.
    fn name(&self) -> &str;

    /// Opens a new connection.
    fn connect(&self) -> TargetResult<BoxedTarget>;
}

/// Request for collection information and a sample of random keys.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InfoRequest {
    /// Name of the collection to describe.
    pub collection: String,
    /// Number of random keys to include in the response.
    pub sample_size: u64,
}

/// Information about a single collection.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionInfo {
    /// Name of the collection.
    pub name: String,
    /// Randomly chosen keys contained in the collection.
    #[serde(default)]
    pub random_keys: Vec<Bytes>,
}

/// Request for the values of one or more keys, which must be sorted ascending.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SingleKeyRequest {
    /// Name of the collection to read from.
    pub collection: String,
    /// The keys to look up, in ascending order.
    pub sorted_keys: Vec<Bytes>,
}

/// Values returned for a [`SingleKeyRequest`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SingleKeyResponse {
    /// Number of requested keys that were found.
    pub key_count: i32,
    /// Found values, keyed by the position of their key in the request.
    #[serde(default)]
    pub values: BTreeMap<i32, Bytes>,
}

/// The side of a comparison a connection belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Role {
    /// The authoritative target whose latency is the headline measurement.
    Primary,
    /// The secondary target used only to detect divergence.
    Diff,
}

impl Role {
    /// Returns the lowercase name of this role.
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Primary => "primary",
            Role::Diff => "diff",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors returned by [`Target`] and [`Connect`] implementations.
#[derive(Debug, Error)]
pub enum TargetError {
    /// The request could not be delivered or the response could not be received.
    #[error("transport error: {context}")]
    Transport {
        /// What was being attempted.
        context: String,
        /// The underlying I/O or protocol error.
        #[source]
        cause: Box<dyn std::error::Error + Send + Sync>,
    },

    /// The target answered with an error status.
    #[error("target responded with status {status}: {context}")]
    Status {
        /// The status code returned by the target.
        status: u16,
        /// What was being attempted.
        context: String,
    },

    /// The response could not be decoded.
    #[error("decode error: {context}")]
    Decode {
        /// What was being decoded.
        context: String,
        /// The decoder error.
        #[source]
        cause: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Any other error specific to a transport.
    #[error("target error: {context}")]
    Generic {
        /// Description of the error.
        context: String,
        /// The underlying error, if any.
        #[source]
        cause: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl TargetError {
    /// Creates a [`TargetError::Generic`] without an underlying cause.
    pub fn other(context: impl Into<String>) -> Self {
        Self::Generic {
            context: context.into(),
            cause: None,
        }
    }
}

/// Result type for target operations.
pub type TargetResult<T> = Result<T, TargetError>;
