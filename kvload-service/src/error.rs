//! Error types of the load service.

use thiserror::Error;

use crate::target::TargetError;

/// Errors that can occur in the load service.
#[derive(Debug, Error)]
pub enum Error {
    /// The key listing returned no usable keys for the collection.
    #[error("key listing for collection `{collection}` contained no keys")]
    EmptyKeySet {
        /// The collection that was queried.
        collection: String,
    },

    /// Keys were requested before any snapshot was published.
    #[error("no keys available, the key cache has not been loaded")]
    NoKeysAvailable,

    /// An error from one of the targets.
    #[error("target error: {0}")]
    Target(#[from] TargetError),

    /// The service was configured with values it cannot run with.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Result type for load service operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;
