//! Error types for the coordinator crate.

use thiserror::Error;

/// Errors produced by the coordinator, ring, and storage layers.
#[derive(Debug, Error)]
pub enum Error {
    /// Option validation failed; the message names the offending field.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(&'static str),

    /// An operation was called before `Coordinator::start`.
    #[error("cluster not started")]
    NotStarted,

    /// Lifecycle misuse, e.g. starting a destroyed coordinator.
    #[error("cluster already started")]
    AlreadyStarted,

    /// The requested node was not found in the store or the ring.
    #[error("node {0} not found")]
    NotFound(String),

    /// A node with this id is already registered.
    #[error("node {0} already exists")]
    AlreadyExists(String),

    /// A node with an empty id was passed to the ring.
    #[error("node id cannot be empty")]
    InvalidNode,

    /// Every node in the ring is inactive.
    #[error("no active nodes available in the hash ring")]
    NoActiveNodes,

    /// A key lookup or distribution was attempted on an empty ring.
    #[error("no nodes in the hash ring")]
    EmptyRing,

    /// A persisted member record exists but a required field is missing
    /// or unparseable.
    #[error("{0} not found for node")]
    FieldMissing(&'static str),

    /// An error from the underlying key-value store.
    #[error("store unavailable: {0}")]
    StoreUnavailable(#[from] redis::RedisError),

    /// A health probe failed. Carried on the internal event channel and
    /// logged; never returned from public operations.
    #[error("health probe to {url} failed: {reason}")]
    ProbeFailed { url: String, reason: String },
}
