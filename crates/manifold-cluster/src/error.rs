//! Cluster discovery error types.

use thiserror::Error;

/// Errors raised during bootstrap and topology construction.
///
/// All of these are fatal: the proxy cannot serve traffic without a
/// complete slot map, so `main` logs the error and exits.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("io error talking to seed node: {0}")]
    Io(#[from] std::io::Error),

    #[error("seed node replied with an error: {0}")]
    SeedError(String),

    #[error("authentication with seed node failed: {0}")]
    AuthFailed(String),

    #[error("malformed CLUSTER NODES reply: {0}")]
    MalformedNodesReply(String),

    #[error("slot map is incomplete: {missing} slots unassigned (first: {first})")]
    IncompleteSlotMap { missing: usize, first: u16 },
}
