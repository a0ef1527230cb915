//! Multi-threaded multiplexing proxy for sharded key-value clusters.
//!
//! Clients speak the cluster's native protocol to the proxy; the proxy
//! parses each request far enough to derive its routing slot, forwards
//! it over a per-(worker, shard) multiplexed connection, and streams the
//! shard's reply back verbatim. Clients that cannot safely share a
//! connection get private per-shard sockets instead.

pub mod client;
pub mod config;
pub mod request;
pub mod route;
pub mod server;
pub mod upstream;
pub mod worker;
