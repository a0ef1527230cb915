//! Request arena entries.
//!
//! Requests live in a per-worker map keyed by id; every relation between
//! requests (pipeline order, queue membership, handler ownership on an
//! upstream socket) is expressed through ids, never through pointers.

use std::sync::Arc;

use manifold_cluster::ShardNode;
use manifold_protocol::{CommandDef, Query};

use crate::client::ClientId;

pub type RequestId = u64;

/// One client request, from first byte to delivered reply.
#[derive(Debug)]
pub struct Request {
    pub id: RequestId,
    pub client: ClientId,
    /// Raw bytes plus incremental parse state.
    pub query: Query,
    pub command: Option<&'static CommandDef>,
    pub node: Option<Arc<ShardNode>>,
    /// Routing slot; `None` for keyless commands.
    pub slot: Option<u16>,
    /// Write cursor into the upstream socket.
    pub written: usize,
    /// This request is the one parked on its upstream socket's writable
    /// readiness (a partial write is in progress).
    pub has_write_handler: bool,
    /// This request is the designated reader of its upstream socket.
    pub has_read_handler: bool,
    /// The request travels over the client's private connection set
    /// rather than the worker's shared one.
    pub owned_by_client: bool,
    /// Counted against the owning client's in-flight cap.
    pub queued: bool,
    /// The owning client is gone; finish any in-progress upstream write
    /// to keep the shared socket framed, then discard the reply.
    pub orphaned: bool,
    /// The reconnect-and-resend escape has already been used once.
    pub retried: bool,
    /// Pipeline links for requests split out of one client read.
    pub prev: Option<RequestId>,
    pub next: Option<RequestId>,
}

impl Request {
    pub fn new(id: RequestId, client: ClientId, query: Query) -> Self {
        Self {
            id,
            client,
            query,
            command: None,
            node: None,
            slot: None,
            written: 0,
            has_write_handler: false,
            has_read_handler: false,
            owned_by_client: false,
            queued: false,
            orphaned: false,
            retried: false,
            prev: None,
            next: None,
        }
    }

    /// Name of the shard this request routed to.
    pub fn shard_name(&self) -> Option<&str> {
        self.node.as_deref().map(|n| n.name.as_str())
    }
}
