//! Wire-format layer for the manifold cluster proxy.
//!
//! The proxy never interprets command payloads: it parses each client
//! request only far enough to find request boundaries and the routing
//! key, and it scans upstream replies only far enough to know where one
//! frame ends. Both parsers therefore work on byte spans into the
//! original buffers and never build decoded values.

mod commands;
mod error;
mod query;
mod reply;

pub use commands::{lookup_command, CommandDef};
pub use error::{QueryError, ReplyError};
pub use query::{ArgSpan, ParseStatus, Parsed, Query};
pub use reply::ReplyReader;
