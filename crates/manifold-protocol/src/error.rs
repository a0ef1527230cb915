//! Protocol error types.

use thiserror::Error;

/// Errors raised while parsing a client request stream.
///
/// Any of these is terminal for the request being parsed: the scheduler
/// answers the client with a protocol error and frees the request.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum QueryError {
    /// A bulk argument did not start with the `$` length marker.
    #[error("expected '$' before bulk argument")]
    MissingBulkMarker,

    /// Found a byte other than `*` where the next command header was
    /// expected after a complete multi-bulk command.
    #[error("expected '*' at command boundary, found {0:#04x}")]
    ExpectedCommandHeader(u8),
}

/// Errors raised while scanning an upstream reply frame.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ReplyError {
    /// The first byte of a reply frame is not a known type prefix.
    #[error("invalid reply type prefix: {0:#04x}")]
    InvalidPrefix(u8),

    /// A length or integer line could not be parsed.
    #[error("invalid integer in reply frame")]
    InvalidInteger,

    /// Nested arrays exceed the scanner's depth limit.
    #[error("reply nesting exceeds {0} levels")]
    NestingTooDeep(usize),
}
