//! Client connection state.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use mio::net::TcpStream;
use mio::{Interest, Token};

use crate::request::RequestId;
use crate::upstream::ConnectionSet;
use manifold_cluster::{ShardNode, SlotMap};

pub type ClientId = u64;

/// A client stops being read once this many of its requests are in
/// flight, and resumes at half.
pub const MAX_CLIENT_QUEUED: usize = 128;

/// Registration lifecycle: a client starts unregistered, becomes
/// `Linked` once its read interest is installed on the worker loop, and
/// `Unlinked` on teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientStatus {
    None,
    Linked,
    Unlinked,
}

/// A client's private connection set: cloned shard identities indexed
/// by name, its own slot map over the clones, and dedicated
/// send/pending queues.
#[derive(Debug)]
pub struct PrivateSet {
    pub slots: SlotMap,
    pub nodes: HashMap<String, Arc<ShardNode>>,
    pub set: ConnectionSet,
}

#[derive(Debug)]
pub struct Client {
    pub id: ClientId,
    pub stream: TcpStream,
    pub token: Token,
    pub addr: SocketAddr,
    pub status: ClientStatus,
    /// Append-only output buffer with a write cursor.
    pub obuf: BytesMut,
    pub written: usize,
    /// Request currently being parsed, if any.
    pub current: Option<RequestId>,
    /// Fully-read but not yet processed requests (pipeline split tails).
    pub to_process: VecDeque<RequestId>,
    pub private: Option<PrivateSet>,
    /// Requests of this client sitting in send/pending queues.
    pub queued: usize,
    /// Read interest dropped due to the in-flight cap.
    pub paused: bool,
    /// Interest currently registered with the poll, if any.
    pub interest: Option<Interest>,
}

impl Client {
    pub fn new(id: ClientId, stream: TcpStream, addr: SocketAddr, token: Token) -> Self {
        Self {
            id,
            stream,
            token,
            addr,
            status: ClientStatus::None,
            obuf: BytesMut::new(),
            written: 0,
            current: None,
            to_process: VecDeque::new(),
            private: None,
            queued: 0,
            paused: false,
            interest: None,
        }
    }

    /// Appends an `-ERR` line to the output buffer.
    pub fn push_error_reply(&mut self, message: &str) {
        self.obuf.extend_from_slice(b"-ERR ");
        self.obuf.extend_from_slice(message.as_bytes());
        self.obuf.extend_from_slice(b"\r\n");
    }

    /// Appends raw reply bytes to the output buffer.
    pub fn push_reply(&mut self, bytes: &[u8]) {
        self.obuf.extend_from_slice(bytes);
    }

    /// Remaining unflushed output.
    pub fn unflushed(&self) -> &[u8] {
        &self.obuf[self.written..]
    }

    pub fn has_output(&self) -> bool {
        self.written < self.obuf.len()
    }

    /// The interest this client's socket should be registered with right
    /// now, if any.
    pub fn desired_interest(&self) -> Option<Interest> {
        let read = self.status == ClientStatus::Linked && !self.paused;
        let write = self.has_output();
        match (read, write) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn test_client() -> Client {
        // A connected socket pair just to satisfy the struct; never polled.
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let std_stream = std::net::TcpStream::connect(addr).unwrap();
        std_stream.set_nonblocking(true).unwrap();
        let stream = TcpStream::from_std(std_stream);
        Client::new(1, stream, addr, Token(7))
    }

    #[test]
    fn error_replies_use_err_framing() {
        let mut client = test_client();
        client.push_error_reply("Invalid request");
        assert_eq!(&client.obuf[..], b"-ERR Invalid request\r\n");
    }

    #[test]
    fn interest_tracks_state() {
        let mut client = test_client();
        assert_eq!(client.desired_interest(), None);
        client.status = ClientStatus::Linked;
        assert_eq!(client.desired_interest(), Some(Interest::READABLE));
        client.push_reply(b"+OK\r\n");
        assert_eq!(
            client.desired_interest(),
            Some(Interest::READABLE | Interest::WRITABLE)
        );
        client.paused = true;
        assert_eq!(client.desired_interest(), Some(Interest::WRITABLE));
        client.written = client.obuf.len();
        assert_eq!(client.desired_interest(), None);
    }
}
