//! Upstream shard connections.
//!
//! One connection per (worker, shard) for the shared set, plus one per
//! (client, shard) for clients in private mode. Connections are opened
//! lazily, with the node's connect mutex held so workers never race a
//! connect to the same shard. The connect itself is plain blocking I/O
//! bounded by socket timeouts; the AUTH round-trip has to complete
//! before the socket joins the event loop anyway.

use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::net::ToSocketAddrs;
use std::sync::Arc;
use std::time::Duration;

use manifold_cluster::ShardNode;
use manifold_protocol::ReplyReader;
use mio::net::TcpStream;
use mio::{Interest, Token};
use socket2::{SockRef, TcpKeepalive};
use tracing::debug;

use crate::request::RequestId;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const AUTH_TIMEOUT: Duration = Duration::from_secs(5);

/// Keepalive on shard sockets; aggressive so dead peers surface quickly
/// even under long-running commands.
const NODE_KEEPALIVE: Duration = Duration::from_secs(15);

/// One queue pair plus the upstream sockets it feeds. The worker owns a
/// shared instance; each private-mode client owns a mirror.
#[derive(Debug, Default)]
pub struct ConnectionSet {
    /// Parsed requests not yet (fully) written upstream. FIFO across all
    /// shards and clients of this set.
    pub to_send: VecDeque<RequestId>,
    /// In-flight requests awaiting replies. FIFO per upstream socket.
    pub pending: VecDeque<RequestId>,
    /// Connections keyed by shard name.
    pub conns: HashMap<String, UpstreamConn>,
}

impl ConnectionSet {
    pub fn new() -> Self {
        Self::default()
    }
}

/// A socket to one shard, with its buffered reply reader and the
/// requests currently holding its write/read readiness.
#[derive(Debug)]
pub struct UpstreamConn {
    pub node: Arc<ShardNode>,
    stream: Option<TcpStream>,
    pub token: Option<Token>,
    pub interest: Option<Interest>,
    pub reader: ReplyReader,
    /// Request mid-write on this socket, parked on writable readiness.
    pub writer: Option<RequestId>,
    /// Request designated to own the next reply.
    pub reading: Option<RequestId>,
}

impl UpstreamConn {
    pub fn new(node: Arc<ShardNode>) -> Self {
        Self {
            node,
            stream: None,
            token: None,
            interest: None,
            reader: ReplyReader::new(),
            writer: None,
            reading: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    pub fn stream_mut(&mut self) -> Option<&mut TcpStream> {
        self.stream.as_mut()
    }

    /// Opens the socket, runs the AUTH handshake when configured, and
    /// leaves the stream nonblocking and ready to register.
    ///
    /// Serialized per node: concurrent connect attempts from different
    /// workers take the node's connect mutex.
    pub fn connect(&mut self, auth: Option<&str>) -> io::Result<()> {
        let node = Arc::clone(&self.node);
        let _guard = node.connect_guard();
        debug!("connecting to node {}", node.addr());

        let addr = (node.ip.as_str(), node.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "node did not resolve"))?;
        let stream = std::net::TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)?;

        let sock = SockRef::from(&stream);
        sock.set_nodelay(true)?;
        sock.set_tcp_keepalive(&TcpKeepalive::new().with_time(NODE_KEEPALIVE))?;

        if let Some(password) = auth {
            authenticate(&stream, password)?;
        }

        stream.set_nonblocking(true)?;
        self.stream = Some(TcpStream::from_std(stream));
        self.token = None;
        self.interest = None;
        self.reader.clear();
        self.writer = None;
        self.reading = None;
        Ok(())
    }

    /// Drops the socket. Registration cleanup is the worker's job.
    pub fn reset(&mut self) {
        self.stream = None;
        self.token = None;
        self.interest = None;
        self.reader.clear();
        self.writer = None;
        self.reading = None;
    }
}

/// Synchronous `AUTH` round-trip; any non-OK reply fails the connection.
fn authenticate(stream: &std::net::TcpStream, password: &str) -> io::Result<()> {
    let mut stream = stream;
    stream.set_read_timeout(Some(AUTH_TIMEOUT))?;
    stream.set_write_timeout(Some(AUTH_TIMEOUT))?;

    let mut command = Vec::new();
    command.extend_from_slice(b"*2\r\n$4\r\nAUTH\r\n");
    command.extend_from_slice(format!("${}\r\n{password}\r\n", password.len()).as_bytes());
    stream.write_all(&command)?;

    let mut reader = ReplyReader::new();
    let mut chunk = [0u8; 512];
    let frame = loop {
        if let Some(len) = reader
            .frame_len()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?
        {
            break reader.take_frame(len);
        }
        let n = stream.read(&mut chunk)?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "node closed the connection during AUTH",
            ));
        }
        reader.buffer_mut().extend_from_slice(&chunk[..n]);
    };
    if frame.first() != Some(&b'+') {
        return Err(io::Error::new(
            io::ErrorKind::PermissionDenied,
            format!("AUTH rejected: {}", String::from_utf8_lossy(&frame)),
        ));
    }
    stream.set_read_timeout(None)?;
    stream.set_write_timeout(None)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    #[test]
    fn connect_runs_auth_handshake() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 256];
            let n = stream.read(&mut buf).unwrap();
            let received = buf[..n].to_vec();
            stream.write_all(b"+OK\r\n").unwrap();
            received
        });

        let node = Arc::new(ShardNode::new(
            "n1".into(),
            addr.ip().to_string(),
            addr.port(),
        ));
        let mut conn = UpstreamConn::new(node);
        conn.connect(Some("hunter2")).unwrap();
        assert!(conn.is_connected());

        let received = server.join().unwrap();
        assert_eq!(received, b"*2\r\n$4\r\nAUTH\r\n$7\r\nhunter2\r\n");
    }

    #[test]
    fn auth_rejection_fails_connect() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 256];
            let _ = stream.read(&mut buf).unwrap();
            stream.write_all(b"-ERR invalid password\r\n").unwrap();
        });

        let node = Arc::new(ShardNode::new(
            "n1".into(),
            addr.ip().to_string(),
            addr.port(),
        ));
        let mut conn = UpstreamConn::new(node);
        let err = conn.connect(Some("wrong")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::PermissionDenied);
        assert!(!conn.is_connected());
    }

    #[test]
    fn connect_without_auth_sends_nothing() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let node = Arc::new(ShardNode::new(
            "n1".into(),
            addr.ip().to_string(),
            addr.port(),
        ));
        let mut conn = UpstreamConn::new(node);
        conn.connect(None).unwrap();
        assert!(conn.is_connected());
        assert!(conn.writer.is_none() && conn.reading.is_none());
    }

    #[test]
    fn connect_refused_is_an_error() {
        // Bind then drop to get a port with (very likely) no listener.
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let node = Arc::new(ShardNode::new("n1".into(), "127.0.0.1".into(), port));
        let mut conn = UpstreamConn::new(node);
        assert!(conn.connect(None).is_err());
    }
}
