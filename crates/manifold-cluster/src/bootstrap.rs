//! One-shot cluster discovery.
//!
//! Runs on the main thread before any worker starts, so plain blocking
//! I/O with timeouts is fine here: connect to the seed, optionally
//! authenticate, issue `CLUSTER NODES`, and build the immutable cluster
//! from the reply.

use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use manifold_protocol::ReplyReader;
use tracing::info;

use crate::error::ClusterError;
use crate::topology::Cluster;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const IO_TIMEOUT: Duration = Duration::from_secs(10);

/// Fetches the cluster topology from a seed node.
pub fn fetch_cluster(host: &str, port: u16, auth: Option<&str>) -> Result<Cluster, ClusterError> {
    info!("fetching cluster configuration from {host}:{port}");
    let addr = (host, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "seed did not resolve"))?;
    let mut stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)?;
    stream.set_read_timeout(Some(IO_TIMEOUT))?;
    stream.set_write_timeout(Some(IO_TIMEOUT))?;

    if let Some(password) = auth {
        write_command(&mut stream, &[b"AUTH", password.as_bytes()])?;
        let frame = read_frame(&mut stream)?;
        if frame.first() != Some(&b'+') {
            return Err(ClusterError::AuthFailed(frame_text(&frame)));
        }
    }

    write_command(&mut stream, &[b"CLUSTER", b"NODES"])?;
    let frame = read_frame(&mut stream)?;
    match frame.first() {
        Some(b'-') => Err(ClusterError::SeedError(frame_text(&frame))),
        Some(b'$') => {
            let payload = bulk_payload(&frame)?;
            Cluster::from_nodes_reply(&payload, Some((host, port)))
        }
        _ => Err(ClusterError::MalformedNodesReply(
            "expected a bulk string reply".into(),
        )),
    }
}

/// Writes one multi-bulk command.
fn write_command(stream: &mut TcpStream, args: &[&[u8]]) -> Result<(), ClusterError> {
    let mut out = Vec::new();
    out.extend_from_slice(format!("*{}\r\n", args.len()).as_bytes());
    for arg in args {
        out.extend_from_slice(format!("${}\r\n", arg.len()).as_bytes());
        out.extend_from_slice(arg);
        out.extend_from_slice(b"\r\n");
    }
    stream.write_all(&out)?;
    Ok(())
}

/// Reads exactly one complete reply frame.
fn read_frame(stream: &mut TcpStream) -> Result<Vec<u8>, ClusterError> {
    let mut reader = ReplyReader::new();
    let mut chunk = [0u8; 4096];
    loop {
        if let Some(len) = reader
            .frame_len()
            .map_err(|e| ClusterError::MalformedNodesReply(e.to_string()))?
        {
            return Ok(reader.bytes()[..len].to_vec());
        }
        let n = stream.read(&mut chunk)?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "seed closed the connection mid-reply",
            )
            .into());
        }
        reader.buffer_mut().extend_from_slice(&chunk[..n]);
    }
}

/// Extracts the payload of a `$N\r\n…\r\n` frame as text.
fn bulk_payload(frame: &[u8]) -> Result<String, ClusterError> {
    let header_end = frame
        .windows(2)
        .position(|w| w == b"\r\n")
        .ok_or_else(|| ClusterError::MalformedNodesReply("unterminated bulk header".into()))?;
    let body = &frame[header_end + 2..frame.len().saturating_sub(2)];
    Ok(String::from_utf8_lossy(body).into_owned())
}

/// Human-readable text of a status or error line.
fn frame_text(frame: &[u8]) -> String {
    let line = frame
        .strip_suffix(b"\r\n")
        .unwrap_or(frame);
    String::from_utf8_lossy(&line[1.min(line.len())..]).into_owned()
}
