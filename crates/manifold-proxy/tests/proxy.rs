//! Socket-level tests: a running proxy in front of in-process fake
//! shards.
//!
//! Each fake shard accepts connections, splits the byte stream into
//! requests with the real request parser, records the raw bytes of
//! every request it receives, and answers each one with a bulk echo of
//! the request's last argument, which makes replies attributable to
//! the request that produced them.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use manifold_cluster::{key_slot, Cluster, ShardNode, SlotRange};
use manifold_protocol::{Parsed, Query};
use manifold_proxy::config::{MultiplexingPolicy, ProxyConfig};
use manifold_proxy::server::{self, ProxyHandle};

const IO_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, PartialEq)]
enum ShardBehavior {
    /// Echo the last argument of every request as a bulk string.
    Echo,
    /// Close the first connection after one request, without replying;
    /// act like `Echo` afterwards.
    DropFirstConnection,
}

struct FakeShard {
    addr: SocketAddr,
    connections: Arc<AtomicUsize>,
    received: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl FakeShard {
    fn spawn(behavior: ShardBehavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let connections = Arc::new(AtomicUsize::new(0));
        let received = Arc::new(Mutex::new(Vec::new()));

        let conn_counter = Arc::clone(&connections);
        let recorder = Arc::clone(&received);
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                let index = conn_counter.fetch_add(1, Ordering::SeqCst);
                let recorder = Arc::clone(&recorder);
                thread::spawn(move || serve_connection(stream, behavior, index, recorder));
            }
        });

        Self {
            addr,
            connections,
            received,
        }
    }

    fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    fn received(&self) -> Vec<Vec<u8>> {
        self.received.lock().unwrap().clone()
    }
}

fn serve_connection(
    mut stream: TcpStream,
    behavior: ShardBehavior,
    conn_index: usize,
    recorder: Arc<Mutex<Vec<Vec<u8>>>>,
) {
    let mut query = Query::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = match stream.read(&mut chunk) {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        query.buffer_mut().extend_from_slice(&chunk[..n]);
        loop {
            let (raw, tail) = match query.parse() {
                Parsed::Incomplete => break,
                Parsed::Error(_) => return,
                Parsed::Complete => (query.raw().to_vec(), None),
                Parsed::Split(tail) => (query.raw().to_vec(), Some(tail)),
            };
            recorder.lock().unwrap().push(raw);
            if behavior == ShardBehavior::DropFirstConnection && conn_index == 0 {
                return;
            }
            let last = query.arg(query.argc() - 1).unwrap_or_default().to_vec();
            let reply = format!("${}\r\n", last.len());
            let mut out = reply.into_bytes();
            out.extend_from_slice(&last);
            out.extend_from_slice(b"\r\n");
            if stream.write_all(&out).is_err() {
                return;
            }
            query = match tail {
                Some(tail) => Query::from_tail(tail),
                None => Query::new(),
            };
        }
    }
}

const RANGE_A: SlotRange = SlotRange { start: 0, end: 8191 };
const RANGE_B: SlotRange = SlotRange { start: 8192, end: 16383 };

fn shard_node(name: &str, addr: SocketAddr, range: SlotRange) -> Arc<ShardNode> {
    let mut node = ShardNode::new(name.into(), addr.ip().to_string(), addr.port());
    node.slot_ranges.push(range);
    Arc::new(node)
}

fn start_proxy(policy: MultiplexingPolicy, a: &FakeShard, b: &FakeShard) -> ProxyHandle {
    let cluster = Cluster::new(vec![
        shard_node("shard-a", a.addr, RANGE_A),
        shard_node("shard-b", b.addr, RANGE_B),
    ])
    .unwrap();
    let cfg = ProxyConfig {
        port: 0,
        maxclients: 1000,
        threads: 2,
        tcpkeepalive: 0,
        multiplexing: policy,
        auth: None,
        dump_queries: false,
        dump_buffer: false,
    };
    server::start(cfg, cluster).unwrap()
}

fn connect(proxy: &ProxyHandle) -> TcpStream {
    let stream = TcpStream::connect(proxy.local_addr()).unwrap();
    stream.set_read_timeout(Some(IO_TIMEOUT)).unwrap();
    stream.set_nodelay(true).unwrap();
    stream
}

fn read_exact_len(stream: &mut TcpStream, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).unwrap();
    buf
}

/// First key of the form `k<i>` whose slot falls inside `range`.
fn key_in(range: SlotRange) -> String {
    (0u32..)
        .map(|i| format!("k{i}"))
        .find(|k| range.contains(key_slot(k.as_bytes())))
        .unwrap()
}

fn bulk(arg: &str) -> String {
    format!("${}\r\n{arg}\r\n", arg.len())
}

fn command(args: &[&str]) -> Vec<u8> {
    let mut out = format!("*{}\r\n", args.len()).into_bytes();
    for arg in args {
        out.extend_from_slice(bulk(arg).as_bytes());
    }
    out
}

#[test]
fn forwards_request_bytes_verbatim() {
    let a = FakeShard::spawn(ShardBehavior::Echo);
    let b = FakeShard::spawn(ShardBehavior::Echo);
    let proxy = start_proxy(MultiplexingPolicy::Never, &a, &b);

    let key = key_in(RANGE_A);
    let request = command(&["SET", &key, "v"]);
    let mut client = connect(&proxy);
    client.write_all(&request).unwrap();

    let reply = read_exact_len(&mut client, bulk("v").len());
    assert_eq!(reply, bulk("v").into_bytes());
    assert_eq!(a.received(), vec![request]);
    assert!(b.received().is_empty());
}

#[test]
fn pipelined_cross_shard_requests_reply_in_order() {
    let a = FakeShard::spawn(ShardBehavior::Echo);
    let b = FakeShard::spawn(ShardBehavior::Echo);
    let proxy = start_proxy(MultiplexingPolicy::Never, &a, &b);

    let ka = key_in(RANGE_A);
    let kb = key_in(RANGE_B);
    // One buffer, two commands: the first carries an empty trailing
    // argument, the second goes to the other shard.
    let mut buffer = command(&["GET", &ka, ""]);
    buffer.extend_from_slice(&command(&["GET", &kb]));

    let mut client = connect(&proxy);
    client.write_all(&buffer).unwrap();

    let expected = format!("{}{}", bulk(""), bulk(&kb));
    let replies = read_exact_len(&mut client, expected.len());
    assert_eq!(replies, expected.into_bytes());

    assert_eq!(a.received(), vec![command(&["GET", &ka, ""])]);
    assert_eq!(b.received(), vec![command(&["GET", &kb])]);
}

#[test]
fn pipelined_same_shard_replies_are_fifo() {
    let a = FakeShard::spawn(ShardBehavior::Echo);
    let b = FakeShard::spawn(ShardBehavior::Echo);
    let proxy = start_proxy(MultiplexingPolicy::Never, &a, &b);

    let k1 = key_in(RANGE_A);
    let k2 = (0u32..)
        .map(|i| format!("q{i}"))
        .find(|k| RANGE_A.contains(key_slot(k.as_bytes())))
        .unwrap();
    let mut buffer = command(&["GET", &k1]);
    buffer.extend_from_slice(&command(&["GET", &k2]));

    let mut client = connect(&proxy);
    client.write_all(&buffer).unwrap();

    let expected = format!("{}{}", bulk(&k1), bulk(&k2));
    let replies = read_exact_len(&mut client, expected.len());
    assert_eq!(replies, expected.into_bytes());
}

#[test]
fn cross_slot_multi_key_query_is_rejected_without_upstream_write() {
    let a = FakeShard::spawn(ShardBehavior::Echo);
    let b = FakeShard::spawn(ShardBehavior::Echo);
    let proxy = start_proxy(MultiplexingPolicy::Never, &a, &b);

    let ka = key_in(RANGE_A);
    let kb = key_in(RANGE_B);
    let mut client = connect(&proxy);
    client
        .write_all(&command(&["MSET", &ka, "1", &kb, "2"]))
        .unwrap();

    let expected = b"-ERR Queries with keys belonging to different nodes are not supported\r\n";
    let reply = read_exact_len(&mut client, expected.len());
    assert_eq!(reply, expected);

    thread::sleep(Duration::from_millis(200));
    assert!(a.received().is_empty());
    assert!(b.received().is_empty());
}

#[test]
fn unsupported_and_unknown_commands_are_rejected() {
    let a = FakeShard::spawn(ShardBehavior::Echo);
    let b = FakeShard::spawn(ShardBehavior::Echo);
    let proxy = start_proxy(MultiplexingPolicy::Never, &a, &b);

    let mut client = connect(&proxy);
    client.write_all(&command(&["SUBSCRIBE", "news"])).unwrap();
    let expected = b"-ERR Unsupported command: 'subscribe'\r\n";
    assert_eq!(read_exact_len(&mut client, expected.len()), expected);

    client.write_all(&command(&["FROBNICATE", "x"])).unwrap();
    let expected = b"-ERR Unsupported command: 'frobnicate'\r\n";
    assert_eq!(read_exact_len(&mut client, expected.len()), expected);
}

#[test]
fn inline_commands_are_served() {
    let a = FakeShard::spawn(ShardBehavior::Echo);
    let b = FakeShard::spawn(ShardBehavior::Echo);
    let proxy = start_proxy(MultiplexingPolicy::Never, &a, &b);

    let mut client = connect(&proxy);
    client.write_all(b"PING\r\n").unwrap();
    let expected = bulk("PING");
    assert_eq!(
        read_exact_len(&mut client, expected.len()),
        expected.into_bytes()
    );
    assert_eq!(a.received(), vec![b"PING\r\n".to_vec()]);
}

#[test]
fn always_disabled_multiplexing_gives_each_client_its_own_socket() {
    let a = FakeShard::spawn(ShardBehavior::Echo);
    let b = FakeShard::spawn(ShardBehavior::Echo);
    let proxy = start_proxy(MultiplexingPolicy::Always, &a, &b);

    // Keyless commands route to the first node in slot order: shard A.
    let mut first = connect(&proxy);
    let mut second = connect(&proxy);
    for client in [&mut first, &mut second] {
        client.write_all(&command(&["PING"])).unwrap();
        let expected = bulk("PING");
        assert_eq!(
            read_exact_len(client, expected.len()),
            expected.into_bytes()
        );
    }
    assert_eq!(a.connection_count(), 2);
}

#[test]
fn shared_multiplexing_reuses_one_socket_per_worker() {
    let a = FakeShard::spawn(ShardBehavior::Echo);
    let b = FakeShard::spawn(ShardBehavior::Echo);
    let proxy = start_proxy(MultiplexingPolicy::Never, &a, &b);

    let key = key_in(RANGE_A);
    // Sequential clients land on different workers (id mod workers), so
    // at most one connection per worker is expected: 2, not 4.
    for _ in 0..4 {
        let mut client = connect(&proxy);
        client.write_all(&command(&["GET", &key])).unwrap();
        let expected = bulk(&key);
        assert_eq!(
            read_exact_len(&mut client, expected.len()),
            expected.into_bytes()
        );
    }
    assert!(a.connection_count() <= 2, "{}", a.connection_count());
}

#[test]
fn upstream_disconnect_reconnects_once_and_delivers() {
    let a = FakeShard::spawn(ShardBehavior::DropFirstConnection);
    let b = FakeShard::spawn(ShardBehavior::Echo);
    let proxy = start_proxy(MultiplexingPolicy::Never, &a, &b);

    let key = key_in(RANGE_A);
    let mut client = connect(&proxy);
    client.write_all(&command(&["GET", &key])).unwrap();

    // The first shard connection swallowed the request and died; the
    // proxy must reconnect, re-send, and still deliver the reply.
    let expected = bulk(&key);
    assert_eq!(
        read_exact_len(&mut client, expected.len()),
        expected.into_bytes()
    );
    assert_eq!(a.connection_count(), 2);
    assert_eq!(
        a.received(),
        vec![command(&["GET", &key]), command(&["GET", &key])]
    );
}

#[test]
fn client_disconnect_leaves_proxy_serving_others() {
    let a = FakeShard::spawn(ShardBehavior::Echo);
    let b = FakeShard::spawn(ShardBehavior::Echo);
    let proxy = start_proxy(MultiplexingPolicy::Never, &a, &b);

    let key = key_in(RANGE_A);
    {
        let mut doomed = connect(&proxy);
        doomed.write_all(&command(&["GET", &key])).unwrap();
        // Drop without reading the reply.
    }
    thread::sleep(Duration::from_millis(100));

    let mut client = connect(&proxy);
    client.write_all(&command(&["GET", &key])).unwrap();
    let expected = bulk(&key);
    assert_eq!(
        read_exact_len(&mut client, expected.len()),
        expected.into_bytes()
    );
}

#[test]
fn auto_mode_migrates_overflowing_pipelines_intact() {
    let a = FakeShard::spawn(ShardBehavior::Echo);
    let b = FakeShard::spawn(ShardBehavior::Echo);
    let proxy = start_proxy(MultiplexingPolicy::Auto, &a, &b);

    // Ten pipelined single-key commands: the queue passes the auto
    // threshold and the whole chain is migrated to a private connection
    // set. Replies must still come back complete and in order.
    let keys: Vec<String> = (0u32..)
        .map(|i| format!("k{i}"))
        .filter(|k| RANGE_A.contains(key_slot(k.as_bytes())))
        .take(10)
        .collect();
    let mut buffer = Vec::new();
    let mut expected = Vec::new();
    for key in &keys {
        buffer.extend_from_slice(&command(&["GET", key]));
        expected.extend_from_slice(bulk(key).as_bytes());
    }

    let mut client = connect(&proxy);
    client.write_all(&buffer).unwrap();
    let replies = read_exact_len(&mut client, expected.len());
    assert_eq!(replies, expected);
    // Shared plus at most one private connection on this worker.
    assert!(a.connection_count() <= 2, "{}", a.connection_count());
}

#[test]
fn long_pipeline_survives_read_backpressure() {
    let a = FakeShard::spawn(ShardBehavior::Echo);
    let b = FakeShard::spawn(ShardBehavior::Echo);
    let proxy = start_proxy(MultiplexingPolicy::Never, &a, &b);

    // Enough pipelined commands that the buffer outgrows a single read
    // chunk and the in-flight cap pauses and resumes the client socket.
    let keys: Vec<String> = (0u32..)
        .map(|i| format!("k{i}"))
        .filter(|k| RANGE_A.contains(key_slot(k.as_bytes())))
        .take(2000)
        .collect();
    let mut buffer = Vec::new();
    let mut expected = Vec::new();
    for key in &keys {
        buffer.extend_from_slice(&command(&["GET", key]));
        expected.extend_from_slice(bulk(key).as_bytes());
    }

    let mut client = connect(&proxy);
    client.set_read_timeout(Some(Duration::from_secs(30))).unwrap();
    client.write_all(&buffer).unwrap();
    let replies = read_exact_len(&mut client, expected.len());
    assert_eq!(replies, expected);
}

#[test]
fn empty_request_gets_an_error() {
    let a = FakeShard::spawn(ShardBehavior::Echo);
    let b = FakeShard::spawn(ShardBehavior::Echo);
    let proxy = start_proxy(MultiplexingPolicy::Never, &a, &b);

    let mut client = connect(&proxy);
    client.write_all(b"*0\r\n").unwrap();
    let expected = b"-ERR Invalid request\r\n";
    assert_eq!(read_exact_len(&mut client, expected.len()), expected);
}
