//! Per-thread request scheduler.
//!
//! Each worker runs a single-threaded readiness loop that owns its
//! clients, its request arena, and one shared upstream connection per
//! shard. Requests flow: client read → parse → route → send queue →
//! shard socket → pending queue → reply → client output buffer. Before
//! every poll the worker flushes client output, applies the
//! multiplexing policy, and drains the send queues.
//!
//! Nothing in here is shared with other threads except the mailbox the
//! listener pushes new clients through and the global client counter.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use manifold_cluster::{Cluster, ShardNode, SlotMap};
use manifold_protocol::{lookup_command, Parsed, Query};
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token, Waker};
use tracing::{debug, error, warn};

use crate::client::{Client, ClientId, ClientStatus, PrivateSet, MAX_CLIENT_QUEUED};
use crate::config::{MultiplexingPolicy, ProxyConfig};
use crate::request::{Request, RequestId};
use crate::route;
use crate::upstream::{ConnectionSet, UpstreamConn};

const WAKER_TOKEN: Token = Token(0);
const EVENTS_CAPACITY: usize = 1024;
const POLL_TIMEOUT: Duration = Duration::from_millis(100);
const CLIENT_READ_CHUNK: usize = 16 * 1024;
const UPSTREAM_READ_CHUNK: usize = 16 * 1024;

/// In auto mode, a shared queue reaching this length flips the worker's
/// clients to private connections.
const MULTIPLEXING_MAX_REQUEST_QUEUE_LEN: usize = 5;

/// What a poll token points at.
#[derive(Debug, Clone, PartialEq, Eq)]
enum IoSource {
    Waker,
    Client(ClientId),
    Upstream { owner: QueueOwner, shard: String },
}

/// Which queue pair a request travels through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueOwner {
    Shared,
    Private(ClientId),
}

/// Outcome of one send-queue head dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dispatch {
    /// The head left the queue (sent, failed, or dropped); keep draining.
    Progress,
    /// The head cannot move right now; stop draining this queue.
    Idle,
    /// The head failed terminally; keep draining.
    Error,
}

#[derive(Debug, PartialEq, Eq)]
enum Processed {
    Incomplete,
    Done,
}

/// Message from the listener to a worker.
#[derive(Debug)]
pub enum WorkerMessage {
    NewClient {
        id: ClientId,
        stream: TcpStream,
        addr: SocketAddr,
    },
}

/// The listener's side of a worker: its mailbox plus the waker that
/// makes the worker drain it.
pub struct WorkerHandle {
    mailbox: Arc<Mutex<Vec<WorkerMessage>>>,
    waker: Arc<Waker>,
}

impl WorkerHandle {
    pub fn send(&self, msg: WorkerMessage) {
        self.mailbox
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(msg);
        if let Err(e) = self.waker.wake() {
            warn!("failed to wake worker: {e}");
        }
    }
}

pub struct Worker {
    id: usize,
    cfg: Arc<ProxyConfig>,
    cluster: Arc<Cluster>,
    poll: Poll,
    token_map: HashMap<Token, IoSource>,
    next_token: usize,
    clients: HashMap<ClientId, Client>,
    requests: HashMap<RequestId, Request>,
    shared: ConnectionSet,
    mailbox: Arc<Mutex<Vec<WorkerMessage>>>,
    live_clients: Arc<AtomicUsize>,
    next_request_id: RequestId,
    /// Clients whose reads resume at the next pre-sleep, after the
    /// in-flight cap released them.
    pending_resumes: Vec<ClientId>,
}

/// Resolves a queue owner to its connection set. `None` when a private
/// owner's client is already gone.
fn set_for<'a>(
    shared: &'a mut ConnectionSet,
    clients: &'a mut HashMap<ClientId, Client>,
    owner: QueueOwner,
) -> Option<&'a mut ConnectionSet> {
    match owner {
        QueueOwner::Shared => Some(shared),
        QueueOwner::Private(cid) => clients
            .get_mut(&cid)?
            .private
            .as_mut()
            .map(|p| &mut p.set),
    }
}

impl Worker {
    /// Creates a worker and runs it on its own thread.
    pub fn spawn(
        id: usize,
        cfg: Arc<ProxyConfig>,
        cluster: Arc<Cluster>,
        live_clients: Arc<AtomicUsize>,
    ) -> io::Result<WorkerHandle> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        let mailbox: Arc<Mutex<Vec<WorkerMessage>>> = Arc::default();
        let handle = WorkerHandle {
            mailbox: Arc::clone(&mailbox),
            waker,
        };

        let mut worker = Worker {
            id,
            cfg,
            cluster,
            poll,
            token_map: HashMap::from([(WAKER_TOKEN, IoSource::Waker)]),
            next_token: WAKER_TOKEN.0 + 1,
            clients: HashMap::new(),
            requests: HashMap::new(),
            shared: ConnectionSet::new(),
            mailbox,
            live_clients,
            next_request_id: 0,
            pending_resumes: Vec::new(),
        };
        thread::Builder::new()
            .name(format!("manifold-worker-{id}"))
            .spawn(move || worker.run())?;
        Ok(handle)
    }

    fn run(&mut self) {
        debug!("worker {} started", self.id);
        let mut events = Events::with_capacity(EVENTS_CAPACITY);
        loop {
            self.pre_sleep();
            if let Err(e) = self.poll.poll(&mut events, Some(POLL_TIMEOUT)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!("worker {} poll failed: {e}", self.id);
                return;
            }
            let ready: Vec<(Token, bool, bool)> = events
                .iter()
                .map(|e| {
                    (
                        e.token(),
                        e.is_readable() || e.is_read_closed() || e.is_error(),
                        e.is_writable(),
                    )
                })
                .collect();
            for (token, readable, writable) in ready {
                match self.token_map.get(&token).cloned() {
                    Some(IoSource::Waker) => self.process_mailbox(),
                    Some(IoSource::Client(cid)) => {
                        if writable {
                            self.flush_client(cid);
                        }
                        if readable {
                            self.handle_client_read(cid);
                        }
                    }
                    Some(IoSource::Upstream { owner, shard }) => {
                        if writable {
                            self.handle_upstream_writable(owner, &shard);
                        }
                        if readable {
                            self.handle_upstream_readable(owner, &shard);
                        }
                    }
                    None => {}
                }
            }
        }
    }

    /// Runs before every poll: flush client output, apply the
    /// multiplexing policy, drain send queues (shared first, then each
    /// private client's), and flush whatever the drains produced.
    fn pre_sleep(&mut self) {
        for cid in std::mem::take(&mut self.pending_resumes) {
            self.refresh_client_interest(cid);
            // No new readiness edge will fire for bytes that already
            // arrived, so read now.
            self.handle_client_read(cid);
        }

        let cids: Vec<ClientId> = self.clients.keys().copied().collect();
        for cid in &cids {
            self.flush_client(*cid);
        }

        if self.cfg.multiplexing == MultiplexingPolicy::Auto {
            let overflow = self.shared.to_send.len() >= MULTIPLEXING_MAX_REQUEST_QUEUE_LEN
                || self.shared.pending.len() >= MULTIPLEXING_MAX_REQUEST_QUEUE_LEN;
            if overflow {
                debug!("disabling multiplexing for worker {} clients", self.id);
                let shared_clients: Vec<ClientId> = self
                    .clients
                    .iter()
                    .filter(|(_, c)| c.private.is_none())
                    .map(|(id, _)| *id)
                    .collect();
                for cid in shared_clients {
                    if !self.disable_multiplexing_for_client(cid) {
                        error!("failed to disable multiplexing for client {cid}");
                        self.free_client(cid);
                    }
                }
            }
        }

        self.drain_send_queue(QueueOwner::Shared);
        let private_clients: Vec<ClientId> = self
            .clients
            .iter()
            .filter(|(_, c)| c.private.is_some())
            .map(|(id, _)| *id)
            .collect();
        for cid in private_clients {
            self.drain_send_queue(QueueOwner::Private(cid));
        }

        // Replies and errors produced by the drains above.
        let dirty: Vec<ClientId> = self
            .clients
            .iter()
            .filter(|(_, c)| c.has_output())
            .map(|(id, _)| *id)
            .collect();
        for cid in dirty {
            self.flush_client(cid);
        }
    }

    // -- new clients --

    fn process_mailbox(&mut self) {
        let messages: Vec<WorkerMessage> = {
            let mut mailbox = self.mailbox.lock().unwrap_or_else(|e| e.into_inner());
            mailbox.drain(..).collect()
        };
        for msg in messages {
            match msg {
                WorkerMessage::NewClient { id, stream, addr } => {
                    self.install_client(id, stream, addr)
                }
            }
        }
    }

    fn install_client(&mut self, id: ClientId, stream: TcpStream, addr: SocketAddr) {
        let token = Token(self.next_token);
        self.next_token += 1;
        let mut client = Client::new(id, stream, addr, token);
        if let Err(e) = self
            .poll
            .registry()
            .register(&mut client.stream, token, Interest::READABLE)
        {
            error!("failed to install read handler for client {addr}: {e}");
            client.status = ClientStatus::Unlinked;
            self.live_clients.fetch_sub(1, Ordering::Relaxed);
            return;
        }
        client.status = ClientStatus::Linked;
        client.interest = Some(Interest::READABLE);
        self.token_map.insert(token, IoSource::Client(id));
        debug!("client {id} from {addr} added to worker {}", self.id);
        self.clients.insert(id, client);
        if self.cfg.multiplexing == MultiplexingPolicy::Always
            && !self.disable_multiplexing_for_client(id)
        {
            self.free_client(id);
        }
    }

    // -- client reads and parsing --

    fn handle_client_read(&mut self, cid: ClientId) {
        enum ReadStep {
            Data(usize),
            Blocked,
            Closed,
            Failed,
        }
        let mut chunk = [0u8; CLIENT_READ_CHUNK];
        loop {
            if !self.clients.contains_key(&cid) {
                return;
            }
            let rid = match self.clients.get(&cid).and_then(|c| c.current) {
                Some(rid) => rid,
                None => {
                    let rid = self.create_request(cid, Query::new());
                    if let Some(client) = self.clients.get_mut(&cid) {
                        client.current = Some(rid);
                    }
                    rid
                }
            };
            let step = {
                let Some(client) = self.clients.get_mut(&cid) else {
                    return;
                };
                match client.stream.read(&mut chunk) {
                    Ok(0) => ReadStep::Closed,
                    Ok(n) => ReadStep::Data(n),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => ReadStep::Blocked,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        debug!("error reading from client {cid}: {e}");
                        ReadStep::Failed
                    }
                }
            };
            match step {
                ReadStep::Blocked => return,
                ReadStep::Closed => {
                    debug!("client {cid} closed connection");
                    self.free_client(cid);
                    return;
                }
                ReadStep::Failed => {
                    self.free_client(cid);
                    return;
                }
                ReadStep::Data(n) => {
                    if let Some(req) = self.requests.get_mut(&rid) {
                        req.query.buffer_mut().extend_from_slice(&chunk[..n]);
                    }
                    self.drive_parse(cid);
                    // Backpressure: leave the rest in the kernel buffer.
                    if self.clients.get(&cid).is_some_and(|c| c.paused) {
                        return;
                    }
                }
            }
        }
    }

    /// Processes the client's current request, then any pipeline-split
    /// successors, until one of them still needs bytes.
    fn drive_parse(&mut self, cid: ClientId) {
        if let Some(rid) = self.clients.get_mut(&cid).and_then(|c| c.current.take()) {
            if self.process_request(rid) == Processed::Incomplete {
                if let Some(client) = self.clients.get_mut(&cid) {
                    client.current = Some(rid);
                }
                return;
            }
        }
        loop {
            let next = self
                .clients
                .get_mut(&cid)
                .and_then(|c| c.to_process.pop_front());
            let Some(rid) = next else { return };
            if self.process_request(rid) == Processed::Incomplete {
                if let Some(client) = self.clients.get_mut(&cid) {
                    client.current = Some(rid);
                }
                return;
            }
        }
    }

    fn create_request(&mut self, cid: ClientId, query: Query) -> RequestId {
        let rid = self.next_request_id;
        self.next_request_id = self.next_request_id.wrapping_add(1);
        let mut req = Request::new(rid, cid, query);
        req.owned_by_client = self
            .clients
            .get(&cid)
            .is_some_and(|c| c.private.is_some());
        self.requests.insert(rid, req);
        rid
    }

    fn process_request(&mut self, rid: RequestId) -> Processed {
        let outcome = {
            let Some(req) = self.requests.get_mut(&rid) else {
                return Processed::Done;
            };
            if self.cfg.dump_buffer {
                debug!(
                    "request {}:{rid} buffer:\n{}",
                    req.client,
                    String::from_utf8_lossy(req.query.raw())
                );
            }
            req.query.parse()
        };
        match outcome {
            Parsed::Incomplete => Processed::Incomplete,
            Parsed::Error(err) => {
                debug!("protocol error parsing request {rid}: {err}");
                self.error_reply_for_request(rid, "Invalid request");
                self.free_request(rid);
                Processed::Done
            }
            Parsed::Split(tail) => {
                let Some(cid) = self.requests.get(&rid).map(|r| r.client) else {
                    return Processed::Done;
                };
                let succ = self.create_request(cid, Query::from_tail(tail));
                if let Some(req) = self.requests.get_mut(&rid) {
                    req.next = Some(succ);
                }
                if let Some(req) = self.requests.get_mut(&succ) {
                    req.prev = Some(rid);
                }
                if let Some(client) = self.clients.get_mut(&cid) {
                    client.to_process.push_back(succ);
                }
                debug!("pipelined commands split into request {cid}:{succ}");
                self.route_request(rid);
                Processed::Done
            }
            Parsed::Complete => {
                self.route_request(rid);
                Processed::Done
            }
        }
    }

    /// Routes a fully-parsed request and appends it to the owning send
    /// queue, or answers the client with the routing error.
    fn route_request(&mut self, rid: RequestId) {
        let Some(req) = self.requests.get(&rid) else {
            return;
        };
        let cid = req.client;
        if req.query.argc() == 0 {
            self.error_reply_for_request(rid, "Invalid request");
            self.free_request(rid);
            return;
        }
        if self.cfg.dump_queries {
            let req = &self.requests[&rid];
            for i in 0..req.query.argc() {
                debug!(
                    "request {cid}:{rid} argv[{i}]: '{}'",
                    String::from_utf8_lossy(req.query.arg(i).unwrap_or_default())
                );
            }
        }
        let Some(name) = self.requests[&rid].query.command_name() else {
            self.error_reply_for_request(rid, "Invalid request");
            self.free_request(rid);
            return;
        };
        let cmd = match lookup_command(&name) {
            Some(cmd) if !cmd.unsupported && (cmd.arity == 1 || cmd.first_key != 0) => cmd,
            _ => {
                let msg = format!("Unsupported command: '{name}'");
                self.error_reply_for_request(rid, &msg);
                self.free_request(rid);
                return;
            }
        };

        let resolved = {
            let Worker {
                clients,
                requests,
                cluster,
                ..
            } = self;
            let req = &requests[&rid];
            let slots = match clients.get(&cid).and_then(|c| c.private.as_ref()) {
                Some(private) => &private.slots,
                None => &cluster.slots,
            };
            route::resolve(&req.query, cmd, slots)
        };
        match resolved {
            Err(e) => {
                debug!("routing request {cid}:{rid} failed: {}", e.message());
                self.error_reply_for_request(rid, e.message());
                self.free_request(rid);
            }
            Ok((slot, node)) => {
                let owner = {
                    let private = self
                        .clients
                        .get(&cid)
                        .is_some_and(|c| c.private.is_some());
                    let Some(req) = self.requests.get_mut(&rid) else {
                        return;
                    };
                    req.command = Some(cmd);
                    req.slot = slot;
                    req.node = Some(node);
                    req.owned_by_client = private;
                    req.queued = true;
                    if private {
                        QueueOwner::Private(cid)
                    } else {
                        QueueOwner::Shared
                    }
                };
                {
                    let Worker {
                        shared, clients, ..
                    } = self;
                    if let Some(set) = set_for(shared, clients, owner) {
                        set.to_send.push_back(rid);
                    }
                }
                if let Some(client) = self.clients.get_mut(&cid) {
                    client.queued += 1;
                    if client.queued >= MAX_CLIENT_QUEUED && !client.paused {
                        debug!("client {cid} hit the in-flight cap, pausing reads");
                        client.paused = true;
                    }
                }
                self.refresh_client_interest(cid);
            }
        }
    }

    // -- send path --

    fn drain_send_queue(&mut self, owner: QueueOwner) {
        loop {
            match self.try_send_head(owner) {
                Dispatch::Progress | Dispatch::Error => continue,
                Dispatch::Idle => return,
            }
        }
    }

    /// Tries to dispatch the head of a send queue, honoring the
    /// busy-socket and pipeline-predecessor rules.
    fn try_send_head(&mut self, owner: QueueOwner) -> Dispatch {
        let head = {
            let Worker {
                shared, clients, ..
            } = self;
            set_for(shared, clients, owner).and_then(|set| set.to_send.front().copied())
        };
        let Some(rid) = head else {
            return Dispatch::Idle;
        };
        let Some(req) = self.requests.get(&rid) else {
            self.remove_from_queues(owner, rid);
            return Dispatch::Progress;
        };
        // A partial write is parked on writable readiness.
        if req.has_write_handler {
            return Dispatch::Idle;
        }
        let Some(node) = req.node.clone() else {
            self.remove_from_queues(owner, rid);
            self.free_request(rid);
            return Dispatch::Error;
        };
        let req_client = req.client;
        let req_slot = req.slot;

        // A pipelined successor whose predecessor targeted a different
        // slot waits until the predecessor's reply is delivered.
        if let Some(prev) = req.prev {
            if let Some(prev_req) = self.requests.get(&prev) {
                if prev_req.slot != req_slot {
                    return Dispatch::Idle;
                }
            }
        }

        if !self.ensure_connected(owner, &node) {
            self.remove_from_queues(owner, rid);
            self.error_reply_for_request(rid, "Could not connect to node");
            self.free_request(rid);
            return Dispatch::Progress;
        }

        // The socket is busy when another client's request holds its
        // write or read readiness.
        {
            let Worker {
                shared,
                clients,
                requests,
                ..
            } = self;
            let Some(set) = set_for(shared, clients, owner) else {
                return Dispatch::Idle;
            };
            let Some(conn) = set.conns.get(&node.name) else {
                return Dispatch::Idle;
            };
            let client_of = |orid: RequestId| requests.get(&orid).map(|r| r.client);
            if let Some(w) = conn.writer {
                if w != rid && client_of(w) != Some(req_client) {
                    return Dispatch::Idle;
                }
            }
            if let Some(r) = conn.reading {
                if client_of(r) != Some(req_client) {
                    return Dispatch::Idle;
                }
            }
        }

        self.write_request(owner, rid, &node)
    }

    /// Writes as many of the request's bytes as the socket accepts and
    /// advances its queue state.
    fn write_request(&mut self, owner: QueueOwner, rid: RequestId, node: &Arc<ShardNode>) -> Dispatch {
        enum WriteOutcome {
            Done,
            Blocked,
            Failed,
        }
        let outcome = {
            let Worker {
                shared,
                clients,
                requests,
                ..
            } = self;
            let Some(req) = requests.get_mut(&rid) else {
                return Dispatch::Error;
            };
            let Some(set) = set_for(shared, clients, owner) else {
                return Dispatch::Error;
            };
            let Some(conn) = set.conns.get_mut(&node.name) else {
                return Dispatch::Error;
            };
            let mut outcome = WriteOutcome::Done;
            loop {
                let buf = req.query.raw();
                if req.written >= buf.len() {
                    break;
                }
                let result = match conn.stream_mut() {
                    Some(stream) => stream.write(&buf[req.written..]),
                    None => break,
                };
                match result {
                    Ok(0) => {
                        outcome = WriteOutcome::Failed;
                        break;
                    }
                    Ok(n) => req.written += n,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        outcome = WriteOutcome::Blocked;
                        break;
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        debug!("error writing to node {}: {e}", node.addr());
                        outcome = WriteOutcome::Failed;
                        break;
                    }
                }
            }
            outcome
        };
        match outcome {
            WriteOutcome::Done => {
                {
                    let Worker {
                        shared,
                        clients,
                        requests,
                        ..
                    } = self;
                    if let Some(set) = set_for(shared, clients, owner) {
                        set.to_send.retain(|r| *r != rid);
                        set.pending.push_back(rid);
                        if let Some(conn) = set.conns.get_mut(&node.name) {
                            if conn.writer == Some(rid) {
                                conn.writer = None;
                            }
                        }
                    }
                    if let Some(req) = requests.get_mut(&rid) {
                        req.has_write_handler = false;
                    }
                }
                debug!("request {rid} written to {}, now pending", node.addr());
                self.set_upstream_writable(owner, &node.name, false);
                self.assign_reader(owner, &node.name);
                Dispatch::Progress
            }
            WriteOutcome::Blocked => {
                {
                    let Worker {
                        shared,
                        clients,
                        requests,
                        ..
                    } = self;
                    if let Some(set) = set_for(shared, clients, owner) {
                        if let Some(conn) = set.conns.get_mut(&node.name) {
                            conn.writer = Some(rid);
                        }
                    }
                    if let Some(req) = requests.get_mut(&rid) {
                        req.has_write_handler = true;
                    }
                }
                self.set_upstream_writable(owner, &node.name, true);
                Dispatch::Idle
            }
            WriteOutcome::Failed => {
                self.remove_from_queues(owner, rid);
                self.error_reply_for_request(rid, "Error writing to cluster");
                self.free_request(rid);
                // The socket is unusable; replies for anything in flight
                // on it are lost.
                self.fail_conn_pending(owner, &node.name, "Cluster node disconnected");
                self.reset_conn(owner, &node.name);
                Dispatch::Error
            }
        }
    }

    // -- upstream events --

    fn handle_upstream_writable(&mut self, owner: QueueOwner, shard: &str) {
        let parked = {
            let Worker {
                shared, clients, ..
            } = self;
            set_for(shared, clients, owner)
                .and_then(|set| set.conns.get(shard))
                .and_then(|conn| conn.writer.map(|rid| (rid, Arc::clone(&conn.node))))
        };
        match parked {
            Some((rid, node)) => {
                let _ = self.write_request(owner, rid, &node);
                self.drain_send_queue(owner);
            }
            None => self.set_upstream_writable(owner, shard, false),
        }
    }

    fn handle_upstream_readable(&mut self, owner: QueueOwner, shard: &str) {
        #[derive(PartialEq)]
        enum ReadStatus {
            Open,
            Disconnected,
        }
        let status = {
            let Worker {
                shared, clients, ..
            } = self;
            let Some(set) = set_for(shared, clients, owner) else {
                return;
            };
            let Some(conn) = set.conns.get_mut(shard) else {
                return;
            };
            let mut chunk = [0u8; UPSTREAM_READ_CHUNK];
            let mut status = ReadStatus::Open;
            loop {
                let result = match conn.stream_mut() {
                    Some(stream) => stream.read(&mut chunk),
                    None => return,
                };
                match result {
                    Ok(0) => {
                        status = ReadStatus::Disconnected;
                        break;
                    }
                    Ok(n) => conn.reader.buffer_mut().extend_from_slice(&chunk[..n]),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        debug!("error reading from node {shard}: {e}");
                        status = ReadStatus::Disconnected;
                        break;
                    }
                }
            }
            status
        };
        // Deliver whatever complete replies arrived before any failure.
        self.drain_replies(owner, shard);
        if status == ReadStatus::Disconnected {
            self.upstream_disconnected(owner, shard);
        }
        self.drain_send_queue(owner);
    }

    /// Matches buffered reply frames against the pending FIFO for this
    /// connection and copies each one to its owner.
    fn drain_replies(&mut self, owner: QueueOwner, shard: &str) {
        enum Step {
            Frame(Bytes),
            Wait,
            Broken,
        }
        loop {
            let step = {
                let Worker {
                    shared, clients, ..
                } = self;
                let Some(set) = set_for(shared, clients, owner) else {
                    return;
                };
                let Some(conn) = set.conns.get_mut(shard) else {
                    return;
                };
                match conn.reader.frame_len() {
                    Ok(Some(len)) => Step::Frame(conn.reader.take_frame(len)),
                    Ok(None) => Step::Wait,
                    Err(e) => {
                        debug!("failed to decode reply from node {shard}: {e}");
                        Step::Broken
                    }
                }
            };
            match step {
                Step::Wait => return,
                Step::Broken => {
                    self.fail_conn_pending(owner, shard, "Failed to read reply");
                    self.reset_conn(owner, shard);
                    return;
                }
                Step::Frame(frame) => {
                    let head = self.pending_head(owner, shard);
                    match head {
                        None => {
                            // The owner died while the request was in
                            // flight; the reply has no home.
                            debug!(
                                "discarding {} ownerless reply bytes from node {shard}",
                                frame.len()
                            );
                        }
                        Some(rid) => {
                            let delivery = self
                                .requests
                                .get(&rid)
                                .map(|r| (r.client, r.orphaned));
                            if let Some((cid, orphaned)) = delivery {
                                if !orphaned {
                                    if let Some(client) = self.clients.get_mut(&cid) {
                                        client.push_reply(&frame);
                                    }
                                }
                            }
                            self.free_request(rid);
                            self.assign_reader(owner, shard);
                        }
                    }
                }
            }
        }
    }

    /// First pending request in FIFO order for this connection.
    fn pending_head(&mut self, owner: QueueOwner, shard: &str) -> Option<RequestId> {
        let Worker {
            shared,
            clients,
            requests,
            ..
        } = self;
        let set = set_for(shared, clients, owner)?;
        set.pending
            .iter()
            .copied()
            .find(|rid| requests.get(rid).and_then(|r| r.shard_name()) == Some(shard))
    }

    /// Designates the pending head as the connection's reader.
    fn assign_reader(&mut self, owner: QueueOwner, shard: &str) {
        let Some(rid) = self.pending_head(owner, shard) else {
            return;
        };
        let Worker {
            shared,
            clients,
            requests,
            ..
        } = self;
        let Some(set) = set_for(shared, clients, owner) else {
            return;
        };
        let Some(conn) = set.conns.get_mut(shard) else {
            return;
        };
        if conn.reading.is_some() {
            return;
        }
        conn.reading = Some(rid);
        if let Some(req) = requests.get_mut(&rid) {
            req.has_read_handler = true;
        }
    }

    /// Upstream socket died. Reconnect once and re-send the in-flight
    /// head; everything else pending on this connection lost its reply
    /// and is drained with an error.
    fn upstream_disconnected(&mut self, owner: QueueOwner, shard: &str) {
        debug!("node {shard} disconnected");
        let pending_for_conn: Vec<RequestId> = {
            let Worker {
                shared,
                clients,
                requests,
                ..
            } = self;
            let Some(set) = set_for(shared, clients, owner) else {
                return;
            };
            set.pending
                .iter()
                .copied()
                .filter(|rid| requests.get(rid).and_then(|r| r.shard_name()) == Some(shard))
                .collect()
        };
        self.reset_conn(owner, shard);

        let mut iter = pending_for_conn.into_iter();
        if let Some(head) = iter.next() {
            let retryable = self.requests.get(&head).is_some_and(|r| !r.retried);
            let node = self.requests.get(&head).and_then(|r| r.node.clone());
            let reconnected = match (&node, retryable) {
                (Some(node), true) => self.ensure_connected(owner, node),
                _ => false,
            };
            if reconnected {
                debug!("re-sending request {head} after reconnect to {shard}");
                let Worker {
                    shared,
                    clients,
                    requests,
                    ..
                } = self;
                if let Some(set) = set_for(shared, clients, owner) {
                    set.pending.retain(|r| *r != head);
                    set.to_send.push_front(head);
                }
                if let Some(req) = requests.get_mut(&head) {
                    req.written = 0;
                    req.retried = true;
                    req.has_read_handler = false;
                    req.has_write_handler = false;
                }
            } else {
                self.error_reply_for_request(head, "Cluster node disconnected");
                self.free_request(head);
            }
        }
        for rid in iter {
            self.error_reply_for_request(rid, "Cluster node disconnected");
            self.free_request(rid);
        }
        self.drain_send_queue(owner);
    }

    // -- connection management --

    /// Makes sure the owner has a live registered connection to `node`.
    fn ensure_connected(&mut self, owner: QueueOwner, node: &Arc<ShardNode>) -> bool {
        let auth = self.cfg.auth.clone();
        let token = Token(self.next_token);
        let connected = {
            let Worker {
                shared,
                clients,
                poll,
                token_map,
                ..
            } = self;
            let Some(set) = set_for(shared, clients, owner) else {
                return false;
            };
            let conn = set
                .conns
                .entry(node.name.clone())
                .or_insert_with(|| UpstreamConn::new(Arc::clone(node)));
            if conn.is_connected() {
                return true;
            }
            if let Err(e) = conn.connect(auth.as_deref()) {
                debug!("could not connect to node {}: {e}", node.addr());
                return false;
            }
            let stream = conn.stream_mut().expect("connected stream");
            if let Err(e) = poll.registry().register(stream, token, Interest::READABLE) {
                debug!("failed to register node socket {}: {e}", node.addr());
                conn.reset();
                return false;
            }
            conn.token = Some(token);
            conn.interest = Some(Interest::READABLE);
            token_map.insert(
                token,
                IoSource::Upstream {
                    owner,
                    shard: node.name.clone(),
                },
            );
            true
        };
        if connected {
            self.next_token += 1;
        }
        connected
    }

    fn set_upstream_writable(&mut self, owner: QueueOwner, shard: &str, writable: bool) {
        let Worker {
            shared,
            clients,
            poll,
            ..
        } = self;
        let Some(set) = set_for(shared, clients, owner) else {
            return;
        };
        let Some(conn) = set.conns.get_mut(shard) else {
            return;
        };
        let desired = if writable {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        if conn.interest == Some(desired) {
            return;
        }
        if let Some(token) = conn.token {
            if let Some(stream) = conn.stream_mut() {
                match poll.registry().reregister(stream, token, desired) {
                    Ok(()) => conn.interest = Some(desired),
                    Err(e) => debug!("failed to update node socket interest: {e}"),
                }
            }
        }
    }

    /// Deregisters and drops a connection's socket.
    fn reset_conn(&mut self, owner: QueueOwner, shard: &str) {
        let Worker {
            shared,
            clients,
            poll,
            token_map,
            ..
        } = self;
        let Some(set) = set_for(shared, clients, owner) else {
            return;
        };
        let Some(conn) = set.conns.get_mut(shard) else {
            return;
        };
        if let Some(token) = conn.token.take() {
            token_map.remove(&token);
        }
        if let Some(stream) = conn.stream_mut() {
            let _ = poll.registry().deregister(stream);
        }
        conn.reset();
    }

    /// Errors out every pending request on one connection.
    fn fail_conn_pending(&mut self, owner: QueueOwner, shard: &str, message: &str) {
        loop {
            let Some(rid) = self.pending_head(owner, shard) else {
                return;
            };
            self.error_reply_for_request(rid, message);
            self.free_request(rid);
        }
    }

    // -- private-connection mode --

    /// Gives a client its own connection set and migrates its queued
    /// requests off the shared one.
    ///
    /// The migration set is staged first and only applied when every
    /// request has a clone to move to; otherwise the caller frees the
    /// client. Requests whose bytes already touched a shared socket are
    /// never migrated: their replies arrive on that socket and must be
    /// matched there, in order.
    fn disable_multiplexing_for_client(&mut self, cid: ClientId) -> bool {
        debug!("disabling multiplexing for client {cid}");
        {
            let Worker {
                clients, cluster, ..
            } = self;
            let Some(client) = clients.get_mut(&cid) else {
                return false;
            };
            if client.private.is_none() {
                let mut nodes: HashMap<String, Arc<ShardNode>> = HashMap::new();
                let mut slots = SlotMap::new();
                for (slot, node) in cluster.slots.iter() {
                    let clone = nodes
                        .entry(node.name.clone())
                        .or_insert_with(|| Arc::new(node.clone_for_client()));
                    slots.map_slot(slot, Arc::clone(clone));
                }
                client.private = Some(PrivateSet {
                    slots,
                    nodes,
                    set: ConnectionSet::new(),
                });
            }
        }

        // Stage the migration set.
        let (staged_send, staged_pending) = {
            let requests = &self.requests;
            let mut staged_send = Vec::new();
            let mut skipped_tail: Option<RequestId> = None;
            for &rid in &self.shared.to_send {
                let Some(req) = requests.get(&rid) else { continue };
                if req.client != cid {
                    continue;
                }
                if req.has_write_handler {
                    // Mid-transmission on the shared socket. Successors
                    // chained to it must stay behind it as well.
                    if req.next.is_some() {
                        skipped_tail = Some(rid);
                    }
                    continue;
                }
                if let (Some(tail), Some(prev)) = (skipped_tail, req.prev) {
                    if prev == tail {
                        debug!("skipping pipelined request {cid}:{rid} in migration");
                        skipped_tail = Some(rid);
                        continue;
                    }
                }
                staged_send.push(rid);
            }
            let staged_pending: Vec<RequestId> = self
                .shared
                .pending
                .iter()
                .copied()
                .filter(|rid| {
                    requests.get(rid).is_some_and(|r| {
                        r.client == cid && !r.has_read_handler && r.written == 0
                    })
                })
                .collect();
            (staged_send, staged_pending)
        };

        // Verify every staged request has a clone before moving anything.
        {
            let Some(private) = self.clients.get(&cid).and_then(|c| c.private.as_ref()) else {
                return false;
            };
            for rid in staged_send.iter().chain(&staged_pending) {
                let Some(name) = self.requests.get(rid).and_then(|r| r.shard_name()) else {
                    return false;
                };
                if !private.nodes.contains_key(name) {
                    return false;
                }
            }
        }

        // Apply in one pass.
        self.shared.to_send.retain(|r| !staged_send.contains(r));
        self.shared.pending.retain(|r| !staged_pending.contains(r));
        let Worker {
            clients, requests, ..
        } = self;
        let Some(private) = clients.get_mut(&cid).and_then(|c| c.private.as_mut()) else {
            return false;
        };
        for rid in staged_send {
            if let Some(req) = requests.get_mut(&rid) {
                if let Some(name) = req.shard_name().map(str::to_owned) {
                    req.node = private.nodes.get(&name).cloned();
                }
                req.owned_by_client = true;
                private.set.to_send.push_back(rid);
            }
        }
        for rid in staged_pending {
            if let Some(req) = requests.get_mut(&rid) {
                if let Some(name) = req.shard_name().map(str::to_owned) {
                    req.node = private.nodes.get(&name).cloned();
                }
                req.owned_by_client = true;
                private.set.pending.push_back(rid);
            }
        }
        true
    }

    // -- output and teardown --

    fn flush_client(&mut self, cid: ClientId) {
        enum FlushResult {
            Clean,
            Parked,
            Failed,
        }
        let result = {
            let Some(client) = self.clients.get_mut(&cid) else {
                return;
            };
            let mut result = FlushResult::Clean;
            loop {
                if !client.has_output() {
                    client.obuf.clear();
                    client.written = 0;
                    break;
                }
                match client.stream.write(&client.obuf[client.written..]) {
                    Ok(0) => {
                        result = FlushResult::Failed;
                        break;
                    }
                    Ok(n) => client.written += n,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        result = FlushResult::Parked;
                        break;
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        debug!("error writing to client {cid}: {e}");
                        result = FlushResult::Failed;
                        break;
                    }
                }
            }
            result
        };
        match result {
            FlushResult::Failed => self.free_client(cid),
            FlushResult::Clean | FlushResult::Parked => self.refresh_client_interest(cid),
        }
    }

    fn refresh_client_interest(&mut self, cid: ClientId) {
        let Worker { clients, poll, .. } = self;
        let Some(client) = clients.get_mut(&cid) else {
            return;
        };
        let desired = client.desired_interest();
        if desired == client.interest {
            return;
        }
        let registry = poll.registry();
        let result = match (client.interest, desired) {
            (None, Some(interest)) => registry.register(&mut client.stream, client.token, interest),
            (Some(_), Some(interest)) => {
                registry.reregister(&mut client.stream, client.token, interest)
            }
            (Some(_), None) => registry.deregister(&mut client.stream),
            (None, None) => Ok(()),
        };
        match result {
            Ok(()) => client.interest = desired,
            Err(e) => debug!("failed to update client {cid} interest: {e}"),
        }
    }

    fn error_reply_for_request(&mut self, rid: RequestId, message: &str) {
        let Some(req) = self.requests.get(&rid) else {
            return;
        };
        if req.orphaned {
            return;
        }
        let cid = req.client;
        if let Some(client) = self.clients.get_mut(&cid) {
            client.push_error_reply(message);
        }
    }

    fn remove_from_queues(&mut self, owner: QueueOwner, rid: RequestId) {
        let Worker {
            shared, clients, ..
        } = self;
        if let Some(set) = set_for(shared, clients, owner) {
            set.to_send.retain(|r| *r != rid);
            set.pending.retain(|r| *r != rid);
        }
    }

    /// Destroys a request: unlinks its pipeline chain, pulls it out of
    /// every queue, releases its socket readiness claims, and returns
    /// its in-flight slot to the client.
    fn free_request(&mut self, rid: RequestId) {
        let Some(req) = self.requests.remove(&rid) else {
            return;
        };
        debug!("free request {}:{rid}", req.client);
        if let Some(next) = req.next {
            if let Some(next_req) = self.requests.get_mut(&next) {
                if next_req.prev == Some(rid) {
                    next_req.prev = None;
                }
            }
        }
        if let Some(prev) = req.prev {
            if let Some(prev_req) = self.requests.get_mut(&prev) {
                if prev_req.next == Some(rid) {
                    prev_req.next = req.next;
                }
            }
        }
        let owner = if req.owned_by_client {
            QueueOwner::Private(req.client)
        } else {
            QueueOwner::Shared
        };
        {
            let Worker {
                shared, clients, ..
            } = self;
            if let Some(set) = set_for(shared, clients, owner) {
                set.to_send.retain(|r| *r != rid);
                set.pending.retain(|r| *r != rid);
                if let Some(name) = req.shard_name() {
                    if let Some(conn) = set.conns.get_mut(name) {
                        if conn.writer == Some(rid) {
                            conn.writer = None;
                        }
                        if conn.reading == Some(rid) {
                            conn.reading = None;
                        }
                    }
                }
            }
        }
        if let Some(client) = self.clients.get_mut(&req.client) {
            if client.current == Some(rid) {
                client.current = None;
            }
            client.to_process.retain(|r| *r != rid);
            if req.queued {
                client.queued = client.queued.saturating_sub(1);
                if client.paused && client.queued <= MAX_CLIENT_QUEUED / 2 {
                    client.paused = false;
                    self.pending_resumes.push(req.client);
                }
            }
        }
    }

    /// Tears a client down: cancels its socket, drops its unsent
    /// requests, and orphans anything already on a shared socket so the
    /// socket stays framed for the other clients multiplexed over it.
    fn free_client(&mut self, cid: ClientId) {
        let Some(mut client) = self.clients.remove(&cid) else {
            return;
        };
        debug!("free client {cid}");
        if client.status != ClientStatus::Unlinked {
            if client.interest.is_some() {
                let _ = self.poll.registry().deregister(&mut client.stream);
            }
            client.status = ClientStatus::Unlinked;
        }
        self.token_map.remove(&client.token);

        // Requests still being parsed never reached a queue.
        for rid in client.current.take().into_iter() {
            self.requests.remove(&rid);
        }
        for rid in client.to_process.drain(..) {
            self.requests.remove(&rid);
        }

        // The private set is exclusively this client's: drop it whole.
        if let Some(mut private) = client.private.take() {
            for conn in private.set.conns.values_mut() {
                if let Some(token) = conn.token.take() {
                    self.token_map.remove(&token);
                }
                if let Some(stream) = conn.stream_mut() {
                    let _ = self.poll.registry().deregister(stream);
                }
            }
            for rid in private.set.to_send.iter().chain(private.set.pending.iter()) {
                self.requests.remove(rid);
            }
        }

        // Shared queues: unsent requests vanish; requests already (or
        // partially) written become orphans that finish their write and
        // swallow their reply.
        let to_send: Vec<RequestId> = self.shared.to_send.iter().copied().collect();
        for rid in to_send {
            let Some(req) = self.requests.get_mut(&rid) else {
                continue;
            };
            if req.client != cid {
                continue;
            }
            if req.has_write_handler && req.written > 0 {
                req.orphaned = true;
                continue;
            }
            let shard = req.shard_name().map(str::to_owned);
            self.shared.to_send.retain(|r| *r != rid);
            if let Some(name) = shard {
                if let Some(conn) = self.shared.conns.get_mut(&name) {
                    if conn.writer == Some(rid) {
                        conn.writer = None;
                    }
                }
            }
            self.requests.remove(&rid);
        }
        let pending: Vec<RequestId> = self.shared.pending.iter().copied().collect();
        for rid in pending {
            if let Some(req) = self.requests.get_mut(&rid) {
                if req.client == cid {
                    req.orphaned = true;
                }
            }
        }

        self.live_clients.fetch_sub(1, Ordering::Relaxed);
    }
}
