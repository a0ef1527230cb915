//! Listener and cross-thread client dispatch.
//!
//! The main thread owns the listening sockets. Each accepted connection
//! is pinned to a worker chosen as `client_id mod workers` and handed
//! over through the worker's mailbox plus a poll waker; the worker
//! installs the read handler on its own loop.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use manifold_cluster::Cluster;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Registry, Token};
use socket2::{Domain, Protocol, SockRef, Socket, TcpKeepalive, Type};
use tracing::{debug, info, warn};

use crate::client::ClientId;
use crate::config::ProxyConfig;
use crate::worker::{Worker, WorkerHandle, WorkerMessage};

const TCP_BACKLOG: i32 = 511;

/// Hard cap on connections accepted per readiness tick.
const MAX_ACCEPTS_PER_TICK: usize = 1000;

/// A running proxy: the address it listens on and its accept thread.
/// Dropping the handle leaves the proxy running detached.
pub struct ProxyHandle {
    addr: SocketAddr,
    accept: JoinHandle<()>,
}

impl ProxyHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Blocks for the lifetime of the accept loop.
    pub fn join(self) {
        let _ = self.accept.join();
    }
}

/// Binds the listeners, spawns the workers, and starts accepting.
pub fn start(cfg: ProxyConfig, cluster: Cluster) -> io::Result<ProxyHandle> {
    let cfg = Arc::new(cfg);
    let cluster = Arc::new(cluster);
    let live_clients = Arc::new(AtomicUsize::new(0));

    // Dual-stack with graceful fallback when one family is unsupported.
    let mut listeners = Vec::new();
    match bind_family(Domain::IPV6, cfg.port) {
        Ok(listener) => listeners.push(listener),
        Err(e) => warn!("not listening on IPv6: {e}"),
    }
    match bind_family(Domain::IPV4, cfg.port) {
        Ok(listener) => listeners.push(listener),
        Err(e) => warn!("not listening on IPv4: {e}"),
    }
    if listeners.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::AddrInUse,
            format!("failed to listen on port {}", cfg.port),
        ));
    }
    let addr = listeners
        .iter()
        .filter_map(|l| l.local_addr().ok())
        .find(SocketAddr::is_ipv4)
        .or_else(|| listeners[0].local_addr().ok())
        .expect("listener has a local address");

    info!("starting {} worker(s)...", cfg.threads);
    let mut workers = Vec::with_capacity(cfg.threads);
    for id in 0..cfg.threads {
        workers.push(Worker::spawn(
            id,
            Arc::clone(&cfg),
            Arc::clone(&cluster),
            Arc::clone(&live_clients),
        )?);
    }

    let mut accept_loop = AcceptLoop {
        cfg,
        listeners,
        workers,
        live_clients,
        next_client_id: 0,
    };
    let accept = thread::Builder::new()
        .name("manifold-listener".into())
        .spawn(move || accept_loop.run())?;
    Ok(ProxyHandle { addr, accept })
}

/// Binds one address family nonblocking with the configured backlog.
fn bind_family(domain: Domain, port: u16) -> io::Result<TcpListener> {
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    if domain == Domain::IPV6 {
        // Keep the families independent so both binds can coexist.
        socket.set_only_v6(true)?;
    }
    socket.set_reuse_address(true)?;
    let addr: SocketAddr = if domain == Domain::IPV6 {
        (Ipv6Addr::UNSPECIFIED, port).into()
    } else {
        (Ipv4Addr::UNSPECIFIED, port).into()
    };
    socket.bind(&addr.into())?;
    socket.listen(TCP_BACKLOG)?;
    socket.set_nonblocking(true)?;
    let listener: std::net::TcpListener = socket.into();
    Ok(TcpListener::from_std(listener))
}

struct AcceptLoop {
    cfg: Arc<ProxyConfig>,
    listeners: Vec<TcpListener>,
    workers: Vec<WorkerHandle>,
    live_clients: Arc<AtomicUsize>,
    next_client_id: ClientId,
}

impl AcceptLoop {
    fn run(&mut self) {
        let mut poll = match Poll::new() {
            Ok(poll) => poll,
            Err(e) => {
                warn!("failed to create accept poll: {e}");
                return;
            }
        };
        for (idx, listener) in self.listeners.iter_mut().enumerate() {
            if let Err(e) = poll
                .registry()
                .register(listener, Token(idx), Interest::READABLE)
            {
                warn!("failed to register listener: {e}");
                return;
            }
        }
        let mut events = Events::with_capacity(64);
        loop {
            if let Err(e) = poll.poll(&mut events, None) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                warn!("accept poll failed: {e}");
                return;
            }
            let ready: Vec<usize> = events.iter().map(|e| e.token().0).collect();
            for idx in ready {
                self.accept_ready(idx, poll.registry());
            }
        }
    }

    fn accept_ready(&mut self, idx: usize, registry: &Registry) {
        let mut accepted = 0;
        loop {
            if accepted >= MAX_ACCEPTS_PER_TICK {
                // Re-arm so the remaining backlog produces another tick.
                let listener = &mut self.listeners[idx];
                let _ = registry.reregister(listener, Token(idx), Interest::READABLE);
                return;
            }
            match self.listeners[idx].accept() {
                Ok((stream, addr)) => {
                    accepted += 1;
                    self.dispatch(stream, addr);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    warn!("accepting client connection: {e}");
                    return;
                }
            }
        }
    }

    fn dispatch(&mut self, stream: TcpStream, addr: SocketAddr) {
        if self.live_clients.load(Ordering::Relaxed) >= self.cfg.maxclients {
            debug!("max clients reached, rejecting {addr}");
            return;
        }
        let sock = SockRef::from(&stream);
        let _ = sock.set_nodelay(true);
        if self.cfg.tcpkeepalive > 0 {
            let keepalive =
                TcpKeepalive::new().with_time(Duration::from_secs(self.cfg.tcpkeepalive));
            let _ = sock.set_tcp_keepalive(&keepalive);
        }

        let id = self.next_client_id;
        self.next_client_id = self.next_client_id.wrapping_add(1);
        self.live_clients.fetch_add(1, Ordering::Relaxed);
        let worker = (id % self.workers.len() as ClientId) as usize;
        debug!("client {id} from {addr} dispatched to worker {worker}");
        self.workers[worker].send(WorkerMessage::NewClient { id, stream, addr });
    }
}
