//! Shard identities and the `CLUSTER NODES` text format.
//!
//! A shard node is pure identity after bootstrap: name, address, role
//! and assigned slots. Sockets to it are owned by the worker threads,
//! never by the node itself; the node only carries the mutex that
//! serializes concurrent connect attempts from different workers.

use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::ClusterError;
use crate::slots::{SlotMap, SlotRange, SLOT_COUNT};

/// A slot being migrated to, or imported from, a peer node. Recorded
/// from discovery for visibility; the proxy does not act on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotMigration {
    pub slot: u16,
    pub peer: String,
}

/// One cluster backend.
#[derive(Debug)]
pub struct ShardNode {
    pub name: String,
    pub ip: String,
    pub port: u16,
    pub is_replica: bool,
    /// Master id when this node is a replica.
    pub replicate: Option<String>,
    pub slot_ranges: Vec<SlotRange>,
    pub migrating: Vec<SlotMigration>,
    pub importing: Vec<SlotMigration>,
    /// Name of the shared node this one was cloned from, when the node
    /// belongs to a client's private connection set.
    pub clone_of: Option<String>,
    connect_lock: Mutex<()>,
}

impl PartialEq for ShardNode {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.ip == other.ip
            && self.port == other.port
            && self.is_replica == other.is_replica
            && self.replicate == other.replicate
            && self.slot_ranges == other.slot_ranges
            && self.migrating == other.migrating
            && self.importing == other.importing
            && self.clone_of == other.clone_of
    }
}

impl ShardNode {
    pub fn new(name: String, ip: String, port: u16) -> Self {
        Self {
            name,
            ip,
            port,
            is_replica: false,
            replicate: None,
            slot_ranges: Vec::new(),
            migrating: Vec::new(),
            importing: Vec::new(),
            clone_of: None,
            connect_lock: Mutex::new(()),
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    /// Serializes connect attempts to this node across workers.
    pub fn connect_guard(&self) -> MutexGuard<'_, ()> {
        self.connect_lock.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Clones this shard's identity for a client's private connection
    /// set. The clone records its source and gets its own connect lock.
    pub fn clone_for_client(&self) -> ShardNode {
        ShardNode {
            name: self.name.clone(),
            ip: self.ip.clone(),
            port: self.port,
            is_replica: self.is_replica,
            replicate: self.replicate.clone(),
            slot_ranges: self.slot_ranges.clone(),
            migrating: Vec::new(),
            importing: Vec::new(),
            clone_of: Some(self.name.clone()),
            connect_lock: Mutex::new(()),
        }
    }
}

/// The discovered cluster: every known node plus the slot map over the
/// masters. Immutable once built.
#[derive(Debug)]
pub struct Cluster {
    pub nodes: Vec<Arc<ShardNode>>,
    pub slots: SlotMap,
}

impl Cluster {
    /// Builds the slot map from the nodes' slot ranges and verifies that
    /// every slot in [0, 16383] is covered. A hole is a fatal
    /// misconfiguration.
    pub fn new(nodes: Vec<Arc<ShardNode>>) -> Result<Self, ClusterError> {
        let mut slots = SlotMap::new();
        let mut covered = vec![false; SLOT_COUNT as usize];
        for node in &nodes {
            if node.is_replica {
                continue;
            }
            for range in &node.slot_ranges {
                slots.map_range(*range, node);
                for slot in range.start..=range.end {
                    covered[slot as usize] = true;
                }
            }
        }
        if let Some(first) = covered.iter().position(|c| !c) {
            let missing = covered.iter().filter(|c| !**c).count();
            return Err(ClusterError::IncompleteSlotMap { missing, first: first as u16 });
        }
        Ok(Self { nodes, slots })
    }

    /// Parses a `CLUSTER NODES` reply payload into a cluster.
    ///
    /// `seed` is the address the reply came from; the line flagged
    /// `myself` falls back to it when its address field is empty.
    pub fn from_nodes_reply(payload: &str, seed: Option<(&str, u16)>) -> Result<Self, ClusterError> {
        let mut nodes = Vec::new();
        for line in payload.lines() {
            if line.trim().is_empty() {
                continue;
            }
            nodes.push(Arc::new(parse_node_line(line, seed)?));
        }
        if nodes.is_empty() {
            return Err(ClusterError::MalformedNodesReply("empty reply".into()));
        }
        Self::new(nodes)
    }

    pub fn master_count(&self) -> usize {
        self.nodes.iter().filter(|n| !n.is_replica).count()
    }

    pub fn replica_count(&self) -> usize {
        self.nodes.iter().filter(|n| n.is_replica).count()
    }
}

/// Parses one node line:
/// `name addr flags master_id ping pong epoch link-state [slots…]`.
fn parse_node_line(line: &str, seed: Option<(&str, u16)>) -> Result<ShardNode, ClusterError> {
    let malformed = |what: &str| ClusterError::MalformedNodesReply(format!("{what}: {line}"));

    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 8 {
        return Err(malformed("too few fields"));
    }
    let (name, addr, flags, master_id) = (fields[0], fields[1], fields[2], fields[3]);

    // Address is `ip:port[@bus]`; the cluster bus port is dropped.
    let addr = addr.split('@').next().unwrap_or(addr);
    let (mut ip, mut port) = match addr.rsplit_once(':') {
        Some((ip, port_str)) => (
            ip.to_string(),
            port_str.parse::<u16>().map_err(|_| malformed("bad port"))?,
        ),
        None => return Err(malformed("missing ':' in addr")),
    };
    let myself = flags.contains("myself");
    if ip.is_empty() {
        match (myself, seed) {
            (true, Some((seed_ip, seed_port))) => {
                ip = seed_ip.to_string();
                port = seed_port;
            }
            _ => return Err(malformed("missing ip in addr")),
        }
    }

    let mut node = ShardNode::new(name.to_string(), ip, port);
    node.is_replica = flags.contains("slave") || master_id != "-";
    if node.is_replica && master_id != "-" {
        node.replicate = Some(master_id.to_string());
    }

    for token in &fields[8..] {
        parse_slot_token(&mut node, token, &malformed)?;
    }
    Ok(node)
}

/// Parses one slots token: `N`, `start-stop`, `[slot->-dest]` or
/// `[slot-<-src]`.
fn parse_slot_token(
    node: &mut ShardNode,
    token: &str,
    malformed: &dyn Fn(&str) -> ClusterError,
) -> Result<(), ClusterError> {
    if let Some(marker) = token.strip_prefix('[') {
        let marker = marker.strip_suffix(']').unwrap_or(marker);
        if let Some((slot, dest)) = marker.split_once("->-") {
            let slot = slot.parse::<u16>().map_err(|_| malformed("bad migrating slot"))?;
            node.migrating.push(SlotMigration { slot, peer: dest.to_string() });
        } else if let Some((slot, src)) = marker.split_once("-<-") {
            let slot = slot.parse::<u16>().map_err(|_| malformed("bad importing slot"))?;
            node.importing.push(SlotMigration { slot, peer: src.to_string() });
        } else {
            return Err(malformed("bad migration marker"));
        }
        return Ok(());
    }
    if let Some((start, stop)) = token.split_once('-') {
        let start = start.parse::<u16>().map_err(|_| malformed("bad range start"))?;
        let stop = stop.parse::<u16>().map_err(|_| malformed("bad range stop"))?;
        if start > stop || stop >= SLOT_COUNT {
            return Err(malformed("bad slot range"));
        }
        node.slot_ranges.push(SlotRange::new(start, stop));
    } else {
        let slot = token.parse::<u16>().map_err(|_| malformed("bad slot"))?;
        if slot >= SLOT_COUNT {
            return Err(malformed("slot out of range"));
        }
        node.slot_ranges.push(SlotRange::single(slot));
    }
    Ok(())
}
