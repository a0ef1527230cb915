//! Request routing: command metadata → key slots → shard.

use std::sync::Arc;

use manifold_cluster::{ShardNode, SlotMap};
use manifold_protocol::{CommandDef, Query};

/// Why a request could not be routed. Each variant maps to the error
/// line sent back to the client.
#[derive(Debug, PartialEq, Eq)]
pub enum RouteError {
    /// Keys in one query hash to slots owned by different shards.
    CrossSlot,
    /// No shard could be derived for the query.
    NoNode,
}

impl RouteError {
    pub fn message(&self) -> &'static str {
        match self {
            RouteError::CrossSlot => {
                "Queries with keys belonging to different nodes are not supported"
            }
            RouteError::NoNode => "Failed to get node for query",
        }
    }
}

/// Resolves the shard for a parsed request.
///
/// Single-argument requests carry no key and go to the first node of the
/// active slot map, in ascending slot order, so the choice is
/// deterministic. Otherwise every key position named by the command
/// metadata is hashed; all keys must land on one shard.
pub fn resolve(
    query: &Query,
    cmd: &CommandDef,
    slots: &SlotMap,
) -> Result<(Option<u16>, Arc<ShardNode>), RouteError> {
    let argc = query.argc() as i32;
    if argc == 1 {
        let node = slots.first_node().ok_or(RouteError::NoNode)?;
        return Ok((None, Arc::clone(node)));
    }
    if cmd.first_key == 0 {
        return Err(RouteError::NoNode);
    }

    let mut first_key = cmd.first_key;
    if first_key >= argc {
        first_key = argc - 1;
    }
    let mut last_key = cmd.last_key;
    if last_key < 0 || last_key >= argc {
        last_key = argc - 1;
    }
    if last_key < first_key {
        last_key = first_key;
    }
    let key_step = cmd.key_step.max(1);

    let mut resolved: Option<(u16, Arc<ShardNode>)> = None;
    let mut i = first_key;
    while i <= last_key {
        let key = query.arg(i as usize).ok_or(RouteError::NoNode)?;
        let (slot, node) = slots.node_for_key(key).ok_or(RouteError::NoNode)?;
        if let Some((_, prev)) = &resolved {
            if !Arc::ptr_eq(prev, node) {
                return Err(RouteError::CrossSlot);
            }
        } else {
            resolved = Some((slot, Arc::clone(node)));
        }
        i += key_step;
    }
    resolved
        .map(|(slot, node)| (Some(slot), node))
        .ok_or(RouteError::NoNode)
}

#[cfg(test)]
mod tests {
    use super::*;
    use manifold_cluster::{key_slot, SlotRange};
    use manifold_protocol::lookup_command;

    fn two_shard_map() -> SlotMap {
        let a = Arc::new(ShardNode::new("a".into(), "127.0.0.1".into(), 7001));
        let b = Arc::new(ShardNode::new("b".into(), "127.0.0.1".into(), 7002));
        let mut map = SlotMap::new();
        map.map_range(SlotRange::new(0, 8191), &a);
        map.map_range(SlotRange::new(8192, 16383), &b);
        map
    }

    fn parsed(parts: &[&str]) -> Query {
        let mut buf = format!("*{}\r\n", parts.len()).into_bytes();
        for part in parts {
            buf.extend_from_slice(format!("${}\r\n{part}\r\n", part.len()).as_bytes());
        }
        let mut query = Query::new();
        query.buffer_mut().extend_from_slice(&buf);
        assert_eq!(query.parse(), manifold_protocol::Parsed::Complete);
        query
    }

    /// A key hashing into the given slot range.
    fn key_in(range: SlotRange) -> String {
        (0u32..)
            .map(|i| format!("k{i}"))
            .find(|k| range.contains(key_slot(k.as_bytes())))
            .unwrap()
    }

    #[test]
    fn single_key_routes_to_owner() {
        let map = two_shard_map();
        let key = key_in(SlotRange::new(8192, 16383));
        let query = parsed(&["GET", &key]);
        let cmd = lookup_command("get").unwrap();
        let (slot, node) = resolve(&query, cmd, &map).unwrap();
        assert_eq!(node.name, "b");
        assert_eq!(slot, Some(key_slot(key.as_bytes())));
    }

    #[test]
    fn hash_tags_pin_keys_together() {
        let map = two_shard_map();
        let base = key_in(SlotRange::new(0, 8191));
        let k1 = format!("{{{base}}}:x");
        let k2 = format!("{{{base}}}:y");
        let query = parsed(&["MSET", &k1, "1", &k2, "2"]);
        let cmd = lookup_command("mset").unwrap();
        let (_, node) = resolve(&query, cmd, &map).unwrap();
        assert_eq!(node.name, "a");
    }

    #[test]
    fn cross_slot_multi_key_rejected() {
        let map = two_shard_map();
        let ka = key_in(SlotRange::new(0, 8191));
        let kb = key_in(SlotRange::new(8192, 16383));
        let query = parsed(&["MSET", &ka, "1", &kb, "2"]);
        let cmd = lookup_command("mset").unwrap();
        assert_eq!(resolve(&query, cmd, &map), Err(RouteError::CrossSlot));
    }

    #[test]
    fn mset_skips_value_positions() {
        let map = two_shard_map();
        let ka = key_in(SlotRange::new(0, 8191));
        let kb = key_in(SlotRange::new(8192, 16383));
        // kb appears only in a value position; it must not affect routing.
        let query = parsed(&["MSET", &ka, &kb]);
        let cmd = lookup_command("mset").unwrap();
        let (_, node) = resolve(&query, cmd, &map).unwrap();
        assert_eq!(node.name, "a");
    }

    #[test]
    fn keyless_command_routes_to_first_node() {
        let map = two_shard_map();
        let query = parsed(&["PING"]);
        let cmd = lookup_command("ping").unwrap();
        let (slot, node) = resolve(&query, cmd, &map).unwrap();
        assert_eq!(slot, None);
        assert_eq!(node.name, "a");
    }

    #[test]
    fn keyless_command_with_extra_args_fails() {
        let map = two_shard_map();
        let query = parsed(&["PING", "hello"]);
        let cmd = lookup_command("ping").unwrap();
        assert_eq!(resolve(&query, cmd, &map), Err(RouteError::NoNode));
    }
}
