//! Static command metadata registry.
//!
//! Routing needs to know, for each command, where its keys sit in the
//! argument vector (`first_key`, `last_key`, `key_step`) and whether the
//! proxy can forward it at all. Commands that would break FIFO reply
//! multiplexing (blocking reads, pub/sub, transactions, cursors, server
//! administration) are flagged unsupported and rejected up front.
//!
//! The table is sorted by name and looked up with a binary search; the
//! caller lowercases the name first.

/// Metadata for one forwarded command.
///
/// `arity` follows the redis convention: positive means exact argument
/// count (command name included), negative means a minimum. A command
/// with `arity == 1` carries no key and may be routed to any shard.
/// `last_key == -1` means "through the final argument".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandDef {
    pub name: &'static str,
    pub arity: i32,
    pub first_key: i32,
    pub last_key: i32,
    pub key_step: i32,
    pub unsupported: bool,
}

const fn cmd(
    name: &'static str,
    arity: i32,
    first_key: i32,
    last_key: i32,
    key_step: i32,
) -> CommandDef {
    CommandDef { name, arity, first_key, last_key, key_step, unsupported: false }
}

const fn deny(name: &'static str) -> CommandDef {
    CommandDef { name, arity: 0, first_key: 0, last_key: 0, key_step: 0, unsupported: true }
}

/// Sorted by name.
static COMMAND_TABLE: &[CommandDef] = &[
    cmd("append", 3, 1, 1, 1),
    deny("asking"),
    deny("auth"),
    cmd("bitcount", -2, 1, 1, 1),
    cmd("bitfield", -2, 1, 1, 1),
    cmd("bitop", -4, 2, -1, 1),
    cmd("bitpos", -3, 1, 1, 1),
    deny("blpop"),
    deny("brpop"),
    deny("brpoplpush"),
    deny("bzpopmax"),
    deny("bzpopmin"),
    deny("client"),
    deny("cluster"),
    deny("command"),
    deny("config"),
    cmd("dbsize", 1, 0, 0, 0),
    deny("debug"),
    cmd("decr", 2, 1, 1, 1),
    cmd("decrby", 3, 1, 1, 1),
    cmd("del", -2, 1, -1, 1),
    deny("discard"),
    cmd("dump", 2, 1, 1, 1),
    deny("echo"),
    deny("eval"),
    deny("evalsha"),
    deny("exec"),
    cmd("exists", -2, 1, -1, 1),
    cmd("expire", 3, 1, 1, 1),
    cmd("expireat", 3, 1, 1, 1),
    deny("flushall"),
    deny("flushdb"),
    cmd("get", 2, 1, 1, 1),
    cmd("getbit", 3, 1, 1, 1),
    cmd("getrange", 4, 1, 1, 1),
    cmd("getset", 3, 1, 1, 1),
    cmd("hdel", -3, 1, 1, 1),
    cmd("hexists", 3, 1, 1, 1),
    cmd("hget", 3, 1, 1, 1),
    cmd("hgetall", 2, 1, 1, 1),
    cmd("hincrby", 4, 1, 1, 1),
    cmd("hincrbyfloat", 4, 1, 1, 1),
    cmd("hkeys", 2, 1, 1, 1),
    cmd("hlen", 2, 1, 1, 1),
    cmd("hmget", -3, 1, 1, 1),
    cmd("hmset", -4, 1, 1, 1),
    cmd("hscan", -3, 1, 1, 1),
    cmd("hset", -4, 1, 1, 1),
    cmd("hsetnx", 4, 1, 1, 1),
    cmd("hstrlen", 3, 1, 1, 1),
    cmd("hvals", 2, 1, 1, 1),
    cmd("incr", 2, 1, 1, 1),
    cmd("incrby", 3, 1, 1, 1),
    cmd("incrbyfloat", 3, 1, 1, 1),
    deny("info"),
    deny("keys"),
    cmd("lindex", 3, 1, 1, 1),
    cmd("linsert", 5, 1, 1, 1),
    cmd("llen", 2, 1, 1, 1),
    cmd("lpop", -2, 1, 1, 1),
    cmd("lpush", -3, 1, 1, 1),
    cmd("lpushx", -3, 1, 1, 1),
    cmd("lrange", 4, 1, 1, 1),
    cmd("lrem", 4, 1, 1, 1),
    cmd("lset", 4, 1, 1, 1),
    cmd("ltrim", 4, 1, 1, 1),
    cmd("mget", -2, 1, -1, 1),
    deny("migrate"),
    deny("monitor"),
    deny("move"),
    cmd("mset", -3, 1, -1, 2),
    cmd("msetnx", -3, 1, -1, 2),
    deny("multi"),
    cmd("persist", 2, 1, 1, 1),
    cmd("pexpire", 3, 1, 1, 1),
    cmd("pexpireat", 3, 1, 1, 1),
    cmd("pfadd", -2, 1, 1, 1),
    cmd("pfcount", -2, 1, -1, 1),
    cmd("pfmerge", -2, 1, -1, 1),
    cmd("ping", 1, 0, 0, 0),
    cmd("psetex", 4, 1, 1, 1),
    deny("psubscribe"),
    cmd("pttl", 2, 1, 1, 1),
    deny("publish"),
    deny("punsubscribe"),
    deny("randomkey"),
    deny("readonly"),
    deny("readwrite"),
    cmd("rename", 3, 1, 2, 1),
    cmd("renamenx", 3, 1, 2, 1),
    deny("replicaof"),
    cmd("restore", -4, 1, 1, 1),
    cmd("rpop", -2, 1, 1, 1),
    cmd("rpoplpush", 3, 1, 2, 1),
    cmd("rpush", -3, 1, 1, 1),
    cmd("rpushx", -3, 1, 1, 1),
    cmd("sadd", -3, 1, 1, 1),
    deny("scan"),
    cmd("scard", 2, 1, 1, 1),
    deny("script"),
    cmd("sdiff", -2, 1, -1, 1),
    cmd("sdiffstore", -3, 1, -1, 1),
    deny("select"),
    cmd("set", -3, 1, 1, 1),
    cmd("setbit", 4, 1, 1, 1),
    cmd("setex", 4, 1, 1, 1),
    cmd("setnx", 3, 1, 1, 1),
    cmd("setrange", 4, 1, 1, 1),
    deny("shutdown"),
    cmd("sinter", -2, 1, -1, 1),
    cmd("sinterstore", -3, 1, -1, 1),
    cmd("sismember", 3, 1, 1, 1),
    deny("slaveof"),
    deny("slowlog"),
    cmd("smembers", 2, 1, 1, 1),
    cmd("smove", 4, 1, 2, 1),
    cmd("sort", -2, 1, 1, 1),
    cmd("spop", -2, 1, 1, 1),
    cmd("srandmember", -2, 1, 1, 1),
    cmd("srem", -3, 1, 1, 1),
    cmd("sscan", -3, 1, 1, 1),
    cmd("strlen", 2, 1, 1, 1),
    deny("subscribe"),
    cmd("substr", 4, 1, 1, 1),
    cmd("sunion", -2, 1, -1, 1),
    cmd("sunionstore", -3, 1, -1, 1),
    deny("swapdb"),
    cmd("time", 1, 0, 0, 0),
    cmd("touch", -2, 1, -1, 1),
    cmd("ttl", 2, 1, 1, 1),
    cmd("type", 2, 1, 1, 1),
    cmd("unlink", -2, 1, -1, 1),
    deny("unsubscribe"),
    deny("unwatch"),
    deny("wait"),
    deny("watch"),
    cmd("zadd", -4, 1, 1, 1),
    cmd("zcard", 2, 1, 1, 1),
    cmd("zcount", 4, 1, 1, 1),
    cmd("zincrby", 4, 1, 1, 1),
    deny("zinterstore"),
    cmd("zlexcount", 4, 1, 1, 1),
    cmd("zpopmax", -2, 1, 1, 1),
    cmd("zpopmin", -2, 1, 1, 1),
    cmd("zrange", -4, 1, 1, 1),
    cmd("zrangebylex", -4, 1, 1, 1),
    cmd("zrangebyscore", -4, 1, 1, 1),
    cmd("zrank", 3, 1, 1, 1),
    cmd("zrem", -3, 1, 1, 1),
    cmd("zremrangebylex", 4, 1, 1, 1),
    cmd("zremrangebyrank", 4, 1, 1, 1),
    cmd("zremrangebyscore", 4, 1, 1, 1),
    cmd("zrevrange", -4, 1, 1, 1),
    cmd("zrevrangebylex", -4, 1, 1, 1),
    cmd("zrevrangebyscore", -4, 1, 1, 1),
    cmd("zrevrank", 3, 1, 1, 1),
    cmd("zscan", -3, 1, 1, 1),
    cmd("zscore", 3, 1, 1, 1),
    deny("zunionstore"),
];

/// Looks up a command by its lowercased name.
pub fn lookup_command(name: &str) -> Option<&'static CommandDef> {
    COMMAND_TABLE
        .binary_search_by(|def| def.name.cmp(name))
        .ok()
        .map(|i| &COMMAND_TABLE[i])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_is_sorted_and_unique() {
        for pair in COMMAND_TABLE.windows(2) {
            assert!(
                pair[0].name < pair[1].name,
                "table out of order at '{}' / '{}'",
                pair[0].name,
                pair[1].name
            );
        }
    }

    #[test]
    fn known_commands_resolve() {
        let get = lookup_command("get").unwrap();
        assert_eq!((get.arity, get.first_key, get.last_key, get.key_step), (2, 1, 1, 1));

        let mset = lookup_command("mset").unwrap();
        assert_eq!((mset.arity, mset.first_key, mset.last_key, mset.key_step), (-3, 1, -1, 2));

        let ping = lookup_command("ping").unwrap();
        assert_eq!(ping.arity, 1);
        assert!(!ping.unsupported);
    }

    #[test]
    fn unsupported_commands_flagged() {
        for name in ["multi", "subscribe", "blpop", "scan", "cluster", "eval"] {
            assert!(lookup_command(name).unwrap().unsupported, "{name}");
        }
    }

    #[test]
    fn unknown_command_is_none() {
        assert!(lookup_command("frobnicate").is_none());
        // lookups are case-sensitive; callers lowercase first
        assert!(lookup_command("GET").is_none());
    }
}
