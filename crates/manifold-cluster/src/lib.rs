//! Cluster topology for the manifold proxy.
//!
//! The cluster is discovered once at startup from a `CLUSTER NODES`
//! reply and is immutable afterwards: workers only ever read the slot
//! map and node identities. Live topology changes (resharding, MOVED
//! redirects) are out of scope.

mod bootstrap;
mod error;
mod slots;
mod topology;

pub use bootstrap::fetch_cluster;
pub use error::ClusterError;
pub use slots::{key_slot, SlotMap, SlotRange, SLOT_COUNT};
pub use topology::{Cluster, ShardNode, SlotMigration};
