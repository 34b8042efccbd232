//! Typed façade over the shared key-value store
//!
//! The monitoring core never speaks the store's wire protocol directly; it
//! goes through the [`Store`] trait, which models the handful of typed
//! operations the core needs (catalog reads, reachability writes, atomic
//! counter batches, pub/sub). Production deployments plug in a client for
//! the real store; [`MemoryStore`] backs development and the test suites.

mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::mirrors::Mirror;
use crate::Result;

/// Pub/sub channels shared by all peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PubSubChannel {
    /// Peer liveness beacons (`HELLO <nodeID>`)
    Cluster,
    /// Catalog change events, payload is the mirror ID
    MirrorUpdate,
}

impl PubSubChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            PubSubChannel::Cluster => "CLUSTER",
            PubSubChannel::MirrorUpdate => "MIRROR_UPDATE",
        }
    }
}

impl std::fmt::Display for PubSubChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One counter mutation inside an atomic batch.
///
/// The stats flush produces a batch of these; the implementation must apply
/// the whole batch atomically (a multi-command transaction on the real
/// store) so a partially persisted flush can never be observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CounterOp {
    /// Increment `field` of the hash at `key`
    HashIncr {
        key: String,
        field: String,
        delta: i64,
    },
    /// Increment the score of `member` in the sorted set at `key`
    SortedSetIncr {
        key: String,
        member: String,
        delta: i64,
    },
    /// Increment the plain integer at `key`
    Incr { key: String, delta: i64 },
}

/// Typed access to the shared store and its pub/sub channels.
#[async_trait]
pub trait Store: Send + Sync {
    /// All mirror IDs currently in the catalog.
    async fn mirror_ids(&self) -> Result<Vec<String>>;

    /// Fetch one mirror record. `None` means the catalog no longer holds
    /// the mirror and the caller must treat it as deleted.
    async fn get_mirror(&self, id: &str) -> Result<Option<Mirror>>;

    /// Record a positive reachability probe.
    async fn mark_mirror_up(&self, id: &str) -> Result<()>;

    /// Record a negative reachability probe with its reason.
    async fn mark_mirror_down(&self, id: &str, reason: &str) -> Result<()>;

    /// Administratively disable a mirror.
    async fn disable_mirror(&self, id: &str) -> Result<()>;

    /// A random file known to be served by the mirror, with its canonical
    /// size in bytes. `None` when the mirror has never been scanned.
    async fn random_handled_file(&self, id: &str) -> Result<Option<(String, i64)>>;

    /// Whether another peer currently holds the scan lease for the mirror.
    async fn is_scanning(&self, id: &str) -> Result<bool>;

    /// Atomically apply a batch of counter mutations.
    async fn apply_counters(&self, ops: &[CounterOp]) -> Result<()>;

    /// Publish a payload on a pub/sub channel.
    async fn publish(&self, channel: PubSubChannel, payload: &str) -> Result<()>;

    /// Subscribe to a pub/sub channel. Receivers observe payloads published
    /// after the call; a lagging receiver loses the oldest payloads.
    fn subscribe(&self, channel: PubSubChannel) -> broadcast::Receiver<String>;

    /// Cheap connection-health flag. The dispatcher skips a tick entirely
    /// while this is set instead of queueing work that cannot complete.
    fn is_failing(&self) -> bool;
}
