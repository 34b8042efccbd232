//! Peer membership over the shared pub/sub bus
//!
//! Every peer publishes a `HELLO <nodeID>` beacon once per second on the
//! cluster channel and refreshes its view of the peer set on every beacon
//! it receives. A peer that has not announced for more than
//! [`PEER_TIMEOUT_SECS`] is evicted the next time a beacon is processed.
//! The peer list is kept sorted by ID so each peer has a stable positional
//! index, which the sharding math turns into catalog ownership.
//!
//! Bus disconnects are not observed directly: they manifest as stale
//! entries aging out, after which the isolated peer finds itself alone and
//! monitors every mirror until it reconnects. That state is redundant but
//! correct.

use std::sync::Arc;

use parking_lot::RwLock;
use rand::Rng;
use tokio::sync::broadcast;
use tokio::time::{interval_at, Duration, Instant};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::sharding;
use crate::clock;
use crate::store::{PubSubChannel, Store};

const CLUSTER_ANNOUNCE: &str = "HELLO";
const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(1);

/// Seconds without a beacon before a peer is evicted.
pub(crate) const PEER_TIMEOUT_SECS: i64 = 5;

/// One peer as seen from the local daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    /// `<hostname>-<5-digit random>`, fresh at every process start
    pub id: String,
    /// Unix seconds of the most recent beacon
    pub last_announce: i64,
}

#[derive(Debug, Default)]
struct ClusterState {
    /// Always sorted by ID
    nodes: Vec<Node>,
    /// Position of the local peer within `nodes`
    node_index: usize,
    node_total: usize,
    /// Sorted unique partition domain
    mirrors_index: Vec<String>,
}

/// Cluster membership and catalog partitioning.
///
/// Single-shot: once stopped, an instance cannot be started again; create
/// a new one instead.
pub struct Cluster {
    store: Arc<dyn Store>,
    node_id: String,
    state: RwLock<ClusterState>,
    stop: CancellationToken,
    tasks: TaskTracker,
}

impl Cluster {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self::with_node_id(store, generate_node_id())
    }

    /// Build a cluster with an explicit node ID, mainly for tests.
    pub fn with_node_id(store: Arc<dyn Store>, node_id: String) -> Self {
        let cluster = Self {
            store,
            node_id,
            state: RwLock::new(ClusterState::default()),
            stop: CancellationToken::new(),
            tasks: TaskTracker::new(),
        };
        // Register the local peer right away so a not-yet-started (or
        // isolated) peer owns the whole catalog.
        cluster.refresh_node_list(&cluster.node_id.clone());
        cluster
    }

    /// The local peer identity.
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Spawn the membership task (announce ticker + beacon receive).
    pub fn start(self: &Arc<Self>) {
        debug!("cluster starting");
        let cluster = Arc::clone(self);
        self.tasks.spawn(async move { cluster.run().await });
    }

    /// Request the membership task to stop. Idempotent.
    pub fn stop(&self) {
        self.stop.cancel();
        self.tasks.close();
    }

    /// Wait for the membership task to drain after [`Cluster::stop`].
    pub async fn wait(&self) {
        self.tasks.wait().await;
        debug!("cluster stopped");
    }

    async fn run(&self) {
        // Subscribe before the first announce so no peer beacon is missed.
        let mut beacons = self.store.subscribe(PubSubChannel::Cluster);
        self.refresh_node_list(&self.node_id.clone());

        let mut announce = interval_at(Instant::now() + ANNOUNCE_INTERVAL, ANNOUNCE_INTERVAL);
        let payload = format!("{CLUSTER_ANNOUNCE} {}", self.node_id);

        loop {
            tokio::select! {
                _ = self.stop.cancelled() => return,
                _ = announce.tick() => {
                    if let Err(err) = self.store.publish(PubSubChannel::Cluster, &payload).await {
                        // Stale entries on the other peers age out on their own.
                        debug!(error = %err, "announce failed");
                    }
                }
                msg = beacons.recv() => match msg {
                    Ok(frame) => {
                        let Some(announcer) = frame
                            .strip_prefix(CLUSTER_ANNOUNCE)
                            .and_then(|rest| rest.strip_prefix(' '))
                        else {
                            // Garbage frame
                            continue;
                        };
                        self.refresh_node_list(announcer);
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "cluster beacons lost, peer view may be stale");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                },
            }
        }
    }

    /// Refresh the peer set after receiving a beacon from `announcer`.
    ///
    /// The announcer and the local peer are never evicted here; the local
    /// peer stays fresh through its own beacons echoed back by the bus.
    fn refresh_node_list(&self, announcer: &str) {
        let now = clock::unix_now();
        let self_id = self.node_id.as_str();
        let mut state = self.state.write();

        let mut found = false;
        for node in state.nodes.iter_mut() {
            if node.id == announcer {
                node.last_announce = now;
                found = true;
            }
        }

        state.nodes.retain(|node| {
            let stale = clock::elapsed(node.last_announce, PEER_TIMEOUT_SECS)
                && node.id != announcer
                && node.id != self_id;
            if stale {
                info!(node = %node.id, "node left the cluster");
            }
            !stale
        });

        if !found {
            if announcer != self_id {
                info!(node = %announcer, "node joined the cluster");
            }
            let pos = state
                .nodes
                .binary_search_by(|node| node.id.as_str().cmp(announcer))
                .unwrap_or_else(|pos| pos);
            state.nodes.insert(
                pos,
                Node {
                    id: announcer.to_string(),
                    last_announce: now,
                },
            );
        }

        state.node_total = state.nodes.len();
        if let Ok(index) = state
            .nodes
            .binary_search_by(|node| node.id.as_str().cmp(self_id))
        {
            state.node_index = index;
        }
    }

    /// Track a mirror in the partition domain. Idempotent.
    pub fn add_mirror(&self, id: &str) {
        let mut state = self.state.write();
        sharding::insert_sorted(&mut state.mirrors_index, id);
    }

    /// Drop a mirror from the partition domain. Idempotent.
    pub fn remove_mirror(&self, id: &str) {
        let mut state = self.state.write();
        sharding::remove_sorted(&mut state.mirrors_index, id);
    }

    /// Whether this peer is responsible for monitoring the given mirror.
    pub fn is_handled(&self, mirror_id: &str) -> bool {
        let state = self.state.read();
        let position = state
            .mirrors_index
            .partition_point(|id| id.as_str() < mirror_id);
        sharding::owns_position(
            position,
            state.mirrors_index.len(),
            state.node_index,
            state.node_total,
        )
    }

    /// Snapshot of the current peer set, sorted by ID.
    pub fn nodes(&self) -> Vec<Node> {
        self.state.read().nodes.clone()
    }
}

fn generate_node_id() -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "hostname".to_string());
    format!("{host}-{:05}", rand::thread_rng().gen_range(0..32_000))
}
