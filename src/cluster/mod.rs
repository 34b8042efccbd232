//! Cluster coordination for horizontally scaled monitoring
//!
//! Peers discover each other through liveness beacons on the shared
//! pub/sub bus and deterministically partition the mirror catalog among
//! themselves, so every mirror is monitored by exactly one peer at a time.
//! There is no leader and no quorum: the peer set is eventually consistent
//! with bounded staleness, which is enough because mirror state writes are
//! last-writer-wins and health checks are read-only against the internet.

mod membership;
mod sharding;

pub use membership::{Cluster, Node};
