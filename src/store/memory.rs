//! In-memory store for development and testing

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::broadcast;

use super::{CounterOp, PubSubChannel, Store};
use crate::mirrors::Mirror;
use crate::{Error, Result};

const PUBSUB_CAPACITY: usize = 64;

/// In-memory implementation of the store façade.
///
/// Suitable for development, single-node deployments, and the test suites.
/// Counter batches are applied under a single lock, mirroring the atomicity
/// of a multi-command transaction; pub/sub is backed by per-channel
/// broadcast channels. The failing/loading toggles let tests exercise the
/// degraded-store paths.
pub struct MemoryStore {
    mirrors: Mutex<BTreeMap<String, Mirror>>,
    handled_files: DashMap<String, Vec<String>>,
    file_sizes: DashMap<String, i64>,
    scan_leases: DashMap<String, bool>,
    counters: Mutex<CounterTables>,
    channels: Mutex<HashMap<PubSubChannel, broadcast::Sender<String>>>,
    failing: AtomicBool,
    loading: AtomicBool,
}

#[derive(Default)]
struct CounterTables {
    hashes: HashMap<String, HashMap<String, i64>>,
    zsets: HashMap<String, HashMap<String, i64>>,
    scalars: HashMap<String, i64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            mirrors: Mutex::new(BTreeMap::new()),
            handled_files: DashMap::new(),
            file_sizes: DashMap::new(),
            scan_leases: DashMap::new(),
            counters: Mutex::new(CounterTables::default()),
            channels: Mutex::new(HashMap::new()),
            failing: AtomicBool::new(false),
            loading: AtomicBool::new(false),
        }
    }

    fn check_available(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::Store("connection refused".to_string()));
        }
        if self.loading.load(Ordering::SeqCst) {
            return Err(Error::StoreLoading);
        }
        Ok(())
    }

    fn sender(&self, channel: PubSubChannel) -> broadcast::Sender<String> {
        self.channels
            .lock()
            .entry(channel)
            .or_insert_with(|| broadcast::channel(PUBSUB_CAPACITY).0)
            .clone()
    }

    /// Insert or replace a catalog entry.
    pub fn insert_mirror(&self, mirror: Mirror) {
        self.mirrors.lock().insert(mirror.id.clone(), mirror);
    }

    /// Remove a catalog entry, simulating a mirror deletion.
    pub fn delete_mirror(&self, id: &str) {
        self.mirrors.lock().remove(id);
    }

    /// Current catalog record for a mirror.
    pub fn mirror(&self, id: &str) -> Option<Mirror> {
        self.mirrors.lock().get(id).cloned()
    }

    /// Register the files a mirror is known to serve, with canonical sizes.
    pub fn set_handled_files(&self, id: &str, files: &[(&str, i64)]) {
        self.handled_files.insert(
            id.to_string(),
            files.iter().map(|(path, _)| path.to_string()).collect(),
        );
        for (path, size) in files {
            self.file_sizes.insert(path.to_string(), *size);
        }
    }

    /// Grant or release the distributed scan lease for a mirror.
    pub fn set_scanning(&self, id: &str, scanning: bool) {
        if scanning {
            self.scan_leases.insert(id.to_string(), true);
        } else {
            self.scan_leases.remove(id);
        }
    }

    /// Simulate a store outage: every command fails until cleared.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Simulate the loading state right after a store restart.
    pub fn set_loading(&self, loading: bool) {
        self.loading.store(loading, Ordering::SeqCst);
    }

    /// Read back a hash counter, used by tests to observe flushes.
    pub fn hash_value(&self, key: &str, field: &str) -> Option<i64> {
        self.counters
            .lock()
            .hashes
            .get(key)
            .and_then(|h| h.get(field).copied())
    }

    /// Read back a sorted-set score.
    pub fn zset_score(&self, key: &str, member: &str) -> Option<i64> {
        self.counters
            .lock()
            .zsets
            .get(key)
            .and_then(|z| z.get(member).copied())
    }

    /// Read back a plain integer counter.
    pub fn scalar(&self, key: &str) -> Option<i64> {
        self.counters.lock().scalars.get(key).copied()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn mirror_ids(&self) -> Result<Vec<String>> {
        self.check_available()?;
        Ok(self.mirrors.lock().keys().cloned().collect())
    }

    async fn get_mirror(&self, id: &str) -> Result<Option<Mirror>> {
        self.check_available()?;
        Ok(self.mirrors.lock().get(id).cloned())
    }

    async fn mark_mirror_up(&self, id: &str) -> Result<()> {
        self.check_available()?;
        {
            let mut mirrors = self.mirrors.lock();
            if let Some(mirror) = mirrors.get_mut(id) {
                mirror.up = true;
                mirror.down_reason.clear();
            }
        }
        self.publish(PubSubChannel::MirrorUpdate, id).await
    }

    async fn mark_mirror_down(&self, id: &str, reason: &str) -> Result<()> {
        self.check_available()?;
        {
            let mut mirrors = self.mirrors.lock();
            if let Some(mirror) = mirrors.get_mut(id) {
                mirror.up = false;
                mirror.down_reason = reason.to_string();
            }
        }
        self.publish(PubSubChannel::MirrorUpdate, id).await
    }

    async fn disable_mirror(&self, id: &str) -> Result<()> {
        self.check_available()?;
        {
            let mut mirrors = self.mirrors.lock();
            if let Some(mirror) = mirrors.get_mut(id) {
                mirror.enabled = false;
            }
        }
        self.publish(PubSubChannel::MirrorUpdate, id).await
    }

    async fn random_handled_file(&self, id: &str) -> Result<Option<(String, i64)>> {
        self.check_available()?;
        let Some(files) = self.handled_files.get(id) else {
            return Ok(None);
        };
        if files.is_empty() {
            return Ok(None);
        }
        let path = files[rand::thread_rng().gen_range(0..files.len())].clone();
        drop(files);
        let Some(size) = self.file_sizes.get(&path).map(|s| *s) else {
            return Ok(None);
        };
        Ok(Some((path, size)))
    }

    async fn is_scanning(&self, id: &str) -> Result<bool> {
        self.check_available()?;
        Ok(self.scan_leases.contains_key(id))
    }

    async fn apply_counters(&self, ops: &[CounterOp]) -> Result<()> {
        self.check_available()?;
        // One lock for the whole batch: all or nothing, like MULTI..EXEC.
        let mut tables = self.counters.lock();
        for op in ops {
            match op {
                CounterOp::HashIncr { key, field, delta } => {
                    *tables
                        .hashes
                        .entry(key.clone())
                        .or_default()
                        .entry(field.clone())
                        .or_insert(0) += delta;
                }
                CounterOp::SortedSetIncr { key, member, delta } => {
                    *tables
                        .zsets
                        .entry(key.clone())
                        .or_default()
                        .entry(member.clone())
                        .or_insert(0) += delta;
                }
                CounterOp::Incr { key, delta } => {
                    *tables.scalars.entry(key.clone()).or_insert(0) += delta;
                }
            }
        }
        Ok(())
    }

    async fn publish(&self, channel: PubSubChannel, payload: &str) -> Result<()> {
        self.check_available()?;
        // A send error only means nobody is subscribed right now.
        let _ = self.sender(channel).send(payload.to_string());
        Ok(())
    }

    fn subscribe(&self, channel: PubSubChannel) -> broadcast::Receiver<String> {
        self.sender(channel).subscribe()
    }

    fn is_failing(&self) -> bool {
        self.failing.load(Ordering::SeqCst)
    }
}
