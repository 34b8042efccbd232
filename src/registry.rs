//! In-memory mirror registry kept in sync with the shared catalog

use std::collections::HashMap;

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, error};

use crate::cluster::Cluster;
use crate::mirrors::Mirror;
use crate::store::Store;

/// A catalog record wrapped with the scheduler's transient state.
///
/// `checking` and `scanning` mean a worker currently owns the mirror for
/// that task; they are local to this peer and never persisted. `last_check`
/// is the wall time of the last completed health probe, 0 for never.
#[derive(Debug, Clone)]
pub struct MonitoredMirror {
    pub mirror: Mirror,
    pub checking: bool,
    pub scanning: bool,
    pub last_check: i64,
}

impl MonitoredMirror {
    fn new(mirror: Mirror) -> Self {
        Self {
            mirror,
            checking: false,
            scanning: false,
            last_check: 0,
        }
    }
}

/// Map of monitored mirrors keyed by ID, protected by a single mutex.
///
/// The lock guards only map lookups and flag flips; it is never held
/// across store or network I/O.
pub struct MirrorRegistry {
    map: Mutex<HashMap<String, MonitoredMirror>>,
}

impl MirrorRegistry {
    pub fn new() -> Self {
        Self {
            map: Mutex::new(HashMap::new()),
        }
    }

    /// Synchronize the given IDs against the shared catalog.
    ///
    /// A missing record means the mirror was deleted: the local entry and
    /// its slot in the partition domain are dropped. A fetched record
    /// upserts the entry, preserving the transient scheduler state, and
    /// (re-)registers the ID with the cluster. Fetch errors are logged and
    /// the remaining IDs are still processed.
    pub async fn sync(&self, store: &dyn Store, cluster: &Cluster, ids: &[String]) {
        for id in ids {
            match store.get_mirror(id).await {
                Err(err) => {
                    error!(mirror = %id, error = %err, "fetching mirror failed");
                    continue;
                }
                Ok(None) => {
                    self.map.lock().remove(id);
                    cluster.remove_mirror(id);
                }
                Ok(Some(mirror)) => {
                    cluster.add_mirror(&mirror.id);
                    let mut map = self.map.lock();
                    match map.get_mut(&mirror.id) {
                        Some(entry) => entry.mirror = mirror,
                        None => {
                            map.insert(mirror.id.clone(), MonitoredMirror::new(mirror));
                        }
                    }
                }
            }
        }
        debug!(count = ids.len(), "mirrors updated");
    }

    /// Locked access for the dispatcher; do not hold across awaits.
    pub(crate) fn entries(&self) -> MutexGuard<'_, HashMap<String, MonitoredMirror>> {
        self.map.lock()
    }

    /// Copy of the catalog record for one mirror.
    pub fn mirror_snapshot(&self, id: &str) -> Option<Mirror> {
        self.map.lock().get(id).map(|entry| entry.mirror.clone())
    }

    /// Release the health-check slot, stamping the probe time unless the
    /// store was still loading.
    pub(crate) fn finish_check(&self, id: &str, stamp: bool) {
        let mut map = self.map.lock();
        if let Some(entry) = map.get_mut(id) {
            if stamp {
                entry.last_check = crate::clock::unix_now();
            }
            entry.checking = false;
        }
    }

    /// Release the scan slot.
    pub(crate) fn finish_scan(&self, id: &str) {
        let mut map = self.map.lock();
        if let Some(entry) = map.get_mut(id) {
            entry.scanning = false;
        }
    }

    pub fn len(&self) -> usize {
        self.map.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.lock().is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.map.lock().contains_key(id)
    }

    pub fn is_checking(&self, id: &str) -> bool {
        self.map.lock().get(id).map(|e| e.checking).unwrap_or(false)
    }

    pub fn is_scanning(&self, id: &str) -> bool {
        self.map.lock().get(id).map(|e| e.scanning).unwrap_or(false)
    }

    pub fn last_check(&self, id: &str) -> Option<i64> {
        self.map.lock().get(id).map(|e| e.last_check)
    }
}

impl Default for MirrorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::sync::Arc;

    fn mirror(id: &str, last_sync: i64) -> Mirror {
        Mirror {
            id: id.to_string(),
            enabled: true,
            http_url: format!("http://{id}.example.org"),
            last_sync,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn sync_upserts_and_registers_with_the_cluster() {
        let store = Arc::new(MemoryStore::new());
        let cluster = Cluster::with_node_id(store.clone(), "hostA-00010".to_string());
        let registry = MirrorRegistry::new();

        store.insert_mirror(mirror("m1", 0));
        registry
            .sync(store.as_ref(), &cluster, &["m1".to_string()])
            .await;

        assert!(registry.contains("m1"));
        assert!(cluster.is_handled("m1"), "freshly added id joins the partition");
    }

    #[tokio::test]
    async fn sync_preserves_transient_flags() {
        let store = Arc::new(MemoryStore::new());
        let cluster = Cluster::with_node_id(store.clone(), "hostA-00010".to_string());
        let registry = MirrorRegistry::new();

        store.insert_mirror(mirror("m1", 100));
        registry
            .sync(store.as_ref(), &cluster, &["m1".to_string()])
            .await;

        {
            let mut map = registry.entries();
            let entry = map.get_mut("m1").unwrap();
            entry.checking = true;
            entry.last_check = 12345;
        }

        store.insert_mirror(mirror("m1", 200));
        registry
            .sync(store.as_ref(), &cluster, &["m1".to_string()])
            .await;

        let map = registry.entries();
        let entry = map.get("m1").unwrap();
        assert_eq!(entry.mirror.last_sync, 200, "record is refreshed");
        assert!(entry.checking, "transient flag survives the update");
        assert_eq!(entry.last_check, 12345);
    }

    #[tokio::test]
    async fn sync_drops_deleted_mirrors() {
        let store = Arc::new(MemoryStore::new());
        let cluster = Cluster::with_node_id(store.clone(), "hostA-00010".to_string());
        let registry = MirrorRegistry::new();

        store.insert_mirror(mirror("m1", 0));
        registry
            .sync(store.as_ref(), &cluster, &["m1".to_string()])
            .await;
        assert!(registry.contains("m1"));

        store.delete_mirror("m1");
        registry
            .sync(store.as_ref(), &cluster, &["m1".to_string()])
            .await;
        assert!(!registry.contains("m1"));
        assert!(!cluster.is_handled("m1"));
    }
}
