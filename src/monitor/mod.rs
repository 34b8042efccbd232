//! Monitor scheduler
//!
//! Drives the periodic work of one peer: keeping the mirror registry in
//! sync with the catalog, rescanning the local repository, and dispatching
//! per-mirror health checks and content scans to bounded worker pools. The
//! dispatcher wakes once per second, consults the cluster to find the
//! mirrors this peer owns, and hands due work to the pools with
//! non-blocking sends so a backed-up queue can never stall the loop.

mod health;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, warn};

use crate::cluster::Cluster;
use crate::config::ConfigHandle;
use crate::mirrors::Mirror;
use crate::registry::MirrorRegistry;
use crate::scan::{ScanMethod, Scanner};
use crate::store::{PubSubChannel, Store};
use crate::{clock, Error, Result};

/// Size of the health-check worker pool.
pub const HEALTH_CHECK_WORKERS: usize = 10;

const DISPATCH_INTERVAL: Duration = Duration::from_secs(1);
const REPOSITORY_RETRY_DELAY: Duration = Duration::from_secs(1);
const CATALOG_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Per-peer monitoring scheduler.
///
/// Single-shot like [`Cluster`]: start it once, stop it once.
pub struct Monitor {
    store: Arc<dyn Store>,
    scanner: Arc<dyn Scanner>,
    config: ConfigHandle,
    cluster: Arc<Cluster>,
    registry: MirrorRegistry,
    client: reqwest::Client,
    health_tx: mpsc::Sender<String>,
    scan_tx: mpsc::Sender<String>,
    health_rx: AsyncMutex<mpsc::Receiver<String>>,
    scan_rx: AsyncMutex<mpsc::Receiver<String>>,
    stop: CancellationToken,
    tasks: TaskTracker,
}

enum Wake {
    Stop,
    Mirror(Option<String>),
    Reconfigure,
    RepositoryScan,
    Dispatch,
}

impl Monitor {
    pub fn new(
        store: Arc<dyn Store>,
        scanner: Arc<dyn Scanner>,
        config: ConfigHandle,
    ) -> Result<Arc<Self>> {
        let cluster = Arc::new(Cluster::new(store.clone()));
        Self::with_cluster(store, scanner, config, cluster)
    }

    /// Build a monitor around an existing cluster handle, used by tests to
    /// pin the node identity.
    pub fn with_cluster(
        store: Arc<dyn Store>,
        scanner: Arc<dyn Scanner>,
        config: ConfigHandle,
        cluster: Arc<Cluster>,
    ) -> Result<Arc<Self>> {
        let client = health::build_probe_client(&config)?;
        let (health_tx, health_rx) = mpsc::channel(HEALTH_CHECK_WORKERS * 5);
        let (scan_tx, scan_rx) = mpsc::channel(1);
        Ok(Arc::new(Self {
            store,
            scanner,
            config,
            cluster,
            registry: MirrorRegistry::new(),
            client,
            health_tx,
            scan_tx,
            health_rx: AsyncMutex::new(health_rx),
            scan_rx: AsyncMutex::new(scan_rx),
            stop: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }))
    }

    /// The registry view of this peer, exposed for observability.
    pub fn registry(&self) -> &MirrorRegistry {
        &self.registry
    }

    /// The cluster this monitor shards work with.
    pub fn cluster(&self) -> &Arc<Cluster> {
        &self.cluster
    }

    /// Spawn the scheduler task.
    pub fn start(self: &Arc<Self>) {
        let monitor = Arc::clone(self);
        self.tasks.spawn(async move { monitor.run().await });
    }

    /// Request every task of this monitor (and its cluster) to stop.
    /// Idempotent; in-flight probes are aborted.
    pub fn stop(&self) {
        self.cluster.stop();
        self.stop.cancel();
        self.tasks.close();
    }

    /// Wait for all scheduler and worker tasks to drain.
    pub async fn wait(&self) {
        self.tasks.wait().await;
        self.cluster.wait().await;
    }

    async fn run(self: Arc<Self>) {
        // Subscribe before the initial sync so no catalog event is lost.
        let mut mirror_events = self.store.subscribe(PubSubChannel::MirrorUpdate);
        let mut config_events = self.config.subscribe();

        // Scan the local repository once, retrying until the stop signal.
        loop {
            match self.scanner.scan_source(&self.stop).await {
                Ok(()) => break,
                Err(err) => error!(error = %err, "scanning source failed"),
            }
            tokio::select! {
                _ = self.stop.cancelled() => return,
                _ = tokio::time::sleep(REPOSITORY_RETRY_DELAY) => {}
            }
        }

        // Load the full mirror catalog.
        loop {
            match self.store.mirror_ids().await {
                Ok(ids) => {
                    self.registry
                        .sync(self.store.as_ref(), &self.cluster, &ids)
                        .await;
                    break;
                }
                Err(err) => {
                    if !err.is_loading() {
                        error!(error = %err, "listing mirrors failed");
                    }
                }
            }
            tokio::select! {
                _ = self.stop.cancelled() => return,
                _ = tokio::time::sleep(CATALOG_RETRY_DELAY) => {}
            }
        }

        self.cluster.start();

        for _ in 0..HEALTH_CHECK_WORKERS {
            let worker = Arc::clone(&self);
            self.tasks.spawn(async move { worker.health_check_worker().await });
        }
        for _ in 0..self.config.get().concurrent_sync {
            let worker = Arc::clone(&self);
            self.tasks.spawn(async move { worker.scan_worker().await });
        }

        let mut repository_scan_interval: Option<u64> = None;
        let mut repository_ticker: Option<tokio::time::Interval> = None;
        let mut dispatch = interval_at(Instant::now() + DISPATCH_INTERVAL, DISPATCH_INTERVAL);

        // Force a first configuration pass so the timers initialize.
        self.config.notify();

        loop {
            let repository_tick = async {
                match repository_ticker.as_mut() {
                    Some(ticker) => {
                        ticker.tick().await;
                    }
                    None => std::future::pending().await,
                }
            };
            let wake = tokio::select! {
                _ = self.stop.cancelled() => Wake::Stop,
                event = mirror_events.recv() => Wake::Mirror(event.ok()),
                Some(()) = config_events.recv() => Wake::Reconfigure,
                _ = repository_tick => Wake::RepositoryScan,
                _ = dispatch.tick() => Wake::Dispatch,
            };
            match wake {
                Wake::Stop => return,
                Wake::Mirror(Some(id)) => {
                    self.registry
                        .sync(self.store.as_ref(), &self.cluster, &[id])
                        .await;
                }
                Wake::Mirror(None) => {}
                Wake::Reconfigure => {
                    let minutes = self.config.get().repository_scan_interval;
                    if repository_scan_interval != Some(minutes) {
                        repository_scan_interval = Some(minutes);
                        repository_ticker = if minutes == 0 {
                            debug!("repository scans disabled");
                            None
                        } else {
                            let period = Duration::from_secs(minutes * 60);
                            Some(interval_at(Instant::now() + period, period))
                        };
                    }
                }
                Wake::RepositoryScan => {
                    if let Err(err) = self.scanner.scan_source(&self.stop).await {
                        error!(error = %err, "scanning source failed");
                    }
                }
                Wake::Dispatch => self.dispatch_tick(),
            }
        }
    }

    /// One pass of the 1 Hz dispatcher.
    ///
    /// Holds `map_lock` for the whole pass; the cluster lookup takes the
    /// reader side of `nodes_lock` underneath, never the other way around.
    /// A full queue drops the enqueue silently, the next tick retries.
    fn dispatch_tick(&self) {
        if self.store.is_failing() {
            return;
        }
        let cfg = self.config.get();
        let check_window = (cfg.check_interval * 60) as i64;
        let scan_window = (cfg.scan_interval * 60) as i64;

        let mut mirrors = self.registry.entries();
        for (id, entry) in mirrors.iter_mut() {
            if !entry.mirror.enabled {
                continue;
            }
            if clock::elapsed(entry.last_check, check_window)
                && !entry.checking
                && self.cluster.is_handled(id)
                && self.health_tx.try_send(id.clone()).is_ok()
            {
                entry.checking = true;
            }
            if clock::elapsed(entry.mirror.last_sync, scan_window)
                && !entry.scanning
                && self.cluster.is_handled(id)
                && self.scan_tx.try_send(id.clone()).is_ok()
            {
                entry.scanning = true;
            }
        }
    }

    async fn health_check_worker(&self) {
        loop {
            let id = tokio::select! {
                _ = self.stop.cancelled() => return,
                received = async { self.health_rx.lock().await.recv().await } => {
                    match received {
                        Some(id) => id,
                        None => return,
                    }
                }
            };
            if self.stop.is_cancelled() {
                return;
            }
            let Some(mirror) = self.registry.mirror_snapshot(&id) else {
                continue;
            };

            let outcome = self.health_check(&mirror).await;

            if matches!(outcome, Err(Error::MirrorNotScanned)) {
                // The checking slot is kept on purpose: an unscanned mirror
                // must not be probed again until a scan completes.
                continue;
            }
            let stamp = !matches!(&outcome, Err(err) if err.is_loading());
            self.registry.finish_check(&id, stamp);
        }
    }

    async fn scan_worker(&self) {
        loop {
            let id = tokio::select! {
                _ = self.stop.cancelled() => return,
                received = async { self.scan_rx.lock().await.recv().await } => {
                    match received {
                        Some(id) => id,
                        None => return,
                    }
                }
            };
            match self.registry.mirror_snapshot(&id) {
                Some(mirror) => {
                    self.scan_mirror(&id, &mirror).await;
                    self.registry.finish_scan(&id);
                }
                None => self.registry.finish_scan(&id),
            }
        }
    }

    async fn scan_mirror(&self, id: &str, mirror: &Mirror) {
        match self.store.is_scanning(id).await {
            Err(err) => {
                if !err.is_loading() {
                    warn!(mirror = %id, error = %err, "scan lease lookup failed");
                }
                return;
            }
            Ok(true) => return, // another peer holds the lease
            Ok(false) => {}
        }

        debug!(mirror = %id, "scanning");

        let mut outcome: Result<()> = Err(Error::NoSyncMethod);
        if !mirror.rsync_url.is_empty() {
            outcome = self
                .scanner
                .scan(ScanMethod::Rsync, &mirror.rsync_url, id, &self.stop)
                .await;
        }
        // Fall back to FTP unless rsync was interrupted by a stop request.
        if let Err(err) = &outcome {
            if !matches!(err, Error::ScanAborted) && !mirror.ftp_url.is_empty() {
                outcome = self
                    .scanner
                    .scan(ScanMethod::Ftp, &mirror.ftp_url, id, &self.stop)
                    .await;
            }
        }
        if matches!(outcome, Err(Error::ScanInProgress)) {
            warn!(mirror = %id, "scan already in progress");
            return;
        }

        if !mirror.up {
            // Fresh content may be all the mirror was missing.
            let _ = self.health_tx.try_send(id.to_string());
        }
    }
}
