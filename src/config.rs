//! Runtime configuration for the monitoring core
//!
//! Knobs are loaded from `MIRRORWATCH_*` environment variables and held
//! behind a shared handle. Components that need to react to a reload
//! subscribe for change notifications; the notify channels are capacity-1
//! and fed with non-blocking sends so a slow consumer only coalesces
//! notifications instead of blocking the reloader.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;

use crate::{Error, Result};

/// Monitoring knobs, intervals are in minutes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Minutes between two health checks of the same mirror
    pub check_interval: u64,
    /// Minutes between two content scans of the same mirror
    pub scan_interval: u64,
    /// Minutes between two scans of the local repository, 0 disables
    pub repository_scan_interval: u64,
    /// Number of concurrent scan workers
    pub concurrent_sync: usize,
    /// Treat any redirect answered by a mirror as a probe failure
    pub disallow_redirects: bool,
    /// Disable a mirror when the probed file is missing (404)
    pub disable_on_missing_file: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            check_interval: 1,
            scan_interval: 30,
            repository_scan_interval: 5,
            concurrent_sync: 2,
            disallow_redirects: false,
            disable_on_missing_file: false,
        }
    }
}

impl Config {
    /// Build a configuration from `MIRRORWATCH_*` environment variables,
    /// falling back to the defaults for anything unset.
    pub fn from_env() -> Result<Self> {
        let defaults = Config::default();
        Ok(Self {
            check_interval: env_u64("MIRRORWATCH_CHECK_INTERVAL", defaults.check_interval)?,
            scan_interval: env_u64("MIRRORWATCH_SCAN_INTERVAL", defaults.scan_interval)?,
            repository_scan_interval: env_u64(
                "MIRRORWATCH_REPOSITORY_SCAN_INTERVAL",
                defaults.repository_scan_interval,
            )?,
            concurrent_sync: env_u64("MIRRORWATCH_CONCURRENT_SYNC", defaults.concurrent_sync as u64)?
                as usize,
            disallow_redirects: env_bool(
                "MIRRORWATCH_DISALLOW_REDIRECTS",
                defaults.disallow_redirects,
            )?,
            disable_on_missing_file: env_bool(
                "MIRRORWATCH_DISABLE_ON_MISSING_FILE",
                defaults.disable_on_missing_file,
            )?,
        })
    }
}

fn env_u64(name: &str, default: u64) -> Result<u64> {
    match std::env::var(name) {
        Err(_) => Ok(default),
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("{name} must be an integer: {e}"))),
    }
}

fn env_bool(name: &str, default: bool) -> Result<bool> {
    let Ok(raw) = std::env::var(name) else {
        return Ok(default);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(Error::Config(format!(
            "{name} must be a boolean (true/false/1/0), got '{raw}'"
        ))),
    }
}

/// Shared, reloadable view of the configuration.
#[derive(Clone)]
pub struct ConfigHandle {
    inner: Arc<Inner>,
}

struct Inner {
    current: RwLock<Config>,
    subscribers: Mutex<Vec<mpsc::Sender<()>>>,
}

impl ConfigHandle {
    pub fn new(config: Config) -> Self {
        Self {
            inner: Arc::new(Inner {
                current: RwLock::new(config),
                subscribers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Snapshot of the current configuration.
    pub fn get(&self) -> Config {
        self.inner.current.read().clone()
    }

    /// Swap in a new configuration and notify all subscribers.
    pub fn replace(&self, config: Config) {
        *self.inner.current.write() = config;
        self.notify();
    }

    /// Register for change notifications.
    pub fn subscribe(&self) -> mpsc::Receiver<()> {
        let (tx, rx) = mpsc::channel(1);
        self.inner.subscribers.lock().push(tx);
        rx
    }

    /// Wake every subscriber without changing the configuration.
    ///
    /// Used at startup to force the timers to initialize from the current
    /// values through the same code path as a runtime reload.
    pub fn notify(&self) {
        for tx in self.inner.subscribers.lock().iter() {
            let _ = tx.try_send(());
        }
    }
}

impl Default for ConfigHandle {
    fn default() -> Self {
        Self::new(Config::default())
    }
}
