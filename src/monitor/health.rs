//! Mirror reachability probe
//!
//! A health check issues a single HTTP HEAD against a random file the
//! mirror is known to serve and compares the reported size with the
//! canonical one. Each probe opens a fresh connection so it observes the
//! TCP path a real client would get.

use std::time::{Duration, Instant};

use reqwest::header::{CONNECTION, CONTENT_LENGTH, USER_AGENT};
use reqwest::{redirect, StatusCode};
use tracing::{debug, error, info, warn};

use super::Monitor;
use crate::config::ConfigHandle;
use crate::mirrors::Mirror;
use crate::{Error, Result};

const PROBE_USER_AGENT: &str =
    concat!("Mirrorbits/", env!("CARGO_PKG_VERSION"), " PING CHECK");
const CONNECT_TIMEOUT: Duration = Duration::from_secs(20);
const PROBE_DEADLINE: Duration = Duration::from_secs(40);
const MAX_REDIRECTS: usize = 10;

/// Build the probe client: bounded dial and total times, no connection
/// reuse, and a redirect policy that consults the live configuration on
/// every hop.
pub(super) fn build_probe_client(config: &ConfigHandle) -> Result<reqwest::Client> {
    let config = config.clone();
    let policy = redirect::Policy::custom(move |attempt| {
        if config.get().disallow_redirects {
            attempt.error(Error::RedirectNotAllowed)
        } else if attempt.previous().len() > MAX_REDIRECTS {
            attempt.stop()
        } else {
            attempt.follow()
        }
    });
    Ok(reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .timeout(PROBE_DEADLINE)
        .pool_max_idle_per_host(0)
        .redirect(policy)
        .build()?)
}

impl Monitor {
    /// Probe one mirror and record the outcome in the store.
    ///
    /// Returns `Err(Error::MirrorNotScanned)` when the mirror has no known
    /// file yet; a stop request mid-probe aborts the request and returns
    /// `Ok(())` without recording anything.
    pub(super) async fn health_check(&self, mirror: &Mirror) -> Result<()> {
        let (file, size) = match self.store.random_handled_file(&mirror.id).await {
            Ok(Some(pair)) => pair,
            Ok(None) => {
                debug!(mirror = %mirror.id, "not scanned yet, skipping probe");
                return Err(Error::MirrorNotScanned);
            }
            Err(err) => {
                if !err.is_loading() {
                    warn!(mirror = %mirror.id, error = %err, "cannot pick a probe file");
                }
                return Err(err);
            }
        };

        let url = format!("{}{}", mirror.http_url.trim_end_matches('/'), file);
        let started = Instant::now();
        let sent = tokio::select! {
            _ = self.stop.cancelled() => {
                debug!(mirror = %mirror.id, url = %url, "aborting health check");
                return Ok(());
            }
            result = self
                .client
                .head(&url)
                .header(USER_AGENT, PROBE_USER_AGENT)
                .header(CONNECTION, "close")
                .send() => result,
        };
        let elapsed_ms = started.elapsed().as_millis() as u64;
        if self.stop.is_cancelled() {
            return Ok(());
        }

        let response = match sent {
            Ok(response) => response,
            Err(err) => {
                self.record_down(&mirror.id, "Unreachable").await;
                error!(mirror = %mirror.id, error = %err, elapsed_ms, "mirror unreachable");
                return Err(err.into());
            }
        };

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            self.record_down(&mirror.id, &format!("File not found {file} (error 404)"))
                .await;
            if self.config.get().disable_on_missing_file {
                if let Err(err) = self.store.disable_mirror(&mirror.id).await {
                    warn!(mirror = %mirror.id, error = %err, "disabling mirror failed");
                }
            }
            error!(mirror = %mirror.id, file = %file, "file not found (error 404)");
        } else if status != StatusCode::OK {
            self.record_down(&mirror.id, &format!("Got status code {}", status.as_u16()))
                .await;
            warn!(mirror = %mirror.id, status = status.as_u16(), "mirror down");
        } else {
            if let Err(err) = self.store.mark_mirror_up(&mirror.id).await {
                warn!(mirror = %mirror.id, error = %err, "marking mirror up failed");
            }
            let reported = response
                .headers()
                .get(CONTENT_LENGTH)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.parse::<i64>().ok());
            match reported {
                // Size drift is non-fatal: the mirror may be mid-sync.
                Some(reported) if reported != size => {
                    warn!(
                        mirror = %mirror.id,
                        file = %file,
                        expected = size,
                        reported,
                        elapsed_ms,
                        "file size mismatch"
                    );
                }
                _ => info!(mirror = %mirror.id, elapsed_ms, "mirror up"),
            }
        }
        Ok(())
    }

    async fn record_down(&self, id: &str, reason: &str) {
        if let Err(err) = self.store.mark_mirror_down(id, reason).await {
            warn!(mirror = %id, error = %err, "marking mirror down failed");
        }
    }
}
