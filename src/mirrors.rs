//! Mirror catalog records

use serde::{Deserialize, Serialize};

/// A mirror as registered in the shared catalog.
///
/// The identity is the opaque `id`; everything else is mutable operator or
/// scanner state. Reachability (`up` plus `down_reason`) is written back by
/// whichever peer ran the last health check, last-writer-wins.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Mirror {
    /// Opaque catalog identifier
    pub id: String,
    /// Disabled mirrors are kept in the registry but never dispatched
    pub enabled: bool,
    /// Base URL served to clients and probed by the health check
    pub http_url: String,
    /// rsync endpoint used for content scans, empty when unsupported
    pub rsync_url: String,
    /// FTP endpoint used as a scan fallback, empty when unsupported
    pub ftp_url: String,
    /// Unix seconds of the last successful content scan
    pub last_sync: i64,
    /// Result of the last reachability probe
    pub up: bool,
    /// Reason recorded along a negative probe result
    pub down_reason: String,
}

/// Add a trailing slash to a non-empty URL.
pub fn normalize_url(url: &str) -> String {
    if !url.is_empty() && !url.ends_with('/') {
        return format!("{url}/");
    }
    url.to_string()
}
