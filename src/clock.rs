//! Wall-clock helpers shared by the monitoring loops
//!
//! All liveness decisions (peer age-out, health-check and scan due times)
//! are made against unix seconds in UTC so they can be compared with
//! timestamps persisted in the shared store.

use chrono::{DateTime, Utc};

/// Current unix time in seconds (UTC).
pub fn unix_now() -> i64 {
    Utc::now().timestamp()
}

/// True once `window_secs` seconds have fully elapsed since `since`.
///
/// A `since` of zero (never happened) is always considered elapsed.
pub fn elapsed(since: i64, window_secs: i64) -> bool {
    since + window_secs < unix_now()
}

/// Date key used by the stats buckets, `YYYY_MM_DD`.
pub fn day_key(t: DateTime<Utc>) -> String {
    t.format("%Y_%m_%d").to_string()
}
