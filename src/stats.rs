//! Download statistics pipeline
//!
//! Request handlers push one event per served download onto bounded
//! queues; a single owner task folds them into an in-memory counter map
//! and flushes it to the store every 500 ms as one atomic batch. Counters
//! are plain commutative increments, so concurrent flushes from several
//! peers interleave safely. A failed flush keeps the map for the next
//! attempt (at-least-once; a crash between commit and clear may over-count,
//! which is acceptable for monotonic counters).
//!
//! Map keys have the shape `<type><YYYY_MM_DD>|<object>` with
//! `type ∈ {f,m,s,p,o,b}` for file count, mirror count, mirror bytes, and
//! the three user-agent dimensions.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, warn};

use crate::clock;
use crate::store::{CounterOp, Store};
use crate::{Error, Result};

const QUEUE_CAPACITY: usize = 1000;
const FLUSH_INTERVAL: Duration = Duration::from_millis(500);

/// Number of rolling aggregation levels: day, month, year, all-time.
const ROLLING_LEVELS: usize = 4;

#[derive(Debug, Clone)]
struct DownloadEvent {
    mirror_id: String,
    path: String,
    size: i64,
    time: DateTime<Utc>,
}

/// Client user-agent split into the dimensions tracked by the stats.
#[derive(Debug, Clone, Default)]
pub struct UserAgent {
    pub platform: String,
    pub os: String,
    pub browser: String,
}

/// Batching counter pipeline for download events.
pub struct Stats {
    download_tx: mpsc::Sender<DownloadEvent>,
    ua_tx: mpsc::Sender<UserAgent>,
    stop: CancellationToken,
    tasks: TaskTracker,
}

impl Stats {
    /// Create the pipeline and spawn its owner task.
    pub fn new(store: Arc<dyn Store>) -> Self {
        let (download_tx, download_rx) = mpsc::channel(QUEUE_CAPACITY);
        let (ua_tx, ua_rx) = mpsc::channel(QUEUE_CAPACITY);
        let stop = CancellationToken::new();
        let tasks = TaskTracker::new();

        let owner_stop = stop.clone();
        tasks.spawn(async move { owner_loop(store, download_rx, ua_rx, owner_stop).await });

        Self {
            download_tx,
            ua_tx,
            stop,
            tasks,
        }
    }

    /// Count one served download.
    ///
    /// Non-blocking: on a full queue the event is rejected with
    /// [`Error::StatsBacklog`] instead of stalling the request path.
    pub fn count_download(
        &self,
        mirror_id: &str,
        path: &str,
        size: i64,
        time: DateTime<Utc>,
        user_agent: UserAgent,
    ) -> Result<()> {
        if mirror_id.is_empty() {
            return Err(Error::UnknownMirror);
        }
        if path.is_empty() {
            return Err(Error::EmptyFilePath);
        }
        self.download_tx
            .try_send(DownloadEvent {
                mirror_id: mirror_id.to_string(),
                path: path.to_string(),
                size,
                time,
            })
            .map_err(|_| Error::StatsBacklog)?;
        self.ua_tx
            .try_send(user_agent)
            .map_err(|_| Error::StatsBacklog)?;
        Ok(())
    }

    /// Stop the pipeline, flushing whatever is buffered.
    pub async fn terminate(&self) {
        self.stop.cancel();
        self.tasks.close();
        self.tasks.wait().await;
    }
}

async fn owner_loop(
    store: Arc<dyn Store>,
    mut download_rx: mpsc::Receiver<DownloadEvent>,
    mut ua_rx: mpsc::Receiver<UserAgent>,
    stop: CancellationToken,
) {
    let mut counters: HashMap<String, i64> = HashMap::new();
    let mut flush_ticker = interval_at(Instant::now() + FLUSH_INTERVAL, FLUSH_INTERVAL);

    loop {
        tokio::select! {
            _ = stop.cancelled() => {
                flush(store.as_ref(), &mut counters).await;
                return;
            }
            Some(event) = download_rx.recv() => {
                let date = format!("{}|", clock::day_key(event.time));
                *counters.entry(format!("f{date}{}", event.path)).or_insert(0) += 1;
                *counters.entry(format!("m{date}{}", event.mirror_id)).or_insert(0) += 1;
                *counters.entry(format!("s{date}{}", event.mirror_id)).or_insert(0) += event.size;
            }
            Some(ua) = ua_rx.recv() => {
                let date = format!("{}|", clock::day_key(Utc::now()));
                *counters.entry(format!("p{date}{}", ua.platform)).or_insert(0) += 1;
                *counters.entry(format!("o{date}{}", ua.os)).or_insert(0) += 1;
                *counters.entry(format!("b{date}{}", ua.browser)).or_insert(0) += 1;
            }
            _ = flush_ticker.tick() => {
                flush(store.as_ref(), &mut counters).await;
            }
        }
    }
}

/// Persist the counter map as one atomic batch, clearing it on success.
async fn flush(store: &dyn Store, counters: &mut HashMap<String, i64>) {
    if counters.is_empty() {
        return;
    }

    let mut ops = Vec::new();
    for (key, value) in counters.iter() {
        if *value == 0 {
            continue;
        }
        let Some((kind, date, object)) = parse_key(key) else {
            warn!(key = %key, "malformed stats key discarded");
            continue;
        };
        match kind {
            'f' => {
                for key in rolling_keys("STATS_FILE", date) {
                    ops.push(CounterOp::HashIncr {
                        key,
                        field: object.to_string(),
                        delta: *value,
                    });
                }
                ops.push(CounterOp::Incr {
                    key: "STATS_TOTAL".to_string(),
                    delta: *value,
                });
            }
            'm' => {
                for key in rolling_keys("STATS_MIRROR", date) {
                    ops.push(CounterOp::HashIncr {
                        key,
                        field: object.to_string(),
                        delta: *value,
                    });
                }
            }
            's' => {
                for key in rolling_keys("STATS_MIRROR_BYTES", date) {
                    ops.push(CounterOp::HashIncr {
                        key,
                        field: object.to_string(),
                        delta: *value,
                    });
                }
            }
            'p' | 'o' | 'b' => {
                let field = match kind {
                    'p' => "platform",
                    'o' => "os",
                    _ => "browser",
                };
                for key in rolling_keys(&format!("STATS_USERAGENT_{field}"), date) {
                    ops.push(CounterOp::SortedSetIncr {
                        key,
                        member: object.to_string(),
                        delta: *value,
                    });
                }
            }
            _ => warn!(key = %key, "unknown stats type discarded"),
        }
    }

    match store.apply_counters(&ops).await {
        Ok(()) => counters.clear(),
        // Keep the map: the next flush retries with the same counters.
        Err(err) => error!(error = %err, "could not persist stats"),
    }
}

/// Split `<type><date>|<object>` into its parts; `None` when the key is
/// missing its separator or its object.
fn parse_key(key: &str) -> Option<(char, &str, &str)> {
    let separator = key.find('|')?;
    if separator < 2 {
        return None;
    }
    let kind = key.chars().next()?;
    let date = &key[1..separator];
    let object = &key[separator + 1..];
    if object.is_empty() {
        return None;
    }
    Some((kind, date, object))
}

/// The day/month/year/all-time key chain for one dated counter, built by
/// trimming the date suffix at the last `_`.
fn rolling_keys(base: &str, date: &str) -> Vec<String> {
    let mut key = format!("{base}_{date}");
    let mut keys = Vec::with_capacity(ROLLING_LEVELS);
    for _ in 0..ROLLING_LEVELS {
        keys.push(key.clone());
        if let Some(pos) = key.rfind('_') {
            key.truncate(pos);
        }
    }
    keys
}

/// The minimal set of day/month/year keys covering `[start, end)`.
///
/// Whole months collapse to `YYYY_MM` keys and whole years to `YYYY`, which
/// is what makes range queries over the rolling counters cheap.
pub fn time_key_coverage(start: NaiveDate, end: NaiveDate) -> Vec<String> {
    let mut dates = Vec::new();
    if start == end {
        dates.push(start.format("%Y_%m_%d").to_string());
        return dates;
    }

    let mut cursor = start;

    // Leading partial month, day by day.
    if cursor.day() != 1 {
        let month = cursor.month();
        while cursor.month() == month && cursor != end {
            dates.push(cursor.format("%Y_%m_%d").to_string());
            cursor = cursor.succ_opt().expect("date overflow");
        }
    }

    // Whole years and whole months.
    loop {
        let next_year = NaiveDate::from_ymd_opt(cursor.year() + 1, 1, 1).expect("date overflow");
        let next_month = if cursor.month() == 12 {
            next_year
        } else {
            NaiveDate::from_ymd_opt(cursor.year(), cursor.month() + 1, 1).expect("date overflow")
        };
        if cursor.day() == 1 && cursor.month() == 1 && next_year <= end {
            dates.push(cursor.format("%Y").to_string());
            cursor = next_year;
        } else if next_month <= end {
            dates.push(cursor.format("%Y_%m").to_string());
            cursor = next_month;
        } else {
            break;
        }
    }

    // Trailing partial month.
    while cursor.succ_opt().expect("date overflow") <= end {
        dates.push(cursor.format("%Y_%m_%d").to_string());
        cursor = cursor.succ_opt().expect("date overflow");
    }

    dates
}
