//! Integration tests for the download statistics pipeline

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};

use mirrorwatch::clock;
use mirrorwatch::stats::{Stats, UserAgent};
use mirrorwatch::store::MemoryStore;
use mirrorwatch::Error;

fn linux_firefox() -> UserAgent {
    UserAgent {
        platform: "X11".to_string(),
        os: "Linux".to_string(),
        browser: "Firefox".to_string(),
    }
}

#[tokio::test]
async fn counters_roll_up_by_day_month_year_and_all_time() {
    let store = Arc::new(MemoryStore::new());
    let stats = Stats::new(store.clone());

    let day = Utc.with_ymd_and_hms(2023, 5, 17, 12, 0, 0).unwrap();
    for _ in 0..3 {
        stats
            .count_download("M", "/a", 10, day, linux_firefox())
            .unwrap();
    }

    // Give the owner a flush cycle, then stop (which flushes the rest).
    tokio::time::sleep(Duration::from_millis(1200)).await;
    stats.terminate().await;

    // File counters at every rolling level.
    assert_eq!(store.hash_value("STATS_FILE_2023_05_17", "/a"), Some(3));
    assert_eq!(store.hash_value("STATS_FILE_2023_05", "/a"), Some(3));
    assert_eq!(store.hash_value("STATS_FILE_2023", "/a"), Some(3));
    assert_eq!(store.hash_value("STATS_FILE", "/a"), Some(3));
    assert_eq!(store.scalar("STATS_TOTAL"), Some(3));

    // Mirror counters and byte counters.
    assert_eq!(store.hash_value("STATS_MIRROR_2023_05_17", "M"), Some(3));
    assert_eq!(store.hash_value("STATS_MIRROR_BYTES_2023_05_17", "M"), Some(30));
    assert_eq!(store.hash_value("STATS_MIRROR_BYTES_2023", "M"), Some(30));

    // User-agent counters are dated with the ingestion day.
    let today = clock::day_key(Utc::now());
    assert_eq!(
        store.zset_score(&format!("STATS_USERAGENT_platform_{today}"), "X11"),
        Some(3)
    );
    assert_eq!(
        store.zset_score(&format!("STATS_USERAGENT_os_{today}"), "Linux"),
        Some(3)
    );
    assert_eq!(
        store.zset_score("STATS_USERAGENT_browser", "Firefox"),
        Some(3),
        "all-time user-agent bucket"
    );
}

#[tokio::test]
async fn rolling_levels_agree_when_one_day_gets_all_traffic() {
    let store = Arc::new(MemoryStore::new());
    let stats = Stats::new(store.clone());

    let day = Utc.with_ymd_and_hms(2024, 2, 29, 8, 30, 0).unwrap();
    for _ in 0..5 {
        stats
            .count_download("mirror-eu", "/iso/disk.img", 7, day, linux_firefox())
            .unwrap();
    }

    tokio::time::sleep(Duration::from_millis(1200)).await;
    stats.terminate().await;

    for key in [
        "STATS_MIRROR_2024_02_29",
        "STATS_MIRROR_2024_02",
        "STATS_MIRROR_2024",
        "STATS_MIRROR",
    ] {
        assert_eq!(store.hash_value(key, "mirror-eu"), Some(5), "key {key}");
    }
}

#[tokio::test]
async fn terminate_flushes_buffered_events() {
    let store = Arc::new(MemoryStore::new());
    let stats = Stats::new(store.clone());

    let day = Utc.with_ymd_and_hms(2023, 5, 17, 12, 0, 0).unwrap();
    stats
        .count_download("M", "/a", 1, day, linux_firefox())
        .unwrap();

    // Let the owner drain the queue, then stop before asserting: the stop
    // path must flush what the ticker has not.
    tokio::time::sleep(Duration::from_millis(100)).await;
    stats.terminate().await;

    assert_eq!(store.hash_value("STATS_FILE_2023_05_17", "/a"), Some(1));
    assert_eq!(store.scalar("STATS_TOTAL"), Some(1));
}

#[tokio::test]
async fn failed_flushes_retain_counters_for_the_next_attempt() {
    let store = Arc::new(MemoryStore::new());
    let stats = Stats::new(store.clone());

    store.set_failing(true);
    let day = Utc.with_ymd_and_hms(2023, 5, 17, 12, 0, 0).unwrap();
    stats
        .count_download("M", "/a", 10, day, linux_firefox())
        .unwrap();

    // At least one flush attempt fails while the store is down.
    tokio::time::sleep(Duration::from_millis(800)).await;
    assert_eq!(store.hash_value("STATS_FILE_2023_05_17", "/a"), None);

    store.set_failing(false);
    tokio::time::sleep(Duration::from_millis(800)).await;

    assert_eq!(
        store.hash_value("STATS_FILE_2023_05_17", "/a"),
        Some(1),
        "counters must survive the outage"
    );
    assert_eq!(store.scalar("STATS_TOTAL"), Some(1));

    stats.terminate().await;
}

#[tokio::test]
async fn events_without_identity_are_rejected() {
    let store = Arc::new(MemoryStore::new());
    let stats = Stats::new(store.clone());
    let now = Utc::now();

    assert!(matches!(
        stats.count_download("", "/a", 1, now, UserAgent::default()),
        Err(Error::UnknownMirror)
    ));
    assert!(matches!(
        stats.count_download("M", "", 1, now, UserAgent::default()),
        Err(Error::EmptyFilePath)
    ));

    stats.terminate().await;
}
