//! Integration tests for the monitor scheduler and the health checker
//!
//! Probe targets are real HTTP endpoints bound on the loopback interface,
//! so the checks exercise the same request path as production probes.

use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use axum::response::Redirect;
use axum::routing::get;
use axum::Router;
use tokio_util::sync::CancellationToken;

use mirrorwatch::clock;
use mirrorwatch::cluster::Cluster;
use mirrorwatch::config::{Config, ConfigHandle};
use mirrorwatch::mirrors::Mirror;
use mirrorwatch::monitor::Monitor;
use mirrorwatch::scan::{ScanMethod, Scanner};
use mirrorwatch::store::{MemoryStore, PubSubChannel, Store};
use mirrorwatch::Result;

struct StubScanner;

#[async_trait::async_trait]
impl Scanner for StubScanner {
    async fn scan(
        &self,
        _method: ScanMethod,
        _url: &str,
        _mirror_id: &str,
        _stop: &CancellationToken,
    ) -> Result<()> {
        Ok(())
    }

    async fn scan_source(&self, _stop: &CancellationToken) -> Result<()> {
        Ok(())
    }
}

/// Serve `app` on an ephemeral loopback port, returning the base URL.
async fn serve(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

fn mirror(id: &str, http_url: &str) -> Mirror {
    Mirror {
        id: id.to_string(),
        enabled: true,
        http_url: http_url.to_string(),
        // A recent sync keeps the scan queue quiet during probe tests.
        last_sync: clock::unix_now(),
        ..Default::default()
    }
}

fn start_monitor(store: Arc<MemoryStore>, config: Config) -> Arc<Monitor> {
    let cluster = Arc::new(Cluster::with_node_id(
        store.clone(),
        "probe-00001".to_string(),
    ));
    let monitor = Monitor::with_cluster(
        store,
        Arc::new(StubScanner),
        ConfigHandle::new(config),
        cluster,
    )
    .expect("monitor must build");
    monitor.start();
    monitor
}

#[tokio::test]
async fn reachable_mirror_with_matching_size_is_marked_up() {
    let base = serve(Router::new().route("/files/test.bin", get(|| async { vec![0u8; 100] }))).await;

    let store = Arc::new(MemoryStore::new());
    store.insert_mirror(mirror("m1", &base));
    store.set_handled_files("m1", &[("/files/test.bin", 100)]);

    let monitor = start_monitor(store.clone(), Config::default());
    tokio::time::sleep(Duration::from_millis(2200)).await;

    let m = store.mirror("m1").unwrap();
    assert!(m.up, "mirror must be marked up");
    assert!(m.down_reason.is_empty());
    assert!(
        monitor.registry().last_check("m1").unwrap() > 0,
        "probe time must be stamped"
    );
    assert!(!monitor.registry().is_checking("m1"), "slot must be released");

    monitor.stop();
    monitor.wait().await;
}

#[tokio::test]
async fn size_mismatch_is_up_with_a_warning() {
    let base = serve(Router::new().route("/files/test.bin", get(|| async { vec![0u8; 100] }))).await;

    let store = Arc::new(MemoryStore::new());
    store.insert_mirror(mirror("m1", &base));
    // Recorded size differs from what the endpoint reports.
    store.set_handled_files("m1", &[("/files/test.bin", 101)]);

    let monitor = start_monitor(store.clone(), Config::default());
    tokio::time::sleep(Duration::from_millis(2200)).await;

    assert!(store.mirror("m1").unwrap().up, "size drift is non-fatal");

    monitor.stop();
    monitor.wait().await;
}

#[tokio::test]
async fn missing_file_marks_down_and_disables_when_configured() {
    let base = serve(Router::new().route(
        "/files/test.bin",
        get(|| async { StatusCode::NOT_FOUND }),
    ))
    .await;

    let store = Arc::new(MemoryStore::new());
    let mut m = mirror("m1", &base);
    m.up = true;
    store.insert_mirror(m);
    store.set_handled_files("m1", &[("/files/test.bin", 100)]);

    let config = Config {
        disable_on_missing_file: true,
        ..Default::default()
    };
    let monitor = start_monitor(store.clone(), config);
    tokio::time::sleep(Duration::from_millis(2200)).await;

    let m = store.mirror("m1").unwrap();
    assert!(!m.up);
    assert!(
        m.down_reason.contains("File not found"),
        "reason was {:?}",
        m.down_reason
    );
    assert!(!m.enabled, "mirror must be disabled on a missing file");

    monitor.stop();
    monitor.wait().await;
}

#[tokio::test]
async fn bad_status_marks_down_with_the_code() {
    let base = serve(Router::new().route(
        "/files/test.bin",
        get(|| async { StatusCode::SERVICE_UNAVAILABLE }),
    ))
    .await;

    let store = Arc::new(MemoryStore::new());
    store.insert_mirror(mirror("m1", &base));
    store.set_handled_files("m1", &[("/files/test.bin", 100)]);

    let monitor = start_monitor(store.clone(), Config::default());
    tokio::time::sleep(Duration::from_millis(2200)).await;

    let m = store.mirror("m1").unwrap();
    assert!(!m.up);
    assert_eq!(m.down_reason, "Got status code 503");

    monitor.stop();
    monitor.wait().await;
}

#[tokio::test]
async fn unreachable_mirror_is_marked_down() {
    let store = Arc::new(MemoryStore::new());
    // Nothing listens on this port.
    store.insert_mirror(mirror("m1", "http://127.0.0.1:9"));
    store.set_handled_files("m1", &[("/files/test.bin", 100)]);

    let monitor = start_monitor(store.clone(), Config::default());
    tokio::time::sleep(Duration::from_millis(2500)).await;

    let m = store.mirror("m1").unwrap();
    assert!(!m.up);
    assert_eq!(m.down_reason, "Unreachable");

    monitor.stop();
    monitor.wait().await;
}

#[tokio::test]
async fn rejected_redirect_counts_as_unreachable() {
    let base = serve(Router::new().route(
        "/files/test.bin",
        get(|| async { Redirect::permanent("http://127.0.0.1:9/files/test.bin") }),
    ))
    .await;

    let store = Arc::new(MemoryStore::new());
    store.insert_mirror(mirror("m1", &base));
    store.set_handled_files("m1", &[("/files/test.bin", 100)]);

    let config = Config {
        disallow_redirects: true,
        ..Default::default()
    };
    let monitor = start_monitor(store.clone(), config);
    tokio::time::sleep(Duration::from_millis(2200)).await;

    let m = store.mirror("m1").unwrap();
    assert!(!m.up);
    assert_eq!(m.down_reason, "Unreachable");

    monitor.stop();
    monitor.wait().await;
}

#[tokio::test]
async fn unscanned_mirror_keeps_its_checking_slot() {
    let store = Arc::new(MemoryStore::new());
    store.insert_mirror(mirror("m1", "http://127.0.0.1:9"));
    // No handled files: the mirror has never been scanned.

    let monitor = start_monitor(store.clone(), Config::default());
    tokio::time::sleep(Duration::from_millis(2500)).await;

    assert!(
        monitor.registry().is_checking("m1"),
        "checking must stay set until a scan completes"
    );
    assert_eq!(
        monitor.registry().last_check("m1"),
        Some(0),
        "probe time must not be stamped"
    );
    assert!(store.mirror("m1").unwrap().down_reason.is_empty());

    monitor.stop();
    monitor.wait().await;
}

#[tokio::test]
async fn catalog_events_resync_the_registry() {
    let base = serve(Router::new().route("/files/test.bin", get(|| async { vec![0u8; 100] }))).await;

    let store = Arc::new(MemoryStore::new());
    store.insert_mirror(mirror("m1", &base));
    store.set_handled_files("m1", &[("/files/test.bin", 100)]);

    let monitor = start_monitor(store.clone(), Config::default());
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(monitor.registry().contains("m1"));

    // A new mirror appears in the catalog.
    store.insert_mirror(mirror("m2", &base));
    store
        .publish(PubSubChannel::MirrorUpdate, "m2")
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(monitor.registry().contains("m2"));
    assert!(monitor.cluster().is_handled("m2"));

    // And one is deleted.
    store.delete_mirror("m1");
    store
        .publish(PubSubChannel::MirrorUpdate, "m1")
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!monitor.registry().contains("m1"));

    monitor.stop();
    monitor.wait().await;
}

#[tokio::test]
async fn stop_aborts_probes_in_flight() {
    // The endpoint hangs far longer than the test is willing to wait.
    let base = serve(Router::new().route(
        "/files/test.bin",
        get(|| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            "late"
        }),
    ))
    .await;

    let store = Arc::new(MemoryStore::new());
    store.insert_mirror(mirror("m1", &base));
    store.set_handled_files("m1", &[("/files/test.bin", 100)]);

    let monitor = start_monitor(store.clone(), Config::default());
    // Let the dispatcher enqueue the probe and the worker block on it.
    tokio::time::sleep(Duration::from_millis(1600)).await;

    monitor.stop();
    tokio::time::timeout(Duration::from_secs(1), monitor.wait())
        .await
        .expect("all tasks must return within a second of stop");
}
