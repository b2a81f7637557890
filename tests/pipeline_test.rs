//! End-to-end pipeline tests over real sockets.
//!
//! Every test binds ephemeral ports (`base_port = 0`) on loopback and stores
//! into a fresh temp directory.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Utc;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use vidq::catalog::Catalog;
use vidq::codec;
use vidq::config::Config;
use vidq::engine::{Pipeline, PipelineHandle};
use vidq::error::{Error, Result};
use vidq::event::{Event, EventBus, EventKind};
use vidq::model::{VideoMetadata, WorkItem, WorkerId};
use vidq::storage::{DiskStore, VideoStore};

const WAIT: Duration = Duration::from_secs(5);

fn test_config(storage_dir: &Path, workers: u32, capacity: usize) -> Config {
    Config {
        worker_count: workers,
        queue_capacity: capacity,
        base_port: 0,
        bind_host: IpAddr::V4(Ipv4Addr::LOCALHOST),
        storage_dir: storage_dir.to_path_buf(),
        poll_interval: Duration::from_millis(50),
        processing_delay: Duration::ZERO,
        processing_jitter: Duration::ZERO,
        read_timeout: Duration::from_secs(2),
        store_grace: Duration::from_millis(200),
        ..Config::default()
    }
}

struct Harness {
    handle: PipelineHandle,
    catalog: Arc<Catalog>,
    events: broadcast::Receiver<Event>,
    _dir: tempfile::TempDir,
}

async fn start(workers: u32, capacity: usize, delay: Duration) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let config = Config {
        processing_delay: delay,
        ..test_config(dir.path(), workers, capacity)
    };

    let catalog = Arc::new(Catalog::new());
    let store = Arc::new(DiskStore::new(dir.path(), Arc::clone(&catalog)));
    let bus = Arc::new(EventBus::new(1024));
    let events = bus.subscribe();

    let handle = Pipeline::new(config, store)
        .with_observer(bus)
        .start()
        .await
        .expect("pipeline should start");

    Harness {
        handle,
        catalog,
        events,
        _dir: dir,
    }
}

fn slot(n: u32) -> WorkerId {
    WorkerId::new(n).unwrap()
}

async fn send(addr: SocketAddr, file_name: &str, payload: &[u8]) {
    let metadata = VideoMetadata {
        file_name: file_name.to_string(),
        file_size: payload.len() as i64,
        content_type: "video/mp4".to_string(),
        timestamp: Utc::now(),
    };
    let mut stream = TcpStream::connect(addr).await.unwrap();
    codec::write_frame(&mut stream, &metadata, payload)
        .await
        .unwrap();
    stream.shutdown().await.unwrap();
}

/// Wait for the first event matching `pred`, skipping others.
async fn expect_event(
    rx: &mut broadcast::Receiver<Event>,
    pred: impl Fn(&EventKind) -> bool,
) -> EventKind {
    tokio::time::timeout(WAIT, async {
        loop {
            let event = rx.recv().await.expect("event bus closed or lagged");
            if pred(&event.kind) {
                return event.kind;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

// ---------------------------------------------------------------------------
// Happy path
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn videos_sent_to_each_port_are_stored_per_worker() {
    let mut h = start(2, 10, Duration::ZERO).await;

    assert_eq!(h.handle.listen_addrs().len(), 2);
    let port1 = h.handle.listen_addr(slot(1)).unwrap();
    let port2 = h.handle.listen_addr(slot(2)).unwrap();
    assert_ne!(port1.port(), port2.port());

    send(port1, "one.mp4", b"first video").await;
    send(port2, "two.mp4", b"second video").await;

    let mut processed = Vec::new();
    for _ in 0..2 {
        match expect_event(&mut h.events, |k| matches!(k, EventKind::VideoProcessed { .. })).await {
            EventKind::VideoProcessed { file_name, worker } => processed.push((file_name, worker)),
            _ => unreachable!(),
        }
    }
    processed.sort();
    assert_eq!(processed[0].0, "one.mp4");
    assert_eq!(processed[1].0, "two.mp4");

    assert_eq!(h.catalog.len(), 2);
    for entry in h.catalog.list() {
        let parent = entry.storage_location.parent().unwrap();
        assert_eq!(
            parent.file_name().unwrap().to_str().unwrap(),
            format!("worker-{}", entry.worker)
        );
        assert!(entry.processed_at.is_some());

        let bytes = h.catalog.read_bytes(entry.id).await.unwrap();
        let expected: &[u8] = if entry.metadata.file_name == "one.mp4" {
            b"first video"
        } else {
            b"second video"
        };
        assert_eq!(bytes, expected);
    }

    h.handle.stop().await.unwrap();
}

// ---------------------------------------------------------------------------
// Backpressure
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn full_queue_drops_new_arrivals() {
    // One slow worker, room for one waiting item.
    let mut h = start(1, 1, Duration::from_secs(30)).await;
    let addr = h.handle.listen_addr(slot(1)).unwrap();
    let queued = |k: &EventKind| matches!(k, EventKind::QueueUpdated { depth: 1, .. });

    send(addr, "a.mp4", b"a").await;
    expect_event(&mut h.events, queued).await;
    // Worker picks up "a" and sits in its processing delay.
    let queue = Arc::clone(h.handle.queue());
    wait_until(|| queue.is_empty()).await;

    send(addr, "b.mp4", b"b").await;
    expect_event(&mut h.events, queued).await;

    send(addr, "c.mp4", b"c").await;
    let dropped = expect_event(&mut h.events, |k| matches!(k, EventKind::VideoDropped { .. })).await;
    assert_eq!(
        dropped,
        EventKind::VideoDropped {
            file_name: "c.mp4".to_string()
        }
    );
    assert_eq!(queue.size(), 1);

    // The worker is mid-delay; shutdown must not wait the 30s out.
    tokio::time::timeout(Duration::from_secs(2), h.handle.stop())
        .await
        .expect("shutdown should interrupt processing")
        .unwrap();
    assert!(h.catalog.is_empty(), "abandoned item must not be stored");
}

// ---------------------------------------------------------------------------
// Fault isolation
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn bad_connections_do_not_stop_the_listener() {
    let mut h = start(1, 10, Duration::ZERO).await;
    let addr = h.handle.listen_addr(slot(1)).unwrap();

    // Length prefix promising metadata that never comes.
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(&100i32.to_le_bytes()).await.unwrap();
    stream.shutdown().await.unwrap();
    drop(stream);

    // Garbage metadata.
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(&4i32.to_le_bytes()).await.unwrap();
    stream.write_all(b"nope").await.unwrap();
    stream.shutdown().await.unwrap();
    drop(stream);

    send(addr, "good.mp4", b"payload").await;

    let kind = expect_event(&mut h.events, |k| matches!(k, EventKind::VideoProcessed { .. })).await;
    assert_eq!(
        kind,
        EventKind::VideoProcessed {
            file_name: "good.mp4".to_string(),
            worker: slot(1)
        }
    );
    assert_eq!(h.catalog.len(), 1);

    h.handle.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failed_item_does_not_stop_the_worker() {
    let mut h = start(1, 10, Duration::ZERO).await;
    let addr = h.handle.listen_addr(slot(1)).unwrap();

    // Empty payloads fail processing.
    send(addr, "empty.mp4", b"").await;
    send(addr, "after.mp4", b"data").await;

    let kind = expect_event(&mut h.events, |k| matches!(k, EventKind::VideoProcessed { .. })).await;
    assert_eq!(
        kind,
        EventKind::VideoProcessed {
            file_name: "after.mp4".to_string(),
            worker: slot(1)
        }
    );
    let names: Vec<_> = h
        .catalog
        .list()
        .into_iter()
        .map(|e| e.metadata.file_name)
        .collect();
    assert_eq!(names, vec!["after.mp4".to_string()]);

    h.handle.stop().await.unwrap();
}

struct FailingStore {
    calls: AtomicUsize,
}

impl VideoStore for FailingStore {
    async fn store(&self, item: &WorkItem, _worker: WorkerId) -> Result<PathBuf> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(Error::Storage(format!("disk full writing {}", item.file_name())))
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn storage_failures_are_contained() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FailingStore {
        calls: AtomicUsize::new(0),
    });
    let bus = Arc::new(EventBus::new(64));
    let mut events = bus.subscribe();

    let handle = Pipeline::new(test_config(dir.path(), 1, 10), Arc::clone(&store))
        .with_observer(bus)
        .start()
        .await
        .unwrap();
    let addr = handle.listen_addr(slot(1)).unwrap();

    send(addr, "x.mp4", b"x").await;
    send(addr, "y.mp4", b"y").await;
    wait_until(|| store.calls.load(Ordering::SeqCst) == 2).await;

    handle.stop().await.unwrap();

    while let Ok(event) = events.try_recv() {
        assert!(
            !matches!(event.kind, EventKind::VideoProcessed { .. }),
            "failed items must not be reported as processed"
        );
    }
}

/// A store that never completes, e.g. a wedged network filesystem.
struct StalledStore {
    calls: AtomicUsize,
}

impl VideoStore for StalledStore {
    async fn store(&self, _item: &WorkItem, _worker: WorkerId) -> Result<PathBuf> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        std::future::pending().await
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stalled_store_does_not_block_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(StalledStore {
        calls: AtomicUsize::new(0),
    });
    let bus = Arc::new(EventBus::new(64));
    let mut events = bus.subscribe();

    let handle = Pipeline::new(test_config(dir.path(), 1, 10), Arc::clone(&store))
        .with_observer(bus)
        .start()
        .await
        .unwrap();
    let addr = handle.listen_addr(slot(1)).unwrap();

    send(addr, "stuck.mp4", b"bytes").await;
    wait_until(|| store.calls.load(Ordering::SeqCst) == 1).await;

    tokio::time::timeout(Duration::from_secs(3), handle.stop())
        .await
        .expect("shutdown should give up on the store after the grace period")
        .unwrap();

    while let Ok(event) = events.try_recv() {
        assert!(!matches!(event.kind, EventKind::VideoProcessed { .. }));
    }
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn invalid_config_fails_before_binding() {
    let dir = tempfile::tempdir().unwrap();
    let catalog = Arc::new(Catalog::new());

    for config in [
        test_config(dir.path(), 0, 10),
        test_config(dir.path(), 2, 0),
    ] {
        let store = Arc::new(DiskStore::new(dir.path(), Arc::clone(&catalog)));
        let result = Pipeline::new(config, store).start().await;
        assert!(matches!(result, Err(Error::Config(_))));
    }
}

#[tokio::test]
async fn occupied_port_is_a_startup_error() {
    let dir = tempfile::tempdir().unwrap();
    let blocker = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let taken = blocker.local_addr().unwrap().port();

    let config = Config {
        base_port: taken,
        ..test_config(dir.path(), 1, 10)
    };
    let store = Arc::new(DiskStore::new(dir.path(), Arc::new(Catalog::new())));
    let result = Pipeline::new(config, store).start().await;

    match result {
        Err(Error::Bind { addr, .. }) => assert_eq!(addr.port(), taken),
        Err(e) => panic!("expected bind error, got {e}"),
        Ok(_) => panic!("expected bind error, pipeline started"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn idle_shutdown_is_prompt_and_releases_ports() {
    let h = start(3, 5, Duration::ZERO).await;
    let addrs: Vec<SocketAddr> = h.handle.listen_addrs().iter().map(|(_, a)| *a).collect();

    tokio::time::timeout(Duration::from_secs(1), h.handle.stop())
        .await
        .expect("idle workers should exit within a poll interval")
        .unwrap();

    for addr in addrs {
        tokio::net::TcpListener::bind(addr)
            .await
            .expect("port should be free after shutdown");
    }
}
