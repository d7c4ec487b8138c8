//! Integration tests for the lodestore-broker crate.
//!
//! These tests run a real TCP broker on an ephemeral port and exercise the
//! lifecycle, the wire protocol, and the durable engine together.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use lodestore_broker::{
    BrokerError, BrokerOptions, BrokerState, BucketConfig, EmbeddedBroker, KvConnection,
    MemoryEngine, TcpBroker, start_embedded,
};

fn options(dir: &std::path::Path, port: u16) -> BrokerOptions {
    BrokerOptions {
        host: IpAddr::V4(Ipv4Addr::LOCALHOST),
        port,
        storage_dir: dir.to_path_buf(),
        ready_timeout: Duration::from_secs(2),
        sweep_interval: Duration::from_millis(50),
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Lifecycle
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn occupied_port_is_not_ready_within_bound() {
    let dir = tempfile::tempdir().unwrap();
    let squatter = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = squatter.local_addr().unwrap().port();

    let started = tokio::time::Instant::now();
    let err = start_embedded(options(dir.path(), port)).await.err().unwrap();
    assert!(matches!(err, BrokerError::NotReady { .. }), "got {err}");
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn locked_store_is_not_ready_within_bound() {
    let dir = tempfile::tempdir().unwrap();
    let holder = rusqlite::Connection::open(dir.path().join("kv.db")).unwrap();
    holder.execute_batch("BEGIN EXCLUSIVE;").unwrap();

    let mut opts = options(dir.path(), 0);
    opts.ready_timeout = Duration::from_millis(200);
    let started = tokio::time::Instant::now();
    let err = start_embedded(opts).await.err().unwrap();
    let BrokerError::NotReady { reason } = &err else {
        panic!("got {err}");
    };
    assert!(reason.contains("not open within"), "got {reason}");
    assert!(started.elapsed() < Duration::from_secs(2));

    holder.execute_batch("ROLLBACK;").unwrap();
}

#[tokio::test]
async fn state_changes_are_observable() {
    let dir = tempfile::tempdir().unwrap();
    let broker = TcpBroker::new(options(dir.path(), 0));
    let mut states = broker.subscribe();
    assert_eq!(*states.borrow(), BrokerState::NotStarted);

    broker.start().await.unwrap();
    states.changed().await.unwrap();
    assert_eq!(*states.borrow_and_update(), BrokerState::Ready);
    assert!(broker.client_addr().is_some());

    broker.shutdown(Duration::from_secs(5)).await.unwrap();
    assert_eq!(*states.borrow_and_update(), BrokerState::Stopped);
}

// ═══════════════════════════════════════════════════════════════════════
//  Key-value over TCP
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn concurrent_create_has_exactly_one_winner() {
    let dir = tempfile::tempdir().unwrap();
    let handle = start_embedded(options(dir.path(), 0)).await.unwrap();
    let kv = handle
        .client()
        .create_key_value(BucketConfig::new("cache"))
        .await
        .unwrap();

    let mut tasks = Vec::new();
    for i in 0..8u8 {
        let kv = Arc::clone(&kv);
        tasks.push(tokio::spawn(async move { kv.create("42", &[i]).await }));
    }
    let results = futures::future::join_all(tasks).await;

    let wins = results
        .iter()
        .filter(|r| matches!(r, Ok(Ok(_))))
        .count();
    let collisions = results
        .iter()
        .filter(|r| matches!(r, Ok(Err(BrokerError::KeyExists { .. }))))
        .count();
    assert_eq!(wins, 1);
    assert_eq!(collisions, 7);

    handle.shutdown(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn many_clients_share_one_broker() {
    let dir = tempfile::tempdir().unwrap();
    let handle = start_embedded(options(dir.path(), 0)).await.unwrap();
    handle
        .client()
        .create_key_value(BucketConfig::new("sessions"))
        .await
        .unwrap();

    let second = handle.broker().connect().await.unwrap();
    let kv_a = handle.client().key_value("sessions").await.unwrap();
    let kv_b = second.key_value("sessions").await.unwrap();

    kv_a.put("scstok-1", b"from-a").await.unwrap();
    assert_eq!(kv_b.get("scstok-1").await.unwrap().value(), b"from-a");

    second.close().await;
    handle.shutdown(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn supplied_engine_serves_deletes_over_the_wire() {
    let dir = tempfile::tempdir().unwrap();
    let broker = TcpBroker::with_engine(options(dir.path(), 0), Arc::new(MemoryEngine::new()));
    broker.start().await.unwrap();
    assert!(!dir.path().join("kv.db").exists());

    let client = broker.connect().await.unwrap();
    let kv = client
        .create_key_value(BucketConfig::new("scratch"))
        .await
        .unwrap();
    kv.put("k", b"v").await.unwrap();

    kv.delete("k").await.unwrap();
    assert!(matches!(
        kv.get("k").await,
        Err(BrokerError::KeyDeleted { .. })
    ));
    assert!(kv.keys().await.unwrap().is_empty());
    // A delete marker does not block create.
    kv.create("k", b"again").await.unwrap();

    client.delete_key_value("scratch").await.unwrap();
    assert!(matches!(
        client.key_value("scratch").await,
        Err(BrokerError::BucketNotFound { .. })
    ));

    client.close().await;
    broker.shutdown(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn missing_bucket_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let handle = start_embedded(options(dir.path(), 0)).await.unwrap();
    let err = handle.client().key_value("nope").await.err().unwrap();
    assert!(matches!(err, BrokerError::BucketNotFound { .. }));
    handle.shutdown(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn ttl_expires_entries_over_the_wire() {
    let dir = tempfile::tempdir().unwrap();
    let handle = start_embedded(options(dir.path(), 0)).await.unwrap();
    let kv = handle
        .client()
        .create_key_value(BucketConfig::new("short").with_ttl(Duration::from_millis(150)))
        .await
        .unwrap();

    kv.put("k", b"v").await.unwrap();
    assert!(kv.get("k").await.is_ok());

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(matches!(
        kv.get("k").await,
        Err(BrokerError::KeyNotFound { .. })
    ));
    // An expired key can be created again.
    kv.create("k", b"again").await.unwrap();

    handle.shutdown(Duration::from_secs(5)).await.unwrap();
}

// ═══════════════════════════════════════════════════════════════════════
//  Persistence
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn data_survives_restart_on_same_storage_dir() {
    let dir = tempfile::tempdir().unwrap();

    let first = start_embedded(options(dir.path(), 0)).await.unwrap();
    let kv = first
        .client()
        .create_key_value(
            BucketConfig::new("sessions")
                .with_ttl(Duration::from_secs(3600))
                .with_compression(true),
        )
        .await
        .unwrap();
    kv.put("scsabc", b"persisted blob").await.unwrap();
    first.shutdown(Duration::from_secs(5)).await.unwrap();

    let second = start_embedded(options(dir.path(), 0)).await.unwrap();
    let kv = second.client().key_value("sessions").await.unwrap();
    assert_eq!(kv.get("scsabc").await.unwrap().value(), b"persisted blob");

    let status = kv.status().await.unwrap();
    assert_eq!(status.ttl, Duration::from_secs(3600));
    assert!(status.compression);
    assert_eq!(status.values, 1);

    second.shutdown(Duration::from_secs(5)).await.unwrap();
}
