//! Integration tests for the lodestore-web crate.
//!
//! These tests start the HTTP server on an ephemeral port, backed by an
//! in-memory broker bucket and an in-memory system of record, and drive it
//! with a real HTTP client.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use lodestore_broker::{BucketConfig, KvConnection, LocalConnection, MemoryEngine};
use lodestore_store::{CachedItemStore, Database, SqliteItemRepository};
use lodestore_web::{AppState, HttpHandle, HttpServer, WebConfig};
use serde_json::{Value, json};

async fn start() -> (HttpHandle, Arc<AppState>, String) {
    let db = Database::open_in_memory().unwrap();
    db.run_migrations().await.unwrap();
    let kv = LocalConnection::new(Arc::new(MemoryEngine::new()))
        .create_key_value(BucketConfig::new("cache"))
        .await
        .unwrap();
    let items = CachedItemStore::new(Arc::new(SqliteItemRepository::new(db)), kv);
    let state = Arc::new(AppState::new(items));

    let config = WebConfig {
        bind_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
        port: 0,
        ..WebConfig::default()
    };
    let server = HttpServer::bind(&config, Arc::clone(&state)).await.unwrap();
    let base = format!("http://{}", server.local_addr());
    (server.start(), state, base)
}

#[test]
fn web_config_defaults() {
    let config = WebConfig::default();
    assert_eq!(config.bind_addr, IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    assert_eq!(config.port, 8080);
    assert_eq!(config.request_timeout, Duration::from_secs(10));
}

#[tokio::test]
async fn healthz_reports_readiness() {
    let (handle, state, base) = start().await;
    let client = reqwest::Client::new();

    let resp = client.get(format!("{base}/healthz")).send().await.unwrap();
    assert_eq!(resp.status(), 503);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["ready"], false);

    state.set_ready(true);
    let resp = client.get(format!("{base}/healthz")).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["ready"], true);
    assert_eq!(body["cache"]["hits"], 0);

    handle.shutdown(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn item_lifecycle_over_http() {
    let (handle, _state, base) = start().await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{base}/items"))
        .json(&json!({ "name": "Widget" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
    let created: Value = resp.json().await.unwrap();
    assert_eq!(created, json!({ "id": "1", "name": "Widget" }));

    let fetched: Value = client
        .get(format!("{base}/items/1"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(fetched["name"], "Widget");

    let resp = client
        .put(format!("{base}/items/1"))
        .json(&json!({ "name": "Widget2" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let fetched: Value = client
        .get(format!("{base}/items/1"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(fetched["name"], "Widget2");

    handle.shutdown(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn errors_map_to_status_codes() {
    let (handle, _state, base) = start().await;
    let client = reqwest::Client::new();

    let missing = client.get(format!("{base}/items/77")).send().await.unwrap();
    assert_eq!(missing.status(), 404);
    let body: Value = missing.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("not found"));

    let blank = client
        .post(format!("{base}/items"))
        .json(&json!({ "name": "" }))
        .send()
        .await
        .unwrap();
    assert_eq!(blank.status(), 400);

    let ghost = client
        .put(format!("{base}/items/77"))
        .json(&json!({ "name": "x" }))
        .send()
        .await
        .unwrap();
    assert_eq!(ghost.status(), 404);

    handle.shutdown(Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn ids_outside_key_alphabet_are_not_found() {
    let (handle, _state, base) = start().await;
    let client = reqwest::Client::new();

    for id in ["x~y", "a%20b"] {
        let resp = client.get(format!("{base}/items/{id}")).send().await.unwrap();
        assert_eq!(resp.status(), 404, "GET /items/{id}");

        let resp = client
            .put(format!("{base}/items/{id}"))
            .json(&json!({ "name": "x" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 404, "PUT /items/{id}");
    }

    handle.shutdown(Duration::from_secs(5)).await.unwrap();
}
