//! TCP client for the broker.
//!
//! One [`BrokerClient`] owns one socket.  Requests are tagged with a
//! monotonically increasing id and parked in a pending map; a reader task
//! routes each reply to its waiter, so any number of tasks can share the
//! client concurrently.  The client is cheaply cloneable.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::error::{BrokerError, BrokerResult};
use crate::kv::{
    BucketConfig, BucketStatus, KeyValue, KvConnection, KvEntry, WriteMode, validate_bucket,
    validate_key, validate_value,
};
use crate::protocol::{
    Command, Payload, Request, Response, WireError, encode_frame, read_frame, write_encoded,
};

/// How long a request waits for its reply before giving up.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

const OUTBOUND_QUEUE: usize = 256;

type Reply = Result<Payload, WireError>;

/// Multiplexed connection to a broker.
#[derive(Clone)]
pub struct BrokerClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    addr: SocketAddr,
    next_id: AtomicU64,
    pending: DashMap<u64, oneshot::Sender<Reply>>,
    outbound: mpsc::Sender<Request>,
    closed: AtomicBool,
    shutdown: watch::Sender<bool>,
    request_timeout: Duration,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl BrokerClient {
    /// Connect with [`DEFAULT_REQUEST_TIMEOUT`].
    pub async fn connect(addr: SocketAddr) -> BrokerResult<Self> {
        Self::connect_with_timeout(addr, DEFAULT_REQUEST_TIMEOUT).await
    }

    /// Connect to the broker at `addr`.  The same timeout bounds the TCP
    /// handshake and every later request.
    pub async fn connect_with_timeout(
        addr: SocketAddr,
        request_timeout: Duration,
    ) -> BrokerResult<Self> {
        let stream = match tokio::time::timeout(request_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                return Err(BrokerError::Connection {
                    addr: addr.to_string(),
                    source,
                });
            }
            Err(_) => {
                return Err(BrokerError::Connection {
                    addr: addr.to_string(),
                    source: std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "connect timed out",
                    ),
                });
            }
        };
        let _ = stream.set_nodelay(true);
        let (reader, writer) = stream.into_split();

        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let inner = Arc::new(ClientInner {
            addr,
            next_id: AtomicU64::new(1),
            pending: DashMap::new(),
            outbound: outbound_tx,
            closed: AtomicBool::new(false),
            shutdown: shutdown_tx,
            request_timeout,
            tasks: Mutex::new(Vec::with_capacity(2)),
        });

        let writer_task = tokio::spawn(write_loop(
            writer,
            outbound_rx,
            Arc::clone(&inner),
            shutdown_rx.clone(),
        ));
        let reader_task = tokio::spawn(read_loop(reader, Arc::clone(&inner), shutdown_rx));
        if let Ok(mut tasks) = inner.tasks.lock() {
            tasks.push(writer_task);
            tasks.push(reader_task);
        }

        tracing::debug!(%addr, "connected to broker");
        Ok(Self { inner })
    }

    /// Address this client is connected to.
    pub fn addr(&self) -> SocketAddr {
        self.inner.addr
    }

    /// Round-trip a no-op request.
    pub async fn ping(&self) -> BrokerResult<()> {
        match self.request(Command::Ping).await? {
            Payload::Pong => Ok(()),
            other => Err(unexpected("ping", &other)),
        }
    }

    async fn request(&self, command: Command) -> BrokerResult<Payload> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::Acquire) {
            return Err(BrokerError::ConnectionClosed);
        }

        let id = inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        inner.pending.insert(id, tx);

        if inner.outbound.send(Request { id, command }).await.is_err() {
            inner.pending.remove(&id);
            return Err(BrokerError::ConnectionClosed);
        }

        match tokio::time::timeout(inner.request_timeout, rx).await {
            Ok(Ok(reply)) => reply.map_err(BrokerError::from),
            Ok(Err(_)) => Err(BrokerError::ConnectionClosed),
            Err(_) => {
                inner.pending.remove(&id);
                Err(BrokerError::RequestTimeout(inner.request_timeout))
            }
        }
    }

    fn bucket_handle(&self, bucket: String) -> Arc<dyn KeyValue> {
        Arc::new(RemoteBucket {
            client: self.clone(),
            bucket,
        })
    }
}

#[async_trait]
impl KvConnection for BrokerClient {
    async fn create_key_value(&self, config: BucketConfig) -> BrokerResult<Arc<dyn KeyValue>> {
        validate_bucket(&config.name)?;
        match self.request(Command::CreateBucket { config }).await? {
            Payload::Bucket(status) => Ok(self.bucket_handle(status.name)),
            other => Err(unexpected("create_bucket", &other)),
        }
    }

    async fn key_value(&self, bucket: &str) -> BrokerResult<Arc<dyn KeyValue>> {
        validate_bucket(bucket)?;
        let command = Command::BucketStatus {
            bucket: bucket.to_owned(),
        };
        match self.request(command).await? {
            Payload::Bucket(status) => Ok(self.bucket_handle(status.name)),
            other => Err(unexpected("bucket_status", &other)),
        }
    }

    async fn delete_key_value(&self, bucket: &str) -> BrokerResult<()> {
        let command = Command::DeleteBucket {
            bucket: bucket.to_owned(),
        };
        match self.request(command).await? {
            Payload::Done => Ok(()),
            other => Err(unexpected("delete_bucket", &other)),
        }
    }

    async fn close(&self) {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        inner.shutdown.send_replace(true);
        // Waiters see their sender dropped and report ConnectionClosed.
        inner.pending.clear();

        let tasks = match inner.tasks.lock() {
            Ok(mut tasks) => std::mem::take(&mut *tasks),
            Err(_) => Vec::new(),
        };
        for task in tasks {
            let _ = task.await;
        }
        tracing::debug!(addr = %inner.addr, "broker client closed");
    }

    fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

/// A request that cannot be encoded fails alone; only a socket error ends
/// the loop and closes the client.
async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::Receiver<Request>,
    inner: Arc<ClientInner>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            request = outbound.recv() => {
                let Some(request) = request else { break };
                let body = match encode_frame(&request) {
                    Ok(body) => body,
                    Err(e) => {
                        tracing::debug!(
                            id = request.id,
                            error = %e,
                            "broker request not encodable"
                        );
                        if let Some((_, waiter)) = inner.pending.remove(&request.id) {
                            let _ = waiter.send(Err(WireError::from(&e)));
                        }
                        continue;
                    }
                };
                if let Err(e) = write_encoded(&mut writer, &body).await {
                    tracing::warn!(addr = %inner.addr, error = %e, "broker request write failed");
                    inner.closed.store(true, Ordering::Release);
                    inner.pending.clear();
                    break;
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

async fn read_loop(
    mut reader: OwnedReadHalf,
    inner: Arc<ClientInner>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let frame = tokio::select! {
            frame = read_frame::<_, Response>(&mut reader) => frame,
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        };

        match frame {
            Ok(Some(response)) => match inner.pending.remove(&response.id) {
                Some((_, waiter)) => {
                    let _ = waiter.send(response.result);
                }
                None => tracing::trace!(id = response.id, "reply for abandoned request"),
            },
            Ok(None) => {
                tracing::debug!(addr = %inner.addr, "broker closed the connection");
                break;
            }
            Err(e) => {
                tracing::warn!(addr = %inner.addr, error = %e, "broker connection read failed");
                break;
            }
        }
    }

    inner.closed.store(true, Ordering::Release);
    inner.pending.clear();
}

fn unexpected(op: &str, payload: &Payload) -> BrokerError {
    BrokerError::Protocol(format!("unexpected reply to {op}: {payload:?}"))
}

// ---------------------------------------------------------------------------
// Remote bucket
// ---------------------------------------------------------------------------

/// [`KeyValue`] handle that forwards every call to the broker.
struct RemoteBucket {
    client: BrokerClient,
    bucket: String,
}

impl RemoteBucket {
    async fn revision(&self, op: &str, command: Command) -> BrokerResult<u64> {
        match self.client.request(command).await? {
            Payload::Revision(revision) => Ok(revision),
            other => Err(unexpected(op, &other)),
        }
    }

    async fn write(&self, key: &str, value: &[u8], mode: WriteMode) -> BrokerResult<u64> {
        validate_key(key)?;
        validate_value(key, value)?;
        let command = Command::Write {
            bucket: self.bucket.clone(),
            key: key.to_owned(),
            value: value.to_vec(),
            mode,
        };
        self.revision("write", command).await
    }

    async fn remove(&self, key: &str, purge: bool) -> BrokerResult<()> {
        validate_key(key)?;
        let command = Command::Remove {
            bucket: self.bucket.clone(),
            key: key.to_owned(),
            purge,
        };
        self.revision("remove", command).await.map(|_| ())
    }
}

#[async_trait]
impl KeyValue for RemoteBucket {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn get(&self, key: &str) -> BrokerResult<KvEntry> {
        validate_key(key)?;
        let command = Command::Get {
            bucket: self.bucket.clone(),
            key: key.to_owned(),
        };
        match self.client.request(command).await? {
            Payload::Entry(entry) => Ok(entry),
            other => Err(unexpected("get", &other)),
        }
    }

    async fn put(&self, key: &str, value: &[u8]) -> BrokerResult<u64> {
        self.write(key, value, WriteMode::Put).await
    }

    async fn create(&self, key: &str, value: &[u8]) -> BrokerResult<u64> {
        self.write(key, value, WriteMode::Create).await
    }

    async fn update(&self, key: &str, value: &[u8], revision: u64) -> BrokerResult<u64> {
        self.write(key, value, WriteMode::Update { revision }).await
    }

    async fn delete(&self, key: &str) -> BrokerResult<()> {
        self.remove(key, false).await
    }

    async fn purge(&self, key: &str) -> BrokerResult<()> {
        self.remove(key, true).await
    }

    async fn keys(&self) -> BrokerResult<Vec<String>> {
        let command = Command::Keys {
            bucket: self.bucket.clone(),
        };
        match self.client.request(command).await? {
            Payload::Keys(keys) => Ok(keys),
            other => Err(unexpected("keys", &other)),
        }
    }

    async fn status(&self) -> BrokerResult<BucketStatus> {
        let command = Command::BucketStatus {
            bucket: self.bucket.clone(),
        };
        match self.client.request(command).await? {
            Payload::Bucket(status) => Ok(status),
            other => Err(unexpected("bucket_status", &other)),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Engine, MemoryEngine};
    use crate::server::BrokerServer;

    async fn serve_memory() -> (SocketAddr, watch::Sender<bool>) {
        let engine: Arc<dyn Engine> = Arc::new(MemoryEngine::new());
        let server = BrokerServer::bind("127.0.0.1:0".parse().unwrap(), engine)
            .await
            .unwrap();
        let addr = server.local_addr();
        let (tx, rx) = watch::channel(false);
        tokio::spawn(server.serve(rx));
        (addr, tx)
    }

    #[tokio::test]
    async fn connect_to_closed_port_fails() {
        // Bind then drop to obtain a port nobody listens on.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = BrokerClient::connect(addr).await.err().unwrap();
        assert!(matches!(err, BrokerError::Connection { .. }));
    }

    #[tokio::test]
    async fn requests_round_trip_over_tcp() {
        let (addr, _shutdown) = serve_memory().await;
        let client = BrokerClient::connect(addr).await.unwrap();
        client.ping().await.unwrap();

        let kv = client
            .create_key_value(BucketConfig::new("sessions"))
            .await
            .unwrap();
        let rev = kv.create("scsabc", b"blob").await.unwrap();
        assert!(rev > 0);

        let entry = kv.get("scsabc").await.unwrap();
        assert_eq!(entry.value(), b"blob");
        assert_eq!(entry.revision, rev);

        assert!(matches!(
            kv.create("scsabc", b"other").await,
            Err(BrokerError::KeyExists { .. })
        ));

        kv.purge("scsabc").await.unwrap();
        assert!(matches!(
            kv.get("scsabc").await,
            Err(BrokerError::KeyDeleted { .. })
        ));
        assert!(matches!(
            kv.get("never").await,
            Err(BrokerError::KeyNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn invalid_key_is_rejected_locally() {
        let (addr, _shutdown) = serve_memory().await;
        let client = BrokerClient::connect(addr).await.unwrap();
        let kv = client
            .create_key_value(BucketConfig::new("cache"))
            .await
            .unwrap();
        assert!(matches!(
            kv.put("bad key", b"v").await,
            Err(BrokerError::InvalidKey { .. })
        ));
    }

    #[tokio::test]
    async fn oversized_value_fails_alone() {
        let (addr, _shutdown) = serve_memory().await;
        let client = BrokerClient::connect(addr).await.unwrap();
        let kv = client
            .create_key_value(BucketConfig::new("sessions"))
            .await
            .unwrap();

        let big = vec![7u8; 7 * 1024 * 1024];
        assert!(matches!(
            kv.put("big", &big).await,
            Err(BrokerError::ValueTooLarge { .. })
        ));
        kv.put("small", b"ok").await.unwrap();
        assert_eq!(kv.get("small").await.unwrap().value(), b"ok");
        assert!(!client.is_closed());
    }

    #[tokio::test]
    async fn unencodable_request_does_not_stall_the_writer() {
        let (addr, _shutdown) = serve_memory().await;
        let client = BrokerClient::connect(addr).await.unwrap();

        // A bucket name long enough to push the frame past the limit slips
        // past local validation and must fail on its own.
        let config = BucketConfig::new("b".repeat(crate::protocol::MAX_FRAME_LEN));
        let err = client.request(Command::CreateBucket { config }).await.unwrap_err();
        assert!(matches!(err, BrokerError::Remote(_)));

        client.ping().await.unwrap();
        assert!(!client.is_closed());
    }

    #[tokio::test]
    async fn closed_client_rejects_requests() {
        let (addr, _shutdown) = serve_memory().await;
        let client = BrokerClient::connect(addr).await.unwrap();
        let kv = client
            .create_key_value(BucketConfig::new("cache"))
            .await
            .unwrap();

        client.close().await;
        assert!(client.is_closed());
        assert!(matches!(
            kv.get("1").await,
            Err(BrokerError::ConnectionClosed)
        ));
        // Idempotent.
        client.close().await;
    }

    #[tokio::test]
    async fn broker_shutdown_closes_client() {
        let (addr, shutdown) = serve_memory().await;
        let client = BrokerClient::connect(addr).await.unwrap();
        client.ping().await.unwrap();

        shutdown.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            while !client.is_closed() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("client should observe the broker going away");
    }
}
