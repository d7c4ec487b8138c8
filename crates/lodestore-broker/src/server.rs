//! TCP front end of the broker.
//!
//! The accept loop hands each connection to its own task.  A connection runs
//! a reader that decodes [`Request`] frames and spawns one task per request,
//! plus a writer that serializes [`Response`]s in completion order.  Slow
//! requests therefore never block fast ones on the same socket.
//!
//! Shutdown is signalled through a `watch` channel: the listener stops
//! accepting, readers stop reading, and in-flight requests are allowed to
//! finish and flush their replies before the connection closes.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::engine::Engine;
use crate::error::BrokerResult;
use crate::protocol::{Command, Payload, Request, Response, WireError, read_frame, write_frame};

/// Queue depth between request tasks and a connection's writer.
const REPLY_QUEUE: usize = 256;

/// A bound, not yet serving, broker listener.
pub struct BrokerServer {
    engine: Arc<dyn Engine>,
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl BrokerServer {
    /// Bind the listener.  Fails if the address is unavailable.
    pub async fn bind(addr: SocketAddr, engine: Arc<dyn Engine>) -> BrokerResult<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        tracing::debug!(%local_addr, "broker listener bound");
        Ok(Self {
            engine,
            listener,
            local_addr,
        })
    }

    /// Address actually bound (resolves port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept connections until `shutdown` flips to `true`, then wait for
    /// every open connection to drain.
    pub async fn serve(self, mut shutdown: watch::Receiver<bool>) {
        let mut connections = JoinSet::new();
        tracing::info!(addr = %self.local_addr, "broker accepting connections");

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let engine = Arc::clone(&self.engine);
                        let shutdown = shutdown.clone();
                        connections.spawn(handle_connection(stream, peer, engine, shutdown));
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                // Reap finished connections so the set does not grow unbounded.
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }

        drop(self.listener);
        let open = connections.len();
        if open > 0 {
            tracing::debug!(open, "draining broker connections");
        }
        while connections.join_next().await.is_some() {}
        tracing::info!(addr = %self.local_addr, "broker listener stopped");
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    engine: Arc<dyn Engine>,
    mut shutdown: watch::Receiver<bool>,
) {
    let conn_id = Uuid::now_v7();
    let _ = stream.set_nodelay(true);
    tracing::debug!(%conn_id, %peer, "broker connection opened");

    let (mut reader, writer) = stream.into_split();
    let (reply_tx, reply_rx) = mpsc::channel::<Response>(REPLY_QUEUE);
    let writer_task = tokio::spawn(write_replies(writer, reply_rx, conn_id));

    loop {
        let frame = tokio::select! {
            frame = read_frame::<_, Request>(&mut reader) => frame,
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        };

        match frame {
            Ok(Some(request)) => {
                let engine = Arc::clone(&engine);
                let reply_tx = reply_tx.clone();
                tokio::spawn(async move {
                    let id = request.id;
                    let result = dispatch(engine.as_ref(), request.command)
                        .await
                        .map_err(|e| WireError::from(&e));
                    // The writer only disappears once the socket is gone.
                    let _ = reply_tx.send(Response { id, result }).await;
                });
            }
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(%conn_id, error = %e, "broker connection read failed");
                break;
            }
        }
    }

    // In-flight request tasks hold clones of the sender; the writer exits
    // once they have all replied.
    drop(reply_tx);
    if let Err(e) = writer_task.await {
        tracing::warn!(%conn_id, error = %e, "broker reply writer panicked");
    }
    tracing::debug!(%conn_id, %peer, "broker connection closed");
}

async fn write_replies(
    mut writer: OwnedWriteHalf,
    mut replies: mpsc::Receiver<Response>,
    conn_id: Uuid,
) {
    while let Some(response) = replies.recv().await {
        if let Err(e) = write_frame(&mut writer, &response).await {
            tracing::debug!(%conn_id, error = %e, "broker reply write failed");
            // Keep draining so request tasks never block on a full queue.
            while replies.recv().await.is_some() {}
            return;
        }
    }
}

/// Execute one command against the engine.
pub(crate) async fn dispatch(engine: &dyn Engine, command: Command) -> BrokerResult<Payload> {
    tracing::trace!(?command, "dispatching broker command");
    match command {
        Command::Ping => Ok(Payload::Pong),
        Command::CreateBucket { config } => engine.create_bucket(&config).await.map(Payload::Bucket),
        Command::BucketStatus { bucket } => {
            engine.bucket_status(&bucket).await.map(Payload::Bucket)
        }
        Command::DeleteBucket { bucket } => {
            engine.delete_bucket(&bucket).await.map(|()| Payload::Done)
        }
        Command::Get { bucket, key } => engine.get(&bucket, &key).await.map(Payload::Entry),
        Command::Write {
            bucket,
            key,
            value,
            mode,
        } => engine
            .write(&bucket, &key, &value, mode)
            .await
            .map(Payload::Revision),
        Command::Remove { bucket, key, purge } => engine
            .remove(&bucket, &key, purge)
            .await
            .map(Payload::Revision),
        Command::Keys { bucket } => engine.keys(&bucket).await.map(Payload::Keys),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
