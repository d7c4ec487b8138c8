//! HTTP server setup, startup, and graceful shutdown.
//!
//! [`HttpServer`] composes the Axum router and binds the listener.
//! [`HttpServer::start`] runs the serve loop on a background task and returns
//! an [`HttpHandle`], which reports a fatal serve error and performs the
//! graceful stop.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::routing::{get, post};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::WebConfig;
use crate::api;
use crate::error::{WebError, WebResult};
use crate::state::AppState;

/// A bound HTTP listener with its routes.
pub struct HttpServer {
    listener: TcpListener,
    router: Router,
    addr: SocketAddr,
}

impl HttpServer {
    /// Bind the listener described by `config`.
    pub async fn bind(config: &WebConfig, state: Arc<AppState>) -> WebResult<Self> {
        let requested = config.socket_addr();
        let listener = TcpListener::bind(requested)
            .await
            .map_err(|source| WebError::Bind {
                addr: requested.to_string(),
                source,
            })?;
        let addr = listener.local_addr()?;

        Ok(Self {
            listener,
            router: router(state, config.request_timeout),
            addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Serve on a background task.
    pub fn start(self) -> HttpHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let addr = self.addr;
        tracing::info!(%addr, "http server listening");

        let task = tokio::spawn(async move {
            axum::serve(self.listener, self.router)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.wait_for(|stop| *stop).await;
                })
                .await
        });

        HttpHandle {
            addr,
            shutdown: shutdown_tx,
            task: Some(task),
        }
    }
}

/// Build the Axum router with all routes registered.
pub fn router(state: Arc<AppState>, request_timeout: Duration) -> Router {
    Router::new()
        .route("/healthz", get(api::healthz))
        .route("/items", post(api::create_item))
        .route("/items/{id}", get(api::get_item).put(api::update_item))
        .layer(TimeoutLayer::new(request_timeout))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Running HTTP server.
pub struct HttpHandle {
    addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<std::io::Result<()>>>,
}

impl HttpHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Resolves only if the serve loop ends without being asked to, i.e.
    /// on a fatal error.  Cancel-safe.
    pub async fn failed(&mut self) -> WebError {
        let Some(task) = self.task.as_mut() else {
            return std::future::pending().await;
        };
        let outcome = task.await;
        self.task = None;
        match outcome {
            Ok(Ok(())) => WebError::Serve(std::io::Error::other("http server exited unexpectedly")),
            Ok(Err(e)) => WebError::Serve(e),
            Err(e) => e.into(),
        }
    }

    /// Stop accepting connections and wait for in-flight requests, bounded
    /// by `deadline`.  Connections still open at the deadline are dropped.
    pub async fn shutdown(mut self, deadline: Duration) -> WebResult<()> {
        self.shutdown.send_replace(true);
        let Some(mut task) = self.task.take() else {
            return Ok(());
        };
        tracing::info!(addr = %self.addr, ?deadline, "stopping http server");

        match tokio::time::timeout(deadline, &mut task).await {
            Ok(joined) => {
                joined??;
                tracing::info!("http server stopped");
                Ok(())
            }
            Err(_) => {
                task.abort();
                Err(WebError::ShutdownTimeout { deadline })
            }
        }
    }
}
