//! HTTP interface for Lodestore.
//!
//! This crate provides the HTTP listener the service exposes:
//!
//! - `GET /healthz` readiness check, `true` once startup has completed.
//! - A JSON item API (`POST /items`, `GET /items/{id}`, `PUT /items/{id}`)
//!   over the cache-aside item store.
//!
//! [`HttpServer`] binds the listener; [`HttpHandle`] stops it gracefully
//! within a deadline.

pub mod api;
pub mod error;
pub mod server;
pub mod state;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

pub use error::{ApiError, WebError, WebResult};
pub use server::{HttpHandle, HttpServer};
pub use state::AppState;

/// HTTP listener configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebConfig {
    /// The address to bind the HTTP server to.
    pub bind_addr: IpAddr,
    /// The port to listen on; `0` picks an ephemeral port.
    pub port: u16,
    /// Requests running longer than this are answered with 408.
    pub request_timeout: Duration,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 8080,
            request_timeout: Duration::from_secs(10),
        }
    }
}

impl WebConfig {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_addr, self.port)
    }
}
