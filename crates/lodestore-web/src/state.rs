//! Shared application state for the HTTP handlers.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use lodestore_store::CachedItemStore;

/// Shared state accessible from every Axum handler.
#[derive(Clone)]
pub struct AppState {
    /// Cache-aside item store behind the item API.
    pub items: CachedItemStore,

    /// Flipped to `true` once startup has completed; `/healthz` reports it.
    ready: Arc<AtomicBool>,
}

impl AppState {
    pub fn new(items: CachedItemStore) -> Self {
        Self {
            items,
            ready: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Release);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }
}
