use std::time::Duration;

use async_trait::async_trait;

/// Counter state right after one hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowState {
    /// Hits in the current window, including this one.
    pub count: u64,
    pub allowed: bool,
    /// Time until the window resets.
    pub ttl: Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("counter store unavailable: {0}")]
    Unavailable(String),

    #[error("counter store command failed: {0}")]
    Command(String),
}

/// Shared counter store holding one window per key.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically count one hit against `key`.
    ///
    /// The first hit of a window sets its expiry to `window`; the hit is
    /// allowed while the count stays at or below `limit`.
    async fn hit(&self, key: &str, limit: u64, window: Duration) -> Result<WindowState, StoreError>;
}
