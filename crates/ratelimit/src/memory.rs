//! Process-local counter store for tests and single-instance runs.

use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard},
    time::Duration,
};

use {async_trait::async_trait, tokio::time::Instant};

use crate::store::{CounterStore, StoreError, WindowState};

/// Expired windows are swept once the table grows past this size.
const SWEEP_THRESHOLD: usize = 10_000;

struct Window {
    count: u64,
    expires_at: Instant,
}

#[derive(Default)]
pub struct MemoryCounterStore {
    windows: Mutex<HashMap<String, Window>>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Window>> {
        self.windows
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn hit(&self, key: &str, limit: u64, window: Duration) -> Result<WindowState, StoreError> {
        let now = Instant::now();
        let mut windows = self.lock();
        if windows.len() > SWEEP_THRESHOLD {
            windows.retain(|_, w| w.expires_at > now);
        }

        let entry = windows.entry(key.to_string()).or_insert(Window {
            count: 0,
            expires_at: now + window,
        });
        if entry.expires_at <= now {
            entry.count = 0;
            entry.expires_at = now + window;
        }
        entry.count += 1;

        Ok(WindowState {
            count: entry.count,
            allowed: entry.count <= limit,
            ttl: ceil_secs(entry.expires_at - now),
        })
    }
}

/// Whole seconds, rounded up, matching what Redis TTL reports right after EXPIRE.
fn ceil_secs(d: Duration) -> Duration {
    let secs = d.as_secs() + u64::from(d.subsec_nanos() > 0);
    Duration::from_secs(secs)
}
