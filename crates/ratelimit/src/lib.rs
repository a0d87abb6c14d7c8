//! Fixed-window rate limiting.
//!
//! Each caller gets a counter per window in a shared [`CounterStore`]. The
//! increment, first-hit expiry and limit comparison happen in one atomic
//! store operation, so concurrent requests across processes never
//! over-admit. Store failures deny the request.

pub mod limiter;
pub mod memory;
pub mod redis_store;
pub mod store;

pub use {
    limiter::{RateLimitDecision, RateLimitError, RateLimitPolicy, RateLimiter},
    memory::MemoryCounterStore,
    redis_store::RedisCounterStore,
    store::{CounterStore, StoreError, WindowState},
};
