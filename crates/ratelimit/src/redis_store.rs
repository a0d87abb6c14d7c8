//! Redis counter store. One Lua script per hit keeps INCR, EXPIRE and TTL
//! atomic across every process sharing the server.

use std::time::Duration;

use {
    async_trait::async_trait,
    bb8_redis::{RedisConnectionManager, bb8},
    tracing::debug,
};

use crate::store::{CounterStore, StoreError, WindowState};

/// KEYS[1] = window key, ARGV[1] = window seconds, ARGV[2] = limit.
/// Returns `{count, allowed (0|1), ttl}`.
const HIT_SCRIPT: &str = r"
local current = redis.call('INCR', KEYS[1])
if current == 1 then
  redis.call('EXPIRE', KEYS[1], ARGV[1])
end
local ttl = redis.call('TTL', KEYS[1])
if ttl < 0 then
  redis.call('EXPIRE', KEYS[1], ARGV[1])
  ttl = tonumber(ARGV[1])
end
local allowed = 0
if current <= tonumber(ARGV[2]) then
  allowed = 1
end
return {current, allowed, ttl}
";

pub struct RedisCounterStore {
    pool: bb8::Pool<RedisConnectionManager>,
    script: redis::Script,
}

impl RedisCounterStore {
    /// Build a connection pool. Fails if Redis cannot be reached.
    pub async fn connect(url: &str, pool_size: u32) -> Result<Self, StoreError> {
        let manager = RedisConnectionManager::new(url)
            .map_err(|e| StoreError::Unavailable(format!("invalid redis url {url}: {e}")))?;
        let pool = bb8::Pool::builder()
            .max_size(pool_size)
            .build(manager)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let store = Self::from_pool(pool);
        store.ping().await?;
        debug!(url, pool_size, "redis counter store ready");
        Ok(store)
    }

    pub fn from_pool(pool: bb8::Pool<RedisConnectionManager>) -> Self {
        Self {
            pool,
            script: redis::Script::new(HIT_SCRIPT),
        }
    }

    pub async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let _: String = redis::cmd("PING")
            .query_async(&mut *conn)
            .await
            .map_err(|e| StoreError::Command(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn hit(&self, key: &str, limit: u64, window: Duration) -> Result<WindowState, StoreError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let (count, allowed, ttl): (i64, i64, i64) = self
            .script
            .key(key)
            .arg(window.as_secs().max(1))
            .arg(limit)
            .invoke_async(&mut *conn)
            .await
            .map_err(|e| StoreError::Command(e.to_string()))?;

        Ok(window_state(count, allowed, ttl))
    }
}

/// Decode the script reply. Negative counts or TTLs collapse to zero.
fn window_state(count: i64, allowed: i64, ttl: i64) -> WindowState {
    WindowState {
        count: u64::try_from(count).unwrap_or(0),
        allowed: allowed == 1,
        ttl: Duration::from_secs(u64::try_from(ttl).unwrap_or(0)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_script_loads_with_a_sha1_digest() {
        let script = redis::Script::new(HIT_SCRIPT);
        let hash = script.get_hash();
        assert_eq!(hash.len(), 40);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn hit_script_counts_sets_expiry_and_compares_against_limit() {
        assert!(HIT_SCRIPT.contains("redis.call('INCR', KEYS[1])"));
        assert!(HIT_SCRIPT.contains("redis.call('EXPIRE', KEYS[1], ARGV[1])"));
        assert!(HIT_SCRIPT.contains("redis.call('TTL', KEYS[1])"));
        assert!(HIT_SCRIPT.contains("current <= tonumber(ARGV[2])"));
    }

    #[test]
    fn script_reply_decodes_into_window_state() {
        assert_eq!(window_state(3, 1, 57), WindowState {
            count: 3,
            allowed: true,
            ttl: Duration::from_secs(57),
        });
        assert_eq!(window_state(61, 0, 2), WindowState {
            count: 61,
            allowed: false,
            ttl: Duration::from_secs(2),
        });
    }

    #[test]
    fn negative_reply_values_clamp_to_zero() {
        assert_eq!(window_state(-1, 0, -2), WindowState {
            count: 0,
            allowed: false,
            ttl: Duration::ZERO,
        });
    }
}
