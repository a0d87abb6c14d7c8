/// Config schema types (socket, broker, redis, rate limiting, metrics).
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PotatConfig {
    pub socket: SocketConfig,
    pub broker: BrokerConfig,
    pub redis: RedisConfig,
    pub rate_limit: RateLimitConfig,
    pub metrics: MetricsConfig,
}

// ── Socket ───────────────────────────────────────────────────────────────────

/// Browser-facing HTTP + WebSocket listener.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SocketConfig {
    pub enabled: bool,
    pub bind: String,
    pub port: u16,
    /// Route the WebSocket upgrade is served on.
    pub path: String,
    /// Outbound frames buffered per client before it is dropped as slow.
    pub queue_capacity: usize,
    /// Maximum connection lifetime before the client is asked to reconnect.
    pub ttl_secs: u64,
    /// How long to wait for a pong before the connection is considered dead.
    pub pong_wait_secs: u64,
    /// Deadline for a single frame write.
    pub write_wait_secs: u64,
    /// Pause between the reconnect notice and the close.
    pub reconnect_grace_ms: u64,
    pub max_message_size: usize,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: "127.0.0.1".into(),
            port: 3001,
            path: "/".into(),
            queue_capacity: 1024,
            ttl_secs: 60 * 60,
            pong_wait_secs: 60,
            write_wait_secs: 10,
            reconnect_grace_ms: 2000,
            max_message_size: 512,
        }
    }
}

impl SocketConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn pong_wait(&self) -> Duration {
        Duration::from_secs(self.pong_wait_secs)
    }

    /// Pings go out at 90% of the pong deadline so a healthy peer always
    /// answers in time.
    pub fn ping_period(&self) -> Duration {
        self.pong_wait() * 9 / 10
    }

    pub fn write_wait(&self) -> Duration {
        Duration::from_secs(self.write_wait_secs)
    }

    pub fn reconnect_grace(&self) -> Duration {
        Duration::from_millis(self.reconnect_grace_ms)
    }
}

// ── Broker ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusBackend {
    #[default]
    Nats,
    /// In-process bus, for local development without a NATS server.
    Memory,
}

/// Message bus connection and subject layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub enabled: bool,
    pub backend: BusBackend,
    pub url: String,
    /// Prefix of subjects published by the peer service.
    pub inbound_prefix: String,
    /// Prefix of subjects this relay publishes.
    pub outbound_prefix: String,
    pub reconnect_delay_secs: u64,
    pub request_timeout_secs: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            backend: BusBackend::Nats,
            url: "nats://127.0.0.1:4222".into(),
            inbound_prefix: "potatbotat".into(),
            outbound_prefix: "potat-api".into(),
            reconnect_delay_secs: 5,
            request_timeout_secs: 5,
        }
    }
}

impl BrokerConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

// ── Redis ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub url: String,
    pub pool_size: u32,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".into(),
            pool_size: 16,
        }
    }
}

// ── Rate limiting ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Redis,
    Memory,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub store: StoreBackend,
    /// Requests allowed per window and caller.
    pub limit: u64,
    pub window_secs: u64,
    pub key_prefix: String,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            store: StoreBackend::Redis,
            limit: 100,
            window_secs: 60,
            key_prefix: "ratelimit".into(),
        }
    }
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

// ── Metrics ──────────────────────────────────────────────────────────────────

/// Prometheus scrape endpoint, served on its own listener.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub bind: String,
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind: "127.0.0.1".into(),
            port: 9090,
        }
    }
}
