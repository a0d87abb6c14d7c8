//! In-process bus used by tests and by the `memory` backend for local runs.
//!
//! Supports NATS wildcard subscriptions plus two failure injections:
//! [`MemoryBus::disconnect_all`] ends every open subscription, and
//! [`MemoryBus::fail_next_connects`] makes the next N connect attempts fail.

use std::sync::{Arc, Mutex, MutexGuard};

use {
    async_trait::async_trait,
    bytes::Bytes,
    futures::StreamExt,
    tokio::sync::{broadcast, mpsc},
    tokio_stream::wrappers::UnboundedReceiverStream,
};

use crate::{
    bus::{BusConnection, BusConnector, BusMessage, Subscription, subject_matches},
    error::BrokerError,
};

#[derive(Clone)]
pub struct MemoryBus {
    inner: Arc<Mutex<Inner>>,
    tap: broadcast::Sender<BusMessage>,
}

#[derive(Default)]
struct Inner {
    generation: u64,
    failing_connects: usize,
    connects: usize,
    flushes: usize,
    subscribers: Vec<(String, mpsc::UnboundedSender<BusMessage>)>,
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBus {
    pub fn new() -> Self {
        let (tap, _) = broadcast::channel(1024);
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            tap,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Publish from outside any connection, as a peer service would.
    pub fn publish(&self, subject: &str, payload: impl Into<Bytes>) {
        self.deliver(BusMessage::new(subject, payload));
    }

    /// Observe every message published on the bus, from any source.
    /// Survives [`disconnect_all`](Self::disconnect_all).
    pub fn tap(&self) -> broadcast::Receiver<BusMessage> {
        self.tap.subscribe()
    }

    /// Drop every subscription and invalidate every open connection.
    pub fn disconnect_all(&self) {
        let mut inner = self.lock();
        inner.generation += 1;
        inner.subscribers.clear();
    }

    pub fn fail_next_connects(&self, n: usize) {
        self.lock().failing_connects = n;
    }

    /// Successful connects so far.
    pub fn connect_count(&self) -> usize {
        self.lock().connects
    }

    /// Connection flushes so far.
    pub fn flush_count(&self) -> usize {
        self.lock().flushes
    }

    fn deliver(&self, msg: BusMessage) {
        {
            let mut inner = self.lock();
            inner.subscribers.retain(|(pattern, tx)| {
                !subject_matches(pattern, &msg.subject) || tx.send(msg.clone()).is_ok()
            });
        }
        let _ = self.tap.send(msg);
    }
}

#[async_trait]
impl BusConnector for MemoryBus {
    async fn connect(&self) -> Result<Arc<dyn BusConnection>, BrokerError> {
        let mut inner = self.lock();
        if inner.failing_connects > 0 {
            inner.failing_connects -= 1;
            return Err(BrokerError::Connect("memory bus refused connection".into()));
        }
        inner.connects += 1;
        Ok(Arc::new(MemoryConnection {
            bus: self.clone(),
            generation: inner.generation,
        }))
    }

    fn describe(&self) -> String {
        "memory://".into()
    }
}

struct MemoryConnection {
    bus: MemoryBus,
    generation: u64,
}

impl MemoryConnection {
    fn ensure_live(&self) -> Result<(), BrokerError> {
        if self.bus.lock().generation == self.generation {
            Ok(())
        } else {
            Err(BrokerError::NotConnected)
        }
    }
}

#[async_trait]
impl BusConnection for MemoryConnection {
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), BrokerError> {
        self.ensure_live().map_err(|_| BrokerError::Publish {
            subject: subject.to_string(),
            reason: "connection closed".into(),
        })?;
        self.bus.deliver(BusMessage::new(subject, payload));
        Ok(())
    }

    async fn subscribe(&self, subject: &str) -> Result<Subscription, BrokerError> {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut inner = self.bus.lock();
            if inner.generation != self.generation {
                return Err(BrokerError::Subscribe {
                    subject: subject.to_string(),
                    reason: "connection closed".into(),
                });
            }
            inner.subscribers.push((subject.to_string(), tx));
        }
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    async fn flush(&self) -> Result<(), BrokerError> {
        self.bus.lock().flushes += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_to_matching_subscribers_only() {
        let bus = MemoryBus::new();
        let conn = bus.connect().await.unwrap();
        let mut all = conn.subscribe("potatbotat.>").await.unwrap();
        let mut pings = conn.subscribe("potatbotat.ping").await.unwrap();

        bus.publish("potatbotat.proxy-socket", "x");
        bus.publish("potatbotat.ping", "");
        bus.publish("elsewhere.ping", "");

        assert_eq!(all.next().await.unwrap().subject, "potatbotat.proxy-socket");
        assert_eq!(all.next().await.unwrap().subject, "potatbotat.ping");
        assert_eq!(pings.next().await.unwrap().subject, "potatbotat.ping");
    }

    #[tokio::test]
    async fn disconnect_ends_streams_and_invalidates_connections() {
        let bus = MemoryBus::new();
        let conn = bus.connect().await.unwrap();
        let mut sub = conn.subscribe("a.>").await.unwrap();

        bus.disconnect_all();

        assert!(sub.next().await.is_none());
        assert!(conn.publish("a.b", Bytes::new()).await.is_err());
        assert!(conn.subscribe("a.>").await.is_err());
    }

    #[tokio::test]
    async fn injected_connect_failures() {
        let bus = MemoryBus::new();
        bus.fail_next_connects(2);
        assert!(bus.connect().await.is_err());
        assert!(bus.connect().await.is_err());
        assert!(bus.connect().await.is_ok());
        assert_eq!(bus.connect_count(), 1);
    }
}
