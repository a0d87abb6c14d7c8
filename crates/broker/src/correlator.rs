//! Request/reply over the bus, matched by correlation ID.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use {
    bytes::Bytes,
    dashmap::DashMap,
    tokio::sync::oneshot,
    tracing::{debug, warn},
    uuid::Uuid,
};

#[cfg(feature = "metrics")]
use potat_metrics::{counter, histogram, names};
use potat_protocol::{RpcReply, RpcRequest};

use crate::{
    bridge::{BrokerBridge, ReplyHandler},
    error::RpcError,
};

// ── Pending table ────────────────────────────────────────────────────────────

/// A request waiting for its reply.
struct PendingRequest {
    sender: oneshot::Sender<serde_json::Value>,
    created_at: Instant,
}

/// Outstanding requests keyed by correlation ID.
#[derive(Default)]
pub struct PendingRequests {
    slots: DashMap<String, PendingRequest>,
}

impl PendingRequests {
    fn insert(&self, correlation_id: &str) -> oneshot::Receiver<serde_json::Value> {
        let (sender, rx) = oneshot::channel();
        self.slots.insert(correlation_id.to_string(), PendingRequest {
            sender,
            created_at: Instant::now(),
        });
        rx
    }

    fn remove(&self, correlation_id: &str) {
        self.slots.remove(correlation_id);
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

impl ReplyHandler for PendingRequests {
    fn handle_reply(&self, reply: RpcReply) -> bool {
        let Some((_, pending)) = self.slots.remove(&reply.correlation_id) else {
            debug!(
                correlation_id = %reply.correlation_id,
                "discarding reply with no pending request"
            );
            return false;
        };
        debug!(
            correlation_id = %reply.correlation_id,
            elapsed_ms = pending.created_at.elapsed().as_millis() as u64,
            "reply matched"
        );
        pending.sender.send(reply.payload).is_ok()
    }
}

/// Removes the pending entry however the waiting future ends.
struct PendingGuard<'a> {
    pending: &'a PendingRequests,
    correlation_id: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(self.correlation_id);
    }
}

// ── Correlator ───────────────────────────────────────────────────────────────

pub struct RequestCorrelator {
    bridge: Arc<BrokerBridge>,
    pending: Arc<PendingRequests>,
    default_ttl: Duration,
}

impl RequestCorrelator {
    /// Create a correlator and route the bridge's job replies to it.
    pub async fn attach(bridge: Arc<BrokerBridge>, default_ttl: Duration) -> Self {
        let pending = Arc::new(PendingRequests::default());
        bridge
            .set_reply_handler(Arc::clone(&pending) as Arc<dyn ReplyHandler>)
            .await;
        Self {
            bridge,
            pending,
            default_ttl,
        }
    }

    pub fn pending(&self) -> &PendingRequests {
        &self.pending
    }

    /// Requests still waiting for a reply.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    pub async fn request(&self, payload: serde_json::Value) -> Result<serde_json::Value, RpcError> {
        self.request_with_ttl(payload, self.default_ttl).await
    }

    /// Publish `payload` as a job request and wait up to `ttl` for the reply.
    pub async fn request_with_ttl(
        &self,
        payload: serde_json::Value,
        ttl: Duration,
    ) -> Result<serde_json::Value, RpcError> {
        let started = Instant::now();
        let result = self.exchange(payload, ttl).await;

        #[cfg(feature = "metrics")]
        {
            let label = match &result {
                Ok(_) => "ok",
                Err(e) => e.kind(),
            };
            counter!(names::RPC_REQUESTS_TOTAL, "result" => label).increment(1);
            histogram!(names::RPC_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
        }
        if let Err(e) = &result {
            warn!(error = %e, elapsed_ms = started.elapsed().as_millis() as u64, "job request failed");
        }
        result
    }

    async fn exchange(
        &self,
        payload: serde_json::Value,
        ttl: Duration,
    ) -> Result<serde_json::Value, RpcError> {
        let subjects = self.bridge.subjects();
        let correlation_id = Uuid::new_v4().to_string();
        let frame = serde_json::to_vec(&RpcRequest {
            correlation_id: correlation_id.clone(),
            reply_to: subjects.job_reply.clone(),
            payload,
        })?;

        let rx = self.pending.insert(&correlation_id);
        let _guard = PendingGuard {
            pending: &self.pending,
            correlation_id: &correlation_id,
        };

        self.bridge
            .publish(&subjects.job_request, Bytes::from(frame))
            .await?;
        debug!(correlation_id = %correlation_id, ttl_ms = ttl.as_millis() as u64, "job request published");

        match tokio::time::timeout(ttl, rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(RpcError::Canceled),
            Err(_) => Err(RpcError::Timeout(ttl)),
        }
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            bridge::BridgeConfig,
            bus::{BusConnection, BusConnector},
            error::BrokerError,
            memory::MemoryBus,
        },
        futures::StreamExt,
        potat_protocol::Subjects,
        tokio_util::sync::CancellationToken,
    };

    async fn connected_bridge(bus: &MemoryBus) -> (Arc<BrokerBridge>, CancellationToken) {
        let mut tap = bus.tap();
        let bridge = BrokerBridge::new(Arc::new(bus.clone()), BridgeConfig {
            subjects: Subjects::default(),
            reconnect_delay: Duration::from_millis(50),
        });
        let shutdown = CancellationToken::new();
        tokio::spawn(Arc::clone(&bridge).run(shutdown.clone()));
        loop {
            if tap.recv().await.unwrap().subject == "potat-api.connected" {
                break;
            }
        }
        (bridge, shutdown)
    }

    /// Collects `batch` job requests, then answers them in reverse order,
    /// echoing each payload back.
    async fn spawn_responder(bus: &MemoryBus, batch: usize) {
        let conn = bus.connect().await.unwrap();
        let mut requests = conn.subscribe("potat-api.job-request").await.unwrap();
        tokio::spawn(async move {
            let mut seen = Vec::new();
            while seen.len() < batch {
                let msg = requests.next().await.unwrap();
                seen.push(serde_json::from_slice::<RpcRequest>(&msg.payload).unwrap());
            }
            for req in seen.into_iter().rev() {
                let reply = RpcReply {
                    correlation_id: req.correlation_id,
                    payload: serde_json::json!({ "echo": req.payload }),
                };
                conn.publish(&req.reply_to, Bytes::from(serde_json::to_vec(&reply).unwrap()))
                    .await
                    .unwrap();
            }
        });
    }

    #[tokio::test]
    async fn reply_resolves_request() {
        let bus = MemoryBus::new();
        let (bridge, shutdown) = connected_bridge(&bus).await;
        let correlator = RequestCorrelator::attach(bridge, Duration::from_secs(5)).await;
        spawn_responder(&bus, 1).await;

        let reply = correlator
            .request(serde_json::json!("get-commands"))
            .await
            .unwrap();
        assert_eq!(reply, serde_json::json!({ "echo": "get-commands" }));
        assert!(correlator.pending().is_empty());
        shutdown.cancel();
    }

    #[tokio::test]
    async fn concurrent_requests_get_their_own_replies() {
        let bus = MemoryBus::new();
        let (bridge, shutdown) = connected_bridge(&bus).await;
        let correlator = Arc::new(RequestCorrelator::attach(bridge, Duration::from_secs(5)).await);
        spawn_responder(&bus, 8).await;

        let calls = (0..8).map(|i| {
            let correlator = Arc::clone(&correlator);
            tokio::spawn(async move { (i, correlator.request(serde_json::json!(i)).await) })
        });
        for call in futures::future::join_all(calls).await {
            let (i, reply) = call.unwrap();
            assert_eq!(reply.unwrap(), serde_json::json!({ "echo": i }));
        }
        assert!(correlator.pending().is_empty());
        shutdown.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_and_discards_late_reply() {
        let bus = MemoryBus::new();
        let (bridge, shutdown) = connected_bridge(&bus).await;
        let correlator = RequestCorrelator::attach(bridge, Duration::from_secs(5)).await;

        let conn = bus.connect().await.unwrap();
        let mut requests = conn.subscribe("potat-api.job-request").await.unwrap();

        let started = tokio::time::Instant::now();
        let err = correlator
            .request(serde_json::json!("get-commands"))
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Timeout(ttl) if ttl == Duration::from_secs(5)));
        assert!(started.elapsed() >= Duration::from_secs(5));
        assert!(correlator.pending().is_empty());

        let req: RpcRequest =
            serde_json::from_slice(&requests.next().await.unwrap().payload).unwrap();
        let late = RpcReply {
            correlation_id: req.correlation_id,
            payload: serde_json::Value::Null,
        };
        assert!(!correlator.pending().handle_reply(late));
        shutdown.cancel();
    }

    #[tokio::test]
    async fn publish_failure_is_not_a_timeout() {
        let bus = MemoryBus::new();
        let bridge = BrokerBridge::new(Arc::new(bus.clone()), BridgeConfig::default());
        let correlator = RequestCorrelator::attach(bridge, Duration::from_secs(5)).await;

        let err = correlator
            .request(serde_json::json!("get-commands"))
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Publish(BrokerError::NotConnected)));
        assert!(correlator.pending().is_empty());
    }

    #[tokio::test]
    async fn cancelled_waiter_releases_its_slot() {
        let bus = MemoryBus::new();
        let (bridge, shutdown) = connected_bridge(&bus).await;
        let correlator = RequestCorrelator::attach(bridge, Duration::from_secs(60)).await;

        let waiting = correlator.request(serde_json::json!("never answered"));
        let _ = tokio::time::timeout(Duration::from_millis(20), waiting).await;
        assert_eq!(correlator.pending_count(), 0);
        shutdown.cancel();
    }
}
