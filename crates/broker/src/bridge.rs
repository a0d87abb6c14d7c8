//! Long-lived bus session with automatic reconnect.
//!
//! One session = connect, subscribe to `{inbound}.>`, announce
//! `{outbound}.connected`, then dispatch messages until the subscription
//! ends. Between sessions the bridge waits `reconnect_delay` and starts over
//! with a fresh connection. Only the shutdown token ends the loop.

use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use {
    bytes::Bytes,
    futures::{StreamExt, future::BoxFuture},
    tokio::sync::{Mutex, RwLock, mpsc},
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

#[cfg(feature = "metrics")]
use potat_metrics::{counter, names};
use potat_protocol::{RpcReply, Subjects};

use crate::{
    bus::{BusConnection, BusConnector, BusMessage},
    error::BrokerError,
};

/// Callback receiving relay payloads verbatim, in bus order.
pub type RelayFn = Arc<dyn Fn(Bytes) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Receives replies arriving on the job-reply subject.
pub trait ReplyHandler: Send + Sync {
    /// Returns `false` when no request was waiting for this reply.
    fn handle_reply(&self, reply: RpcReply) -> bool;
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub subjects: Subjects,
    pub reconnect_delay: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            subjects: Subjects::default(),
            reconnect_delay: Duration::from_secs(5),
        }
    }
}

pub struct BrokerBridge {
    connector: Arc<dyn BusConnector>,
    config: BridgeConfig,
    /// Connection of the current session; `None` between sessions.
    connection: RwLock<Option<Arc<dyn BusConnection>>>,
    relay_fn: RwLock<Option<RelayFn>>,
    reply_handler: RwLock<Option<Arc<dyn ReplyHandler>>>,
    relay_tx: mpsc::UnboundedSender<Bytes>,
    relay_rx: Mutex<Option<mpsc::UnboundedReceiver<Bytes>>>,
    sessions: AtomicU64,
}

impl BrokerBridge {
    pub fn new(connector: Arc<dyn BusConnector>, config: BridgeConfig) -> Arc<Self> {
        let (relay_tx, relay_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            connector,
            config,
            connection: RwLock::new(None),
            relay_fn: RwLock::new(None),
            reply_handler: RwLock::new(None),
            relay_tx,
            relay_rx: Mutex::new(Some(relay_rx)),
            sessions: AtomicU64::new(0),
        })
    }

    pub fn subjects(&self) -> &Subjects {
        &self.config.subjects
    }

    /// Register the callback that receives relay-subject payloads.
    pub async fn set_relay_fn<F, Fut>(&self, f: F)
    where
        F: Fn(Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let relay: RelayFn = Arc::new(move |payload| Box::pin(f(payload)));
        *self.relay_fn.write().await = Some(relay);
    }

    pub async fn set_reply_handler(&self, handler: Arc<dyn ReplyHandler>) {
        *self.reply_handler.write().await = Some(handler);
    }

    pub async fn is_connected(&self) -> bool {
        self.connection.read().await.is_some()
    }

    /// Number of sessions that reached the subscribed state.
    pub fn session_count(&self) -> u64 {
        self.sessions.load(Ordering::Relaxed)
    }

    /// Publish on the current connection. Never retried.
    pub async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), BrokerError> {
        let conn = self
            .connection
            .read()
            .await
            .clone()
            .ok_or(BrokerError::NotConnected)?;
        conn.publish(subject, payload).await
    }

    /// Run the reconnect loop until `shutdown` is cancelled.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        if let Some(rx) = self.relay_rx.lock().await.take() {
            tokio::spawn(Arc::clone(&self).forward_relays(rx, shutdown.clone()));
        }

        info!(bus = %self.connector.describe(), "broker bridge starting");
        loop {
            let session = shutdown.child_token();
            match self.run_session(&session).await {
                Ok(()) => debug!("bus session cancelled"),
                Err(e) => warn!(error = %e, "bus session ended"),
            }
            session.cancel();

            let previous = self.connection.write().await.take();
            if shutdown.is_cancelled() {
                if let Some(conn) = previous
                    && let Err(e) = conn.flush().await
                {
                    warn!(error = %e, "failed to flush bus connection");
                }
                break;
            }

            #[cfg(feature = "metrics")]
            counter!(names::BROKER_RECONNECTS_TOTAL).increment(1);
            info!(
                delay_secs = self.config.reconnect_delay.as_secs_f64(),
                "reconnecting to bus"
            );
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.reconnect_delay) => {},
            }
        }
        info!("broker bridge stopped");
    }

    async fn run_session(&self, session: &CancellationToken) -> Result<(), BrokerError> {
        let subjects = &self.config.subjects;
        let conn = self.connector.connect().await?;
        let mut subscription = conn.subscribe(&subjects.wildcard).await?;
        *self.connection.write().await = Some(Arc::clone(&conn));

        let n = self.sessions.fetch_add(1, Ordering::Relaxed) + 1;
        info!(session = n, subject = %subjects.wildcard, "subscribed to bus");
        if let Err(e) = conn.publish(&subjects.connected, Bytes::new()).await {
            warn!(error = %e, "failed to announce connection");
        }

        loop {
            tokio::select! {
                _ = session.cancelled() => return Ok(()),
                msg = subscription.next() => match msg {
                    Some(msg) => self.dispatch(conn.as_ref(), msg).await,
                    None => return Err(BrokerError::SubscriptionClosed),
                },
            }
        }
    }

    async fn dispatch(&self, conn: &dyn BusConnection, msg: BusMessage) {
        let subjects = &self.config.subjects;
        let subject = msg.subject.as_str();

        if subject == subjects.ping {
            answer_liveness(conn, &subjects.out_pong).await;
        } else if subject == subjects.pong {
            answer_liveness(conn, &subjects.out_ping).await;
        } else if subject == subjects.relay {
            if self.relay_tx.send(msg.payload).is_err() {
                debug!("relay forwarder gone, dropping payload");
            }
        } else if subject == subjects.job_reply {
            self.dispatch_reply(&msg.payload).await;
        } else {
            debug!(subject, "unrecognized subject");
        }
    }

    async fn dispatch_reply(&self, payload: &[u8]) {
        let reply: RpcReply = match serde_json::from_slice(payload) {
            Ok(reply) => reply,
            Err(e) => {
                warn!(error = %e, "malformed job reply");
                return;
            },
        };
        match self.reply_handler.read().await.as_ref() {
            Some(handler) => {
                handler.handle_reply(reply);
            },
            None => debug!(correlation_id = %reply.correlation_id, "no reply handler registered"),
        }
    }

    /// Drains relay payloads one at a time so a slow callback delays only
    /// later relays, never bus consumption.
    async fn forward_relays(
        self: Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<Bytes>,
        shutdown: CancellationToken,
    ) {
        loop {
            let payload = tokio::select! {
                _ = shutdown.cancelled() => break,
                payload = rx.recv() => match payload {
                    Some(payload) => payload,
                    None => break,
                },
            };
            let relay = self.relay_fn.read().await.clone();
            let Some(relay) = relay else {
                debug!(bytes = payload.len(), "no relay callback registered, dropping payload");
                continue;
            };
            match relay(payload).await {
                Ok(()) => {
                    #[cfg(feature = "metrics")]
                    counter!(names::BROKER_RELAYED_TOTAL).increment(1);
                },
                Err(e) => warn!(error = %e, "relay callback failed"),
            }
        }
    }
}

async fn answer_liveness(conn: &dyn BusConnection, subject: &str) {
    if let Err(e) = conn.publish(subject, Bytes::new()).await {
        warn!(subject, error = %e, "failed to answer liveness check");
    }
}
