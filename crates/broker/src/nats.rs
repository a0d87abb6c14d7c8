//! NATS-backed bus connections.
//!
//! The NATS client reconnects on its own and keeps subscriptions alive
//! across outages. The bridge owns reconnection instead, so a connection
//! counts as lost on the first disconnect: its subscription streams end and
//! publishes fail until the bridge dials a fresh one.

use std::sync::Arc;

use {
    async_nats::Event,
    async_trait::async_trait,
    bytes::Bytes,
    futures::{Stream, StreamExt},
    tokio_util::sync::CancellationToken,
    tracing::{debug, warn},
};

use crate::{
    bus::{BusConnection, BusConnector, BusMessage, Subscription},
    error::BrokerError,
};

/// Connects to a NATS server at a fixed URL.
pub struct NatsConnector {
    url: String,
}

impl NatsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl BusConnector for NatsConnector {
    async fn connect(&self) -> Result<Arc<dyn BusConnection>, BrokerError> {
        let lost = CancellationToken::new();
        let signal = lost.clone();
        let client = async_nats::ConnectOptions::new()
            .event_callback(move |event| {
                let signal = signal.clone();
                async move { on_event(&event, &signal) }
            })
            .connect(self.url.as_str())
            .await
            .map_err(|e| BrokerError::Connect(format!("{}: {e}", self.url)))?;
        debug!(url = %self.url, "connected to NATS");
        Ok(Arc::new(NatsConnection { client, lost }))
    }

    fn describe(&self) -> String {
        self.url.clone()
    }
}

/// Mark the connection lost on disconnect or close.
fn on_event(event: &Event, lost: &CancellationToken) {
    match event {
        Event::Disconnected | Event::Closed => {
            if !lost.is_cancelled() {
                warn!(event = ?event, "NATS connection lost");
            }
            lost.cancel();
        },
        other => debug!(event = ?other, "NATS client event"),
    }
}

/// End `messages` once `lost` fires.
fn until_lost<S>(messages: S, lost: &CancellationToken) -> Subscription
where
    S: Stream<Item = BusMessage> + Send + 'static,
{
    messages.take_until(lost.clone().cancelled_owned()).boxed()
}

struct NatsConnection {
    client: async_nats::Client,
    lost: CancellationToken,
}

#[async_trait]
impl BusConnection for NatsConnection {
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), BrokerError> {
        if self.lost.is_cancelled() {
            return Err(BrokerError::NotConnected);
        }
        self.client
            .publish(subject.to_string(), payload)
            .await
            .map_err(|e| BrokerError::Publish {
                subject: subject.to_string(),
                reason: e.to_string(),
            })
    }

    async fn subscribe(&self, subject: &str) -> Result<Subscription, BrokerError> {
        let subscriber = self
            .client
            .subscribe(subject.to_string())
            .await
            .map_err(|e| BrokerError::Subscribe {
                subject: subject.to_string(),
                reason: e.to_string(),
            })?;
        let messages = subscriber.map(|msg| BusMessage {
            subject: msg.subject.to_string(),
            payload: msg.payload,
        });
        Ok(until_lost(messages, &self.lost))
    }

    async fn flush(&self) -> Result<(), BrokerError> {
        if self.lost.is_cancelled() {
            return Ok(());
        }
        self.client
            .flush()
            .await
            .map_err(|e| BrokerError::Flush(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use {super::*, futures::stream, std::time::Duration};

    #[test]
    fn disconnect_and_close_mark_the_connection_lost() {
        for event in [Event::Disconnected, Event::Closed] {
            let lost = CancellationToken::new();
            on_event(&event, &lost);
            assert!(lost.is_cancelled(), "{event:?} should mark the connection lost");
        }
    }

    #[test]
    fn other_events_keep_the_connection() {
        let lost = CancellationToken::new();
        for event in [Event::Connected, Event::LameDuckMode, Event::Draining] {
            on_event(&event, &lost);
        }
        assert!(!lost.is_cancelled());
    }

    #[tokio::test]
    async fn subscription_ends_when_the_connection_is_lost() {
        let lost = CancellationToken::new();
        let mut messages = until_lost(
            stream::iter([BusMessage::new("potatbotat.ping", "")]).chain(stream::pending()),
            &lost,
        );

        assert_eq!(
            messages.next().await,
            Some(BusMessage::new("potatbotat.ping", ""))
        );
        on_event(&Event::Disconnected, &lost);
        let end = tokio::time::timeout(Duration::from_secs(1), messages.next())
            .await
            .unwrap();
        assert_eq!(end, None);
    }
}
