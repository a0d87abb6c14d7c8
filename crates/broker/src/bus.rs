use std::sync::Arc;

use {async_trait::async_trait, bytes::Bytes, futures::stream::BoxStream};

use crate::error::BrokerError;

/// A message delivered by a bus subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct BusMessage {
    pub subject: String,
    pub payload: Bytes,
}

impl BusMessage {
    pub fn new(subject: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            subject: subject.into(),
            payload: payload.into(),
        }
    }
}

/// Stream of messages for one subscription. Ends when the connection is lost.
pub type Subscription = BoxStream<'static, BusMessage>;

/// Factory for bus connections. Each call yields a brand new connection.
#[async_trait]
pub trait BusConnector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn BusConnection>, BrokerError>;

    /// Where this connector points, for logs.
    fn describe(&self) -> String;
}

/// One live connection to the bus.
#[async_trait]
pub trait BusConnection: Send + Sync {
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), BrokerError>;

    async fn subscribe(&self, subject: &str) -> Result<Subscription, BrokerError>;

    /// Flush buffered publishes before the connection is dropped.
    async fn flush(&self) -> Result<(), BrokerError> {
        Ok(())
    }
}

/// NATS-style subject matching: `*` matches one token, a trailing `>`
/// matches one or more tokens.
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern = pattern.split('.');
    let mut subject = subject.split('.');
    loop {
        match (pattern.next(), subject.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => {},
            (Some(p), Some(s)) if p == s => {},
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use {super::*, rstest::rstest};

    #[rstest]
    #[case("potatbotat.>", "potatbotat.ping", true)]
    #[case("potatbotat.>", "potatbotat.a.b.c", true)]
    #[case("potatbotat.>", "potatbotat", false)]
    #[case("potatbotat.>", "potat-api.ping", false)]
    #[case("a.*.c", "a.b.c", true)]
    #[case("a.*.c", "a.b.d", false)]
    #[case("a.*", "a.b.c", false)]
    #[case("potat-api.pong", "potat-api.pong", true)]
    #[case("potat-api.pong", "potat-api.ping", false)]
    fn matches_nats_wildcards(#[case] pattern: &str, #[case] subject: &str, #[case] expected: bool) {
        assert_eq!(subject_matches(pattern, subject), expected);
    }
}
