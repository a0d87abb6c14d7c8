use std::time::Duration;

/// Transport-level failures talking to the bus.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("bus client not connected")]
    NotConnected,

    #[error("failed to connect to bus: {0}")]
    Connect(String),

    #[error("failed to subscribe to {subject}: {reason}")]
    Subscribe { subject: String, reason: String },

    #[error("failed to publish to {subject}: {reason}")]
    Publish { subject: String, reason: String },

    #[error("failed to flush bus connection: {0}")]
    Flush(String),

    #[error("bus subscription closed")]
    SubscriptionClosed,
}

/// Failures of a correlated request. A timeout is never reported as a
/// transport error and vice versa.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("request could not be published: {0}")]
    Publish(#[from] BrokerError),

    #[error("failed to encode request: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("reply slot dropped before a reply arrived")]
    Canceled,
}

impl RpcError {
    /// Short label used for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Timeout(_) => "timeout",
            Self::Publish(_) => "publish_error",
            Self::Encode(_) => "encode_error",
            Self::Canceled => "canceled",
        }
    }
}
