use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use {
    potat_broker::{BrokerBridge, RequestCorrelator},
    potat_config::SocketConfig,
    potat_ratelimit::RateLimiter,
};

use crate::{client::ClientSettings, hub::HubHandle};

/// Shared gateway runtime state, handed to every route as axum state.
///
/// Optional parts are `None` when disabled in config.
pub struct GatewayState {
    pub hub: HubHandle,
    pub bridge: Option<Arc<BrokerBridge>>,
    pub correlator: Option<Arc<RequestCorrelator>>,
    pub limiter: Option<Arc<RateLimiter>>,
    pub client_settings: ClientSettings,
    /// Route serving the socket upgrade.
    pub socket_path: String,
    pub max_message_size: usize,
    /// Root token; every client's close signal is a child of it.
    pub shutdown: CancellationToken,
    pub version: String,
}

impl GatewayState {
    pub fn new(hub: HubHandle, shutdown: CancellationToken, socket: &SocketConfig) -> Self {
        let socket_path = if socket.path.starts_with('/') {
            socket.path.clone()
        } else {
            format!("/{}", socket.path)
        };
        Self {
            hub,
            bridge: None,
            correlator: None,
            limiter: None,
            client_settings: ClientSettings::from(socket),
            socket_path,
            max_message_size: socket.max_message_size,
            shutdown,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    pub fn with_bridge(mut self, bridge: Arc<BrokerBridge>, correlator: Arc<RequestCorrelator>) -> Self {
        self.bridge = Some(bridge);
        self.correlator = Some(correlator);
        self
    }

    pub fn with_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn client_count(&self) -> usize {
        self.hub.client_count()
    }
}
