//! Metrics facade for the relay.
//!
//! Call sites use the re-exported `counter!`/`gauge!`/`histogram!` macros with
//! names from [`names`]. Nothing is recorded until [`install_prometheus`]
//! installs a global recorder.

pub use metrics::{counter, gauge, histogram};

/// Every metric name emitted by the workspace.
pub mod names {
    /// Connected socket clients (gauge).
    pub const SOCKET_CONNECTIONS: &str = "socket_connections";
    pub const SOCKET_BROADCASTS_TOTAL: &str = "socket_broadcasts_total";
    /// Clients dropped because their send queue was full or closed.
    pub const SOCKET_DROPPED_CLIENTS_TOTAL: &str = "socket_dropped_clients_total";
    pub const BROKER_RECONNECTS_TOTAL: &str = "broker_reconnects_total";
    pub const BROKER_RELAYED_TOTAL: &str = "broker_relayed_total";
    /// Labelled with `result` = ok | timeout | publish_error.
    pub const RPC_REQUESTS_TOTAL: &str = "rpc_requests_total";
    pub const RPC_DURATION_SECONDS: &str = "rpc_duration_seconds";
    /// Labelled with `result` = allowed | denied | error.
    pub const RATELIMIT_DECISIONS_TOTAL: &str = "ratelimit_decisions_total";
    /// Labelled with `method`, `endpoint` and `status`.
    pub const HTTP_INBOUND_REQUESTS_TOTAL: &str = "http_inbound_requests_total";
}

/// Install the Prometheus recorder and serve `/metrics` on `addr`.
///
/// Must be called from within a Tokio runtime.
#[cfg(feature = "prometheus")]
pub fn install_prometheus(addr: std::net::SocketAddr) -> anyhow::Result<()> {
    use anyhow::Context;

    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("failed to install prometheus exporter")?;
    tracing::info!(%addr, "prometheus exporter listening");
    Ok(())
}

#[cfg(not(feature = "prometheus"))]
pub fn install_prometheus(addr: std::net::SocketAddr) -> anyhow::Result<()> {
    tracing::warn!(%addr, "built without the prometheus feature, metrics are not exported");
    Ok(())
}
