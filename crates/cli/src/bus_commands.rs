use std::{sync::Arc, time::Duration};

use {
    anyhow::{Context, Result, bail},
    bytes::Bytes,
    tokio_util::sync::CancellationToken,
};

use {
    potat_broker::{BridgeConfig, BrokerBridge, BusConnector, NatsConnector, RequestCorrelator},
    potat_config::{BusBackend, PotatConfig},
    potat_protocol::Subjects,
};

fn connector(config: &PotatConfig) -> Result<Arc<dyn BusConnector>> {
    match config.broker.backend {
        BusBackend::Nats => Ok(Arc::new(NatsConnector::new(&config.broker.url))),
        BusBackend::Memory => bail!("the memory bus only exists inside a running relay"),
    }
}

/// Parse `raw` as JSON, falling back to a JSON string.
fn parse_payload(raw: &str) -> serde_json::Value {
    serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::from(raw))
}

pub async fn publish(config: &PotatConfig, subject: &str, payload: String) -> Result<()> {
    let connector = connector(config)?;
    let conn = connector
        .connect()
        .await
        .with_context(|| format!("failed to connect to {}", connector.describe()))?;
    conn.publish(subject, Bytes::from(payload)).await?;
    conn.flush().await?;
    println!("published to {subject}");
    Ok(())
}

/// One request/reply exchange through a short-lived bridge.
pub async fn request(config: &PotatConfig, raw: &str, timeout_secs: Option<u64>) -> Result<()> {
    let ttl = timeout_secs
        .map(Duration::from_secs)
        .unwrap_or_else(|| config.broker.request_timeout());

    let bridge = BrokerBridge::new(connector(config)?, BridgeConfig {
        subjects: Subjects::new(&config.broker.inbound_prefix, &config.broker.outbound_prefix),
        reconnect_delay: config.broker.reconnect_delay(),
    });
    let correlator = RequestCorrelator::attach(Arc::clone(&bridge), ttl).await;
    let shutdown = CancellationToken::new();
    let runner = tokio::spawn(Arc::clone(&bridge).run(shutdown.clone()));

    let result = async {
        tokio::time::timeout(ttl, async {
            while !bridge.is_connected().await {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .context("timed out connecting to the bus")?;
        Ok::<_, anyhow::Error>(correlator.request(parse_payload(raw)).await?)
    }
    .await;

    shutdown.cancel();
    let _ = runner.await;

    println!("{}", serde_json::to_string_pretty(&result?)?);
    Ok(())
}
