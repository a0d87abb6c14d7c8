use std::{net::SocketAddr, sync::Arc};

use {
    anyhow::Context,
    axum::{
        Router,
        extract::{ConnectInfo, State, WebSocketUpgrade},
        http::HeaderMap,
        middleware,
        response::{IntoResponse, Json},
        routing::{get, post},
    },
    futures::StreamExt,
    tokio_util::sync::CancellationToken,
    tower_http::{
        cors::{Any, CorsLayer},
        trace::TraceLayer,
    },
    tracing::{info, warn},
};

use {
    potat_broker::{
        BridgeConfig, BrokerBridge, BusConnector, MemoryBus, NatsConnector, RequestCorrelator,
    },
    potat_config::{BusBackend, PotatConfig, StoreBackend},
    potat_protocol::Subjects,
    potat_ratelimit::{
        CounterStore, MemoryCounterStore, RateLimitPolicy, RateLimiter, RedisCounterStore,
    },
};

use crate::{
    client::Client,
    error::GatewayError,
    hub::Hub,
    rate_limit::{self, client_identity},
    state::GatewayState,
};

// ── Backends ─────────────────────────────────────────────────────────────────

/// External dependencies of the gateway. `None` disables the feature.
#[derive(Default)]
pub struct Backends {
    pub bus: Option<Arc<dyn BusConnector>>,
    pub counter_store: Option<Arc<dyn CounterStore>>,
}

impl Backends {
    /// Build backends from config. Fails if Redis is configured but
    /// unreachable; the bus is connected lazily by the bridge.
    pub async fn from_config(config: &PotatConfig) -> anyhow::Result<Self> {
        let bus: Option<Arc<dyn BusConnector>> = match (config.broker.enabled, config.broker.backend) {
            (false, _) => None,
            (true, BusBackend::Nats) => Some(Arc::new(NatsConnector::new(&config.broker.url))),
            (true, BusBackend::Memory) => Some(Arc::new(MemoryBus::new())),
        };

        let counter_store: Option<Arc<dyn CounterStore>> = match (
            config.rate_limit.enabled,
            config.rate_limit.store,
        ) {
            (false, _) => None,
            (true, StoreBackend::Memory) => Some(Arc::new(MemoryCounterStore::new())),
            (true, StoreBackend::Redis) => {
                let store = RedisCounterStore::connect(&config.redis.url, config.redis.pool_size)
                    .await
                    .with_context(|| format!("failed to connect to redis at {}", config.redis.url))?;
                Some(Arc::new(store))
            },
        };

        Ok(Self { bus, counter_store })
    }
}

// ── Wiring ───────────────────────────────────────────────────────────────────

/// Spawn the hub and, when a bus is configured, the broker bridge with its
/// relay wired into the hub. Everything stops when `shutdown` fires.
pub async fn launch(
    config: &PotatConfig,
    backends: Backends,
    shutdown: &CancellationToken,
) -> Arc<GatewayState> {
    let (hub, hub_handle) = Hub::new();
    tokio::spawn(hub.run(shutdown.clone()));

    let mut state = GatewayState::new(hub_handle.clone(), shutdown.clone(), &config.socket);

    if let Some(bus) = backends.bus {
        let bridge = BrokerBridge::new(bus, BridgeConfig {
            subjects: Subjects::new(&config.broker.inbound_prefix, &config.broker.outbound_prefix),
            reconnect_delay: config.broker.reconnect_delay(),
        });
        bridge
            .set_relay_fn(move |payload| {
                hub_handle.broadcast(payload);
                std::future::ready(anyhow::Ok(()))
            })
            .await;
        let correlator =
            RequestCorrelator::attach(Arc::clone(&bridge), config.broker.request_timeout()).await;
        tokio::spawn(Arc::clone(&bridge).run(shutdown.clone()));
        state = state.with_bridge(bridge, Arc::new(correlator));
    }

    if let Some(store) = backends.counter_store {
        let policy = RateLimitPolicy {
            limit: config.rate_limit.limit,
            window: config.rate_limit.window(),
            key_prefix: config.rate_limit.key_prefix.clone(),
        };
        state = state.with_limiter(Arc::new(RateLimiter::new(store, policy)));
    }

    Arc::new(state)
}

// ── Server startup ───────────────────────────────────────────────────────────

/// Build the gateway router (shared between production startup and tests).
pub fn build_gateway_app(state: Arc<GatewayState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let limited = Router::new()
        .route(&state.socket_path, get(ws_upgrade_handler))
        .route("/rpc", post(rpc_handler))
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            rate_limit::enforce,
        ));

    let router = Router::new()
        .route("/health", get(health_handler))
        .merge(limited);

    #[cfg(feature = "metrics")]
    let router = router.layer(middleware::from_fn(record_request));

    router
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Start the gateway HTTP + WebSocket server and run until `shutdown` fires.
pub async fn start_gateway(config: PotatConfig, shutdown: CancellationToken) -> anyhow::Result<()> {
    #[cfg(feature = "metrics")]
    if config.metrics.enabled {
        let addr: SocketAddr = format!("{}:{}", config.metrics.bind, config.metrics.port)
            .parse()
            .context("invalid metrics address")?;
        potat_metrics::install_prometheus(addr)?;
    }
    #[cfg(not(feature = "metrics"))]
    if config.metrics.enabled {
        warn!("metrics enabled in config but the gateway was built without metrics");
    }

    let backends = Backends::from_config(&config).await?;
    let state = launch(&config, backends, &shutdown).await;

    if !config.socket.enabled {
        info!("socket server disabled, running bus bridge only");
        shutdown.cancelled().await;
        return Ok(());
    }

    let app = build_gateway_app(Arc::clone(&state));
    let addr: SocketAddr = format!("{}:{}", config.socket.bind, config.socket.port)
        .parse()
        .context("invalid socket address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    // Startup banner.
    let lines = [
        format!("potat relay v{}", state.version),
        format!("listening on {addr}, socket at {}", state.socket_path),
        if config.broker.enabled {
            format!("bus: {} ({:?})", config.broker.url, config.broker.backend)
        } else {
            "bus: disabled".to_string()
        },
        match &state.limiter {
            Some(limiter) => format!(
                "rate limit: {} per {}s ({:?})",
                limiter.policy().limit,
                limiter.policy().window.as_secs(),
                config.rate_limit.store
            ),
            None => "rate limit: disabled".to_string(),
        },
    ];
    let width = lines.iter().map(|l| l.len()).max().unwrap_or(0) + 4;
    info!("┌{}┐", "─".repeat(width));
    for line in &lines {
        info!("│  {:<w$}│", line, w = width - 2);
    }
    info!("└{}┘", "─".repeat(width));

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown.clone().cancelled_owned())
    .await?;
    info!("gateway stopped");
    Ok(())
}

// ── Handlers ─────────────────────────────────────────────────────────────────

async fn health_handler(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    let connected = match &state.bridge {
        Some(bridge) => bridge.is_connected().await,
        None => false,
    };
    Json(serde_json::json!({
        "status": "ok",
        "version": state.version,
        "connections": state.client_count(),
        "broker": {
            "enabled": state.bridge.is_some(),
            "connected": connected,
        },
    }))
}

async fn ws_upgrade_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<Arc<GatewayState>>,
) -> impl IntoResponse {
    let remote = client_identity(&headers, Some(addr));
    ws.max_message_size(state.max_message_size)
        .on_failed_upgrade(|e| warn!(error = %e, "websocket upgrade failed"))
        .on_upgrade(move |socket| async move {
            let (sink, stream) = socket.split();
            Client::serve(
                sink,
                stream,
                state.hub.clone(),
                remote,
                state.client_settings.clone(),
                &state.shutdown,
            )
            .await;
        })
}

/// Forward the JSON body as a job request and return the reply payload.
async fn rpc_handler(
    State(state): State<Arc<GatewayState>>,
    Json(payload): Json<serde_json::Value>,
) -> Result<Json<serde_json::Value>, GatewayError> {
    let correlator = state
        .correlator
        .as_ref()
        .ok_or(GatewayError::BrokerDisabled)?;
    Ok(Json(correlator.request(payload).await?))
}

#[cfg(feature = "metrics")]
async fn record_request(
    request: axum::extract::Request,
    next: middleware::Next,
) -> axum::response::Response {
    use potat_metrics::{counter, names};

    let method = request.method().to_string();
    let endpoint = request
        .extensions()
        .get::<axum::extract::MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "unmatched".into());
    let response = next.run(request).await;
    counter!(
        names::HTTP_INBOUND_REQUESTS_TOTAL,
        "method" => method,
        "endpoint" => endpoint,
        "status" => response.status().as_u16().to_string()
    )
    .increment(1);
    response
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        async_trait::async_trait,
        axum::{
            body::Body,
            http::{Request, StatusCode},
        },
        bytes::Bytes,
        potat_broker::{BusConnection, BusMessage},
        potat_protocol::{RpcReply, RpcRequest},
        potat_ratelimit::{StoreError, WindowState},
        std::time::Duration,
        tower::ServiceExt,
    };

    struct BrokenStore;

    #[async_trait]
    impl CounterStore for BrokenStore {
        async fn hit(&self, _: &str, _: u64, _: Duration) -> Result<WindowState, StoreError> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
    }

    fn config(limit: u64) -> PotatConfig {
        let mut config = PotatConfig::default();
        config.rate_limit.limit = limit;
        config
    }

    fn rpc_request(ip: &str) -> Request<Body> {
        Request::post("/rpc")
            .header("content-type", "application/json")
            .header(rate_limit::CLIENT_IP_HEADER, ip)
            .body(Body::from(r#""get-commands""#))
            .unwrap()
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_reports_connections_and_skips_rate_limit() {
        let shutdown = CancellationToken::new();
        let state = launch(&config(0), Backends {
            bus: None,
            counter_store: Some(Arc::new(MemoryCounterStore::new())),
        }, &shutdown)
        .await;
        let app = build_gateway_app(state);

        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get("x-ratelimit-limit").is_none());
        let json = body_json(response).await;
        assert_eq!(json["connections"], 0);
        assert_eq!(json["broker"]["enabled"], false);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn rate_limit_denies_with_headers() {
        let shutdown = CancellationToken::new();
        let state = launch(&config(2), Backends {
            bus: None,
            counter_store: Some(Arc::new(MemoryCounterStore::new())),
        }, &shutdown)
        .await;
        let app = build_gateway_app(state);

        for remaining in ["1", "0"] {
            let response = app.clone().oneshot(rpc_request("198.51.100.7")).await.unwrap();
            // Broker is disabled, but the request was admitted.
            assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
            assert_eq!(response.headers()["x-ratelimit-remaining"], remaining);
            assert_eq!(response.headers()["x-ratelimit-limit"], "2");
            assert_eq!(response.headers()["x-ratelimit-window"], "60");
        }

        let denied = app.clone().oneshot(rpc_request("198.51.100.7")).await.unwrap();
        assert_eq!(denied.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(denied.headers()["retry-after"], "60");

        let other = app.oneshot(rpc_request("198.51.100.8")).await.unwrap();
        assert_ne!(other.status(), StatusCode::TOO_MANY_REQUESTS);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn store_outage_fails_closed() {
        let shutdown = CancellationToken::new();
        let state = launch(&config(100), Backends {
            bus: None,
            counter_store: Some(Arc::new(BrokenStore)),
        }, &shutdown)
        .await;
        let app = build_gateway_app(state);

        let response = app.oneshot(rpc_request("198.51.100.7")).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn rpc_round_trip_over_the_bus() {
        let bus = MemoryBus::new();
        let mut tap = bus.tap();
        let shutdown = CancellationToken::new();
        let state = launch(&PotatConfig::default(), Backends {
            bus: Some(Arc::new(bus.clone())),
            counter_store: None,
        }, &shutdown)
        .await;
        while tap.recv().await.unwrap().subject != "potat-api.connected" {}

        let responder = bus.connect().await.unwrap();
        let mut requests = responder.subscribe("potat-api.job-request").await.unwrap();
        tokio::spawn(async move {
            let BusMessage { payload, .. } = requests.next().await.unwrap();
            let req: RpcRequest = serde_json::from_slice(&payload).unwrap();
            let reply = RpcReply {
                correlation_id: req.correlation_id,
                payload: serde_json::json!({ "commands": ["ping", "help"] }),
            };
            responder
                .publish(&req.reply_to, Bytes::from(serde_json::to_vec(&reply).unwrap()))
                .await
                .unwrap();
        });

        let app = build_gateway_app(state);
        let response = app.oneshot(rpc_request("198.51.100.7")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            body_json(response).await,
            serde_json::json!({ "commands": ["ping", "help"] })
        );
        shutdown.cancel();
    }

    #[test]
    fn rpc_errors_map_to_distinct_statuses() {
        use potat_broker::{BrokerError, RpcError};

        let timeout = GatewayError::from(RpcError::Timeout(Duration::from_secs(5)));
        let transport = GatewayError::from(RpcError::Publish(BrokerError::NotConnected));
        assert_eq!(timeout.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(transport.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            GatewayError::BrokerDisabled.status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
