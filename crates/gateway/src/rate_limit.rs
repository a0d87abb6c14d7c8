//! Admission control for HTTP and socket-upgrade routes.

use std::{net::SocketAddr, sync::Arc};

use {
    axum::{
        Json,
        extract::{ConnectInfo, Request, State},
        http::{HeaderMap, HeaderName, HeaderValue, StatusCode},
        middleware::Next,
        response::{IntoResponse, Response},
    },
    tracing::debug,
};

use potat_ratelimit::RateLimitDecision;

use crate::{error::GatewayError, state::GatewayState};

/// Header set by the CDN in front of the relay with the original client IP.
pub const CLIENT_IP_HEADER: &str = "cf-connecting-ip";

/// Caller identity: the CDN-provided client IP, else the peer address.
pub fn client_identity(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    headers
        .get(CLIENT_IP_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .or_else(|| peer.map(|addr| addr.ip().to_string()))
        .unwrap_or_else(|| "unknown".into())
}

/// Middleware: count the request against the caller's window. Denials get
/// 429, a store failure gets 500 and the request is not served.
pub async fn enforce(
    State(state): State<Arc<GatewayState>>,
    request: Request,
    next: Next,
) -> Response {
    let Some(limiter) = state.limiter.as_ref() else {
        return next.run(request).await;
    };

    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0);
    let identity = client_identity(request.headers(), peer);

    let decision = match limiter.check(&identity).await {
        Ok(decision) => decision,
        Err(e) => return GatewayError::from(e).into_response(),
    };

    let mut response = if decision.allowed {
        next.run(request).await
    } else {
        debug!(identity = %identity, path = %request.uri().path(), "request rate limited");
        (
            StatusCode::TOO_MANY_REQUESTS,
            Json(serde_json::json!({ "error": "rate limit exceeded" })),
        )
            .into_response()
    };
    apply_headers(response.headers_mut(), &decision);
    response
}

fn apply_headers(headers: &mut HeaderMap, decision: &RateLimitDecision) {
    for (name, value) in decision.headers() {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            headers.insert(name, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefers_cdn_header_over_peer() {
        let mut headers = HeaderMap::new();
        headers.insert(CLIENT_IP_HEADER, HeaderValue::from_static(" 203.0.113.9 "));
        let peer: SocketAddr = "10.0.0.1:5555".parse().unwrap();
        assert_eq!(client_identity(&headers, Some(peer)), "203.0.113.9");
    }

    #[test]
    fn falls_back_to_peer_ip_without_port() {
        let peer: SocketAddr = "10.0.0.1:5555".parse().unwrap();
        assert_eq!(client_identity(&HeaderMap::new(), Some(peer)), "10.0.0.1");
        assert_eq!(client_identity(&HeaderMap::new(), None), "unknown");
    }
}
