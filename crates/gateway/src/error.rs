use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};

use {potat_broker::RpcError, potat_ratelimit::RateLimitError};

/// Errors surfaced to HTTP callers.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("rate limiter unavailable: {0}")]
    RateLimit(#[from] RateLimitError),

    #[error("message bus is disabled")]
    BrokerDisabled,

    #[error(transparent)]
    Rpc(#[from] RpcError),
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::RateLimit(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::BrokerDisabled => StatusCode::SERVICE_UNAVAILABLE,
            Self::Rpc(RpcError::Timeout(_)) => StatusCode::GATEWAY_TIMEOUT,
            Self::Rpc(RpcError::Publish(_) | RpcError::Canceled) => StatusCode::BAD_GATEWAY,
            Self::Rpc(RpcError::Encode(_)) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({ "error": self.to_string() }));
        (self.status(), body).into_response()
    }
}
