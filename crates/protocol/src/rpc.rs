use serde::{Deserialize, Serialize};

/// Request frame published on the job-request subject.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcRequest {
    pub correlation_id: String,
    /// Subject the responder must publish its [`RpcReply`] on.
    pub reply_to: String,
    pub payload: serde_json::Value,
}

/// Reply frame received on the job-reply subject.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcReply {
    pub correlation_id: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}
