//! Wire protocol for the potat relay.
//!
//! Three things cross process boundaries:
//! - [`Envelope`] frames pushed to browsers over the socket
//! - raw relay payloads and [`RpcRequest`]/[`RpcReply`] frames on the bus
//! - bus subject names, derived from two prefixes by [`Subjects`]

mod envelope;
mod rpc;
mod subjects;

pub use {
    envelope::{Envelope, Opcode},
    rpc::{RpcReply, RpcRequest},
    subjects::Subjects,
};

/// Human-readable topics used on control envelopes.
pub mod topics {
    pub const HELLO: &str = "Welcome to the potat socket!";
    pub const RECONNECT: &str = "Connection TTL reached, please reconnect";
    pub const RECEIVED_DATA: &str = "This socket does not accept incoming messages";
}

/// Close reasons logged when a client connection ends.
pub mod close_reasons {
    pub const TTL_REACHED: &str = "TTL reached";
    pub const INCOMING_NOT_ALLOWED: &str = "incoming messages not allowed";
    pub const PONG_TIMEOUT: &str = "pong timeout";
    pub const READ_ERROR: &str = "read error";
    pub const WRITE_ERROR: &str = "write error";
    pub const PEER_CLOSED: &str = "peer closed connection";
    pub const QUEUE_CLOSED: &str = "send queue closed";
    pub const EVICTED: &str = "dropped by hub";
    pub const SHUTDOWN: &str = "server shutting down";
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("unknown opcode {0}")]
    UnknownOpcode(u16),

    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
}
