//! Gateway: WebSocket fan-out hub and HTTP control plane.
//!
//! Lifecycle:
//! 1. Load config and build backends (bus connector, counter store)
//! 2. Spawn the hub and the broker bridge, wire bus relays into the hub
//! 3. Bind the HTTP server: health, rate-limited socket upgrade and `/rpc`
//! 4. Run until the root shutdown token fires
//!
//! Bus plumbing lives in `potat-broker`, admission control in
//! `potat-ratelimit`.

pub mod client;
pub mod error;
pub mod hub;
pub mod rate_limit;
pub mod server;
pub mod state;

pub use {
    client::{Client, ClientSettings},
    error::GatewayError,
    hub::{Hub, HubHandle},
    server::{Backends, build_gateway_app, launch, start_gateway},
    state::GatewayState,
};
