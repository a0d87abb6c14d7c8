//! Bridge between the external message bus and the relay.
//!
//! [`BrokerBridge`] owns the bus connection and keeps it alive; the
//! [`RequestCorrelator`] layers request/reply on top of its fire-and-forget
//! publish. The bus itself sits behind [`BusConnector`] so NATS and the
//! in-process [`MemoryBus`] are interchangeable.

pub mod bridge;
pub mod bus;
pub mod correlator;
pub mod error;
pub mod memory;
pub mod nats;

pub use {
    bridge::{BridgeConfig, BrokerBridge, RelayFn, ReplyHandler},
    bus::{BusConnection, BusConnector, BusMessage, Subscription, subject_matches},
    correlator::{PendingRequests, RequestCorrelator},
    error::{BrokerError, RpcError},
    memory::MemoryBus,
    nats::NatsConnector,
};
