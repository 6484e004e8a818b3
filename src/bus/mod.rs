//! Per-trip event bus: topics, subscriber queues and the broker seam.

pub mod broker;
pub mod event_bus;
pub mod subscription;

pub use broker::{Broker, BrokerError, MemoryBroker, RedisBroker};
pub use event_bus::{BusConfig, BusError, EventBus};
pub use subscription::{
    ClosedBy, DEFAULT_BLOCK_DEADLINE, DEFAULT_QUEUE_CAPACITY, OverflowPolicy, SubscribeOptions,
    Subscription, SubscriptionHandle,
};
