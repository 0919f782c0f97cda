//! In-process message bus: three bounded, drop-oldest queues (inbound,
//! outbound, reaction) decoupling channel adapters from the pipeline
//! consumer, plus optional per-channel subscriber fan-out for delivery.

pub mod bus;
pub mod queue;

pub use bus::{BusStatus, MessageBus, ReactionDispatch, SharedBus};
pub use queue::BoundedDropQueue;
