//! Request routing and change fan-out on top of the service registry
//!
//! This library provides:
//! - Round-robin and weighted round-robin load balancers
//! - A broadcast hub that pushes registry snapshots to subscribers
//! - The per-connection pump that drains a subscriber queue onto its transport

pub mod hub;
pub mod load_balancer;
pub mod subscriber;

pub use hub::{BroadcastHub, HubHandle, Subscriber, SubscriberId, DEFAULT_QUEUE_CAPACITY};
pub use load_balancer::{
    build_balancer, LoadBalancer, LoadBalancingStrategy, RoundRobinBalancer,
    WeightedRoundRobinBalancer,
};
pub use subscriber::{
    PumpExit, SubscriberConnection, SubscriberPump, DEFAULT_KEEPALIVE, DEFAULT_WRITE_TIMEOUT,
};
