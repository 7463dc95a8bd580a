//! Heartbeat client for services registering with a discovery server

pub mod client;

pub use client::{ClientConfig, HeartbeatClient};
pub use discovery_core::HeartbeatMessage;
