//! Prometheus metrics for the discovery server

use anyhow::Result;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use std::sync::Arc;

/// Lookup outcome labels
pub const LOOKUP_FORWARDED: &str = "forwarded";
pub const LOOKUP_NOT_FOUND: &str = "not_found";
pub const LOOKUP_UNAVAILABLE: &str = "unavailable";
pub const LOOKUP_BAD_GATEWAY: &str = "bad_gateway";

/// Counters and gauges shared by every request handler
#[derive(Clone)]
pub struct DiscoveryMetrics {
    /// Heartbeats accepted
    pub heartbeats_total: IntCounter,
    /// Heartbeats rejected, by reason
    pub heartbeat_failures_total: IntCounterVec,
    /// Proxied lookups, by outcome
    pub lookups_total: IntCounterVec,
    /// Services evicted by the liveness sweep
    pub evictions_total: IntCounter,
    pub registered_services: IntGauge,
    pub connected_subscribers: IntGauge,
    pub registry: Arc<Registry>,
}

impl DiscoveryMetrics {
    pub fn new() -> Result<Self> {
        let registry = Arc::new(Registry::new());

        let heartbeats_total =
            IntCounter::new("discovery_heartbeats_total", "Heartbeats accepted")?;

        let heartbeat_failures_total = IntCounterVec::new(
            Opts::new(
                "discovery_heartbeat_failures_total",
                "Heartbeats rejected by reason",
            ),
            &["reason"],
        )?;

        let lookups_total = IntCounterVec::new(
            Opts::new("discovery_lookups_total", "Service lookups by outcome"),
            &["outcome"],
        )?;

        let evictions_total = IntCounter::new(
            "discovery_evictions_total",
            "Services evicted for missing heartbeats",
        )?;

        let registered_services = IntGauge::new(
            "discovery_registered_services",
            "Services currently registered",
        )?;

        let connected_subscribers = IntGauge::new(
            "discovery_connected_subscribers",
            "WebSocket subscribers currently connected",
        )?;

        registry.register(Box::new(heartbeats_total.clone()))?;
        registry.register(Box::new(heartbeat_failures_total.clone()))?;
        registry.register(Box::new(lookups_total.clone()))?;
        registry.register(Box::new(evictions_total.clone()))?;
        registry.register(Box::new(registered_services.clone()))?;
        registry.register(Box::new(connected_subscribers.clone()))?;

        Ok(Self {
            heartbeats_total,
            heartbeat_failures_total,
            lookups_total,
            evictions_total,
            registered_services,
            connected_subscribers,
            registry,
        })
    }

    pub fn record_lookup(&self, outcome: &str) {
        self.lookups_total.with_label_values(&[outcome]).inc();
    }

    pub fn record_heartbeat_failure(&self, reason: &str) {
        self.heartbeat_failures_total
            .with_label_values(&[reason])
            .inc();
    }

    /// Gather all metrics in Prometheus text format
    pub fn gather(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = vec![];
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}
