//! Command line and environment configuration

use clap::Parser;
use discovery_balancer::{LoadBalancingStrategy, DEFAULT_QUEUE_CAPACITY};
use discovery_core::{normalize_path, RegistryConfig};
use std::net::SocketAddr;
use std::time::Duration;

#[derive(Parser, Debug, Clone)]
#[command(name = "discovery-server")]
#[command(about = "Service discovery and load balancing server", long_about = None)]
pub struct ServerConfig {
    /// Address to bind both listeners to
    #[arg(long, env = "DISCOVERY_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// HTTP API port
    #[arg(short, long, env = "DISCOVERY_PORT", default_value_t = 9876)]
    pub port: u16,

    /// WebSocket port for live registry updates
    #[arg(long, env = "DISCOVERY_SOCKET_PORT", default_value_t = 9877)]
    pub socket_port: u16,

    /// Path prefix under which requests are proxied to services
    #[arg(long, env = "DISCOVERY_SERVICE_PATH", default_value = "/get-service")]
    pub service_path: String,

    /// Seconds between liveness sweeps; services must heartbeat at least this often
    #[arg(long, env = "DISCOVERY_HEARTBEAT_INTERVAL", default_value_t = 15)]
    pub heartbeat_interval: u64,

    /// Extra seconds a service may be late before it is evicted
    #[arg(long, env = "DISCOVERY_HEARTBEAT_GRACE", default_value_t = 1)]
    pub heartbeat_grace: u64,

    /// Load balancing strategy: round-robin or weighted-round-robin
    #[arg(long, env = "DISCOVERY_STRATEGY", default_value = "round-robin")]
    pub strategy: LoadBalancingStrategy,

    /// Shared key heartbeats must present as a bearer token. Unset disables the check.
    #[arg(long, env = "DISCOVERY_KEY", hide_env_values = true)]
    pub key: Option<String>,

    /// Seconds to wait on a proxied backend
    #[arg(long, env = "DISCOVERY_FORWARD_TIMEOUT", default_value_t = 30)]
    pub forward_timeout: u64,

    /// Pending updates a WebSocket subscriber may buffer before it is dropped
    #[arg(long, env = "DISCOVERY_SUBSCRIBER_CAPACITY", default_value_t = DEFAULT_QUEUE_CAPACITY)]
    pub subscriber_capacity: usize,

    /// Seconds between WebSocket keepalive pings
    #[arg(long, env = "DISCOVERY_KEEPALIVE", default_value_t = 2)]
    pub keepalive: u64,

    /// Seconds a single WebSocket write may take before the subscriber is dropped
    #[arg(long, env = "DISCOVERY_WRITE_TIMEOUT", default_value_t = 10)]
    pub write_timeout: u64,
}

impl ServerConfig {
    pub fn http_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(format!("{}:{}", self.host, self.port).parse()?)
    }

    pub fn socket_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(format!("{}:{}", self.host, self.socket_port).parse()?)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval.max(1))
    }

    pub fn forward_timeout(&self) -> Duration {
        Duration::from_secs(self.forward_timeout.max(1))
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive.max(1))
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout.max(1))
    }

    /// Proxy prefix, normalized; never empty
    pub fn service_prefix(&self) -> String {
        match normalize_path(&self.service_path) {
            prefix if prefix.is_empty() => "/".to_string(),
            prefix => prefix,
        }
    }

    /// Shared key, ignoring blank values
    pub fn shared_key(&self) -> Option<&str> {
        self.key.as_deref().map(str::trim).filter(|k| !k.is_empty())
    }

    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig::default().heartbeat_grace(Duration::from_secs(self.heartbeat_grace))
    }
}
