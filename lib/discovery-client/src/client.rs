use anyhow::{bail, Context, Result};
use discovery_core::{normalize_path, HeartbeatMessage};
use std::future::Future;
use std::time::Duration;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Heartbeat client configuration
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Base URL of the discovery server, e.g. `http://localhost:9876`
    pub discovery_url: String,
    /// Path the heartbeat is posted to
    pub heartbeat_path: String,
    /// Interval between heartbeats
    pub heartbeat_interval: Duration,
    /// Shared key sent as a bearer token
    pub key: Option<String>,
    /// Timeout for a single heartbeat request
    pub request_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            discovery_url: "http://localhost:9876".to_string(),
            heartbeat_path: "/heartbeat".to_string(),
            heartbeat_interval: Duration::from_secs(15),
            key: None,
            request_timeout: Duration::from_secs(5),
        }
    }
}

impl ClientConfig {
    pub fn new(discovery_url: impl Into<String>) -> Self {
        Self {
            discovery_url: discovery_url.into(),
            ..Default::default()
        }
    }

    pub fn heartbeat_path(mut self, path: impl Into<String>) -> Self {
        self.heartbeat_path = path.into();
        self
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Full URL heartbeats are posted to
    pub fn heartbeat_url(&self) -> String {
        format!(
            "{}{}",
            self.discovery_url.trim_end_matches('/'),
            normalize_path(&self.heartbeat_path)
        )
    }
}

/// Periodically announces one service instance to the discovery server
pub struct HeartbeatClient {
    config: ClientConfig,
    message: HeartbeatMessage,
    http: reqwest::Client,
}

impl HeartbeatClient {
    pub fn new(config: ClientConfig, message: HeartbeatMessage) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            config,
            message,
            http,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn message(&self) -> &HeartbeatMessage {
        &self.message
    }

    /// Post a single heartbeat
    pub async fn send_heartbeat(&self) -> Result<()> {
        let url = self.config.heartbeat_url();
        let mut request = self.http.post(&url).json(&self.message);
        if let Some(key) = &self.config.key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("Failed to send heartbeat to {}", url))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("Discovery server rejected heartbeat ({}): {}", status, body.trim());
        }

        debug!(
            "Heartbeat accepted for {} on {}",
            self.message.service_id, self.message.path
        );
        Ok(())
    }

    /// Send heartbeats until `shutdown` completes. The first one goes out immediately.
    pub async fn run<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let mut ticker = time::interval(self.config.heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        info!(
            "Starting heartbeats for {} every {:?}",
            self.message.service_id, self.config.heartbeat_interval
        );

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.send_heartbeat().await {
                        warn!("Heartbeat failed: {:#}", e);
                    }
                }
            }
        }

        info!("Stopped heartbeats for {}", self.message.service_id);
    }
}
