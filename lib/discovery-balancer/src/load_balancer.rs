//! Load balancing strategies for distributing traffic across registered services

use async_trait::async_trait;
use discovery_core::{CoreError, Result, ServiceRecord, ServiceRegistry};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// Load balancing strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadBalancingStrategy {
    /// Cycle through a path's services in registration order
    #[default]
    RoundRobin,
    /// Serve each service `weighted_use` times in a row before moving on
    WeightedRoundRobin,
}

impl fmt::Display for LoadBalancingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadBalancingStrategy::RoundRobin => write!(f, "round-robin"),
            LoadBalancingStrategy::WeightedRoundRobin => write!(f, "weighted-round-robin"),
        }
    }
}

impl FromStr for LoadBalancingStrategy {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "round-robin" | "round_robin" | "rr" => Ok(LoadBalancingStrategy::RoundRobin),
            "weighted-round-robin" | "weighted_round_robin" | "weighted" | "wrr" => {
                Ok(LoadBalancingStrategy::WeightedRoundRobin)
            }
            other => Err(CoreError::Validation(format!(
                "unknown load balancing strategy: {}",
                other
            ))),
        }
    }
}

/// Selects a service instance for a request path
#[async_trait]
pub trait LoadBalancer: Send + Sync {
    fn strategy(&self) -> LoadBalancingStrategy;

    fn registry(&self) -> &Arc<ServiceRegistry>;

    /// Admit (or refresh) a service
    async fn add_service(&self, record: ServiceRecord) -> Result<()>;

    async fn remove_service(&self, record: &ServiceRecord) -> Result<ServiceRecord> {
        self.registry()
            .deregister_service(&record.path, &record.service_id)
            .await
    }

    /// Pick the next service for `path`
    ///
    /// `Ok(None)` means the path is registered but currently has no services.
    async fn get_next_service(&self, path: &str) -> Result<Option<ServiceRecord>>;
}

/// Build the balancer for a strategy over a shared registry
pub fn build_balancer(
    strategy: LoadBalancingStrategy,
    registry: Arc<ServiceRegistry>,
) -> Arc<dyn LoadBalancer> {
    match strategy {
        LoadBalancingStrategy::RoundRobin => Arc::new(RoundRobinBalancer::new(registry)),
        LoadBalancingStrategy::WeightedRoundRobin => {
            Arc::new(WeightedRoundRobinBalancer::new(registry))
        }
    }
}

/// Round-robin with one cursor per registered path
pub struct RoundRobinBalancer {
    registry: Arc<ServiceRegistry>,
    cursors: Mutex<HashMap<String, usize>>,
}

impl RoundRobinBalancer {
    pub fn new(registry: Arc<ServiceRegistry>) -> Self {
        Self {
            registry,
            cursors: Mutex::new(HashMap::new()),
        }
    }

    /// Drop cursors for paths the registry no longer holds
    async fn prune_cursors(&self, cursors: &mut HashMap<String, usize>) {
        let mut stale = Vec::new();
        for path in cursors.keys() {
            if !self.is_registered(path).await {
                stale.push(path.clone());
            }
        }
        for path in stale {
            debug!("Dropping round-robin cursor for {}", path);
            cursors.remove(&path);
        }
    }

    async fn is_registered(&self, path: &str) -> bool {
        matches!(self.registry.resolve_path(path).await, Ok(resolved) if resolved == path)
    }
}

#[async_trait]
impl LoadBalancer for RoundRobinBalancer {
    fn strategy(&self) -> LoadBalancingStrategy {
        LoadBalancingStrategy::RoundRobin
    }

    fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    async fn add_service(&self, record: ServiceRecord) -> Result<()> {
        self.registry.register_service(record).await
    }

    async fn remove_service(&self, record: &ServiceRecord) -> Result<ServiceRecord> {
        let mut cursors = self.cursors.lock().await;
        let removed = self
            .registry
            .deregister_service(&record.path, &record.service_id)
            .await?;

        if self.registry.config().prune_empty_paths && !self.is_registered(&removed.path).await {
            cursors.remove(&removed.path);
        }
        Ok(removed)
    }

    async fn get_next_service(&self, path: &str) -> Result<Option<ServiceRecord>> {
        // held across the lookup so concurrent selections on a path never share an index
        let mut cursors = self.cursors.lock().await;
        let mut resolved = match self.registry.resolve_services(path).await {
            Ok(resolved) => resolved,
            Err(e @ CoreError::PathNotFound(_)) => {
                // paths pruned by the liveness sweep never pass through remove_service
                self.prune_cursors(&mut cursors).await;
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        if resolved.services.is_empty() {
            debug!("No services available under {}", resolved.path);
            return Ok(None);
        }

        let len = resolved.services.len();
        let cursor = cursors.entry(resolved.path).or_insert(0);
        let index = *cursor % len;
        *cursor = (index + 1) % len;

        let selected = resolved.services.swap_remove(index);
        debug!(
            "Selected service {} ({}) for {}",
            selected.service_id,
            selected.address(),
            path
        );
        Ok(Some(selected))
    }
}

/// Weighted round-robin driven by each record's `current_use`/`weighted_use`
pub struct WeightedRoundRobinBalancer {
    registry: Arc<ServiceRegistry>,
    selection: Mutex<()>,
}

impl WeightedRoundRobinBalancer {
    pub fn new(registry: Arc<ServiceRegistry>) -> Self {
        Self {
            registry,
            selection: Mutex::new(()),
        }
    }

    fn validate(record: &ServiceRecord) -> Result<()> {
        if record.weighted_use < 1 {
            return Err(CoreError::Validation(format!(
                "weightedUse must be at least 1, got {}",
                record.weighted_use
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl LoadBalancer for WeightedRoundRobinBalancer {
    fn strategy(&self) -> LoadBalancingStrategy {
        LoadBalancingStrategy::WeightedRoundRobin
    }

    fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    async fn add_service(&self, record: ServiceRecord) -> Result<()> {
        Self::validate(&record)?;
        self.registry.register_service(record).await
    }

    async fn get_next_service(&self, path: &str) -> Result<Option<ServiceRecord>> {
        let _selection = self.selection.lock().await;
        let services = self.registry.get_services_by_path(path).await?;

        if services.is_empty() {
            debug!("No services available for {}", path);
            return Ok(None);
        }

        for service in &services {
            match self.registry.is_service_weight_full(&service.service_id).await {
                Ok(true) => continue,
                Ok(false) => {
                    self.registry
                        .update_service_current_use(&service.service_id)
                        .await;
                    let mut selected = service.clone();
                    selected.current_use += 1;
                    return Ok(Some(selected));
                }
                // evicted since the snapshot was taken
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            }
        }

        // every service is at capacity: start a fresh cycle
        for service in &services {
            self.registry.reset_current_use(&service.service_id).await;
        }

        let mut first = services
            .into_iter()
            .next()
            .ok_or_else(|| CoreError::PathNotFound(path.to_string()))?;
        self.registry
            .update_service_current_use(&first.service_id)
            .await;
        first.current_use = 1;

        debug!("Weighted cycle reset for {}, serving {}", path, first.service_id);
        Ok(Some(first))
    }
}
