//! Service registry indexed by path and by service id

use crate::clock::{Clock, SystemClock};
use crate::path::{normalize_path, PathMatcher};
use crate::{CoreError, Result, ServiceRecord};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

/// Registry behaviour knobs
#[derive(Clone, Debug)]
pub struct RegistryConfig {
    /// Slack added to the sweep interval before a silent service is evicted
    pub heartbeat_grace: Duration,
    /// Drop a path key (and its matcher entry) once its last service leaves
    pub prune_empty_paths: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            heartbeat_grace: Duration::from_secs(1),
            prune_empty_paths: true,
        }
    }
}

impl RegistryConfig {
    pub fn heartbeat_grace(mut self, grace: Duration) -> Self {
        self.heartbeat_grace = grace;
        self
    }

    pub fn prune_empty_paths(mut self, prune: bool) -> Self {
        self.prune_empty_paths = prune;
        self
    }
}

/// A request path resolved to its registered path
#[derive(Clone, Debug)]
pub struct ResolvedPath {
    pub path: String,
    /// Services in registration order
    pub services: Vec<ServiceRecord>,
}

/// Records live in `slots`; both tables hold slot indices into it.
#[derive(Debug, Default)]
struct RegistryState {
    slots: Vec<Option<ServiceRecord>>,
    free: Vec<usize>,
    path_table: HashMap<String, Vec<usize>>,
    id_table: HashMap<String, usize>,
    matcher: PathMatcher,
}

impl RegistryState {
    fn insert(&mut self, record: ServiceRecord) -> usize {
        match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Some(record);
                slot
            }
            None => {
                self.slots.push(Some(record));
                self.slots.len() - 1
            }
        }
    }

    fn record(&self, slot: usize) -> Option<&ServiceRecord> {
        self.slots.get(slot).and_then(Option::as_ref)
    }

    fn record_mut(&mut self, slot: usize) -> Option<&mut ServiceRecord> {
        self.slots.get_mut(slot).and_then(Option::as_mut)
    }

    fn record_by_id_mut(&mut self, service_id: &str) -> Option<&mut ServiceRecord> {
        let slot = *self.id_table.get(service_id)?;
        self.record_mut(slot)
    }

    fn records_for(&self, path: &str) -> Vec<ServiceRecord> {
        self.path_table
            .get(path)
            .map(|slots| {
                slots
                    .iter()
                    .filter_map(|slot| self.record(*slot).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn rebuild_matcher(&mut self) {
        self.matcher = PathMatcher::from_paths(self.path_table.keys());
    }

    /// Unlink a record from both tables and free its slot
    fn remove(&mut self, slot: usize, prune_empty_paths: bool) -> Option<ServiceRecord> {
        let record = self.slots.get_mut(slot)?.take()?;
        self.id_table.remove(&record.service_id);
        self.free.push(slot);

        let emptied = match self.path_table.get_mut(&record.path) {
            Some(slots) => {
                slots.retain(|s| *s != slot);
                slots.is_empty()
            }
            None => false,
        };

        if emptied && prune_empty_paths {
            self.path_table.remove(&record.path);
            self.rebuild_matcher();
        }

        Some(record)
    }
}

/// ServiceRegistry tracks live service instances under their logical paths
pub struct ServiceRegistry {
    state: RwLock<RegistryState>,
    config: RegistryConfig,
    clock: Arc<dyn Clock>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::with_config(RegistryConfig::default())
    }

    pub fn with_config(config: RegistryConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: RegistryConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
            config,
            clock,
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Register a new service or refresh an existing one
    ///
    /// A heartbeat for a known id refreshes its address and heartbeat stamp in
    /// place. If the id shows up under a different path it is moved there.
    pub async fn register_service(&self, mut record: ServiceRecord) -> Result<()> {
        record.validate()?;
        record.path = normalize_path(&record.path);
        let now = self.clock.now();

        let mut guard = self.state.write().await;
        let state = &mut *guard;

        if let Some(&slot) = state.id_table.get(&record.service_id) {
            if let Some(existing) = state.record_mut(slot) {
                if existing.path == record.path {
                    existing.last_heartbeat = now;
                    existing.ip = record.ip;
                    existing.port = record.port;
                    debug!("Heartbeat from service: {} ({})", existing.service_id, existing.path);
                    return Ok(());
                }
            }

            if let Some(previous) = state.remove(slot, self.config.prune_empty_paths) {
                debug!(
                    "Service {} moved from {} to {}",
                    previous.service_id, previous.path, record.path
                );
            }
        }

        record.last_heartbeat = now;
        record.current_use = 0;
        record.is_healthy = true;

        let path = record.path.clone();
        let service_id = record.service_id.clone();
        let slot = state.insert(record);
        state.id_table.insert(service_id.clone(), slot);

        let is_new_path = !state.path_table.contains_key(&path);
        state.path_table.entry(path.clone()).or_default().push(slot);
        if is_new_path {
            state.rebuild_matcher();
        }

        info!("Registered service: {} at {}", service_id, path);
        Ok(())
    }

    /// Resolve a request path and return the registered path with its services
    pub async fn resolve_services(&self, request_path: &str) -> Result<ResolvedPath> {
        let state = self.state.read().await;
        let path = state
            .matcher
            .resolve(request_path)
            .ok_or_else(|| CoreError::PathNotFound(request_path.to_string()))?
            .to_string();
        let services = state.records_for(&path);
        Ok(ResolvedPath { path, services })
    }

    /// Registered path that a request path resolves to
    pub async fn resolve_path(&self, request_path: &str) -> Result<String> {
        let state = self.state.read().await;
        state
            .matcher
            .resolve(request_path)
            .map(str::to_string)
            .ok_or_else(|| CoreError::PathNotFound(request_path.to_string()))
    }

    /// Services behind the registered path a request path resolves to
    ///
    /// The result may be empty when empty paths are retained.
    pub async fn get_services_by_path(&self, request_path: &str) -> Result<Vec<ServiceRecord>> {
        self.resolve_services(request_path)
            .await
            .map(|resolved| resolved.services)
    }

    pub async fn get_service_by_id(&self, service_id: &str) -> Result<ServiceRecord> {
        let state = self.state.read().await;
        state
            .id_table
            .get(service_id)
            .and_then(|slot| state.record(*slot))
            .cloned()
            .ok_or_else(|| CoreError::ServiceNotFound(service_id.to_string()))
    }

    /// Snapshot of every registered service, in no particular order
    pub async fn get_services(&self) -> Vec<ServiceRecord> {
        let state = self.state.read().await;
        state.slots.iter().flatten().cloned().collect()
    }

    /// Remove a service filed under `path`
    pub async fn deregister_service(&self, path: &str, service_id: &str) -> Result<ServiceRecord> {
        let path = normalize_path(path);

        let mut guard = self.state.write().await;
        let state = &mut *guard;

        let filed = state
            .path_table
            .get(&path)
            .ok_or_else(|| CoreError::PathNotFound(path.clone()))?;
        let slot = *state
            .id_table
            .get(service_id)
            .ok_or_else(|| CoreError::ServiceNotFound(service_id.to_string()))?;

        if !filed.contains(&slot) {
            return Err(CoreError::PathMismatch {
                path,
                service_id: service_id.to_string(),
            });
        }

        let record = state
            .remove(slot, self.config.prune_empty_paths)
            .ok_or_else(|| CoreError::ServiceNotFound(service_id.to_string()))?;

        info!("Deregistered service: {} from {}", service_id, path);
        Ok(record)
    }

    /// Count one more weighted selection, capped at the service's weight
    pub async fn update_service_current_use(&self, service_id: &str) {
        let mut state = self.state.write().await;
        if let Some(record) = state.record_by_id_mut(service_id) {
            if record.current_use < record.weighted_use {
                record.current_use += 1;
            }
        }
    }

    pub async fn reset_current_use(&self, service_id: &str) {
        let mut state = self.state.write().await;
        if let Some(record) = state.record_by_id_mut(service_id) {
            record.current_use = 0;
        }
    }

    pub async fn is_service_weight_full(&self, service_id: &str) -> Result<bool> {
        let state = self.state.read().await;
        state
            .id_table
            .get(service_id)
            .and_then(|slot| state.record(*slot))
            .map(ServiceRecord::is_weight_full)
            .ok_or_else(|| CoreError::ServiceNotFound(service_id.to_string()))
    }

    /// Evict every service whose last heartbeat is older than `interval` plus grace
    pub async fn sweep_expired(&self, interval: Duration) -> Vec<ServiceRecord> {
        let now = self.clock.now();
        let ttl = chrono::Duration::from_std(interval + self.config.heartbeat_grace)
            .unwrap_or(chrono::Duration::MAX);

        let mut guard = self.state.write().await;
        let state = &mut *guard;

        let expired: Vec<usize> = state
            .slots
            .iter()
            .enumerate()
            .filter_map(|(slot, record)| {
                let record = record.as_ref()?;
                let deadline = record.last_heartbeat.checked_add_signed(ttl)?;
                (deadline < now).then_some(slot)
            })
            .collect();

        expired
            .into_iter()
            .filter_map(|slot| state.remove(slot, self.config.prune_empty_paths))
            .collect()
    }

    /// Sweep on a fixed tick until `shutdown` completes
    pub async fn refresh_registry<F>(&self, interval: Duration, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        self.refresh_registry_with(interval, shutdown, |_| {}).await
    }

    /// Like [`refresh_registry`](Self::refresh_registry), reporting each batch of evictions
    pub async fn refresh_registry_with<F, E>(&self, interval: Duration, shutdown: F, mut on_evict: E)
    where
        F: Future<Output = ()>,
        E: FnMut(&[ServiceRecord]),
    {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        info!("Liveness sweep started with interval: {:?}", interval);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Liveness sweep stopped");
                    return;
                }
                _ = ticker.tick() => {
                    let evicted = self.sweep_expired(interval).await;
                    if !evicted.is_empty() {
                        for record in &evicted {
                            info!("Evicted silent service: {} from {}", record.service_id, record.path);
                        }
                        on_evict(&evicted);
                    }
                }
            }
        }
    }

    /// Spawn the liveness sweep as a background task
    pub fn spawn_refresh_task<F>(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: F,
    ) -> tokio::task::JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let registry = Arc::clone(self);
        tokio::spawn(async move { registry.refresh_registry(interval, shutdown).await })
    }

    pub async fn service_count(&self) -> usize {
        self.state.read().await.id_table.len()
    }

    pub async fn path_count(&self) -> usize {
        self.state.read().await.path_table.len()
    }

    /// Registered paths, longest first
    pub async fn paths(&self) -> Vec<String> {
        self.state.read().await.matcher.paths().to_vec()
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::Utc;

    fn record(id: &str, path: &str, port: &str) -> ServiceRecord {
        ServiceRecord::new(id, path, "127.0.0.1", port)
    }

    fn manual_registry(config: RegistryConfig) -> (ServiceRegistry, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let registry = ServiceRegistry::with_clock(config, clock.clone());
        (registry, clock)
    }

    /// Both tables must point at the same live records
    async fn assert_consistent(registry: &ServiceRegistry) {
        let state = registry.state.read().await;

        for (id, slot) in &state.id_table {
            let record = state.record(*slot).expect("id points at an empty slot");
            assert_eq!(&record.service_id, id);

            let homes: Vec<&String> = state
                .path_table
                .iter()
                .filter(|(_, slots)| slots.contains(slot))
                .map(|(path, _)| path)
                .collect();
            assert_eq!(homes, vec![&record.path], "record filed under wrong paths");
        }

        for slots in state.path_table.values() {
            for slot in slots {
                let record = state.record(*slot).expect("path points at an empty slot");
                assert_eq!(state.id_table.get(&record.service_id), Some(slot));
            }
        }

        let live = state.slots.iter().flatten().count();
        assert_eq!(live, state.id_table.len());
        assert_eq!(state.matcher.len(), state.path_table.len());
    }

    #[tokio::test]
    async fn test_register_and_lookup() {
        let registry = ServiceRegistry::new();
        registry.register_service(record("s1", "/users", "4000")).await.unwrap();
        registry.register_service(record("s2", "/users", "5000")).await.unwrap();
        registry.register_service(record("s3", "/orders", "6000")).await.unwrap();

        let users = registry.get_services_by_path("/users/42").await.unwrap();
        let ids: Vec<&str> = users.iter().map(|s| s.service_id.as_str()).collect();
        assert_eq!(ids, vec!["s1", "s2"]);

        let s3 = registry.get_service_by_id("s3").await.unwrap();
        assert_eq!(s3.path, "/orders");
        assert!(s3.is_healthy);

        assert_eq!(registry.get_services().await.len(), 3);
        assert_eq!(registry.service_count().await, 3);
        assert_eq!(registry.path_count().await, 2);
        assert_consistent(&registry).await;
    }

    #[tokio::test]
    async fn test_register_rejects_missing_fields() {
        let registry = ServiceRegistry::new();

        let err = registry
            .register_service(record("s1", "", "4000"))
            .await
            .unwrap_err();
        assert!(err.is_validation());

        let err = registry
            .register_service(record("s1", "/users", ""))
            .await
            .unwrap_err();
        assert!(err.is_validation());

        assert_eq!(registry.service_count().await, 0);
    }

    #[tokio::test]
    async fn test_path_normalization() {
        let registry = ServiceRegistry::new();
        registry.register_service(record("s1", "hello/", "4000")).await.unwrap();
        registry.register_service(record("s2", "/hello", "5000")).await.unwrap();

        assert_eq!(registry.paths().await, vec!["/hello".to_string()]);
        let services = registry.get_services_by_path("/hello").await.unwrap();
        assert_eq!(services.len(), 2);
        assert!(services.iter().all(|s| s.path == "/hello"));
    }

    #[tokio::test]
    async fn test_reregistration_updates_in_place() {
        let (registry, clock) = manual_registry(RegistryConfig::default());
        registry.register_service(record("s1", "/users", "4000")).await.unwrap();
        registry.register_service(record("s2", "/users", "5000")).await.unwrap();
        let first_seen = registry.get_service_by_id("s1").await.unwrap().last_heartbeat;

        clock.advance(chrono::Duration::seconds(5));
        let moved = ServiceRecord::new("s1", "/users/", "10.0.0.9", "4100");
        registry.register_service(moved).await.unwrap();

        let services = registry.get_services_by_path("/users").await.unwrap();
        assert_eq!(services.len(), 2);
        assert_eq!(services[0].service_id, "s1");
        assert_eq!(services[0].ip, "10.0.0.9");
        assert_eq!(services[0].port, "4100");
        assert_eq!(
            services[0].last_heartbeat,
            first_seen + chrono::Duration::seconds(5)
        );
        assert_eq!(services[1].service_id, "s2");
        assert_consistent(&registry).await;
    }

    #[tokio::test]
    async fn test_id_moving_to_new_path() {
        let registry = ServiceRegistry::new();
        registry.register_service(record("s1", "/users", "4000")).await.unwrap();
        registry.register_service(record("s1", "/accounts", "4000")).await.unwrap();

        assert_eq!(registry.service_count().await, 1);
        assert_eq!(
            registry.get_service_by_id("s1").await.unwrap().path,
            "/accounts"
        );
        assert!(matches!(
            registry.get_services_by_path("/users").await,
            Err(CoreError::PathNotFound(_))
        ));
        assert_consistent(&registry).await;
    }

    #[tokio::test]
    async fn test_deregister_errors() {
        let registry = ServiceRegistry::new();
        registry.register_service(record("s1", "/users", "4000")).await.unwrap();
        registry.register_service(record("s2", "/orders", "5000")).await.unwrap();

        assert!(matches!(
            registry.deregister_service("/missing", "s1").await,
            Err(CoreError::PathNotFound(_))
        ));
        assert!(matches!(
            registry.deregister_service("/users", "ghost").await,
            Err(CoreError::ServiceNotFound(_))
        ));
        assert!(matches!(
            registry.deregister_service("/users", "s2").await,
            Err(CoreError::PathMismatch { .. })
        ));

        assert_eq!(registry.service_count().await, 2);
        assert_consistent(&registry).await;
    }

    #[tokio::test]
    async fn test_resolve_path_prefers_longest_prefix() {
        let registry = ServiceRegistry::new();
        registry.register_service(record("s1", "/api", "4000")).await.unwrap();
        registry.register_service(record("s2", "/api/v2", "5000")).await.unwrap();

        assert_eq!(registry.resolve_path("/api/v2/users").await.unwrap(), "/api/v2");
        assert_eq!(registry.resolve_path("api/v1/").await.unwrap(), "/api");
        assert!(matches!(
            registry.resolve_path("/orders").await,
            Err(CoreError::PathNotFound(_))
        ));
        assert!(registry.config().prune_empty_paths);
    }

    #[tokio::test]
    async fn test_deregister_prunes_empty_path() {
        let registry = ServiceRegistry::new();
        registry.register_service(record("s1", "/users", "4000")).await.unwrap();

        let removed = registry.deregister_service("users/", "s1").await.unwrap();
        assert_eq!(removed.service_id, "s1");

        assert!(registry.get_service_by_id("s1").await.is_err());
        assert!(matches!(
            registry.get_services_by_path("/users").await,
            Err(CoreError::PathNotFound(_))
        ));
        assert_eq!(registry.path_count().await, 0);
        assert_consistent(&registry).await;
    }

    #[tokio::test]
    async fn test_empty_path_retained_when_configured() {
        let registry = ServiceRegistry::with_config(RegistryConfig::default().prune_empty_paths(false));
        registry.register_service(record("s1", "/users", "4000")).await.unwrap();
        registry.deregister_service("/users", "s1").await.unwrap();

        assert!(!registry.config().prune_empty_paths);
        let resolved = registry.resolve_services("/users/1").await.unwrap();
        assert_eq!(resolved.path, "/users");
        assert!(resolved.services.is_empty());
        assert_eq!(registry.resolve_path("/users/1").await.unwrap(), "/users");
        assert!(matches!(
            registry.get_services_by_path("/orders").await,
            Err(CoreError::PathNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_slots_are_reused() {
        let registry = ServiceRegistry::new();
        registry.register_service(record("s1", "/users", "4000")).await.unwrap();
        registry.register_service(record("s2", "/users", "5000")).await.unwrap();
        registry.deregister_service("/users", "s1").await.unwrap();
        registry.register_service(record("s3", "/users", "6000")).await.unwrap();

        assert_eq!(registry.state.read().await.slots.len(), 2);
        let ids: Vec<String> = registry
            .get_services_by_path("/users")
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.service_id)
            .collect();
        assert_eq!(ids, vec!["s2".to_string(), "s3".to_string()]);
        assert_consistent(&registry).await;
    }

    #[tokio::test]
    async fn test_index_consistency_under_churn() {
        let registry = ServiceRegistry::new();
        let paths = ["/a", "/a/b", "/c", "d/"];
        let mut seed: u64 = 0x2545_f491_4f6c_dd1d;

        for step in 0..400 {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;

            let id = format!("svc-{}", seed % 12);
            let path = paths[(seed >> 8) as usize % paths.len()];

            if seed % 3 == 0 {
                let _ = registry.deregister_service(path, &id).await;
            } else {
                registry
                    .register_service(record(&id, path, &step.to_string()))
                    .await
                    .unwrap();
            }
            assert_consistent(&registry).await;
        }
    }

    #[tokio::test]
    async fn test_weighted_counters() {
        let registry = ServiceRegistry::new();
        registry
            .register_service(record("s1", "/users", "4000").with_weight(2))
            .await
            .unwrap();

        assert!(!registry.is_service_weight_full("s1").await.unwrap());
        registry.update_service_current_use("s1").await;
        registry.update_service_current_use("s1").await;
        registry.update_service_current_use("s1").await;
        assert!(registry.is_service_weight_full("s1").await.unwrap());
        assert_eq!(registry.get_service_by_id("s1").await.unwrap().current_use, 2);

        registry.reset_current_use("s1").await;
        assert_eq!(registry.get_service_by_id("s1").await.unwrap().current_use, 0);

        // unknown ids are ignored except by the query
        registry.update_service_current_use("ghost").await;
        registry.reset_current_use("ghost").await;
        assert!(matches!(
            registry.is_service_weight_full("ghost").await,
            Err(CoreError::ServiceNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_sweep_evicts_silent_services() {
        let (registry, clock) = manual_registry(RegistryConfig::default());
        registry.register_service(record("stale", "/users", "4000")).await.unwrap();
        registry.register_service(record("lonely", "/orders", "4500")).await.unwrap();

        clock.advance(chrono::Duration::seconds(20));
        registry.register_service(record("fresh", "/users", "5000")).await.unwrap();

        let evicted = registry.sweep_expired(Duration::from_secs(15)).await;
        let mut ids: Vec<String> = evicted.into_iter().map(|s| s.service_id).collect();
        ids.sort();
        assert_eq!(ids, vec!["lonely".to_string(), "stale".to_string()]);

        assert!(registry.get_service_by_id("stale").await.is_err());
        let users = registry.get_services_by_path("/users").await.unwrap();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].service_id, "fresh");
        assert!(registry.get_services_by_path("/orders").await.is_err());
        assert_consistent(&registry).await;
    }

    #[tokio::test]
    async fn test_sweep_keeps_services_within_grace() {
        let (registry, clock) = manual_registry(RegistryConfig::default());
        registry.register_service(record("s1", "/users", "4000")).await.unwrap();

        clock.advance(chrono::Duration::milliseconds(15_500));
        assert!(registry.sweep_expired(Duration::from_secs(15)).await.is_empty());

        clock.advance(chrono::Duration::seconds(1));
        assert_eq!(registry.sweep_expired(Duration::from_secs(15)).await.len(), 1);
    }

    #[tokio::test]
    async fn test_refresh_registry_until_shutdown() {
        let (registry, clock) = manual_registry(RegistryConfig::default().heartbeat_grace(Duration::ZERO));
        let registry = Arc::new(registry);
        registry.register_service(record("s1", "/users", "4000")).await.unwrap();
        clock.advance(chrono::Duration::seconds(60));

        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let handle = registry.spawn_refresh_task(Duration::from_millis(20), async move {
            let _ = stop_rx.await;
        });

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(registry.service_count().await, 0);

        stop_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("sweep did not stop")
            .unwrap();
    }

    #[tokio::test]
    async fn test_refresh_registry_reports_evictions() {
        let (registry, clock) = manual_registry(RegistryConfig::default());
        registry.register_service(record("s1", "/users", "4000")).await.unwrap();
        registry.register_service(record("s2", "/users", "5000")).await.unwrap();
        clock.advance(chrono::Duration::seconds(60));

        let mut reported = 0;
        registry
            .refresh_registry_with(
                Duration::from_millis(10),
                tokio::time::sleep(Duration::from_millis(80)),
                |evicted| reported += evicted.len(),
            )
            .await;

        assert_eq!(reported, 2);
        assert_eq!(registry.service_count().await, 0);
    }
}
