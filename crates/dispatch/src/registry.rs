//! Per-user dispatchers sharing one breaker, accelerator and worker pool.

use std::sync::Arc;

use amas_bandit::LinUcbModel;
use amas_core::config::BanditConfig;
use amas_core::{EngineConfig, EngineResult};
use amas_resilience::{CircuitBreaker, CircuitBreakerConfig};
use amas_workers::{KernelOffload, OffloadConfig, WorkerPoolConfig, WorkerPoolHandle};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::info;

use crate::backends::batched::NdarrayAccelerator;
use crate::dispatcher::{BanditBackend, BanditDispatcher};

pub type SharedDispatcher = Arc<Mutex<BanditDispatcher>>;

/// Lazily created dispatcher per user id.
///
/// Each dispatcher sits behind its own async mutex, so concurrent requests
/// for one user are applied one at a time while different users proceed in
/// parallel.
pub struct DispatcherRegistry {
    dispatchers: DashMap<String, SharedDispatcher>,
    bandit: BanditConfig,
    backend: BanditBackend,
    breaker: Arc<CircuitBreaker>,
    offload: Arc<KernelOffload>,
    pool: Option<Arc<WorkerPoolHandle>>,
}

impl DispatcherRegistry {
    pub fn new(
        bandit: BanditConfig,
        backend: BanditBackend,
        breaker: Arc<CircuitBreaker>,
        offload: Arc<KernelOffload>,
        pool: Option<Arc<WorkerPoolHandle>>,
    ) -> Self {
        Self {
            dispatchers: DashMap::new(),
            bandit,
            backend,
            breaker,
            offload,
            pool,
        }
    }

    /// Wire the shared pieces from configuration. The worker pool is created
    /// but not started; it starts on the first offloaded task.
    pub fn from_config(config: &EngineConfig) -> EngineResult<Self> {
        config.validate()?;

        let backend = if config.accelerator.use_accelerated {
            BanditBackend::Accelerated(Arc::new(NdarrayAccelerator::new()))
        } else {
            BanditBackend::Reference
        };
        let breaker = Arc::new(CircuitBreaker::new(
            "amas.dispatch",
            CircuitBreakerConfig::from(&config.circuit),
        ));
        let pool = config
            .worker
            .use_worker
            .then(|| Arc::new(WorkerPoolHandle::new(WorkerPoolConfig::from(&config.worker))));
        let offload = Arc::new(KernelOffload::new(
            OffloadConfig::from(&config.worker),
            pool.clone(),
        ));

        info!(
            backend = backend.name(),
            dimension = config.bandit.dimension,
            worker = pool.is_some(),
            "dispatcher registry ready"
        );
        Ok(Self::new(config.bandit.clone(), backend, breaker, offload, pool))
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn offload(&self) -> &Arc<KernelOffload> {
        &self.offload
    }

    pub fn pool(&self) -> Option<&Arc<WorkerPoolHandle>> {
        self.pool.as_ref()
    }

    fn create(&self) -> EngineResult<BanditDispatcher> {
        Ok(BanditDispatcher::new(
            LinUcbModel::from_config(&self.bandit)?,
            self.backend.clone(),
            Arc::clone(&self.breaker),
            Arc::clone(&self.offload),
        ))
    }

    pub fn get_or_create(&self, user_id: &str) -> EngineResult<SharedDispatcher> {
        if let Some(existing) = self.dispatchers.get(user_id) {
            return Ok(Arc::clone(existing.value()));
        }
        match self.dispatchers.entry(user_id.to_string()) {
            Entry::Occupied(entry) => Ok(Arc::clone(entry.get())),
            Entry::Vacant(entry) => {
                let dispatcher = Arc::new(Mutex::new(self.create()?));
                entry.insert(Arc::clone(&dispatcher));
                Ok(dispatcher)
            }
        }
    }

    pub fn get(&self, user_id: &str) -> Option<SharedDispatcher> {
        self.dispatchers.get(user_id).map(|d| Arc::clone(d.value()))
    }

    pub fn remove(&self, user_id: &str) -> Option<SharedDispatcher> {
        self.dispatchers.remove(user_id).map(|(_, d)| d)
    }

    pub fn len(&self) -> usize {
        self.dispatchers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dispatchers.is_empty()
    }

    pub fn user_ids(&self) -> Vec<String> {
        self.dispatchers.iter().map(|e| e.key().clone()).collect()
    }

    /// Drop every dispatcher and stop the worker pool.
    pub async fn shutdown(&self) {
        let count = self.dispatchers.len();
        self.dispatchers.clear();
        if let Some(pool) = &self.pool {
            pool.destroy().await;
        }
        info!(dispatchers = count, "dispatcher registry shut down");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.bandit.dimension = 4;
        config.worker.use_worker = false;
        config
    }

    #[tokio::test]
    async fn test_same_user_gets_same_dispatcher() {
        let registry = DispatcherRegistry::from_config(&config()).unwrap();
        let a = registry.get_or_create("u1").unwrap();
        let b = registry.get_or_create("u1").unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        registry.get_or_create("u2").unwrap();
        assert_eq!(registry.len(), 2);

        let mut ids = registry.user_ids();
        ids.sort();
        assert_eq!(ids, vec!["u1".to_string(), "u2".to_string()]);
    }

    #[tokio::test]
    async fn test_users_are_isolated_but_share_breaker() {
        let registry = DispatcherRegistry::from_config(&config()).unwrap();
        let u1 = registry.get_or_create("u1").unwrap();
        let u2 = registry.get_or_create("u2").unwrap();

        u1.lock()
            .await
            .update_with_feature_vector(&[1.0, 0.0, 0.0, 1.0], 1.0)
            .await
            .unwrap();
        assert_eq!(u1.lock().await.model().update_count(), 1);
        assert_eq!(u2.lock().await.model().update_count(), 0);

        registry.breaker().force_open("test");
        assert_eq!(
            u2.lock().await.stats().circuit_state,
            amas_core::event_bus::CircuitState::Open
        );
    }

    #[tokio::test]
    async fn test_remove_and_shutdown() {
        let mut cfg = config();
        cfg.worker.use_worker = true;
        let registry = DispatcherRegistry::from_config(&cfg).unwrap();
        registry.get_or_create("u1").unwrap();
        assert!(registry.remove("u1").is_some());
        assert!(registry.get("u1").is_none());
        assert!(registry.is_empty());

        registry.pool().unwrap().start().unwrap();
        registry.shutdown().await;
        assert!(!registry.pool().unwrap().is_running());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut cfg = config();
        cfg.bandit.lambda = -1.0;
        assert!(DispatcherRegistry::from_config(&cfg).is_err());
    }
}
