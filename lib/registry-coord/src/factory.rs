//! Builds and memoizes registry stacks per registry address
//!
//! `direct://` addresses get a static registry; every other scheme is
//! resolved through a `CoordinationConnector` and wrapped as
//! failback → command routing → coordination backend.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use registry_core::base::watch_heartbeat_switcher;
use registry_core::url::{params, DEFAULT_CONNECT_TIMEOUT_MS, DEFAULT_SESSION_TIMEOUT_MS};
use registry_core::{
    BaseRegistry, CommandRegistry, DirectRegistry, FailbackRegistry, Registry, RegistryError,
    Result, RetryScheduler, SwitcherService, Url,
};

use crate::coordination::CoordinationRegistry;
use crate::memory::{MemorySession, MemoryStore};
use crate::store::CoordinationClient;

pub const DIRECT_SCHEME: &str = "direct";
pub const MEMORY_SCHEME: &str = "memory";

/// Opens coordination sessions for one registry scheme
#[async_trait]
pub trait CoordinationConnector: Send + Sync {
    async fn connect(&self, registry_url: &Url) -> Result<Arc<dyn CoordinationClient>>;
}

/// Connector for `memory://` addresses: one shared store per address
#[derive(Default)]
pub struct MemoryConnector {
    stores: DashMap<String, MemoryStore>,
    sessions: DashMap<String, Vec<Arc<MemorySession>>>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self, registry_url: &Url) -> MemoryStore {
        self.stores
            .entry(registry_url.identity())
            .or_default()
            .clone()
    }

    /// Sessions handed out for an address, oldest first
    pub fn sessions(&self, registry_url: &Url) -> Vec<Arc<MemorySession>> {
        self.sessions
            .get(&registry_url.identity())
            .map(|s| s.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl CoordinationConnector for MemoryConnector {
    async fn connect(&self, registry_url: &Url) -> Result<Arc<dyn CoordinationClient>> {
        let session = self.store(registry_url).connect();
        debug!(
            address = %registry_url.identity(),
            session_timeout_ms = registry_url.u64_parameter(params::SESSION_TIMEOUT, DEFAULT_SESSION_TIMEOUT_MS),
            "connected memory session"
        );
        self.sessions
            .entry(registry_url.identity())
            .or_default()
            .push(session.clone());
        Ok(session)
    }
}

/// Canonical address a registry instance is memoized under
pub fn registry_key(registry_url: &Url) -> String {
    let mut key = format!("{}://{}", registry_url.protocol(), registry_url.identity());
    if let Some(address) = registry_url.parameter(params::ADDRESS) {
        key.push_str("?address=");
        key.push_str(address);
    }
    key
}

pub struct RegistryFactory {
    registries: DashMap<String, Arc<OnceCell<Arc<dyn Registry>>>>,
    connectors: DashMap<String, Arc<dyn CoordinationConnector>>,
    scheduler: RetryScheduler,
    switcher: Arc<dyn SwitcherService>,
}

impl RegistryFactory {
    /// Starts the shared retry worker; call from inside a tokio runtime.
    /// `memory://` is available out of the box.
    pub fn new(switcher: Arc<dyn SwitcherService>) -> Self {
        let connectors: DashMap<String, Arc<dyn CoordinationConnector>> = DashMap::new();
        connectors.insert(MEMORY_SCHEME.to_string(), Arc::new(MemoryConnector::new()));
        Self {
            registries: DashMap::new(),
            connectors,
            scheduler: RetryScheduler::start(),
            switcher,
        }
    }

    pub fn with_connector(
        self,
        scheme: impl Into<String>,
        connector: Arc<dyn CoordinationConnector>,
    ) -> Self {
        self.connectors.insert(scheme.into(), connector);
        self
    }

    pub fn switcher(&self) -> &Arc<dyn SwitcherService> {
        &self.switcher
    }

    pub fn scheduler(&self) -> &RetryScheduler {
        &self.scheduler
    }

    pub fn registry_count(&self) -> usize {
        self.registries
            .iter()
            .filter(|e| e.value().initialized())
            .count()
    }

    /// The registry for `registry_url`, created on first use. Concurrent
    /// callers for one address share a single instance; different addresses
    /// are created independently.
    pub async fn get_registry(&self, registry_url: &Url) -> Result<Arc<dyn Registry>> {
        let key = registry_key(registry_url);
        let cell = self
            .registries
            .entry(key.clone())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        let registry = cell
            .get_or_try_init(|| async {
                let registry = self.create_registry(registry_url).await?;
                info!(registry = %key, "registry created");
                Ok::<_, RegistryError>(registry)
            })
            .await?;
        Ok(registry.clone())
    }

    async fn create_registry(&self, registry_url: &Url) -> Result<Arc<dyn Registry>> {
        let registry: Arc<dyn Registry> = match registry_url.protocol() {
            DIRECT_SCHEME => Arc::new(BaseRegistry::new(
                registry_url.clone(),
                DirectRegistry::new(registry_url)?,
                self.switcher.clone(),
            )),
            scheme => {
                let connector = self
                    .connectors
                    .get(scheme)
                    .map(|c| c.clone())
                    .ok_or_else(|| RegistryError::UnsupportedProtocol(scheme.to_string()))?;
                let timeout = Duration::from_millis(
                    registry_url.u64_parameter(params::CONNECT_TIMEOUT, DEFAULT_CONNECT_TIMEOUT_MS),
                );
                let client = tokio::time::timeout(timeout, connector.connect(registry_url))
                    .await
                    .map_err(|_| {
                        RegistryError::Backend(format!(
                            "connecting to {} timed out after {:?}",
                            registry_url.identity(),
                            timeout
                        ))
                    })??;

                let backend = CoordinationRegistry::new(registry_url.clone(), client);
                let ops = CommandRegistry::new(backend, self.switcher.clone());
                let base = BaseRegistry::new(registry_url.clone(), ops, self.switcher.clone());
                FailbackRegistry::new(base, &self.scheduler)
            }
        };

        watch_heartbeat_switcher(&registry, self.switcher.as_ref());
        Ok(registry)
    }

    /// Stop the retry worker and forget every registry
    pub async fn shutdown(&self) {
        self.scheduler.stop().await;
        self.registries.clear();
        info!("registry factory shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use registry_core::LocalSwitcherService;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct SlowConnector {
        delay: Duration,
        calls: AtomicUsize,
        inner: MemoryConnector,
    }

    #[async_trait]
    impl CoordinationConnector for SlowConnector {
        async fn connect(&self, registry_url: &Url) -> Result<Arc<dyn CoordinationClient>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.inner.connect(registry_url).await
        }
    }

    fn factory() -> RegistryFactory {
        RegistryFactory::new(Arc::new(LocalSwitcherService::new()))
    }

    #[tokio::test]
    async fn test_same_address_shares_instance() {
        let factory = factory();
        let url = Url::parse("memory://registry:2181").unwrap();
        let (a, b) = tokio::join!(factory.get_registry(&url), factory.get_registry(&url));
        assert!(Arc::ptr_eq(&a.unwrap(), &b.unwrap()));

        let other = factory
            .get_registry(&Url::parse("memory://other:2181").unwrap())
            .await
            .unwrap();
        assert_eq!(other.url().host(), "other");
        assert_eq!(factory.registry_count(), 2);
        factory.shutdown().await;
    }

    #[tokio::test]
    async fn test_concurrent_creation_connects_once() {
        let connector = Arc::new(SlowConnector {
            delay: Duration::from_millis(50),
            calls: AtomicUsize::new(0),
            inner: MemoryConnector::new(),
        });
        let factory = factory().with_connector("slow", connector.clone());
        let url = Url::parse("slow://registry:1?connectTimeout=1000").unwrap();

        let results = futures::future::join_all((0..8).map(|_| factory.get_registry(&url))).await;
        assert!(results.iter().all(|r| r.is_ok()));
        assert_eq!(connector.calls.load(Ordering::SeqCst), 1);
        factory.shutdown().await;
    }

    #[tokio::test]
    async fn test_connect_timeout() {
        let connector = Arc::new(SlowConnector {
            delay: Duration::from_millis(200),
            calls: AtomicUsize::new(0),
            inner: MemoryConnector::new(),
        });
        let factory = factory().with_connector("slow", connector);
        let url = Url::parse("slow://registry:1?connectTimeout=20").unwrap();

        assert!(matches!(factory.get_registry(&url).await, Err(RegistryError::Backend(_))));
        assert_eq!(factory.registry_count(), 0);
        factory.shutdown().await;
    }

    #[tokio::test]
    async fn test_direct_and_unknown_schemes() {
        let factory = factory();
        let direct = factory
            .get_registry(&Url::parse("direct://0.0.0.0:0?address=10.0.0.1:80").unwrap())
            .await
            .unwrap();
        let service = Url::parse("rpc://client:0//v1/orders").unwrap();
        assert_eq!(direct.discover(&service).await.unwrap()[0].identity(), "10.0.0.1:80");

        assert!(matches!(
            factory.get_registry(&Url::parse("etcd://registry:2379").unwrap()).await,
            Err(RegistryError::UnsupportedProtocol(_))
        ));
        assert!(matches!(
            factory.get_registry(&Url::parse("direct://0.0.0.0:0?address=bad").unwrap()).await,
            Err(RegistryError::InvalidConfiguration(_))
        ));
        factory.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_stops_retry_worker() {
        let factory = factory();
        factory
            .get_registry(&Url::parse("memory://registry:2181").unwrap())
            .await
            .unwrap();
        assert_eq!(factory.scheduler().scheduled_count(), 1);
        assert!(factory.scheduler().is_running());

        factory.shutdown().await;
        assert!(!factory.scheduler().is_running());
        assert_eq!(factory.registry_count(), 0);
    }
}
