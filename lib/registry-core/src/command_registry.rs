//! Registry operations layered over a backend that also serves routing
//! commands. Each subscribed service gets a `ServiceManager` that merges
//! weighted groups and re-routes when either the groups or the command change.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

use crate::base::Subscriber;
use crate::command::RpcCommand;
use crate::listener::{CommandListener, NotifyListener, ServiceListener};
use crate::net;
use crate::registry::{RegistryBackend, RegistryOps};
use crate::service_manager::{RoutedEndpoints, ServiceManager};
use crate::switcher::{SwitcherService, COMMAND_SWITCHER};
use crate::{Result, Url};

pub struct CommandRegistry<B> {
    backend: Arc<B>,
    managers: DashMap<Url, Arc<ServiceManager>>,
    switcher: Arc<dyn SwitcherService>,
    local_ip: String,
}

impl<B: RegistryBackend + 'static> CommandRegistry<B> {
    pub fn new(backend: Arc<B>, switcher: Arc<dyn SwitcherService>) -> Self {
        let local_ip = net::local_ip(backend.url());
        debug!(registry = %backend.url().identity(), local_ip = %local_ip, "command registry created");
        Self {
            backend,
            managers: DashMap::new(),
            switcher,
            local_ip,
        }
    }

    /// Override the address route rules are evaluated against
    pub fn with_local_ip(mut self, local_ip: impl Into<String>) -> Self {
        self.local_ip = local_ip.into();
        self
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    pub fn local_ip(&self) -> &str {
        &self.local_ip
    }

    pub fn manager_count(&self) -> usize {
        self.managers.len()
    }

    pub fn manager(&self, url: &Url) -> Option<Arc<ServiceManager>> {
        self.managers.get(url).map(|m| m.clone())
    }

    fn new_manager(&self, url: &Url, watch_groups: bool) -> Arc<ServiceManager> {
        let backend = Arc::downgrade(&self.backend) as Weak<dyn RegistryBackend>;
        let (url, switcher, local_ip) = (url.clone(), self.switcher.clone(), self.local_ip.clone());
        if watch_groups {
            ServiceManager::new(url, backend, switcher, local_ip)
        } else {
            ServiceManager::detached(url, backend, switcher, local_ip)
        }
    }

    fn manager_for(&self, url: &Url) -> Arc<ServiceManager> {
        self.managers
            .entry(url.clone())
            .or_insert_with(|| self.new_manager(url, true))
            .clone()
    }

    fn current_command(&self, raw: Option<String>) -> Option<String> {
        if !self.switcher.is_on_or(COMMAND_SWITCHER, true) {
            return None;
        }
        raw.filter(|c| !c.trim().is_empty())
    }

    /// One-shot lookup that keeps the group weights typed. A subscribed
    /// service routes through its manager, whose groups are watched; any
    /// other service routes on a detached manager dropped afterwards.
    pub async fn discover_routed(&self, url: &Url) -> Result<RoutedEndpoints> {
        let raw = self.current_command(self.backend.discover_command(url).await?);
        let Some(command) = raw.as_deref().and_then(RpcCommand::parse) else {
            return Ok(RoutedEndpoints::single(
                self.backend.discover_service(url).await?,
            ));
        };
        let manager = self
            .manager(url)
            .unwrap_or_else(|| self.new_manager(url, false));
        manager.route(Some(&command)).await
    }

    /// Arm both watches for `manager` and compute its first delivery
    async fn start_watching(&self, manager: &Arc<ServiceManager>) -> Result<Vec<Url>> {
        let url = manager.ref_url().clone();
        let service_listener: Arc<dyn ServiceListener> = manager.clone();
        let command_listener: Arc<dyn CommandListener> = manager.clone();
        self.backend.subscribe_service(&url, service_listener).await?;
        self.backend.subscribe_command(&url, command_listener).await?;

        let raw = self.current_command(self.backend.discover_command(&url).await?);
        manager.update_command(raw);
        Ok(manager.current_routed().await?.into_urls(&url))
    }

    /// Forget `listener`; the last one out releases the manager's watches
    async fn drop_subscriber(&self, url: &Url, listener: &Arc<dyn NotifyListener>) -> Result<()> {
        let Some(manager) = self.manager(url) else {
            return Ok(());
        };
        if manager.remove_subscriber(listener) == 0 {
            manager.release().await?;
            self.managers.remove(url);
            debug!(service = %url.service_key(), "service manager released");
        }
        Ok(())
    }
}

#[async_trait]
impl<B: RegistryBackend + 'static> RegistryOps for CommandRegistry<B> {
    async fn do_register(&self, url: &Url) -> Result<()> {
        self.backend.do_register(url).await
    }

    async fn do_unregister(&self, url: &Url) -> Result<()> {
        self.backend.do_unregister(url).await
    }

    async fn do_subscribe(&self, subscriber: Subscriber) -> Result<()> {
        let url = subscriber.url().clone();
        let manager = self.manager_for(&url);
        manager.add_subscriber(subscriber.clone());

        match self.start_watching(&manager).await {
            Ok(urls) => {
                info!(service = %url.service_key(), count = urls.len(), "command subscription ready");
                subscriber.notify(urls);
                Ok(())
            }
            Err(e) => {
                warn!(service = %url.service_key(), "subscribe failed, dropping listener: {}", e);
                if let Err(release) = self.drop_subscriber(&url, subscriber.listener()).await {
                    warn!(service = %url.service_key(), "releasing watches failed: {}", release);
                }
                Err(e)
            }
        }
    }

    async fn do_unsubscribe(&self, url: &Url, listener: &Arc<dyn NotifyListener>) -> Result<()> {
        self.drop_subscriber(url, listener).await
    }

    async fn do_discover(&self, url: &Url) -> Result<Vec<Url>> {
        Ok(self.discover_routed(url).await?.into_urls(url))
    }

    async fn do_available(&self, url: &Url) -> Result<()> {
        self.backend.do_available(url).await
    }

    async fn do_unavailable(&self, url: &Url) -> Result<()> {
        self.backend.do_unavailable(url).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::BaseRegistry;
    use crate::registry::Registry;
    use crate::service_manager::tests::{StaticBackend, WEIGHTED};
    use crate::service_manager::RULE_PROTOCOL;
    use crate::switcher::LocalSwitcherService;
    use crate::RegistryError;
    use std::sync::Mutex;

    fn stack(backend: Arc<StaticBackend>) -> BaseRegistry<CommandRegistry<StaticBackend>> {
        let switcher: Arc<dyn SwitcherService> = Arc::new(LocalSwitcherService::new());
        let ops = CommandRegistry::new(backend, switcher.clone()).with_local_ip("10.0.0.9");
        BaseRegistry::new(Url::parse("memory://registry:0").unwrap(), ops, switcher)
    }

    fn service() -> Url {
        Url::new("rpc", "10.0.0.9", 0, "/v1/orders").with_group("g1")
    }

    #[tokio::test]
    async fn test_discover_without_command() {
        let backend = Arc::new(StaticBackend::with_groups(&[("g1", &["10.1.0.1"])]));
        let registry = stack(backend);
        let urls = registry.discover(&service()).await.unwrap();
        assert_eq!(urls.len(), 1);
        assert_eq!(registry.ops().manager_count(), 0);
    }

    #[tokio::test]
    async fn test_discover_with_weighted_command() {
        let backend = Arc::new(StaticBackend::with_groups(&[
            ("g1", &["10.1.0.1"]),
            ("g2", &["10.2.0.1"]),
        ]));
        *backend.command.lock().unwrap() = Some(WEIGHTED.to_string());
        let registry = stack(backend.clone());

        let urls = registry.discover(&service()).await.unwrap();
        assert_eq!(urls.len(), 3);
        assert_eq!(urls[0].protocol(), RULE_PROTOCOL);

        let routed = registry.ops().discover_routed(&service()).await.unwrap();
        assert_eq!(routed.group_weights.len(), 2);
        assert_eq!(registry.ops().manager_count(), 0);
        assert!(backend.watched().is_empty());
    }

    #[tokio::test]
    async fn test_one_shot_discover_sees_new_endpoints() {
        let backend = Arc::new(StaticBackend::with_groups(&[("g1", &["10.1.0.1"])]));
        *backend.command.lock().unwrap() = Some(
            r#"{"clientCommandList":[{"pattern":"/v2/*","mergeGroups":["g2:100"]}]}"#.to_string(),
        );
        let registry = stack(backend.clone());
        assert_eq!(registry.discover(&service()).await.unwrap().len(), 1);

        backend
            .groups
            .lock()
            .unwrap()
            .get_mut("g1")
            .unwrap()
            .push(Url::new("rpc", "10.1.0.2", 8000, "/v1/orders").with_group("g1"));
        let urls = registry.discover(&service()).await.unwrap();
        assert_eq!(urls.len(), 2);
        assert_eq!(registry.ops().manager_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_subscribe_drops_listener() {
        let backend = Arc::new(StaticBackend::with_groups(&[("g1", &["10.1.0.1"])]));
        *backend.command.lock().unwrap() =
            Some(r#"{"clientCommandList":[{"pattern":"a&&b"}]}"#.to_string());
        let registry = stack(backend.clone());

        let seen = Arc::new(Mutex::new(0));
        let sink = seen.clone();
        let listener: Arc<dyn NotifyListener> = Arc::new(move |_: &Url, _: Vec<Url>| {
            *sink.lock().unwrap() += 1;
        });
        assert!(matches!(
            registry.subscribe(&service(), listener).await,
            Err(RegistryError::Expression(_))
        ));
        assert_eq!(registry.ops().manager_count(), 0);
        assert!(backend.watched().is_empty());
        assert_eq!(*seen.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_subscribe_delivers_empty_service() {
        let backend = Arc::new(StaticBackend::with_groups(&[("g1", &[])]));
        let registry = stack(backend);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let listener: Arc<dyn NotifyListener> = Arc::new(move |_: &Url, urls: Vec<Url>| {
            sink.lock().unwrap().push(urls.len());
        });
        registry.subscribe(&service(), listener).await.unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![0]);
    }

    #[tokio::test]
    async fn test_unparsable_command_falls_back() {
        let backend = Arc::new(StaticBackend::with_groups(&[("g1", &["10.1.0.1"])]));
        *backend.command.lock().unwrap() = Some("{broken".to_string());
        let registry = stack(backend);
        let urls = registry.discover(&service()).await.unwrap();
        assert_eq!(urls.len(), 1);
    }

    #[tokio::test]
    async fn test_bad_pattern_is_an_error() {
        let backend = Arc::new(StaticBackend::with_groups(&[("g1", &["10.1.0.1"])]));
        *backend.command.lock().unwrap() =
            Some(r#"{"clientCommandList":[{"pattern":"a&&b"}]}"#.to_string());
        let registry = stack(backend);
        assert!(matches!(
            registry.discover(&service()).await,
            Err(RegistryError::Expression(_))
        ));
    }

    #[tokio::test]
    async fn test_subscribe_and_unsubscribe_lifecycle() {
        let backend = Arc::new(StaticBackend::with_groups(&[
            ("g1", &["10.1.0.1"]),
            ("g2", &["10.2.0.1"]),
        ]));
        *backend.command.lock().unwrap() = Some(WEIGHTED.to_string());
        let registry = stack(backend.clone());

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let listener: Arc<dyn NotifyListener> = Arc::new(move |_: &Url, urls: Vec<Url>| {
            sink.lock().unwrap().push(urls.len());
        });
        registry.subscribe(&service(), listener.clone()).await.unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![3]);
        assert_eq!(backend.watched(), vec!["g1", "g2"]);
        assert_eq!(registry.ops().manager_count(), 1);

        registry.unsubscribe(&service(), &listener).await.unwrap();
        assert_eq!(registry.ops().manager_count(), 0);
        assert!(backend.watched().is_empty());
        assert!(registry.cached_urls(&service()).is_none());
    }

    #[tokio::test]
    async fn test_command_switcher_off_skips_command() {
        let backend = Arc::new(StaticBackend::with_groups(&[
            ("g1", &["10.1.0.1"]),
            ("g2", &["10.2.0.1"]),
        ]));
        *backend.command.lock().unwrap() = Some(WEIGHTED.to_string());
        let switcher: Arc<dyn SwitcherService> = Arc::new(LocalSwitcherService::new());
        switcher.set_value(COMMAND_SWITCHER, false);
        let ops = CommandRegistry::new(backend, switcher).with_local_ip("10.0.0.9");

        let routed = ops.discover_routed(&service()).await.unwrap();
        assert_eq!(routed.endpoints.len(), 1);
        assert!(routed.group_weights.is_empty());
    }
}
