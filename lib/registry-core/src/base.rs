//! Caching and notification layer shared by every registry stack

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use indexmap::IndexMap;
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

use crate::listener::{same_listener, NotifyListener};
use crate::registry::{Registry, RegistryOps};
use crate::switcher::{SwitcherService, HEARTBEAT_SWITCHER};
use crate::{Result, Url};

/// Last-known endpoints per subscription, grouped by service path
#[derive(Default)]
pub struct SubscriptionCache {
    entries: DashMap<Url, DashMap<String, Vec<Url>>>,
}

impl SubscriptionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge `urls` into the cache for `ref_url` and hand each service path
    /// group to the listener. Paths absent from `urls` keep their entries.
    pub fn notify(
        &self,
        registry_url: &Url,
        ref_url: &Url,
        listener: &dyn NotifyListener,
        urls: Vec<Url>,
    ) {
        let mut grouped: IndexMap<String, Vec<Url>> = IndexMap::new();
        if urls.is_empty() {
            // an emptied service still has to reach the listener
            grouped.insert(ref_url.path().to_string(), Vec::new());
        }
        for url in urls {
            grouped.entry(url.path().to_string()).or_default().push(url);
        }

        {
            let entry = self.entries.entry(ref_url.clone()).or_default();
            for (path, list) in &grouped {
                entry.insert(path.clone(), list.clone());
            }
        }

        for (path, list) in grouped {
            debug!(
                subscriber = %ref_url.to_simple_str(),
                path = %path,
                count = list.len(),
                "notifying listener"
            );
            listener.notify(registry_url, list);
        }
    }

    /// Copy of every cached endpoint for the subscription, if any
    pub fn cached(&self, url: &Url) -> Option<Vec<Url>> {
        let entry = self.entries.get(url)?;
        let urls: Vec<Url> = entry.iter().flat_map(|e| e.value().clone()).collect();
        if urls.is_empty() {
            None
        } else {
            Some(urls)
        }
    }

    pub fn remove(&self, url: &Url) {
        self.entries.remove(url);
    }
}

/// Explicit record of one subscription: who asked, who to call and where
/// the results are cached
#[derive(Clone)]
pub struct Subscriber {
    url: Url,
    registry_url: Url,
    listener: Arc<dyn NotifyListener>,
    cache: Arc<SubscriptionCache>,
}

impl Subscriber {
    pub fn new(
        url: Url,
        registry_url: Url,
        listener: Arc<dyn NotifyListener>,
        cache: Arc<SubscriptionCache>,
    ) -> Self {
        Self {
            url,
            registry_url,
            listener,
            cache,
        }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn listener(&self) -> &Arc<dyn NotifyListener> {
        &self.listener
    }

    pub fn is_listener(&self, listener: &Arc<dyn NotifyListener>) -> bool {
        same_listener(&self.listener, listener)
    }

    /// Deliver a fresh endpoint list through the subscription cache
    pub fn notify(&self, urls: Vec<Url>) {
        self.cache
            .notify(&self.registry_url, &self.url, self.listener.as_ref(), urls);
    }
}

/// Registry layer that validates, caches and fans out notifications,
/// delegating the actual work to its `RegistryOps`
pub struct BaseRegistry<O> {
    url: Url,
    ops: O,
    registered: DashSet<Url>,
    cache: Arc<SubscriptionCache>,
    switcher: Arc<dyn SwitcherService>,
}

impl<O: RegistryOps> BaseRegistry<O> {
    pub fn new(url: Url, ops: O, switcher: Arc<dyn SwitcherService>) -> Self {
        Self {
            url,
            ops,
            registered: DashSet::new(),
            cache: Arc::new(SubscriptionCache::new()),
            switcher,
        }
    }

    pub fn ops(&self) -> &O {
        &self.ops
    }

    pub fn cache(&self) -> &Arc<SubscriptionCache> {
        &self.cache
    }

    pub fn cached_urls(&self, url: &Url) -> Option<Vec<Url>> {
        self.cache.cached(url)
    }
}

#[async_trait]
impl<O: RegistryOps> Registry for BaseRegistry<O> {
    fn url(&self) -> &Url {
        &self.url
    }

    async fn register(&self, url: &Url) -> Result<()> {
        let url = url.without_codec();
        self.ops.do_register(&url).await?;
        info!(registry = %self.url.identity(), url = %url.to_simple_str(), "registered service");
        self.registered.insert(url.clone());

        if self.switcher.is_on(HEARTBEAT_SWITCHER) {
            self.available(Some(&url)).await?;
        }
        Ok(())
    }

    async fn unregister(&self, url: &Url) -> Result<()> {
        let url = url.without_codec();
        self.ops.do_unregister(&url).await?;
        info!(registry = %self.url.identity(), url = %url.to_simple_str(), "unregistered service");
        self.registered.remove(&url);
        Ok(())
    }

    async fn subscribe(&self, url: &Url, listener: Arc<dyn NotifyListener>) -> Result<()> {
        let subscriber = Subscriber::new(
            url.clone(),
            self.url.clone(),
            listener,
            self.cache.clone(),
        );
        self.ops.do_subscribe(subscriber).await?;
        info!(registry = %self.url.identity(), url = %url.to_simple_str(), "subscribed");
        Ok(())
    }

    async fn unsubscribe(&self, url: &Url, listener: &Arc<dyn NotifyListener>) -> Result<()> {
        self.ops.do_unsubscribe(url, listener).await?;
        self.cache.remove(url);
        info!(registry = %self.url.identity(), url = %url.to_simple_str(), "unsubscribed");
        Ok(())
    }

    async fn discover(&self, url: &Url) -> Result<Vec<Url>> {
        if let Some(cached) = self.cache.cached(url) {
            return Ok(cached);
        }
        self.ops.do_discover(url).await
    }

    async fn available(&self, url: Option<&Url>) -> Result<()> {
        match url {
            Some(url) => self.ops.do_available(&url.without_codec()).await,
            None => {
                for url in self.registered_service_urls() {
                    self.ops.do_available(&url).await?;
                }
                Ok(())
            }
        }
    }

    async fn unavailable(&self, url: Option<&Url>) -> Result<()> {
        match url {
            Some(url) => self.ops.do_unavailable(&url.without_codec()).await,
            None => {
                for url in self.registered_service_urls() {
                    self.ops.do_unavailable(&url).await?;
                }
                Ok(())
            }
        }
    }

    fn registered_service_urls(&self) -> Vec<Url> {
        self.registered.iter().map(|u| u.key().clone()).collect()
    }
}

/// Flip every registered endpoint of `registry` when the heartbeat switch
/// changes. Only a weak reference is kept.
pub fn watch_heartbeat_switcher(registry: &Arc<dyn Registry>, switcher: &dyn SwitcherService) {
    let weak: Weak<dyn Registry> = Arc::downgrade(registry);
    switcher.register_listener(
        HEARTBEAT_SWITCHER,
        Arc::new(move |_: &str, on: bool| {
            let Some(registry) = weak.upgrade() else {
                return;
            };
            let Ok(handle) = tokio::runtime::Handle::try_current() else {
                warn!("heartbeat switcher changed outside a runtime, ignoring");
                return;
            };
            handle.spawn(async move {
                let result = if on {
                    registry.available(None).await
                } else {
                    registry.unavailable(None).await
                };
                if let Err(e) = result {
                    warn!(registry = %registry.url().identity(), on, "heartbeat switch failed: {}", e);
                }
            });
        }),
    );
}
