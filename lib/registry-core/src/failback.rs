//! Failback decorator: swallow transient failures and replay them later

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{error, info, warn};

use crate::base::BaseRegistry;
use crate::listener::{same_listener, NotifyListener};
use crate::registry::{Registry, RegistryOps};
use crate::retry::{RetryScheduler, RetryTask};
use crate::url::{params, DEFAULT_RETRY_PERIOD_MS};
use crate::{Result, Url};

type FailedListeners = DashMap<Url, Vec<Arc<dyn NotifyListener>>>;

pub struct FailbackRegistry<O> {
    base: BaseRegistry<O>,
    failed_registered: DashSet<Url>,
    failed_unregistered: DashSet<Url>,
    failed_subscribed: FailedListeners,
    failed_unsubscribed: FailedListeners,
}

impl<O: RegistryOps + 'static> FailbackRegistry<O> {
    /// Wrap `base` and enrol it with the shared retry worker at the period
    /// configured by `registryRetryPeriod`
    pub fn new(base: BaseRegistry<O>, scheduler: &RetryScheduler) -> Arc<Self> {
        let period = Duration::from_millis(
            base.url()
                .u64_parameter(params::RETRY_PERIOD, DEFAULT_RETRY_PERIOD_MS),
        );
        let registry = Arc::new(Self {
            base,
            failed_registered: DashSet::new(),
            failed_unregistered: DashSet::new(),
            failed_subscribed: DashMap::new(),
            failed_unsubscribed: DashMap::new(),
        });

        let task: Weak<dyn RetryTask> = Arc::downgrade(&registry) as Weak<dyn RetryTask>;
        scheduler.schedule(task, period);
        registry
    }
}

impl<O: RegistryOps> FailbackRegistry<O> {
    pub fn base(&self) -> &BaseRegistry<O> {
        &self.base
    }

    pub fn failed_registered(&self) -> Vec<Url> {
        self.failed_registered.iter().map(|u| u.key().clone()).collect()
    }

    pub fn failed_unregistered(&self) -> Vec<Url> {
        self.failed_unregistered.iter().map(|u| u.key().clone()).collect()
    }

    pub fn failed_subscribed(&self) -> Vec<Url> {
        self.failed_subscribed.iter().map(|e| e.key().clone()).collect()
    }

    pub fn failed_unsubscribed(&self) -> Vec<Url> {
        self.failed_unsubscribed.iter().map(|e| e.key().clone()).collect()
    }

    /// Fail fast only when neither the registry nor the endpoint disables `check`
    fn is_checking(&self, url: &Url) -> bool {
        self.base.url().bool_parameter(params::CHECK, true) && url.bool_parameter(params::CHECK, true)
    }

    fn remove_failed_listener(&self, url: &Url, listener: &Arc<dyn NotifyListener>) {
        for failed in [&self.failed_subscribed, &self.failed_unsubscribed] {
            let emptied = match failed.get_mut(url) {
                Some(mut listeners) => {
                    listeners.retain(|l| !same_listener(l, listener));
                    listeners.is_empty()
                }
                None => false,
            };
            if emptied {
                failed.remove_if(url, |_, l| l.is_empty());
            }
        }
    }

    fn add_failed_listener(failed: &FailedListeners, url: &Url, listener: Arc<dyn NotifyListener>) {
        let mut listeners = failed.entry(url.clone()).or_default();
        if !listeners.iter().any(|l| same_listener(l, &listener)) {
            listeners.push(listener);
        }
    }

    /// Replay every failed operation once: register, unregister, subscribe,
    /// unsubscribe
    pub async fn retry_failed(&self) {
        for url in self.failed_registered() {
            match self.base.register(&url).await {
                Ok(()) => {
                    self.failed_registered.remove(&url);
                    info!(url = %url.to_simple_str(), "retry register succeeded");
                }
                Err(e) => warn!(url = %url.to_simple_str(), "retry register failed: {}", e),
            }
        }

        for url in self.failed_unregistered() {
            match self.base.unregister(&url).await {
                Ok(()) => {
                    self.failed_unregistered.remove(&url);
                    info!(url = %url.to_simple_str(), "retry unregister succeeded");
                }
                Err(e) => warn!(url = %url.to_simple_str(), "retry unregister failed: {}", e),
            }
        }

        for (url, listeners) in snapshot(&self.failed_subscribed) {
            for listener in listeners {
                match self.base.subscribe(&url, listener.clone()).await {
                    Ok(()) => {
                        drop_listener(&self.failed_subscribed, &url, &listener);
                        info!(url = %url.to_simple_str(), "retry subscribe succeeded");
                    }
                    Err(e) => warn!(url = %url.to_simple_str(), "retry subscribe failed: {}", e),
                }
            }
        }

        for (url, listeners) in snapshot(&self.failed_unsubscribed) {
            for listener in listeners {
                match self.base.unsubscribe(&url, &listener).await {
                    Ok(()) => {
                        drop_listener(&self.failed_unsubscribed, &url, &listener);
                        info!(url = %url.to_simple_str(), "retry unsubscribe succeeded");
                    }
                    Err(e) => warn!(url = %url.to_simple_str(), "retry unsubscribe failed: {}", e),
                }
            }
        }
    }
}

fn snapshot(failed: &FailedListeners) -> Vec<(Url, Vec<Arc<dyn NotifyListener>>)> {
    failed
        .iter()
        .map(|e| (e.key().clone(), e.value().clone()))
        .collect()
}

fn drop_listener(failed: &FailedListeners, url: &Url, listener: &Arc<dyn NotifyListener>) {
    if let Some(mut listeners) = failed.get_mut(url) {
        listeners.retain(|l| !same_listener(l, listener));
    }
    failed.remove_if(url, |_, l| l.is_empty());
}

#[async_trait]
impl<O: RegistryOps> Registry for FailbackRegistry<O> {
    fn url(&self) -> &Url {
        self.base.url()
    }

    async fn register(&self, url: &Url) -> Result<()> {
        self.failed_registered.remove(url);
        self.failed_unregistered.remove(url);

        if let Err(e) = self.base.register(url).await {
            if self.is_checking(url) || e.is_configuration() {
                return Err(e);
            }
            warn!(url = %url.to_simple_str(), "register failed, queued for retry: {}", e);
            self.failed_registered.insert(url.clone());
        }
        Ok(())
    }

    async fn unregister(&self, url: &Url) -> Result<()> {
        self.failed_registered.remove(url);
        self.failed_unregistered.remove(url);

        if let Err(e) = self.base.unregister(url).await {
            if self.is_checking(url) || e.is_configuration() {
                return Err(e);
            }
            warn!(url = %url.to_simple_str(), "unregister failed, queued for retry: {}", e);
            self.failed_unregistered.insert(url.clone());
        }
        Ok(())
    }

    async fn subscribe(&self, url: &Url, listener: Arc<dyn NotifyListener>) -> Result<()> {
        self.remove_failed_listener(url, &listener);

        if let Err(e) = self.base.subscribe(url, listener.clone()).await {
            if e.is_configuration() {
                return Err(e);
            }
            match self.base.cached_urls(url) {
                Some(cached) => {
                    warn!(url = %url.to_simple_str(), "subscribe failed, serving {} cached endpoints: {}", cached.len(), e);
                    listener.notify(self.base.url(), cached);
                }
                None if self.is_checking(url) => return Err(e),
                None => warn!(url = %url.to_simple_str(), "subscribe failed, queued for retry: {}", e),
            }
            Self::add_failed_listener(&self.failed_subscribed, url, listener);
        }
        Ok(())
    }

    async fn unsubscribe(&self, url: &Url, listener: &Arc<dyn NotifyListener>) -> Result<()> {
        self.remove_failed_listener(url, listener);

        if let Err(e) = self.base.unsubscribe(url, listener).await {
            if self.is_checking(url) || e.is_configuration() {
                return Err(e);
            }
            warn!(url = %url.to_simple_str(), "unsubscribe failed, queued for retry: {}", e);
            Self::add_failed_listener(&self.failed_unsubscribed, url, listener.clone());
        }
        Ok(())
    }

    async fn discover(&self, url: &Url) -> Result<Vec<Url>> {
        match self.base.discover(url).await {
            Ok(urls) => Ok(urls),
            Err(e) => {
                if e.is_configuration() {
                    error!(url = %url.to_simple_str(), "discover rejected by configuration: {}", e);
                } else {
                    warn!(url = %url.to_simple_str(), "discover failed: {}", e);
                }
                Ok(Vec::new())
            }
        }
    }

    async fn available(&self, url: Option<&Url>) -> Result<()> {
        self.base.available(url).await
    }

    async fn unavailable(&self, url: Option<&Url>) -> Result<()> {
        self.base.unavailable(url).await
    }

    fn registered_service_urls(&self) -> Vec<Url> {
        self.base.registered_service_urls()
    }
}

#[async_trait]
impl<O: RegistryOps> RetryTask for FailbackRegistry<O> {
    fn name(&self) -> String {
        format!("failback {}", self.base.url().to_simple_str())
    }

    async fn retry(&self) {
        self.retry_failed().await;
    }
}
