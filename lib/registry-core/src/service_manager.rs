//! Per-subscription manager that merges weighted groups under the current
//! routing command and pushes the result to subscribers

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::{Arc, Mutex, RwLock, Weak};
use tracing::{debug, error, info, warn};

use crate::base::Subscriber;
use crate::command::RpcCommand;
use crate::listener::{CommandListener, NotifyListener, ServiceListener};
use crate::registry::RegistryBackend;
use crate::switcher::{SwitcherService, COMMAND_SWITCHER};
use crate::url::params;
use crate::{RegistryError, Result, Url};

/// Protocol of the synthetic record that carries group weights in list form
pub const RULE_PROTOCOL: &str = "rule";

/// Candidates for one service plus the traffic split between their groups
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RoutedEndpoints {
    pub endpoints: Vec<Url>,
    /// Merged groups and their weights; empty without a merge command
    pub group_weights: Vec<(String, u32)>,
}

impl RoutedEndpoints {
    pub fn single(endpoints: Vec<Url>) -> Self {
        Self {
            endpoints,
            group_weights: Vec::new(),
        }
    }

    /// `g1:70,g2:30`
    pub fn weights_param(&self) -> String {
        self.group_weights
            .iter()
            .map(|(group, weight)| format!("{}:{}", group, weight))
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Record describing the split, for consumers that only see endpoint
    /// lists. Absent unless two or more groups share the traffic.
    pub fn rule_url(&self, service_url: &Url) -> Option<Url> {
        if self.group_weights.len() < 2 {
            return None;
        }
        Some(
            Url::new(
                RULE_PROTOCOL,
                service_url.host(),
                service_url.port(),
                service_url.path(),
            )
            .with_parameter(params::WEIGHTS, self.weights_param()),
        )
    }

    /// Flatten into a list, prefixed by the rule record when weights apply
    pub fn into_urls(self, service_url: &Url) -> Vec<Url> {
        let mut urls = Vec::with_capacity(self.endpoints.len() + 1);
        urls.extend(self.rule_url(service_url));
        urls.extend(self.endpoints);
        urls
    }
}

#[derive(Default)]
struct CommandState {
    raw: Option<String>,
    parsed: Option<RpcCommand>,
}

pub struct ServiceManager {
    ref_url: Url,
    backend: Weak<dyn RegistryBackend>,
    switcher: Arc<dyn SwitcherService>,
    local_ip: String,
    group_cache: DashMap<String, Vec<Url>>,
    command: RwLock<CommandState>,
    subscribers: Mutex<Vec<Subscriber>>,
    /// Detached managers route once and never arm group watches
    watch_groups: bool,
    me: Weak<ServiceManager>,
}

impl ServiceManager {
    pub fn new(
        ref_url: Url,
        backend: Weak<dyn RegistryBackend>,
        switcher: Arc<dyn SwitcherService>,
        local_ip: String,
    ) -> Arc<Self> {
        Self::build(ref_url, backend, switcher, local_ip, true)
    }

    /// Manager for a one-shot lookup: its group cache lives only as long as
    /// the manager and no watch is left behind
    pub fn detached(
        ref_url: Url,
        backend: Weak<dyn RegistryBackend>,
        switcher: Arc<dyn SwitcherService>,
        local_ip: String,
    ) -> Arc<Self> {
        Self::build(ref_url, backend, switcher, local_ip, false)
    }

    fn build(
        ref_url: Url,
        backend: Weak<dyn RegistryBackend>,
        switcher: Arc<dyn SwitcherService>,
        local_ip: String,
        watch_groups: bool,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            ref_url,
            backend,
            switcher,
            local_ip,
            group_cache: DashMap::new(),
            command: RwLock::new(CommandState::default()),
            subscribers: Mutex::new(Vec::new()),
            watch_groups,
            me: me.clone(),
        })
    }

    pub fn ref_url(&self) -> &Url {
        &self.ref_url
    }

    pub fn cached_groups(&self) -> Vec<String> {
        self.group_cache.iter().map(|e| e.key().clone()).collect()
    }

    pub fn current_command(&self) -> Option<String> {
        self.command
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .raw
            .clone()
    }

    pub fn add_subscriber(&self, subscriber: Subscriber) {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subscribers.retain(|s| !s.is_listener(subscriber.listener()));
        subscribers.push(subscriber);
    }

    /// Remaining subscriber count
    pub fn remove_subscriber(&self, listener: &Arc<dyn NotifyListener>) -> usize {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subscribers.retain(|s| !s.is_listener(listener));
        subscribers.len()
    }

    fn backend(&self) -> Result<Arc<dyn RegistryBackend>> {
        self.backend
            .upgrade()
            .ok_or_else(|| RegistryError::Internal("registry backend dropped".to_string()))
    }

    fn as_listener(&self) -> Result<Arc<ServiceManager>> {
        self.me
            .upgrade()
            .ok_or_else(|| RegistryError::Internal("service manager dropped".to_string()))
    }

    fn group_url(&self, group: &str) -> Url {
        if group == self.ref_url.group() {
            self.ref_url.clone()
        } else {
            self.ref_url.with_group(group)
        }
    }

    /// Record a new raw command; false when it is unchanged
    pub fn update_command(&self, raw: Option<String>) -> bool {
        let mut state = self.command.write().unwrap_or_else(|e| e.into_inner());
        if state.raw == raw {
            return false;
        }
        state.parsed = raw.as_deref().and_then(RpcCommand::parse);
        if raw.is_some() && state.parsed.is_none() {
            warn!(service = %self.ref_url.service_key(), "command could not be parsed, routing without it");
        }
        state.raw = raw;
        true
    }

    async fn discover_one_group(&self, url: &Url) -> Result<Vec<Url>> {
        let group = url.group().to_string();
        if let Some(cached) = self.group_cache.get(&group) {
            return Ok(cached.clone());
        }
        let urls = self.backend()?.discover_service(url).await?;
        self.group_cache.insert(group, urls.clone());
        Ok(urls)
    }

    /// Concatenate every weighted group, watching groups seen for the first time
    async fn merge_groups(&self, weights: &[(String, u32)]) -> Result<Vec<Url>> {
        let mut merged = Vec::new();
        for (group, _) in weights {
            if let Some(cached) = self.group_cache.get(group).map(|c| c.clone()) {
                merged.extend(cached);
                continue;
            }
            let group_url = self.group_url(group);
            merged.extend(self.discover_one_group(&group_url).await?);
            if !self.watch_groups {
                continue;
            }
            self.backend()?
                .subscribe_service(&group_url, self.as_listener()?)
                .await?;
            debug!(service = %self.ref_url.service_key(), group = %group, "watching merge group");
        }
        Ok(merged)
    }

    /// Resolve the candidates for this service under `command`
    pub async fn route(&self, command: Option<&RpcCommand>) -> Result<RoutedEndpoints> {
        let Some(command) = command.filter(|c| !c.is_empty()) else {
            return Ok(RoutedEndpoints::single(self.discover_one_group(&self.ref_url).await?));
        };
        let Some(selected) = command.select(self.ref_url.path())? else {
            return Ok(RoutedEndpoints::single(self.discover_one_group(&self.ref_url).await?));
        };

        let mut routed = if selected.merge_groups.is_empty() {
            RoutedEndpoints::single(self.discover_one_group(&self.ref_url).await?)
        } else {
            match selected.group_weights() {
                Ok(weights) => {
                    let endpoints = self.merge_groups(&weights).await?;
                    RoutedEndpoints {
                        endpoints,
                        group_weights: weights,
                    }
                }
                Err(e) => {
                    error!(
                        service = %self.ref_url.service_key(),
                        pattern = %selected.pattern,
                        "rejecting routing command: {}",
                        e
                    );
                    return Ok(RoutedEndpoints::single(
                        self.discover_one_group(&self.ref_url).await?,
                    ));
                }
            }
        };

        for rule in selected.parsed_route_rules() {
            if rule.applies_to(&self.local_ip) {
                routed.endpoints.retain(|url| rule.admits(url.host()));
            }
        }
        debug!(
            service = %self.ref_url.service_key(),
            count = routed.endpoints.len(),
            weights = %routed.weights_param(),
            "routed endpoints"
        );
        Ok(routed)
    }

    /// Route under the last command seen
    pub async fn current_routed(&self) -> Result<RoutedEndpoints> {
        let parsed = self
            .command
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .parsed
            .clone();
        self.route(parsed.as_ref()).await
    }

    fn push(&self, routed: RoutedEndpoints) {
        let urls = routed.into_urls(&self.ref_url);
        let subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for subscriber in subscribers {
            subscriber.notify(urls.clone());
        }
    }

    /// Forget and stop watching groups the current command no longer names
    async fn release_stale_groups(&self, keep: &[(String, u32)]) -> Result<()> {
        let own = self.ref_url.group().to_string();
        let stale: Vec<String> = self
            .cached_groups()
            .into_iter()
            .filter(|g| *g != own && !keep.iter().any(|(k, _)| k == g))
            .collect();

        for group in stale {
            self.group_cache.remove(&group);
            let listener: Arc<dyn ServiceListener> = self.as_listener()?;
            self.backend()?
                .unsubscribe_service(&self.group_url(&group), &listener)
                .await?;
            info!(service = %self.ref_url.service_key(), group = %group, "released merge group");
        }
        Ok(())
    }

    /// Drop every watch this manager armed
    pub async fn release(&self) -> Result<()> {
        let backend = self.backend()?;
        let me = self.as_listener()?;
        let service_listener: Arc<dyn ServiceListener> = me.clone();
        let command_listener: Arc<dyn CommandListener> = me;

        for group in self.cached_groups() {
            backend
                .unsubscribe_service(&self.group_url(&group), &service_listener)
                .await?;
        }
        backend
            .unsubscribe_service(&self.ref_url, &service_listener)
            .await?;
        backend
            .unsubscribe_command(&self.ref_url, &command_listener)
            .await?;
        self.group_cache.clear();
        Ok(())
    }
}

#[async_trait]
impl ServiceListener for ServiceManager {
    async fn notify_service(&self, service_url: &Url, _registry_url: &Url, urls: Vec<Url>) {
        let group = service_url.group().to_string();
        info!(
            service = %self.ref_url.service_key(),
            group = %group,
            count = urls.len(),
            "group endpoints changed"
        );
        self.group_cache.insert(group, urls);

        match self.current_routed().await {
            Ok(routed) => self.push(routed),
            Err(e) => error!(service = %self.ref_url.service_key(), "routing failed: {}", e),
        }
    }
}

#[async_trait]
impl CommandListener for ServiceManager {
    async fn notify_command(&self, service_url: &Url, command: Option<String>) {
        let command = if self.switcher.is_on_or(COMMAND_SWITCHER, true) {
            command.filter(|c| !c.trim().is_empty())
        } else {
            info!(service = %service_url.service_key(), "command switcher off, ignoring command");
            None
        };
        if !self.update_command(command) {
            debug!(service = %service_url.service_key(), "command unchanged");
            return;
        }
        info!(
            service = %service_url.service_key(),
            command = %self.current_command().unwrap_or_default(),
            "routing command changed"
        );

        let routed = match self.current_routed().await {
            Ok(routed) => routed,
            Err(e) => {
                error!(service = %self.ref_url.service_key(), "routing failed: {}", e);
                return;
            }
        };
        if let Err(e) = self.release_stale_groups(&routed.group_weights).await {
            warn!(service = %self.ref_url.service_key(), "releasing merge groups failed: {}", e);
        }
        self.push(routed);
    }
}
