//! Registry backend over a coordination store
//!
//! Registered endpoints live as ephemeral nodes under their service path;
//! subscribers watch the `server` children and the group's command node.
//! Ephemeral nodes and watches do not survive a session loss, so every new
//! session replays registrations, availability and watches.

use async_trait::async_trait;
use indexmap::{IndexMap, IndexSet};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use registry_core::listener::same_listener;
use registry_core::{CommandListener, RegistryBackend, Result, ServiceListener, Url};

use crate::paths::{self, NodeType};
use crate::store::{ChildWatch, CoordinationClient, DataEvent, DataWatch, NodeMode, SessionEvent, StoreError};

#[derive(Default)]
struct RegisteredState {
    registered: IndexSet<Url>,
    available: IndexSet<Url>,
}

struct Watch<L: ?Sized> {
    listener: Arc<L>,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct WatchState {
    services: IndexMap<Url, Vec<Watch<dyn ServiceListener>>>,
    commands: IndexMap<Url, Vec<Watch<dyn CommandListener>>>,
}

impl WatchState {
    fn abort_all(&mut self) {
        for watch in self.services.values().flatten() {
            watch.task.abort();
        }
        for watch in self.commands.values().flatten() {
            watch.task.abort();
        }
    }
}

pub struct CoordinationRegistry {
    url: Url,
    client: Arc<dyn CoordinationClient>,
    registrations: AsyncMutex<RegisteredState>,
    watches: AsyncMutex<WatchState>,
    session_task: Mutex<Option<JoinHandle<()>>>,
}

impl CoordinationRegistry {
    /// Must be called inside a tokio runtime; session events are followed
    /// for as long as the registry lives
    pub fn new(url: Url, client: Arc<dyn CoordinationClient>) -> Arc<Self> {
        let events = client.session_events();
        let registry = Arc::new(Self {
            url,
            client,
            registrations: AsyncMutex::new(RegisteredState::default()),
            watches: AsyncMutex::new(WatchState::default()),
            session_task: Mutex::new(None),
        });

        let task = tokio::spawn(follow_session(Arc::downgrade(&registry), events));
        *registry
            .session_task
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(task);
        info!(registry = %registry.url.identity(), session = %registry.client.session_id(), "coordination registry ready");
        registry
    }

    pub fn client(&self) -> &Arc<dyn CoordinationClient> {
        &self.client
    }

    pub async fn registered_urls(&self) -> Vec<Url> {
        self.registrations.lock().await.registered.iter().cloned().collect()
    }

    pub async fn available_urls(&self) -> Vec<Url> {
        self.registrations.lock().await.available.iter().cloned().collect()
    }

    pub async fn service_watch_count(&self) -> usize {
        self.watches.lock().await.services.values().map(Vec::len).sum()
    }

    pub async fn command_watch_count(&self) -> usize {
        self.watches.lock().await.commands.values().map(Vec::len).sum()
    }

    async fn remove_node(&self, url: &Url, node_type: NodeType) -> Result<()> {
        match self.client.delete(&paths::node_path(url, node_type)).await {
            Ok(()) | Err(StoreError::NoNode(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn create_node(&self, url: &Url, node_type: NodeType) -> Result<()> {
        let path = paths::node_path(url, node_type);
        self.client
            .create(&path, &url.to_full_str(), NodeMode::Ephemeral)
            .await?;
        debug!(path = %path, "created node");
        Ok(())
    }

    /// Replace both role nodes with one of `node_type`
    async fn switch_node(&self, url: &Url, node_type: NodeType) -> Result<()> {
        self.remove_node(url, NodeType::Available).await?;
        self.remove_node(url, NodeType::Unavailable).await?;
        self.create_node(url, node_type).await?;
        debug!(server = %url.server_key(), node = node_type.as_str(), "server node switched");
        Ok(())
    }

    async fn advertise_client(&self, url: &Url) -> Result<()> {
        self.remove_node(url, NodeType::Client).await?;
        self.create_node(url, NodeType::Client).await
    }

    async fn arm_service_watch(
        &self,
        url: &Url,
        listener: Arc<dyn ServiceListener>,
        refresh: bool,
    ) -> Result<Watch<dyn ServiceListener>> {
        let parent = paths::node_type_path(url, NodeType::Available);
        let events = self.client.watch_children(&parent).await?;
        let task = tokio::spawn(run_service_watch(
            self.client.clone(),
            self.url.clone(),
            url.clone(),
            listener.clone(),
            events,
            refresh,
        ));
        Ok(Watch { listener, task })
    }

    async fn arm_command_watch(
        &self,
        url: &Url,
        listener: Arc<dyn CommandListener>,
        refresh: bool,
    ) -> Result<Watch<dyn CommandListener>> {
        let events = self.client.watch_data(&paths::command_path(url)).await?;
        let task = tokio::spawn(run_command_watch(
            self.client.clone(),
            url.clone(),
            listener.clone(),
            events,
            refresh,
        ));
        Ok(Watch { listener, task })
    }

    /// Replay local state into a fresh session
    async fn recover(&self) {
        let (registered, available) = {
            let state = self.registrations.lock().await;
            (
                state.registered.iter().cloned().collect::<Vec<_>>(),
                state.available.iter().cloned().collect::<Vec<_>>(),
            )
        };
        info!(
            registry = %self.url.identity(),
            registered = registered.len(),
            available = available.len(),
            "recovering after session loss"
        );

        for url in &registered {
            if let Err(e) = self.do_register(url).await {
                error!(url = %url.to_simple_str(), "re-register failed: {}", e);
            }
        }
        for url in &available {
            if let Err(e) = self.do_available(url).await {
                error!(url = %url.to_simple_str(), "re-available failed: {}", e);
            }
        }
        self.rearm_watches().await;
    }

    async fn rearm_watches(&self) {
        let mut watches = self.watches.lock().await;

        let services: Vec<Url> = watches.services.keys().cloned().collect();
        for url in services {
            if let Err(e) = self.advertise_client(&url).await {
                warn!(url = %url.to_simple_str(), "re-creating client node failed: {}", e);
            }
            let Some(existing) = watches.services.get_mut(&url) else {
                continue;
            };
            for watch in existing.iter_mut() {
                match self.arm_service_watch(&url, watch.listener.clone(), true).await {
                    Ok(fresh) => std::mem::replace(watch, fresh).task.abort(),
                    Err(e) => error!(url = %url.to_simple_str(), "re-arming service watch failed: {}", e),
                }
            }
        }

        let commands: Vec<Url> = watches.commands.keys().cloned().collect();
        for url in commands {
            let Some(existing) = watches.commands.get_mut(&url) else {
                continue;
            };
            for watch in existing.iter_mut() {
                match self.arm_command_watch(&url, watch.listener.clone(), true).await {
                    Ok(fresh) => std::mem::replace(watch, fresh).task.abort(),
                    Err(e) => error!(url = %url.to_simple_str(), "re-arming command watch failed: {}", e),
                }
            }
        }
    }
}

impl Drop for CoordinationRegistry {
    fn drop(&mut self) {
        if let Some(task) = self
            .session_task
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
        }
        self.watches.get_mut().abort_all();
    }
}

async fn follow_session(
    registry: Weak<CoordinationRegistry>,
    mut events: broadcast::Receiver<SessionEvent>,
) {
    loop {
        match events.recv().await {
            Ok(SessionEvent::NewSession) => {
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                registry.recover().await;
            }
            Ok(event) => debug!(?event, "coordination session event"),
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "missed coordination session events");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

/// Child names to endpoint records. Malformed payloads are skipped; an
/// empty payload is rebuilt from the `host:port` node name.
async fn load_endpoints(
    client: &dyn CoordinationClient,
    service_url: &Url,
    parent: &str,
    children: Vec<String>,
) -> Vec<Url> {
    let mut urls = Vec::with_capacity(children.len());
    for child in children {
        let data = match client.read_data(&format!("{}/{}", parent, child)).await {
            Ok(Some(data)) => data,
            Ok(None) => continue,
            Err(e) => {
                warn!(node = %child, "reading node failed: {}", e);
                continue;
            }
        };

        if data.trim().is_empty() {
            match paths::parse_node_name(&child) {
                Some((host, port)) => urls.push(service_url.with_host_port(host, port)),
                None => warn!(node = %child, "skipping node without payload or address name"),
            }
            continue;
        }
        match Url::parse(&data) {
            Ok(url) => urls.push(url),
            Err(e) => warn!(node = %child, "skipping malformed node payload: {}", e),
        }
    }
    urls
}

async fn discover_children(client: &dyn CoordinationClient, service_url: &Url) -> Result<Vec<Url>> {
    let parent = paths::node_type_path(service_url, NodeType::Available);
    let children = match client.children(&parent).await {
        Ok(children) => children,
        Err(StoreError::NoNode(_)) => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    Ok(load_endpoints(client, service_url, &parent, children).await)
}

async fn run_service_watch(
    client: Arc<dyn CoordinationClient>,
    registry_url: Url,
    service_url: Url,
    listener: Arc<dyn ServiceListener>,
    mut events: ChildWatch,
    refresh: bool,
) {
    if refresh {
        match discover_children(client.as_ref(), &service_url).await {
            Ok(urls) => listener.notify_service(&service_url, &registry_url, urls).await,
            Err(e) => warn!(url = %service_url.to_simple_str(), "refreshing endpoints failed: {}", e),
        }
    }

    let parent = paths::node_type_path(&service_url, NodeType::Available);
    while let Some(children) = events.recv().await {
        let urls = load_endpoints(client.as_ref(), &service_url, &parent, children).await;
        info!(url = %service_url.to_simple_str(), count = urls.len(), "service nodes changed");
        listener.notify_service(&service_url, &registry_url, urls).await;
    }
    debug!(url = %service_url.to_simple_str(), "service watch closed");
}

async fn run_command_watch(
    client: Arc<dyn CoordinationClient>,
    service_url: Url,
    listener: Arc<dyn CommandListener>,
    mut events: DataWatch,
    refresh: bool,
) {
    if refresh {
        match client.read_data(&paths::command_path(&service_url)).await {
            Ok(command) => listener.notify_command(&service_url, command).await,
            Err(e) => warn!(url = %service_url.to_simple_str(), "refreshing command failed: {}", e),
        }
    }

    while let Some(event) = events.recv().await {
        let command = match event {
            DataEvent::Changed(data) => Some(data),
            DataEvent::Deleted => None,
        };
        info!(url = %service_url.to_simple_str(), deleted = command.is_none(), "command node changed");
        listener.notify_command(&service_url, command).await;
    }
    debug!(url = %service_url.to_simple_str(), "command watch closed");
}

#[async_trait]
impl RegistryBackend for CoordinationRegistry {
    fn url(&self) -> &Url {
        &self.url
    }

    async fn do_register(&self, url: &Url) -> Result<()> {
        let mut state = self.registrations.lock().await;
        self.switch_node(url, NodeType::Unavailable).await?;
        state.registered.insert(url.clone());
        Ok(())
    }

    async fn do_unregister(&self, url: &Url) -> Result<()> {
        let mut state = self.registrations.lock().await;
        self.remove_node(url, NodeType::Available).await?;
        self.remove_node(url, NodeType::Unavailable).await?;
        state.registered.shift_remove(url);
        state.available.shift_remove(url);
        Ok(())
    }

    async fn do_available(&self, url: &Url) -> Result<()> {
        let mut state = self.registrations.lock().await;
        self.switch_node(url, NodeType::Available).await?;
        state.available.insert(url.clone());
        Ok(())
    }

    async fn do_unavailable(&self, url: &Url) -> Result<()> {
        let mut state = self.registrations.lock().await;
        self.switch_node(url, NodeType::Unavailable).await?;
        state.available.shift_remove(url);
        Ok(())
    }

    async fn discover_service(&self, url: &Url) -> Result<Vec<Url>> {
        discover_children(self.client.as_ref(), url).await
    }

    async fn discover_command(&self, url: &Url) -> Result<Option<String>> {
        Ok(self.client.read_data(&paths::command_path(url)).await?)
    }

    async fn subscribe_service(&self, url: &Url, listener: Arc<dyn ServiceListener>) -> Result<()> {
        let mut watches = self.watches.lock().await;
        self.advertise_client(url).await?;
        let watch = self.arm_service_watch(url, listener, false).await?;

        let entry = watches.services.entry(url.clone()).or_default();
        match entry.iter().position(|w| same_listener(&w.listener, &watch.listener)) {
            Some(idx) => std::mem::replace(&mut entry[idx], watch).task.abort(),
            None => entry.push(watch),
        }
        info!(url = %url.to_simple_str(), "watching service nodes");
        Ok(())
    }

    async fn unsubscribe_service(&self, url: &Url, listener: &Arc<dyn ServiceListener>) -> Result<()> {
        let mut watches = self.watches.lock().await;
        let Some(entry) = watches.services.get_mut(url) else {
            return Ok(());
        };
        entry.retain(|w| {
            let keep = !same_listener(&w.listener, listener);
            if !keep {
                w.task.abort();
            }
            keep
        });
        if entry.is_empty() {
            watches.services.shift_remove(url);
            self.remove_node(url, NodeType::Client).await?;
        }
        info!(url = %url.to_simple_str(), "stopped watching service nodes");
        Ok(())
    }

    async fn subscribe_command(&self, url: &Url, listener: Arc<dyn CommandListener>) -> Result<()> {
        let mut watches = self.watches.lock().await;
        let watch = self.arm_command_watch(url, listener, false).await?;

        let entry = watches.commands.entry(url.clone()).or_default();
        match entry.iter().position(|w| same_listener(&w.listener, &watch.listener)) {
            Some(idx) => std::mem::replace(&mut entry[idx], watch).task.abort(),
            None => entry.push(watch),
        }
        info!(url = %url.to_simple_str(), "watching command node");
        Ok(())
    }

    async fn unsubscribe_command(&self, url: &Url, listener: &Arc<dyn CommandListener>) -> Result<()> {
        let mut watches = self.watches.lock().await;
        let Some(entry) = watches.commands.get_mut(url) else {
            return Ok(());
        };
        entry.retain(|w| {
            let keep = !same_listener(&w.listener, listener);
            if !keep {
                w.task.abort();
            }
            keep
        });
        if entry.is_empty() {
            watches.commands.shift_remove(url);
        }
        info!(url = %url.to_simple_str(), "stopped watching command node");
        Ok(())
    }
}
