//! In-process coordination store
//!
//! A shared node tree with persistent and ephemeral nodes, child and data
//! watches, and per-session expiry. Several `MemorySession`s can share one
//! `MemoryStore`, which is how tests model independent processes.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info};
use uuid::Uuid;

use crate::store::{
    ChildWatch, CoordinationClient, DataEvent, DataWatch, NodeMode, SessionEvent, StoreError,
    StoreResult,
};

const SESSION_EVENT_CAPACITY: usize = 64;

struct Node {
    data: String,
    mode: NodeMode,
    owner: Uuid,
}

struct Watcher<T> {
    session: Uuid,
    sender: mpsc::UnboundedSender<T>,
}

#[derive(Default)]
struct Tree {
    nodes: BTreeMap<String, Node>,
    child_watches: HashMap<String, Vec<Watcher<Vec<String>>>>,
    data_watches: HashMap<String, Vec<Watcher<DataEvent>>>,
}

fn parent(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &path[..idx],
    }
}

fn validate(path: &str) -> StoreResult<()> {
    let valid = path.starts_with('/')
        && (path == "/" || path[1..].split('/').all(|segment| !segment.is_empty()));
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidPath(path.to_string()))
    }
}

impl Tree {
    fn exists(&self, path: &str) -> bool {
        path == "/" || self.nodes.contains_key(path)
    }

    fn children(&self, path: &str) -> Vec<String> {
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{}/", path)
        };
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .map(|(key, _)| &key[prefix.len()..])
            .filter(|rest| !rest.contains('/'))
            .map(str::to_string)
            .collect()
    }

    fn fire_children(&mut self, path: &str) {
        let children = self.children(path);
        if let Some(watchers) = self.child_watches.get_mut(path) {
            watchers.retain(|w| w.sender.send(children.clone()).is_ok());
        }
    }

    fn fire_data(&mut self, path: &str, event: DataEvent) {
        if let Some(watchers) = self.data_watches.get_mut(path) {
            watchers.retain(|w| w.sender.send(event.clone()).is_ok());
        }
    }

    fn insert(&mut self, path: &str, data: &str, mode: NodeMode, owner: Uuid) -> StoreResult<()> {
        validate(path)?;
        if self.exists(path) {
            return Err(StoreError::NodeExists(path.to_string()));
        }

        let mut missing = Vec::new();
        let mut ancestor = parent(path);
        while !self.exists(ancestor) {
            missing.push(ancestor.to_string());
            ancestor = parent(ancestor);
        }
        for ancestor in missing.into_iter().rev() {
            self.nodes.insert(
                ancestor.clone(),
                Node {
                    data: String::new(),
                    mode: NodeMode::Persistent,
                    owner,
                },
            );
            self.fire_children(parent(&ancestor));
            self.fire_data(&ancestor, DataEvent::Changed(String::new()));
        }

        self.nodes.insert(
            path.to_string(),
            Node {
                data: data.to_string(),
                mode,
                owner,
            },
        );
        self.fire_children(parent(path));
        self.fire_data(path, DataEvent::Changed(data.to_string()));
        Ok(())
    }

    fn remove(&mut self, path: &str) -> StoreResult<()> {
        if !self.nodes.contains_key(path) {
            return Err(StoreError::NoNode(path.to_string()));
        }
        if !self.children(path).is_empty() {
            return Err(StoreError::NotEmpty(path.to_string()));
        }
        self.nodes.remove(path);
        self.fire_children(parent(path));
        self.fire_data(path, DataEvent::Deleted);
        Ok(())
    }

    /// Forget the watches and ephemeral nodes of a finished session
    fn drop_session(&mut self, session: Uuid) {
        for watchers in self.child_watches.values_mut() {
            watchers.retain(|w| w.session != session);
        }
        for watchers in self.data_watches.values_mut() {
            watchers.retain(|w| w.session != session);
        }

        let mut owned: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.mode == NodeMode::Ephemeral && node.owner == session)
            .map(|(path, _)| path.clone())
            .collect();
        owned.sort_by_key(|path| std::cmp::Reverse(path.len()));
        for path in owned {
            let _ = self.remove(&path);
        }
    }
}

/// Shared node tree; cheap to clone
#[derive(Clone, Default)]
pub struct MemoryStore {
    tree: Arc<Mutex<Tree>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tree(&self) -> MutexGuard<'_, Tree> {
        self.tree.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Open a new session against this store
    pub fn connect(&self) -> Arc<MemorySession> {
        let (events, _) = broadcast::channel(SESSION_EVENT_CAPACITY);
        let session = Arc::new(MemorySession {
            store: self.clone(),
            id: Mutex::new(Uuid::new_v4()),
            available: AtomicBool::new(true),
            events,
        });
        debug!(session = %session.session_id(), "memory session opened");
        session
    }

    pub fn contains(&self, path: &str) -> bool {
        self.tree().exists(path)
    }

    pub fn node_count(&self) -> usize {
        self.tree().nodes.len()
    }
}

pub struct MemorySession {
    store: MemoryStore,
    id: Mutex<Uuid>,
    available: AtomicBool,
    events: broadcast::Sender<SessionEvent>,
}

impl MemorySession {
    fn id(&self) -> Uuid {
        *self.id.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn connected(&self) -> StoreResult<Uuid> {
        if self.available.load(Ordering::SeqCst) {
            Ok(self.id())
        } else {
            Err(StoreError::ConnectionLoss)
        }
    }

    pub fn store(&self) -> &MemoryStore {
        &self.store
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Simulate losing or regaining the connection. While unavailable every
    /// operation fails with `ConnectionLoss`; the session itself survives.
    pub fn set_available(&self, available: bool) {
        if self.available.swap(available, Ordering::SeqCst) != available {
            let event = if available {
                SessionEvent::Connected
            } else {
                SessionEvent::Disconnected
            };
            info!(session = %self.session_id(), ?event, "memory session connectivity changed");
            let _ = self.events.send(event);
        }
    }

    /// Expire the session: its ephemeral nodes and watches are dropped and a
    /// fresh session takes its place
    pub fn expire(&self) {
        let old = self.id();
        self.store.tree().drop_session(old);
        let fresh = Uuid::new_v4();
        *self.id.lock().unwrap_or_else(|e| e.into_inner()) = fresh;
        info!(old = %old, new = %fresh, "memory session expired");

        let _ = self.events.send(SessionEvent::Expired);
        let _ = self.events.send(SessionEvent::NewSession);
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        self.store.tree().drop_session(self.id());
    }
}

#[async_trait]
impl CoordinationClient for MemorySession {
    fn session_id(&self) -> String {
        self.id().to_string()
    }

    async fn create(&self, path: &str, data: &str, mode: NodeMode) -> StoreResult<()> {
        let session = self.connected()?;
        self.store.tree().insert(path, data, mode, session)
    }

    async fn delete(&self, path: &str) -> StoreResult<()> {
        self.connected()?;
        self.store.tree().remove(path)
    }

    async fn exists(&self, path: &str) -> StoreResult<bool> {
        self.connected()?;
        Ok(self.store.tree().exists(path))
    }

    async fn set_data(&self, path: &str, data: &str) -> StoreResult<()> {
        self.connected()?;
        let mut tree = self.store.tree();
        match tree.nodes.get_mut(path) {
            Some(node) => node.data = data.to_string(),
            None => return Err(StoreError::NoNode(path.to_string())),
        }
        tree.fire_data(path, DataEvent::Changed(data.to_string()));
        Ok(())
    }

    async fn read_data(&self, path: &str) -> StoreResult<Option<String>> {
        self.connected()?;
        Ok(self.store.tree().nodes.get(path).map(|node| node.data.clone()))
    }

    async fn children(&self, path: &str) -> StoreResult<Vec<String>> {
        self.connected()?;
        let tree = self.store.tree();
        if !tree.exists(path) {
            return Err(StoreError::NoNode(path.to_string()));
        }
        Ok(tree.children(path))
    }

    async fn watch_children(&self, path: &str) -> StoreResult<ChildWatch> {
        let session = self.connected()?;
        validate(path)?;
        let (sender, receiver) = mpsc::unbounded_channel();
        self.store
            .tree()
            .child_watches
            .entry(path.to_string())
            .or_default()
            .push(Watcher { session, sender });
        Ok(receiver)
    }

    async fn watch_data(&self, path: &str) -> StoreResult<DataWatch> {
        let session = self.connected()?;
        validate(path)?;
        let (sender, receiver) = mpsc::unbounded_channel();
        self.store
            .tree()
            .data_watches
            .entry(path.to_string())
            .or_default()
            .push(Watcher { session, sender });
        Ok(receiver)
    }

    fn session_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_builds_parents() {
        let store = MemoryStore::new();
        let session = store.connect();
        session
            .create("/registry/g1/service/a", "payload", NodeMode::Persistent)
            .await
            .unwrap();

        assert!(session.exists("/registry/g1").await.unwrap());
        assert_eq!(session.children("/registry/g1/service").await.unwrap(), vec!["a"]);
        assert_eq!(
            session.read_data("/registry/g1/service/a").await.unwrap().as_deref(),
            Some("payload")
        );
        assert_eq!(session.read_data("/registry/none").await.unwrap(), None);
        assert_eq!(
            session.create("/registry/g1/service/a", "", NodeMode::Persistent).await,
            Err(StoreError::NodeExists("/registry/g1/service/a".to_string()))
        );
    }

    #[tokio::test]
    async fn test_delete_rules() {
        let store = MemoryStore::new();
        let session = store.connect();
        session.create("/a/b", "", NodeMode::Persistent).await.unwrap();

        assert!(matches!(session.delete("/a").await, Err(StoreError::NotEmpty(_))));
        assert!(matches!(session.delete("/a/c").await, Err(StoreError::NoNode(_))));
        session.delete("/a/b").await.unwrap();
        session.delete("/a").await.unwrap();
        assert_eq!(store.node_count(), 0);
    }

    #[tokio::test]
    async fn test_invalid_paths() {
        let session = MemoryStore::new().connect();
        for bad in ["relative", "/trailing/", "/double//slash", ""] {
            assert!(matches!(
                session.create(bad, "", NodeMode::Persistent).await,
                Err(StoreError::InvalidPath(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_child_watch_sees_changes() {
        let store = MemoryStore::new();
        let session = store.connect();
        let mut watch = session.watch_children("/svc/server").await.unwrap();

        session
            .create("/svc/server/10.0.0.1:80", "", NodeMode::Ephemeral)
            .await
            .unwrap();
        assert_eq!(watch.recv().await.unwrap(), vec!["10.0.0.1:80"]);

        session
            .create("/svc/server/10.0.0.2:80", "", NodeMode::Ephemeral)
            .await
            .unwrap();
        assert_eq!(watch.recv().await.unwrap(), vec!["10.0.0.1:80", "10.0.0.2:80"]);

        session.delete("/svc/server/10.0.0.1:80").await.unwrap();
        assert_eq!(watch.recv().await.unwrap(), vec!["10.0.0.2:80"]);
    }

    #[tokio::test]
    async fn test_data_watch_changed_and_deleted() {
        let store = MemoryStore::new();
        let session = store.connect();
        let mut watch = session.watch_data("/cmd").await.unwrap();

        session.create("/cmd", "v1", NodeMode::Persistent).await.unwrap();
        session.set_data("/cmd", "v2").await.unwrap();
        session.delete("/cmd").await.unwrap();

        assert_eq!(watch.recv().await.unwrap(), DataEvent::Changed("v1".into()));
        assert_eq!(watch.recv().await.unwrap(), DataEvent::Changed("v2".into()));
        assert_eq!(watch.recv().await.unwrap(), DataEvent::Deleted);
        assert!(matches!(session.set_data("/cmd", "v3").await, Err(StoreError::NoNode(_))));
    }

    #[tokio::test]
    async fn test_expire_drops_ephemerals_and_watches() {
        let store = MemoryStore::new();
        let server = store.connect();
        let observer = store.connect();
        let mut events = server.session_events();

        server.create("/svc/server/a:1", "", NodeMode::Ephemeral).await.unwrap();
        let mut own_watch = server.watch_children("/svc/server").await.unwrap();
        let mut other_watch = observer.watch_children("/svc/server").await.unwrap();
        let old_id = server.session_id();

        server.expire();

        assert!(!store.contains("/svc/server/a:1"));
        assert!(store.contains("/svc/server"));
        assert_ne!(server.session_id(), old_id);
        assert_eq!(other_watch.recv().await.unwrap(), Vec::<String>::new());
        assert!(own_watch.recv().await.is_none());
        assert_eq!(events.recv().await.unwrap(), SessionEvent::Expired);
        assert_eq!(events.recv().await.unwrap(), SessionEvent::NewSession);
    }

    #[tokio::test]
    async fn test_unavailable_session_loses_connection() {
        let session = MemoryStore::new().connect();
        let mut events = session.session_events();
        session.set_available(false);

        assert_eq!(
            session.create("/a", "", NodeMode::Persistent).await,
            Err(StoreError::ConnectionLoss)
        );
        assert!(matches!(session.watch_data("/a").await, Err(StoreError::ConnectionLoss)));

        session.set_available(true);
        session.create("/a", "", NodeMode::Persistent).await.unwrap();
        assert_eq!(events.recv().await.unwrap(), SessionEvent::Disconnected);
        assert_eq!(events.recv().await.unwrap(), SessionEvent::Connected);
    }

    #[tokio::test]
    async fn test_dropped_session_releases_ephemerals() {
        let store = MemoryStore::new();
        let session = store.connect();
        session.create("/svc/client/a:1", "", NodeMode::Ephemeral).await.unwrap();
        drop(session);
        assert!(!store.contains("/svc/client/a:1"));
    }
}
