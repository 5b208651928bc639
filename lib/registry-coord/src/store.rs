//! Primitives of a tree-structured coordination store

use async_trait::async_trait;
use registry_core::RegistryError;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("node already exists: {0}")]
    NodeExists(String),

    #[error("no such node: {0}")]
    NoNode(String),

    #[error("node has children: {0}")]
    NotEmpty(String),

    #[error("invalid node path: {0}")]
    InvalidPath(String),

    #[error("connection to the coordination store lost")]
    ConnectionLoss,

    #[error("coordination session expired")]
    SessionExpired,
}

impl From<StoreError> for RegistryError {
    fn from(e: StoreError) -> Self {
        RegistryError::Backend(e.to_string())
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeMode {
    Persistent,
    /// Removed when the creating session ends
    Ephemeral,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DataEvent {
    Changed(String),
    Deleted,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionEvent {
    Connected,
    Disconnected,
    Expired,
    /// A fresh session replaced an expired one; ephemeral nodes and watches
    /// of the old session are gone
    NewSession,
}

/// Child-list snapshots, delivered whenever the watched node's children change
pub type ChildWatch = mpsc::UnboundedReceiver<Vec<String>>;

pub type DataWatch = mpsc::UnboundedReceiver<DataEvent>;

/// One client session against a coordination store. Watches stay armed
/// until the receiver is dropped or the session expires.
#[async_trait]
pub trait CoordinationClient: Send + Sync {
    fn session_id(&self) -> String;

    /// Create a node, creating missing parents as persistent nodes
    async fn create(&self, path: &str, data: &str, mode: NodeMode) -> StoreResult<()>;

    async fn delete(&self, path: &str) -> StoreResult<()>;

    async fn exists(&self, path: &str) -> StoreResult<bool>;

    async fn set_data(&self, path: &str, data: &str) -> StoreResult<()>;

    /// `None` when the node does not exist
    async fn read_data(&self, path: &str) -> StoreResult<Option<String>>;

    /// Child names, sorted
    async fn children(&self, path: &str) -> StoreResult<Vec<String>>;

    /// The node need not exist yet
    async fn watch_children(&self, path: &str) -> StoreResult<ChildWatch>;

    async fn watch_data(&self, path: &str) -> StoreResult<DataWatch>;

    fn session_events(&self) -> broadcast::Receiver<SessionEvent>;
}
