//! Registry capability and the hook traits the layers are built from
//!
//! A full stack is assembled by composition, one concern per layer:
//! `FailbackRegistry` (retry) over `BaseRegistry` (caching, notification)
//! over a `RegistryOps` implementation such as `CommandRegistry` (weighted
//! routing), which drives a `RegistryBackend` (coordination primitives).

use async_trait::async_trait;
use std::sync::Arc;

use crate::base::Subscriber;
use crate::listener::{CommandListener, NotifyListener, ServiceListener};
use crate::{Result, Url};

/// Operations every registry exposes to its callers
#[async_trait]
pub trait Registry: Send + Sync {
    /// Address of the registry itself
    fn url(&self) -> &Url;

    async fn register(&self, url: &Url) -> Result<()>;

    async fn unregister(&self, url: &Url) -> Result<()>;

    async fn subscribe(&self, url: &Url, listener: Arc<dyn NotifyListener>) -> Result<()>;

    async fn unsubscribe(&self, url: &Url, listener: &Arc<dyn NotifyListener>) -> Result<()>;

    async fn discover(&self, url: &Url) -> Result<Vec<Url>>;

    /// `None` applies to every locally registered endpoint
    async fn available(&self, url: Option<&Url>) -> Result<()>;

    /// `None` applies to every locally registered endpoint
    async fn unavailable(&self, url: Option<&Url>) -> Result<()>;

    fn registered_service_urls(&self) -> Vec<Url>;
}

/// Backend-specific hooks called by `BaseRegistry`
#[async_trait]
pub trait RegistryOps: Send + Sync {
    async fn do_register(&self, url: &Url) -> Result<()>;

    async fn do_unregister(&self, url: &Url) -> Result<()>;

    async fn do_subscribe(&self, subscriber: Subscriber) -> Result<()>;

    async fn do_unsubscribe(&self, url: &Url, listener: &Arc<dyn NotifyListener>) -> Result<()>;

    async fn do_discover(&self, url: &Url) -> Result<Vec<Url>>;

    async fn do_available(&self, url: &Url) -> Result<()>;

    async fn do_unavailable(&self, url: &Url) -> Result<()>;
}

/// Low-level primitives of a coordination technology
#[async_trait]
pub trait RegistryBackend: Send + Sync {
    fn url(&self) -> &Url;

    async fn do_register(&self, url: &Url) -> Result<()>;

    async fn do_unregister(&self, url: &Url) -> Result<()>;

    async fn do_available(&self, url: &Url) -> Result<()>;

    async fn do_unavailable(&self, url: &Url) -> Result<()>;

    /// Current endpoints of the group named by `url`
    async fn discover_service(&self, url: &Url) -> Result<Vec<Url>>;

    /// Current raw command document for the service, if any
    async fn discover_command(&self, url: &Url) -> Result<Option<String>>;

    async fn subscribe_service(&self, url: &Url, listener: Arc<dyn ServiceListener>) -> Result<()>;

    async fn unsubscribe_service(&self, url: &Url, listener: &Arc<dyn ServiceListener>) -> Result<()>;

    async fn subscribe_command(&self, url: &Url, listener: Arc<dyn CommandListener>) -> Result<()>;

    async fn unsubscribe_command(&self, url: &Url, listener: &Arc<dyn CommandListener>) -> Result<()>;
}
