//! Callback interfaces between registries, backends and consumers

use async_trait::async_trait;
use std::sync::Arc;

use crate::Url;

/// Receives the current endpoint list of a subscribed service
pub trait NotifyListener: Send + Sync {
    fn notify(&self, registry_url: &Url, urls: Vec<Url>);
}

impl<F> NotifyListener for F
where
    F: Fn(&Url, Vec<Url>) + Send + Sync,
{
    fn notify(&self, registry_url: &Url, urls: Vec<Url>) {
        self(registry_url, urls)
    }
}

/// Receives the children of a watched service group from a backend
#[async_trait]
pub trait ServiceListener: Send + Sync {
    async fn notify_service(&self, service_url: &Url, registry_url: &Url, urls: Vec<Url>);
}

/// Receives the raw routing command document; `None` means it was removed
#[async_trait]
pub trait CommandListener: Send + Sync {
    async fn notify_command(&self, service_url: &Url, command: Option<String>);
}

/// Listener identity is the allocation, not the value
pub fn same_listener<T: ?Sized>(a: &Arc<T>, b: &Arc<T>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_closure_listener() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let listener: Arc<dyn NotifyListener> = Arc::new(move |_: &Url, urls: Vec<Url>| {
            sink.lock().unwrap().extend(urls);
        });

        let registry = Url::new("memory", "r", 0, "");
        listener.notify(&registry, vec![Url::new("rpc", "h", 1, "s")]);
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_same_listener() {
        let a: Arc<dyn NotifyListener> = Arc::new(|_: &Url, _: Vec<Url>| {});
        let b: Arc<dyn NotifyListener> = Arc::new(|_: &Url, _: Vec<Url>| {});
        assert!(same_listener(&a, &a.clone()));
        assert!(!same_listener(&a, &b));
    }
}
