use anyhow::Result;
use registry_coord::RegistryFactory;
use registry_core::switcher::{COMMAND_SWITCHER, HEARTBEAT_SWITCHER};
use registry_core::{LocalSwitcherService, NotifyListener, Registry, SwitcherService, Url};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod config;

use config::AgentConfig;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting registry-agent...");
    let config = AgentConfig::load()?;

    let switcher: Arc<dyn SwitcherService> = Arc::new(LocalSwitcherService::new());
    switcher.set_value(COMMAND_SWITCHER, config.command_enabled);

    let factory = RegistryFactory::new(switcher.clone());
    let registry = factory.get_registry(&config.registry_url()?).await?;
    info!("Registry {} ready", registry.url().identity());

    let service = config.service_url()?;
    if let Some(service) = &service {
        registry.register(service).await?;
        info!("Registered {}", service.to_simple_str());
        if config.heartbeat {
            // flipping the switch marks every registered endpoint available
            switcher.set_value(HEARTBEAT_SWITCHER, true);
        }
    }

    let mut subscriptions = Vec::new();
    for url in config.subscribe_urls()? {
        let listener = logging_listener(&url);
        registry.subscribe(&url, listener.clone()).await?;
        info!("Subscribed to {}", url.service_key());
        subscriptions.push((url, listener));
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down registry-agent...");

    for (url, listener) in &subscriptions {
        if let Err(e) = registry.unsubscribe(url, listener).await {
            warn!("Failed to unsubscribe {}: {}", url.service_key(), e);
        }
    }
    if let Some(service) = &service {
        if let Err(e) = registry.unregister(service).await {
            warn!("Failed to unregister {}: {}", service.to_simple_str(), e);
        }
    }
    factory.shutdown().await;

    Ok(())
}

fn logging_listener(subscription: &Url) -> Arc<dyn NotifyListener> {
    let service = subscription.service_key();
    Arc::new(move |registry_url: &Url, urls: Vec<Url>| {
        let endpoints: Vec<String> = urls.iter().map(|u| u.to_simple_str()).collect();
        info!(
            service = %service,
            registry = %registry_url.identity(),
            count = urls.len(),
            "endpoints: [{}]",
            endpoints.join(", ")
        );
    })
}
