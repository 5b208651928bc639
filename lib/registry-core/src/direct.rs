//! Static backend serving a fixed endpoint list
//!
//! Endpoints come from the `address` parameter (`host:port,host:port`), or
//! from the registry record's own host and port when that is absent.
//! Registration and availability changes are accepted and ignored.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use crate::base::Subscriber;
use crate::listener::NotifyListener;
use crate::registry::RegistryOps;
use crate::url::params;
use crate::{RegistryError, Result, Url};

pub struct DirectRegistry {
    addresses: Vec<(String, u16)>,
}

impl DirectRegistry {
    pub fn new(registry_url: &Url) -> Result<Self> {
        let addresses = match registry_url.parameter(params::ADDRESS) {
            Some(list) => parse_addresses(list)?,
            None if !registry_url.host().is_empty() => {
                vec![(registry_url.host().to_string(), registry_url.port())]
            }
            None => {
                return Err(RegistryError::InvalidConfiguration(format!(
                    "direct registry needs an address: {}",
                    registry_url
                )))
            }
        };
        debug!(count = addresses.len(), "direct registry addresses");
        Ok(Self { addresses })
    }

    pub fn addresses(&self) -> &[(String, u16)] {
        &self.addresses
    }
}

fn parse_addresses(list: &str) -> Result<Vec<(String, u16)>> {
    let invalid =
        |entry: &str| RegistryError::InvalidConfiguration(format!("invalid direct address '{}' in '{}'", entry, list));

    let mut addresses = Vec::new();
    for entry in list.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (host, port) = entry.rsplit_once(':').ok_or_else(|| invalid(entry))?;
        let port = port.parse::<u16>().map_err(|_| invalid(entry))?;
        if host.is_empty() {
            return Err(invalid(entry));
        }
        addresses.push((host.to_string(), port));
    }
    if addresses.is_empty() {
        return Err(invalid(list));
    }
    Ok(addresses)
}

#[async_trait]
impl RegistryOps for DirectRegistry {
    async fn do_register(&self, _url: &Url) -> Result<()> {
        Ok(())
    }

    async fn do_unregister(&self, _url: &Url) -> Result<()> {
        Ok(())
    }

    async fn do_subscribe(&self, subscriber: Subscriber) -> Result<()> {
        let urls = self.do_discover(subscriber.url()).await?;
        subscriber.notify(urls);
        Ok(())
    }

    async fn do_unsubscribe(&self, _url: &Url, _listener: &Arc<dyn NotifyListener>) -> Result<()> {
        Ok(())
    }

    async fn do_discover(&self, url: &Url) -> Result<Vec<Url>> {
        Ok(self
            .addresses
            .iter()
            .map(|(host, port)| url.with_host_port(host.as_str(), *port))
            .collect())
    }

    async fn do_available(&self, _url: &Url) -> Result<()> {
        Ok(())
    }

    async fn do_unavailable(&self, _url: &Url) -> Result<()> {
        Ok(())
    }
}
