//! Local address lookup used to evaluate route rules

use std::net::IpAddr;
use tracing::debug;

use crate::url::params;
use crate::Url;

/// Address route rules are matched against: the `localIp` parameter of the
/// registry record, else the first non-loopback interface, else 127.0.0.1
pub fn local_ip(registry_url: &Url) -> String {
    if let Some(ip) = registry_url
        .parameter(params::LOCAL_IP)
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
    {
        return ip.to_string();
    }
    resolve_local_ip().to_string()
}

fn resolve_local_ip() -> IpAddr {
    match local_ip_address::local_ip() {
        Ok(addr) => addr,
        Err(e) => {
            debug!("local address lookup failed, using loopback: {}", e);
            IpAddr::from([127, 0, 0, 1])
        }
    }
}
