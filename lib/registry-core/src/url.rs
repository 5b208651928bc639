//! Endpoint record exchanged by every registry
//!
//! External form: `protocol://host:port/path?key1=value1&key2=value2`.
//! Parameter order is preserved so a parsed record serializes back to the
//! same string.

use indexmap::IndexMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use crate::{RegistryError, Result};

pub const DEFAULT_GROUP: &str = "default_rpc";
pub const DEFAULT_RETRY_PERIOD_MS: u64 = 30_000;
pub const DEFAULT_SESSION_TIMEOUT_MS: u64 = 60_000;
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 1_000;

/// Parameter names read from endpoint records
pub mod params {
    pub const GROUP: &str = "group";
    pub const CHECK: &str = "check";
    pub const CODEC: &str = "codec";
    pub const RETRY_PERIOD: &str = "registryRetryPeriod";
    pub const SESSION_TIMEOUT: &str = "registrySessionTimeout";
    pub const CONNECT_TIMEOUT: &str = "connectTimeout";
    pub const ADDRESS: &str = "address";
    pub const WEIGHTS: &str = "weights";
    pub const LOCAL_IP: &str = "localIp";
}

/// Descriptor of one service endpoint plus its routing parameters
#[derive(Clone, Debug)]
pub struct Url {
    protocol: String,
    host: String,
    port: u16,
    path: String,
    parameters: IndexMap<String, String>,
}

impl Url {
    pub fn new(
        protocol: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        path: impl Into<String>,
    ) -> Self {
        Self {
            protocol: protocol.into(),
            host: host.into(),
            port,
            path: path.into(),
            parameters: IndexMap::new(),
        }
    }

    /// Parse the external form
    pub fn parse(value: &str) -> Result<Self> {
        let value = value.trim();
        let (protocol, rest) = value
            .split_once("://")
            .ok_or_else(|| RegistryError::InvalidUrl(format!("missing protocol: {}", value)))?;
        if protocol.is_empty() {
            return Err(RegistryError::InvalidUrl(format!("empty protocol: {}", value)));
        }

        let (location, query) = match rest.split_once('?') {
            Some((location, query)) => (location, Some(query)),
            None => (rest, None),
        };

        let (authority, path) = match location.split_once('/') {
            Some((authority, path)) => (authority, path),
            None => (location, ""),
        };

        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse::<u16>().map_err(|_| {
                    RegistryError::InvalidUrl(format!("invalid port '{}' in {}", port, value))
                })?;
                (host, port)
            }
            None => (authority, 0),
        };

        let mut url = Url::new(protocol, host, port, path);
        if let Some(query) = query {
            for pair in query.split('&').filter(|p| !p.is_empty()) {
                match pair.split_once('=') {
                    Some((key, val)) => url.add_parameter(key.trim(), val.trim()),
                    None => url.add_parameter(pair.trim(), ""),
                }
            }
        }
        Ok(url)
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Logical service name
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn parameters(&self) -> &IndexMap<String, String> {
        &self.parameters
    }

    pub fn parameter(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).map(String::as_str)
    }

    pub fn parameter_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.parameter(key).filter(|v| !v.is_empty()).unwrap_or(default)
    }

    /// Boolean parameter; anything other than `true` (case-insensitive) is false
    pub fn bool_parameter(&self, key: &str, default: bool) -> bool {
        match self.parameter(key).map(str::trim) {
            Some(v) if !v.is_empty() => v.eq_ignore_ascii_case("true"),
            _ => default,
        }
    }

    pub fn u64_parameter(&self, key: &str, default: u64) -> u64 {
        self.parameter(key)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }

    /// Insert or replace a parameter; a replaced key keeps its position
    pub fn add_parameter(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.parameters.insert(key.into(), value.into());
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.add_parameter(key, value);
        self
    }

    pub fn remove_parameter(&mut self, key: &str) -> Option<String> {
        self.parameters.shift_remove(key)
    }

    pub fn group(&self) -> &str {
        self.parameter_or(params::GROUP, DEFAULT_GROUP)
    }

    /// Copy of this record addressed at a different group
    pub fn with_group(&self, group: &str) -> Self {
        self.clone().with_parameter(params::GROUP, group)
    }

    /// Copy of this record pointing at another host and port
    pub fn with_host_port(&self, host: impl Into<String>, port: u16) -> Self {
        let mut url = self.clone();
        url.host = host.into();
        url.port = port;
        url
    }

    /// `host:port`
    pub fn identity(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// `group/path`
    pub fn service_key(&self) -> String {
        format!("{}/{}", self.group(), self.path)
    }

    /// `host:port/group/path`, one server of one service
    pub fn server_key(&self) -> String {
        format!("{}/{}", self.identity(), self.service_key())
    }

    /// Copy with parameters that must never reach a backend removed
    pub fn without_codec(&self) -> Self {
        let mut url = self.clone();
        url.remove_parameter(params::CODEC);
        url
    }

    /// `protocol://host:port/path`
    pub fn to_simple_str(&self) -> String {
        format!("{}://{}:{}/{}", self.protocol, self.host, self.port, self.path)
    }

    pub fn to_full_str(&self) -> String {
        let mut out = self.to_simple_str();
        for (i, (key, value)) in self.parameters.iter().enumerate() {
            out.push(if i == 0 { '?' } else { '&' });
            out.push_str(key);
            out.push('=');
            out.push_str(value);
        }
        out
    }
}

impl fmt::Display for Url {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_full_str())
    }
}

impl FromStr for Url {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self> {
        Url::parse(s)
    }
}

impl PartialEq for Url {
    fn eq(&self, other: &Self) -> bool {
        self.protocol == other.protocol
            && self.host == other.host
            && self.port == other.port
            && self.path == other.path
            && self.parameters == other.parameters
    }
}

impl Eq for Url {}

impl Hash for Url {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.protocol.hash(state);
        self.host.hash(state);
        self.port.hash(state);
        self.path.hash(state);
        // IndexMap equality ignores order, so the hash must too
        let mut pairs: Vec<(&String, &String)> = self.parameters.iter().collect();
        pairs.sort();
        pairs.hash(state);
    }
}
