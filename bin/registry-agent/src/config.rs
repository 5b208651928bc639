use anyhow::{Context, Result};
use registry_core::Url;
use serde::Deserialize;
use tracing::info;

pub const CONFIG_PATH_ENV: &str = "REGISTRY_AGENT_CONFIG";
pub const REGISTRY_URL_ENV: &str = "REGISTRY_URL";
pub const SERVICE_URL_ENV: &str = "SERVICE_URL";
pub const SUBSCRIBE_URLS_ENV: &str = "SUBSCRIBE_URLS";

const DEFAULT_REGISTRY: &str = "memory://127.0.0.1:2181";

/// Agent settings. Loaded from the YAML file named by
/// `REGISTRY_AGENT_CONFIG`, then overridden by environment variables.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub registry: String,
    pub service: Option<String>,
    pub subscribe: Vec<String>,
    /// Mark the registered service available once registered
    pub heartbeat: bool,
    pub command_enabled: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            registry: DEFAULT_REGISTRY.to_string(),
            service: None,
            subscribe: Vec::new(),
            heartbeat: true,
            command_enabled: true,
        }
    }
}

impl AgentConfig {
    pub fn load() -> Result<Self> {
        let mut config = match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) => {
                let raw = std::fs::read_to_string(&path)
                    .with_context(|| format!("reading agent config {}", path))?;
                info!("Agent configuration loaded from {}", path);
                Self::from_yaml(&raw)?
            }
            Err(_) => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        serde_yaml::from_str(raw).context("parsing agent config")
    }

    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(registry) = lookup(REGISTRY_URL_ENV) {
            self.registry = registry;
        }
        if let Some(service) = lookup(SERVICE_URL_ENV) {
            self.service = Some(service).filter(|s| !s.trim().is_empty());
        }
        if let Some(subscribe) = lookup(SUBSCRIBE_URLS_ENV) {
            self.subscribe = subscribe
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
    }

    pub fn registry_url(&self) -> Result<Url> {
        Url::parse(&self.registry).context("invalid registry url")
    }

    pub fn service_url(&self) -> Result<Option<Url>> {
        self.service
            .as_deref()
            .map(|s| Url::parse(s).context("invalid service url"))
            .transpose()
    }

    pub fn subscribe_urls(&self) -> Result<Vec<Url>> {
        self.subscribe
            .iter()
            .map(|s| Url::parse(s).with_context(|| format!("invalid subscribe url {}", s)))
            .collect()
    }
}
