//! Named boolean feature switches

use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

/// Registration implies availability while this is on
pub const HEARTBEAT_SWITCHER: &str = "registry.heartbeat.enabled";

/// Routing commands are honoured while this is on
pub const COMMAND_SWITCHER: &str = "registry.command.enabled";

pub type SwitcherListener = Arc<dyn Fn(&str, bool) + Send + Sync>;

pub trait SwitcherService: Send + Sync {
    /// Unknown switches read as `default`
    fn is_on_or(&self, name: &str, default: bool) -> bool;

    fn is_on(&self, name: &str) -> bool {
        self.is_on_or(name, false)
    }

    fn set_value(&self, name: &str, value: bool);

    /// Called with the new value each time the switch flips
    fn register_listener(&self, name: &str, listener: SwitcherListener);
}

/// In-process switch table
#[derive(Default)]
pub struct LocalSwitcherService {
    switchers: DashMap<String, bool>,
    listeners: DashMap<String, Vec<SwitcherListener>>,
}

impl LocalSwitcherService {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SwitcherService for LocalSwitcherService {
    fn is_on_or(&self, name: &str, default: bool) -> bool {
        self.switchers.get(name).map(|v| *v).unwrap_or(default)
    }

    fn set_value(&self, name: &str, value: bool) {
        let previous = self.switchers.insert(name.to_string(), value);
        if previous == Some(value) {
            return;
        }
        debug!(switcher = name, value, "switcher changed");

        // listeners run without any map guard held
        let listeners = self
            .listeners
            .get(name)
            .map(|l| l.clone())
            .unwrap_or_default();
        for listener in listeners {
            listener(name, value);
        }
    }

    fn register_listener(&self, name: &str, listener: SwitcherListener) {
        self.listeners
            .entry(name.to_string())
            .or_default()
            .push(listener);
    }
}
