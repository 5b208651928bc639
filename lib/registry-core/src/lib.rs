//! Core service registry functionality
//!
//! This library provides:
//! - The endpoint record (`Url`) every registry exchanges
//! - A caching base registry, a failback decorator with a shared retry worker
//!   and a command-driven weighted routing layer
//! - The routing command document and its pattern expression evaluator
//! - A static (`direct`) backend for fixed endpoint lists

pub mod base;
pub mod command;
pub mod command_registry;
pub mod direct;
pub mod error;
pub mod failback;
pub mod listener;
pub mod net;
pub mod registry;
pub mod retry;
pub mod service_manager;
pub mod switcher;
pub mod url;

pub use base::{BaseRegistry, Subscriber, SubscriptionCache};
pub use command::{ClientCommand, RouteRule, RpcCommand};
pub use command_registry::CommandRegistry;
pub use direct::DirectRegistry;
pub use error::{RegistryError, Result};
pub use failback::FailbackRegistry;
pub use listener::{CommandListener, NotifyListener, ServiceListener};
pub use registry::{Registry, RegistryBackend, RegistryOps};
pub use retry::{RetryScheduler, RetryTask};
pub use service_manager::{RoutedEndpoints, ServiceManager};
pub use switcher::{LocalSwitcherService, SwitcherService};
pub use url::Url;
