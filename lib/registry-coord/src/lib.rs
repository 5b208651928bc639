//! Coordination-store registry backend
//!
//! This library provides:
//! - The `CoordinationClient` seam over a tree-structured coordination store
//! - `MemoryStore`, an in-process store with ephemeral nodes, watches and
//!   session expiry
//! - `CoordinationRegistry`, the registry backend that keeps endpoints and
//!   routing commands in the store and recovers from session loss
//! - `RegistryFactory`, which assembles and memoizes registry stacks

pub mod coordination;
pub mod factory;
pub mod memory;
pub mod paths;
pub mod store;

pub use coordination::CoordinationRegistry;
pub use factory::{CoordinationConnector, MemoryConnector, RegistryFactory};
pub use memory::{MemorySession, MemoryStore};
pub use store::{CoordinationClient, DataEvent, NodeMode, SessionEvent, StoreError};
