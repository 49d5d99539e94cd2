//! Suite fabric core: the shared library behind the `suite` supervisor
//! binary. Registry, event bus, fact store, vector index, context graph,
//! cloud bridge, and diagnostics all live here; the supervisor crate wires
//! them into a process with an HTTP surface and a CLI.

pub mod auth;
pub mod cloud_bridge;
pub mod config;
pub mod context;
pub mod diagnostics;
pub mod error;
pub mod event_bus;
pub mod fact_store;
pub mod health;
pub mod logger;
pub mod model;
pub mod registry;
pub mod secure_memory;
pub mod vector_index;

pub use config::{ConfigStore, SuiteConfig};
pub use context::{ContextGraph, ContextOptions, Embedder, RemoteContextSource};
pub use error::{CloudBridgeError, ConfigError, DiagnosticsError, FactStoreError, RegistryError, VectorError};
pub use event_bus::EventBus;
pub use fact_store::FactStore;
pub use health::HealthMonitor;
pub use model::*;
pub use registry::ModuleRegistry;
pub use vector_index::{FlatVectorIndex, VectorIndex};
