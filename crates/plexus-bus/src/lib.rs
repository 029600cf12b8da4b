//! Message bus and module system for Plexus
//!
//! This crate provides:
//! - Three typed dispatch engines sharing one handler pool: broadcast (fan-out),
//!   command (single receiver) and query (single receiver with caching and
//!   single-flight de-duplication)
//! - A module registry ordering module lifecycles along their declared dependencies
//! - Supporting utilities for logging and handler record pooling

pub mod bus;
pub mod modules;
pub mod utils;

// Re-export commonly used types and functions
pub use bus::{
    BusConfig, BusError, ChannelKey, HandlerId, OwnedBus, SharedMessageBus, SubscribeOptions,
    TypeKey,
    context::{
        CancellationPolicy, ConcurrencyMode, ErrorPolicy, ExecutionContext, ExecutionOptions,
    },
    main_thread::{MainThreadContext, MainThreadHandle, is_main_thread},
    pool::{Pool, PoolConfig},
    query::QueryError,
    report::{DispatchOutcome, DispatchReport},
};
pub use modules::{
    Capabilities, Dependency, Module, ModuleCatalog, ModuleContext, ModuleDefinition,
    ModuleDescriptor, ModuleHost, ModuleRegistry, ModuleState, ModulesConf, RegistrationReport,
    graph::{DependencyGraph, GraphError},
};
pub use tokio_util::sync::CancellationToken;

#[doc(hidden)]
pub use inventory;

// Macros are automatically exported at crate root via #[macro_export]
// Available macros: log_debug, log_error, log_warn, submit_module
