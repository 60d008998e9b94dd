// ============================================================================
// dbtenant Library
// ============================================================================
//
// Hosts several named database connections ("apps") in one process. Each
// app has its own migration history, seed history and models; connections
// can be shared between apps without their histories colliding.
//
// ============================================================================

pub mod connection;
pub mod core;
pub mod events;
pub mod history;
pub mod interface;
pub mod models;
pub mod plugins;
pub mod prelude;
pub mod registry;
pub mod storage;
pub mod timeout;
pub mod transaction;
pub mod units;

// Re-export main types for convenience
pub use core::{AppError, ErrorKind, Result, Value};
pub use interface::{AdapterFactory, AdapterHandle, DatabaseAdapter};
pub use storage::{MemoryAdapter, MemoryAdapterFactory};

pub use connection::{
    ConnectionConfig, ConnectionManager, HealthProbe, HealthStatus, ManagerState, SharedHandle,
};
pub use events::{EventBus, LifecycleEvent};
pub use history::{HistoryConfig, OwnerScope, RollbackOptions, RunOptions};
pub use models::{ModelDefinition, ModelRuntime};
pub use plugins::{Plugin, PluginConfig, PluginManager, PluginManagerConfig};
pub use registry::{AppConfig, AppRegistry, RegistryConfig, ShutdownOptions};
pub use timeout::{TimeoutContext, with_cancellation, with_timeout};
pub use units::{DirectorySource, FnUnit, UnitSet};
