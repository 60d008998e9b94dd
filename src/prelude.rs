//! Everything an embedding application usually needs.
//!
//! ```ignore
//! use dbtenant::prelude::*;
//! ```

pub use crate::connection::{
    AppHealth, ConnectionConfig, ConnectionManager, HealthProbe, HealthStatus, InitReport,
    ManagerState, Release, SharedHandle, ShutdownReport,
};
pub use crate::core::{AppError, ErrorKind, Filter, InvalidUnit, Record, Result, Value};
pub use crate::events::{Delivery, EventBus, LifecycleEvent, SubscriptionId};
pub use crate::history::{
    HistoryConfig, HistoryRecord, HistoryStatus, OwnerScope, RollbackOptions, RollbackReport,
    RunOptions, RunReport,
};
pub use crate::interface::{AdapterFactory, AdapterHandle, DatabaseAdapter};
pub use crate::models::{BasicModelRuntime, BoundModel, ModelDefinition, ModelRuntime, Registration};
pub use crate::plugins::{
    NotifyReport, Plugin, PluginConfig, PluginInfo, PluginManager, PluginManagerConfig,
};
pub use crate::registry::{
    AppConfig, AppRegistration, AppRegistry, RegistryConfig, RegistryShutdownReport,
    RegistryStatus, ShutdownOptions,
};
pub use crate::storage::{MemoryAdapter, MemoryAdapterFactory};
pub use crate::timeout::{TimeoutContext, with_cancellation, with_timeout};
pub use crate::units::{
    DirectorySource, FnUnit, UnitContext, UnitKind, UnitOfWork, UnitSet, UnitSource,
};
