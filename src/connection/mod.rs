//! Per-app connections.
//!
//! A [`ConnectionManager`] owns or references one adapter handle and builds
//! the migration runner, seed runner, model registry and transaction
//! executor on top of it.

pub mod config;
pub mod handle;
pub mod health;
pub mod manager;

pub use config::ConnectionConfig;
pub use handle::{Release, SharedHandle};
pub use health::{AppHealth, HealthProbe, HealthStatus};
pub use manager::{ConnectionManager, HandleSource, InitReport, ManagerState, ShutdownReport};
