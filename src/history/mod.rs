//! Ownership-tracked history of applied units.

pub mod config;
pub mod runner;
pub mod store;

pub use config::{HistoryConfig, OwnerScope};
pub use runner::{
    FailedUnit, HistoryStatus, RollbackOptions, RollbackReport, RunOptions, RunReport, UnitRunner,
};
pub use store::{DEFAULT_OWNER, HistoryRecord, Ledger};
