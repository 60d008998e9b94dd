use crate::connection::config::ConnectionConfig;
use crate::core::{AlterOp, Filter, QueryResult, Record, Result, TableSchema};
use async_trait::async_trait;
use std::sync::Arc;

/// A live connection to some database, as seen by the orchestration layer.
///
/// The orchestration layer never generates SQL itself: it probes schema
/// presence and performs filter-based row CRUD against its ledger tables.
/// Raw statements only come from unit-of-work files and user code through
/// [`DatabaseAdapter::execute`]. Physical pooling lives behind this trait.
#[async_trait]
pub trait DatabaseAdapter: Send + Sync {
    /// Short driver label used in logs and health reports.
    fn driver(&self) -> &str;

    /// Execute a raw statement script.
    async fn execute(&self, sql: &str) -> Result<QueryResult>;

    async fn has_table(&self, table: &str) -> Result<bool>;

    async fn has_column(&self, table: &str, column: &str) -> Result<bool>;

    async fn create_table(&self, schema: TableSchema) -> Result<()>;

    async fn alter_table(&self, table: &str, ops: Vec<AlterOp>) -> Result<()>;

    /// Insert a row; returns the generated id when the table has an
    /// auto-increment key, otherwise 0.
    async fn insert(&self, table: &str, record: Record) -> Result<i64>;

    async fn select(&self, table: &str, filter: &Filter) -> Result<Vec<Record>>;

    async fn update(&self, table: &str, filter: &Filter, changes: Record) -> Result<u64>;

    async fn delete(&self, table: &str, filter: &Filter) -> Result<u64>;

    async fn begin(&self) -> Result<()>;

    async fn commit(&self) -> Result<()>;

    async fn rollback(&self) -> Result<()>;

    /// Lightweight liveness probe.
    async fn ping(&self) -> Result<()>;

    /// Close the physical connection (pool). Further calls fail.
    async fn destroy(&self) -> Result<()>;
}

pub type AdapterHandle = Arc<dyn DatabaseAdapter>;

/// Creates adapter handles for freshly registered apps.
#[async_trait]
pub trait AdapterFactory: Send + Sync {
    async fn connect(&self, config: &ConnectionConfig) -> Result<AdapterHandle>;
}
