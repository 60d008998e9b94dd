//! Ledger table access.
//!
//! One ledger table records which units ran, in which batch, and for which
//! owner. Several owners may share a table; every read and delete is scoped
//! to an owner unless the caller passes `None` (single-tenant mode).

use crate::core::{
    AlterOp, AppError, Column, DataType, Filter, Record, Result, TableSchema, Value,
};
use crate::interface::AdapterHandle;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{Level, event};

/// Owner written when no owner is configured, and backfilled into legacy
/// ledgers.
pub const DEFAULT_OWNER: &str = "default";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryRecord {
    pub id: i64,
    pub name: String,
    pub batch: i64,
    pub owner: String,
    pub executed_at: Option<DateTime<Utc>>,
}

impl HistoryRecord {
    fn from_row(table: &str, row: &Record) -> Result<Self> {
        let field = |column: &str| {
            row.get(column)
                .ok_or_else(|| AppError::ColumnNotFound(column.to_string(), table.to_string()))
        };

        let id = field("id")?
            .as_i64()
            .ok_or_else(|| AppError::Adapter(format!("ledger '{}' has a non-integer id", table)))?;
        let name = field("name")?
            .as_str()
            .ok_or_else(|| AppError::Adapter(format!("ledger '{}' row {} has no name", table, id)))?
            .to_string();
        let batch = field("batch")?
            .as_i64()
            .ok_or_else(|| AppError::Adapter(format!("ledger '{}' row {} has no batch", table, id)))?;
        let owner = row
            .get("owner")
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_OWNER)
            .to_string();
        let executed_at = row.get("executed_at").and_then(Value::as_timestamp);

        Ok(Self {
            id,
            name,
            batch,
            owner,
            executed_at,
        })
    }
}

pub struct Ledger {
    adapter: AdapterHandle,
    table: String,
    ready: AtomicBool,
}

impl Ledger {
    pub fn new(adapter: AdapterHandle, table: impl Into<String>) -> Self {
        Self {
            adapter,
            table: table.into(),
            ready: AtomicBool::new(false),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn schema(table: &str) -> TableSchema {
        TableSchema::new(table)
            .column(Column::new("id", DataType::Integer).increments())
            .column(Column::new("name", DataType::Text).not_null())
            .column(Column::new("batch", DataType::Integer).not_null())
            .column(Column::new("executed_at", DataType::Timestamp).default_now())
            .column(owner_column())
    }

    /// Create the table, or add the `owner` column to a legacy table.
    /// The outcome is cached until [`Ledger::invalidate`].
    pub async fn ensure(&self) -> Result<()> {
        if self.ready.load(Ordering::Acquire) {
            return Ok(());
        }

        if !self.adapter.has_table(&self.table).await? {
            match self.adapter.create_table(Self::schema(&self.table)).await {
                Ok(()) => {
                    event!(Level::DEBUG, table = %self.table, "ledger table created");
                }
                // Another manager on the same handle won the race.
                Err(AppError::TableExists(_)) => {}
                Err(err) => return Err(err),
            }
        }

        if !self.adapter.has_column(&self.table, "owner").await? {
            self.upgrade_legacy().await?;
        }

        self.ready.store(true, Ordering::Release);
        Ok(())
    }

    async fn upgrade_legacy(&self) -> Result<()> {
        event!(Level::INFO, table = %self.table, "adding owner column to legacy ledger");
        self.adapter
            .alter_table(&self.table, vec![AlterOp::AddColumn(owner_column())])
            .await?;

        let changes = Record::from([("owner".to_string(), Value::from(DEFAULT_OWNER))]);
        let backfilled = self
            .adapter
            .update(&self.table, &Filter::all().is_null("owner"), changes)
            .await?;
        event!(Level::DEBUG, table = %self.table, backfilled, "legacy ledger upgraded");
        Ok(())
    }

    pub fn invalidate(&self) {
        self.ready.store(false, Ordering::Release);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    fn scope(owner: Option<&str>) -> Filter {
        match owner {
            Some(owner) => Filter::all().eq("owner", owner),
            None => Filter::all(),
        }
    }

    /// Every record for `owner`, ordered by id.
    pub async fn records(&self, owner: Option<&str>) -> Result<Vec<HistoryRecord>> {
        let rows = self.adapter.select(&self.table, &Self::scope(owner)).await?;
        let mut records = rows
            .iter()
            .map(|row| HistoryRecord::from_row(&self.table, row))
            .collect::<Result<Vec<_>>>()?;
        records.sort_by_key(|r| r.id);
        Ok(records)
    }

    pub async fn executed_names(&self, owner: Option<&str>) -> Result<Vec<String>> {
        Ok(self
            .records(owner)
            .await?
            .into_iter()
            .map(|r| r.name)
            .collect())
    }

    pub async fn max_batch(&self, owner: Option<&str>) -> Result<Option<i64>> {
        Ok(self.records(owner).await?.iter().map(|r| r.batch).max())
    }

    pub async fn next_batch(&self, owner: Option<&str>) -> Result<i64> {
        Ok(self.max_batch(owner).await?.unwrap_or(0) + 1)
    }

    pub async fn record(&self, name: &str, batch: i64, owner: &str) -> Result<i64> {
        let row = Record::from([
            ("name".to_string(), Value::from(name)),
            ("batch".to_string(), Value::from(batch)),
            ("owner".to_string(), Value::from(owner)),
            ("executed_at".to_string(), Value::Timestamp(Utc::now())),
        ]);
        self.adapter.insert(&self.table, row).await
    }

    /// Records with `batch >= target`, newest batch first, then newest
    /// insertion first.
    pub async fn records_from_batch(
        &self,
        target: i64,
        owner: Option<&str>,
    ) -> Result<Vec<HistoryRecord>> {
        let filter = Self::scope(owner).gte("batch", target);
        let rows = self.adapter.select(&self.table, &filter).await?;
        let mut records = rows
            .iter()
            .map(|row| HistoryRecord::from_row(&self.table, row))
            .collect::<Result<Vec<_>>>()?;
        records.sort_by(|a, b| b.batch.cmp(&a.batch).then(b.id.cmp(&a.id)));
        Ok(records)
    }

    /// Delete one tracking row, never touching another owner's rows.
    pub async fn remove(&self, record: &HistoryRecord) -> Result<u64> {
        let filter = Filter::all()
            .eq("id", record.id)
            .eq("owner", record.owner.as_str());
        self.adapter.delete(&self.table, &filter).await
    }
}

fn owner_column() -> Column {
    Column::new("owner", DataType::Text)
        .not_null()
        .default_value(DEFAULT_OWNER)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryAdapter;
    use std::sync::Arc;

    fn ledger() -> Ledger {
        Ledger::new(Arc::new(MemoryAdapter::new("ledger")), "schema_migrations")
    }

    #[tokio::test]
    async fn test_ensure_creates_table_once() {
        let ledger = ledger();
        ledger.ensure().await.unwrap();
        assert!(ledger.is_ready());
        ledger.ensure().await.unwrap();

        ledger.invalidate();
        assert!(!ledger.is_ready());
        ledger.ensure().await.unwrap();
    }

    #[tokio::test]
    async fn test_batches_are_per_owner() {
        let ledger = ledger();
        ledger.ensure().await.unwrap();

        assert_eq!(ledger.next_batch(Some("a")).await.unwrap(), 1);
        ledger.record("001", 1, "a").await.unwrap();
        ledger.record("001", 2, "a").await.unwrap();
        ledger.record("001", 1, "b").await.unwrap();

        assert_eq!(ledger.max_batch(Some("a")).await.unwrap(), Some(2));
        assert_eq!(ledger.max_batch(Some("b")).await.unwrap(), Some(1));
        assert_eq!(ledger.max_batch(None).await.unwrap(), Some(2));
        assert_eq!(ledger.max_batch(Some("c")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_records_from_batch_order_and_scoped_remove() {
        let ledger = ledger();
        ledger.ensure().await.unwrap();
        ledger.record("u1", 1, "a").await.unwrap();
        ledger.record("u2", 2, "a").await.unwrap();
        ledger.record("u3", 2, "a").await.unwrap();
        ledger.record("u3", 2, "b").await.unwrap();

        let records = ledger.records_from_batch(2, Some("a")).await.unwrap();
        let names: Vec<_> = records.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["u3", "u2"]);

        assert_eq!(ledger.remove(&records[0]).await.unwrap(), 1);
        assert_eq!(ledger.executed_names(Some("a")).await.unwrap(), vec!["u1", "u2"]);
        assert_eq!(ledger.executed_names(Some("b")).await.unwrap(), vec!["u3"]);
    }
}
