use super::sql::{MemoryStatement, parse_script};
use crate::connection::config::ConnectionConfig;
use crate::core::{
    AlterOp, AppError, Column, ColumnDefault, Filter, QueryResult, Record, Result, TableSchema,
    Value,
};
use crate::interface::{AdapterFactory, AdapterHandle, DatabaseAdapter};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
struct MemoryTable {
    schema: TableSchema,
    rows: Vec<Record>,
    next_id: i64,
}

impl MemoryTable {
    fn new(schema: TableSchema) -> Self {
        Self {
            schema,
            rows: Vec::new(),
            next_id: 0,
        }
    }

    fn default_for(column: &Column) -> Value {
        match &column.default {
            Some(ColumnDefault::Value(v)) => v.clone(),
            Some(ColumnDefault::Now) => Value::Timestamp(Utc::now()),
            None => Value::Null,
        }
    }

    fn insert(&mut self, mut record: Record) -> Result<i64> {
        if let Some(unknown) = record.keys().find(|k| !self.schema.has_column(k)) {
            return Err(AppError::ColumnNotFound(
                unknown.clone(),
                self.schema.name.clone(),
            ));
        }

        let mut generated = 0;
        for column in &self.schema.columns {
            let provided = record.get(&column.name).filter(|v| !v.is_null()).cloned();
            match provided {
                Some(value) => {
                    if column.auto_increment {
                        if let Some(id) = value.as_i64() {
                            self.next_id = self.next_id.max(id);
                            generated = id;
                        }
                    }
                }
                None if column.auto_increment => {
                    self.next_id += 1;
                    generated = self.next_id;
                    record.insert(column.name.clone(), Value::Integer(self.next_id));
                }
                None => {
                    record.insert(column.name.clone(), Self::default_for(column));
                }
            }
            column.validate(record.get(&column.name).unwrap_or(&Value::Null))?;
        }

        self.rows.push(record);
        Ok(generated)
    }

    fn add_column(&mut self, column: Column) -> Result<()> {
        if self.schema.has_column(&column.name) {
            return Err(AppError::Adapter(format!(
                "Column '{}' already exists in table '{}'",
                column.name, self.schema.name
            )));
        }
        if !column.nullable && column.default.is_none() && !self.rows.is_empty() {
            return Err(AppError::Adapter(format!(
                "Cannot add NOT NULL column '{}' without a default to non-empty table '{}'",
                column.name, self.schema.name
            )));
        }

        for row in &mut self.rows {
            row.insert(column.name.clone(), Self::default_for(&column));
        }
        self.schema.columns.push(column);
        Ok(())
    }
}

#[derive(Default)]
struct MemoryState {
    tables: BTreeMap<String, MemoryTable>,
    snapshot: Option<BTreeMap<String, MemoryTable>>,
}

impl MemoryState {
    fn table_mut(&mut self, name: &str) -> Result<&mut MemoryTable> {
        self.tables
            .get_mut(name)
            .ok_or_else(|| AppError::TableNotFound(name.to_string()))
    }

    fn table(&self, name: &str) -> Result<&MemoryTable> {
        self.tables
            .get(name)
            .ok_or_else(|| AppError::TableNotFound(name.to_string()))
    }

    fn apply(&mut self, statement: MemoryStatement) -> Result<QueryResult> {
        match statement {
            MemoryStatement::CreateTable {
                schema,
                if_not_exists,
            } => {
                if self.tables.contains_key(&schema.name) {
                    if if_not_exists {
                        return Ok(QueryResult::empty());
                    }
                    return Err(AppError::TableExists(schema.name));
                }
                self.tables
                    .insert(schema.name.clone(), MemoryTable::new(schema));
                Ok(QueryResult::empty())
            }
            MemoryStatement::DropTable { names, if_exists } => {
                for name in names {
                    if self.tables.remove(&name).is_none() && !if_exists {
                        return Err(AppError::TableNotFound(name));
                    }
                }
                Ok(QueryResult::empty())
            }
            MemoryStatement::Insert {
                table,
                columns,
                rows,
            } => {
                let target = self.table_mut(&table)?;
                let column_names = match columns {
                    Some(columns) => columns,
                    None => target
                        .schema
                        .columns
                        .iter()
                        .map(|c| c.name.clone())
                        .collect(),
                };

                let mut inserted = 0;
                for values in rows {
                    if values.len() != column_names.len() {
                        return Err(AppError::Adapter(format!(
                            "INSERT into '{}' has {} values for {} columns",
                            table,
                            values.len(),
                            column_names.len()
                        )));
                    }
                    let record = column_names.iter().cloned().zip(values).collect();
                    target.insert(record)?;
                    inserted += 1;
                }
                Ok(QueryResult::affected(inserted))
            }
            MemoryStatement::Delete { table } => {
                let target = self.table_mut(&table)?;
                let removed = target.rows.len() as u64;
                target.rows.clear();
                Ok(QueryResult::affected(removed))
            }
        }
    }
}

/// In-process implementation of [`DatabaseAdapter`].
///
/// Tables live in memory behind a single async lock. A transaction is a
/// copy of all tables taken at `begin` and restored on `rollback`; only one
/// transaction may be open per adapter.
pub struct MemoryAdapter {
    name: String,
    state: RwLock<MemoryState>,
    destroyed: AtomicBool,
    ping_delay: Mutex<Option<Duration>>,
    statements: Mutex<Vec<String>>,
}

impl MemoryAdapter {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: RwLock::new(MemoryState::default()),
            destroyed: AtomicBool::new(false),
            ping_delay: Mutex::new(None),
            statements: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Make `ping` take at least `delay`; used to exercise health probes.
    pub fn set_ping_delay(&self, delay: Option<Duration>) -> Result<()> {
        *self.ping_delay.lock()? = delay;
        Ok(())
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Raw scripts passed to `execute`, in order.
    pub fn executed_statements(&self) -> Result<Vec<String>> {
        Ok(self.statements.lock()?.clone())
    }

    pub async fn table_names(&self) -> Vec<String> {
        self.state.read().await.tables.keys().cloned().collect()
    }

    pub async fn row_count(&self, table: &str) -> Result<usize> {
        Ok(self.state.read().await.table(table)?.rows.len())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_destroyed() {
            return Err(AppError::Adapter(format!(
                "Adapter '{}' has been destroyed",
                self.name
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl DatabaseAdapter for MemoryAdapter {
    fn driver(&self) -> &str {
        "memory"
    }

    async fn execute(&self, sql: &str) -> Result<QueryResult> {
        self.ensure_open()?;
        self.statements.lock()?.push(sql.to_string());

        let statements = parse_script(sql)?;
        let mut state = self.state.write().await;
        let mut result = QueryResult::empty();
        for statement in statements {
            result.merge(state.apply(statement)?);
        }
        Ok(result)
    }

    async fn has_table(&self, table: &str) -> Result<bool> {
        self.ensure_open()?;
        Ok(self.state.read().await.tables.contains_key(table))
    }

    async fn has_column(&self, table: &str, column: &str) -> Result<bool> {
        self.ensure_open()?;
        let state = self.state.read().await;
        Ok(state.table(table)?.schema.has_column(column))
    }

    async fn create_table(&self, schema: TableSchema) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.state.write().await;
        if state.tables.contains_key(&schema.name) {
            return Err(AppError::TableExists(schema.name));
        }
        state
            .tables
            .insert(schema.name.clone(), MemoryTable::new(schema));
        Ok(())
    }

    async fn alter_table(&self, table: &str, ops: Vec<AlterOp>) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.state.write().await;
        let target = state.table_mut(table)?;
        for op in ops {
            match op {
                AlterOp::AddColumn(column) => target.add_column(column)?,
            }
        }
        Ok(())
    }

    async fn insert(&self, table: &str, record: Record) -> Result<i64> {
        self.ensure_open()?;
        let mut state = self.state.write().await;
        state.table_mut(table)?.insert(record)
    }

    async fn select(&self, table: &str, filter: &Filter) -> Result<Vec<Record>> {
        self.ensure_open()?;
        let state = self.state.read().await;
        Ok(state
            .table(table)?
            .rows
            .iter()
            .filter(|row| filter.matches(row))
            .cloned()
            .collect())
    }

    async fn update(&self, table: &str, filter: &Filter, changes: Record) -> Result<u64> {
        self.ensure_open()?;
        let mut state = self.state.write().await;
        let target = state.table_mut(table)?;

        for (name, value) in &changes {
            let column = target
                .schema
                .find_column(name)
                .ok_or_else(|| AppError::ColumnNotFound(name.clone(), table.to_string()))?;
            column.validate(value)?;
        }

        let mut updated = 0;
        for row in target.rows.iter_mut().filter(|row| filter.matches(row)) {
            for (name, value) in &changes {
                row.insert(name.clone(), value.clone());
            }
            updated += 1;
        }
        Ok(updated)
    }

    async fn delete(&self, table: &str, filter: &Filter) -> Result<u64> {
        self.ensure_open()?;
        let mut state = self.state.write().await;
        let target = state.table_mut(table)?;
        let before = target.rows.len();
        target.rows.retain(|row| !filter.matches(row));
        Ok((before - target.rows.len()) as u64)
    }

    async fn begin(&self) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.state.write().await;
        if state.snapshot.is_some() {
            return Err(AppError::Adapter(format!(
                "Adapter '{}' already has an open transaction",
                self.name
            )));
        }
        state.snapshot = Some(state.tables.clone());
        Ok(())
    }

    async fn commit(&self) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.state.write().await;
        state
            .snapshot
            .take()
            .map(|_| ())
            .ok_or_else(|| AppError::Adapter("No transaction in progress".into()))
    }

    async fn rollback(&self) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.state.write().await;
        let snapshot = state
            .snapshot
            .take()
            .ok_or_else(|| AppError::Adapter("No transaction in progress".into()))?;
        state.tables = snapshot;
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        self.ensure_open()?;
        let delay = *self.ping_delay.lock()?;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    async fn destroy(&self) -> Result<()> {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut state = self.state.write().await;
        state.tables.clear();
        state.snapshot = None;
        Ok(())
    }
}

/// Hands out a fresh [`MemoryAdapter`] per `connect`, named after the
/// configured database, and remembers each one for inspection.
#[derive(Default)]
pub struct MemoryAdapterFactory {
    created: Mutex<Vec<Arc<MemoryAdapter>>>,
}

impl MemoryAdapterFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn created(&self) -> Result<Vec<Arc<MemoryAdapter>>> {
        Ok(self.created.lock()?.clone())
    }

    /// Most recent adapter created for `database`.
    pub fn adapter_for(&self, database: &str) -> Result<Option<Arc<MemoryAdapter>>> {
        Ok(self
            .created
            .lock()?
            .iter()
            .rev()
            .find(|a| a.name() == database)
            .cloned())
    }
}

#[async_trait]
impl AdapterFactory for MemoryAdapterFactory {
    async fn connect(&self, config: &ConnectionConfig) -> Result<AdapterHandle> {
        if config.driver != "memory" {
            return Err(AppError::Configuration(format!(
                "MemoryAdapterFactory cannot open driver '{}'",
                config.driver
            )));
        }
        let adapter = Arc::new(MemoryAdapter::new(config.database.clone()));
        self.created.lock()?.push(Arc::clone(&adapter));
        Ok(adapter)
    }
}
