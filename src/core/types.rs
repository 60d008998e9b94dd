use super::{AppError, Result, Value};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

/// A row keyed by column name.
pub type Record = BTreeMap<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    Integer,
    Float,
    Text,
    Boolean,
    Timestamp,
}

impl DataType {
    pub fn is_compatible(&self, value: &Value) -> bool {
        matches!(
            (self, value),
            (_, Value::Null)
                | (Self::Integer, Value::Integer(_))
                | (Self::Float, Value::Float(_) | Value::Integer(_))
                | (Self::Text, Value::Text(_))
                | (Self::Boolean, Value::Boolean(_))
                | (Self::Timestamp, Value::Timestamp(_))
        )
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Integer => "INTEGER",
            Self::Float => "FLOAT",
            Self::Text => "TEXT",
            Self::Boolean => "BOOLEAN",
            Self::Timestamp => "TIMESTAMP",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ColumnDefault {
    Value(Value),
    /// Current time at insert.
    Now,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    pub data_type: DataType,
    pub nullable: bool,
    pub primary_key: bool,
    pub auto_increment: bool,
    pub default: Option<ColumnDefault>,
}

impl Column {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable: true,
            primary_key: false,
            auto_increment: false,
            default: None,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    /// Auto-incrementing integer primary key.
    pub fn increments(mut self) -> Self {
        self.primary_key = true;
        self.auto_increment = true;
        self.nullable = false;
        self
    }

    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(ColumnDefault::Value(value.into()));
        self
    }

    pub fn default_now(mut self) -> Self {
        self.default = Some(ColumnDefault::Now);
        self
    }

    pub fn validate(&self, value: &Value) -> Result<()> {
        if matches!(value, Value::Null) {
            if !self.nullable {
                return Err(AppError::Adapter(format!(
                    "Column '{}' cannot be NULL",
                    self.name
                )));
            }
            return Ok(());
        }

        if !self.data_type.is_compatible(value) {
            return Err(AppError::Adapter(format!(
                "Column '{}' expects type {}, got {}",
                self.name,
                self.data_type,
                value.type_name()
            )));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<Column>,
}

impl TableSchema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
        }
    }

    pub fn column(mut self, column: Column) -> Self {
        self.columns.push(column);
        self
    }

    pub fn find_column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.find_column(name).is_some()
    }
}

/// Schema change applied through `DatabaseAdapter::alter_table`.
#[derive(Debug, Clone, PartialEq)]
pub enum AlterOp {
    AddColumn(Column),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Eq(String, Value),
    Gte(String, Value),
    IsNull(String),
}

impl Condition {
    fn matches(&self, record: &Record) -> bool {
        match self {
            Self::Eq(column, expected) => record.get(column).is_some_and(|v| v == expected),
            Self::Gte(column, bound) => record.get(column).is_some_and(|v| {
                matches!(
                    v.partial_cmp(bound),
                    Some(Ordering::Greater | Ordering::Equal)
                )
            }),
            Self::IsNull(column) => record.get(column).is_none_or(Value::is_null),
        }
    }
}

/// Conjunction of row conditions. An empty filter matches every row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    conditions: Vec<Condition>,
}

impl Filter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn eq(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.conditions
            .push(Condition::Eq(column.into(), value.into()));
        self
    }

    pub fn gte(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.conditions
            .push(Condition::Gte(column.into(), value.into()));
        self
    }

    pub fn is_null(mut self, column: impl Into<String>) -> Self {
        self.conditions.push(Condition::IsNull(column.into()));
        self
    }

    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    pub fn matches(&self, record: &Record) -> bool {
        self.conditions.iter().all(|c| c.matches(record))
    }
}

#[derive(Debug, Default)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Record>,
    pub affected: u64,
}

impl QueryResult {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn affected(affected: u64) -> Self {
        Self {
            affected,
            ..Self::default()
        }
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Accumulates the outcome of another statement from the same script.
    pub fn merge(&mut self, other: QueryResult) {
        self.affected += other.affected;
        if !other.columns.is_empty() {
            self.columns = other.columns;
        }
        self.rows.extend(other.rows);
    }
}
