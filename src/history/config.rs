use crate::timeout::validate_timeout;
use crate::units::{DirectorySource, UnitKind, UnitSource};
use lazy_static::lazy_static;
use regex::Regex;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

lazy_static! {
    static ref TABLE_NAME: Regex = Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)?$").unwrap();
}

/// Whose history a runner reads and writes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum OwnerScope {
    /// The connection (app) name.
    #[default]
    Connection,
    Named(String),
    /// Single-tenant: unscoped reads, rows written as `"default"`.
    Global,
}

impl OwnerScope {
    pub fn resolve(&self, connection: &str) -> Option<String> {
        match self {
            OwnerScope::Connection => Some(connection.to_string()),
            OwnerScope::Named(owner) => Some(owner.clone()),
            OwnerScope::Global => None,
        }
    }
}

/// Settings for one migration or seed history.
#[derive(Clone)]
pub struct HistoryConfig {
    pub source: Arc<dyn UnitSource>,
    /// Ledger table; the kind's default when unset.
    pub table: Option<String>,
    pub owner: OwnerScope,
    /// Run pending units during initialization.
    pub auto_run: bool,
    pub unit_timeout_ms: Option<u64>,
    pub transactional: bool,
}

impl HistoryConfig {
    pub fn new(source: Arc<dyn UnitSource>) -> Self {
        Self {
            source,
            table: None,
            owner: OwnerScope::default(),
            auto_run: false,
            unit_timeout_ms: None,
            transactional: false,
        }
    }

    pub fn directory(dir: impl AsRef<Path>) -> Self {
        Self::new(Arc::new(DirectorySource::new(dir)))
    }

    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    pub fn owner(mut self, owner: OwnerScope) -> Self {
        self.owner = owner;
        self
    }

    pub fn auto_run(mut self, enabled: bool) -> Self {
        self.auto_run = enabled;
        self
    }

    pub fn unit_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.unit_timeout_ms = Some(timeout_ms);
        self
    }

    pub fn transactional(mut self, enabled: bool) -> Self {
        self.transactional = enabled;
        self
    }

    pub fn table_for(&self, kind: UnitKind) -> String {
        self.table
            .clone()
            .unwrap_or_else(|| kind.default_table().to_string())
    }

    pub fn validate(&self) -> Result<(), String> {
        if let Some(table) = &self.table {
            if !TABLE_NAME.is_match(table) {
                return Err(format!("invalid ledger table name '{}'", table));
            }
        }
        if let OwnerScope::Named(owner) = &self.owner {
            if owner.trim().is_empty() {
                return Err("history owner cannot be blank".into());
            }
        }
        if let Some(timeout_ms) = self.unit_timeout_ms {
            validate_timeout(timeout_ms).map_err(|e| e.to_string())?;
        }
        Ok(())
    }
}

impl fmt::Debug for HistoryConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HistoryConfig")
            .field("source", &self.source.describe())
            .field("table", &self.table)
            .field("owner", &self.owner)
            .field("auto_run", &self.auto_run)
            .field("unit_timeout_ms", &self.unit_timeout_ms)
            .field("transactional", &self.transactional)
            .finish()
    }
}
