//! Units of work: migrations and seeds.
//!
//! A unit has a name, an `up` step and optionally a `down` step. Units are
//! listed by a [`UnitSource`]; listing never fails for a single bad unit,
//! which is reported as a [`ListedUnit`] with an error instead so the runner
//! can show every problem at once.

pub mod directory;
pub mod fixed;

use crate::core::{InvalidUnit, Result};
use crate::interface::AdapterHandle;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

pub use directory::{DirectorySource, SqlUnit};
pub use fixed::{FnUnit, UnitSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitKind {
    Migration,
    Seed,
}

impl UnitKind {
    pub fn label(&self) -> &'static str {
        match self {
            UnitKind::Migration => "migration",
            UnitKind::Seed => "seed",
        }
    }

    /// Ledger table used when none is configured.
    pub fn default_table(&self) -> &'static str {
        match self {
            UnitKind::Migration => "schema_migrations",
            UnitKind::Seed => "seed_history",
        }
    }
}

impl fmt::Display for UnitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// What a unit sees while it runs.
#[derive(Clone)]
pub struct UnitContext {
    pub adapter: AdapterHandle,
    pub kind: UnitKind,
    pub owner: String,
    pub batch: i64,
}

#[async_trait]
pub trait UnitOfWork: Send + Sync {
    fn name(&self) -> &str;

    async fn up(&self, ctx: &UnitContext) -> Result<()>;

    fn has_down(&self) -> bool {
        false
    }

    async fn down(&self, _ctx: &UnitContext) -> Result<()> {
        Ok(())
    }
}

/// One listing entry. `unit` holds the load error for units that could not
/// be prepared.
pub struct ListedUnit {
    pub name: String,
    pub origin: String,
    pub unit: std::result::Result<Arc<dyn UnitOfWork>, String>,
}

impl ListedUnit {
    pub fn loaded(origin: impl Into<String>, unit: Arc<dyn UnitOfWork>) -> Self {
        Self {
            name: unit.name().to_string(),
            origin: origin.into(),
            unit: Ok(unit),
        }
    }

    pub fn failed(name: impl Into<String>, origin: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            origin: origin.into(),
            unit: Err(reason.into()),
        }
    }
}

impl fmt::Debug for ListedUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListedUnit")
            .field("name", &self.name)
            .field("origin", &self.origin)
            .field("loaded", &self.unit.is_ok())
            .finish()
    }
}

/// Where units come from. Listing order is execution order.
#[async_trait]
pub trait UnitSource: Send + Sync {
    fn describe(&self) -> String;

    async fn list(&self) -> Result<Vec<ListedUnit>>;
}

/// Split a listing into runnable units and invalid entries.
///
/// Every entry sharing a name with another entry is invalid, as is every
/// entry that failed to load.
pub fn validate(listed: Vec<ListedUnit>) -> (Vec<Arc<dyn UnitOfWork>>, Vec<InvalidUnit>) {
    let mut seen: HashMap<String, usize> = HashMap::new();
    for entry in &listed {
        *seen.entry(entry.name.clone()).or_default() += 1;
    }

    let mut valid = Vec::new();
    let mut invalid = Vec::new();
    for entry in listed {
        if seen.get(&entry.name).copied().unwrap_or(0) > 1 {
            invalid.push(InvalidUnit {
                name: entry.name,
                origin: entry.origin,
                reason: "duplicate unit name".into(),
            });
            continue;
        }
        match entry.unit {
            Ok(unit) => valid.push(unit),
            Err(reason) => invalid.push(InvalidUnit {
                name: entry.name,
                origin: entry.origin,
                reason,
            }),
        }
    }
    (valid, invalid)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(name: &str) -> Arc<dyn UnitOfWork> {
        Arc::new(FnUnit::new(name, |_| async { Ok(()) }))
    }

    #[test]
    fn test_validate_flags_duplicates_and_load_errors() {
        let listed = vec![
            ListedUnit::loaded("a.sql", noop("001_a")),
            ListedUnit::loaded("b.sql", noop("002_b")),
            ListedUnit::loaded("b2.sql", noop("002_b")),
            ListedUnit::failed("003_c", "c.sql", "missing up section"),
        ];

        let (valid, invalid) = validate(listed);
        let names: Vec<_> = valid.iter().map(|u| u.name().to_string()).collect();
        assert_eq!(names, vec!["001_a"]);
        assert_eq!(invalid.len(), 3);
        assert_eq!(invalid[0].reason, "duplicate unit name");
        assert_eq!(invalid[2].reason, "missing up section");
    }

    #[test]
    fn test_kind_defaults() {
        assert_eq!(UnitKind::Migration.default_table(), "schema_migrations");
        assert_eq!(UnitKind::Seed.default_table(), "seed_history");
        assert_eq!(UnitKind::Seed.to_string(), "seed");
    }
}
