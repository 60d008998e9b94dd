//! Units defined in code.

use super::{ListedUnit, UnitContext, UnitOfWork, UnitSource};
use crate::core::Result;
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::future::Future;
use std::sync::{Arc, Mutex};

type Step = Arc<dyn Fn(UnitContext) -> BoxFuture<'static, Result<()>> + Send + Sync>;

fn boxed<F, Fut>(step: F) -> Step
where
    F: Fn(UnitContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |ctx| Box::pin(step(ctx)))
}

/// Unit built from async closures.
pub struct FnUnit {
    name: String,
    up: Step,
    down: Option<Step>,
}

impl FnUnit {
    pub fn new<F, Fut>(name: impl Into<String>, up: F) -> Self
    where
        F: Fn(UnitContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            name: name.into(),
            up: boxed(up),
            down: None,
        }
    }

    pub fn with_down<F, Fut>(mut self, down: F) -> Self
    where
        F: Fn(UnitContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.down = Some(boxed(down));
        self
    }
}

#[async_trait]
impl UnitOfWork for FnUnit {
    fn name(&self) -> &str {
        &self.name
    }

    async fn up(&self, ctx: &UnitContext) -> Result<()> {
        (self.up)(ctx.clone()).await
    }

    fn has_down(&self) -> bool {
        self.down.is_some()
    }

    async fn down(&self, ctx: &UnitContext) -> Result<()> {
        match &self.down {
            Some(down) => down(ctx.clone()).await,
            None => Ok(()),
        }
    }
}

enum Entry {
    Unit(Arc<dyn UnitOfWork>),
    Broken { name: String, reason: String },
}

/// Ordered, mutable list of in-code units.
#[derive(Default)]
pub struct UnitSet {
    label: String,
    entries: Mutex<Vec<Entry>>,
}

impl UnitSet {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            entries: Mutex::new(Vec::new()),
        }
    }

    pub fn with(self, unit: impl UnitOfWork + 'static) -> Self {
        self.push(Arc::new(unit));
        self
    }

    pub fn push(&self, unit: Arc<dyn UnitOfWork>) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.push(Entry::Unit(unit));
        }
    }

    /// Entry that lists as unloadable.
    pub fn push_broken(&self, name: impl Into<String>, reason: impl Into<String>) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.push(Entry::Broken {
                name: name.into(),
                reason: reason.into(),
            });
        }
    }

    /// Drop every entry called `name`; returns whether any existed.
    pub fn remove(&self, name: &str) -> bool {
        let Ok(mut entries) = self.entries.lock() else {
            return false;
        };
        let before = entries.len();
        entries.retain(|entry| match entry {
            Entry::Unit(unit) => unit.name() != name,
            Entry::Broken { name: broken, .. } => broken != name,
        });
        entries.len() != before
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl UnitSource for UnitSet {
    fn describe(&self) -> String {
        format!("unit set '{}'", self.label)
    }

    async fn list(&self) -> Result<Vec<ListedUnit>> {
        let entries = self.entries.lock()?;
        Ok(entries
            .iter()
            .map(|entry| match entry {
                Entry::Unit(unit) => ListedUnit::loaded(self.label.clone(), Arc::clone(unit)),
                Entry::Broken { name, reason } => {
                    ListedUnit::failed(name.clone(), self.label.clone(), reason.clone())
                }
            })
            .collect())
    }
}
