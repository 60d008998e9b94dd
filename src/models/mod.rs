//! Model definitions bound to a connection.
//!
//! The registry keeps one [`BoundModel`] per name. Binding is delegated to a
//! [`ModelRuntime`]; the registry only decides whether a definition is new,
//! replaces an earlier one, or merges with it.

use crate::core::{AppError, Result};
use crate::interface::AdapterHandle;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use tracing::{Level, event};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelDefinition {
    pub name: String,
    pub table: String,
    /// Shared definitions may be registered again and are merged.
    pub shared: bool,
    pub relations: BTreeMap<String, serde_json::Value>,
    pub modifiers: BTreeMap<String, serde_json::Value>,
    pub computed: Vec<String>,
    pub methods: BTreeMap<String, serde_json::Value>,
}

impl ModelDefinition {
    /// Definition whose table defaults to the model name.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            table: name.clone(),
            name,
            ..Self::default()
        }
    }

    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    pub fn shared(mut self) -> Self {
        self.shared = true;
        self
    }

    pub fn relation(mut self, name: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.relations.insert(name.into(), value.into());
        self
    }

    pub fn modifier(mut self, name: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.modifiers.insert(name.into(), value.into());
        self
    }

    pub fn computed(mut self, attribute: impl Into<String>) -> Self {
        self.computed.push(attribute.into());
        self
    }

    pub fn method(mut self, name: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.methods.insert(name.into(), value.into());
        self
    }

    /// Key union of relations, modifiers and methods (entries of `other`
    /// win) and ordered union of computed attributes.
    pub fn merge(&self, other: &ModelDefinition) -> ModelDefinition {
        let mut merged = self.clone();
        merged.relations.extend(other.relations.clone());
        merged.modifiers.extend(other.modifiers.clone());
        merged.methods.extend(other.methods.clone());
        for attribute in &other.computed {
            if !merged.computed.contains(attribute) {
                merged.computed.push(attribute.clone());
            }
        }
        merged
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Registration {
    Fresh,
    Replace,
    Merge,
}

#[derive(Clone)]
pub struct BoundModel {
    pub definition: ModelDefinition,
    pub connection: String,
    pub handle: AdapterHandle,
    pub registered_at: DateTime<Utc>,
}

impl std::fmt::Debug for BoundModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundModel")
            .field("definition", &self.definition)
            .field("connection", &self.connection)
            .field("driver", &self.handle.driver())
            .field("registered_at", &self.registered_at)
            .finish()
    }
}

/// Turns a definition into a model bound to a connection handle.
pub trait ModelRuntime: Send + Sync {
    fn define_model(
        &self,
        definition: &ModelDefinition,
        connection: &str,
        handle: AdapterHandle,
    ) -> Result<BoundModel>;
}

/// Binds definitions as-is after checking they name a table.
#[derive(Debug, Default, Clone, Copy)]
pub struct BasicModelRuntime;

impl ModelRuntime for BasicModelRuntime {
    fn define_model(
        &self,
        definition: &ModelDefinition,
        connection: &str,
        handle: AdapterHandle,
    ) -> Result<BoundModel> {
        if definition.table.trim().is_empty() {
            return Err(AppError::Model(format!(
                "model '{}' has no table",
                definition.name
            )));
        }
        Ok(BoundModel {
            definition: definition.clone(),
            connection: connection.to_string(),
            handle,
            registered_at: Utc::now(),
        })
    }
}

pub struct ModelRegistry {
    connection: String,
    handle: AdapterHandle,
    runtime: Arc<dyn ModelRuntime>,
    models: RwLock<BTreeMap<String, Arc<BoundModel>>>,
}

impl ModelRegistry {
    pub fn new(connection: impl Into<String>, handle: AdapterHandle, runtime: Arc<dyn ModelRuntime>) -> Self {
        Self {
            connection: connection.into(),
            handle,
            runtime,
            models: RwLock::new(BTreeMap::new()),
        }
    }

    fn bind(&self, definition: &ModelDefinition) -> Result<Arc<BoundModel>> {
        if definition.name.trim().is_empty() {
            return Err(AppError::Model("model name cannot be empty".into()));
        }
        self.runtime
            .define_model(definition, &self.connection, Arc::clone(&self.handle))
            .map(Arc::new)
    }

    /// Register a new model, or merge into an existing one when both are
    /// shared.
    pub fn register(&self, definition: ModelDefinition) -> Result<(Arc<BoundModel>, Registration)> {
        let mut models = self.models.write()?;
        let (bound, registration) = match models.get(&definition.name) {
            None => (self.bind(&definition)?, Registration::Fresh),
            Some(existing) if existing.definition.shared && definition.shared => {
                let merged = existing.definition.merge(&definition);
                (self.bind(&merged)?, Registration::Merge)
            }
            Some(_) => return Err(AppError::AlreadyRegistered("model", definition.name)),
        };

        event!(Level::DEBUG, model = %definition.name, connection = %self.connection, ?registration, "model registered");
        models.insert(definition.name, Arc::clone(&bound));
        Ok((bound, registration))
    }

    /// Overwrite a shared model (or register a new one).
    pub fn replace(&self, definition: ModelDefinition) -> Result<(Arc<BoundModel>, Registration)> {
        let mut models = self.models.write()?;
        let registration = match models.get(&definition.name) {
            None => Registration::Fresh,
            Some(existing) if existing.definition.shared => Registration::Replace,
            Some(_) => return Err(AppError::AlreadyRegistered("model", definition.name)),
        };
        let bound = self.bind(&definition)?;
        models.insert(definition.name, Arc::clone(&bound));
        Ok((bound, registration))
    }

    /// Register a batch. On failure the models this call added fresh are
    /// removed again and the error is returned.
    pub fn register_all(&self, definitions: Vec<ModelDefinition>) -> Result<Vec<String>> {
        let mut added = Vec::new();
        let mut names = Vec::with_capacity(definitions.len());
        for definition in definitions {
            let name = definition.name.clone();
            match self.register(definition) {
                Ok((_, registration)) => {
                    if registration == Registration::Fresh {
                        added.push(name.clone());
                    }
                    names.push(name);
                }
                Err(err) => {
                    for name in &added {
                        self.unregister(name)?;
                    }
                    return Err(err);
                }
            }
        }
        Ok(names)
    }

    pub fn get(&self, name: &str) -> Result<Option<Arc<BoundModel>>> {
        Ok(self.models.read()?.get(name).cloned())
    }

    pub fn names(&self) -> Result<Vec<String>> {
        Ok(self.models.read()?.keys().cloned().collect())
    }

    pub fn unregister(&self, name: &str) -> Result<bool> {
        Ok(self.models.write()?.remove(name).is_some())
    }

    pub fn clear(&self) -> Result<usize> {
        let mut models = self.models.write()?;
        let count = models.len();
        models.clear();
        Ok(count)
    }

    pub fn len(&self) -> usize {
        self.models.read().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
