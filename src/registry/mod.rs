//! Named apps, each with its own connection manager.
//!
//! An app either opens its own connection or shares the connection of an
//! app registered before it. Registration is all-or-nothing: if the manager
//! fails to initialize it is shut down and no registration remains.

pub mod config;
pub mod status;

use crate::connection::{ConnectionManager, HandleSource, ShutdownReport};
use crate::core::{AppError, Result};
use crate::events::{EventBus, LifecycleEvent};
use crate::interface::AdapterFactory;
use crate::models::{BasicModelRuntime, ModelRuntime};
use crate::plugins::{PluginManager, PluginShutdownReport};
use crate::timeout::{TimeoutContext, with_timeout};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{Instrument, Level, event, info_span};
use uuid::Uuid;

pub use config::{AppConfig, RegistryConfig};
pub use status::RegistryStatus;

#[derive(Debug)]
pub struct AppRegistration {
    pub id: Uuid,
    pub name: String,
    pub manager: Arc<ConnectionManager>,
    pub shared_from: Option<String>,
    pub registered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownOptions {
    /// Per-app deadline; the registry default when unset.
    pub timeout_ms: Option<u64>,
    pub include_plugins: bool,
}

impl Default for ShutdownOptions {
    fn default() -> Self {
        Self {
            timeout_ms: None,
            include_plugins: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppShutdownFailure {
    pub name: String,
    pub error: String,
}

#[derive(Debug, Clone, Default)]
pub struct RegistryShutdownReport {
    pub success: bool,
    pub shut_down: Vec<String>,
    pub failures: Vec<AppShutdownFailure>,
    pub plugins: Option<PluginShutdownReport>,
    pub duration: Duration,
}

#[derive(Default)]
struct Apps {
    by_name: HashMap<String, Arc<AppRegistration>>,
    order: Vec<String>,
}

/// Releases a name reserved by an in-flight registration.
struct Reservation<'a> {
    pending: &'a Mutex<HashSet<String>>,
    name: String,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(&self.name);
        }
    }
}

pub struct AppRegistry {
    config: RegistryConfig,
    factory: Arc<dyn AdapterFactory>,
    runtime: Arc<dyn ModelRuntime>,
    events: EventBus,
    apps: RwLock<Apps>,
    pending: Mutex<HashSet<String>>,
    plugins: Option<Arc<PluginManager>>,
}

impl AppRegistry {
    pub fn new(factory: Arc<dyn AdapterFactory>) -> Self {
        Self {
            config: RegistryConfig::default(),
            factory,
            runtime: Arc::new(BasicModelRuntime),
            events: EventBus::new(),
            apps: RwLock::new(Apps::default()),
            pending: Mutex::new(HashSet::new()),
            plugins: None,
        }
    }

    pub fn with_config(mut self, config: RegistryConfig) -> Result<Self> {
        config.validate().map_err(AppError::Configuration)?;
        self.config = config;
        Ok(self)
    }

    pub fn with_model_runtime(mut self, runtime: Arc<dyn ModelRuntime>) -> Self {
        self.runtime = runtime;
        self
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    /// Attach a plugin manager; it observes this registry's events and is
    /// shut down with the registry.
    pub fn with_plugins(mut self, plugins: Arc<PluginManager>) -> Result<Self> {
        plugins.observe(&self.events)?;
        self.plugins = Some(plugins);
        Ok(self)
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn plugins(&self) -> Option<&Arc<PluginManager>> {
        self.plugins.as_ref()
    }

    async fn reserve(&self, name: &str) -> Result<Reservation<'_>> {
        {
            let mut pending = self.pending.lock()?;
            if !pending.insert(name.to_string()) {
                return Err(AppError::AlreadyRegistered("app", name.to_string()));
            }
        }
        let reservation = Reservation {
            pending: &self.pending,
            name: name.to_string(),
        };
        if self.apps.read().await.by_name.contains_key(name) {
            return Err(AppError::AlreadyRegistered("app", name.to_string()));
        }
        Ok(reservation)
    }

    pub async fn register_app(&self, name: &str, config: AppConfig) -> Result<Arc<AppRegistration>> {
        let span = info_span!("register_app", app = %name, shared_from = ?config.share_from);
        self.register_inner(name, config).instrument(span).await
    }

    async fn register_inner(&self, name: &str, config: AppConfig) -> Result<Arc<AppRegistration>> {
        if name.trim().is_empty() {
            return Err(AppError::Configuration("app name cannot be blank".into()));
        }
        let _reservation = self.reserve(name).await?;
        config.validate().map_err(AppError::Configuration)?;

        let source = match &config.share_from {
            Some(target) => {
                let apps = self.apps.read().await;
                let registration = apps
                    .by_name
                    .get(target)
                    .ok_or_else(|| AppError::NotRegistered("app", target.clone()))?;
                HandleSource::Share(registration.manager.shared_handle()?)
            }
            None => HandleSource::Connect(Arc::clone(&self.factory)),
        };

        let shared_from = config.share_from.clone();
        let manager = Arc::new(ConnectionManager::new(
            name,
            config,
            source,
            Arc::clone(&self.runtime),
            self.events.clone(),
        ));

        if let Err(err) = manager.initialize().await {
            event!(Level::ERROR, error = %err, "app failed to initialize");
            if let Err(shutdown_err) = manager.shutdown().await {
                event!(Level::WARN, error = %shutdown_err, "cleanup after failed registration failed");
            }
            return Err(err);
        }

        let registration = Arc::new(AppRegistration {
            id: Uuid::new_v4(),
            name: name.to_string(),
            manager,
            shared_from: shared_from.clone(),
            registered_at: Utc::now(),
        });
        {
            let mut apps = self.apps.write().await;
            apps.order.push(name.to_string());
            apps.by_name.insert(name.to_string(), Arc::clone(&registration));
        }

        event!(Level::INFO, id = %registration.id, "app registered");
        self.events.emit(LifecycleEvent::AppRegistered {
            app: name.to_string(),
            shared_from,
        });
        Ok(registration)
    }

    pub async fn unregister_app(&self, name: &str) -> Result<ShutdownReport> {
        let registration = {
            let mut apps = self.apps.write().await;
            let registration = apps
                .by_name
                .remove(name)
                .ok_or_else(|| AppError::NotRegistered("app", name.to_string()))?;
            apps.order.retain(|n| n != name);
            registration
        };

        let span = info_span!("unregister_app", app = %name);
        let report = registration.manager.shutdown().instrument(span).await?;
        self.events.emit(LifecycleEvent::AppUnregistered {
            app: name.to_string(),
        });
        Ok(report)
    }

    pub async fn has_app(&self, name: &str) -> bool {
        self.apps.read().await.by_name.contains_key(name)
    }

    pub async fn app(&self, name: &str) -> Option<Arc<AppRegistration>> {
        self.apps.read().await.by_name.get(name).cloned()
    }

    /// Registered names in registration order.
    pub async fn app_names(&self) -> Vec<String> {
        self.apps.read().await.order.clone()
    }

    pub async fn len(&self) -> usize {
        self.apps.read().await.by_name.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn registrations(&self) -> Vec<Arc<AppRegistration>> {
        let apps = self.apps.read().await;
        apps.order
            .iter()
            .filter_map(|name| apps.by_name.get(name).cloned())
            .collect()
    }

    /// Probe every app now.
    pub async fn get_status(&self) -> RegistryStatus {
        let registrations = self.registrations().await;
        let probe = self.config.health;
        let checks = join_all(
            registrations
                .iter()
                .map(|registration| registration.manager.health_check(&probe)),
        )
        .await;
        RegistryStatus::from_checks(checks)
    }

    /// Shut every app down in registration order, then the plugin manager.
    /// One app failing does not stop the others.
    pub async fn shutdown(&self, options: ShutdownOptions) -> Result<RegistryShutdownReport> {
        let span = info_span!("registry_shutdown");
        self.shutdown_inner(options).instrument(span).await
    }

    async fn shutdown_inner(&self, options: ShutdownOptions) -> Result<RegistryShutdownReport> {
        let started = Instant::now();
        let registrations = {
            let mut apps = self.apps.write().await;
            let Apps { mut by_name, order } = std::mem::take(&mut *apps);
            order
                .into_iter()
                .filter_map(|name| by_name.remove(&name))
                .collect::<Vec<_>>()
        };

        let timeout_ms = options.timeout_ms.unwrap_or(self.config.shutdown_timeout_ms);
        let mut report = RegistryShutdownReport::default();
        for registration in registrations {
            let context = TimeoutContext::new("app shutdown").detail("app", registration.name.clone());
            match with_timeout(registration.manager.shutdown(), timeout_ms, context).await {
                Ok(outcome) if outcome.success => report.shut_down.push(registration.name.clone()),
                Ok(outcome) => report.failures.push(AppShutdownFailure {
                    name: registration.name.clone(),
                    error: outcome.reason.unwrap_or_else(|| "unknown".into()),
                }),
                Err(err) => {
                    event!(Level::WARN, app = %registration.name, error = %err, "app shutdown failed");
                    report.failures.push(AppShutdownFailure {
                        name: registration.name.clone(),
                        error: err.to_string(),
                    });
                }
            }
            self.events.emit(LifecycleEvent::AppUnregistered {
                app: registration.name.clone(),
            });
        }

        if options.include_plugins {
            if let Some(plugins) = &self.plugins {
                report.plugins = Some(plugins.shutdown().await?);
            }
        }

        report.success = report.failures.is_empty()
            && report.plugins.as_ref().is_none_or(|p| p.failed.is_empty());
        report.duration = started.elapsed();
        event!(Level::INFO, success = report.success, apps = report.shut_down.len(), "registry shut down");
        Ok(report)
    }
}
