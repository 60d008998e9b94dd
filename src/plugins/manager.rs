use super::{Plugin, PluginConfig, PluginManagerConfig};
use crate::core::{AppError, Result};
use crate::events::{EventBus, LifecycleEvent, SubscriptionId};
use crate::timeout::{TimeoutContext, with_timeout};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::stream::{self, StreamExt};
use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use tracing::{Instrument, Level, event, info_span};

lazy_static! {
    static ref PLUGIN_NAME: Regex = Regex::new(r"^[A-Za-z][A-Za-z0-9_.:-]{0,127}$").unwrap();
}

const FEEDBACK_SOURCE: &str = "plugin-manager";

struct PluginEntry {
    version: String,
    instance: Arc<dyn Plugin>,
    enabled: bool,
    config: PluginConfig,
    loaded_at: DateTime<Utc>,
}

#[derive(Default)]
struct PluginSlots {
    entries: HashMap<String, PluginEntry>,
    order: Vec<String>,
    pending: HashSet<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PluginInfo {
    pub name: String,
    pub version: String,
    pub enabled: bool,
    pub loaded_at: DateTime<Utc>,
    #[serde(skip)]
    pub settings: std::collections::BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NotifyReport {
    pub success: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PluginShutdownReport {
    pub unloaded: Vec<String>,
    pub failed: Vec<String>,
}

/// Removes a name from the pending set when a load finishes either way.
struct PendingLoad<'a> {
    slots: &'a Mutex<PluginSlots>,
    name: String,
}

impl Drop for PendingLoad<'_> {
    fn drop(&mut self) {
        if let Ok(mut slots) = self.slots.lock() {
            slots.pending.remove(&self.name);
        }
    }
}

pub struct PluginManager {
    config: PluginManagerConfig,
    slots: Mutex<PluginSlots>,
    events: EventBus,
}

impl PluginManager {
    pub fn new(config: PluginManagerConfig, events: EventBus) -> Result<Self> {
        config.validate().map_err(AppError::Configuration)?;
        Ok(Self {
            config,
            slots: Mutex::new(PluginSlots::default()),
            events,
        })
    }

    pub fn config(&self) -> &PluginManagerConfig {
        &self.config
    }

    fn info(name: &str, entry: &PluginEntry) -> PluginInfo {
        PluginInfo {
            name: name.to_string(),
            version: entry.version.clone(),
            enabled: entry.enabled,
            loaded_at: entry.loaded_at,
            settings: entry.config.settings.clone(),
        }
    }

    fn reserve(&self, name: &str) -> Result<PendingLoad<'_>> {
        if !PLUGIN_NAME.is_match(name) {
            return Err(AppError::Configuration(format!(
                "invalid plugin name '{}'",
                name
            )));
        }
        let mut slots = self.slots.lock()?;
        if slots.entries.contains_key(name) || slots.pending.contains(name) {
            return Err(AppError::AlreadyRegistered("plugin", name.to_string()));
        }
        slots.pending.insert(name.to_string());
        Ok(PendingLoad {
            slots: &self.slots,
            name: name.to_string(),
        })
    }

    pub async fn load(&self, plugin: Arc<dyn Plugin>, config: PluginConfig) -> Result<PluginInfo> {
        let name = config
            .name
            .clone()
            .unwrap_or_else(|| plugin.name().to_string());
        let span = info_span!("plugin_load", plugin = %name, version = plugin.version());
        self.load_inner(name, plugin, config).instrument(span).await
    }

    async fn load_inner(
        &self,
        name: String,
        plugin: Arc<dyn Plugin>,
        config: PluginConfig,
    ) -> Result<PluginInfo> {
        let _pending = self.reserve(&name)?;

        let timeout_ms = config.init_timeout_ms.unwrap_or(self.config.init_timeout_ms);
        let context = TimeoutContext::new("plugin initialize").detail("plugin", name.clone());
        if let Err(err) = with_timeout(plugin.initialize(&config), timeout_ms, context).await {
            event!(Level::ERROR, error = %err, "plugin failed to initialize");
            self.events.emit(LifecycleEvent::error(
                format!("plugin:{}", name),
                format!("initialization failed: {}", err),
            ));
            return Err(err);
        }

        let entry = PluginEntry {
            version: plugin.version().to_string(),
            instance: plugin,
            enabled: config.enabled,
            config,
            loaded_at: Utc::now(),
        };
        let info = Self::info(&name, &entry);
        {
            let mut slots = self.slots.lock()?;
            slots.order.push(name.clone());
            slots.entries.insert(name.clone(), entry);
        }

        event!(Level::INFO, "plugin loaded");
        self.events.emit(LifecycleEvent::PluginLoaded {
            plugin: name,
            version: info.version.clone(),
        });
        Ok(info)
    }

    /// Load several plugins, initializing at most `max_concurrent_loads` at
    /// once. Results follow input order.
    pub async fn load_all(
        &self,
        batch: Vec<(Arc<dyn Plugin>, PluginConfig)>,
    ) -> Vec<Result<PluginInfo>> {
        stream::iter(batch)
            .map(|(plugin, config)| self.load(plugin, config))
            .buffered(self.config.max_concurrent_loads)
            .collect()
            .await
    }

    /// Shut a plugin down and forget it. Unknown names return `false`.
    pub async fn unload(&self, name: &str) -> Result<bool> {
        let instance = match self.slots.lock()?.entries.get(name) {
            Some(entry) => Arc::clone(&entry.instance),
            None => return Ok(false),
        };

        if let Err(err) = instance.shutdown().await {
            event!(Level::WARN, plugin = name, error = %err, "plugin shutdown failed");
            self.events.emit(LifecycleEvent::warning(
                FEEDBACK_SOURCE,
                format!("plugin '{}' failed to shut down: {}", name, err),
            ));
        }

        {
            let mut slots = self.slots.lock()?;
            slots.entries.remove(name);
            slots.order.retain(|n| n != name);
        }
        self.events.emit(LifecycleEvent::PluginUnloaded {
            plugin: name.to_string(),
        });
        Ok(true)
    }

    /// Deliver an event to every enabled plugin that handles it, in load
    /// order. Failures are counted and reported as `error` events.
    pub async fn notify(&self, event_name: &str, payload: &serde_json::Value) -> NotifyReport {
        let targets: Vec<(String, Arc<dyn Plugin>)> = match self.slots.lock() {
            Ok(slots) => slots
                .order
                .iter()
                .filter_map(|name| slots.entries.get(name).map(|e| (name, e)))
                .filter(|(_, e)| e.enabled && e.instance.handles(event_name))
                .map(|(name, e)| (name.clone(), Arc::clone(&e.instance)))
                .collect(),
            Err(err) => {
                event!(Level::ERROR, error = %err, "plugin slots poisoned");
                return NotifyReport::default();
            }
        };

        let mut report = NotifyReport::default();
        for (name, plugin) in targets {
            let delivery = guard_panics(&name, plugin.on_event(event_name, payload));
            let result = match self.config.notify_timeout_ms {
                Some(timeout_ms) => {
                    let context = TimeoutContext::new("plugin notify")
                        .detail("plugin", name.clone())
                        .detail("event", event_name);
                    with_timeout(delivery, timeout_ms, context).await
                }
                None => delivery.await,
            };

            match result {
                Ok(()) => report.success += 1,
                Err(err) => {
                    report.failed += 1;
                    event!(Level::WARN, plugin = %name, event = event_name, error = %err, "plugin failed to handle event");
                    self.events.emit(LifecycleEvent::error(
                        format!("plugin:{}", name),
                        format!("failed to handle '{}': {}", event_name, err),
                    ));
                }
            }
        }
        report
    }

    /// Forward every event on `bus` to [`notify`](Self::notify) on a
    /// spawned task. Errors and warnings raised by plugins are not
    /// forwarded back.
    pub fn observe(self: &Arc<Self>, bus: &EventBus) -> Result<SubscriptionId> {
        let manager = Arc::downgrade(self);
        bus.subscribe_all(move |lifecycle_event| {
            if lifecycle_event.is_plugin_feedback() {
                return Ok(());
            }
            let Some(manager) = manager.upgrade() else {
                return Ok(());
            };
            let runtime = tokio::runtime::Handle::try_current().map_err(|e| AppError::Plugin {
                name: FEEDBACK_SOURCE.into(),
                message: e.to_string(),
            })?;

            let name = lifecycle_event.name();
            let payload = lifecycle_event.payload();
            runtime.spawn(async move {
                manager.notify(name, &payload).await;
            });
            Ok(())
        })
    }

    fn set_enabled(&self, name: &str, enabled: bool) -> Result<bool> {
        let mut slots = self.slots.lock()?;
        Ok(match slots.entries.get_mut(name) {
            Some(entry) => {
                entry.enabled = enabled;
                true
            }
            None => false,
        })
    }

    pub fn enable(&self, name: &str) -> Result<bool> {
        self.set_enabled(name, true)
    }

    pub fn disable(&self, name: &str) -> Result<bool> {
        self.set_enabled(name, false)
    }

    pub fn get(&self, name: &str) -> Option<PluginInfo> {
        let slots = self.slots.lock().ok()?;
        slots.entries.get(name).map(|entry| Self::info(name, entry))
    }

    pub fn instance(&self, name: &str) -> Option<Arc<dyn Plugin>> {
        let slots = self.slots.lock().ok()?;
        slots.entries.get(name).map(|entry| Arc::clone(&entry.instance))
    }

    /// Loaded plugins in load order.
    pub fn list(&self) -> Vec<PluginInfo> {
        let Ok(slots) = self.slots.lock() else {
            return Vec::new();
        };
        slots
            .order
            .iter()
            .filter_map(|name| slots.entries.get(name).map(|entry| Self::info(name, entry)))
            .collect()
    }

    pub fn has(&self, name: &str) -> bool {
        self.slots
            .lock()
            .map(|s| s.entries.contains_key(name))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.slots.lock().map(|s| s.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Unload everything in reverse load order.
    pub async fn shutdown(&self) -> Result<PluginShutdownReport> {
        let names: Vec<String> = self.slots.lock()?.order.iter().rev().cloned().collect();
        let mut report = PluginShutdownReport::default();
        for name in names {
            let instance = match self.instance(&name) {
                Some(instance) => instance,
                None => continue,
            };
            match instance.shutdown().await {
                Ok(()) => report.unloaded.push(name.clone()),
                Err(err) => {
                    event!(Level::WARN, plugin = %name, error = %err, "plugin shutdown failed");
                    report.failed.push(name.clone());
                }
            }
            let mut slots = self.slots.lock()?;
            slots.entries.remove(&name);
            slots.order.retain(|n| n != &name);
        }
        Ok(report)
    }
}

/// Turn a panic raised while a plugin handles an event into an error.
async fn guard_panics<F>(name: &str, delivery: F) -> Result<()>
where
    F: Future<Output = Result<()>>,
{
    AssertUnwindSafe(delivery).catch_unwind().await.unwrap_or_else(|_| {
        Err(AppError::Plugin {
            name: name.to_string(),
            message: "panicked while handling event".into(),
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct Named(&'static str);

    #[async_trait]
    impl Plugin for Named {
        fn name(&self) -> &str {
            self.0
        }

        fn handles(&self, event: &str) -> bool {
            event != "ignored"
        }

        async fn on_event(&self, _event: &str, _payload: &serde_json::Value) -> Result<()> {
            Ok(())
        }
    }

    fn manager() -> PluginManager {
        PluginManager::new(PluginManagerConfig::default(), EventBus::new()).unwrap()
    }

    #[tokio::test]
    async fn test_names_are_validated_and_unique() {
        let manager = manager();
        manager
            .load(Arc::new(Named("audit")), PluginConfig::default())
            .await
            .unwrap();

        let dup = manager
            .load(Arc::new(Named("audit")), PluginConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(dup, AppError::AlreadyRegistered("plugin", _)));

        let bad = manager
            .load(Arc::new(Named("audit")), PluginConfig::named("no spaces"))
            .await
            .unwrap_err();
        assert!(matches!(bad, AppError::Configuration(_)));

        let renamed = manager
            .load(Arc::new(Named("audit")), PluginConfig::named("audit-2").setting("level", 2))
            .await
            .unwrap();
        assert_eq!(renamed.settings["level"], 2);
        assert_eq!(manager.len(), 2);
    }

    #[tokio::test]
    async fn test_disabled_and_unhandled_events_are_skipped() {
        let manager = manager();
        manager.load(Arc::new(Named("a")), PluginConfig::default()).await.unwrap();
        manager.load(Arc::new(Named("b")), PluginConfig::default().disabled()).await.unwrap();

        let payload = serde_json::json!({});
        assert_eq!(manager.notify("x", &payload).await.success, 1);
        assert_eq!(manager.notify("ignored", &payload).await.success, 0);

        assert!(manager.enable("b").unwrap());
        assert_eq!(manager.notify("x", &payload).await.success, 2);
        assert!(!manager.disable("zzz").unwrap());
    }

    #[tokio::test]
    async fn test_unload_and_shutdown() {
        let manager = manager();
        for name in ["a", "b", "c"] {
            manager.load(Arc::new(Named(name)), PluginConfig::default()).await.unwrap();
        }
        assert!(manager.unload("b").await.unwrap());
        assert!(!manager.unload("b").await.unwrap());

        let names: Vec<_> = manager.list().into_iter().map(|p| p.name).collect();
        assert_eq!(names, vec!["a", "c"]);

        let report = manager.shutdown().await.unwrap();
        assert_eq!(report.unloaded, vec!["c", "a"]);
        assert!(manager.is_empty());
    }
}
