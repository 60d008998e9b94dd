//! Lifecycle notifications.
//!
//! Components publish [`LifecycleEvent`]s on an [`EventBus`]. Handlers are
//! plain callbacks registered per event name or for every event. Delivery
//! is synchronous and in subscription order; a handler that fails or panics
//! is logged and skipped, and the remaining handlers still run.

use crate::core::Result;
use serde::Serialize;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{Level, event};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum LifecycleEvent {
    AppRegistered {
        app: String,
        shared_from: Option<String>,
    },
    AppUnregistered {
        app: String,
    },
    AutoMigrationStarted {
        app: String,
    },
    AutoMigrationCompleted {
        app: String,
        units: Vec<String>,
        batch: Option<i64>,
    },
    AutoSeedStarted {
        app: String,
    },
    AutoSeedCompleted {
        app: String,
        units: Vec<String>,
        batch: Option<i64>,
    },
    AutoModelRegistrationStarted {
        app: String,
    },
    AutoModelRegistrationCompleted {
        app: String,
        models: Vec<String>,
    },
    AppRollbackStarted {
        app: String,
        reason: String,
    },
    AppRollbackCompleted {
        app: String,
    },
    AppRollbackFailed {
        app: String,
        errors: Vec<String>,
    },
    PluginLoaded {
        plugin: String,
        version: String,
    },
    PluginUnloaded {
        plugin: String,
    },
    Error {
        source: String,
        message: String,
    },
    Warning {
        source: String,
        message: String,
    },
}

impl LifecycleEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::AppRegistered { .. } => "app-registered",
            Self::AppUnregistered { .. } => "app-unregistered",
            Self::AutoMigrationStarted { .. } => "auto-migration-started",
            Self::AutoMigrationCompleted { .. } => "auto-migration-completed",
            Self::AutoSeedStarted { .. } => "auto-seed-started",
            Self::AutoSeedCompleted { .. } => "auto-seed-completed",
            Self::AutoModelRegistrationStarted { .. } => "auto-model-registration-started",
            Self::AutoModelRegistrationCompleted { .. } => "auto-model-registration-completed",
            Self::AppRollbackStarted { .. } => "app-rollback-started",
            Self::AppRollbackCompleted { .. } => "app-rollback-completed",
            Self::AppRollbackFailed { .. } => "app-rollback-failed",
            Self::PluginLoaded { .. } => "plugin-loaded",
            Self::PluginUnloaded { .. } => "plugin-unloaded",
            Self::Error { .. } => "error",
            Self::Warning { .. } => "warning",
        }
    }

    pub fn payload(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    pub fn warning(source: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Warning {
            source: source.into(),
            message: message.into(),
        }
    }

    pub fn error(source: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error {
            source: source.into(),
            message: message.into(),
        }
    }

    /// Error or warning raised by the plugin layer itself.
    pub fn is_plugin_feedback(&self) -> bool {
        match self {
            Self::Error { source, .. } | Self::Warning { source, .. } => {
                source.starts_with("plugin")
            }
            _ => false,
        }
    }
}

pub type EventHandler = Arc<dyn Fn(&LifecycleEvent) -> Result<()> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscription {
    id: SubscriptionId,
    event: Option<String>,
    handler: EventHandler,
}

/// Outcome of one `emit`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Delivery {
    pub delivered: usize,
    pub failed: usize,
}

/// Cheaply cloneable handle to a shared list of subscribers.
#[derive(Clone, Default)]
pub struct EventBus {
    subscriptions: Arc<RwLock<Vec<Subscription>>>,
    next_id: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle events named `event` (see [`LifecycleEvent::name`]).
    pub fn subscribe<F>(&self, event: &str, handler: F) -> Result<SubscriptionId>
    where
        F: Fn(&LifecycleEvent) -> Result<()> + Send + Sync + 'static,
    {
        self.add(Some(event.to_string()), Arc::new(handler))
    }

    /// Handle every event.
    pub fn subscribe_all<F>(&self, handler: F) -> Result<SubscriptionId>
    where
        F: Fn(&LifecycleEvent) -> Result<()> + Send + Sync + 'static,
    {
        self.add(None, Arc::new(handler))
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> Result<bool> {
        let mut subscriptions = self.subscriptions.write()?;
        let before = subscriptions.len();
        subscriptions.retain(|s| s.id != id);
        Ok(subscriptions.len() != before)
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscriptions.read().map(|s| s.len()).unwrap_or(0)
    }

    fn add(&self, event: Option<String>, handler: EventHandler) -> Result<SubscriptionId> {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscriptions.write()?.push(Subscription { id, event, handler });
        Ok(id)
    }

    pub fn emit(&self, lifecycle_event: LifecycleEvent) -> Delivery {
        let name = lifecycle_event.name();
        let handlers: Vec<EventHandler> = match self.subscriptions.read() {
            Ok(subscriptions) => subscriptions
                .iter()
                .filter(|s| s.event.as_deref().is_none_or(|e| e == name))
                .map(|s| Arc::clone(&s.handler))
                .collect(),
            Err(err) => {
                event!(Level::ERROR, error = %err, "event bus lock poisoned");
                return Delivery::default();
            }
        };

        let mut delivery = Delivery::default();
        for handler in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(&lifecycle_event))) {
                Ok(Ok(())) => delivery.delivered += 1,
                Ok(Err(err)) => {
                    delivery.failed += 1;
                    event!(Level::WARN, event = name, error = %err, "event handler failed");
                }
                Err(_) => {
                    delivery.failed += 1;
                    event!(Level::WARN, event = name, "event handler panicked");
                }
            }
        }
        delivery
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::AppError;
    use std::sync::Mutex;

    #[test]
    fn test_event_names_and_payload() {
        let registered = LifecycleEvent::AppRegistered {
            app: "billing".into(),
            shared_from: None,
        };
        assert_eq!(registered.name(), "app-registered");
        assert_eq!(registered.payload()["event"], "app-registered");
        assert_eq!(registered.payload()["app"], "billing");
    }

    #[test]
    fn test_failing_handler_does_not_stop_delivery() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        bus.subscribe_all(|_| Err(AppError::Plugin {
            name: "x".into(),
            message: "nope".into(),
        }))
        .unwrap();
        bus.subscribe_all(|_| panic!("handler panic")).unwrap();
        let sink = Arc::clone(&seen);
        bus.subscribe("warning", move |e| {
            sink.lock().unwrap().push(e.name());
            Ok(())
        })
        .unwrap();

        let delivery = bus.emit(LifecycleEvent::warning("test", "careful"));
        assert_eq!(delivery, Delivery { delivered: 1, failed: 2 });
        assert_eq!(*seen.lock().unwrap(), vec!["warning"]);

        let delivery = bus.emit(LifecycleEvent::error("test", "bad"));
        assert_eq!(delivery.delivered, 0);
    }

    #[test]
    fn test_unsubscribe() {
        let bus = EventBus::new();
        let id = bus.subscribe_all(|_| Ok(())).unwrap();
        assert_eq!(bus.subscriber_count(), 1);
        assert!(bus.unsubscribe(id).unwrap());
        assert!(!bus.unsubscribe(id).unwrap());
        assert_eq!(bus.emit(LifecycleEvent::warning("t", "m")).delivered, 0);
    }

    #[test]
    fn test_plugin_feedback_detection() {
        assert!(LifecycleEvent::error("plugin:audit", "x").is_plugin_feedback());
        assert!(LifecycleEvent::warning("plugin-manager", "x").is_plugin_feedback());
        assert!(!LifecycleEvent::error("registry", "x").is_plugin_feedback());
    }
}
