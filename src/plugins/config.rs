use crate::timeout::validate_timeout;
use std::collections::BTreeMap;

/// Per-plugin load settings.
#[derive(Debug, Clone, PartialEq)]
pub struct PluginConfig {
    /// Overrides the plugin's own name.
    pub name: Option<String>,
    pub enabled: bool,
    pub settings: BTreeMap<String, serde_json::Value>,
    /// Overrides the manager's initialization deadline.
    pub init_timeout_ms: Option<u64>,
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            name: None,
            enabled: true,
            settings: BTreeMap::new(),
            init_timeout_ms: None,
        }
    }
}

impl PluginConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn setting(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.settings.insert(key.into(), value.into());
        self
    }

    pub fn init_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.init_timeout_ms = Some(timeout_ms);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PluginManagerConfig {
    pub init_timeout_ms: u64,
    pub max_concurrent_loads: usize,
    /// Deadline for one plugin handling one event.
    pub notify_timeout_ms: Option<u64>,
}

impl Default for PluginManagerConfig {
    fn default() -> Self {
        Self {
            init_timeout_ms: 5_000,
            max_concurrent_loads: 4,
            notify_timeout_ms: None,
        }
    }
}

impl PluginManagerConfig {
    pub fn init_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.init_timeout_ms = timeout_ms;
        self
    }

    pub fn max_concurrent_loads(mut self, max: usize) -> Self {
        self.max_concurrent_loads = max;
        self
    }

    pub fn notify_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.notify_timeout_ms = Some(timeout_ms);
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        validate_timeout(self.init_timeout_ms).map_err(|e| e.to_string())?;
        if self.max_concurrent_loads == 0 {
            return Err("max_concurrent_loads must be > 0".into());
        }
        if let Some(timeout_ms) = self.notify_timeout_ms {
            validate_timeout(timeout_ms).map_err(|e| e.to_string())?;
        }
        Ok(())
    }
}
