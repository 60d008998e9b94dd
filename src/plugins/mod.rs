//! Plugins observing the lifecycle of registered apps.
//!
//! A plugin is initialized once when loaded, receives the events it
//! [`handles`](Plugin::handles) while enabled, and is shut down on unload.
//! All plugin state lives in a [`PluginManager`].

pub mod config;
pub mod manager;

use crate::core::Result;
use async_trait::async_trait;

pub use config::{PluginConfig, PluginManagerConfig};
pub use manager::{NotifyReport, PluginInfo, PluginManager, PluginShutdownReport};

#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    fn version(&self) -> &str {
        "0.0.0"
    }

    async fn initialize(&self, _config: &PluginConfig) -> Result<()> {
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }

    /// Whether the plugin wants events called `event`.
    fn handles(&self, _event: &str) -> bool {
        true
    }

    async fn on_event(&self, event: &str, payload: &serde_json::Value) -> Result<()>;
}
