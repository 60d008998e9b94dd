use crate::connection::config::ConnectionConfig;
use crate::connection::health::HealthProbe;
use crate::history::HistoryConfig;
use crate::models::ModelDefinition;
use crate::timeout::validate_timeout;

/// Everything needed to register one app.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Ignored when `share_from` is set.
    pub connection: ConnectionConfig,
    /// Reuse the connection of an already registered app.
    pub share_from: Option<String>,
    pub migrations: Option<HistoryConfig>,
    pub seeds: Option<HistoryConfig>,
    pub models: Vec<ModelDefinition>,
    pub auto_register_models: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            share_from: None,
            migrations: None,
            seeds: None,
            models: Vec::new(),
            auto_register_models: true,
        }
    }
}

impl AppConfig {
    pub fn new(connection: ConnectionConfig) -> Self {
        Self {
            connection,
            ..Self::default()
        }
    }

    pub fn shared(app: impl Into<String>) -> Self {
        Self {
            share_from: Some(app.into()),
            ..Self::default()
        }
    }

    pub fn migrations(mut self, history: HistoryConfig) -> Self {
        self.migrations = Some(history);
        self
    }

    pub fn seeds(mut self, history: HistoryConfig) -> Self {
        self.seeds = Some(history);
        self
    }

    pub fn model(mut self, definition: ModelDefinition) -> Self {
        self.models.push(definition);
        self
    }

    pub fn auto_register_models(mut self, enabled: bool) -> Self {
        self.auto_register_models = enabled;
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        match &self.share_from {
            Some(target) if target.trim().is_empty() => {
                return Err("share_from cannot be blank".into());
            }
            Some(_) => {}
            None => self.connection.validate()?,
        }
        if let Some(migrations) = &self.migrations {
            migrations
                .validate()
                .map_err(|e| format!("migrations: {}", e))?;
        }
        if let Some(seeds) = &self.seeds {
            seeds.validate().map_err(|e| format!("seeds: {}", e))?;
        }
        if let Some(model) = self.models.iter().find(|m| m.name.trim().is_empty()) {
            return Err(format!("model for table '{}' has no name", model.table));
        }
        Ok(())
    }
}

/// Registry-wide settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryConfig {
    pub health: HealthProbe,
    /// Deadline for shutting down a single app.
    pub shutdown_timeout_ms: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            health: HealthProbe::default(),
            shutdown_timeout_ms: 10_000,
        }
    }
}

impl RegistryConfig {
    pub fn health(mut self, probe: HealthProbe) -> Self {
        self.health = probe;
        self
    }

    pub fn shutdown_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.shutdown_timeout_ms = timeout_ms;
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        self.health.validate()?;
        validate_timeout(self.shutdown_timeout_ms).map_err(|e| e.to_string())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_config_skips_connection_checks() {
        let mut config = AppConfig::shared("main");
        config.connection.database = String::new();
        assert!(config.validate().is_ok());

        assert!(AppConfig::shared("  ").validate().is_err());
        assert!(AppConfig::new(ConnectionConfig::memory("")).validate().is_err());
    }

    #[test]
    fn test_history_errors_are_prefixed() {
        let config = AppConfig::default().seeds(HistoryConfig::directory("seeds").table("bad table"));
        let err = config.validate().unwrap_err();
        assert!(err.starts_with("seeds:"));
    }

    #[test]
    fn test_registry_config_defaults_are_valid() {
        assert!(RegistryConfig::default().validate().is_ok());
        assert!(RegistryConfig::default().shutdown_timeout_ms(0).validate().is_err());
    }
}
