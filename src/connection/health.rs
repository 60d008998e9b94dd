use super::manager::ConnectionManager;
use crate::timeout::{TimeoutContext, validate_timeout, with_timeout};
use serde::Serialize;
use std::fmt;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Timeout,
    Unknown,
}

impl HealthStatus {
    pub const ALL: [HealthStatus; 5] = [
        HealthStatus::Healthy,
        HealthStatus::Degraded,
        HealthStatus::Unhealthy,
        HealthStatus::Timeout,
        HealthStatus::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
            HealthStatus::Timeout => "timeout",
            HealthStatus::Unknown => "unknown",
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ping deadline and the latency above which a connection counts as
/// degraded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthProbe {
    pub timeout_ms: u64,
    pub degraded_after_ms: u64,
}

impl Default for HealthProbe {
    fn default() -> Self {
        Self {
            timeout_ms: 5_000,
            degraded_after_ms: 1_000,
        }
    }
}

impl HealthProbe {
    pub fn new(timeout_ms: u64, degraded_after_ms: u64) -> Self {
        Self {
            timeout_ms,
            degraded_after_ms,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        validate_timeout(self.timeout_ms).map_err(|e| e.to_string())?;
        if self.degraded_after_ms >= self.timeout_ms {
            return Err("degraded_after_ms must be below timeout_ms".into());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AppHealth {
    pub name: String,
    pub status: HealthStatus,
    pub driver: Option<String>,
    pub latency: Option<Duration>,
    pub error: Option<String>,
    pub owner: Option<String>,
    pub references: usize,
}

impl ConnectionManager {
    /// Ping the connection. Never fails; problems are reported in the
    /// returned status.
    pub async fn health_check(&self, probe: &HealthProbe) -> AppHealth {
        let mut health = AppHealth {
            name: self.name().to_string(),
            status: HealthStatus::Unknown,
            driver: None,
            latency: None,
            error: None,
            owner: None,
            references: 0,
        };

        let handle = match self.shared_handle() {
            Ok(handle) => handle,
            Err(err) => {
                health.error = Some(err.to_string());
                return health;
            }
        };
        let adapter = handle.adapter();
        health.driver = Some(adapter.driver().to_string());
        health.owner = handle.owner();
        health.references = handle.ref_count();

        let started = Instant::now();
        let context = TimeoutContext::new("health check").detail("connection", self.name());
        match with_timeout(adapter.ping(), probe.timeout_ms, context).await {
            Ok(()) => {
                let latency = started.elapsed();
                health.latency = Some(latency);
                health.status = if latency > Duration::from_millis(probe.degraded_after_ms) {
                    HealthStatus::Degraded
                } else {
                    HealthStatus::Healthy
                };
            }
            Err(err) if err.is_timeout() => {
                health.status = HealthStatus::Timeout;
                health.error = Some(err.to_string());
            }
            Err(err) => {
                health.status = HealthStatus::Unhealthy;
                health.error = Some(err.to_string());
            }
        }
        health
    }
}
