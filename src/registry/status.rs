use crate::connection::health::{AppHealth, HealthStatus};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

/// Health of every registered app at one point in time.
#[derive(Debug, Clone, Serialize)]
pub struct RegistryStatus {
    pub total: usize,
    pub overall: HealthStatus,
    pub counts: BTreeMap<HealthStatus, usize>,
    pub percentages: BTreeMap<HealthStatus, f64>,
    pub apps: Vec<AppHealth>,
    pub checked_at: DateTime<Utc>,
}

impl RegistryStatus {
    pub fn from_checks(apps: Vec<AppHealth>) -> Self {
        let total = apps.len();
        let mut counts: BTreeMap<HealthStatus, usize> =
            HealthStatus::ALL.iter().map(|s| (*s, 0)).collect();
        for app in &apps {
            *counts.entry(app.status).or_default() += 1;
        }

        let percentages = counts
            .iter()
            .map(|(status, count)| (*status, percentage(*count, total)))
            .collect();

        Self {
            total,
            overall: overall(&counts, total),
            counts,
            percentages,
            apps,
            checked_at: Utc::now(),
        }
    }

    pub fn count(&self, status: HealthStatus) -> usize {
        self.counts.get(&status).copied().unwrap_or(0)
    }

    pub fn percentage(&self, status: HealthStatus) -> f64 {
        self.percentages.get(&status).copied().unwrap_or(0.0)
    }
}

fn percentage(count: usize, total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (count as f64 * 10_000.0 / total as f64).round() / 100.0
}

fn overall(counts: &BTreeMap<HealthStatus, usize>, total: usize) -> HealthStatus {
    let healthy = counts.get(&HealthStatus::Healthy).copied().unwrap_or(0);
    let degraded = counts.get(&HealthStatus::Degraded).copied().unwrap_or(0);
    match total {
        0 => HealthStatus::Unknown,
        _ if healthy == total => HealthStatus::Healthy,
        _ if healthy + degraded == 0 => HealthStatus::Unhealthy,
        _ => HealthStatus::Degraded,
    }
}
