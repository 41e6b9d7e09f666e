// Service health and startup outcome models.

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// Per-service readiness, mutated only by the health monitor during one orchestration run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceHealth {
    Unknown,
    Starting,
    Healthy,
    Unhealthy,
    Failed,
}

impl fmt::Display for ServiceHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServiceHealth::Unknown => "unknown",
            ServiceHealth::Starting => "starting",
            ServiceHealth::Healthy => "healthy",
            ServiceHealth::Unhealthy => "unhealthy",
            ServiceHealth::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Readiness board for one orchestration run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HealthBoard {
    services: BTreeMap<String, ServiceHealth>,
}

impl HealthBoard {
    pub fn new<'a>(services: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            services: services
                .into_iter()
                .map(|s| (s.to_string(), ServiceHealth::Unknown))
                .collect(),
        }
    }

    pub fn get(&self, service: &str) -> ServiceHealth {
        self.services
            .get(service)
            .copied()
            .unwrap_or(ServiceHealth::Unknown)
    }

    pub(crate) fn set(&mut self, service: &str, health: ServiceHealth) {
        self.services.insert(service.to_string(), health);
    }

    pub fn is_ready(&self, service: &str) -> bool {
        self.get(service) == ServiceHealth::Healthy
    }

    pub fn ready(&self) -> Vec<String> {
        self.services
            .iter()
            .filter(|(_, h)| **h == ServiceHealth::Healthy)
            .map(|(n, _)| n.clone())
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, ServiceHealth)> {
        self.services.iter().map(|(n, h)| (n.as_str(), *h))
    }
}

/// Terminal result of phased startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StartupOutcome {
    Success {
        ready: Vec<String>,
    },
    /// Core subset ready; the rest did not become ready in time.
    DegradedSuccess {
        ready: Vec<String>,
        not_ready: Vec<String>,
    },
    Failure {
        ready: Vec<String>,
        not_ready: Vec<String>,
    },
}

impl StartupOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, StartupOutcome::Failure { .. })
    }

    pub fn not_ready(&self) -> &[String] {
        match self {
            StartupOutcome::Success { .. } => &[],
            StartupOutcome::DegradedSuccess { not_ready, .. }
            | StartupOutcome::Failure { not_ready, .. } => not_ready,
        }
    }
}
