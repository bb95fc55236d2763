//! Health status types.
//!
//! - `HealthStatus`: state of one component or the whole engine
//! - `ComponentHealth`: result of a single probe
//! - `HealthReport`: all probe results folded into one status
//!
//! # Example
//!
//! ```rust,ignore
//! use cadence_core::health::{ComponentHealth, HealthReport};
//!
//! let store = ComponentHealth::healthy("job_store").with_latency_ms(2);
//! let report = HealthReport::new().with_component(store);
//! assert!(report.is_healthy());
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// Health Status
// ═══════════════════════════════════════════════════════════════════════════════

/// Health status of a component or the entire engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Component is fully operational
    #[default]
    Healthy,
    /// Component works but is slow or partially impaired
    Degraded,
    /// Component is not operational
    Unhealthy,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }

    /// Healthy or degraded.
    pub fn is_operational(&self) -> bool {
        matches!(self, Self::Healthy | Self::Degraded)
    }

    /// Combine two statuses, returning the worse one.
    pub fn combine(self, other: Self) -> Self {
        match (self, other) {
            (Self::Unhealthy, _) | (_, Self::Unhealthy) => Self::Unhealthy,
            (Self::Degraded, _) | (_, Self::Degraded) => Self::Degraded,
            _ => Self::Healthy,
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Component Health
// ═══════════════════════════════════════════════════════════════════════════════

/// Health information for a single component.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub name: String,

    pub status: HealthStatus,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Probe latency in milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,

    pub checked_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,

    /// Error details (only present if unhealthy)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ComponentHealth {
    fn with_initial_status(name: impl Into<String>, status: HealthStatus) -> Self {
        Self {
            name: name.into(),
            status,
            message: None,
            latency_ms: None,
            checked_at: Utc::now(),
            metadata: HashMap::new(),
            error: None,
        }
    }

    pub fn healthy(name: impl Into<String>) -> Self {
        Self::with_initial_status(name, HealthStatus::Healthy)
    }

    pub fn degraded(name: impl Into<String>) -> Self {
        Self::with_initial_status(name, HealthStatus::Degraded)
    }

    pub fn unhealthy(name: impl Into<String>) -> Self {
        Self::with_initial_status(name, HealthStatus::Unhealthy)
    }

    /// Create from a check result.
    pub fn from_result<E: std::fmt::Display>(
        name: impl Into<String>,
        result: Result<(), E>,
        latency: Duration,
    ) -> Self {
        match result {
            Ok(()) => Self::healthy(name).with_latency(latency),
            Err(e) => Self::unhealthy(name)
                .with_error(e.to_string())
                .with_latency(latency),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency_ms = Some(latency.as_millis() as u64);
        self
    }

    pub fn with_latency_ms(mut self, latency_ms: u64) -> Self {
        self.latency_ms = Some(latency_ms);
        self
    }

    /// Add an error message (sets status to Unhealthy).
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.status = HealthStatus::Unhealthy;
        self.error = Some(error.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.metadata.insert(key.into(), v);
        }
        self
    }

    pub fn is_healthy(&self) -> bool {
        self.status.is_healthy()
    }

    /// Downgrade a healthy component whose latency exceeds `threshold_ms`.
    pub fn check_latency_threshold(&mut self, threshold_ms: u64) {
        if let Some(latency) = self.latency_ms {
            if latency > threshold_ms && self.status == HealthStatus::Healthy {
                self.status = HealthStatus::Degraded;
                self.message = Some(format!(
                    "High latency detected: {}ms (threshold: {}ms)",
                    latency, threshold_ms
                ));
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Health Report
// ═══════════════════════════════════════════════════════════════════════════════

/// Aggregated health of every probed component.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,

    pub timestamp: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub components: Vec<ComponentHealth>,

    pub summary: HealthSummary,
}

impl HealthReport {
    pub fn new() -> Self {
        Self {
            status: HealthStatus::Healthy,
            timestamp: Utc::now(),
            components: Vec::new(),
            summary: HealthSummary::default(),
        }
    }

    pub fn with_component(mut self, component: ComponentHealth) -> Self {
        self.status = self.status.combine(component.status);
        self.components.push(component);
        self.update_summary();
        self
    }

    pub fn with_components(mut self, components: Vec<ComponentHealth>) -> Self {
        for component in components {
            self.status = self.status.combine(component.status);
            self.components.push(component);
        }
        self.update_summary();
        self
    }

    pub fn is_healthy(&self) -> bool {
        self.status.is_healthy()
    }

    pub fn is_operational(&self) -> bool {
        self.status.is_operational()
    }

    pub fn get_component(&self, name: &str) -> Option<&ComponentHealth> {
        self.components.iter().find(|c| c.name == name)
    }

    /// Names of components that are not healthy.
    pub fn failing(&self) -> Vec<&str> {
        self.components
            .iter()
            .filter(|c| !c.is_healthy())
            .map(|c| c.name.as_str())
            .collect()
    }

    fn update_summary(&mut self) {
        let mut summary = HealthSummary {
            total: self.components.len(),
            ..Default::default()
        };
        for component in &self.components {
            match component.status {
                HealthStatus::Healthy => summary.healthy += 1,
                HealthStatus::Degraded => summary.degraded += 1,
                HealthStatus::Unhealthy => summary.unhealthy += 1,
            }
        }
        self.summary = summary;
    }
}

impl Default for HealthReport {
    fn default() -> Self {
        Self::new()
    }
}

/// Summary counts for a health report.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthSummary {
    pub total: usize,
    pub healthy: usize,
    pub degraded: usize,
    pub unhealthy: usize,
}
