//! Health report produced by `DataWarehouse::check_health`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outcome of one probe or of the whole report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Probe passed
    Healthy,
    /// Probe failed but the engine can still serve some requests
    Degraded,
    /// Probe failed on a component every request needs
    Unhealthy,
}

impl HealthStatus {
    /// True for [`HealthStatus::Healthy`].
    pub fn is_ok(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }

    fn severity(&self) -> u8 {
        match self {
            HealthStatus::Healthy => 0,
            HealthStatus::Degraded => 1,
            HealthStatus::Unhealthy => 2,
        }
    }
}

/// One probe result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheck {
    /// Component probed, e.g. `metadata:index-sqlite` or `storage:file`
    pub component: String,
    /// Result
    pub status: HealthStatus,
    /// Failure description
    pub detail: Option<String>,
}

/// Every probe of one `check_health` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    /// When the report was taken
    pub checked_at: DateTime<Utc>,
    /// True if the engine was mounted
    pub mounted: bool,
    /// Individual probes in execution order
    pub checks: Vec<HealthCheck>,
}

impl HealthReport {
    pub(crate) fn new(mounted: bool) -> Self {
        Self {
            checked_at: Utc::now(),
            mounted,
            checks: Vec::new(),
        }
    }

    pub(crate) fn pass(&mut self, component: impl Into<String>) {
        self.checks.push(HealthCheck {
            component: component.into(),
            status: HealthStatus::Healthy,
            detail: None,
        });
    }

    pub(crate) fn fail(
        &mut self,
        component: impl Into<String>,
        status: HealthStatus,
        detail: impl Into<String>,
    ) {
        self.checks.push(HealthCheck {
            component: component.into(),
            status,
            detail: Some(detail.into()),
        });
    }

    /// Worst status across all checks; unhealthy when unmounted.
    pub fn status(&self) -> HealthStatus {
        if !self.mounted {
            return HealthStatus::Unhealthy;
        }
        self.checks
            .iter()
            .map(|c| c.status)
            .max_by_key(|s| s.severity())
            .unwrap_or(HealthStatus::Healthy)
    }

    /// True if mounted and every check passed.
    pub fn is_healthy(&self) -> bool {
        self.status().is_ok()
    }

    /// Checks that did not pass.
    pub fn failures(&self) -> impl Iterator<Item = &HealthCheck> {
        self.checks.iter().filter(|c| !c.status.is_ok())
    }
}
