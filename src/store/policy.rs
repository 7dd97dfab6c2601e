use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::state::FallbackMode;

/// Error-count thresholds for the fallback ladder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EscalationPolicy {
    pub minimal_at: u32,
    pub static_at: u32,
    pub offline_at: u32,
}

impl Default for EscalationPolicy {
    fn default() -> Self {
        Self {
            minimal_at: 1,
            static_at: 3,
            offline_at: 5,
        }
    }
}

impl EscalationPolicy {
    /// The only place a fallback mode is derived from an error count
    pub fn fallback_mode(&self, error_count: u32) -> FallbackMode {
        if error_count >= self.offline_at {
            FallbackMode::Offline
        } else if error_count >= self.static_at {
            FallbackMode::Static
        } else if error_count >= self.minimal_at {
            FallbackMode::Minimal
        } else {
            FallbackMode::None
        }
    }
}

/// Thresholds used to derive whole-application health
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthThresholds {
    /// More than this many active errors is critical
    pub critical_total: usize,
    /// More than this many active errors is degraded
    pub degraded_total: usize,
    /// More than this many active high-severity errors is degraded
    pub degraded_high: usize,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            critical_total: 10,
            degraded_total: 5,
            degraded_high: 2,
        }
    }
}

/// Everything the reducer needs besides the state itself
#[derive(Debug, Clone)]
pub struct StorePolicy {
    pub escalation: EscalationPolicy,
    pub health: HealthThresholds,
    pub max_global_errors: usize,
    pub retention: Duration,
    pub prune_interval: Duration,
    pub health_poll_interval: Duration,
}

impl Default for StorePolicy {
    fn default() -> Self {
        Self {
            escalation: EscalationPolicy::default(),
            health: HealthThresholds::default(),
            max_global_errors: 50,
            retention: Duration::from_secs(5 * 60),
            prune_interval: Duration::from_secs(60),
            health_poll_interval: Duration::from_secs(30),
        }
    }
}
