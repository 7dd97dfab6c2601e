use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::diagnostics::{DiagnosticResult, Severity, SystemHealth};

/// Escalation ladder of reduced functionality: `None < Minimal < Static < Offline`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FallbackMode {
    #[default]
    None,
    Minimal,
    Static,
    Offline,
}

impl fmt::Display for FallbackMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FallbackMode::None => "none",
            FallbackMode::Minimal => "minimal",
            FallbackMode::Static => "static",
            FallbackMode::Offline => "offline",
        };
        f.write_str(s)
    }
}

/// One captured failure in the global log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub id: String,
    pub unit_name: Option<String>,
    pub error: DiagnosticResult,
    pub timestamp: DateTime<Utc>,
    pub severity: Severity,
    pub recovered: bool,
    pub retry_count: u32,
}

/// Health of one named unit
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UnitHealthState {
    pub has_error: bool,
    /// Monotonic within one incident streak
    pub error_count: u32,
    pub last_error: Option<String>,
    pub last_error_time: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub fallback_mode: FallbackMode,
    /// True while any recovery attempt for this unit is running
    pub is_recovering: bool,
    /// Recovery attempts for this unit currently running
    #[serde(default)]
    pub active_recoveries: u32,
    /// Strategies applied during the current streak
    pub applied_strategies: Vec<String>,
}

impl UnitHealthState {
    pub fn has_applied(&self, strategy_id: &str) -> bool {
        self.applied_strategies.iter().any(|s| s == strategy_id)
    }
}

/// Process-wide health, owned exclusively by the store
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApplicationHealthState {
    pub global_errors: Vec<ErrorRecord>,
    pub unit_states: BTreeMap<String, UnitHealthState>,
    /// Derived; recomputed after every change to `global_errors`
    pub system_health: SystemHealth,
    /// Whole-app override, independent of per-unit modes
    pub fallback_mode: FallbackMode,
    pub is_recovering: bool,
    /// Running recovery attempts not attributed to a unit
    #[serde(default)]
    pub active_recoveries: u32,
    pub last_recovery_attempt: Option<DateTime<Utc>>,
    /// Incremented by every applied action
    pub version: u64,
}

impl ApplicationHealthState {
    pub fn unit(&self, unit_name: &str) -> Option<&UnitHealthState> {
        self.unit_states.get(unit_name)
    }

    pub fn active_errors(&self) -> impl Iterator<Item = &ErrorRecord> {
        self.global_errors.iter().filter(|record| !record.recovered)
    }

    pub fn unit_errors<'a>(&'a self, unit_name: &'a str) -> impl Iterator<Item = &'a ErrorRecord> + 'a {
        self.global_errors
            .iter()
            .filter(move |record| record.unit_name.as_deref() == Some(unit_name))
    }
}
