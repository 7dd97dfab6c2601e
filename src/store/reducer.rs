//! Pure state transitions for the error store.
//!
//! `reduce` never reads the clock or any global; ids and timestamps travel in
//! the actions, so any sequence of actions can be replayed in a test.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::policy::{HealthThresholds, StorePolicy};
use super::state::{ApplicationHealthState, ErrorRecord, FallbackMode};
use crate::diagnostics::{Severity, SystemHealth};

/// A single field update on a unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum UnitField {
    RetryCount(u32),
    IncrementRetry,
    AppliedStrategy(String),
}

/// Every mutation the store accepts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StoreAction {
    AddError(ErrorRecord),
    ClearUnit { unit: String },
    ClearAll,
    MarkRecovered { unit: String },
    SetUnitField { unit: String, field: UnitField },
    SetRecovering {
        unit: Option<String>,
        recovering: bool,
        at: DateTime<Utc>,
    },
    /// `unit: None` sets the whole-app override
    SetFallbackMode {
        unit: Option<String>,
        mode: FallbackMode,
    },
    RecomputeHealth,
    Prune { cutoff: DateTime<Utc> },
}

impl StoreAction {
    pub fn name(&self) -> &'static str {
        match self {
            StoreAction::AddError(_) => "add_error",
            StoreAction::ClearUnit { .. } => "clear_unit",
            StoreAction::ClearAll => "clear_all",
            StoreAction::MarkRecovered { .. } => "mark_recovered",
            StoreAction::SetUnitField { .. } => "set_unit_field",
            StoreAction::SetRecovering { .. } => "set_recovering",
            StoreAction::SetFallbackMode { .. } => "set_fallback_mode",
            StoreAction::RecomputeHealth => "recompute_health",
            StoreAction::Prune { .. } => "prune",
        }
    }
}

fn any_recovering(state: &ApplicationHealthState) -> bool {
    state.active_recoveries > 0 || state.unit_states.values().any(|unit| unit.is_recovering)
}

/// Derive whole-application health from the unrecovered records
pub fn compute_system_health(state: &ApplicationHealthState, thresholds: &HealthThresholds) -> SystemHealth {
    let mut total = 0usize;
    let mut high = 0usize;
    let mut any_critical = false;

    for record in state.active_errors() {
        total += 1;
        match record.severity {
            Severity::Critical => any_critical = true,
            Severity::High => high += 1,
            _ => {}
        }
    }

    if any_critical || total > thresholds.critical_total {
        SystemHealth::Critical
    } else if high > thresholds.degraded_high || total > thresholds.degraded_total {
        SystemHealth::Degraded
    } else {
        SystemHealth::Healthy
    }
}

pub fn reduce(mut state: ApplicationHealthState, action: StoreAction, policy: &StorePolicy) -> ApplicationHealthState {
    match action {
        StoreAction::AddError(mut record) => {
            if let Some(unit_name) = record.unit_name.clone() {
                let unit = state.unit_states.entry(unit_name).or_default();
                unit.has_error = true;
                unit.error_count = unit.error_count.saturating_add(1);
                unit.last_error = Some(record.error.message.clone());
                unit.last_error_time = Some(record.timestamp);
                // A fresh error discards any override from an earlier recovery
                unit.fallback_mode = policy.escalation.fallback_mode(unit.error_count);
                record.retry_count = unit.retry_count;
            }
            state.global_errors.push(record);
            if state.global_errors.len() > policy.max_global_errors {
                let excess = state.global_errors.len() - policy.max_global_errors;
                state.global_errors.drain(..excess);
            }
        }
        StoreAction::ClearUnit { unit } => {
            state.unit_states.remove(&unit);
            state
                .global_errors
                .retain(|record| record.unit_name.as_deref() != Some(unit.as_str()));
            state.is_recovering = any_recovering(&state);
        }
        StoreAction::ClearAll => {
            state.global_errors.clear();
            state.unit_states.clear();
            state.fallback_mode = FallbackMode::None;
            state.is_recovering = false;
            state.active_recoveries = 0;
        }
        StoreAction::MarkRecovered { unit } => {
            state.unit_states.remove(&unit);
            for record in state.global_errors.iter_mut() {
                if record.unit_name.as_deref() == Some(unit.as_str()) {
                    record.recovered = true;
                }
            }
            state.is_recovering = any_recovering(&state);
        }
        StoreAction::SetUnitField { unit, field } => {
            let entry = state.unit_states.entry(unit).or_default();
            match field {
                UnitField::RetryCount(count) => entry.retry_count = count,
                UnitField::IncrementRetry => entry.retry_count = entry.retry_count.saturating_add(1),
                UnitField::AppliedStrategy(id) => {
                    if !entry.has_applied(&id) {
                        entry.applied_strategies.push(id);
                    }
                }
            }
        }
        StoreAction::SetRecovering { unit, recovering, at } => {
            // Attempts are counted so overlapping ones keep the flag raised
            let step = |count: u32| if recovering { count.saturating_add(1) } else { count.saturating_sub(1) };
            match unit {
                // A unit cleared mid-attempt stays cleared
                Some(unit) if !recovering && !state.unit_states.contains_key(&unit) => {}
                Some(unit) => {
                    let entry = state.unit_states.entry(unit).or_default();
                    entry.active_recoveries = step(entry.active_recoveries);
                    entry.is_recovering = entry.active_recoveries > 0;
                }
                None => state.active_recoveries = step(state.active_recoveries),
            }
            state.is_recovering = any_recovering(&state);
            if recovering {
                state.last_recovery_attempt = Some(at);
            }
        }
        StoreAction::SetFallbackMode { unit, mode } => match unit {
            Some(unit) => state.unit_states.entry(unit).or_default().fallback_mode = mode,
            None => state.fallback_mode = mode,
        },
        StoreAction::RecomputeHealth => {}
        StoreAction::Prune { cutoff } => {
            state.global_errors.retain(|record| record.timestamp >= cutoff);
        }
    }

    state.system_health = compute_system_health(&state, &policy.health);
    state.version = state.version.wrapping_add(1);
    state
}
