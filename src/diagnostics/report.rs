//! On-demand diagnostic reports: a view over the store plus environment probes.

use chrono::Utc;
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

use super::types::{DiagnosticReport, DiagnosticResult, ErrorCategory, FailureKind, Severity, SystemHealth};
use crate::storage::{is_corrupted_markup, PersistentStore};
use crate::store::{ApplicationHealthState, FallbackMode};

/// Ad-hoc check of the surrounding environment, run at report time
pub trait EnvironmentProbe: Send + Sync {
    fn name(&self) -> &str;
    fn probe(&self, state: &ApplicationHealthState) -> Vec<DiagnosticResult>;
}

/// Flags allow-listed persisted entries that are markup or oversized.
/// Read-only; purging is left to recovery.
pub struct StorageProbe {
    storage: Arc<dyn PersistentStore>,
    keys: Vec<String>,
    size_ceiling: usize,
}

impl StorageProbe {
    pub fn new(storage: Arc<dyn PersistentStore>, keys: Vec<String>, size_ceiling: usize) -> Self {
        Self {
            storage,
            keys,
            size_ceiling,
        }
    }
}

impl EnvironmentProbe for StorageProbe {
    fn name(&self) -> &str {
        "storage"
    }

    fn probe(&self, _state: &ApplicationHealthState) -> Vec<DiagnosticResult> {
        let mut issues = Vec::new();
        for key in &self.keys {
            let value = match self.storage.get(key) {
                Ok(Some(value)) => value,
                Ok(None) => continue,
                Err(e) => {
                    issues.push(
                        DiagnosticResult::new(
                            ErrorCategory::Data,
                            FailureKind::Storage,
                            Severity::Medium,
                            format!("Persisted storage unreadable: {e}"),
                            "Check that the storage file is readable and writable.",
                        )
                        .with_details(json!({ "probe": "storage" })),
                    );
                    break;
                }
            };
            if is_corrupted_markup(&value) {
                issues.push(
                    DiagnosticResult::new(
                        ErrorCategory::Data,
                        FailureKind::Storage,
                        Severity::Medium,
                        format!("Persisted entry '{key}' holds a markup page"),
                        "Purge the corrupted entry; it is discarded on the next read.",
                    )
                    .with_details(json!({ "probe": "storage", "key": key })),
                );
            } else if value.len() > self.size_ceiling {
                issues.push(
                    DiagnosticResult::new(
                        ErrorCategory::Data,
                        FailureKind::Storage,
                        Severity::Medium,
                        format!("Persisted entry '{key}' exceeds {} bytes", self.size_ceiling),
                        "Purge oversized persisted entries to free quota.",
                    )
                    .with_details(json!({ "probe": "storage", "key": key, "bytes": value.len() })),
                );
            }
        }
        issues
    }
}

/// Flags units that are offline or mid-recovery
#[derive(Debug, Default)]
pub struct RecoveryProbe;

impl EnvironmentProbe for RecoveryProbe {
    fn name(&self) -> &str {
        "recovery"
    }

    fn probe(&self, state: &ApplicationHealthState) -> Vec<DiagnosticResult> {
        let mut issues = Vec::new();
        for (unit, unit_state) in &state.unit_states {
            if unit_state.fallback_mode == FallbackMode::Offline {
                issues.push(
                    DiagnosticResult::new(
                        ErrorCategory::Render,
                        FailureKind::Render,
                        Severity::High,
                        format!("Unit '{unit}' is offline after {} errors", unit_state.error_count),
                        "Recovery is exhausted for this unit; reset it manually once the cause is fixed.",
                    )
                    .with_details(json!({ "probe": "recovery", "unit": unit })),
                );
            } else if unit_state.is_recovering {
                issues.push(
                    DiagnosticResult::new(
                        ErrorCategory::Render,
                        FailureKind::Render,
                        Severity::Low,
                        format!("Unit '{unit}' is recovering"),
                        "Wait for the recovery attempt to finish.",
                    )
                    .with_details(json!({ "probe": "recovery", "unit": unit })),
                );
            }
        }
        issues
    }
}

fn health_from_issues(issues: &[DiagnosticResult]) -> SystemHealth {
    if issues.iter().any(|issue| issue.severity == Severity::Critical) {
        SystemHealth::Critical
    } else if issues.iter().any(|issue| issue.severity == Severity::High) {
        SystemHealth::Degraded
    } else {
        SystemHealth::Healthy
    }
}

/// Build a fresh report.
///
/// Unrecovered records come first in log order, then probe findings;
/// duplicates by `(category, message)` collapse to their first occurrence.
pub fn generate_report(state: &ApplicationHealthState, probes: &[Box<dyn EnvironmentProbe>]) -> DiagnosticReport {
    let mut seen = HashSet::new();
    let mut issues = Vec::new();

    let recorded = state.active_errors().map(|record| record.error.clone());
    let probed = probes.iter().flat_map(|probe| probe.probe(state));
    for issue in recorded.chain(probed) {
        let (category, message) = issue.dedup_key();
        if seen.insert((category, message.to_string())) {
            issues.push(issue);
        }
    }

    let overall_health = state.system_health.max(health_from_issues(&issues));

    let mut ranked: Vec<&DiagnosticResult> = issues.iter().collect();
    ranked.sort_by(|a, b| b.severity.cmp(&a.severity));
    let mut recommendations: Vec<String> = Vec::new();
    for issue in ranked {
        if !issue.suggested_remedy.is_empty() && !recommendations.contains(&issue.suggested_remedy) {
            recommendations.push(issue.suggested_remedy.clone());
        }
    }
    if state.fallback_mode > FallbackMode::None {
        recommendations.push(format!(
            "The application is running in {} mode; clear errors to restore full functionality.",
            state.fallback_mode
        ));
    }

    DiagnosticReport {
        id: Uuid::new_v4(),
        timestamp: Utc::now(),
        overall_health,
        issues,
        recommendations,
    }
}
