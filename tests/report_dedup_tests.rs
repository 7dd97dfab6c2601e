//! Diagnostic report generation over recorded failures

mod fixtures;

use fixtures::{engine_with, ScriptedTransport, RECORDED_FAILURES};
use resilience_engine::{ErrorCategory, ResilienceEngine, Severity, SystemHealth};
use serde_json::Value;

fn replay(engine: &ResilienceEngine) {
    let entries: Vec<Value> = serde_json::from_str(RECORDED_FAILURES).unwrap();
    for entry in entries {
        let message = entry["message"].as_str().unwrap().to_string();
        let severity = entry
            .get("severity")
            .map(|value| serde_json::from_value::<Severity>(value.clone()).unwrap());
        match entry["unit"].as_str() {
            Some(unit) => {
                engine.report_unit_error(unit, message, severity);
            }
            None => {
                let category: ErrorCategory = serde_json::from_value(entry["category"].clone()).unwrap();
                engine.report_error(category, message, entry.get("details").cloned());
            }
        }
    }
}

#[test]
fn test_duplicate_failures_collapse_in_report_only() {
    let (engine, _storage) = engine_with(ScriptedTransport::offline());
    replay(&engine);

    let state = engine.store().snapshot();
    assert_eq!(state.global_errors.len(), 6);
    assert_eq!(engine.get_unit_state("checkout").error_count, 2);

    let report = engine.generate_report();
    assert_eq!(report.issues.len(), 5);
    let checkout_issues = report
        .issues
        .iter()
        .filter(|issue| issue.message.starts_with("Cannot read properties"))
        .count();
    assert_eq!(checkout_issues, 1);
}

#[test]
fn test_report_health_and_recommendations() {
    let (engine, _storage) = engine_with(ScriptedTransport::offline());
    replay(&engine);

    let report = engine.generate_report();
    assert_eq!(report.overall_health, SystemHealth::Critical);
    assert_eq!(engine.get_system_health(), SystemHealth::Critical);

    // Remedies are ordered by the severity of the issue they address
    let critical = report
        .issues
        .iter()
        .find(|issue| issue.severity == Severity::Critical)
        .unwrap();
    assert_eq!(report.recommendations[0], critical.suggested_remedy);
    let unique: std::collections::HashSet<_> = report.recommendations.iter().collect();
    assert_eq!(unique.len(), report.recommendations.len());
}

#[test]
fn test_free_form_reports_keep_category_and_floor() {
    let (engine, _storage) = engine_with(ScriptedTransport::offline());
    replay(&engine);

    let report = engine.generate_report();
    let network: Vec<_> = report.issues_by_category(ErrorCategory::Network).collect();
    assert_eq!(network.len(), 1);
    assert!(network[0].severity >= Severity::High);
    assert_eq!(network[0].details["url"], "/api/coupons");

    let data: Vec<_> = report.issues_by_category(ErrorCategory::Data).collect();
    assert_eq!(data.len(), 1);
    assert!(data[0].severity >= Severity::Medium);
}

#[test]
fn test_recovered_unit_leaves_report() {
    let (engine, _storage) = engine_with(ScriptedTransport::offline());
    replay(&engine);
    engine.mark_recovered("checkout");

    let report = engine.generate_report();
    assert_eq!(report.issues.len(), 4);
    assert!(report
        .issues
        .iter()
        .all(|issue| !issue.message.starts_with("Cannot read properties")));
    // The log still holds every occurrence
    assert_eq!(engine.store().snapshot().global_errors.len(), 6);
}
