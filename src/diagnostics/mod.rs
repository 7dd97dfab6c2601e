pub mod classifier;
pub mod report;
pub mod types;

pub use classifier::{
    default_rules, is_api_contract_path, is_json_content_type, ClassificationRule, Classifier, ContentExpectation,
};
pub use report::{generate_report, EnvironmentProbe, RecoveryProbe, StorageProbe};
pub use types::{DiagnosticReport, DiagnosticResult, ErrorCategory, FailureKind, Severity, SystemHealth};
