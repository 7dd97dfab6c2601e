use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Closed set of failure categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCategory {
    Auth,
    Api,
    Render,
    Network,
    Script,
    Data,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Auth => "auth",
            ErrorCategory::Api => "api",
            ErrorCategory::Render => "render",
            ErrorCategory::Network => "network",
            ErrorCategory::Script => "script",
            ErrorCategory::Data => "data",
        }
    }

    /// Lowest severity a failure of this category may carry
    pub fn severity_floor(&self) -> Severity {
        match self {
            ErrorCategory::Auth | ErrorCategory::Network | ErrorCategory::Render => Severity::High,
            ErrorCategory::Api | ErrorCategory::Script | ErrorCategory::Data => Severity::Medium,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Finer-grained failure kind within a category (`api`/`format`, `auth`/`token`, ...)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Syntax,
    Reference,
    Type,
    Network,
    Cors,
    Timeout,
    Aborted,
    ConnectionRefused,
    Token,
    Forbidden,
    NotFound,
    ClientError,
    ServerError,
    Format,
    Parse,
    Validation,
    Storage,
    Render,
    Rejection,
    Panic,
    Unknown,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Syntax => "syntax",
            FailureKind::Reference => "reference",
            FailureKind::Type => "type",
            FailureKind::Network => "network",
            FailureKind::Cors => "cors",
            FailureKind::Timeout => "timeout",
            FailureKind::Aborted => "aborted",
            FailureKind::ConnectionRefused => "connection_refused",
            FailureKind::Token => "token",
            FailureKind::Forbidden => "forbidden",
            FailureKind::NotFound => "not_found",
            FailureKind::ClientError => "client_error",
            FailureKind::ServerError => "server_error",
            FailureKind::Format => "format",
            FailureKind::Parse => "parse",
            FailureKind::Validation => "validation",
            FailureKind::Storage => "storage",
            FailureKind::Render => "render",
            FailureKind::Rejection => "rejection",
            FailureKind::Panic => "panic",
            FailureKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered severity: `Low < Medium < High < Critical`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            other => Err(format!("unknown severity '{other}'")),
        }
    }
}

/// Whole-application health, derived from the failure log
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SystemHealth {
    #[default]
    Healthy,
    Degraded,
    Critical,
}

impl fmt::Display for SystemHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SystemHealth::Healthy => "healthy",
            SystemHealth::Degraded => "degraded",
            SystemHealth::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// One classified failure occurrence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticResult {
    pub category: ErrorCategory,
    pub kind: FailureKind,
    pub severity: Severity,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub suggested_remedy: String,
    pub details: serde_json::Value,
    pub stack_trace: Option<String>,
}

impl DiagnosticResult {
    pub fn new(
        category: ErrorCategory,
        kind: FailureKind,
        severity: Severity,
        message: impl Into<String>,
        suggested_remedy: impl Into<String>,
    ) -> Self {
        Self {
            category,
            kind,
            severity,
            message: message.into(),
            timestamp: Utc::now(),
            suggested_remedy: suggested_remedy.into(),
            details: serde_json::Value::Null,
            stack_trace: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }

    pub fn with_stack_trace(mut self, stack_trace: impl Into<String>) -> Self {
        self.stack_trace = Some(stack_trace.into());
        self
    }

    /// Raise severity to at least `floor`
    pub fn with_severity_floor(mut self, floor: Severity) -> Self {
        self.severity = self.severity.max(floor);
        self
    }

    /// Key used to collapse repeated occurrences in reports
    pub fn dedup_key(&self) -> (ErrorCategory, &str) {
        (self.category, self.message.as_str())
    }
}

/// Point-in-time rollup, built fresh on every request and never persisted
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticReport {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub overall_health: SystemHealth,
    pub issues: Vec<DiagnosticResult>,
    pub recommendations: Vec<String>,
}

impl DiagnosticReport {
    pub fn issues_by_category(&self, category: ErrorCategory) -> impl Iterator<Item = &DiagnosticResult> {
        self.issues.iter().filter(move |issue| issue.category == category)
    }
}
