//! Failure classification: turns normalized captures into [`DiagnosticResult`]s.
//!
//! Pure functions over an ordered rule table, no store or I/O access, so the
//! heuristics can be tested without the capture plumbing.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::LazyLock;

use super::types::{DiagnosticResult, ErrorCategory, FailureKind, Severity};
use crate::capture::{CaptureEvent, ConsoleLevel};
use crate::error::TransportError;

static API_PATH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(^|/)(api|graphql|rpc)(/|$|\?)|\.json($|\?)").expect("API path pattern is valid")
});

/// Content a caller expects back from an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentExpectation {
    /// Structured data; anything else is a contract violation
    Json,
    Html,
    Text,
    #[default]
    Any,
}

impl ContentExpectation {
    /// Expectation implied by a URL: API-looking paths must return JSON
    pub fn for_url(url: &str) -> Self {
        if is_api_contract_path(url) {
            ContentExpectation::Json
        } else {
            ContentExpectation::Any
        }
    }

    /// Whether a declared content type contradicts this expectation.
    /// A missing content type never contradicts.
    pub fn is_violated_by(&self, content_type: Option<&str>) -> bool {
        let Some(content_type) = content_type else {
            return false;
        };
        let lower = content_type.to_ascii_lowercase();
        match self {
            ContentExpectation::Json => !is_json_content_type(&lower),
            ContentExpectation::Html => !lower.contains("html"),
            ContentExpectation::Text => !lower.starts_with("text/"),
            ContentExpectation::Any => false,
        }
    }
}

pub fn is_api_contract_path(url: &str) -> bool {
    let path = url
        .split_once("://")
        .map(|(_, rest)| rest.find('/').map(|i| &rest[i..]).unwrap_or("/"))
        .unwrap_or(url);
    API_PATH.is_match(path)
}

pub fn is_json_content_type(content_type: &str) -> bool {
    let lower = content_type.to_ascii_lowercase();
    let mime = lower.split(';').next().unwrap_or("").trim();
    mime == "application/json" || mime == "text/json" || mime.ends_with("+json")
}

/// One entry of the text classification table
#[derive(Debug, Clone)]
pub struct ClassificationRule {
    pub name: String,
    pub patterns: Vec<String>,
    pub category: ErrorCategory,
    pub kind: FailureKind,
    pub severity: Severity,
    pub remedy: String,
}

impl ClassificationRule {
    pub fn new(
        name: &str,
        patterns: &[&str],
        category: ErrorCategory,
        kind: FailureKind,
        severity: Severity,
        remedy: &str,
    ) -> Self {
        Self {
            name: name.to_string(),
            patterns: patterns.iter().map(|p| p.to_ascii_lowercase()).collect(),
            category,
            kind,
            severity,
            remedy: remedy.to_string(),
        }
    }

    fn matches(&self, lower: &str) -> bool {
        self.patterns.iter().any(|p| lower.contains(p.as_str()))
    }
}

/// Built-in rules, evaluated top to bottom; first match wins
pub fn default_rules() -> Vec<ClassificationRule> {
    use ErrorCategory as C;
    use FailureKind as K;
    use Severity as S;

    vec![
        ClassificationRule::new(
            "json-parse",
            &["in json", "json.parse", "json at position", "expected value at line", "invalid json"],
            C::Data,
            K::Parse,
            S::High,
            "A response body was not valid JSON. The endpoint is probably returning an error page; check the backend routing.",
        ),
        ClassificationRule::new(
            "syntax",
            &["syntaxerror", "syntax error", "unexpected token", "unexpected end of input", "invalid or unexpected token"],
            C::Script,
            K::Syntax,
            S::Critical,
            "A script failed to parse. Rebuild and redeploy the affected bundle.",
        ),
        ClassificationRule::new(
            "reference",
            &["is not defined", "referenceerror", "cannot find value", "unresolved reference"],
            C::Script,
            K::Reference,
            S::Critical,
            "Code referenced a name that does not exist. Check for a missing import or a stale bundle.",
        ),
        ClassificationRule::new(
            "null-access",
            &[
                "cannot read propert",
                "cannot set propert",
                "of undefined",
                "of null",
                "null pointer",
                "on a `none` value",
                "on an `err` value",
            ],
            C::Script,
            K::Type,
            S::Critical,
            "A value was missing where one was required. Guard the access or provide a default.",
        ),
        ClassificationRule::new(
            "type",
            &["typeerror", "is not a function", "is not iterable", "mismatched types", "invalid type"],
            C::Script,
            K::Type,
            S::High,
            "A value had an unexpected type. Validate inputs at the boundary.",
        ),
        ClassificationRule::new(
            "cors",
            &["cors", "cross-origin", "access-control-allow-origin"],
            C::Network,
            K::Cors,
            S::High,
            "The request was blocked by cross-origin policy. Configure the server's allowed origins.",
        ),
        ClassificationRule::new(
            "timeout",
            &["timed out", "timeout", "deadline has elapsed"],
            C::Network,
            K::Timeout,
            S::High,
            "The request took too long. Check connectivity or raise the timeout.",
        ),
        ClassificationRule::new(
            "network",
            &[
                "failed to fetch",
                "networkerror",
                "network error",
                "connection refused",
                "econnrefused",
                "connection reset",
                "load failed",
                "dns error",
            ],
            C::Network,
            K::Network,
            S::High,
            "The network request failed. Check connectivity and that the service is reachable.",
        ),
        ClassificationRule::new(
            "auth",
            &[
                "unauthorized",
                "unauthenticated",
                "not authenticated",
                "authentication",
                "session expired",
                "invalid token",
                "jwt",
                "forbidden",
            ],
            C::Auth,
            K::Token,
            S::High,
            "Authentication failed. Sign in again; if it persists, clear the stored session.",
        ),
        ClassificationRule::new(
            "storage",
            &["quota", "localstorage", "storage"],
            C::Data,
            K::Storage,
            S::Medium,
            "Persisted storage is full or corrupted. Clearing the stored entries usually resolves this.",
        ),
        ClassificationRule::new(
            "data",
            &["invalid data", "validation failed", "missing field", "unexpected shape", "malformed"],
            C::Data,
            K::Validation,
            S::Medium,
            "Received data failed validation. Check the producing service's payload.",
        ),
        ClassificationRule::new(
            "render",
            &["render", "hydration", "component", "view failed"],
            C::Render,
            K::Render,
            S::High,
            "A UI region failed to render. It will fall back to a simplified view.",
        ),
    ]
}

const UNKNOWN_REMEDY: &str = "Unexpected failure. If it keeps happening, reload the application.";

/// Stateless failure classifier
#[derive(Debug, Clone)]
pub struct Classifier {
    rules: Vec<ClassificationRule>,
}

impl Default for Classifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Classifier {
    pub fn new() -> Self {
        Self {
            rules: default_rules(),
        }
    }

    /// Add a rule evaluated before the built-in ones
    pub fn with_rule(mut self, rule: ClassificationRule) -> Self {
        self.rules.insert(0, rule);
        self
    }

    pub fn rules(&self) -> &[ClassificationRule] {
        &self.rules
    }

    fn match_text(&self, text: &str) -> Option<&ClassificationRule> {
        let lower = text.to_lowercase();
        self.rules.iter().find(|rule| rule.matches(&lower))
    }

    /// Classify free text. Unmatched text gets `fallback_category` with
    /// severity `low` for warnings and informational messages, `medium` otherwise.
    pub fn classify_text(
        &self,
        text: &str,
        level: ConsoleLevel,
        fallback_category: ErrorCategory,
    ) -> DiagnosticResult {
        match self.match_text(text) {
            Some(rule) => DiagnosticResult::new(
                rule.category,
                rule.kind,
                rule.severity,
                text,
                rule.remedy.clone(),
            )
            .with_details(json!({ "rule": rule.name, "level": level.as_str() })),
            None => {
                let severity = match level {
                    ConsoleLevel::Warn | ConsoleLevel::Info => Severity::Low,
                    ConsoleLevel::Error => Severity::Medium,
                };
                DiagnosticResult::new(fallback_category, FailureKind::Unknown, severity, text, UNKNOWN_REMEDY)
                    .with_details(json!({ "level": level.as_str() }))
            }
        }
    }

    /// Classify an HTTP exchange that completed at the transport level.
    /// Returns `None` when the exchange is healthy.
    pub fn classify_http(
        &self,
        url: &str,
        status: u16,
        content_type: Option<&str>,
        expectation: ContentExpectation,
    ) -> Option<DiagnosticResult> {
        let details = json!({ "url": url, "status": status, "content_type": content_type });

        if expectation.is_violated_by(content_type) {
            return Some(
                DiagnosticResult::new(
                    ErrorCategory::Api,
                    FailureKind::Format,
                    Severity::High,
                    format!(
                        "Endpoint {url} returned '{}' instead of {}",
                        content_type.unwrap_or("unknown"),
                        expectation_label(expectation)
                    ),
                    "The API route is serving the wrong content (often an HTML fallback page). Check the backend routing and proxy configuration.",
                )
                .with_details(details),
            );
        }

        let (category, kind, severity, remedy) = match status {
            200..=399 => return None,
            500..=599 => (
                ErrorCategory::Api,
                FailureKind::ServerError,
                Severity::Critical,
                "The server failed to handle the request. Retry later or check the service status.",
            ),
            401 => (
                ErrorCategory::Network,
                FailureKind::Token,
                Severity::High,
                "The session is missing or expired. Sign in again.",
            ),
            403 => (
                ErrorCategory::Network,
                FailureKind::Forbidden,
                Severity::High,
                "Access was denied. Check that the account has permission for this resource.",
            ),
            404 => (
                ErrorCategory::Network,
                FailureKind::NotFound,
                Severity::High,
                "The endpoint does not exist. Check the URL and that the backend is deployed.",
            ),
            _ => (
                ErrorCategory::Network,
                FailureKind::ClientError,
                Severity::Medium,
                "The request was rejected. Check the request parameters.",
            ),
        };

        Some(
            DiagnosticResult::new(category, kind, severity, format!("HTTP {status} from {url}"), remedy)
                .with_details(details),
        )
    }

    pub fn classify_transport(&self, url: &str, error: &TransportError) -> DiagnosticResult {
        let (kind, remedy) = match error {
            TransportError::Timeout { .. } => (
                FailureKind::Timeout,
                "The request timed out. Check connectivity or raise the timeout.",
            ),
            TransportError::Aborted(_) => (
                FailureKind::Aborted,
                "The request was aborted before completing. Retry the operation.",
            ),
            TransportError::ConnectionRefused(_) => (
                FailureKind::ConnectionRefused,
                "The service refused the connection. Check that it is running and reachable.",
            ),
            TransportError::Other(_) => (
                FailureKind::Network,
                "The network request failed. Check connectivity.",
            ),
        };
        DiagnosticResult::new(
            ErrorCategory::Network,
            kind,
            Severity::High,
            format!("Request to {url} failed: {error}"),
            remedy,
        )
        .with_details(json!({ "url": url }))
    }

    /// Terminal authentication rejection (bad credentials); never auto-retried
    pub fn classify_auth_rejection(&self, url: &str, status: u16) -> DiagnosticResult {
        let (kind, remedy) = if status == 403 {
            (FailureKind::Forbidden, "The account is not allowed to sign in here.")
        } else {
            (FailureKind::Token, "The credentials were rejected. Check them and sign in again.")
        };
        DiagnosticResult::new(
            ErrorCategory::Auth,
            kind,
            Severity::High,
            format!("Authentication rejected with HTTP {status}"),
            remedy,
        )
        .with_details(json!({ "url": url, "status": status, "recoverable": false }))
    }

    /// Classify any normalized capture event
    pub fn classify(&self, event: &CaptureEvent) -> DiagnosticResult {
        match event {
            CaptureEvent::Exception {
                message,
                filename,
                lineno,
                stack,
            } => {
                let mut result = self.classify_text(message, ConsoleLevel::Error, ErrorCategory::Script);
                result.details = json!({ "filename": filename, "lineno": lineno, "source": "exception" });
                if let Some(stack) = stack {
                    result = result.with_stack_trace(stack.clone());
                }
                result
            }
            CaptureEvent::Panic { message, location } => {
                let mut result = self.classify_text(message, ConsoleLevel::Error, ErrorCategory::Script);
                if result.kind == FailureKind::Unknown {
                    result.kind = FailureKind::Panic;
                }
                result.details = json!({ "location": location, "source": "panic" });
                result.with_severity_floor(Severity::Critical)
            }
            CaptureEvent::Rejection { unit, reason } => {
                let mut result = self.classify_text(reason, ConsoleLevel::Error, ErrorCategory::Script);
                if result.kind == FailureKind::Unknown {
                    result.kind = FailureKind::Rejection;
                }
                result.details = json!({ "unit": unit, "source": "rejection" });
                result.with_severity_floor(Severity::High)
            }
            CaptureEvent::Console { level, message } => {
                self.classify_text(message, *level, ErrorCategory::Script)
            }
            CaptureEvent::HttpResponse {
                url,
                status,
                content_type,
                expectation,
            } => self
                .classify_http(url, *status, content_type.as_deref(), *expectation)
                .unwrap_or_else(|| {
                    DiagnosticResult::new(
                        ErrorCategory::Api,
                        FailureKind::Unknown,
                        Severity::Low,
                        format!("HTTP {status} from {url}"),
                        "No action needed.",
                    )
                }),
            CaptureEvent::Transport { url, error } => self.classify_transport(url, error),
            CaptureEvent::Reported {
                category,
                message,
                details,
            } => {
                let matched = self.classify_text(message, ConsoleLevel::Error, *category);
                let mut result = DiagnosticResult::new(
                    *category,
                    matched.kind,
                    matched.severity,
                    message.clone(),
                    matched.suggested_remedy,
                );
                if matched.category != *category {
                    result.severity = category.severity_floor();
                }
                result
                    .with_severity_floor(category.severity_floor())
                    .with_details(details.clone().unwrap_or(serde_json::Value::Null))
            }
            CaptureEvent::UnitError { unit, message, severity } => {
                let mut result = self.classify_text(message, ConsoleLevel::Error, ErrorCategory::Render);
                if result.kind == FailureKind::Unknown {
                    result.kind = FailureKind::Render;
                    result.severity = ErrorCategory::Render.severity_floor();
                }
                if let Some(severity) = severity {
                    result.severity = *severity;
                }
                result.details = json!({ "unit": unit, "source": "unit" });
                result
            }
        }
    }
}

fn expectation_label(expectation: ContentExpectation) -> &'static str {
    match expectation {
        ContentExpectation::Json => "JSON",
        ContentExpectation::Html => "HTML",
        ContentExpectation::Text => "text",
        ContentExpectation::Any => "any content",
    }
}
