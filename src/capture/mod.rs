//! Failure Capture Layer.
//!
//! Normalizes every failure source (panics, failed supervised tasks, console
//! messages, HTTP exchanges) into a [`CaptureEvent`], classifies it and
//! records it in the store. Capture never panics into the caller: every path
//! runs under `catch_unwind` and a re-entrancy guard, and a failure inside the
//! instrumentation degrades to a best-effort line on stderr.

pub mod console;
pub mod hooks;
pub mod network;

pub use console::{Console, ConsoleLevel};
pub use network::InstrumentedTransport;

use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::diagnostics::{Classifier, ContentExpectation, DiagnosticResult, ErrorCategory, Severity};
use crate::error::TransportError;
use crate::observability::ResilienceMetrics;
use crate::store::{ErrorRecord, ErrorStore};

/// The single normalized shape every failure source is turned into
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum CaptureEvent {
    Exception {
        message: String,
        filename: Option<String>,
        lineno: Option<u32>,
        stack: Option<String>,
    },
    Panic {
        message: String,
        location: Option<String>,
    },
    Rejection {
        unit: Option<String>,
        reason: String,
    },
    Console {
        level: ConsoleLevel,
        message: String,
    },
    HttpResponse {
        url: String,
        status: u16,
        content_type: Option<String>,
        expectation: ContentExpectation,
    },
    Transport {
        url: String,
        error: TransportError,
    },
    Reported {
        category: ErrorCategory,
        message: String,
        details: Option<serde_json::Value>,
    },
    UnitError {
        unit: String,
        message: String,
        severity: Option<Severity>,
    },
}

impl CaptureEvent {
    pub fn source(&self) -> &'static str {
        match self {
            CaptureEvent::Exception { .. } => "exception",
            CaptureEvent::Panic { .. } => "panic",
            CaptureEvent::Rejection { .. } => "rejection",
            CaptureEvent::Console { .. } => "console",
            CaptureEvent::HttpResponse { .. } => "http",
            CaptureEvent::Transport { .. } => "transport",
            CaptureEvent::Reported { .. } => "reported",
            CaptureEvent::UnitError { .. } => "unit",
        }
    }
}

thread_local! {
    static IN_CAPTURE: Cell<bool> = const { Cell::new(false) };
}

struct ReentrancyGuard;

impl ReentrancyGuard {
    fn acquire() -> Option<Self> {
        if IN_CAPTURE.with(|flag| flag.replace(true)) {
            None
        } else {
            Some(ReentrancyGuard)
        }
    }
}

impl Drop for ReentrancyGuard {
    fn drop(&mut self) {
        IN_CAPTURE.with(|flag| flag.set(false));
    }
}

/// Entry point for all failure sources; cheap to clone
#[derive(Clone)]
pub struct CaptureLayer {
    classifier: Arc<Classifier>,
    store: ErrorStore,
    metrics: Arc<ResilienceMetrics>,
    enabled: Arc<AtomicBool>,
    hook_installed: Arc<AtomicBool>,
}

impl std::fmt::Debug for CaptureLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureLayer")
            .field("enabled", &self.is_enabled())
            .field("hook_installed", &self.hook_installed.load(Ordering::Relaxed))
            .finish()
    }
}

impl CaptureLayer {
    pub fn new(classifier: Arc<Classifier>, store: ErrorStore, metrics: Arc<ResilienceMetrics>) -> Self {
        Self {
            classifier,
            store,
            metrics,
            enabled: Arc::new(AtomicBool::new(true)),
            hook_installed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn store(&self) -> &ErrorStore {
        &self.store
    }

    pub fn classifier(&self) -> &Classifier {
        &self.classifier
    }

    pub fn metrics(&self) -> &ResilienceMetrics {
        &self.metrics
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Turn capture off; hooks stay installed but become no-ops
    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Release);
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Release);
    }

    /// Classify and record one event. Returns `None` when capture is
    /// disabled, re-entered, or failed internally.
    pub fn capture(&self, unit: Option<&str>, event: CaptureEvent) -> Option<ErrorRecord> {
        let diagnostic = self.guarded(|layer| layer.classifier.classify(&event))?;
        self.record(unit, diagnostic, event.source())
    }

    /// Record an already-classified diagnostic through the same guarded path
    pub fn record(&self, unit: Option<&str>, diagnostic: DiagnosticResult, source: &str) -> Option<ErrorRecord> {
        let source = source.to_string();
        self.guarded(move |layer| {
            match diagnostic.severity {
                Severity::Critical | Severity::High => warn!(
                    unit = unit,
                    source = %source,
                    category = %diagnostic.category,
                    kind = %diagnostic.kind,
                    severity = %diagnostic.severity,
                    message = %diagnostic.message,
                    "Failure captured"
                ),
                _ => debug!(
                    unit = unit,
                    source = %source,
                    category = %diagnostic.category,
                    severity = %diagnostic.severity,
                    message = %diagnostic.message,
                    "Failure captured"
                ),
            }
            layer.metrics.record_capture();
            layer.store.record_error(unit, diagnostic)
        })
    }

    fn guarded<R>(&self, f: impl FnOnce(&Self) -> R) -> Option<R> {
        if !self.is_enabled() {
            return None;
        }
        let _guard = ReentrancyGuard::acquire()?;
        match catch_unwind(AssertUnwindSafe(|| f(self))) {
            Ok(result) => Some(result),
            Err(_) => {
                eprintln!("[resilience-engine] failure capture crashed; event dropped");
                error!("Failure capture crashed; event dropped");
                None
            }
        }
    }

    pub fn capture_exception(
        &self,
        message: impl Into<String>,
        filename: Option<&str>,
        lineno: Option<u32>,
    ) -> Option<ErrorRecord> {
        self.capture(
            None,
            CaptureEvent::Exception {
                message: message.into(),
                filename: filename.map(str::to_string),
                lineno,
                stack: None,
            },
        )
    }

    pub fn capture_rejection(&self, unit: Option<&str>, reason: impl Into<String>) -> Option<ErrorRecord> {
        self.capture(
            unit,
            CaptureEvent::Rejection {
                unit: unit.map(str::to_string),
                reason: reason.into(),
            },
        )
    }

    /// Record a console line. Errors and warnings are always recorded;
    /// informational lines only when they match a classification rule.
    pub fn capture_console(&self, level: ConsoleLevel, message: impl Into<String>) -> Option<ErrorRecord> {
        let message = message.into();
        if level == ConsoleLevel::Info {
            let diagnostic = self.guarded(|layer| {
                layer
                    .classifier
                    .classify_text(&message, level, ErrorCategory::Script)
            })?;
            if diagnostic.kind == crate::diagnostics::FailureKind::Unknown {
                return None;
            }
            return self.record(None, diagnostic, "console");
        }
        self.capture(None, CaptureEvent::Console { level, message })
    }

    /// Inspect a completed exchange; healthy exchanges record nothing
    pub fn capture_http(
        &self,
        unit: Option<&str>,
        url: &str,
        status: u16,
        content_type: Option<&str>,
        expectation: ContentExpectation,
    ) -> Option<ErrorRecord> {
        let diagnostic = self
            .guarded(|layer| {
                layer
                    .classifier
                    .classify_http(url, status, content_type, expectation)
            })
            .flatten()?;
        self.record(unit, diagnostic, "http")
    }

    pub fn capture_transport(&self, unit: Option<&str>, url: &str, error: &TransportError) -> Option<ErrorRecord> {
        self.capture(
            unit,
            CaptureEvent::Transport {
                url: url.to_string(),
                error: error.clone(),
            },
        )
    }

    /// Free-form report from callers that are not unit-scoped
    pub fn report(
        &self,
        category: ErrorCategory,
        message: impl Into<String>,
        details: Option<serde_json::Value>,
    ) -> Option<ErrorRecord> {
        self.capture(
            None,
            CaptureEvent::Reported {
                category,
                message: message.into(),
                details,
            },
        )
    }

    /// Failure reported by a named unit
    pub fn report_unit_error(
        &self,
        unit: &str,
        message: impl Into<String>,
        severity: Option<Severity>,
    ) -> Option<ErrorRecord> {
        self.capture(
            Some(unit),
            CaptureEvent::UnitError {
                unit: unit.to_string(),
                message: message.into(),
                severity,
            },
        )
    }
}
