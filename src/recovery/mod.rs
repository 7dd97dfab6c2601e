//! Recovery Strategy Engine.
//!
//! Selects at most one strategy per attempt (first applicable in priority
//! order), applies it and feeds the outcome back into the store. Progress
//! across attempts comes from the updated context, never from chaining.

pub mod builtin;
pub mod reload;
pub mod signals;
pub mod strategy;

pub use builtin::{builtin_strategies, BuiltinDeps};
pub use reload::ReloadScheduler;
pub use signals::{EngineSignal, SignalBus};
pub use strategy::{RecoveryContext, RecoveryResult, RecoveryStrategy};

use futures::FutureExt;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use crate::capture::hooks::panic_message;
use crate::diagnostics::DiagnosticResult;
use crate::observability::ResilienceMetrics;
use crate::store::{ErrorStore, UnitField};
use crate::telemetry::{create_recovery_span, generate_correlation_id};

const HISTORY_LIMIT: usize = 10;

type AttemptKey = (Option<String>, String);

/// Removes the attempt key when the attempt finishes, however it finishes
struct InFlight<'a> {
    set: &'a Mutex<HashSet<AttemptKey>>,
    key: AttemptKey,
}

impl<'a> InFlight<'a> {
    fn acquire(set: &'a Mutex<HashSet<AttemptKey>>, key: AttemptKey) -> Option<Self> {
        let mut guard = set.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if !guard.insert(key.clone()) {
            return None;
        }
        Some(Self { set, key })
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&self.key);
    }
}

/// Raises the recovering flag for the attempt and lowers it on drop, so a
/// cancelled or panicking attempt never leaves the unit stuck
struct Recovering<'a> {
    store: &'a ErrorStore,
    unit: Option<&'a str>,
}

impl<'a> Recovering<'a> {
    fn start(store: &'a ErrorStore, unit: Option<&'a str>) -> Self {
        store.set_recovering(unit, true);
        Self { store, unit }
    }
}

impl Drop for Recovering<'_> {
    fn drop(&mut self) {
        self.store.set_recovering(self.unit, false);
    }
}

/// Host environment reported to strategies
#[derive(Debug, Clone)]
pub struct EnvironmentInfo {
    pub user_agent: String,
    pub session_id: String,
}

impl Default for EnvironmentInfo {
    fn default() -> Self {
        let host = hostname::get()
            .ok()
            .and_then(|name| name.into_string().ok())
            .unwrap_or_else(|| "unknown-host".to_string());
        Self {
            user_agent: format!("resilience-engine/{} ({host})", env!("CARGO_PKG_VERSION")),
            session_id: Uuid::new_v4().to_string(),
        }
    }
}

pub struct RecoveryEngine {
    strategies: RwLock<Vec<Arc<dyn RecoveryStrategy>>>,
    store: ErrorStore,
    metrics: Arc<ResilienceMetrics>,
    in_flight: Mutex<HashSet<AttemptKey>>,
    max_retries: u32,
    environment: EnvironmentInfo,
}

impl std::fmt::Debug for RecoveryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryEngine")
            .field("strategies", &self.strategy_ids())
            .field("max_retries", &self.max_retries)
            .finish_non_exhaustive()
    }
}

impl RecoveryEngine {
    pub fn new(store: ErrorStore, metrics: Arc<ResilienceMetrics>, max_retries: u32) -> Self {
        Self {
            strategies: RwLock::new(Vec::new()),
            store,
            metrics,
            in_flight: Mutex::new(HashSet::new()),
            max_retries,
            environment: EnvironmentInfo::default(),
        }
    }

    /// Add a strategy; the registry stays sorted by priority, ties keep
    /// registration order
    pub fn register(&self, strategy: Arc<dyn RecoveryStrategy>) {
        debug!(strategy_id = strategy.id(), priority = strategy.priority(), "Registering recovery strategy");
        let mut strategies = self.strategies.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        strategies.push(strategy);
        strategies.sort_by_key(|strategy| strategy.priority());
    }

    pub fn register_all(&self, strategies: impl IntoIterator<Item = Arc<dyn RecoveryStrategy>>) {
        for strategy in strategies {
            self.register(strategy);
        }
    }

    pub fn strategy_ids(&self) -> Vec<String> {
        self.strategies
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .map(|strategy| strategy.id().to_string())
            .collect()
    }

    /// Whether an attempt for this `(unit, message)` is running
    pub fn is_in_flight(&self, unit: Option<&str>, message: &str) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(&(unit.map(str::to_string), message.to_string()))
    }

    /// Snapshot the store into a strategy context
    pub fn build_context(&self, unit: Option<&str>, error: &DiagnosticResult) -> RecoveryContext {
        let state = self.store.snapshot();
        let unit_state = unit.and_then(|unit| state.unit(unit)).cloned().unwrap_or_default();
        let mut history: Vec<DiagnosticResult> = match unit {
            Some(unit) => state.unit_errors(unit).map(|record| record.error.clone()).collect(),
            None => state.active_errors().map(|record| record.error.clone()).collect(),
        };
        if history.len() > HISTORY_LIMIT {
            history.drain(..history.len() - HISTORY_LIMIT);
        }

        RecoveryContext {
            unit_name: unit.map(str::to_string),
            error_count: unit_state.error_count,
            error_history: history,
            retry_attempts: unit_state.retry_count,
            max_retries: self.max_retries,
            user_agent: self.environment.user_agent.clone(),
            url: error.details.get("url").and_then(|url| url.as_str()).map(str::to_string),
            session_id: self.environment.session_id.clone(),
            fallback_mode: match unit {
                Some(_) => unit_state.fallback_mode,
                None => state.fallback_mode,
            },
            applied_strategies: unit_state.applied_strategies,
        }
    }

    /// Attempt one recovery pass. Never fails; problems come back as
    /// `success: false`.
    pub async fn attempt_recovery(&self, unit: Option<&str>, error: &DiagnosticResult) -> RecoveryResult {
        let key = (unit.map(str::to_string), error.message.clone());
        let Some(_in_flight) = InFlight::acquire(&self.in_flight, key) else {
            self.metrics.record_recovery_rejected();
            debug!(unit, message = %error.message, "Recovery already in flight; rejecting duplicate");
            return RecoveryResult::failed(None, "Recovery already in progress for this failure");
        };

        if error.details.get("recoverable").and_then(|value| value.as_bool()) == Some(false) {
            info!(unit, message = %error.message, "Failure is terminal; no automatic recovery");
            return RecoveryResult::failed(None, "Failure is not recoverable automatically");
        }

        let correlation_id = generate_correlation_id();
        let span = create_recovery_span(unit, None, &correlation_id);
        self.run_attempt(unit, error).instrument(span).await
    }

    async fn run_attempt(&self, unit: Option<&str>, error: &DiagnosticResult) -> RecoveryResult {
        self.metrics.record_recovery_attempt();
        let recovering = Recovering::start(&self.store, unit);

        let context = self.build_context(unit, error);
        let selected = std::panic::catch_unwind(AssertUnwindSafe(|| {
            let strategies = self.strategies.read().unwrap_or_else(|poisoned| poisoned.into_inner());
            strategies
                .iter()
                .find(|strategy| strategy.can_apply(error, &context))
                .cloned()
        }));

        let result = match selected {
            Err(payload) => {
                let reason = panic_message(payload.as_ref());
                error!(reason = %reason, "Recovery strategy selection panicked");
                RecoveryResult::failed(None, format!("Strategy selection panicked: {reason}"))
            }
            Ok(Some(strategy)) => {
                info!(
                    strategy_id = strategy.id(),
                    strategy = strategy.name(),
                    error_count = context.error_count,
                    retry_attempts = context.retry_attempts,
                    "Applying recovery strategy"
                );
                match AssertUnwindSafe(strategy.apply(error, &context)).catch_unwind().await {
                    Ok(Ok(result)) => result,
                    Ok(Err(e)) => {
                        warn!(strategy_id = strategy.id(), error = %e, "Recovery strategy failed; rolling back");
                        self.roll_back(strategy.as_ref(), &context).await;
                        RecoveryResult::failed(Some(strategy.id()), e.to_string())
                    }
                    Err(payload) => {
                        let reason = panic_message(payload.as_ref());
                        error!(strategy_id = strategy.id(), reason = %reason, "Recovery strategy panicked; rolling back");
                        self.roll_back(strategy.as_ref(), &context).await;
                        RecoveryResult::failed(Some(strategy.id()), format!("Strategy panicked: {reason}"))
                    }
                }
            }
            Ok(None) if context.retries_exhausted() => {
                warn!(
                    retry_attempts = context.retry_attempts,
                    max_retries = context.max_retries,
                    "Recovery budget exhausted; manual reset required"
                );
                RecoveryResult::failed(None, "Recovery exhausted; reset the unit manually")
            }
            Ok(None) => {
                debug!(error_count = context.error_count, "No applicable recovery strategy");
                RecoveryResult::failed(None, "No applicable recovery strategy")
            }
        };

        self.feed_back(unit, &result);
        drop(recovering);
        if result.success {
            self.metrics.record_recovery_success();
        }
        info!(
            success = result.success,
            strategy_id = ?result.strategy_id,
            should_retry = result.should_retry,
            fallback_mode = ?result.fallback_mode,
            message = %result.message,
            "Recovery attempt finished"
        );
        result
    }

    async fn roll_back(&self, strategy: &dyn RecoveryStrategy, context: &RecoveryContext) {
        match AssertUnwindSafe(strategy.rollback(context)).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(strategy_id = strategy.id(), error = %e, "Rollback failed"),
            Err(_) => error!(strategy_id = strategy.id(), "Rollback panicked"),
        }
    }

    fn feed_back(&self, unit: Option<&str>, result: &RecoveryResult) {
        if let Some(unit) = unit {
            self.store.set_unit_field(unit, UnitField::IncrementRetry);
            if let (true, Some(strategy_id)) = (result.success, &result.strategy_id) {
                self.store
                    .set_unit_field(unit, UnitField::AppliedStrategy(strategy_id.clone()));
            }
        }
        if let (true, Some(mode)) = (result.success, result.fallback_mode) {
            self.store.set_fallback_mode(unit, mode);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::{ErrorCategory, FailureKind, Severity};
    use crate::error::EngineError;
    use crate::store::FallbackMode;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    struct Counting {
        id: &'static str,
        priority: u32,
        fails: bool,
        applied: AtomicU32,
        rolled_back: AtomicU32,
    }

    impl Counting {
        fn new(id: &'static str, priority: u32) -> Arc<Self> {
            Self::build(id, priority, false)
        }

        fn failing(id: &'static str, priority: u32) -> Arc<Self> {
            Self::build(id, priority, true)
        }

        fn build(id: &'static str, priority: u32, fails: bool) -> Arc<Self> {
            Arc::new(Self {
                id,
                priority,
                fails,
                applied: AtomicU32::new(0),
                rolled_back: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl RecoveryStrategy for Counting {
        fn id(&self) -> &str {
            self.id
        }

        fn name(&self) -> &str {
            self.id
        }

        fn priority(&self) -> u32 {
            self.priority
        }

        fn can_apply(&self, _error: &DiagnosticResult, _context: &RecoveryContext) -> bool {
            true
        }

        async fn apply(&self, _error: &DiagnosticResult, _context: &RecoveryContext) -> Result<RecoveryResult, EngineError> {
            self.applied.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            if self.fails {
                return Err(EngineError::strategy(self.id, "boom"));
            }
            Ok(RecoveryResult::succeeded(self.id, "ok").with_fallback(FallbackMode::Static))
        }

        async fn rollback(&self, _context: &RecoveryContext) -> Result<(), EngineError> {
            self.rolled_back.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Panicking;

    #[async_trait]
    impl RecoveryStrategy for Panicking {
        fn id(&self) -> &str {
            "panicking"
        }

        fn name(&self) -> &str {
            "Panicking"
        }

        fn priority(&self) -> u32 {
            0
        }

        fn can_apply(&self, _error: &DiagnosticResult, _context: &RecoveryContext) -> bool {
            true
        }

        async fn apply(&self, _error: &DiagnosticResult, _context: &RecoveryContext) -> Result<RecoveryResult, EngineError> {
            tokio::time::sleep(Duration::from_millis(10)).await;
            panic!("strategy state corrupted");
        }
    }

    fn failure(message: &str) -> DiagnosticResult {
        DiagnosticResult::new(ErrorCategory::Render, FailureKind::Render, Severity::High, message, "")
    }

    fn engine() -> RecoveryEngine {
        RecoveryEngine::new(ErrorStore::default(), Arc::new(ResilienceMetrics::default()), 3)
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_applicable_by_priority_wins() {
        let engine = engine();
        let late = Counting::new("late", 50);
        let early = Counting::new("early", 5);
        engine.register(late.clone());
        engine.register(early.clone());
        assert_eq!(engine.strategy_ids(), vec!["early", "late"]);

        let result = engine.attempt_recovery(Some("pricing"), &failure("chart failed")).await;
        assert!(result.success);
        assert_eq!(result.strategy_id.as_deref(), Some("early"));
        assert_eq!(early.applied.load(Ordering::SeqCst), 1);
        assert_eq!(late.applied.load(Ordering::SeqCst), 0);

        let unit = engine.store.get_unit_state("pricing");
        assert_eq!(unit.retry_count, 1);
        assert_eq!(unit.fallback_mode, FallbackMode::Static);
        assert!(unit.has_applied("early"));
        assert!(!unit.is_recovering);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_strategy_rolls_back_and_does_not_chain() {
        let engine = engine();
        let failing = Counting::failing("failing", 1);
        let next = Counting::new("next", 2);
        engine.register(failing.clone());
        engine.register(next.clone());

        let result = engine.attempt_recovery(Some("upload"), &failure("upload broke")).await;
        assert!(!result.success);
        assert_eq!(result.strategy_id.as_deref(), Some("failing"));
        assert_eq!(failing.rolled_back.load(Ordering::SeqCst), 1);
        assert_eq!(next.applied.load(Ordering::SeqCst), 0);
        assert_eq!(engine.metrics.get_stats().recoveries_succeeded, 0);
        assert!(!engine.store.get_unit_state("upload").is_recovering);
        assert!(!engine.store.snapshot().is_recovering);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_strategy_fails_the_attempt_and_clears_recovering() {
        let engine = engine();
        let fallback = Counting::new("fallback", 10);
        engine.register(Arc::new(Panicking));
        engine.register(fallback.clone());

        let result = engine.attempt_recovery(Some("search"), &failure("index missing")).await;
        assert!(!result.success);
        assert_eq!(result.strategy_id.as_deref(), Some("panicking"));
        assert!(result.message.contains("strategy state corrupted"));
        assert_eq!(fallback.applied.load(Ordering::SeqCst), 0);

        let unit = engine.store.get_unit_state("search");
        assert!(!unit.is_recovering);
        assert_eq!(unit.retry_count, 1);
        assert!(!engine.store.snapshot().is_recovering);
        assert!(!engine.is_in_flight(Some("search"), "index missing"));

        // A later attempt for the same failure is not rejected as a duplicate
        let retried = engine.attempt_recovery(Some("search"), &failure("index missing")).await;
        assert_eq!(retried.strategy_id.as_deref(), Some("panicking"));
        assert_eq!(engine.metrics.get_stats().recoveries_rejected, 0);
        assert_eq!(engine.store.get_unit_state("search").retry_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_attempts_on_one_unit_keep_recovering_until_both_finish() {
        let engine = engine();
        engine.register(Counting::new("slow", 1));
        let store = engine.store.clone();

        let first = failure("chart failed");
        let second = failure("legend failed");
        let watcher = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            assert!(store.get_unit_state("report").is_recovering);
        };
        let (a, b, ()) = tokio::join!(
            engine.attempt_recovery(Some("report"), &first),
            engine.attempt_recovery(Some("report"), &second),
            watcher,
        );

        assert!(a.success && b.success);
        let unit = store.get_unit_state("report");
        assert!(!unit.is_recovering);
        assert_eq!(unit.active_recoveries, 0);
        assert!(!store.snapshot().is_recovering);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_concurrent_attempt_is_rejected() {
        let engine = engine();
        let strategy = Counting::new("slow", 1);
        engine.register(strategy.clone());

        let error = failure("storage quota exceeded");
        let (first, second) = tokio::join!(
            engine.attempt_recovery(Some("coupons"), &error),
            engine.attempt_recovery(Some("coupons"), &error),
        );

        assert!(first.success);
        assert!(!second.success);
        assert_eq!(second.strategy_id, None);
        assert_eq!(strategy.applied.load(Ordering::SeqCst), 1);
        assert_eq!(engine.metrics.get_stats().recoveries_rejected, 1);
        assert!(!engine.is_in_flight(Some("coupons"), "storage quota exceeded"));
    }

    #[tokio::test]
    async fn test_terminal_failures_are_not_recovered() {
        let engine = engine();
        let strategy = Counting::new("any", 1);
        engine.register(strategy.clone());

        let rejected = failure("Authentication rejected with HTTP 401")
            .with_details(serde_json::json!({ "recoverable": false }));
        let result = engine.attempt_recovery(Some("auth"), &rejected).await;
        assert!(!result.success);
        assert_eq!(strategy.applied.load(Ordering::SeqCst), 0);
        assert_eq!(engine.store.get_unit_state("auth").retry_count, 0);
    }

    #[tokio::test]
    async fn test_no_applicable_strategy_still_counts_the_attempt() {
        let engine = engine();
        let result = engine.attempt_recovery(Some("voice"), &failure("mic lost")).await;
        assert!(!result.success);
        assert_eq!(engine.store.get_unit_state("voice").retry_count, 1);
    }
}
