//! Recovery engine behaviour through the engine context: strategy
//! progression, duplicate suppression, storage purging and delayed reloads.

mod fixtures;

use async_trait::async_trait;
use fixtures::{engine_with, test_config, ScriptedTransport};
use resilience_engine::recovery::builtin::{
    ESCALATE_OFFLINE, FULL_RELOAD, PURGE_CACHES, PURGE_STORAGE,
};
use resilience_engine::{
    DiagnosticResult, EngineError, EngineSignal, ErrorCategory, FailureKind, FallbackMode, MemoryStore,
    PersistentStore, RecoveryContext, RecoveryResult, RecoveryStrategy, ResilienceEngine, Severity,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

struct SlowStrategy {
    applied: AtomicU32,
}

#[async_trait]
impl RecoveryStrategy for SlowStrategy {
    fn id(&self) -> &str {
        "slow"
    }

    fn name(&self) -> &str {
        "Slow remediation"
    }

    fn priority(&self) -> u32 {
        1
    }

    fn can_apply(&self, _error: &DiagnosticResult, _context: &RecoveryContext) -> bool {
        true
    }

    async fn apply(&self, _error: &DiagnosticResult, _context: &RecoveryContext) -> Result<RecoveryResult, EngineError> {
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.applied.fetch_add(1, Ordering::SeqCst);
        Ok(RecoveryResult::succeeded("slow", "done"))
    }
}

fn render_failure(message: &str) -> DiagnosticResult {
    DiagnosticResult::new(ErrorCategory::Render, FailureKind::Render, Severity::High, message, "")
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_recovery_for_same_failure_applies_once() {
    let engine = ResilienceEngine::builder(test_config())
        .transport(ScriptedTransport::offline())
        .storage(Arc::new(MemoryStore::new()))
        .without_builtin_strategies()
        .build()
        .unwrap();
    let strategy = Arc::new(SlowStrategy {
        applied: AtomicU32::new(0),
    });
    engine.register_strategy(strategy.clone());

    let failure = render_failure("checkout crashed");
    let (first, second) = tokio::join!(
        engine.recover(Some("checkout"), &failure),
        engine.recover(Some("checkout"), &failure)
    );

    assert!(first.success);
    assert!(!second.success);
    assert!(second.strategy_id.is_none());
    assert_eq!(strategy.applied.load(Ordering::SeqCst), 1);
    assert_eq!(engine.stats().recoveries_rejected, 1);

    // A different failure of the same unit is not blocked
    let first_failure = render_failure("first");
    let second_failure = render_failure("second");
    let (a, b) = tokio::join!(
        engine.recover(Some("checkout"), &first_failure),
        engine.recover(Some("checkout"), &second_failure)
    );
    assert!(a.success && b.success);
    assert_eq!(strategy.applied.load(Ordering::SeqCst), 3);
    assert!(!engine.get_unit_state("checkout").is_recovering);
    assert!(!engine.store().snapshot().is_recovering);
}

struct PanickingStrategy;

#[async_trait]
impl RecoveryStrategy for PanickingStrategy {
    fn id(&self) -> &str {
        "panicking"
    }

    fn name(&self) -> &str {
        "Panicking remediation"
    }

    fn priority(&self) -> u32 {
        0
    }

    fn can_apply(&self, _error: &DiagnosticResult, _context: &RecoveryContext) -> bool {
        true
    }

    async fn apply(&self, _error: &DiagnosticResult, _context: &RecoveryContext) -> Result<RecoveryResult, EngineError> {
        panic!("remediation hit an impossible state");
    }
}

#[tokio::test]
async fn test_panicking_strategy_does_not_leave_unit_recovering() {
    let engine = ResilienceEngine::builder(test_config())
        .transport(ScriptedTransport::offline())
        .storage(Arc::new(MemoryStore::new()))
        .without_builtin_strategies()
        .build()
        .unwrap();
    engine.register_strategy(Arc::new(PanickingStrategy));

    let failure = render_failure("cart totals crashed");
    let result = engine.recover(Some("cart"), &failure).await;

    assert!(!result.success);
    assert_eq!(result.strategy_id.as_deref(), Some("panicking"));
    assert!(!engine.get_unit_state("cart").is_recovering);
    assert!(!engine.store().snapshot().is_recovering);
    assert_eq!(engine.get_unit_state("cart").retry_count, 1);
}

#[tokio::test(start_paused = true)]
async fn test_escalation_ends_in_delayed_reload() {
    let (engine, _storage) = engine_with(ScriptedTransport::offline());
    let mut signals = engine.signals();

    let mut applied = Vec::new();
    for _ in 0..5 {
        let result = engine
            .report_and_recover("checkout", "Checkout summary failed", None)
            .await
            .unwrap();
        applied.push(result.strategy_id);
    }

    assert_eq!(
        applied,
        vec![
            None,
            Some(PURGE_STORAGE.to_string()),
            Some(PURGE_CACHES.to_string()),
            Some(ESCALATE_OFFLINE.to_string()),
            Some(FULL_RELOAD.to_string()),
        ]
    );
    assert_eq!(engine.get_unit_state("checkout").fallback_mode, FallbackMode::Offline);

    // Skip the purge signals until the reload is scheduled
    loop {
        if let EngineSignal::ReloadScheduled { unit, delay_ms } = signals.recv().await.unwrap() {
            assert_eq!(unit, "checkout");
            assert_eq!(delay_ms, 2000);
            break;
        }
    }
    tokio::time::sleep(Duration::from_millis(2100)).await;
    assert_eq!(
        signals.recv().await.unwrap(),
        EngineSignal::ReloadRequested {
            unit: "checkout".to_string()
        }
    );
}

#[tokio::test(start_paused = true)]
async fn test_reload_cancelled_when_unit_recovers() {
    let (engine, _storage) = engine_with(ScriptedTransport::offline());
    for _ in 0..5 {
        engine.report_and_recover("checkout", "Checkout summary failed", None).await;
    }
    let mut signals = engine.signals();

    engine.mark_recovered("checkout");
    assert_eq!(
        signals.recv().await.unwrap(),
        EngineSignal::ReloadCancelled {
            unit: "checkout".to_string()
        }
    );
    assert!(!engine.cancel_reload("checkout"));
}

#[tokio::test]
async fn test_storage_purge_only_touches_allow_listed_corruption() {
    let (engine, storage) = engine_with(ScriptedTransport::offline());
    storage.set("auth_session", "<!DOCTYPE html><html></html>").unwrap();
    storage.set("user_profile", r#"{"name":"Ada"}"#).unwrap();
    storage.set("cache:coupons", &"x".repeat(2 * 1024 * 1024)).unwrap();
    storage.set("theme", "<html>not ours</html>").unwrap();
    let mut signals = engine.signals();

    let failure = engine
        .report_unit_error("cart", "QuotaExceededError: storage is full", None)
        .unwrap();
    let result = engine.recover(Some("cart"), &failure).await;

    assert!(result.success);
    assert_eq!(result.strategy_id.as_deref(), Some(PURGE_STORAGE));
    assert!(result.should_retry);
    assert!(storage.get("auth_session").unwrap().is_none());
    assert!(storage.get("cache:coupons").unwrap().is_none());
    assert!(storage.get("user_profile").unwrap().is_some());
    assert_eq!(storage.get("theme").unwrap().as_deref(), Some("<html>not ours</html>"));

    match signals.recv().await.unwrap() {
        EngineSignal::StoragePurged { keys } => {
            assert_eq!(keys, vec!["auth_session".to_string(), "cache:coupons".to_string()]);
        }
        other => panic!("unexpected signal {other:?}"),
    }
}

#[tokio::test]
async fn test_cache_purge_clears_registered_response_caches() {
    let (engine, _storage) = engine_with(ScriptedTransport::offline());
    let cache = engine.response_cache("catalog");
    cache.insert("cache:catalog", serde_json::json!(["item"])).await;
    let mut signals = engine.signals();

    let failure = engine
        .report_unit_error("catalog", "Failed to fetch catalog response", None)
        .unwrap();
    let result = engine.recover(Some("catalog"), &failure).await;

    assert_eq!(result.strategy_id.as_deref(), Some(PURGE_CACHES));
    assert!(cache.get("cache:catalog").await.is_none());
    assert_eq!(signals.recv().await.unwrap(), EngineSignal::CachesPurged { count: 1 });
}

#[tokio::test]
async fn test_dispose_cancels_pending_reload() {
    let (engine, _storage) = engine_with(ScriptedTransport::offline());
    engine.init().unwrap();
    for _ in 0..5 {
        engine.report_and_recover("checkout", "Checkout summary failed", None).await;
    }
    let mut signals = engine.signals();

    engine.dispose();
    assert_eq!(
        signals.recv().await.unwrap(),
        EngineSignal::ReloadCancelled {
            unit: "checkout".to_string()
        }
    );
    assert!(!engine.store().maintenance_running());
}
