//! The six built-in strategies, in priority order.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{error, info};

use super::reload::{ReloadScheduler, APPLICATION_UNIT};
use super::signals::{EngineSignal, SignalBus};
use super::strategy::{RecoveryContext, RecoveryResult, RecoveryStrategy};
use crate::diagnostics::{DiagnosticResult, ErrorCategory, FailureKind};
use crate::error::EngineError;
use crate::fetch::CacheRegistry;
use crate::storage::{is_corrupted_markup, PersistentStore, AUTH_KEYS};
use crate::store::FallbackMode;

pub const PURGE_STORAGE: &str = "purge-corrupted-storage";
pub const RESET_AUTH: &str = "reset-auth";
pub const PURGE_CACHES: &str = "purge-caches";
pub const ESCALATE_STATIC: &str = "escalate-static";
pub const ESCALATE_OFFLINE: &str = "escalate-offline";
pub const FULL_RELOAD: &str = "full-reload";

fn mentions(text: &str, needles: &[&str]) -> bool {
    let lower = text.to_lowercase();
    needles.iter().any(|needle| lower.contains(needle))
}

/// Removes allow-listed persisted entries holding markup or exceeding a size ceiling
pub struct PurgeCorruptedStorage {
    storage: Arc<dyn PersistentStore>,
    keys: Vec<String>,
    size_ceiling: usize,
    signals: SignalBus,
}

impl PurgeCorruptedStorage {
    pub fn new(storage: Arc<dyn PersistentStore>, keys: Vec<String>, size_ceiling: usize, signals: SignalBus) -> Self {
        Self {
            storage,
            keys,
            size_ceiling,
            signals,
        }
    }
}

#[async_trait]
impl RecoveryStrategy for PurgeCorruptedStorage {
    fn id(&self) -> &str {
        PURGE_STORAGE
    }

    fn name(&self) -> &str {
        "Purge corrupted persisted entries"
    }

    fn priority(&self) -> u32 {
        10
    }

    fn can_apply(&self, error: &DiagnosticResult, context: &RecoveryContext) -> bool {
        !context.has_applied(PURGE_STORAGE)
            && (error.kind == FailureKind::Storage
                || mentions(&error.message, &["storage", "quota"])
                || context.error_count >= 2)
    }

    async fn apply(&self, _error: &DiagnosticResult, _context: &RecoveryContext) -> Result<RecoveryResult, EngineError> {
        let mut purged = Vec::new();
        for key in &self.keys {
            let Some(value) = self.storage.get(key)? else {
                continue;
            };
            if is_corrupted_markup(&value) || value.len() > self.size_ceiling {
                self.storage.remove(key)?;
                purged.push(key.clone());
            }
        }

        if purged.is_empty() {
            return Ok(RecoveryResult::succeeded(PURGE_STORAGE, "No corrupted persisted entries found").with_retry());
        }
        info!(keys = ?purged, "Purged corrupted persisted entries");
        let message = format!("Purged {} corrupted persisted entries", purged.len());
        self.signals.send(EngineSignal::StoragePurged { keys: purged });
        Ok(RecoveryResult::succeeded(PURGE_STORAGE, message).with_retry())
    }
}

/// Clears session artifacts and tells clients to re-authenticate
pub struct ResetAuthentication {
    storage: Arc<dyn PersistentStore>,
    keys: Vec<String>,
    signals: SignalBus,
}

impl ResetAuthentication {
    /// Only keys that are both session artifacts and allow-listed are cleared
    pub fn new(storage: Arc<dyn PersistentStore>, allow_list: &[String], signals: SignalBus) -> Self {
        let keys = allow_list
            .iter()
            .filter(|key| AUTH_KEYS.contains(&key.as_str()) || key.as_str() == "cache:auth_session")
            .cloned()
            .collect();
        Self { storage, keys, signals }
    }
}

#[async_trait]
impl RecoveryStrategy for ResetAuthentication {
    fn id(&self) -> &str {
        RESET_AUTH
    }

    fn name(&self) -> &str {
        "Reset authentication state"
    }

    fn priority(&self) -> u32 {
        20
    }

    fn can_apply(&self, error: &DiagnosticResult, context: &RecoveryContext) -> bool {
        const AUTH_WORDS: &[&str] = &["auth", "token", "session", "login", "credential", "unauthorized"];
        !context.has_applied(RESET_AUTH)
            && (error.category == ErrorCategory::Auth
                || mentions(&error.message, AUTH_WORDS)
                || context
                    .unit_name
                    .as_deref()
                    .is_some_and(|unit| mentions(unit, AUTH_WORDS)))
    }

    async fn apply(&self, _error: &DiagnosticResult, context: &RecoveryContext) -> Result<RecoveryResult, EngineError> {
        let mut cleared = 0;
        for key in &self.keys {
            if self.storage.remove(key)? {
                cleared += 1;
            }
        }
        info!(cleared, "Authentication state reset");
        self.signals.send(EngineSignal::AuthReset {
            unit: context.unit_name.clone(),
        });
        Ok(
            RecoveryResult::succeeded(RESET_AUTH, format!("Cleared {cleared} session entries"))
                .with_retry()
                .with_fallback(FallbackMode::Minimal),
        )
    }
}

/// Purges every registered response cache
pub struct PurgeCaches {
    registry: CacheRegistry,
    signals: SignalBus,
}

impl PurgeCaches {
    pub fn new(registry: CacheRegistry, signals: SignalBus) -> Self {
        Self { registry, signals }
    }
}

#[async_trait]
impl RecoveryStrategy for PurgeCaches {
    fn id(&self) -> &str {
        PURGE_CACHES
    }

    fn name(&self) -> &str {
        "Purge caches"
    }

    fn priority(&self) -> u32 {
        30
    }

    fn can_apply(&self, error: &DiagnosticResult, context: &RecoveryContext) -> bool {
        !context.has_applied(PURGE_CACHES)
            && (mentions(&error.message, &["cache", "fetch", "request", "response"]) || context.error_count >= 3)
    }

    async fn apply(&self, _error: &DiagnosticResult, _context: &RecoveryContext) -> Result<RecoveryResult, EngineError> {
        let count = self.registry.purge_all();
        self.signals.send(EngineSignal::CachesPurged { count });
        Ok(RecoveryResult::succeeded(PURGE_CACHES, format!("Purged {count} caches")).with_retry())
    }
}

/// Declares a fallback mode once enough retries have been spent
pub struct EscalateFallback {
    id: &'static str,
    name: &'static str,
    priority: u32,
    min_retries: u32,
    target: FallbackMode,
}

impl EscalateFallback {
    pub fn to_static() -> Self {
        Self {
            id: ESCALATE_STATIC,
            name: "Escalate to static mode",
            priority: 40,
            min_retries: 2,
            target: FallbackMode::Static,
        }
    }

    pub fn to_offline() -> Self {
        Self {
            id: ESCALATE_OFFLINE,
            name: "Escalate to offline mode",
            priority: 50,
            min_retries: 3,
            target: FallbackMode::Offline,
        }
    }
}

#[async_trait]
impl RecoveryStrategy for EscalateFallback {
    fn id(&self) -> &str {
        self.id
    }

    fn name(&self) -> &str {
        self.name
    }

    fn priority(&self) -> u32 {
        self.priority
    }

    fn can_apply(&self, _error: &DiagnosticResult, context: &RecoveryContext) -> bool {
        context.retry_attempts >= self.min_retries && context.fallback_mode < self.target
    }

    async fn apply(&self, _error: &DiagnosticResult, _context: &RecoveryContext) -> Result<RecoveryResult, EngineError> {
        Ok(RecoveryResult::succeeded(self.id, format!("Degraded to {} mode", self.target)).with_fallback(self.target))
    }
}

/// Last resort: schedules a delayed, cancellable full reload
pub struct FullReload {
    scheduler: ReloadScheduler,
}

impl FullReload {
    pub fn new(scheduler: ReloadScheduler) -> Self {
        Self { scheduler }
    }
}

#[async_trait]
impl RecoveryStrategy for FullReload {
    fn id(&self) -> &str {
        FULL_RELOAD
    }

    fn name(&self) -> &str {
        "Full reload"
    }

    fn priority(&self) -> u32 {
        60
    }

    fn can_apply(&self, _error: &DiagnosticResult, context: &RecoveryContext) -> bool {
        context.error_count >= 5 && context.retry_attempts >= 4
    }

    async fn apply(&self, error: &DiagnosticResult, context: &RecoveryContext) -> Result<RecoveryResult, EngineError> {
        let unit = context.unit_name.as_deref().unwrap_or(APPLICATION_UNIT);
        let delay_ms = self.scheduler.delay().as_millis();
        if !self.scheduler.schedule(unit)? {
            return Ok(RecoveryResult::succeeded(FULL_RELOAD, "Reload already scheduled"));
        }
        error!(
            unit,
            error_count = context.error_count,
            retry_attempts = context.retry_attempts,
            last_error = %error.message,
            delay_ms,
            "Recovery exhausted; full reload scheduled"
        );
        Ok(RecoveryResult::succeeded(
            FULL_RELOAD,
            format!("Full reload scheduled in {delay_ms} ms"),
        ))
    }
}

/// Dependencies of the built-in strategies
pub struct BuiltinDeps {
    pub storage: Arc<dyn PersistentStore>,
    pub persisted_keys: Vec<String>,
    pub size_ceiling: usize,
    pub caches: CacheRegistry,
    pub signals: SignalBus,
    pub reloads: ReloadScheduler,
}

pub fn builtin_strategies(deps: BuiltinDeps) -> Vec<Arc<dyn RecoveryStrategy>> {
    vec![
        Arc::new(PurgeCorruptedStorage::new(
            deps.storage.clone(),
            deps.persisted_keys.clone(),
            deps.size_ceiling,
            deps.signals.clone(),
        )),
        Arc::new(ResetAuthentication::new(deps.storage, &deps.persisted_keys, deps.signals.clone())),
        Arc::new(PurgeCaches::new(deps.caches, deps.signals)),
        Arc::new(EscalateFallback::to_static()),
        Arc::new(EscalateFallback::to_offline()),
        Arc::new(FullReload::new(deps.reloads)),
    ]
}
