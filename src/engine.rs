//! The explicitly constructed engine context.
//!
//! One [`ResilienceEngine`] owns the store, the capture layer, the recovery
//! engine and the shared resources the built-in strategies act on. Consumers
//! receive it (or clones of its handles) instead of reaching for globals.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::capture::{CaptureLayer, Console};
use crate::clients::{AuthBootstrapper, CouponLoader, COUPONS_CACHE_KEY, COUPONS_UNIT};
use crate::clients::auth::SESSION_CACHE_KEY;
use crate::config::ResilienceConfig;
use crate::diagnostics::{
    generate_report, Classifier, DiagnosticReport, DiagnosticResult, EnvironmentProbe, ErrorCategory, RecoveryProbe,
    Severity, StorageProbe, SystemHealth,
};
use crate::error::EngineError;
use crate::fetch::{CacheRegistry, FetchOptions, ReqwestTransport, ResilientFetcher, ResponseCache, Transport};
use crate::observability::{ResilienceMetrics, ResilienceStats};
use crate::recovery::{
    builtin_strategies, BuiltinDeps, EngineSignal, RecoveryEngine, RecoveryResult, RecoveryStrategy, ReloadScheduler,
    SignalBus,
};
use crate::storage::{FileStore, MemoryStore, PersistentStore};
use crate::store::{ApplicationHealthState, ErrorStore, Subscription, UnitHealthState};

/// Builder for [`ResilienceEngine`]; anything left unset comes from config
pub struct EngineBuilder {
    config: ResilienceConfig,
    transport: Option<Arc<dyn Transport>>,
    storage: Option<Arc<dyn PersistentStore>>,
    classifier: Option<Classifier>,
    builtin_strategies: bool,
}

impl EngineBuilder {
    pub fn new(config: ResilienceConfig) -> Self {
        Self {
            config,
            transport: None,
            storage: None,
            classifier: None,
            builtin_strategies: true,
        }
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn storage(mut self, storage: Arc<dyn PersistentStore>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn classifier(mut self, classifier: Classifier) -> Self {
        self.classifier = Some(classifier);
        self
    }

    /// Start with an empty strategy registry
    pub fn without_builtin_strategies(mut self) -> Self {
        self.builtin_strategies = false;
        self
    }

    pub fn build(self) -> Result<ResilienceEngine, EngineError> {
        let config = self.config;
        let store = ErrorStore::new(config.to_store_policy());
        let metrics = Arc::new(ResilienceMetrics::default());
        let classifier = Arc::new(self.classifier.unwrap_or_default());
        let capture = CaptureLayer::new(classifier, store.clone(), metrics.clone());

        let storage: Arc<dyn PersistentStore> = match (self.storage, &config.storage.path) {
            (Some(storage), _) => storage,
            (None, Some(path)) => Arc::new(FileStore::new(path)?),
            (None, None) => Arc::new(MemoryStore::new()),
        };
        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(ReqwestTransport::new()?),
        };

        let caches = CacheRegistry::new();
        let signals = SignalBus::default();
        let reloads = ReloadScheduler::new(
            store.clone(),
            signals.clone(),
            Duration::from_millis(config.recovery.reload_delay_ms),
        );
        let recovery = RecoveryEngine::new(store.clone(), metrics.clone(), config.recovery.max_retries);
        if self.builtin_strategies {
            recovery.register_all(builtin_strategies(BuiltinDeps {
                storage: storage.clone(),
                persisted_keys: config.recovery.persisted_keys.clone(),
                size_ceiling: config.recovery.storage_size_ceiling_bytes,
                caches: caches.clone(),
                signals: signals.clone(),
                reloads: reloads.clone(),
            }));
        }

        debug!(strategies = ?recovery.strategy_ids(), "Resilience engine built");
        Ok(ResilienceEngine {
            config,
            store,
            metrics,
            capture,
            storage,
            transport,
            caches,
            response_caches: Mutex::new(HashMap::new()),
            signals,
            reloads,
            recovery,
            initialized: AtomicBool::new(false),
        })
    }
}

pub struct ResilienceEngine {
    config: ResilienceConfig,
    store: ErrorStore,
    metrics: Arc<ResilienceMetrics>,
    capture: CaptureLayer,
    storage: Arc<dyn PersistentStore>,
    transport: Arc<dyn Transport>,
    caches: CacheRegistry,
    response_caches: Mutex<HashMap<String, Arc<ResponseCache>>>,
    signals: SignalBus,
    reloads: ReloadScheduler,
    recovery: RecoveryEngine,
    initialized: AtomicBool,
}

impl std::fmt::Debug for ResilienceEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilienceEngine")
            .field("store", &self.store)
            .field("recovery", &self.recovery)
            .field("initialized", &self.is_initialized())
            .finish_non_exhaustive()
    }
}

impl ResilienceEngine {
    pub fn builder(config: ResilienceConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    /// Engine with reqwest transport and storage chosen by config
    pub fn new(config: ResilienceConfig) -> Result<Self, EngineError> {
        EngineBuilder::new(config).build()
    }

    /// Start the store's periodic sweeps and, when configured, panic capture.
    /// Requires a running tokio runtime. Calling it again is a no-op.
    pub fn init(&self) -> Result<(), EngineError> {
        if self.initialized.swap(true, Ordering::AcqRel) {
            debug!("Resilience engine already initialized");
            return Ok(());
        }
        if let Err(e) = self.store.start_maintenance() {
            self.initialized.store(false, Ordering::Release);
            return Err(e);
        }
        self.capture.enable();
        if self.config.capture.install_panic_hook {
            self.capture.install_panic_hook();
        }
        info!(strategies = self.recovery.strategy_ids().len(), "Resilience engine initialized");
        Ok(())
    }

    /// Stop sweeps, cancel pending reloads and stop capturing
    pub fn dispose(&self) {
        if !self.initialized.swap(false, Ordering::AcqRel) {
            return;
        }
        self.store.stop_maintenance();
        let cancelled = self.reloads.cancel_all();
        self.capture.disable();
        if self.config.observability.metrics_enabled {
            self.metrics.log_stats();
        }
        info!(cancelled_reloads = cancelled, "Resilience engine disposed");
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    pub fn config(&self) -> &ResilienceConfig {
        &self.config
    }

    pub fn store(&self) -> &ErrorStore {
        &self.store
    }

    pub fn capture(&self) -> &CaptureLayer {
        &self.capture
    }

    pub fn metrics(&self) -> &ResilienceMetrics {
        &self.metrics
    }

    pub fn stats(&self) -> ResilienceStats {
        self.metrics.get_stats()
    }

    pub fn storage(&self) -> Arc<dyn PersistentStore> {
        self.storage.clone()
    }

    pub fn recovery(&self) -> &RecoveryEngine {
        &self.recovery
    }

    pub fn signals(&self) -> broadcast::Receiver<EngineSignal> {
        self.signals.subscribe()
    }

    /// Console whose lines are teed to stderr and captured
    pub fn console(&self) -> Console {
        Console::stderr(self.capture.clone())
    }

    pub fn register_strategy(&self, strategy: Arc<dyn RecoveryStrategy>) {
        self.recovery.register(strategy);
    }

    /// Failure reported by a named unit; `None` when capture is disabled
    pub fn report_unit_error(
        &self,
        unit: &str,
        message: impl Into<String>,
        severity: Option<Severity>,
    ) -> Option<DiagnosticResult> {
        self.capture
            .report_unit_error(unit, message, severity)
            .map(|record| record.error)
    }

    /// Free-form failure from a caller that is not unit-scoped
    pub fn report_error(
        &self,
        category: ErrorCategory,
        message: impl Into<String>,
        details: Option<serde_json::Value>,
    ) -> Option<DiagnosticResult> {
        self.capture.report(category, message, details).map(|record| record.error)
    }

    /// Report a unit failure and immediately run one recovery pass for it
    pub async fn report_and_recover(
        &self,
        unit: &str,
        message: impl Into<String>,
        severity: Option<Severity>,
    ) -> Option<RecoveryResult> {
        let diagnostic = self.report_unit_error(unit, message, severity)?;
        Some(self.recover(Some(unit), &diagnostic).await)
    }

    pub async fn recover(&self, unit: Option<&str>, error: &DiagnosticResult) -> RecoveryResult {
        self.recovery.attempt_recovery(unit, error).await
    }

    pub fn get_unit_state(&self, unit: &str) -> UnitHealthState {
        self.store.get_unit_state(unit)
    }

    pub fn get_system_health(&self) -> SystemHealth {
        self.store.get_system_health()
    }

    pub fn is_unit_in_error(&self, unit: &str) -> bool {
        self.store.is_unit_in_error(unit)
    }

    /// Reset a unit after the caller confirmed it works again
    pub fn mark_recovered(&self, unit: &str) {
        self.store.mark_recovered(unit);
        self.reloads.cancel(unit);
    }

    /// Manual reset: forget the unit's errors and any pending reload
    pub fn reset_unit(&self, unit: &str) {
        self.store.clear_unit(unit);
        self.reloads.cancel(unit);
    }

    pub fn cancel_reload(&self, unit: &str) -> bool {
        self.reloads.cancel(unit)
    }

    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&ApplicationHealthState) + Send + Sync + 'static,
    {
        self.store.subscribe(listener)
    }

    pub fn watch(&self) -> watch::Receiver<Arc<ApplicationHealthState>> {
        self.store.watch()
    }

    pub fn generate_report(&self) -> DiagnosticReport {
        let probes: Vec<Box<dyn EnvironmentProbe>> = vec![
            Box::new(StorageProbe::new(
                self.storage.clone(),
                self.config.recovery.persisted_keys.clone(),
                self.config.recovery.storage_size_ceiling_bytes,
            )),
            Box::new(RecoveryProbe),
        ];
        generate_report(&self.store.snapshot(), &probes)
    }

    /// In-memory response cache for `name`, shared by every client of that
    /// unit and registered once so the cache purge strategy can clear it
    pub fn response_cache(&self, name: &str) -> Arc<ResponseCache> {
        let mut caches = self.response_caches.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(cache) = caches.get(name) {
            return cache.clone();
        }
        let cache = Arc::new(ResponseCache::new(
            name,
            self.config.fetch.response_cache_ttl(),
            self.config.fetch.response_cache_capacity,
        ));
        self.caches.register(cache.clone());
        caches.insert(name.to_string(), cache.clone());
        cache
    }

    pub fn fetch_options(&self, unit: &str, cache_key: &str) -> FetchOptions {
        FetchOptions::from_config(unit, cache_key, &self.config.fetch)
    }

    /// Resilient fetcher for `unit` with a dedicated response cache
    pub fn fetcher<T>(&self, unit: &str, cache_key: &str, default_payload: T) -> ResilientFetcher<T>
    where
        T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        ResilientFetcher::new(
            self.transport.clone(),
            self.capture.clone(),
            self.storage.clone(),
            self.response_cache(unit),
            self.fetch_options(unit, cache_key),
            default_payload,
        )
    }

    pub fn auth_client(&self, base_url: &str) -> AuthBootstrapper {
        AuthBootstrapper::new(
            base_url,
            self.transport.clone(),
            self.capture.clone(),
            self.storage.clone(),
            self.response_cache(crate::clients::AUTH_UNIT),
            self.fetch_options(crate::clients::AUTH_UNIT, SESSION_CACHE_KEY),
        )
    }

    pub fn coupon_loader(&self, base_url: &str) -> CouponLoader {
        CouponLoader::new(
            base_url,
            self.transport.clone(),
            self.capture.clone(),
            self.storage.clone(),
            self.response_cache(COUPONS_UNIT),
            self.fetch_options(COUPONS_UNIT, COUPONS_CACHE_KEY),
        )
    }
}

impl Drop for ResilienceEngine {
    fn drop(&mut self) {
        if self.is_initialized() {
            warn!("Resilience engine dropped without dispose; stopping background tasks");
            self.dispose();
        }
    }
}
