//! Retry, backoff, format validation, caching and fallback for data clients.

use rand::Rng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use statig::prelude::*;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn, Instrument};

use super::cache::ResponseCache;
use super::state_machine::{LoadEvent, LoadMachine, LoadPhase};
use super::transport::{FetchRequest, FetchResponse, Transport};
use crate::capture::CaptureLayer;
use crate::config::FetchConfig;
use crate::diagnostics::{DiagnosticResult, ErrorCategory, FailureKind, Severity};
use crate::error::TransportError;
use crate::storage::{read_envelope, write_envelope, PersistentStore};
use crate::telemetry::create_fetch_span;

/// Caller-supplied payload check run after a successful decode
pub type Validator<T> = Arc<dyn Fn(&T) -> Result<(), String> + Send + Sync>;

#[derive(Debug, Clone, PartialEq)]
pub struct FetchOptions {
    /// Unit the fetcher reports failures against
    pub unit: String,
    /// Persisted key of the last-known-good envelope
    pub cache_key: String,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub timeout: Duration,
    /// Validity of the persisted last-known-good payload
    pub cache_ttl: Duration,
    pub jitter: bool,
}

impl FetchOptions {
    pub fn new(unit: impl Into<String>, cache_key: impl Into<String>) -> Self {
        Self::from_config(unit, cache_key, &FetchConfig::default())
    }

    pub fn from_config(unit: impl Into<String>, cache_key: impl Into<String>, config: &FetchConfig) -> Self {
        Self {
            unit: unit.into(),
            cache_key: cache_key.into(),
            max_retries: config.max_retries,
            retry_delay: config.retry_delay(),
            timeout: config.timeout(),
            cache_ttl: config.cache_ttl(),
            jitter: config.jitter,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_cache_ttl(mut self, cache_ttl: Duration) -> Self {
        self.cache_ttl = cache_ttl;
        self
    }

    /// Backoff before the attempt following failed attempt `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base = self.retry_delay.saturating_mul(attempt);
        if self.jitter && !base.is_zero() {
            let extra = rand::rng().random_range(0.0..0.1);
            base + base.mul_f64(extra)
        } else {
            base
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadSource {
    Network,
    /// Fresh in-memory response cache, no network attempt made
    ResponseCache,
    /// Persisted last-known-good payload served after exhaustion
    PersistedCache,
    Default,
}

/// Result of one load; never an error
#[derive(Debug, Clone, PartialEq)]
pub struct LoadOutcome<T> {
    pub payload: T,
    pub source: PayloadSource,
    /// Degraded data is being shown
    pub fallback_mode: bool,
    /// Human-readable degraded-state message
    pub message: Option<String>,
    pub attempts: u32,
    pub phase: LoadPhase,
}

/// Live status of a fetcher, readable between loads
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchStatus {
    pub fallback_mode: bool,
    pub retry_count: u32,
    pub message: Option<String>,
    pub phase: LoadPhase,
}

#[derive(Debug, Clone)]
enum AttemptFailure {
    Transport(TransportError),
    Status(FetchResponse),
    /// Declared content type contradicts the endpoint contract
    Format(FetchResponse),
    /// Body does not decode as the declared format
    Parse(String),
    Invalid(String),
}

impl AttemptFailure {
    fn is_data_problem(&self) -> bool {
        matches!(self, AttemptFailure::Parse(_) | AttemptFailure::Invalid(_))
    }

    fn describe(&self) -> String {
        match self {
            AttemptFailure::Transport(e) => e.to_string(),
            AttemptFailure::Status(response) => format!("HTTP {}", response.status),
            AttemptFailure::Format(response) => format!(
                "unexpected content type {}",
                response.content_type.as_deref().unwrap_or("(none)")
            ),
            AttemptFailure::Parse(e) => format!("response body did not parse: {e}"),
            AttemptFailure::Invalid(reason) => format!("payload failed validation: {reason}"),
        }
    }
}

pub struct ResilientFetcher<T> {
    transport: Arc<dyn Transport>,
    capture: CaptureLayer,
    storage: Arc<dyn PersistentStore>,
    response_cache: Arc<ResponseCache>,
    options: FetchOptions,
    default_payload: T,
    validator: Option<Validator<T>>,
    status: Mutex<FetchStatus>,
}

impl<T> std::fmt::Debug for ResilientFetcher<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilientFetcher")
            .field("options", &self.options)
            .field("status", &*self.status.lock().unwrap_or_else(|poisoned| poisoned.into_inner()))
            .finish_non_exhaustive()
    }
}

impl<T> ResilientFetcher<T>
where
    T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(
        transport: Arc<dyn Transport>,
        capture: CaptureLayer,
        storage: Arc<dyn PersistentStore>,
        response_cache: Arc<ResponseCache>,
        options: FetchOptions,
        default_payload: T,
    ) -> Self {
        Self {
            transport,
            capture,
            storage,
            response_cache,
            options,
            default_payload,
            validator: None,
            status: Mutex::new(FetchStatus::default()),
        }
    }

    pub fn with_validator(mut self, validator: impl Fn(&T) -> Result<(), String> + Send + Sync + 'static) -> Self {
        self.validator = Some(Arc::new(validator));
        self
    }

    pub fn options(&self) -> &FetchOptions {
        &self.options
    }

    pub fn status(&self) -> FetchStatus {
        self.status.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).clone()
    }

    fn update_status(&self, f: impl FnOnce(&mut FetchStatus)) {
        f(&mut self.status.lock().unwrap_or_else(|poisoned| poisoned.into_inner()));
    }

    /// Load through the full pattern: fresh cache, network with retries,
    /// then persisted cache or default payload.
    pub async fn load(&self, request: FetchRequest) -> LoadOutcome<T> {
        let span = create_fetch_span(&request.url, &self.options.cache_key);
        self.load_inner(request).instrument(span).await
    }

    async fn load_inner(&self, mut request: FetchRequest) -> LoadOutcome<T> {
        crate::time_operation!("resilient_fetch");
        request.timeout = self.options.timeout;
        let metrics = self.capture.metrics();
        let mut sm = LoadMachine::new(request.url.clone(), self.options.max_retries + 1).state_machine();

        if let Some(payload) = self.fresh_cached().await {
            metrics.record_cache_hit();
            sm.handle(&LoadEvent::FreshCacheHit);
            debug!(unit = %self.options.unit, "Served from response cache");
            return self.succeed(payload, PayloadSource::ResponseCache, 0, sm.inner().phase());
        }
        metrics.record_cache_miss();

        sm.handle(&LoadEvent::Begin);
        self.update_status(|status| status.phase = LoadPhase::Loading);

        let mut attempt = 0;
        let failure = loop {
            attempt += 1;
            metrics.record_fetch_attempt();
            match self.attempt(&request).await {
                Ok(payload) => {
                    sm.handle(&LoadEvent::Loaded);
                    self.remember(&payload).await;
                    info!(unit = %self.options.unit, attempt, "Load succeeded");
                    return self.succeed(payload, PayloadSource::Network, attempt, sm.inner().phase());
                }
                Err(failure) => {
                    warn!(
                        unit = %self.options.unit,
                        url = %request.url,
                        attempt,
                        error = %failure.describe(),
                        "Fetch attempt failed"
                    );
                    sm.handle(&LoadEvent::AttemptFailed {
                        reason: failure.describe(),
                    });
                    self.update_status(|status| status.retry_count = attempt);
                    if sm.inner().phase() != LoadPhase::Loading {
                        break failure;
                    }
                    tokio::time::sleep(self.options.backoff(attempt)).await;
                }
            }
        };

        self.fall_back(
            |event| {
                sm.handle(&event);
                sm.inner().phase()
            },
            &request,
            failure,
            attempt,
        )
    }

    async fn fresh_cached(&self) -> Option<T> {
        let value = self.response_cache.get(&self.options.cache_key).await?;
        match serde_json::from_value(value) {
            Ok(payload) => Some(payload),
            Err(e) => {
                debug!(key = %self.options.cache_key, error = %e, "Dropping undecodable response cache entry");
                self.response_cache.invalidate(&self.options.cache_key).await;
                None
            }
        }
    }

    async fn attempt(&self, request: &FetchRequest) -> Result<T, AttemptFailure> {
        let response = match tokio::time::timeout(self.options.timeout, self.transport.send(request)).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return Err(AttemptFailure::Transport(e)),
            Err(_) => {
                return Err(AttemptFailure::Transport(TransportError::Timeout {
                    timeout_ms: self.options.timeout.as_millis() as u64,
                }))
            }
        };

        if request.expectation.is_violated_by(response.content_type.as_deref()) {
            return Err(AttemptFailure::Format(response));
        }
        if !response.is_success() {
            return Err(AttemptFailure::Status(response));
        }
        let payload: T = response
            .parse()
            .map_err(|e| AttemptFailure::Parse(e.to_string()))?;
        if let Some(validator) = &self.validator {
            validator(&payload).map_err(AttemptFailure::Invalid)?;
        }
        Ok(payload)
    }

    async fn remember(&self, payload: &T) {
        match serde_json::to_value(payload) {
            Ok(value) => self.response_cache.insert(&self.options.cache_key, value).await,
            Err(e) => debug!(error = %e, "Payload not cacheable in memory"),
        }
        if let Err(e) = write_envelope(self.storage.as_ref(), &self.options.cache_key, payload) {
            warn!(key = %self.options.cache_key, error = %e, "Failed to persist last-known-good payload");
        }
    }

    fn succeed(&self, payload: T, source: PayloadSource, attempts: u32, phase: LoadPhase) -> LoadOutcome<T> {
        self.update_status(|status| {
            *status = FetchStatus {
                fallback_mode: false,
                retry_count: 0,
                message: None,
                phase,
            }
        });
        let store = self.capture.store();
        if store.snapshot().unit(&self.options.unit).is_some() {
            store.mark_recovered(&self.options.unit);
        }
        LoadOutcome {
            payload,
            source,
            fallback_mode: false,
            message: None,
            attempts,
            phase,
        }
    }

    fn fall_back(
        &self,
        resolve: impl FnOnce(LoadEvent) -> LoadPhase,
        request: &FetchRequest,
        failure: AttemptFailure,
        attempts: u32,
    ) -> LoadOutcome<T> {
        let diagnostic = self.diagnose(request, &failure, attempts);
        self.capture.record(Some(&self.options.unit), diagnostic, "fetch");
        self.capture.metrics().record_fallback_served();

        let now = chrono::Utc::now();
        let cached = read_envelope::<T>(self.storage.as_ref(), &self.options.cache_key)
            .filter(|envelope| envelope.is_fresh(self.options.cache_ttl, now))
            .filter(|envelope| match &self.validator {
                Some(validator) => validator(&envelope.payload).is_ok(),
                None => true,
            });

        let lead = if failure.is_data_problem() {
            "Data format error"
        } else {
            "Service unavailable"
        };

        let (event, payload, source, message) = match cached {
            Some(envelope) => {
                let minutes = envelope.age(now).num_minutes();
                (
                    LoadEvent::CacheServed,
                    envelope.payload,
                    PayloadSource::PersistedCache,
                    format!("{lead}: showing saved data from {minutes} minutes ago"),
                )
            }
            None => (
                LoadEvent::DefaultServed,
                self.default_payload.clone(),
                PayloadSource::Default,
                format!("{lead}: showing default data"),
            ),
        };

        let phase = resolve(event);
        warn!(unit = %self.options.unit, attempts, phase = %phase, "Load exhausted; serving fallback");
        self.update_status(|status| {
            *status = FetchStatus {
                fallback_mode: true,
                retry_count: attempts,
                message: Some(message.clone()),
                phase,
            }
        });

        LoadOutcome {
            payload,
            source,
            fallback_mode: true,
            message: Some(message),
            attempts,
            phase,
        }
    }

    fn diagnose(&self, request: &FetchRequest, failure: &AttemptFailure, attempts: u32) -> DiagnosticResult {
        let classifier = self.capture.classifier();
        let diagnostic = match failure {
            AttemptFailure::Transport(e) => classifier.classify_transport(&request.url, e),
            AttemptFailure::Status(response) | AttemptFailure::Format(response) => classifier
                .classify_http(
                    &request.url,
                    response.status,
                    response.content_type.as_deref(),
                    request.expectation,
                )
                .unwrap_or_else(|| {
                    DiagnosticResult::new(
                        ErrorCategory::Api,
                        FailureKind::Unknown,
                        Severity::Medium,
                        format!("HTTP {} from {}", response.status, request.url),
                        "Retry later.",
                    )
                }),
            AttemptFailure::Parse(e) => DiagnosticResult::new(
                ErrorCategory::Data,
                FailureKind::Parse,
                Severity::High,
                format!("Response from {} is not valid JSON: {e}", request.url),
                "The service returned malformed data. Check the backend response format.",
            ),
            AttemptFailure::Invalid(reason) => DiagnosticResult::new(
                ErrorCategory::Data,
                FailureKind::Validation,
                Severity::Medium,
                format!("Payload from {} failed validation: {reason}", request.url),
                "The service returned data the client cannot use. Check the payload contents.",
            ),
        };
        let mut details = match diagnostic.details.clone() {
            serde_json::Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        details.insert("attempts".to_string(), attempts.into());
        details.insert("cache_key".to_string(), self.options.cache_key.clone().into());
        diagnostic.with_details(serde_json::Value::Object(details))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::Classifier;
    use crate::observability::ResilienceMetrics;
    use crate::storage::{CachedEnvelope, MemoryStore};
    use crate::store::ErrorStore;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct ScriptedTransport {
        responses: Mutex<VecDeque<Result<FetchResponse, TransportError>>>,
        calls: AtomicU32,
    }

    impl ScriptedTransport {
        fn new(responses: Vec<Result<FetchResponse, TransportError>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn send(&self, _request: &FetchRequest) -> Result<FetchResponse, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(TransportError::Other("script exhausted".to_string())))
        }
    }

    fn fetcher(transport: Arc<ScriptedTransport>, storage: Arc<MemoryStore>) -> ResilientFetcher<Vec<String>> {
        let capture = CaptureLayer::new(
            Arc::new(Classifier::new()),
            ErrorStore::default(),
            Arc::new(ResilienceMetrics::default()),
        );
        ResilientFetcher::new(
            transport,
            capture,
            storage,
            Arc::new(ResponseCache::new("coupons", Duration::from_secs(300), 16)),
            FetchOptions::new("coupons", "cache:coupons"),
            vec!["WELCOME".to_string()],
        )
    }

    #[test]
    fn test_linear_backoff_without_jitter() {
        let options = FetchOptions::new("coupons", "cache:coupons");
        assert_eq!(options.backoff(1), Duration::from_secs(1));
        assert_eq!(options.backoff(2), Duration::from_secs(2));

        let tuned = options
            .with_max_retries(4)
            .with_retry_delay(Duration::from_millis(250))
            .with_timeout(Duration::from_secs(2))
            .with_cache_ttl(Duration::from_secs(3600));
        assert_eq!(tuned.backoff(3), Duration::from_millis(750));
        assert_eq!(tuned.max_retries, 4);
        assert_eq!(tuned.timeout, Duration::from_secs(2));
        assert_eq!(tuned.cache_ttl, Duration::from_secs(3600));
    }

    #[test]
    fn test_jitter_stays_within_ten_percent() {
        let mut options = FetchOptions::new("coupons", "cache:coupons");
        options.jitter = true;
        for _ in 0..50 {
            let delay = options.backoff(2);
            assert!(delay >= Duration::from_secs(2));
            assert!(delay <= Duration::from_millis(2200));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_parse_failure_reports_data_format_error() {
        let transport = ScriptedTransport::new(vec![
            Ok(FetchResponse::new(200, Some("application/json"), "{not json")),
            Ok(FetchResponse::new(200, Some("application/json"), "{not json")),
            Ok(FetchResponse::new(200, Some("application/json"), "{not json")),
        ]);
        let fetcher = fetcher(transport, Arc::new(MemoryStore::new()));
        let outcome = fetcher.load(FetchRequest::get("/api/coupons")).await;

        assert_eq!(outcome.source, PayloadSource::Default);
        assert_eq!(outcome.phase, LoadPhase::FallbackDefault);
        assert!(outcome.message.unwrap().starts_with("Data format error"));

        let state = fetcher.capture.store().snapshot();
        assert_eq!(state.global_errors.len(), 1);
        assert_eq!(state.global_errors[0].error.category, ErrorCategory::Data);
        assert_eq!(state.global_errors[0].error.kind, FailureKind::Parse);
    }

    #[tokio::test(start_paused = true)]
    async fn test_undecodable_response_cache_entry_is_dropped() {
        let transport = ScriptedTransport::new(Vec::new());
        let fetcher = fetcher(transport.clone(), Arc::new(MemoryStore::new()));
        fetcher
            .response_cache
            .insert("cache:coupons", json!({ "unexpected": "shape" }))
            .await;

        let outcome = fetcher.load(FetchRequest::get("/api/coupons")).await;

        assert_eq!(outcome.source, PayloadSource::Default);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 3);
        assert_eq!(fetcher.response_cache.get("cache:coupons").await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_persisted_cache_is_not_served() {
        let storage = Arc::new(MemoryStore::new());
        let stale = CachedEnvelope {
            payload: vec!["OLD".to_string()],
            timestamp: chrono::Utc::now() - chrono::Duration::hours(30),
        };
        storage.set("cache:coupons", &serde_json::to_string(&stale).unwrap()).unwrap();

        let transport = ScriptedTransport::new(vec![]);
        let fetcher = fetcher(transport.clone(), storage);
        let outcome = fetcher.load(FetchRequest::get("/api/coupons")).await;

        assert_eq!(outcome.payload, vec!["WELCOME".to_string()]);
        assert!(outcome.message.unwrap().starts_with("Service unavailable"));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 3);
        assert!(fetcher.status().fallback_mode);
    }

    #[tokio::test(start_paused = true)]
    async fn test_validator_rejects_payload() {
        let transport = ScriptedTransport::new(vec![Ok(FetchResponse::json_ok(&json!([])))]);
        let fetcher = fetcher(transport, Arc::new(MemoryStore::new()))
            .with_validator(|coupons: &Vec<String>| {
                if coupons.is_empty() {
                    Err("no coupons".to_string())
                } else {
                    Ok(())
                }
            });
        let options = fetcher.options().clone().with_max_retries(0);
        let fetcher = ResilientFetcher { options, ..fetcher };

        let outcome = fetcher.load(FetchRequest::get("/api/coupons")).await;
        assert!(outcome.fallback_mode);
        assert_eq!(outcome.attempts, 1);
        let state = fetcher.capture.store().snapshot();
        assert_eq!(state.global_errors[0].error.kind, FailureKind::Validation);
    }
}
