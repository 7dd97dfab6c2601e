//! Error State Store: the single source of truth for application health.
//!
//! All mutations go through [`ErrorStore::dispatch`], which applies the pure
//! [`reduce`] function under one lock, so concurrent captures are applied in
//! dispatch order and never interleave partially.

pub mod policy;
pub mod reducer;
pub mod state;

pub use policy::{EscalationPolicy, HealthThresholds, StorePolicy};
pub use reducer::{compute_system_health, reduce, StoreAction, UnitField};
pub use state::{ApplicationHealthState, ErrorRecord, FallbackMode, UnitHealthState};

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::diagnostics::{DiagnosticResult, SystemHealth};
use crate::error::EngineError;

/// Callback invoked with the full state after every change
pub type Listener = Arc<dyn Fn(&ApplicationHealthState) + Send + Sync>;

type ListenerMap = Mutex<BTreeMap<u64, Listener>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Disposer returned by [`ErrorStore::subscribe`]; dropping it unsubscribes
#[must_use = "dropping a Subscription immediately unsubscribes the listener"]
pub struct Subscription {
    id: u64,
    listeners: Weak<ListenerMap>,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(listeners) = self.listeners.upgrade() {
            lock(&listeners).remove(&self.id);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

struct StoreInner {
    state: Mutex<ApplicationHealthState>,
    policy: StorePolicy,
    watch_tx: watch::Sender<Arc<ApplicationHealthState>>,
    listeners: Arc<ListenerMap>,
    next_listener_id: AtomicU64,
    /// Snapshots awaiting delivery, queued in version order
    pending: Mutex<VecDeque<Arc<ApplicationHealthState>>>,
    delivering: AtomicBool,
    maintenance: Mutex<Vec<JoinHandle<()>>>,
}

/// Cloneable handle to the store; clones share the same state
#[derive(Clone)]
pub struct ErrorStore {
    inner: Arc<StoreInner>,
}

impl std::fmt::Debug for ErrorStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.snapshot();
        f.debug_struct("ErrorStore")
            .field("version", &state.version)
            .field("system_health", &state.system_health)
            .field("errors", &state.global_errors.len())
            .finish()
    }
}

impl Default for ErrorStore {
    fn default() -> Self {
        Self::new(StorePolicy::default())
    }
}

impl ErrorStore {
    pub fn new(policy: StorePolicy) -> Self {
        let (watch_tx, _) = watch::channel(Arc::new(ApplicationHealthState::default()));
        Self {
            inner: Arc::new(StoreInner {
                state: Mutex::new(ApplicationHealthState::default()),
                policy,
                watch_tx,
                listeners: Arc::new(Mutex::new(BTreeMap::new())),
                next_listener_id: AtomicU64::new(1),
                pending: Mutex::new(VecDeque::new()),
                delivering: AtomicBool::new(false),
                maintenance: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn policy(&self) -> &StorePolicy {
        &self.inner.policy
    }

    /// Apply one action and notify subscribers with the resulting state
    pub fn dispatch(&self, action: StoreAction) -> Arc<ApplicationHealthState> {
        let action_name = action.name();
        let (previous_health, snapshot) = {
            let mut state = lock(&self.inner.state);
            let previous_health = state.system_health;
            let current = std::mem::take(&mut *state);
            *state = reduce(current, action, &self.inner.policy);
            let snapshot = Arc::new(state.clone());
            // Published under the lock so watchers see versions in order
            self.inner.watch_tx.send_replace(snapshot.clone());
            lock(&self.inner.pending).push_back(snapshot.clone());
            (previous_health, snapshot)
        };

        debug!(action = action_name, version = snapshot.version, "Store action applied");
        if snapshot.system_health != previous_health {
            if snapshot.system_health > previous_health {
                warn!(
                    from = %previous_health,
                    to = %snapshot.system_health,
                    active_errors = snapshot.active_errors().count(),
                    "System health worsened"
                );
            } else {
                info!(from = %previous_health, to = %snapshot.system_health, "System health improved");
            }
        }

        self.deliver_pending();
        snapshot
    }

    /// Drain queued snapshots to listeners. Only one caller delivers at a
    /// time, so listeners see versions in increasing order; a dispatch made
    /// while another thread (or a listener) is delivering is handed to that
    /// deliverer instead.
    fn deliver_pending(&self) {
        loop {
            if self
                .inner
                .delivering
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return;
            }
            loop {
                let next = lock(&self.inner.pending).pop_front();
                let Some(snapshot) = next else { break };
                self.notify(&snapshot);
            }
            self.inner.delivering.store(false, Ordering::Release);
            if lock(&self.inner.pending).is_empty() {
                return;
            }
        }
    }

    fn notify(&self, snapshot: &ApplicationHealthState) {
        let listeners: Vec<Listener> = lock(&self.inner.listeners).values().cloned().collect();
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(snapshot))).is_err() {
                warn!(version = snapshot.version, "Store listener panicked; continuing");
            }
        }
    }

    /// Register a listener called after every state change.
    ///
    /// Calls are serialized and arrive in version order. A listener that
    /// dispatches sees the resulting state in a later call, after it returns.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&ApplicationHealthState) + Send + Sync + 'static,
    {
        let id = self.inner.next_listener_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.inner.listeners).insert(id, Arc::new(listener));
        Subscription {
            id,
            listeners: Arc::downgrade(&self.inner.listeners),
        }
    }

    pub fn listener_count(&self) -> usize {
        lock(&self.inner.listeners).len()
    }

    /// Async alternative to [`subscribe`](Self::subscribe): always holds the latest state
    pub fn watch(&self) -> watch::Receiver<Arc<ApplicationHealthState>> {
        self.inner.watch_tx.subscribe()
    }

    pub fn snapshot(&self) -> ApplicationHealthState {
        lock(&self.inner.state).clone()
    }

    /// Record a classified failure, attributed to a unit when one is given
    pub fn record_error(&self, unit_name: Option<&str>, diagnostic: DiagnosticResult) -> ErrorRecord {
        let record = ErrorRecord {
            id: Uuid::new_v4().to_string(),
            unit_name: unit_name.map(str::to_string),
            severity: diagnostic.severity,
            timestamp: Utc::now(),
            error: diagnostic,
            recovered: false,
            retry_count: 0,
        };
        let snapshot = self.dispatch(StoreAction::AddError(record.clone()));
        snapshot
            .global_errors
            .iter()
            .rev()
            .find(|stored| stored.id == record.id)
            .cloned()
            .unwrap_or(record)
    }

    pub fn clear_unit(&self, unit_name: &str) {
        self.dispatch(StoreAction::ClearUnit {
            unit: unit_name.to_string(),
        });
    }

    pub fn clear_all(&self) {
        self.dispatch(StoreAction::ClearAll);
    }

    pub fn mark_recovered(&self, unit_name: &str) {
        self.dispatch(StoreAction::MarkRecovered {
            unit: unit_name.to_string(),
        });
    }

    pub fn set_unit_field(&self, unit_name: &str, field: UnitField) {
        self.dispatch(StoreAction::SetUnitField {
            unit: unit_name.to_string(),
            field,
        });
    }

    pub fn set_recovering(&self, unit_name: Option<&str>, recovering: bool) {
        self.dispatch(StoreAction::SetRecovering {
            unit: unit_name.map(str::to_string),
            recovering,
            at: Utc::now(),
        });
    }

    pub fn set_fallback_mode(&self, unit_name: Option<&str>, mode: FallbackMode) {
        self.dispatch(StoreAction::SetFallbackMode {
            unit: unit_name.map(str::to_string),
            mode,
        });
    }

    /// Current state of a unit; unknown units read as healthy defaults
    pub fn get_unit_state(&self, unit_name: &str) -> UnitHealthState {
        lock(&self.inner.state)
            .unit(unit_name)
            .cloned()
            .unwrap_or_default()
    }

    pub fn get_system_health(&self) -> SystemHealth {
        lock(&self.inner.state).system_health
    }

    pub fn is_unit_in_error(&self, unit_name: &str) -> bool {
        lock(&self.inner.state)
            .unit(unit_name)
            .map(|unit| unit.has_error)
            .unwrap_or(false)
    }

    /// Remove records older than the retention window
    pub fn prune_expired(&self, now: DateTime<Utc>) -> usize {
        let retention = chrono::Duration::from_std(self.inner.policy.retention)
            .unwrap_or_else(|_| chrono::Duration::minutes(5));
        let before = lock(&self.inner.state).global_errors.len();
        let snapshot = self.dispatch(StoreAction::Prune {
            cutoff: now - retention,
        });
        let removed = before.saturating_sub(snapshot.global_errors.len());
        if removed > 0 {
            info!(removed, remaining = snapshot.global_errors.len(), "Pruned expired error records");
        }
        removed
    }

    /// Start the periodic prune sweep and health poll.
    /// Requires a running tokio runtime.
    pub fn start_maintenance(&self) -> Result<(), EngineError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| EngineError::NotInitialized)?;
        let mut tasks = lock(&self.inner.maintenance);
        if !tasks.is_empty() {
            debug!("Store maintenance already running");
            return Ok(());
        }

        let weak = Arc::downgrade(&self.inner);
        let prune_interval = self.inner.policy.prune_interval;
        tasks.push(runtime.spawn(async move {
            let mut ticker = tokio::time::interval(prune_interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                ErrorStore { inner }.prune_expired(Utc::now());
            }
        }));

        let weak = Arc::downgrade(&self.inner);
        let poll_interval = self.inner.policy.health_poll_interval;
        tasks.push(runtime.spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                ErrorStore { inner }.poll_health();
            }
        }));

        info!(
            prune_interval_secs = prune_interval.as_secs(),
            poll_interval_secs = poll_interval.as_secs(),
            "Store maintenance started"
        );
        Ok(())
    }

    fn poll_health(&self) {
        let (stored, derived) = {
            let state = lock(&self.inner.state);
            (state.system_health, compute_system_health(&state, &self.inner.policy.health))
        };
        if stored != derived {
            warn!(stored = %stored, derived = %derived, "Stale system health detected; recomputing");
            self.dispatch(StoreAction::RecomputeHealth);
        } else {
            debug!(health = %stored, "Health poll");
        }
    }

    /// Cancel the periodic tasks started by [`start_maintenance`](Self::start_maintenance)
    pub fn stop_maintenance(&self) {
        let tasks: Vec<JoinHandle<()>> = lock(&self.inner.maintenance).drain(..).collect();
        if !tasks.is_empty() {
            for task in &tasks {
                task.abort();
            }
            info!(tasks = tasks.len(), "Store maintenance stopped");
        }
    }

    pub fn maintenance_running(&self) -> bool {
        lock(&self.inner.maintenance).iter().any(|task| !task.is_finished())
    }
}
