use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::signals::{EngineSignal, SignalBus};
use crate::error::EngineError;
use crate::store::ErrorStore;

/// Key used for reloads not tied to a unit
pub const APPLICATION_UNIT: &str = "application";

/// Delayed, cancellable full reloads, at most one pending per unit.
///
/// When the delay elapses the reload is requested only if the unit is still
/// in error; otherwise it is cancelled.
#[derive(Debug, Clone)]
pub struct ReloadScheduler {
    pending: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
    store: ErrorStore,
    signals: SignalBus,
    delay: Duration,
}

impl ReloadScheduler {
    pub fn new(store: ErrorStore, signals: SignalBus, delay: Duration) -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
            store,
            signals,
            delay,
        }
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<String, JoinHandle<()>>> {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn is_pending(&self, unit: &str) -> bool {
        self.pending().get(unit).is_some_and(|handle| !handle.is_finished())
    }

    /// Returns `Ok(false)` when a reload for `unit` is already pending
    pub fn schedule(&self, unit: &str) -> Result<bool, EngineError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| EngineError::NotInitialized)?;
        let mut pending = self.pending();
        if pending.get(unit).is_some_and(|handle| !handle.is_finished()) {
            return Ok(false);
        }

        let scheduler = self.clone();
        let key = unit.to_string();
        let handle = runtime.spawn(async move {
            tokio::time::sleep(scheduler.delay).await;
            scheduler.pending().remove(&key);
            let still_failing = if key == APPLICATION_UNIT {
                scheduler.store.snapshot().active_errors().next().is_some()
            } else {
                scheduler.store.is_unit_in_error(&key)
            };
            if still_failing {
                warn!(unit = %key, "Reload delay elapsed; requesting full reload");
                scheduler.signals.send(EngineSignal::ReloadRequested { unit: key });
            } else {
                info!(unit = %key, "Errors cleared before reload; reload cancelled");
                scheduler.signals.send(EngineSignal::ReloadCancelled { unit: key });
            }
        });
        pending.insert(unit.to_string(), handle);
        drop(pending);

        self.signals.send(EngineSignal::ReloadScheduled {
            unit: unit.to_string(),
            delay_ms: self.delay.as_millis() as u64,
        });
        Ok(true)
    }

    /// Cancel a pending reload; returns whether one was pending
    pub fn cancel(&self, unit: &str) -> bool {
        let Some(handle) = self.pending().remove(unit) else {
            return false;
        };
        let was_pending = !handle.is_finished();
        handle.abort();
        if was_pending {
            info!(unit, "Pending reload cancelled");
            self.signals.send(EngineSignal::ReloadCancelled { unit: unit.to_string() });
        }
        was_pending
    }

    pub fn cancel_all(&self) -> usize {
        let units: Vec<String> = self.pending().keys().cloned().collect();
        units.iter().filter(|unit| self.cancel(unit)).count()
    }
}
