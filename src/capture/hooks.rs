//! Process-level failure sources: the panic hook (uncaught exceptions) and
//! supervised tasks (unhandled asynchronous failures).

use std::any::Any;
use std::fmt::Display;
use std::future::Future;
use std::sync::atomic::Ordering;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::{CaptureEvent, CaptureLayer};

tokio::task_local! {
    static SUPERVISED_UNIT: String;
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}

impl CaptureLayer {
    /// Install a process-wide panic hook that records panics.
    ///
    /// The previously installed hook still runs first, so the usual panic
    /// output is unchanged. Panics inside [`spawn_supervised`](Self::spawn_supervised)
    /// tasks are attributed to the task's unit. Installing twice is a no-op;
    /// [`disable`](Self::disable) turns the hook into a pass-through.
    pub fn install_panic_hook(&self) {
        if self.hook_installed.swap(true, Ordering::AcqRel) {
            debug!("Panic hook already installed");
            return;
        }
        let layer = self.clone();
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |panic_info| {
            previous(panic_info);
            let message = panic_message(panic_info.payload());
            let location = panic_info
                .location()
                .map(|location| format!("{}:{}", location.file(), location.line()));
            let unit = SUPERVISED_UNIT.try_with(|unit| unit.clone()).ok();
            layer.capture(unit.as_deref(), CaptureEvent::Panic { message, location });
        }));
        info!("Panic capture hook installed");
    }

    pub fn panic_hook_installed(&self) -> bool {
        self.hook_installed.load(Ordering::Acquire)
    }

    /// Spawn a task whose failure is captured instead of silently dropped.
    ///
    /// An `Err` output is recorded as a rejection against `unit`; a panic is
    /// recorded as a critical script failure. The returned handle yields the
    /// task's value, or `None` when it failed.
    pub fn spawn_supervised<F, T, E>(&self, unit: &str, future: F) -> JoinHandle<Option<T>>
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Display + Send + 'static,
    {
        let layer = self.clone();
        let unit = unit.to_string();
        let task = tokio::spawn(SUPERVISED_UNIT.scope(unit.clone(), future));

        tokio::spawn(async move {
            match task.await {
                Ok(Ok(value)) => Some(value),
                Ok(Err(error)) => {
                    layer.capture_rejection(Some(&unit), error.to_string());
                    None
                }
                Err(join_error) if join_error.is_panic() => {
                    // With the hook active the panic was already recorded
                    if !(layer.panic_hook_installed() && layer.is_enabled()) {
                        let message = panic_message(join_error.into_panic().as_ref());
                        layer.capture(Some(&unit), CaptureEvent::Panic { message, location: None });
                    }
                    None
                }
                Err(_) => {
                    debug!(unit = %unit, "Supervised task cancelled");
                    None
                }
            }
        })
    }
}
