use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

/// Side-effect notifications emitted by recovery strategies
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum EngineSignal {
    /// Session artifacts were cleared; clients should re-authenticate
    AuthReset { unit: Option<String> },
    CachesPurged { count: usize },
    StoragePurged { keys: Vec<String> },
    ReloadScheduled { unit: String, delay_ms: u64 },
    /// The reload delay elapsed; the host should reload now
    ReloadRequested { unit: String },
    ReloadCancelled { unit: String },
}

#[derive(Debug, Clone)]
pub struct SignalBus {
    sender: broadcast::Sender<EngineSignal>,
}

impl Default for SignalBus {
    fn default() -> Self {
        Self::new(64)
    }
}

impl SignalBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineSignal> {
        self.sender.subscribe()
    }

    pub fn send(&self, signal: EngineSignal) {
        debug!(signal = ?signal, "Engine signal");
        // No receivers is fine
        let _ = self.sender.send(signal);
    }
}
