//! Persisted key/value storage shared by independent clients.
//!
//! Values are plain strings. Readers go through [`read_validated`], which
//! discards entries that look like a markup page (a classic symptom of an
//! HTML error page being stored in place of a JSON payload).

mod file;

pub use file::FileStore;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;
use tracing::warn;

use crate::error::EngineError;

/// Keys recovery strategies are allowed to purge
pub const DEFAULT_PERSISTED_KEYS: &[&str] = &[
    "auth_session",
    "auth_token",
    "refresh_token",
    "user_profile",
    "cache:auth_session",
    "cache:coupons",
];

/// Keys holding session and authentication artifacts
pub const AUTH_KEYS: &[&str] = &["auth_session", "auth_token", "refresh_token", "user_profile"];

pub trait PersistentStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, EngineError>;
    fn set(&self, key: &str, value: &str) -> Result<(), EngineError>;
    /// Returns whether the key existed
    fn remove(&self, key: &str) -> Result<bool, EngineError>;
    fn keys(&self) -> Result<Vec<String>, EngineError>;
}

impl<S: PersistentStore + ?Sized> PersistentStore for std::sync::Arc<S> {
    fn get(&self, key: &str) -> Result<Option<String>, EngineError> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), EngineError> {
        (**self).set(key, value)
    }

    fn remove(&self, key: &str) -> Result<bool, EngineError> {
        (**self).remove(key)
    }

    fn keys(&self) -> Result<Vec<String>, EngineError> {
        (**self).keys()
    }
}

/// In-process store, used in tests and when no storage path is configured
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, String>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl PersistentStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, EngineError> {
        Ok(self.entries().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), EngineError> {
        self.entries().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<bool, EngineError> {
        Ok(self.entries().remove(key).is_some())
    }

    fn keys(&self) -> Result<Vec<String>, EngineError> {
        Ok(self.entries().keys().cloned().collect())
    }
}

/// Whether a stored value is a markup page rather than data
pub fn is_corrupted_markup(value: &str) -> bool {
    let head: String = value.trim_start().chars().take(16).collect::<String>().to_ascii_lowercase();
    head.starts_with("<html") || head.starts_with("<!doctype")
}

/// Read a key, discarding (and removing) corrupted markup values.
/// Storage errors read as absent.
pub fn read_validated(store: &dyn PersistentStore, key: &str) -> Option<String> {
    match store.get(key) {
        Ok(Some(value)) if is_corrupted_markup(&value) => {
            warn!(key, "Discarding corrupted markup value from persisted storage");
            if let Err(e) = store.remove(key) {
                warn!(key, error = %e, "Failed to remove corrupted entry");
            }
            None
        }
        Ok(value) => value,
        Err(e) => {
            warn!(key, error = %e, "Persisted storage read failed");
            None
        }
    }
}

/// `{ payload, timestamp }` wrapper for cached payloads
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedEnvelope<T> {
    pub payload: T,
    pub timestamp: DateTime<Utc>,
}

impl<T> CachedEnvelope<T> {
    pub fn new(payload: T) -> Self {
        Self {
            payload,
            timestamp: Utc::now(),
        }
    }

    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now.signed_duration_since(self.timestamp)
    }

    pub fn is_fresh(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        match chrono::Duration::from_std(ttl) {
            Ok(ttl) => {
                let age = self.age(now);
                age >= chrono::Duration::zero() && age <= ttl
            }
            Err(_) => true,
        }
    }
}

/// Read and decode an envelope; undecodable entries are removed
pub fn read_envelope<T: DeserializeOwned>(store: &dyn PersistentStore, key: &str) -> Option<CachedEnvelope<T>> {
    let raw = read_validated(store, key)?;
    match serde_json::from_str(&raw) {
        Ok(envelope) => Some(envelope),
        Err(e) => {
            warn!(key, error = %e, "Discarding undecodable cache entry");
            let _ = store.remove(key);
            None
        }
    }
}

pub fn write_envelope<T: Serialize>(store: &dyn PersistentStore, key: &str, payload: &T) -> Result<(), EngineError> {
    let envelope = CachedEnvelope {
        payload,
        timestamp: Utc::now(),
    };
    store.set(key, &serde_json::to_string(&envelope)?)
}
