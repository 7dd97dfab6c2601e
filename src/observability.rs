use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{info, warn};

/// Engine activity counters
#[derive(Debug, Default)]
pub struct ResilienceMetrics {
    pub captures: AtomicU64,
    pub recoveries_attempted: AtomicU64,
    pub recoveries_succeeded: AtomicU64,
    pub recoveries_rejected: AtomicU64,
    pub fetch_attempts: AtomicU64,
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
    pub fallbacks_served: AtomicU64,
}

impl ResilienceMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_capture(&self) {
        self.captures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_recovery_attempt(&self) {
        self.recoveries_attempted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_recovery_success(&self) {
        self.recoveries_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    /// A recovery request refused because one was already in flight
    pub fn record_recovery_rejected(&self) {
        self.recoveries_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fetch_attempt(&self) {
        self.fetch_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fallback_served(&self) {
        self.fallbacks_served.fetch_add(1, Ordering::Relaxed);
        warn!("Fallback payload served");
    }

    pub fn get_stats(&self) -> ResilienceStats {
        ResilienceStats {
            captures: self.captures.load(Ordering::Relaxed),
            recoveries_attempted: self.recoveries_attempted.load(Ordering::Relaxed),
            recoveries_succeeded: self.recoveries_succeeded.load(Ordering::Relaxed),
            recoveries_rejected: self.recoveries_rejected.load(Ordering::Relaxed),
            fetch_attempts: self.fetch_attempts.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            fallbacks_served: self.fallbacks_served.load(Ordering::Relaxed),
        }
    }

    pub fn log_stats(&self) {
        let stats = self.get_stats();
        info!(
            "Resilience metrics: captures={}, recoveries={}/{} (rejected {}), fetch_attempts={}, cache_hits={}, cache_misses={}, fallbacks={}",
            stats.captures,
            stats.recoveries_succeeded,
            stats.recoveries_attempted,
            stats.recoveries_rejected,
            stats.fetch_attempts,
            stats.cache_hits,
            stats.cache_misses,
            stats.fallbacks_served
        );
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct ResilienceStats {
    pub captures: u64,
    pub recoveries_attempted: u64,
    pub recoveries_succeeded: u64,
    pub recoveries_rejected: u64,
    pub fetch_attempts: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub fallbacks_served: u64,
}

/// Time an operation and log its duration on drop
pub struct OperationTimer {
    operation: String,
    start: Instant,
}

impl OperationTimer {
    pub fn new(operation: &str) -> Self {
        Self {
            operation: operation.to_string(),
            start: Instant::now(),
        }
    }
}

impl Drop for OperationTimer {
    fn drop(&mut self) {
        info!(
            operation = %self.operation,
            duration_ms = self.start.elapsed().as_millis(),
            "Operation completed"
        );
    }
}

#[macro_export]
macro_rules! time_operation {
    ($operation:expr) => {
        let _timer = $crate::observability::OperationTimer::new($operation);
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let metrics = ResilienceMetrics::new();
        metrics.record_capture();
        metrics.record_capture();
        metrics.record_recovery_attempt();
        metrics.record_recovery_rejected();
        metrics.record_cache_miss();
        metrics.record_fallback_served();

        let stats = metrics.get_stats();
        assert_eq!(stats.captures, 2);
        assert_eq!(stats.recoveries_attempted, 1);
        assert_eq!(stats.recoveries_succeeded, 0);
        assert_eq!(stats.recoveries_rejected, 1);
        assert_eq!(stats.cache_misses, 1);
        assert_eq!(stats.fallbacks_served, 1);
    }
}
