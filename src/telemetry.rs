use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

/// Initialize structured logging.
///
/// `RUST_LOG` overrides `level` when set. Calling this more than once keeps
/// the first subscriber.
pub fn init_telemetry(level: &str, json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(level))?;

    let result = if json {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(true)
                    .with_writer(std::io::stderr),
            )
            .with(filter)
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .with(filter)
            .try_init()
    };

    if result.is_ok() {
        tracing::debug!(json, level, "Resilience telemetry initialized");
    }
    Ok(())
}

/// Generate a correlation ID for linking a recovery attempt to its log lines
pub fn generate_correlation_id() -> String {
    Uuid::new_v4().to_string()
}

/// Span wrapping one recovery attempt
pub fn create_recovery_span(unit: Option<&str>, strategy: Option<&str>, correlation_id: &str) -> tracing::Span {
    tracing::info_span!(
        "recovery_attempt",
        unit.name = unit,
        strategy.id = strategy,
        correlation.id = correlation_id,
    )
}

/// Span wrapping one resilient fetch
pub fn create_fetch_span(url: &str, cache_key: &str) -> tracing::Span {
    tracing::info_span!("resilient_fetch", url = url, cache.key = cache_key)
}

pub fn shutdown_telemetry() {
    tracing::debug!("Resilience telemetry shutdown complete");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_correlation_ids_are_unique() {
        assert_ne!(generate_correlation_id(), generate_correlation_id());
    }

    #[test]
    fn test_init_twice_is_harmless() {
        init_telemetry("warn", true).unwrap();
        init_telemetry("debug", false).unwrap();
    }
}
