use anyhow::Result;
use resilience_engine::{ResilienceConfig, ResilienceEngine};

pub mod classify;
pub mod config;
pub mod fetch;
pub mod replay;

/// Engine for a one-shot command: no panic hook, no background sweeps
pub fn engine_for_command(config: &ResilienceConfig) -> Result<ResilienceEngine> {
    let mut config = config.clone();
    config.capture.install_panic_hook = false;
    Ok(ResilienceEngine::new(config)?)
}

pub fn show_usage() -> Result<()> {
    println!("🛟 Resilience Engine - failure capture and self-healing");
    println!();
    println!("Commands:");
    println!("  🔎 resilience-engine classify <text>    # Categorize an error message");
    println!("  🌐 resilience-engine fetch <url>        # Load through retry, cache and fallback");
    println!("  📼 resilience-engine replay <file>      # Replay failures into a report");
    println!("  ⚙️  resilience-engine config             # Show effective configuration");
    println!();
    println!("💡 Try: resilience-engine classify \"foo is not defined\"");
    Ok(())
}
