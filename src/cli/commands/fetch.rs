use anyhow::Result;
use resilience_engine::{FetchRequest, PayloadSource, ResilienceConfig};
use serde_json::Value;

use super::engine_for_command;

const CLI_UNIT: &str = "cli-fetch";

pub struct FetchCommand {
    pub url: String,
    pub retries: Option<u32>,
    pub cache_key: String,
    pub report: bool,
}

impl FetchCommand {
    pub async fn execute(&self, config: &ResilienceConfig) -> Result<()> {
        let mut config = config.clone();
        if let Some(retries) = self.retries {
            config.fetch.max_retries = retries;
        }
        let engine = engine_for_command(&config)?;
        let fetcher = engine.fetcher(CLI_UNIT, &self.cache_key, Value::Null);

        println!("🌐 Loading {} (up to {} attempts)...", self.url, config.fetch.max_retries + 1);
        let outcome = fetcher.load(FetchRequest::get(&self.url)).await;

        let source = match outcome.source {
            PayloadSource::Network => "network",
            PayloadSource::ResponseCache => "response cache",
            PayloadSource::PersistedCache => "saved copy",
            PayloadSource::Default => "default payload",
        };
        if outcome.fallback_mode {
            println!("⚠️  Degraded after {} attempts; serving {source}", outcome.attempts);
        } else {
            println!("✅ Loaded from {source} ({} attempts)", outcome.attempts);
        }
        if let Some(message) = &outcome.message {
            println!("   💬 {message}");
        }
        println!("   🔁 Final state: {}", outcome.phase);
        println!("{}", serde_json::to_string_pretty(&outcome.payload)?);

        if self.report && outcome.fallback_mode {
            println!();
            println!("{}", serde_json::to_string_pretty(&engine.generate_report())?);
        }
        Ok(())
    }
}
