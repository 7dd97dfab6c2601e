use anyhow::{Context, Result};
use resilience_engine::{ErrorCategory, ResilienceConfig, Severity};
use serde::Deserialize;
use std::path::PathBuf;

use super::engine_for_command;

/// One recorded failure. Unit failures carry `unit`; the rest are
/// free-form reports under `category`.
#[derive(Debug, Deserialize)]
pub struct ReplayEntry {
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub category: Option<ErrorCategory>,
    pub message: String,
    #[serde(default)]
    pub severity: Option<Severity>,
    #[serde(default)]
    pub details: Option<serde_json::Value>,
}

pub struct ReplayCommand {
    pub file: PathBuf,
    pub recover: bool,
}

impl ReplayCommand {
    pub async fn execute(&self, config: &ResilienceConfig) -> Result<()> {
        let raw = std::fs::read_to_string(&self.file)
            .with_context(|| format!("Failed to read {}", self.file.display()))?;
        let entries: Vec<ReplayEntry> = serde_json::from_str(&raw)
            .with_context(|| format!("{} is not a JSON array of failures", self.file.display()))?;

        let engine = engine_for_command(config)?;
        for entry in entries {
            match &entry.unit {
                Some(unit) => {
                    if self.recover {
                        if let Some(result) = engine.report_and_recover(unit, entry.message, entry.severity).await {
                            eprintln!(
                                "🛠️  {unit}: {} ({})",
                                result.message,
                                result.strategy_id.as_deref().unwrap_or("no strategy")
                            );
                        }
                    } else {
                        engine.report_unit_error(unit, entry.message, entry.severity);
                    }
                }
                None => {
                    let category = entry.category.unwrap_or(ErrorCategory::Script);
                    engine.report_error(category, entry.message, entry.details);
                }
            }
        }

        println!("{}", serde_json::to_string_pretty(&engine.generate_report())?);
        Ok(())
    }
}
