use anyhow::Result;
use resilience_engine::ResilienceConfig;

pub struct ConfigCommand {
    config: ResilienceConfig,
}

impl ConfigCommand {
    pub fn new(config: ResilienceConfig) -> Self {
        Self { config }
    }

    pub fn execute(&self) -> Result<()> {
        let rendered = toml::to_string_pretty(&self.config)?;
        println!("# Effective configuration (defaults < resilience.toml < .resilience-rc < RESILIENCE_*)");
        println!("{rendered}");
        Ok(())
    }
}
