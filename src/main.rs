use anyhow::Result;
use clap::Parser;

mod cli;

use cli::commands::{
    classify::ClassifyCommand, config::ConfigCommand, fetch::FetchCommand, replay::ReplayCommand, show_usage,
};
use cli::{Cli, Commands};
use resilience_engine::{init_telemetry, shutdown_telemetry, ResilienceConfig};

fn main() -> Result<()> {
    let cli = Cli::parse();

    ResilienceConfig::load_env_file()?;
    let config = ResilienceConfig::load()?;
    let level = cli
        .log_level
        .clone()
        .unwrap_or_else(|| config.observability.log_level.clone());
    init_telemetry(&level, config.observability.json_logs)?;

    let result = match cli.command {
        None => show_usage(),
        Some(Commands::Classify {
            text,
            level,
            status,
            url,
            content_type,
            json,
        }) => ClassifyCommand {
            text,
            level: level.into(),
            status,
            url,
            content_type,
            json,
        }
        .execute(),
        Some(Commands::Fetch {
            url,
            retries,
            cache_key,
            report,
        }) => tokio::runtime::Runtime::new()?.block_on(async {
            FetchCommand {
                url,
                retries,
                cache_key,
                report,
            }
            .execute(&config)
            .await
        }),
        Some(Commands::Replay { file, recover }) => tokio::runtime::Runtime::new()?
            .block_on(async { ReplayCommand { file, recover }.execute(&config).await }),
        Some(Commands::Config) => ConfigCommand::new(config.clone()).execute(),
    };

    shutdown_telemetry();
    result
}
