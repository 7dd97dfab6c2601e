use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use resilience_engine::ConsoleLevel;

pub mod commands;

#[derive(Parser)]
#[command(name = "resilience-engine")]
#[command(about = "Failure capture, classification and self-healing toolkit")]
#[command(long_about = "Classifies failures the way the resilience engine does, exercises the resilient \
                       fetch pattern against live endpoints, and replays recorded failures into a \
                       diagnostic report.")]
pub struct Cli {
    /// Log level (overridden by RUST_LOG)
    #[arg(long, global = true, help = "Log level written to stderr")]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Clone, Copy, ValueEnum)]
pub enum LevelArg {
    Error,
    Warn,
    Info,
}

impl From<LevelArg> for ConsoleLevel {
    fn from(level: LevelArg) -> Self {
        match level {
            LevelArg::Error => ConsoleLevel::Error,
            LevelArg::Warn => ConsoleLevel::Warn,
            LevelArg::Info => ConsoleLevel::Info,
        }
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Classify an error message or an HTTP exchange
    Classify {
        /// Error text to classify
        text: Option<String>,
        /// Console level the text was emitted at
        #[arg(long, value_enum, default_value = "error")]
        level: LevelArg,
        /// Classify an HTTP exchange with this status instead of text
        #[arg(long, help = "HTTP status code of the exchange")]
        status: Option<u16>,
        /// Request URL of the exchange
        #[arg(long, default_value = "/api/data")]
        url: String,
        /// Declared response content type
        #[arg(long)]
        content_type: Option<String>,
        /// Print the diagnostic as JSON
        #[arg(long)]
        json: bool,
    },
    /// Load a URL through the resilient fetch pattern
    Fetch {
        url: String,
        /// Retries after the first attempt
        #[arg(long, help = "Override the configured retry count")]
        retries: Option<u32>,
        /// Persisted cache key for the last-known-good payload
        #[arg(long, default_value = "cache:cli")]
        cache_key: String,
        /// Print the diagnostic report after a degraded load
        #[arg(long)]
        report: bool,
    },
    /// Replay recorded failures and print the resulting diagnostic report
    Replay {
        /// JSON file holding an array of failures
        file: PathBuf,
        /// Run one recovery pass after each unit failure
        #[arg(long)]
        recover: bool,
    },
    /// Print the effective configuration as TOML
    Config,
}
