//! sactl - service runner and bus CLI for the smart-assistant modules
//!
//! Subcommands:
//! - `sactl publish <topic> <type> <json>` - Publish one event
//! - `sactl listen <filter>...` - Print events matching the filters
//! - `sactl heartbeat` - Send health heartbeats for a module
//! - `sactl run` - Run the template service
//! - `sactl config` - Show the effective configuration

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

mod commands;
mod service;
mod shutdown;
mod telemetry;

#[derive(Parser)]
#[command(name = "sactl")]
#[command(about = "Service runner and event bus CLI for the smart assistant")]
#[command(version)]
struct Cli {
    /// Config file used instead of ./smart-assistant.toml
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Publish a single event
    Publish {
        /// Topic, e.g. sa/asr/text
        topic: String,

        /// Event type, e.g. asr.text
        event_type: String,

        /// JSON object payload
        json: String,

        /// Correlation id (a new one is generated when omitted)
        #[arg(long)]
        corr: Option<String>,

        /// Source module name
        #[arg(short, long, default_value = "sactl")]
        module: String,
    },

    /// Print every event matching the filters until interrupted
    Listen {
        /// Topic filters, `+` and `#` wildcards allowed
        #[arg(required = true)]
        filters: Vec<String>,

        /// Module name used for the client id
        #[arg(short, long, default_value = "sactl")]
        module: String,
    },

    /// Send health heartbeats until interrupted
    Heartbeat {
        /// Module the heartbeats are for
        #[arg(short, long, default_value = "sactl")]
        module: String,

        /// Seconds between heartbeats (defaults to system.heartbeat_interval_secs)
        #[arg(short, long)]
        interval: Option<u64>,
    },

    /// Run the template service until SIGINT or SIGTERM
    Run {
        /// Module name
        #[arg(short, long, default_value = "template")]
        module: String,
    },

    /// Show the effective configuration and its sources
    Config,
}

impl Commands {
    /// Module whose log file this command writes. One-shot commands only
    /// log to the terminal.
    fn log_module(&self) -> Option<&str> {
        match self {
            Commands::Listen { module, .. }
            | Commands::Heartbeat { module, .. }
            | Commands::Run { module } => Some(module.as_str()),
            Commands::Publish { .. } | Commands::Config => None,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let (config, sources) = saconf::SaConfig::load_with_sources_from(cli.config.as_deref())
        .context("Failed to load configuration")?;
    let _log_guard = telemetry::init(&config.logging, cli.command.log_module())?;

    match cli.command {
        Commands::Publish {
            topic,
            event_type,
            json,
            corr,
            module,
        } => {
            commands::publish(&config, &module, &topic, &event_type, &json, corr).await?;
        }
        Commands::Listen { filters, module } => {
            commands::listen(&config, &module, &filters).await?;
        }
        Commands::Heartbeat { module, interval } => {
            let secs = interval.unwrap_or(config.system.heartbeat_interval_secs);
            commands::heartbeat(&config, &module, Duration::from_secs(secs)).await?;
        }
        Commands::Run { module } => {
            service::run(&config, &module).await?;
        }
        Commands::Config => {
            commands::show_config(&config, &sources)?;
        }
    }

    Ok(())
}
