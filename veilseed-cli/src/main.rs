use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::{info, warn};
use veilseed_core::config::Config;
use veilseed_core::logging::{init_logging_with_config, LogConfig, LogLevel};
use veilseed_core::shutdown::install_signal_handlers;
use veilseed_core::{DetachedEngine, Session};

#[derive(Parser, Debug)]
#[command(name = "veilseed")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file (TOML). Defaults apply to absent keys.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override the configured log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Enable JSON formatted logging
    #[arg(long, global = true)]
    json_logs: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Parser, Debug)]
enum Command {
    /// Start a node and run until SIGINT/SIGTERM or POST /shutdown
    Run,

    /// Validate the configuration and print the effective values
    CheckConfig {
        /// Print a single key, e.g. tunnel_community/min_circuits
        #[arg(long)]
        key: Option<String>,
    },
}

fn load_config(args: &Args) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => Config::default(),
    };
    config.apply_env().context("applying environment overrides")?;
    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }
    if args.json_logs {
        config.logging.json_format = true;
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;

    let log_config = LogConfig::try_from(&config.logging).unwrap_or_else(|e| {
        eprintln!("Invalid logging configuration ({}), using 'info'", e);
        LogConfig::new(LogLevel::Info)
    });
    init_logging_with_config(log_config)?;

    match args.command.unwrap_or(Command::Run) {
        Command::Run => run(config).await,
        Command::CheckConfig { key } => {
            let value = match key {
                Some(key) => config.get(&key)?,
                None => serde_json::to_value(&config)?,
            };
            println!("{}", serde_json::to_string_pretty(&value)?);
            Ok(())
        }
    }
}

async fn run(config: Config) -> Result<()> {
    veilseed_core::metrics::init_metrics();

    let mut session = Session::new(config, Box::new(DetachedEngine::new()))?;
    install_signal_handlers(session.shutdown_handle()).context("installing signal handlers")?;

    info!("veilseed starting");
    if let Err(e) = session.run().await {
        warn!(error = %e, "veilseed stopped with errors");
        return Err(e.into());
    }

    info!("veilseed finished");
    Ok(())
}
