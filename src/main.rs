use batchcore::cli::commands::{handle_cache, handle_memory, handle_run};
use batchcore::cli::{Args, Command};
use batchcore::infrastructure::config::CoreConfig;
use batchcore::infrastructure::logging::setup_logging;
use clap::Parser;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let mut config = CoreConfig::load_or_default(args.config.as_deref())?;

    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }
    if let Some(format) = args.log_format {
        config.logging.format = format;
    }
    setup_logging(&config.logging)?;

    match &args.command {
        Command::Run {
            commands,
            cache,
            workers,
        } => handle_run(&config, commands, *cache, *workers).await,
        Command::Cache { action } => handle_cache(&config, *action).await,
        Command::Memory { watch, ticks } => handle_memory(&config, *watch, *ticks).await,
    }
}
