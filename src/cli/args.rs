use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::infrastructure::logging::LogFormat;

#[derive(Parser, Debug)]
#[command(
    name = "batchcore",
    version,
    about = "Run command batches with bounded concurrency, retries and a TTL result cache"
)]
pub struct Args {
    /// Config file (.toml, .yaml, .yml or .json)
    #[arg(short, long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Log level for batchcore targets (overridden by RUST_LOG)
    #[arg(long, global = true, value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Log format: pretty, compact or json
    #[arg(long, global = true, value_name = "FORMAT")]
    pub log_format: Option<LogFormat>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run shell commands as one batch
    Run {
        /// Shell command to run; repeat for more tasks
        #[arg(long = "cmd", value_name = "CMD", required = true)]
        commands: Vec<String>,

        /// Serve repeated commands from the result cache
        #[arg(long, default_value_t = false)]
        cache: bool,

        /// Override the configured worker count
        #[arg(short = 'j', long, value_name = "N")]
        workers: Option<usize>,
    },

    /// Inspect or maintain the cache directory
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },

    /// Print a memory sample, optionally watching for pressure
    Memory {
        /// Sampling interval in milliseconds
        #[arg(long, value_name = "MS")]
        watch: Option<u64>,

        /// Number of samples to take while watching
        #[arg(long, value_name = "N", default_value_t = 10)]
        ticks: u32,
    },
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheAction {
    /// Entry count, size and expired entries
    Stats,
    /// Delete expired and corrupt entries
    Cleanup,
    /// Delete every entry
    Clear,
}
