use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::info;

use crate::cache::{CacheStore, CleanupReport};
use crate::cli::args::CacheAction;
use crate::executor::{ProgressCallback, Task, TaskExecutor};
use crate::infrastructure::config::CoreConfig;
use crate::infrastructure::periodic::PeriodicHandle;
use crate::memory::{MemoryAdvisor, MemorySample};

/// Captured result of one shell command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandOutput {
    pub command: String,
    pub stdout: String,
    pub stderr: String,
}

/// Build a task that runs `command` through the platform shell.
///
/// A non-zero exit status fails the attempt, so it is retried like any other
/// error.
pub fn shell_task(command: &str) -> Task<CommandOutput> {
    let command = command.to_string();
    let label = command.clone();

    Task::new(move || {
        let command = command.clone();
        async move {
            let output = shell(&command)
                .output()
                .await
                .with_context(|| format!("failed to spawn `{command}`"))?;

            let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
            let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

            if !output.status.success() {
                anyhow::bail!(
                    "`{}` exited with {:?}: {}",
                    command,
                    output.status.code(),
                    stderr.trim()
                );
            }

            Ok(CommandOutput {
                command,
                stdout,
                stderr,
            })
        }
    })
    .with_label(label)
}

fn shell(command: &str) -> Command {
    let mut cmd = if cfg!(windows) {
        let mut cmd = Command::new("cmd");
        cmd.arg("/C");
        cmd
    } else {
        let mut cmd = Command::new("sh");
        cmd.arg("-c");
        cmd
    };
    cmd.arg(command).kill_on_drop(true);
    cmd
}

pub async fn handle_run(
    config: &CoreConfig,
    commands: &[String],
    use_cache: bool,
    workers: Option<usize>,
) -> anyhow::Result<()> {
    let mut policy = config.executor.clone();
    if let Some(workers) = workers {
        policy.max_workers = workers;
    }
    let executor = TaskExecutor::new(policy)?;

    let store = if use_cache {
        let store = Arc::new(CacheStore::new(config.cache.clone()));
        store.init().await;
        Some(store)
    } else {
        None
    };
    let sweeper = store.as_ref().and_then(start_cleanup);

    let tasks: Vec<Task<CommandOutput>> = commands
        .iter()
        .map(|command| {
            let task = shell_task(command);
            match &store {
                Some(store) => task.cached(Arc::clone(store), format!("cmd:{command}")),
                None => task,
            }
        })
        .collect();

    let progress: ProgressCallback = Arc::new(|completed, total| {
        eprintln!("[{completed}/{total}] done");
    });

    let start = Instant::now();
    let result = executor.execute_parallel(tasks, Some(progress)).await;
    let elapsed = start.elapsed();

    if let Some(sweeper) = sweeper {
        sweeper.cancel();
    }

    let stats = executor.stats().await;
    info!(
        elapsed_ms = elapsed.as_millis() as u64,
        attempts = stats.total_attempts,
        retries = stats.retried_attempts,
        "run finished"
    );

    match result {
        Ok(outputs) => {
            for output in outputs {
                print_output(&output);
            }
            println!("✅ {} command(s) succeeded in {:.2?}", commands.len(), elapsed);
            Ok(())
        }
        Err(failed) => {
            for (_, output) in failed.successes() {
                print_output(output);
            }
            for (index, err) in failed.failures() {
                eprintln!("❌ #{}: {}", index + 1, err);
            }
            Err(anyhow::anyhow!("{} of {} commands failed", failed.failed(), failed.total()))
        }
    }
}

/// Background sweep for a store whose config asks for one.
pub fn start_cleanup(store: &Arc<CacheStore>) -> Option<PeriodicHandle> {
    if !store.is_enabled() {
        return None;
    }
    let interval = store.config().cleanup_interval()?;
    Some(store.spawn_cleanup(interval))
}

fn print_output(output: &CommandOutput) {
    println!("$ {}", output.command);
    if !output.stdout.is_empty() {
        print!("{}", output.stdout);
        if !output.stdout.ends_with('\n') {
            println!();
        }
    }
}

pub async fn handle_cache(config: &CoreConfig, action: CacheAction) -> anyhow::Result<()> {
    let store = CacheStore::new(config.cache.clone());
    if !store.is_enabled() {
        println!("Cache is disabled in the current configuration");
        return Ok(());
    }

    let directory = store.config().directory.display().to_string();
    match action {
        CacheAction::Stats => {
            let stats = store.stats().await;
            println!("📦 Cache directory: {directory}");
            println!("  entries: {}", stats.entries);
            println!("  size:    {} bytes", stats.total_bytes);
            println!("  expired: {}", stats.expired);
        }
        CacheAction::Cleanup => {
            let CleanupReport {
                scanned,
                expired_removed,
                corrupt_removed,
                temp_removed,
            } = store.cleanup().await;
            println!(
                "🧹 Scanned {scanned} entries in {directory}: removed {expired_removed} expired, {corrupt_removed} corrupt and {temp_removed} stale temp files"
            );
        }
        CacheAction::Clear => {
            let removed = store.clear().await;
            println!("🗑  Removed {removed} entries from {directory}");
        }
    }
    Ok(())
}

pub async fn handle_memory(config: &CoreConfig, watch: Option<u64>, ticks: u32) -> anyhow::Result<()> {
    let advisor = Arc::new(MemoryAdvisor::new(config.memory.clone())?);
    print_sample(&advisor.get_memory_stats(), advisor.pressure_ratio());

    let Some(interval_ms) = watch else {
        return Ok(());
    };

    let interval = Duration::from_millis(interval_ms.max(1));
    let monitor = advisor.monitor_memory(interval);

    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    for _ in 0..ticks {
        ticker.tick().await;
        print_sample(&advisor.get_memory_stats(), advisor.pressure_ratio());
    }

    monitor.cancel();
    Ok(())
}

fn print_sample(sample: &MemorySample, pressure: Option<f64>) {
    let flag = if sample.should_reclaim { "⚠️  reclaim advised" } else { "ok" };
    print!(
        "heap used {:.1} MB / total {:.1} MB, rss {:.1} MB [{}]",
        sample.heap_used_mb, sample.heap_total_mb, sample.rss_mb, flag
    );
    match pressure {
        Some(ratio) => println!(", pressure {:.0}%", ratio * 100.0),
        None => println!(),
    }
}
