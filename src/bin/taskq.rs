//! taskq CLI: run a dispatcher against a synthetic workload, or print the
//! effective configuration.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use taskq::config::Config;
use taskq::monitor::{MetricsSink, MonitorConfig, OtelSink, TracingSink};
use taskq::telemetry::{TelemetryConfig, init_telemetry};
use taskq::{Dispatcher, DispatcherConfig, Priority, TaskId, TaskRequest};
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "taskq", about = "In-process priority task dispatcher")]
struct Cli {
    /// TOML config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a dispatcher, feed it synthetic tasks, and print final stats
    Run {
        /// Number of tasks to submit
        #[arg(long, default_value_t = 100)]
        tasks: usize,
        /// Every K-th task fails its first attempt (0 disables)
        #[arg(long, default_value_t = 10)]
        fail_every: usize,
        /// Override the configured worker count
        #[arg(long)]
        workers: Option<usize>,
    },
    /// Print the effective configuration as TOML
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Command::Run {
            tasks,
            fail_every,
            workers,
        } => {
            if let Some(workers) = workers {
                config.dispatcher.workers = workers;
                config.validate()?;
            }
            cmd_run(config, tasks, fail_every).await
        }
        Command::Config => {
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}

async fn cmd_run(config: Config, tasks: usize, fail_every: usize) -> anyhow::Result<()> {
    let guard = init_telemetry(TelemetryConfig::from(&config.telemetry))?;

    let dispatcher = Dispatcher::start(DispatcherConfig::from(&config))?;

    let sink: Arc<dyn MetricsSink> = if guard.is_exporting() {
        Arc::new(OtelSink)
    } else {
        Arc::new(TracingSink)
    };
    let (monitor_tx, monitor_rx) = watch::channel(false);
    let monitor = dispatcher.monitor(MonitorConfig::from(&config.monitor), sink);
    let monitor_task = tokio::spawn(monitor.run(monitor_rx));

    let ids = submit_workload(&dispatcher, tasks, fail_every).await?;
    info!(submitted = ids.len(), "workload submitted");

    tokio::select! {
        _ = wait_until_idle(&dispatcher) => {}
        _ = tokio::signal::ctrl_c() => warn!("interrupted, shutting down"),
    }

    monitor_tx.send_replace(true);
    monitor_task.await.ok();
    dispatcher.shutdown().await;

    println!("{}", serde_json::to_string_pretty(&dispatcher.get_stats())?);
    guard.force_flush();
    Ok(())
}

/// Mixed priorities and execution modes. Every fifth task is blocking, and
/// every tenth depends on the task submitted just before it.
async fn submit_workload(
    dispatcher: &Dispatcher,
    tasks: usize,
    fail_every: usize,
) -> anyhow::Result<Vec<TaskId>> {
    let mut ids: Vec<TaskId> = Vec::with_capacity(tasks);
    for n in 0..tasks {
        let priority = Priority::ALL[n % Priority::ALL.len()];
        let flaky = fail_every > 0 && (n + 1) % fail_every == 0;

        let mut request = if n % 5 == 4 {
            TaskRequest::blocking(move |ctx| {
                if flaky && ctx.attempt == 1 {
                    anyhow::bail!("synthetic failure in task {n}");
                }
                std::thread::sleep(Duration::from_millis(20));
                Ok(serde_json::json!({ "task": n, "attempt": ctx.attempt }))
            })
        } else {
            TaskRequest::lightweight(move |ctx| async move {
                if flaky && ctx.attempt == 1 {
                    anyhow::bail!("synthetic failure in task {n}");
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
                Ok(serde_json::json!({ "task": n, "attempt": ctx.attempt }))
            })
        };
        request = request
            .label(format!("synthetic-{n}"))
            .priority(priority)
            .retry_delay(Duration::from_millis(50));
        if n % 10 == 9 {
            if let Some(&previous) = ids.last() {
                request = request.depends_on(previous);
            }
        }

        ids.push(dispatcher.submit_wait(request).await?);
    }
    Ok(ids)
}

async fn wait_until_idle(dispatcher: &Dispatcher) {
    loop {
        let stats = dispatcher.get_stats();
        if stats.pending() == 0 && stats.running == 0 && stats.retrying == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
