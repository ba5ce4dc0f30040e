//! sparkd - runs recurring exploration jobs when the machine has room for them.
//!
//! Usage:
//!   sparkd run                       Run the scheduler until Ctrl-C
//!   sparkd add --name N --schedule S --command CMD
//!   sparkd list | status | pause ID | resume ID | remove ID | trigger ID
//!
//! Management commands edit the job store directly; stop a running daemon
//! first, since it rewrites the store from memory on every change.

mod cli;
mod command;
mod truncate;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use spark_core::{JobId, SparkConfig};
use spark_scheduler::{JobDefinition, Scheduler};
use tracing::{info, warn};

use crate::cli::{Cli, Commands};
use crate::command::{CommandTask, COMMAND_TASK};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // explicit --config > SPARK_CONFIG > ~/.spark/spark.toml
    let config_path = cli
        .config
        .as_ref()
        .map(|p| p.display().to_string())
        .or_else(|| std::env::var("SPARK_CONFIG").ok());
    let loaded = SparkConfig::load(config_path.as_deref());
    let filter = loaded
        .as_ref()
        .map(|c| c.logging.filter.clone())
        .unwrap_or_else(|_| SparkConfig::default().logging.filter);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .init();

    let config = loaded.unwrap_or_else(|e| {
        warn!(code = e.code(), "Config load failed ({}), using defaults", e);
        SparkConfig::default()
    });

    let scheduler = Scheduler::from_config(&config);
    scheduler.register_task_function(COMMAND_TASK, Arc::new(CommandTask))?;

    match cli.command {
        Commands::Run => run(scheduler).await?,
        Commands::List { json } => list(&scheduler, json)?,
        Commands::Status => {
            println!("{}", serde_json::to_string_pretty(&scheduler.get_status())?);
        }
        Commands::Add(args) => {
            let id = scheduler.add_task(args.into_spec()?)?;
            let job = scheduler.get_task(&id);
            let next = job
                .and_then(|j| j.next_run)
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "-".into());
            println!("{id}  next run {next}");
        }
        Commands::Pause { id } => {
            report(scheduler.pause_task(&JobId::from(id.as_str()))?, "paused", &id)
        }
        Commands::Resume { id } => report(
            scheduler.resume_task(&JobId::from(id.as_str()))?,
            "resumed",
            &id,
        ),
        Commands::Remove { id } => {
            report(scheduler.remove_task(&JobId::from(id.as_str()))?, "removed", &id)
        }
        Commands::Trigger { id, wait_secs } => {
            let session_id = scheduler.trigger_task(&JobId::from(id.as_str())).await?;
            println!("session {session_id} started");
            let session = scheduler
                .executor()
                .wait_for(&session_id, Duration::from_secs(wait_secs))
                .await;
            scheduler.stop().await;
            if let Some(session) = session {
                println!("{}", serde_json::to_string_pretty(&session)?);
            }
        }
    }

    Ok(())
}

async fn run(scheduler: Arc<Scheduler>) -> anyhow::Result<()> {
    let status = scheduler.get_status();
    info!(
        jobs = status.total_tasks,
        store = %status.platform_info.storage_path,
        local_time = status.platform_info.use_local_time,
        "sparkd starting"
    );
    scheduler.start();

    tokio::signal::ctrl_c().await?;
    info!("interrupt received, shutting down");
    scheduler.stop().await;
    Ok(())
}

fn list(scheduler: &Scheduler, json: bool) -> anyhow::Result<()> {
    let jobs = scheduler.get_tasks();
    if json {
        println!("{}", serde_json::to_string_pretty(&jobs)?);
        return Ok(());
    }
    if jobs.is_empty() {
        println!("no jobs");
        return Ok(());
    }
    println!(
        "{:<36}  {:<20}  {:<26}  {:<8}  {:<25}  runs/fails",
        "ID", "NAME", "SCHEDULE", "STATUS", "NEXT RUN"
    );
    for job in &jobs {
        println!("{}", row(job));
    }
    Ok(())
}

fn row(job: &JobDefinition) -> String {
    let next = job
        .next_run
        .map(|t| t.to_rfc3339_opts(chrono::SecondsFormat::Secs, true))
        .unwrap_or_else(|| "-".into());
    format!(
        "{:<36}  {:<20}  {:<26}  {:<8}  {:<25}  {}/{}",
        job.id.as_str(),
        job.name,
        job.schedule.to_string(),
        job.status.to_string(),
        next,
        job.run_count,
        job.failure_count
    )
}

fn report(changed: bool, verb: &str, id: &str) {
    if changed {
        println!("{id} {verb}");
    } else {
        println!("{id}: nothing to do (unknown job or wrong state)");
    }
}
