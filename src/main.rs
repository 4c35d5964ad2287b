use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use uuid::Uuid;

use steerqueue::classify::HeuristicClassifier;
use steerqueue::config::EngineConfig;
use steerqueue::deliver::TracingDelivery;
use steerqueue::engine::{Engine, EngineDeps, InboundRouting};
use steerqueue::plan::StaticPlanLookup;
use steerqueue::queue::Job;
use steerqueue::runner::EchoRunner;
use steerqueue::store::{KvStore, LibSqlKv};

#[derive(Parser)]
#[command(name = "steerqueue", version, about = "Durable job queue with live session steering")]
struct Cli {
    /// Path to the local database file.
    #[arg(long, env = "STEERQUEUE_DB_PATH")]
    db: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the engine with an interactive prompt.
    Run,
    /// List stored jobs grouped by project and status.
    Jobs,
    /// Repair orphans and recover stuck running jobs.
    Recover {
        /// Recover a single job by id instead of sweeping everything.
        #[arg(long)]
        job: Option<Uuid>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    let mut config = EngineConfig::from_env();
    if let Some(db) = cli.db {
        config.db_path = db;
    }

    let kv: Arc<dyn KvStore> = Arc::new(LibSqlKv::new_local(Path::new(&config.db_path)).await?);
    let deps = EngineDeps {
        runner: Arc::new(EchoRunner),
        classifier: Arc::new(HeuristicClassifier::new()),
        delivery: Arc::new(TracingDelivery),
        plans: Arc::new(StaticPlanLookup::new()),
    };
    let engine = Engine::new(kv, config.clone(), deps);

    match cli.command {
        Command::Run => run(engine, &config).await,
        Command::Jobs => jobs(engine).await,
        Command::Recover { job } => recover(engine, job).await,
    }
}

async fn run(engine: Engine, config: &EngineConfig) -> anyhow::Result<()> {
    engine.startup().await?;
    let _monitor = engine.spawn_monitor();

    eprintln!("steerqueue v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", config.db_path);
    eprintln!("   Auto-continue cap: {}", config.auto_continue_cap);
    eprintln!("   Enter `<project> <message>` to enqueue or steer. /quit to exit.\n");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else { break };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "/quit" {
            break;
        }

        let Some((project, text)) = line.split_once(' ') else {
            eprintln!("   Usage: <project> <message>");
            continue;
        };

        match engine.handle_inbound(project, "cli", "operator", text).await {
            Ok(InboundRouting::Enqueued { job_id }) => {
                eprintln!("   Enqueued job {job_id} for {project}");
            }
            Ok(InboundRouting::Steered { session_id, is_abort }) => {
                let verb = if is_abort { "Abort queued" } else { "Steering queued" };
                eprintln!("   {verb} for session {session_id}");
            }
            Err(e) => eprintln!("   Error: {e}"),
        }
    }

    engine.shutdown().await?;
    Ok(())
}

async fn jobs(engine: Engine) -> anyhow::Result<()> {
    let mut grouped: BTreeMap<String, BTreeMap<String, Vec<Job>>> = BTreeMap::new();
    for job in engine.store().list_all().await? {
        grouped
            .entry(job.project_key.clone())
            .or_default()
            .entry(job.status.to_string())
            .or_default()
            .push(job);
    }

    if grouped.is_empty() {
        println!("No jobs stored.");
        return Ok(());
    }

    for (project, by_status) in grouped {
        println!("{project}");
        for (status, mut jobs) in by_status {
            jobs.sort_by_key(|j| j.created_at);
            println!("  {status}:");
            for job in jobs {
                let mut line = format!(
                    "    {} created {}",
                    job.id,
                    job.created_at.format("%Y-%m-%d %H:%M:%S")
                );
                if let Some(completed) = job.completed_at {
                    line.push_str(&format!(", finished {}", completed.format("%H:%M:%S")));
                }
                if let Some(reason) = &job.failure_reason {
                    line.push_str(&format!(" ({reason})"));
                }
                if job.recovered {
                    line.push_str(" [recovered]");
                }
                println!("{line}");
            }
        }
    }
    Ok(())
}

async fn recover(engine: Engine, job: Option<Uuid>) -> anyhow::Result<()> {
    let orphans = engine.monitor().startup_pass().await?;
    println!("Orphan repair: {orphans} job(s) re-materialized.");

    match job {
        Some(id) => {
            let after = engine.store().recover_job(id).await?;
            println!("Job {id} recovered to {}.", after.status);
        }
        None => {
            let recovered = engine.monitor().force_recover_all().await?;
            println!("Force recovery: {recovered} running job(s) returned to pending.");
        }
    }
    Ok(())
}
