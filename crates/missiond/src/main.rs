//! missiond - autonomous mission orchestrator
//!
//! Command-line entry point: analyze goals, run missions to completion,
//! inspect history, and resume missions from their last checkpoint.

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use eyre::{bail, WrapErr};
use mission_core::{
    write_report, Config, Id, Mission, MissionContext, MissionEvent, MissionPriority,
    MissionStatus,
};
use missiond::{open_storage, render, Orchestrator, StepExecutor};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "missiond", about = "Autonomous mission orchestrator", version)]
struct Cli {
    /// Config file (defaults to .mission/config when present)
    #[arg(long, global = true, env = "MISSIOND_CONFIG")]
    config: Option<PathBuf>,

    /// SQLite database path
    #[arg(long, global = true, env = "MISSIOND_DB")]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Analyze a goal and print the plan without executing it
    Analyze {
        goal: String,
        #[command(flatten)]
        context: ContextArgs,
    },
    /// Plan and execute a goal, streaming progress until it finishes
    Run {
        goal: String,
        #[command(flatten)]
        context: ContextArgs,
        /// Write the mission log as TSV to this path
        #[arg(long)]
        report: Option<PathBuf>,
    },
    /// List finished missions, most recent first
    History {
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// Rebuild a mission from its last checkpoint and run it again
    Restore {
        mission_id: String,
        /// Write the mission log as TSV to this path
        #[arg(long)]
        report: Option<PathBuf>,
    },
}

#[derive(Args)]
struct ContextArgs {
    /// low, normal, high, or critical
    #[arg(long, default_value = "normal")]
    priority: String,
    /// RFC 3339 deadline
    #[arg(long)]
    deadline: Option<String>,
    #[arg(long = "constraint")]
    constraints: Vec<String>,
    #[arg(long = "preference")]
    preferences: Vec<String>,
}

impl ContextArgs {
    fn into_context(self) -> eyre::Result<MissionContext> {
        let Some(priority) = MissionPriority::parse(&self.priority) else {
            bail!("unknown priority: {}", self.priority);
        };
        let deadline = self
            .deadline
            .map(|d| {
                DateTime::parse_from_rfc3339(&d)
                    .map(|t| t.with_timezone(&Utc))
                    .wrap_err_with(|| format!("invalid deadline: {d}"))
            })
            .transpose()?;
        Ok(MissionContext {
            priority,
            deadline,
            constraints: self.constraints,
            preferences: self.preferences,
        })
    }
}

fn main() -> eyre::Result<ExitCode> {
    let cli = Cli::parse();

    // Initialize tracing.
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = load_config(cli.config.as_deref(), cli.db)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .wrap_err("failed to create tokio runtime")?;

    runtime.block_on(dispatch(cli.command, config))
}

async fn dispatch(command: Command, config: Config) -> eyre::Result<ExitCode> {
    match command {
        Command::Analyze { goal, context } => {
            let orchestrator = orchestrator(config).await?;
            let mission = orchestrator.create_mission(&goal, Some(context.into_context()?));
            render::print_mission_plan(&mission);
            Ok(ExitCode::SUCCESS)
        }
        Command::Run {
            goal,
            context,
            report,
        } => {
            let orchestrator = orchestrator(config).await?;
            let mission = orchestrator.create_mission(&goal, Some(context.into_context()?));
            render::print_mission_plan(&mission);
            println!();
            run_to_completion(&orchestrator, mission, report).await
        }
        Command::History { limit } => {
            let orchestrator = orchestrator(config).await?;
            let history = orchestrator.history();
            render::print_history(&history[..history.len().min(limit)]);
            Ok(ExitCode::SUCCESS)
        }
        Command::Restore { mission_id, report } => {
            let orchestrator = orchestrator(config).await?;
            let id = Id::from_string(mission_id);
            let Some(mission) = orchestrator.restore_from_checkpoint(&id).await? else {
                bail!("mission {id} not found in history");
            };
            println!(
                "Restored mission {} ({}/{} phases already complete)",
                mission.id,
                mission.phases_completed(),
                mission.phases.len()
            );
            run_to_completion(&orchestrator, mission, report).await
        }
    }
}

/// Precedence: CLI flags > `--config` file > `.mission/config` > defaults.
fn load_config(path: Option<&Path>, db: Option<PathBuf>) -> eyre::Result<Config> {
    let cwd = std::env::current_dir().wrap_err("failed to read current directory")?;
    let mut config = match path {
        Some(path) => Config::from_file(path)
            .wrap_err_with(|| format!("failed to load config {}", path.display()))?,
        None => Config::discover(&cwd)?,
    };
    if db.is_some() {
        config.db_path = db;
    }
    config.resolve_paths(&cwd);
    Ok(config)
}

async fn orchestrator(config: Config) -> eyre::Result<Orchestrator> {
    let storage = open_storage(&config)
        .await
        .wrap_err("failed to open mission database")?;
    let executor = StepExecutor::new(std::sync::Arc::clone(&storage));
    Ok(Orchestrator::new(config, storage, executor).await?)
}

/// Start a mission, stream its log, and cancel it on SIGINT/SIGTERM.
async fn run_to_completion(
    orchestrator: &Orchestrator,
    mission: Mission,
    report: Option<PathBuf>,
) -> eyre::Result<ExitCode> {
    let mut events = orchestrator.subscribe();
    orchestrator.start_mission(mission)?;

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    let mut cancelling = false;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(MissionEvent::Log(log)) => render::print_log(&log),
                Ok(event) if event.event_type().is_terminal() => break,
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "event stream lagged"),
                Err(RecvError::Closed) => break,
            },
            signal = &mut shutdown, if !cancelling => {
                signal?;
                info!("received shutdown signal, cancelling mission");
                cancelling = true;
                if let Err(e) = orchestrator.cancel_mission() {
                    warn!(error = %e, "cancel request ignored");
                }
            }
        }
    }

    let Some(mission) = orchestrator.wait().await else {
        bail!("mission finished without a result");
    };

    println!();
    render::print_mission_summary(&mission);

    let report_path = report.or_else(|| {
        orchestrator
            .config()
            .report_dir
            .as_ref()
            .map(|dir| dir.join(format!("{}.tsv", mission.id)))
    });
    if let (Some(path), Some(mission_report)) = (report_path, mission.report.as_ref()) {
        write_report(&path, mission_report)
            .wrap_err_with(|| format!("failed to write report {}", path.display()))?;
        println!("  Report:    {}", path.display());
    }

    Ok(if mission.status == MissionStatus::Completed {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

#[cfg(unix)]
async fn shutdown_signal() -> eyre::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm =
        signal(SignalKind::terminate()).wrap_err("failed to register SIGTERM handler")?;
    let mut sigint =
        signal(SignalKind::interrupt()).wrap_err("failed to register SIGINT handler")?;
    tokio::select! {
        _ = sigint.recv() => {}
        _ = sigterm.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn shutdown_signal() -> eyre::Result<()> {
    tokio::signal::ctrl_c()
        .await
        .wrap_err("failed to listen for ctrl-c")
}
