//! CLI binary for vigil.

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;
use vigil::goals::{Goal, GoalPriority, Registration, Schedule, load_goals_snapshot};
use vigil::inbox::{CommandOutcome, StoreCommand, Submission, submit};
use vigil::resource::probe_from_config;
use vigil::status::StatusReport;
use vigil::{DataPaths, OllamaBackend, Orchestrator, TickOutcome, VigilConfig, logging};

/// Vigil: resource-aware autonomous task scheduler.
#[derive(Parser)]
#[command(name = "vigil", version, about)]
struct Cli {
    /// Data directory root (overrides VIGIL_DATA_DIR).
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Path to TOML configuration file (default: <data_dir>/config.toml).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

/// Available commands.
#[derive(Subcommand)]
enum Command {
    /// Run the scheduler loop until interrupted.
    Daemon {
        /// Seconds between ticks (default from config).
        #[arg(long)]
        interval: Option<u64>,
    },

    /// Run a single tick and exit.
    Once,

    /// Show health and queue counts.
    Status,

    /// Register a goal.
    AddGoal {
        #[arg(short, long)]
        description: String,

        /// `once`, or an interval such as `30m`, `6h`, `1d`.
        #[arg(short, long, default_value = "once")]
        schedule: String,

        /// critical, high, normal or low.
        #[arg(short, long, default_value = "normal")]
        priority: String,

        /// Pin the goal to one workload unit.
        #[arg(short, long)]
        unit: Option<String>,
    },

    /// List registered goals.
    Goals,

    /// Enable a goal by id.
    EnableGoal { id: String },

    /// Disable a goal by id.
    DisableGoal { id: String },

    /// Drop aged terminal tasks.
    Janitor {
        /// Override the configured maximum age, in hours.
        #[arg(long)]
        max_age_hours: Option<u64>,
    },

    /// Write the default configuration file.
    InitConfig {
        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let paths = match &cli.data_dir {
        Some(dir) => DataPaths::new(dir),
        None => DataPaths::from_env(),
    };
    let config_path = cli.config.clone().unwrap_or_else(|| paths.config_file());

    let log_dir = matches!(cli.command, Command::Daemon { .. }).then(|| paths.logs_dir());
    let _log_guard = logging::init(log_dir.as_deref()).context("cannot initialise logging")?;

    if let Command::InitConfig { force } = cli.command {
        return init_config(&config_path, force);
    }

    let config = VigilConfig::load_or_default(&config_path)
        .with_context(|| format!("cannot load config {}", config_path.display()))?;
    config.validate()?;

    match cli.command {
        Command::Daemon { interval } => run_daemon(&config, &paths, interval).await,
        Command::Once => run_once(&config, &paths).await,
        Command::Status => show_status(&config, &paths),
        Command::AddGoal {
            description,
            schedule,
            priority,
            unit,
        } => add_goal(&config, &paths, &description, &schedule, &priority, unit),
        Command::Goals => list_goals(&paths),
        Command::EnableGoal { id } => set_enabled(&config, &paths, &id, true),
        Command::DisableGoal { id } => set_enabled(&config, &paths, &id, false),
        Command::Janitor { max_age_hours } => run_janitor(&config, &paths, max_age_hours),
        Command::InitConfig { .. } => Ok(()),
    }
}

fn open_orchestrator(config: &VigilConfig, paths: &DataPaths) -> anyhow::Result<Orchestrator> {
    let backend = Arc::new(OllamaBackend::new(&config.backend));
    let probe = probe_from_config(&config.resource);
    Orchestrator::open(config, paths, backend, probe).with_context(|| {
        format!(
            "cannot open scheduler state in {}",
            paths.root().display()
        )
    })
}

async fn run_daemon(
    config: &VigilConfig,
    paths: &DataPaths,
    interval: Option<u64>,
) -> anyhow::Result<()> {
    let interval = match interval {
        Some(0) => anyhow::bail!("--interval must be positive"),
        Some(secs) => Duration::from_secs(secs),
        None => config.scheduler.tick_interval(),
    };

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    let mut orchestrator = open_orchestrator(config, paths)?.with_cancel(cancel);
    orchestrator.run_daemon(interval).await?;
    Ok(())
}

async fn run_once(config: &VigilConfig, paths: &DataPaths) -> anyhow::Result<()> {
    let mut orchestrator = open_orchestrator(config, paths)?;
    let outcome = orchestrator.run_once().await?;
    match &outcome {
        TickOutcome::Executed { task_id, status } => println!("{task_id}: {status}"),
        other => println!("{other}"),
    }
    Ok(())
}

fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};
            match signal(SignalKind::terminate()) {
                Ok(mut term) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => info!("received Ctrl+C, shutting down..."),
                        _ = term.recv() => info!("received SIGTERM, shutting down..."),
                    }
                }
                Err(_) => {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        info!("received Ctrl+C, shutting down...");
                    }
                }
            }
        }
        #[cfg(not(unix))]
        {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("received Ctrl+C, shutting down...");
            }
        }
        cancel.cancel();
    });
}

fn show_status(config: &VigilConfig, paths: &DataPaths) -> anyhow::Result<()> {
    let stale_after = config.scheduler.tick_interval().saturating_mul(3);
    let report = StatusReport::load(paths, stale_after)?;
    print!("{report}");
    Ok(())
}

fn add_goal(
    config: &VigilConfig,
    paths: &DataPaths,
    description: &str,
    schedule: &str,
    priority: &str,
    unit: Option<String>,
) -> anyhow::Result<()> {
    let schedule = Schedule::parse(schedule)?;
    let priority: GoalPriority = priority.parse()?;

    let mut goal = Goal::new(description, schedule, priority);
    if let Some(unit) = unit {
        if !config.workloads.iter().any(|w| w.identifier == unit) {
            anyhow::bail!("unknown workload unit '{unit}'");
        }
        goal = goal.with_unit(unit);
    }

    let id = goal.id.clone();
    match submit(config, paths, StoreCommand::RegisterGoal { goal })? {
        Submission::Applied(CommandOutcome::Registered(Registration::Existing(id))) => {
            println!("goal already registered: {id}");
        }
        Submission::Applied(_) => println!("registered goal {id}"),
        Submission::Queued { leader_pid } => report_queued(&format!("goal {id}"), leader_pid),
    }
    Ok(())
}

fn report_queued(what: &str, leader_pid: u32) {
    println!("{what} queued for the running scheduler (pid {leader_pid})");
}

fn list_goals(paths: &DataPaths) -> anyhow::Result<()> {
    let goals = load_goals_snapshot(&paths.goals_file())?;
    if goals.is_empty() {
        println!("no goals registered");
        return Ok(());
    }
    for goal in &goals {
        let last_run = goal
            .last_run
            .map_or_else(|| "never".to_owned(), |t| t.to_rfc3339());
        println!(
            "{} [{}] {} ({}){} ok={} failed={} last_run={}  {}",
            goal.id,
            goal.priority,
            goal.schedule,
            if goal.enabled { "enabled" } else { "disabled" },
            goal.unit
                .as_deref()
                .map(|u| format!(" unit={u}"))
                .unwrap_or_default(),
            goal.success_count,
            goal.failure_count,
            last_run,
            goal.description
        );
    }
    Ok(())
}

fn set_enabled(config: &VigilConfig, paths: &DataPaths, id: &str, enabled: bool) -> anyhow::Result<()> {
    let command = StoreCommand::SetEnabled {
        goal_id: id.to_owned(),
        enabled,
    };
    let verb = if enabled { "enable" } else { "disable" };
    match submit(config, paths, command)? {
        Submission::Applied(_) => println!("goal {id} {verb}d"),
        Submission::Queued { leader_pid } => report_queued(&format!("{verb} of goal {id}"), leader_pid),
    }
    Ok(())
}

fn run_janitor(
    config: &VigilConfig,
    paths: &DataPaths,
    max_age_hours: Option<u64>,
) -> anyhow::Result<()> {
    let max_age = match max_age_hours {
        Some(hours) => {
            let hours = i64::try_from(hours.min(24 * 365 * 100)).context("max age too large")?;
            chrono::Duration::hours(hours)
        }
        None => config.scheduler.janitor_max_age(),
    };
    let command = StoreCommand::PurgeTerminal {
        before: chrono::Utc::now() - max_age,
    };
    match submit(config, paths, command)? {
        Submission::Applied(CommandOutcome::Purged(removed)) => {
            println!("removed {removed} terminal task(s)");
        }
        Submission::Applied(_) => {}
        Submission::Queued { leader_pid } => report_queued("janitor run", leader_pid),
    }
    Ok(())
}

fn init_config(path: &std::path::Path, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!(
            "{} already exists (use --force to overwrite)",
            path.display()
        );
    }
    VigilConfig::default().save_to_file(path)?;
    println!("wrote {}", path.display());
    Ok(())
}
