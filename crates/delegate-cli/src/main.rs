//! The `delegate` binary: run the daemon and poke at it locally.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use uuid::Uuid;

use delegate_core::config::DelegateConfig;
use delegate_core::container::Container;
use delegate_core::events::Event;
use delegate_core::handlers::DelegateRequest;
use delegate_core::schedule::CreateScheduleRequest;
use delegate_db::models::{
    MissedRunPolicy, ScheduleStatus, ScheduleType, TaskPriority, TaskTemplate,
};
use delegate_db::queries::{schedules, tasks};

#[derive(Parser)]
#[command(name = "delegate", about = "Local background service for coding-agent tasks")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the delegate daemon until interrupted
    Serve,
    /// Delegate a task
    Delegate {
        /// The task prompt
        prompt: String,
        /// Working directory for the worker (defaults to the current dir)
        #[arg(long)]
        dir: Option<String>,
        /// Priority: p0, p1, or p2
        #[arg(long, default_value = "p1")]
        priority: String,
        /// Timeout in milliseconds
        #[arg(long)]
        timeout_ms: Option<i64>,
        /// Run the worker in a git worktree
        #[arg(long)]
        worktree: bool,
        /// Task ID this task depends on (repeatable)
        #[arg(long = "depends-on")]
        depends_on: Vec<Uuid>,
    },
    /// Resume a terminal task from its latest checkpoint
    Resume {
        /// Task ID to resume
        task_id: Uuid,
        /// Extra context appended to the resume prompt
        #[arg(long)]
        context: Option<String>,
    },
    /// Cancel a queued, blocked, or running task
    Cancel {
        /// Task ID to cancel
        task_id: Uuid,
    },
    /// Show one task (or counts of all tasks)
    Status {
        /// Task ID to show (omit for a summary)
        task_id: Option<Uuid>,
    },
    /// Show captured output for a task
    Logs {
        /// Task ID to show output for
        task_id: Uuid,
        /// Only the last N lines per stream
        #[arg(long)]
        tail: Option<usize>,
    },
    /// Schedule management
    Schedule {
        #[command(subcommand)]
        command: ScheduleCommands,
    },
    /// Configuration file management
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum ScheduleCommands {
    /// Create a cron or one-time schedule
    Create {
        /// Prompt for the materialised tasks
        prompt: String,
        /// 5-field cron expression (cron schedules)
        #[arg(long)]
        cron: Option<String>,
        /// RFC 3339 instant (one-time schedules)
        #[arg(long)]
        at: Option<DateTime<Utc>>,
        /// IANA timezone
        #[arg(long, default_value = "UTC")]
        timezone: String,
        /// Working directory for materialised tasks
        #[arg(long)]
        dir: Option<String>,
        /// Priority for materialised tasks
        #[arg(long, default_value = "p1")]
        priority: String,
        /// Missed-run policy: skip, catchup, or fail
        #[arg(long, default_value = "skip")]
        missed_run_policy: String,
        /// Stop after this many runs
        #[arg(long)]
        max_runs: Option<i64>,
    },
    /// List schedules
    List {
        /// Filter by status
        #[arg(long)]
        status: Option<String>,
    },
    /// Pause an active schedule
    Pause { schedule_id: Uuid },
    /// Resume a paused schedule
    Resume { schedule_id: Uuid },
    /// Cancel a schedule
    Cancel { schedule_id: Uuid },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Set one key in the config file
    Set {
        /// Config key (camelCase schema name)
        key: String,
        /// JSON value
        value: String,
    },
    /// Remove one key from the config file
    Reset {
        /// Config key (camelCase schema name)
        key: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let config = DelegateConfig::load();
    match cli.command {
        Commands::Serve => cmd_serve(config).await,
        Commands::Delegate {
            prompt,
            dir,
            priority,
            timeout_ms,
            worktree,
            depends_on,
        } => {
            let container = Container::boot(config).await?;
            let result = cmd_delegate(
                &container,
                prompt,
                dir,
                &priority,
                timeout_ms,
                worktree,
                depends_on,
            )
            .await;
            container.dispose().await;
            result
        }
        Commands::Resume { task_id, context } => {
            let container = Container::boot(config).await?;
            let result = async {
                let task = container.resume.resume(task_id, context).await?;
                println!("Resumed {task_id} as {}", task.id);
                Ok(())
            }
            .await;
            container.dispose().await;
            result
        }
        Commands::Cancel { task_id } => {
            let container = Container::boot(config).await?;
            let result = async {
                container.delegation.cancel(task_id).await?;
                println!("Cancelled {task_id}");
                Ok(())
            }
            .await;
            container.dispose().await;
            result
        }
        Commands::Status { task_id } => cmd_status(config, task_id).await,
        Commands::Logs { task_id, tail } => {
            let container = Container::boot(config).await?;
            let result = cmd_logs(&container, task_id, tail).await;
            container.dispose().await;
            result
        }
        Commands::Schedule { command } => {
            let container = Container::boot(config).await?;
            let result = cmd_schedule(&container, command).await;
            container.dispose().await;
            result
        }
        Commands::Config { command } => cmd_config(command),
    }
}

fn init_tracing() {
    let default = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default)),
        )
        .init();
}

async fn cmd_serve(config: DelegateConfig) -> Result<()> {
    let container = Container::boot(config).await?;
    println!(
        "delegate serving (db: {})",
        container.config.database_path.display()
    );
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    println!("\nshutting down...");
    container.dispose().await;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn cmd_delegate(
    container: &Container,
    prompt: String,
    dir: Option<String>,
    priority: &str,
    timeout_ms: Option<i64>,
    worktree: bool,
    depends_on: Vec<Uuid>,
) -> Result<()> {
    let working_directory = match dir {
        Some(dir) => dir,
        None => std::env::current_dir()
            .context("cannot determine current directory")?
            .to_string_lossy()
            .into_owned(),
    };
    let priority: TaskPriority = priority.parse()?;

    let task = container
        .delegation
        .delegate(DelegateRequest {
            prompt,
            priority,
            working_directory,
            use_worktree: worktree,
            timeout_ms,
            depends_on,
            chain: None,
        })
        .await?;

    println!("Delegated task {}", task.id);
    println!("  priority: {}", task.priority);
    println!("  status:   {}", task.status);
    Ok(())
}

async fn cmd_status(config: DelegateConfig, task_id: Option<Uuid>) -> Result<()> {
    // Read-only: talk straight to the repositories without booting the
    // kernel (no recovery side effects from a status query).
    let db_config = delegate_db::config::DbConfig::new(config.database_path.clone());
    let db = delegate_db::pool::create_pool(&db_config).await?;

    match task_id {
        Some(id) => {
            let task = tasks::get_task(&db, id)
                .await?
                .with_context(|| format!("task {id} not found"))?;
            println!("task {id}");
            println!("  status:    {}", task.status);
            println!("  priority:  {}", task.priority);
            println!("  attempts:  {}", task.attempts);
            println!("  created:   {}", task.created_at);
            if let Some(started) = task.started_at {
                println!("  started:   {started}");
            }
            if let Some(completed) = task.completed_at {
                println!("  completed: {completed}");
            }
            if let Some(code) = task.exit_code {
                println!("  exit code: {code}");
            }
        }
        None => {
            for (table, count) in delegate_db::pool::table_counts(&db).await? {
                println!("{table:24} {count}");
            }
        }
    }
    db.close().await;
    Ok(())
}

async fn cmd_logs(container: &Container, task_id: Uuid, tail: Option<usize>) -> Result<()> {
    let value = container
        .bus
        .request(Event::LogsRequested { task_id, tail }, None)
        .await?;

    let print_stream = |name: &str, lines: &serde_json::Value| {
        if let Some(lines) = lines.as_array() {
            if !lines.is_empty() {
                println!("--- {name} ---");
                for line in lines {
                    if let Some(s) = line.as_str() {
                        print!("{s}");
                        if !s.ends_with('\n') {
                            println!();
                        }
                    }
                }
            }
        }
    };
    print_stream("stdout", &value["stdout"]);
    print_stream("stderr", &value["stderr"]);
    Ok(())
}

async fn cmd_schedule(container: &Container, command: ScheduleCommands) -> Result<()> {
    match command {
        ScheduleCommands::Create {
            prompt,
            cron,
            at,
            timezone,
            dir,
            priority,
            missed_run_policy,
            max_runs,
        } => {
            let schedule_type = match (&cron, &at) {
                (Some(_), None) => ScheduleType::Cron,
                (None, Some(_)) => ScheduleType::OneTime,
                _ => anyhow::bail!("pass exactly one of --cron or --at"),
            };
            let working_directory = match dir {
                Some(dir) => dir,
                None => std::env::current_dir()?.to_string_lossy().into_owned(),
            };
            let schedule = container
                .schedules
                .create(CreateScheduleRequest {
                    schedule_type,
                    cron_expression: cron,
                    scheduled_at: at,
                    timezone,
                    missed_run_policy: missed_run_policy.parse::<MissedRunPolicy>()?,
                    task_template: TaskTemplate {
                        prompt,
                        working_directory,
                        use_worktree: false,
                        timeout_ms: None,
                    },
                    priority: priority.parse::<TaskPriority>()?,
                    max_runs,
                    expires_at: None,
                })
                .await?;
            println!("Created schedule {}", schedule.id);
            if let Some(next) = schedule.next_run_at {
                println!("  next run: {next}");
            }
        }
        ScheduleCommands::List { status } => {
            let status = status
                .map(|s| s.parse::<ScheduleStatus>())
                .transpose()?;
            for schedule in schedules::list_schedules(&container.db, status).await? {
                let next = schedule
                    .next_run_at
                    .map(|t| t.to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{}  {:8}  {:9}  runs={:3}  next={}",
                    schedule.id, schedule.schedule_type, schedule.status, schedule.run_count, next
                );
            }
        }
        ScheduleCommands::Pause { schedule_id } => {
            container.schedules.pause(schedule_id).await?;
            println!("Paused {schedule_id}");
        }
        ScheduleCommands::Resume { schedule_id } => {
            container.schedules.resume(schedule_id).await?;
            println!("Resumed {schedule_id}");
        }
        ScheduleCommands::Cancel { schedule_id } => {
            container.schedules.cancel(schedule_id).await?;
            println!("Cancelled {schedule_id}");
        }
    }
    Ok(())
}

fn cmd_config(command: ConfigCommands) -> Result<()> {
    let path = DelegateConfig::config_file_path();
    match command {
        ConfigCommands::Set { key, value } => {
            let value: serde_json::Value =
                serde_json::from_str(&value).context("value is not valid JSON")?;
            delegate_core::config::save_config_value(&path, &key, value)?;
            println!("Set {key} in {}", path.display());
        }
        ConfigCommands::Reset { key } => {
            delegate_core::config::reset_config_value(&path, &key)?;
            println!("Reset {key} in {}", path.display());
        }
    }
    Ok(())
}
