use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use foreman::profile::WorkerProfile;

mod cmd;

#[derive(Parser)]
#[command(name = "foreman")]
#[command(version, about = "Plan work into small increments and supervise worker agents through them")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize a foreman project in the current directory
    Init,
    /// Show the execution plan for a request without running it
    Plan {
        /// What to build, fix, or change
        description: String,
    },
    /// Plan a request and execute every increment
    Run {
        /// What to build, fix, or change
        description: String,
    },
    /// Start a single agent outside any plan and wait for it
    Submit {
        /// Task text for the agent
        description: String,

        /// Worker profile: backend, frontend, test, docs, orchestrator
        #[arg(short, long, default_value = "orchestrator")]
        profile: WorkerProfile,

        /// Agent id to use instead of the generated one
        #[arg(short, long)]
        name: Option<String>,
    },
    /// Show store statistics, or the state of one task or agent
    Status {
        /// Task or agent id
        id: Option<String>,

        /// Print the snapshot as JSON
        #[arg(long)]
        json: bool,

        /// Number of recent agents to list
        #[arg(short = 'n', long, default_value = "10")]
        limit: usize,
    },
    /// Stop a running agent (SIGTERM, then SIGKILL on a second call)
    Stop {
        agent_id: String,

        /// Send SIGKILL immediately
        #[arg(long)]
        force: bool,
    },
    /// Cancel a task and its agents, or a single agent
    Cancel { id: String },
    /// Print an agent's captured output
    Logs {
        agent_id: String,

        /// Only the last N lines
        #[arg(short, long)]
        tail: Option<usize>,
    },
    /// Mark running agents whose process is gone as failed
    Reconcile,
    /// Archive finished agents and tasks older than the retention period
    Cleanup {
        /// Override `[store] retention_days`
        #[arg(long)]
        days: Option<u64>,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Initialize a default foreman.toml file
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };
    let config = foreman::config::Config::new(project_dir, cli.verbose)?;
    let log_dir = config.foreman_dir.exists().then(|| config.logs_dir.clone());
    let _log_guard = foreman::logging::init(cli.verbose, log_dir.as_deref());

    match &cli.command {
        Commands::Init => cmd::cmd_init(&config)?,
        Commands::Plan { description } => cmd::cmd_plan(&config, description)?,
        Commands::Run { description } => cmd::cmd_run(&config, description).await?,
        Commands::Submit {
            description,
            profile,
            name,
        } => cmd::cmd_submit(&config, *profile, description, name.as_deref()).await?,
        Commands::Status { id, json, limit } => {
            cmd::cmd_status(&config, id.as_deref(), *json, *limit)?
        }
        Commands::Stop { agent_id, force } => cmd::cmd_stop(&config, agent_id, *force).await?,
        Commands::Cancel { id } => cmd::cmd_cancel(&config, id).await?,
        Commands::Logs { agent_id, tail } => cmd::cmd_logs(&config, agent_id, *tail)?,
        Commands::Reconcile => cmd::cmd_reconcile(&config).await?,
        Commands::Cleanup { days } => cmd::cmd_cleanup(&config, *days)?,
        Commands::Config { command } => cmd::cmd_config(&config, command.clone())?,
    }

    Ok(())
}
