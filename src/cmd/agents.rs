//! Agent and task inspection and control: `foreman status`, `stop`,
//! `cancel`, `logs`, `reconcile` and `cleanup`.

use anyhow::Result;
use console::style;
use foreman::config::Config;
use foreman::executor::StopOutcome;
use foreman::pipeline::StatusSnapshot;
use foreman::store::{Agent, AgentStatus};
use foreman::foreman_config::retention_from_days;

use super::require_session;

fn styled_status(status: AgentStatus) -> console::StyledObject<String> {
    let text = status.to_string();
    match status {
        AgentStatus::Completed => style(text).green(),
        AgentStatus::Failed => style(text).red(),
        AgentStatus::Cancelled => style(text).yellow(),
        AgentStatus::Running => style(text).cyan(),
        AgentStatus::Pending => style(text).dim(),
    }
}

fn print_agent_row(agent: &Agent) {
    println!(
        "  {:<40} {:<12} {:<10} {}",
        agent.id,
        agent.worker_profile,
        styled_status(agent.status),
        agent.last_activity().format("%Y-%m-%d %H:%M:%S")
    );
}

fn print_agent(agent: &Agent) {
    println!("Agent:    {}", style(&agent.id).bold());
    println!("Profile:  {}", agent.worker_profile);
    println!("Status:   {}", styled_status(agent.status));
    if let Some(task_id) = &agent.task_id {
        println!("Task:     {}", task_id);
    }
    if let Some(parent_id) = &agent.parent_id {
        println!("Parent:   {}", parent_id);
    }
    if let Some(pid) = agent.process_handle {
        println!("PID:      {}", pid);
    }
    println!("Created:  {}", agent.created_at.format("%Y-%m-%d %H:%M:%S"));
    if let Some(start) = agent.start_time {
        println!("Started:  {}", start.format("%Y-%m-%d %H:%M:%S"));
    }
    if let Some(end) = agent.end_time {
        println!("Ended:    {}", end.format("%Y-%m-%d %H:%M:%S"));
    }
    if let Some(message) = &agent.error_message {
        println!("Error:    {}", style(message).red());
    }
    println!("Log:      {}", agent.log_path.display());
    println!("Output:   {}", agent.result_dir.display());
    println!("Task text:");
    println!("  {}", agent.description);
}

pub fn cmd_status(config: &Config, id: Option<&str>, json: bool, limit: usize) -> Result<()> {
    if !config.foreman_dir.exists() {
        println!();
        println!("Project: Not initialized");
        println!();
        println!("Run 'foreman init' to initialize the project.");
        println!();
        return Ok(());
    }
    let session = require_session(config)?;

    if let Some(id) = id {
        let snapshot = session.status(id)?;
        if json {
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
            return Ok(());
        }
        println!();
        match snapshot {
            StatusSnapshot::Agent(agent) => print_agent(&agent),
            StatusSnapshot::Task { task, agents } => {
                println!("Task:     {}", style(&task.id).bold());
                println!("Status:   {}", task.status);
                println!("Priority: {:?}", task.priority);
                if !task.dependencies.is_empty() {
                    println!("Depends:  {}", task.dependencies.join(", "));
                }
                if let Some(reason) = task.metadata.get("reason").and_then(|v| v.as_str()) {
                    println!("Reason:   {}", reason);
                }
                println!("Task text:");
                println!("  {}", task.description);
                println!();
                println!("Agents ({}):", agents.len());
                for agent in &agents {
                    print_agent_row(agent);
                }
            }
        }
        println!();
        return Ok(());
    }

    let stats = session.store().stats()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    println!();
    println!("{}", style("Foreman Status").bold().cyan());
    println!("==============");
    println!();
    println!("Tasks:     {}", stats.tasks);
    println!(
        "Agents:    {} total, {} pending, {} running, {} completed, {} failed, {} cancelled",
        stats.total, stats.pending, stats.running, stats.completed, stats.failed, stats.cancelled
    );

    let recent = session.store().recent_agents(limit)?;
    if !recent.is_empty() {
        println!();
        println!("Recent agents:");
        for agent in &recent {
            print_agent_row(agent);
        }
    }
    println!();
    Ok(())
}

pub async fn cmd_stop(config: &Config, agent_id: &str, force: bool) -> Result<()> {
    let session = require_session(config)?;
    match session.executor().stop(agent_id, force).await? {
        StopOutcome::Cancelled { forced: true } => {
            println!("{} {} (SIGKILL)", style("Killed").red().bold(), agent_id)
        }
        StopOutcome::Cancelled { forced: false } => {
            println!("{} {}", style("Stopped").yellow().bold(), agent_id)
        }
        StopOutcome::StillRunning => {
            println!(
                "{} is still running after the grace period.",
                style(agent_id).bold()
            );
            println!("Run 'foreman stop {} --force' to kill it.", agent_id);
        }
        StopOutcome::AlreadyFinished(status) => {
            println!("{} already finished ({})", agent_id, styled_status(status))
        }
    }
    Ok(())
}

pub async fn cmd_cancel(config: &Config, id: &str) -> Result<()> {
    let session = require_session(config)?;
    let report = session.cancel(id).await?;

    if report.task_cancelled {
        println!("Cancelled task {}", style(&report.id).bold());
    }
    for (agent_id, outcome) in &report.agents {
        let summary = match outcome {
            StopOutcome::Cancelled { forced: true } => "killed".to_string(),
            StopOutcome::Cancelled { forced: false } => "stopped".to_string(),
            StopOutcome::StillRunning => "still running".to_string(),
            StopOutcome::AlreadyFinished(status) => format!("already {}", status),
        };
        println!("  {:<40} {}", agent_id, summary);
    }
    if !report.task_cancelled && report.agents.is_empty() {
        println!("Nothing to cancel for {}", id);
    }
    Ok(())
}

pub fn cmd_logs(config: &Config, agent_id: &str, tail: Option<usize>) -> Result<()> {
    let session = require_session(config)?;
    let log = session.executor().read_log(agent_id, tail)?;
    if log.is_empty() {
        println!("{}", style("(no output yet)").dim());
    } else {
        println!("{}", log.trim_end());
    }
    Ok(())
}

pub async fn cmd_reconcile(config: &Config) -> Result<()> {
    let session = require_session(config)?;
    let failed = session.executor().reconcile_stale().await?;
    if failed.is_empty() {
        println!("No stale agents.");
    } else {
        println!("Marked {} stale agent(s) as failed:", failed.len());
        for id in &failed {
            println!("  {}", id);
        }
    }
    Ok(())
}

pub fn cmd_cleanup(config: &Config, days: Option<u64>) -> Result<()> {
    let session = require_session(config)?;
    let retention = match days {
        Some(days) => retention_from_days(days)?,
        None => config.settings().retention()?,
    };
    let report = session.store().delete_stale(
        retention,
        &[
            AgentStatus::Completed,
            AgentStatus::Failed,
            AgentStatus::Cancelled,
        ],
    )?;
    println!(
        "Archived {} agent(s) and {} task(s) into {}",
        report.agents.len(),
        report.tasks.len(),
        config.foreman_dir.join("archive").display()
    );
    Ok(())
}
