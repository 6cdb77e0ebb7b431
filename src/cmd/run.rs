//! Planning and execution: `foreman plan`, `foreman run` and `foreman submit`.

use anyhow::{Context, Result};
use console::style;
use foreman::config::Config;
use foreman::pipeline::PipelineEvent;
use foreman::planner::{IncrementStatus, Planner, ProjectContext};
use foreman::profile::WorkerProfile;
use foreman::store::AgentStatus;

use super::open_session;

pub fn cmd_plan(config: &Config, description: &str) -> Result<()> {
    let context = ProjectContext::load(&config.context_dir)?;
    let planner = Planner::default()
        .with_max_increment_lines(config.settings().pipeline.max_increment_lines);
    let plan = planner.plan(description, &context);

    println!();
    print!("{}", plan.render());
    println!();
    if context.is_empty() {
        println!(
            "{}",
            style("No project context found in .foreman/context/").dim()
        );
    }
    Ok(())
}

fn print_event(event: &PipelineEvent) {
    let status = event.status.to_string();
    let status = match event.status {
        IncrementStatus::Completed => style(status).green().bold(),
        IncrementStatus::Failed => style(status).red().bold(),
        IncrementStatus::Verifying => style(status).cyan(),
        IncrementStatus::InProgress => style(status).yellow(),
        IncrementStatus::Pending => style(status).dim(),
    };
    let first_line = event.detail.lines().next().unwrap_or_default();
    println!(
        "  [{}] {:<22} {} {}",
        event.increment_index + 1,
        status,
        style(format!("attempt {}", event.attempt)).dim(),
        first_line
    );
}

pub async fn cmd_run(config: &Config, description: &str) -> Result<()> {
    let mut session = open_session(config)?;
    let plan = session.submit(description);

    println!();
    print!("{}", plan.render());
    println!();
    println!("{}", style("Executing plan").bold().cyan());

    let (mut events, handle) = session.execute(plan);
    while let Some(event) = events.recv().await {
        print_event(&event);
    }
    let report = handle.await.context("Pipeline task panicked")??;

    println!();
    if report.is_success() {
        print!("{}", style(report.render()).green());
    } else {
        print!("{}", report.render());
        anyhow::bail!("Plan halted before completion");
    }
    Ok(())
}

pub async fn cmd_submit(
    config: &Config,
    profile: WorkerProfile,
    description: &str,
    name: Option<&str>,
) -> Result<()> {
    let session = open_session(config)?;
    let submitted = session
        .submit_agent(profile, description, name, true)
        .await?;

    let agent = &submitted.agent;
    println!();
    println!("Agent:  {}", style(&agent.id).bold());
    println!("Task:   {}", submitted.task.id);
    println!("Log:    {}", agent.log_path.display());
    println!("Output: {}", agent.result_dir.display());

    match agent.status {
        AgentStatus::Completed => {
            println!("Status: {}", style("completed").green().bold());
            Ok(())
        }
        status => {
            println!("Status: {}", style(status).red().bold());
            if let Some(message) = &agent.error_message {
                println!("Error:  {}", message);
            }
            anyhow::bail!("Agent {} ended as {}", agent.id, status)
        }
    }
}
