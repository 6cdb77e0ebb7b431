//! Configuration view and validation commands: `foreman config`.

use anyhow::Result;
use foreman::config::Config;
use foreman::foreman_config::ForemanToml;

use super::super::ConfigCommands;

fn print_settings(toml: &ForemanToml) {
    println!("[worker]");
    println!("  command = \"{}\"", toml.worker.command);
    println!("  args = {:?}", toml.worker.args);
    println!("  profile_flag = \"{}\"", toml.worker.profile_flag);
    if let Some(flag) = &toml.worker.non_interactive_flag {
        println!("  non_interactive_flag = \"{}\"", flag);
    }
    if let Some(flag) = &toml.worker.auto_approve_flag {
        println!("  auto_approve_flag = \"{}\"", flag);
    }
    println!();

    println!("[executor]");
    println!(
        "  heartbeat_interval_secs = {}",
        toml.executor.heartbeat_interval_secs
    );
    println!("  grace_period_secs = {}", toml.executor.grace_period_secs);
    match toml.executor.timeout_secs {
        Some(secs) => println!("  timeout_secs = {}", secs),
        None => println!("  timeout_secs = (none)"),
    }
    println!();

    println!("[pipeline]");
    println!("  max_attempts = {}", toml.pipeline.max_attempts);
    println!("  max_increment_lines = {}", toml.pipeline.max_increment_lines);
    println!();

    println!("[store]");
    println!("  lock_timeout_ms = {}", toml.store.lock_timeout_ms);
    println!("  retention_days = {}", toml.store.retention_days);
    println!();

    println!("[verify]");
    println!("  error_markers = {:?}", toml.verify.error_markers);
    if let Some(marker) = &toml.verify.completion_marker {
        println!("  completion_marker = \"{}\"", marker);
    }
    println!("  require_artifacts = {}", toml.verify.require_artifacts);
    println!();
}

pub fn cmd_config(config: &Config, command: Option<ConfigCommands>) -> Result<()> {
    let config_path = &config.config_file;

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Foreman Configuration");
            println!("=====================");
            println!();

            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No foreman.toml found at {}", config_path.display());
                println!("Using default configuration.");
            }
            println!();

            println!("Effective values (with env overrides):");
            println!();
            print_settings(config.settings());

            if !config_path.exists() {
                println!("Run 'foreman config init' to create a foreman.toml file.");
                println!();
            }
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() {
                println!("No foreman.toml found. Using defaults (valid).");
                return Ok(());
            }

            let toml = ForemanToml::load(config_path)?;
            let warnings = toml.validate();

            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("foreman.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            std::fs::create_dir_all(&config.foreman_dir)?;
            ForemanToml::default().save(config_path)?;

            println!("Created foreman.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [worker] command, args and flags");
            println!("  - [executor] grace period, heartbeat, timeout");
            println!("  - [pipeline] max_attempts, max_increment_lines");
            println!("  - [verify] error markers and completion marker");
            println!();
        }
    }

    Ok(())
}
