//! Project initialization: `foreman init`.

use anyhow::Result;
use foreman::config::Config;
use foreman::foreman_config::ForemanToml;
use foreman::store::{StateStore, StoreOptions};

pub fn cmd_init(config: &Config) -> Result<()> {
    let was_initialized = config.is_initialized();

    config.ensure_directories()?;
    StateStore::open(config.state_root(), StoreOptions::default())?;

    if was_initialized {
        println!(
            "Foreman project already initialized at {}",
            config.foreman_dir.display()
        );
        println!("Directory structure verified.");
        return Ok(());
    }

    ForemanToml::default().save(&config.config_file)?;

    println!(
        "Initialized foreman project at {}",
        config.foreman_dir.display()
    );
    println!();
    println!("Created directory structure:");
    println!("  .foreman/");
    println!("  ├── foreman.toml   # Worker command, timeouts, retry budget");
    println!("  ├── context/       # Project notes (*.md) handed to every worker");
    println!("  ├── state/         # Agent and task records");
    println!("  ├── logs/          # Worker output, one file per agent");
    println!("  ├── results/       # Worker artifacts, one directory per agent");
    println!("  └── archive/       # Records retired by `foreman cleanup`");
    println!();
    println!("Next steps:");
    println!("  1. Point [worker] command in foreman.toml at your worker executable");
    println!("  2. Describe your stack and conventions in .foreman/context/*.md");
    println!("  3. Run `foreman run \"<request>\"`");

    Ok(())
}
