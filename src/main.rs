//! CLI Entry Point for labctl
//!
//! Provides command-line access to the module manager:
//! - `check`: load and validate a module configuration
//! - `run`: activate modules and keep them up until Ctrl+C
//! - `status` / `clear-status`: inspect or erase persisted status variables
//! - `classes`: list registered module classes
//!
//! # Usage
//!
//! ```bash
//! labctl check --modules config/modules.toml
//! labctl run odmr_logic
//! labctl status microwave
//! ```

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use labctl::logging::{self, LoggingConfig};
use labctl::modules::{FileStatusStore, ModuleManager};
use labctl::settings::Settings;
use labctl::ModuleSet;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "labctl")]
#[command(about = "Module lifecycle manager for laboratory instrument control", long_about = None)]
struct Cli {
    /// Settings file (defaults to config/labctl.toml)
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// Module configuration, overriding the settings file
    #[arg(long, global = true)]
    modules: Option<PathBuf>,

    /// Status record directory, overriding the settings file
    #[arg(long, global = true)]
    status_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the module configuration and print activation orders
    Check,

    /// Activate modules and keep them running until Ctrl+C
    Run {
        /// Modules to activate (defaults to modules.autostart)
        modules: Vec<String>,
    },

    /// Print the persisted status variables of a module
    Status {
        /// Module name
        module: String,
    },

    /// Erase the persisted status variables of a module
    ClearStatus {
        /// Module name
        module: String,
    },

    /// List registered module classes
    Classes,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = Settings::load(cli.settings.as_deref()).context("Failed to load settings")?;
    if let Some(modules) = cli.modules {
        settings.modules.config = modules;
    }
    if let Some(directory) = cli.status_dir {
        settings.status.directory = Some(directory);
    }
    settings.validate().map_err(|e| anyhow!(e))?;

    logging::init(&LoggingConfig::from_settings(&settings).map_err(|e| anyhow!(e))?)?;

    match cli.command {
        Commands::Check => check(&settings),
        Commands::Run { modules } => run(&settings, modules).await,
        Commands::Status { module } => show_status(&settings, &module),
        Commands::ClearStatus { module } => clear_status(&settings, &module).await,
        Commands::Classes => {
            let registry = labctl::builtin_registry();
            for id in registry.list_types() {
                if let Some(class) = registry.get(&id) {
                    println!("{:<20} {:<9} {}", id, class.base(), class.description());
                }
            }
            Ok(())
        }
    }
}

fn build_manager(settings: &Settings) -> Result<ModuleManager> {
    let path = &settings.modules.config;
    let modules = ModuleSet::load(path)
        .with_context(|| format!("Failed to load module configuration {}", path.display()))?;
    let store = Arc::new(FileStatusStore::new(settings.status_directory()));
    let manager = ModuleManager::new(modules, Arc::new(labctl::builtin_registry()), store)
        .context("Module configuration rejected")?;
    Ok(manager)
}

fn check(settings: &Settings) -> Result<()> {
    let manager = build_manager(settings)?;
    let mut failed = false;

    for name in manager.module_names() {
        match manager.resolve(&name) {
            Ok(order) => println!("{name}: {}", order.join(" -> ")),
            Err(e) => {
                failed = true;
                println!("{name}: {e}");
            }
        }
    }

    if failed {
        return Err(anyhow!("module configuration has unresolvable modules"));
    }
    println!(
        "{} modules OK ({})",
        manager.module_names().len(),
        settings.modules.config.display()
    );
    Ok(())
}

async fn run(settings: &Settings, modules: Vec<String>) -> Result<()> {
    let manager = build_manager(settings)?;
    let targets = if modules.is_empty() {
        settings.modules.autostart.clone()
    } else {
        modules
    };
    if targets.is_empty() {
        return Err(anyhow!(
            "nothing to run: name modules or set modules.autostart"
        ));
    }

    let mut events = manager.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            info!(
                module = %event.module,
                from = %event.old_state,
                to = %event.new_state,
                "State changed"
            );
        }
    });

    for target in &targets {
        if let Err(e) = manager.activate(target).await {
            error!(module = %target, error = %e, "Activation failed");
            manager.deactivate_all().await.ok();
            return Err(e).with_context(|| format!("Failed to activate '{target}'"));
        }
    }

    info!(
        active = ?manager.active_modules(),
        "{} running - press Ctrl+C to stop",
        settings.application.name
    );
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;

    info!("Shutting down");
    manager.deactivate_all().await?;
    Ok(())
}

fn show_status(settings: &Settings, module: &str) -> Result<()> {
    let store = FileStatusStore::new(settings.status_directory());
    match store.read_record(module)? {
        Some(record) => println!("{}", serde_json::to_string_pretty(&record)?),
        None => println!(
            "No status variables saved for '{module}' in {}",
            store.directory().display()
        ),
    }
    Ok(())
}

async fn clear_status(settings: &Settings, module: &str) -> Result<()> {
    let manager = build_manager(settings)?;
    manager.clear_status_variables(module).await?;
    println!(
        "Cleared status variables of '{module}' in {}",
        settings.status_directory().display()
    );
    Ok(())
}
