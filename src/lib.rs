//! # labctl
//!
//! Module lifecycle and dependency management for laboratory instrument
//! control. A configuration document declares named modules (hardware
//! drivers, measurement logic, GUIs) and wires them together through
//! connectors; labctl instantiates them, activates them in dependency order,
//! persists their status variables across restarts and tears them down
//! again in reverse order.
//!
//! ## Crate Structure
//!
//! - **`config`**: Module declarations ([`config::ModuleSet`]) loaded from TOML
//!   or YAML, plus the dependency resolver.
//! - **`modules`**: The [`modules::Module`] trait, the class registry and the
//!   [`modules::ModuleManager`] that drives the lifecycle state machine.
//! - **`hardware`**: Capability traits and simulated instruments.
//! - **`logic`**: Measurement logic modules built on those capabilities.
//! - **`settings`**: Application settings (Figment: file plus `LABCTL_` env).
//! - **`logging`**: `tracing-subscriber` setup.
//! - **`error`**: [`error::ConfigError`] and [`error::ModuleError`].
//!
//! ## Example
//!
//! ```rust,ignore
//! let modules = ModuleSet::load(Path::new("config/modules.toml"))?;
//! let store = Arc::new(FileStatusStore::new("status"));
//! let manager = ModuleManager::new(modules, Arc::new(labctl::builtin_registry()), store)?;
//!
//! manager.activate("odmr_logic").await?;
//! let odmr = manager.instance_as::<OdmrScanLogic>("odmr_logic").unwrap();
//! odmr.run_sweep().await?;
//! manager.deactivate_all().await?;
//! ```

pub mod config;
pub mod error;
pub mod hardware;
pub mod logging;
pub mod logic;
pub mod modules;
pub mod settings;

pub use config::{ModuleBase, ModuleConfig, ModuleSet};
pub use error::{ConfigError, ModuleError, ModuleResult};
pub use modules::{Module, ModuleClass, ModuleManager, ModuleRegistry, ModuleState};

/// Registry with every module class shipped with labctl.
pub fn builtin_registry() -> ModuleRegistry {
    let mut registry = ModuleRegistry::new();
    hardware::register_builtin(&mut registry);
    logic::register_builtin(&mut registry);
    registry
}
