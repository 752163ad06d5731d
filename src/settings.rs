//! Application settings using Figment
//!
//! Settings are layered, later sources winning:
//! 1. built-in defaults
//! 2. `config/labctl.toml` (or the file given on the command line)
//! 3. environment variables prefixed with `LABCTL_`, nested keys separated
//!    by a double underscore
//!
//! # Example
//! ```no_run
//! use labctl::settings::Settings;
//!
//! // LABCTL_APPLICATION__LOG_LEVEL=debug overrides [application] log_level
//! let settings = Settings::load(None)?;
//! settings.validate()?;
//! println!("modules from {}", settings.modules.config.display());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use crate::logging::{parse_log_level, LogFormat};
use crate::modules::status::FileStatusStore;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default location of the settings file.
pub const DEFAULT_SETTINGS_PATH: &str = "config/labctl.toml";

/// Top-level settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationSettings,
    /// Module configuration settings
    #[serde(default)]
    pub modules: ModulesSettings,
    /// Status variable persistence
    #[serde(default)]
    pub status: StatusSettings,
}

/// `[application]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationSettings {
    /// Application name, used in log output
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format
    #[serde(default)]
    pub log_format: LogFormat,
}

/// `[modules]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModulesSettings {
    /// Module configuration document (.toml, .yaml or .yml)
    #[serde(default = "default_modules_config")]
    pub config: PathBuf,
    /// Modules activated by `labctl run` when none are named
    #[serde(default)]
    pub autostart: Vec<String>,
}

/// `[status]` section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusSettings {
    /// Directory for status records; the per-user data directory when unset
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

fn default_name() -> String {
    "labctl".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_modules_config() -> PathBuf {
    PathBuf::from("config/modules.toml")
}

impl Default for ApplicationSettings {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            log_format: LogFormat::default(),
        }
    }
}

impl Default for ModulesSettings {
    fn default() -> Self {
        Self {
            config: default_modules_config(),
            autostart: Vec::new(),
        }
    }
}

impl Settings {
    /// Loads settings from `path` (or [`DEFAULT_SETTINGS_PATH`]) and the
    /// environment.
    ///
    /// A missing file is not an error; defaults and environment still apply.
    pub fn load(path: Option<&Path>) -> Result<Self, figment::Error> {
        Self::figment(path.unwrap_or_else(|| Path::new(DEFAULT_SETTINGS_PATH))).extract()
    }

    /// The layered provider chain, exposed for callers adding their own layers.
    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("LABCTL_").split("__"))
    }

    /// Validate settings after loading
    pub fn validate(&self) -> Result<(), String> {
        parse_log_level(&self.application.log_level)?;

        if self.modules.config.as_os_str().is_empty() {
            return Err("modules.config must name a module configuration file".to_string());
        }

        if let Some(duplicate) = self
            .modules
            .autostart
            .iter()
            .enumerate()
            .find(|(i, name)| self.modules.autostart[..*i].contains(*name))
            .map(|(_, name)| name)
        {
            return Err(format!("modules.autostart lists '{}' twice", duplicate));
        }

        Ok(())
    }

    /// Directory used for status records.
    ///
    /// Falls back to the per-user data directory, then to `./status`.
    pub fn status_directory(&self) -> PathBuf {
        self.status
            .directory
            .clone()
            .or_else(FileStatusStore::default_directory)
            .unwrap_or_else(|| PathBuf::from("status"))
    }
}
