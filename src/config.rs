//! Module configuration model.
//!
//! A configuration document declares named module instances: their base kind
//! (hardware, logic or GUI), the implementation class, constructor options and
//! the connectors wiring them to other modules. Loading is fail-fast: a single
//! malformed entry rejects the whole document with a [`ConfigError`].
//!
//! # Document format
//!
//! ```toml
//! [[modules]]
//! name = "laser"
//! base = "hardware"
//! module_class = "mock.laser"
//! [modules.options]
//! max_power_w = 2.0
//!
//! [[modules]]
//! name = "scan_logic"
//! base = "logic"
//! module_class = "logic.odmr_scan"
//! [modules.connectors]
//! laser = "laser"
//! ```
//!
//! The same structure is accepted as YAML (`modules:` sequence). Declaration
//! order is preserved; the dependency resolver uses it as its tie-break.

pub mod dependencies;

use crate::error::ConfigError;
use figment::{
    providers::{Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info};

/// Constructor options of a module, keyed by option name.
pub type ModuleOptions = BTreeMap<String, serde_json::Value>;

/// Typed access to [`ModuleOptions`] for module factories.
///
/// Absent keys yield `Ok(None)`; present keys of the wrong type are errors.
pub trait OptionsExt {
    /// Reads a numeric option.
    fn get_f64(&self, key: &str) -> anyhow::Result<Option<f64>>;
    /// Reads a non-negative integer option.
    fn get_u64(&self, key: &str) -> anyhow::Result<Option<u64>>;
    /// Reads a boolean option.
    fn get_bool(&self, key: &str) -> anyhow::Result<Option<bool>>;
    /// Reads a string option.
    fn get_str(&self, key: &str) -> anyhow::Result<Option<&str>>;
}

impl OptionsExt for ModuleOptions {
    fn get_f64(&self, key: &str) -> anyhow::Result<Option<f64>> {
        typed(self, key, "a number", serde_json::Value::as_f64)
    }

    fn get_u64(&self, key: &str) -> anyhow::Result<Option<u64>> {
        typed(self, key, "a non-negative integer", serde_json::Value::as_u64)
    }

    fn get_bool(&self, key: &str) -> anyhow::Result<Option<bool>> {
        typed(self, key, "a boolean", serde_json::Value::as_bool)
    }

    fn get_str(&self, key: &str) -> anyhow::Result<Option<&str>> {
        typed(self, key, "a string", serde_json::Value::as_str)
    }
}

fn typed<'a, T>(
    options: &'a ModuleOptions,
    key: &str,
    expected: &str,
    convert: impl Fn(&'a serde_json::Value) -> Option<T>,
) -> anyhow::Result<Option<T>> {
    match options.get(key) {
        None => Ok(None),
        Some(value) => convert(value)
            .map(Some)
            .ok_or_else(|| anyhow::anyhow!("option '{key}' must be {expected}, got {value}")),
    }
}

/// Classification of a module. Restricts which modules it may connect to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleBase {
    /// Thin wrapper around an instrument.
    Hardware,
    /// Measurement or control logic built on hardware and other logic.
    Logic,
    /// Front-end presenting logic modules.
    Gui,
}

impl ModuleBase {
    /// Whether a module of this base may hold a connector to `target`.
    ///
    /// GUI modules talk to logic only, logic may use logic or hardware and
    /// hardware may only build on other hardware.
    pub fn can_connect_to(self, target: ModuleBase) -> bool {
        matches!(
            (self, target),
            (ModuleBase::Gui, ModuleBase::Logic)
                | (ModuleBase::Logic, ModuleBase::Logic)
                | (ModuleBase::Logic, ModuleBase::Hardware)
                | (ModuleBase::Hardware, ModuleBase::Hardware)
        )
    }

    /// Lowercase name as used in configuration documents.
    pub fn as_str(self) -> &'static str {
        match self {
            ModuleBase::Hardware => "hardware",
            ModuleBase::Logic => "logic",
            ModuleBase::Gui => "gui",
        }
    }
}

impl fmt::Display for ModuleBase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModuleBase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "hardware" => Ok(ModuleBase::Hardware),
            "logic" => Ok(ModuleBase::Logic),
            "gui" => Ok(ModuleBase::Gui),
            other => Err(other.to_string()),
        }
    }
}

/// Declaration of one module instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleConfig {
    /// Unique module name.
    pub name: String,
    /// Base kind of the module.
    pub base: ModuleBase,
    /// Identifier of the registered implementation class.
    pub module_class: String,
    /// Constructor options handed to the class factory.
    #[serde(default)]
    pub options: ModuleOptions,
    /// Connector name -> name of the module it connects to.
    #[serde(default)]
    pub connectors: BTreeMap<String, String>,
}

impl ModuleConfig {
    /// Creates a declaration without options or connectors.
    pub fn new(name: impl Into<String>, base: ModuleBase, module_class: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base,
            module_class: module_class.into(),
            options: ModuleOptions::new(),
            connectors: BTreeMap::new(),
        }
    }

    /// Adds a connector to another module.
    pub fn with_connector(mut self, connector: impl Into<String>, target: impl Into<String>) -> Self {
        self.connectors.insert(connector.into(), target.into());
        self
    }

    /// Sets a constructor option.
    pub fn with_option(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.options.insert(key.into(), value);
        self
    }
}

/// Entry as written in a document, before the base kind is checked.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawModule {
    name: String,
    base: String,
    #[serde(alias = "class")]
    module_class: String,
    #[serde(default)]
    options: ModuleOptions,
    #[serde(default, alias = "connect")]
    connectors: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawDocument {
    #[serde(default)]
    modules: Vec<RawModule>,
}

impl RawDocument {
    fn into_module_set(self) -> Result<ModuleSet, ConfigError> {
        let modules = self
            .modules
            .into_iter()
            .map(|raw| {
                let base = raw.base.parse().map_err(|base| ConfigError::UnknownBase {
                    module: raw.name.clone(),
                    base,
                })?;
                Ok(ModuleConfig {
                    name: raw.name,
                    base,
                    module_class: raw.module_class,
                    options: raw.options,
                    connectors: raw.connectors,
                })
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;
        ModuleSet::new(modules)
    }
}

/// Validated, ordered set of module declarations.
///
/// Invariants held at all times:
/// - module names are unique and well-formed,
/// - every connector targets a declared module of a compatible base.
///
/// Connector cycles are not rejected here; they are reported by
/// [`dependencies::DependencyResolver`] when a module in the cycle is resolved.
#[derive(Debug, Clone, Default)]
pub struct ModuleSet {
    modules: Vec<ModuleConfig>,
}

impl ModuleSet {
    /// Validates and wraps a list of declarations.
    pub fn new(modules: Vec<ModuleConfig>) -> Result<Self, ConfigError> {
        validate(&modules)?;
        Ok(Self { modules })
    }

    /// Parses a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let raw: RawDocument =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        raw.into_module_set()
    }

    /// Parses a YAML document.
    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        let raw: RawDocument =
            serde_yaml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        raw.into_module_set()
    }

    /// Loads a document from disk, choosing the format from the extension.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.is_file() {
            return Err(ConfigError::Io {
                path: path.display().to_string(),
                message: "file not found".to_string(),
            });
        }

        debug!("Loading module configuration from: {}", path.display());

        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();

        let set = match extension.as_str() {
            "toml" => {
                let raw: RawDocument = Figment::new()
                    .merge(Toml::file(path))
                    .extract()
                    .map_err(|e| ConfigError::Parse(e.to_string()))?;
                raw.into_module_set()?
            }
            "yaml" | "yml" => {
                let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
                    path: path.display().to_string(),
                    message: e.to_string(),
                })?;
                Self::from_yaml_str(&content)?
            }
            other => return Err(ConfigError::UnsupportedFormat(other.to_string())),
        };

        info!(
            "Loaded {} module declarations from {}",
            set.len(),
            path.display()
        );
        Ok(set)
    }

    /// Looks up a declaration by name.
    pub fn get(&self, name: &str) -> Option<&ModuleConfig> {
        self.modules.iter().find(|m| m.name == name)
    }

    /// Whether a module with this name is declared.
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Declaration index of a module; the resolver's tie-break.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.modules.iter().position(|m| m.name == name)
    }

    /// Declarations in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = &ModuleConfig> {
        self.modules.iter()
    }

    /// Module names in declaration order.
    pub fn names(&self) -> Vec<String> {
        self.modules.iter().map(|m| m.name.clone()).collect()
    }

    /// Number of declared modules.
    pub fn len(&self) -> usize {
        self.modules.len()
    }

    /// Whether no module is declared.
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Names of modules holding a connector to `name`, in declaration order.
    pub fn direct_dependents(&self, name: &str) -> Vec<String> {
        self.modules
            .iter()
            .filter(|m| m.connectors.values().any(|target| target == name))
            .map(|m| m.name.clone())
            .collect()
    }

    /// Adds (or, with `allow_overwrite`, replaces) a declaration.
    ///
    /// The change is validated against the whole set before it is committed;
    /// on error the set is left untouched. A replaced module keeps its
    /// declaration position.
    pub fn add_module(
        &mut self,
        config: ModuleConfig,
        allow_overwrite: bool,
    ) -> Result<(), ConfigError> {
        let mut candidate = self.modules.clone();
        match candidate.iter().position(|m| m.name == config.name) {
            Some(_) if !allow_overwrite => {
                return Err(ConfigError::DuplicateModule(config.name));
            }
            Some(index) => candidate[index] = config,
            None => candidate.push(config),
        }
        validate(&candidate)?;
        self.modules = candidate;
        Ok(())
    }

    /// Removes a declaration that no other module connects to.
    pub fn remove_module(&mut self, name: &str) -> Result<ModuleConfig, ConfigError> {
        let index = self
            .position(name)
            .ok_or_else(|| ConfigError::UnknownModule(name.to_string()))?;
        let dependents: Vec<String> = self
            .direct_dependents(name)
            .into_iter()
            .filter(|d| d != name)
            .collect();
        if !dependents.is_empty() {
            return Err(ConfigError::StillReferenced {
                module: name.to_string(),
                dependents,
            });
        }
        Ok(self.modules.remove(index))
    }
}

/// Module names key on-disk status records, so they are kept path-safe.
fn is_valid_module_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_lowercase())
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
}

fn validate(modules: &[ModuleConfig]) -> Result<(), ConfigError> {
    let mut seen = std::collections::HashSet::new();
    for module in modules {
        if !is_valid_module_name(&module.name) {
            return Err(ConfigError::InvalidModuleName(module.name.clone()));
        }
        if !seen.insert(module.name.as_str()) {
            return Err(ConfigError::DuplicateModule(module.name.clone()));
        }
    }

    for module in modules {
        for (connector, target) in &module.connectors {
            let Some(target_module) = modules.iter().find(|m| &m.name == target) else {
                return Err(ConfigError::DanglingConnector {
                    module: module.name.clone(),
                    connector: connector.clone(),
                    target: target.clone(),
                });
            };
            if !module.base.can_connect_to(target_module.base) {
                return Err(ConfigError::IncompatibleConnector {
                    module: module.name.clone(),
                    module_base: module.base.to_string(),
                    connector: connector.clone(),
                    target: target.clone(),
                    target_base: target_module.base.to_string(),
                });
            }
        }
    }

    Ok(())
}
