//! Module system: the capability-set interface every hardware, logic or GUI
//! module implements, and the registry of module classes the manager
//! instantiates them from.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐  declares   ┌──────────────┐
//! │  ModuleRegistry  │────────────>│ ModuleClass  │ base, capabilities,
//! └──────────────────┘             │              │ connectors, options,
//!          │                       │              │ status variables,
//!          │ validate(ModuleSet)   │   factory ───┼──> Arc<dyn Module>
//!          ↓                       └──────────────┘
//! ┌──────────────────┐  one per module  ┌──────────────────┐
//! │  ModuleManager   │─────────────────>│ ModuleDescriptor │
//! └──────────────────┘                  └──────────────────┘
//! ```
//!
//! Drivers implement [`Module`] plus the capability traits from
//! [`crate::hardware::capabilities`] they support. The manager hands each
//! module its [`Connectors`] when it activates; connectors are weak, so a
//! module never keeps a dependency's instance alive on its own.
//!
//! # Lifecycle
//!
//! ```text
//! Deactivated ──activate──> Activating ──ok──> Activated
//!      ↑                        │                  │
//!      │                       err             deactivate
//!      │                        ↓                  ↓
//!      └──────reset──────── ErrorState <──err── Deactivating ──ok──> Deactivated
//! ```
//!
//! # Examples
//!
//! ```rust
//! use labctl::config::ModuleBase;
//! use labctl::modules::{Connectors, Module, ModuleClass, ModuleRegistry};
//! use async_trait::async_trait;
//! use std::sync::Arc;
//!
//! struct Shutter;
//!
//! #[async_trait]
//! impl Module for Shutter {
//!     async fn on_activate(&self, _connectors: Connectors) -> anyhow::Result<()> {
//!         Ok(())
//!     }
//!
//!     async fn on_deactivate(&self) -> anyhow::Result<()> {
//!         Ok(())
//!     }
//! }
//!
//! let mut registry = ModuleRegistry::new();
//! registry.register(
//!     ModuleClass::new("demo.shutter", ModuleBase::Hardware, |_options| {
//!         Ok(Arc::new(Shutter) as Arc<dyn Module>)
//!     })
//!     .with_option("port", None, labctl::modules::MissingPolicy::Error),
//! );
//! assert_eq!(registry.list_types(), vec!["demo.shutter"]);
//! ```

pub mod descriptor;
pub mod events;
pub mod manager;
pub mod status;

use crate::config::{ModuleBase, ModuleConfig, ModuleOptions, ModuleSet};
use crate::error::ConfigError;
use crate::hardware::capabilities::{Capability, LaserControl, MicrowaveSource};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Weak};
use tracing::{info, warn};

pub use descriptor::{ModuleDescriptor, ModuleInfo, ModuleState};
pub use events::{EventBus, ModuleObserver, ModuleStateChanged, ObserverId};
pub use manager::{ModuleManager, ReloadReport};
pub use status::{FileStatusStore, MemoryStatusStore, StatusRecord, StatusStore, StatusStoreError};

/// Status variable name → value.
pub type StatusVariables = BTreeMap<String, serde_json::Value>;

/// Constructor registered for a module class.
pub type ModuleFactory = Arc<dyn Fn(&ModuleOptions) -> Result<Arc<dyn Module>> + Send + Sync>;

/// Upcast helper so live instances can be downcast to their concrete type.
///
/// Implemented for every `'static` type; module authors never implement it.
pub trait AsAny: Any + Send + Sync {
    /// Converts a shared instance into a type-erased `Arc`.
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T: Any + Send + Sync> AsAny for T {
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Base trait for all hardware, logic and GUI modules.
///
/// # Hooks
///
/// - **on_activate()**: acquire resources; connectors to dependencies are
///   already resolved and their modules are Activated
/// - **on_deactivate()**: release resources; dependents are already gone
///
/// Hooks run on a spawned tokio task. An `Err` (or a panic) moves the module
/// to `ErrorState`; it never takes the manager down.
///
/// # Status Variables
///
/// Values the module wants to keep across activation cycles are exposed
/// through `get_status_variable` / `set_status_variable`. The manager writes
/// them *before* `on_activate` and reads them *before* `on_deactivate`.
///
/// # Thread Safety
///
/// Modules are shared as `Arc<dyn Module>`; use interior mutability for
/// state.
#[async_trait]
pub trait Module: AsAny {
    /// Called once per activation cycle.
    async fn on_activate(&self, connectors: Connectors) -> Result<()>;

    /// Called once per deactivation.
    async fn on_deactivate(&self) -> Result<()>;

    /// Current value of a status variable, `None` if the module does not
    /// track `name`.
    fn get_status_variable(&self, _name: &str) -> Option<serde_json::Value> {
        None
    }

    /// Restores a persisted status variable.
    ///
    /// # Errors
    /// Rejects unknown names and values of the wrong shape; the manager keeps
    /// the declared default in that case.
    fn set_status_variable(&self, name: &str, _value: serde_json::Value) -> Result<()> {
        Err(anyhow!("module has no status variable '{name}'"))
    }

    /// Access to the laser capability, if provided.
    fn as_laser(&self) -> Option<&dyn LaserControl> {
        None
    }

    /// Access to the microwave capability, if provided.
    fn as_microwave(&self) -> Option<&dyn MicrowaveSource> {
        None
    }
}

/// Downcasts a shared module to its concrete type.
pub fn downcast_module<T: Module>(module: Arc<dyn Module>) -> Option<Arc<T>> {
    <dyn Module as AsAny>::into_any(module).downcast::<T>().ok()
}

/// A resolved connector handed to `on_activate`.
///
/// Holds a weak reference; the target module is owned by its own descriptor.
#[derive(Clone)]
pub struct Connector {
    name: String,
    target: String,
    instance: Weak<dyn Module>,
}

impl Connector {
    pub(crate) fn new(name: &str, target: &str, instance: &Arc<dyn Module>) -> Self {
        Self {
            name: name.to_string(),
            target: target.to_string(),
            instance: Arc::downgrade(instance),
        }
    }

    /// Connector name as declared by the module class.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the connected module.
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Whether the target instance is still alive.
    pub fn is_connected(&self) -> bool {
        self.instance.strong_count() > 0
    }

    /// Upgrades to the target instance.
    ///
    /// # Errors
    /// Fails once the target has been deactivated.
    pub fn get(&self) -> Result<Arc<dyn Module>> {
        self.instance.upgrade().ok_or_else(|| {
            anyhow!(
                "connector '{}' lost module '{}' (deactivated)",
                self.name,
                self.target
            )
        })
    }

    /// Upgrades and downcasts to the target's concrete type.
    pub fn get_as<T: Module>(&self) -> Result<Arc<T>> {
        downcast_module::<T>(self.get()?).ok_or_else(|| {
            anyhow!(
                "module '{}' on connector '{}' is not a {}",
                self.target,
                self.name,
                std::any::type_name::<T>()
            )
        })
    }
}

impl fmt::Debug for Connector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connector")
            .field("name", &self.name)
            .field("target", &self.target)
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// Connectors of one module, keyed by connector name.
#[derive(Clone, Debug, Default)]
pub struct Connectors {
    links: BTreeMap<String, Connector>,
}

impl Connectors {
    pub(crate) fn insert(&mut self, connector: Connector) {
        self.links.insert(connector.name.clone(), connector);
    }

    /// Looks up a wired connector; optional connectors may be absent.
    pub fn get(&self, name: &str) -> Option<&Connector> {
        self.links.get(name)
    }

    /// Looks up a connector that must be wired.
    pub fn require(&self, name: &str) -> Result<&Connector> {
        self.links
            .get(name)
            .ok_or_else(|| anyhow!("connector '{name}' is not wired"))
    }

    /// Names of the wired connectors.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.links.keys().map(String::as_str)
    }

    /// Number of wired connectors.
    pub fn len(&self) -> usize {
        self.links.len()
    }

    /// Whether no connector is wired.
    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }
}

/// What happens when an option is absent from a declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissingPolicy {
    /// Registration fails with `ConfigError::MissingOption`.
    Error,
    /// Log at `warn` and fall back to the default.
    Warn,
    /// Log at `info` and fall back to the default.
    Info,
    /// Fall back to the default silently.
    Silent,
}

/// Declared constructor option.
#[derive(Debug, Clone)]
pub struct OptionSpec {
    /// Option key in the declaration.
    pub name: String,
    /// Value used when the key is absent.
    pub default: Option<serde_json::Value>,
    /// Policy when the key is absent.
    pub missing: MissingPolicy,
}

/// Declared connector.
#[derive(Debug, Clone)]
pub struct ConnectorSpec {
    /// Connector name.
    pub name: String,
    /// Capability the target's class must provide, if any.
    pub capability: Option<Capability>,
    /// Whether the declaration may leave the connector unwired.
    pub optional: bool,
}

/// Declared status variable.
#[derive(Debug, Clone)]
pub struct StatusVariableSpec {
    /// Variable name.
    pub name: String,
    /// Value used when nothing was persisted.
    pub default: serde_json::Value,
}

/// A registered module implementation: its declarations plus a factory.
#[derive(Clone)]
pub struct ModuleClass {
    id: String,
    base: ModuleBase,
    description: String,
    capabilities: Vec<Capability>,
    connectors: Vec<ConnectorSpec>,
    options: Vec<OptionSpec>,
    status_variables: Vec<StatusVariableSpec>,
    factory: ModuleFactory,
}

impl ModuleClass {
    /// Creates a class with the given identifier, base kind and factory.
    pub fn new<F>(id: impl Into<String>, base: ModuleBase, factory: F) -> Self
    where
        F: Fn(&ModuleOptions) -> Result<Arc<dyn Module>> + Send + Sync + 'static,
    {
        Self {
            id: id.into(),
            base,
            description: String::new(),
            capabilities: Vec::new(),
            connectors: Vec::new(),
            options: Vec::new(),
            status_variables: Vec::new(),
            factory: Arc::new(factory),
        }
    }

    /// Sets a human-readable description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Declares a capability instances of this class provide.
    pub fn with_capability(mut self, capability: Capability) -> Self {
        if !self.capabilities.contains(&capability) {
            self.capabilities.push(capability);
        }
        self
    }

    /// Declares a required connector.
    pub fn with_connector(mut self, name: impl Into<String>, capability: Option<Capability>) -> Self {
        self.connectors.push(ConnectorSpec {
            name: name.into(),
            capability,
            optional: false,
        });
        self
    }

    /// Declares a connector the configuration may leave unwired.
    pub fn with_optional_connector(
        mut self,
        name: impl Into<String>,
        capability: Option<Capability>,
    ) -> Self {
        self.connectors.push(ConnectorSpec {
            name: name.into(),
            capability,
            optional: true,
        });
        self
    }

    /// Declares a constructor option.
    pub fn with_option(
        mut self,
        name: impl Into<String>,
        default: Option<serde_json::Value>,
        missing: MissingPolicy,
    ) -> Self {
        self.options.push(OptionSpec {
            name: name.into(),
            default,
            missing,
        });
        self
    }

    /// Declares a persisted status variable.
    pub fn with_status_variable(mut self, name: impl Into<String>, default: serde_json::Value) -> Self {
        self.status_variables.push(StatusVariableSpec {
            name: name.into(),
            default,
        });
        self
    }

    /// Class identifier referenced by `module_class` in declarations.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Base kind of the class.
    pub fn base(&self) -> ModuleBase {
        self.base
    }

    /// Human-readable description.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Declared capabilities.
    pub fn capabilities(&self) -> &[Capability] {
        &self.capabilities
    }

    /// Whether the class provides `capability`.
    pub fn provides(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    /// Declared connectors.
    pub fn connectors(&self) -> &[ConnectorSpec] {
        &self.connectors
    }

    /// Declared options.
    pub fn options(&self) -> &[OptionSpec] {
        &self.options
    }

    /// Declared status variables.
    pub fn status_variables(&self) -> &[StatusVariableSpec] {
        &self.status_variables
    }

    /// Declared status variables with their defaults.
    pub fn default_status_variables(&self) -> StatusVariables {
        self.status_variables
            .iter()
            .map(|spec| (spec.name.clone(), spec.default.clone()))
            .collect()
    }

    /// Options for `config` with declared defaults filled in.
    pub fn options_for(&self, config: &ModuleConfig) -> ModuleOptions {
        let mut options = config.options.clone();
        for spec in &self.options {
            if let (false, Some(default)) = (options.contains_key(&spec.name), &spec.default) {
                options.insert(spec.name.clone(), default.clone());
            }
        }
        options
    }

    /// Builds a fresh instance from resolved options.
    pub(crate) fn instantiate(&self, options: &ModuleOptions) -> Result<Arc<dyn Module>> {
        (self.factory)(options)
    }

    /// Checks one declaration against this class.
    ///
    /// Logs absent options whose policy is `Warn` / `Info`.
    fn check(
        &self,
        config: &ModuleConfig,
        modules: &ModuleSet,
        registry: &ModuleRegistry,
    ) -> Result<(), ConfigError> {
        if config.base != self.base {
            return Err(ConfigError::BaseMismatch {
                module: config.name.clone(),
                module_class: self.id.clone(),
                declared: config.base.to_string(),
                expected: self.base.to_string(),
            });
        }

        for connector in config.connectors.keys() {
            if !self.connectors.iter().any(|spec| &spec.name == connector) {
                return Err(ConfigError::UnknownConnector {
                    module: config.name.clone(),
                    module_class: self.id.clone(),
                    connector: connector.clone(),
                });
            }
        }

        for spec in &self.connectors {
            let Some(target) = config.connectors.get(&spec.name) else {
                if spec.optional {
                    continue;
                }
                return Err(ConfigError::MissingConnector {
                    module: config.name.clone(),
                    connector: spec.name.clone(),
                });
            };
            let Some(capability) = spec.capability else {
                continue;
            };
            let provided = modules
                .get(target)
                .and_then(|target| registry.get(&target.module_class))
                .map(|class| class.provides(capability))
                .unwrap_or(false);
            if !provided {
                return Err(ConfigError::MissingCapability {
                    module: config.name.clone(),
                    connector: spec.name.clone(),
                    target: target.clone(),
                    capability: capability.to_string(),
                });
            }
        }

        for spec in &self.options {
            if config.options.contains_key(&spec.name) {
                continue;
            }
            match spec.missing {
                MissingPolicy::Error => {
                    return Err(ConfigError::MissingOption {
                        module: config.name.clone(),
                        option: spec.name.clone(),
                    });
                }
                MissingPolicy::Warn => warn!(
                    module = %config.name,
                    option = %spec.name,
                    default = ?spec.default,
                    "Option not configured, using default"
                ),
                MissingPolicy::Info => info!(
                    module = %config.name,
                    option = %spec.name,
                    default = ?spec.default,
                    "Option not configured, using default"
                ),
                MissingPolicy::Silent => {}
            }
        }

        Ok(())
    }
}

impl fmt::Debug for ModuleClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleClass")
            .field("id", &self.id)
            .field("base", &self.base)
            .field("capabilities", &self.capabilities)
            .field("connectors", &self.connectors)
            .field("options", &self.options)
            .field("status_variables", &self.status_variables)
            .finish_non_exhaustive()
    }
}

/// Registry of module classes.
///
/// Enables runtime module creation from configuration without hardcoding
/// module types.
///
/// # Examples
///
/// ```rust,ignore
/// let mut registry = ModuleRegistry::new();
/// labctl::hardware::register_builtin(&mut registry);
/// labctl::logic::register_builtin(&mut registry);
///
/// registry.validate(&modules)?;
/// ```
#[derive(Debug, Default)]
pub struct ModuleRegistry {
    classes: HashMap<String, ModuleClass>,
}

impl ModuleRegistry {
    /// Creates a new empty module registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a module class, replacing any class with the same id.
    pub fn register(&mut self, class: ModuleClass) {
        self.classes.insert(class.id.clone(), class);
    }

    /// Looks up a class by identifier.
    pub fn get(&self, id: &str) -> Option<&ModuleClass> {
        self.classes.get(id)
    }

    /// Whether a class with this identifier is registered.
    pub fn contains(&self, id: &str) -> bool {
        self.classes.contains_key(id)
    }

    /// Lists all registered class identifiers, sorted.
    pub fn list_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.classes.keys().cloned().collect();
        types.sort();
        types
    }

    /// Checks every declaration of `modules` against its class.
    ///
    /// # Errors
    ///
    /// The first failing check, in declaration order: `UnknownModuleClass`,
    /// `BaseMismatch`, `UnknownConnector`, `MissingConnector`,
    /// `MissingCapability` or `MissingOption`.
    pub fn validate(&self, modules: &ModuleSet) -> Result<(), ConfigError> {
        for config in modules.iter() {
            self.validate_module(config, modules)?;
        }
        Ok(())
    }

    /// Checks one declaration in the context of `modules`.
    pub fn validate_module(
        &self,
        config: &ModuleConfig,
        modules: &ModuleSet,
    ) -> Result<(), ConfigError> {
        let class = self
            .get(&config.module_class)
            .ok_or_else(|| ConfigError::UnknownModuleClass {
                module: config.name.clone(),
                module_class: config.module_class.clone(),
            })?;
        class.check(config, modules, self)
    }
}
