//! Error types for the module manager.
//!
//! This module defines the error taxonomy shared by the configuration model,
//! the dependency resolver and the lifecycle controller. Using the `thiserror`
//! crate, it provides a centralized and consistent way to report failures,
//! from malformed configuration documents to driver hooks that refuse to start.
//!
//! ## Error Hierarchy
//!
//! - **[`ConfigError`]**: Problems with the module declarations themselves
//!   (duplicate names, unknown base kinds, dangling connectors, classes that
//!   do not match their declaration). Fatal to a load; fix the input.
//! - **[`ModuleError`]**: Everything the lifecycle controller reports. Hook
//!   failures are captured here as `Activation` / `Deactivation` and the
//!   offending module is parked in `ErrorState`; they never escape as panics.
//!
//! Driver and logic hooks return `anyhow::Result`, matching the capability
//! traits. Their errors are boxed into the `source` of the lifecycle variants
//! so callers can still walk the cause chain.

use crate::modules::descriptor::ModuleState;
use thiserror::Error;

/// Boxed cause carried by hook failures.
pub type BoxedCause = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Convenience alias for results of lifecycle operations.
pub type ModuleResult<T> = std::result::Result<T, ModuleError>;

/// Errors raised while loading or validating module declarations.
///
/// Every variant is permanent: the configuration document (or the call to
/// `add_module` / `remove_module`) has to be corrected before retrying.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("Failed to read module configuration {path}: {message}")]
    Io {
        /// Path of the file involved.
        path: String,
        /// Underlying I/O error message.
        message: String,
    },

    /// The document is not valid TOML/YAML or does not match the schema.
    #[error("Failed to parse module configuration: {0}")]
    Parse(String),

    /// The file extension does not map to a supported document format.
    #[error("Unsupported module configuration format '{0}' (expected .toml, .yaml or .yml)")]
    UnsupportedFormat(String),

    /// Two declarations share the same module name.
    #[error("Duplicate module name '{0}'")]
    DuplicateModule(String),

    /// A module name cannot be used as a registry key.
    #[error("Invalid module name '{0}': use lowercase letters, digits, '_' or '-', starting with a letter")]
    InvalidModuleName(String),

    /// The `base` field is not one of hardware / logic / gui.
    #[error("Module '{module}' has unknown base kind '{base}' (expected hardware, logic or gui)")]
    UnknownBase {
        /// Module the error concerns.
        module: String,
        /// Base kind as written in the document.
        base: String,
    },

    /// A connector points at a module that is not declared.
    #[error("Connector '{connector}' of module '{module}' targets undeclared module '{target}'")]
    DanglingConnector {
        /// Module the error concerns.
        module: String,
        /// Connector name.
        connector: String,
        /// Module the connector points at.
        target: String,
    },

    /// A connector points at a module whose base kind may not be connected.
    #[error("Connector '{connector}' of {module_base} module '{module}' cannot target {target_base} module '{target}'")]
    IncompatibleConnector {
        /// Module the error concerns.
        module: String,
        /// Base kind of the connecting module.
        module_base: String,
        /// Connector name.
        connector: String,
        /// Module the connector points at.
        target: String,
        /// Base kind of the target module.
        target_base: String,
    },

    /// A module cannot be removed because other modules connect to it.
    #[error("Module '{module}' is still required by: {}", dependents.join(", "))]
    StillReferenced {
        /// Module the error concerns.
        module: String,
        /// Modules still connected to it.
        dependents: Vec<String>,
    },

    /// The named module is not part of the configuration.
    #[error("Module '{0}' is not declared")]
    UnknownModule(String),

    /// No class with this identifier has been registered.
    #[error("Module '{module}' uses unregistered module class '{module_class}'")]
    UnknownModuleClass {
        /// Module the error concerns.
        module: String,
        /// Class identifier.
        module_class: String,
    },

    /// The declaration's base kind differs from the registered class.
    #[error("Module '{module}' is declared as {declared} but class '{module_class}' is a {expected} class")]
    BaseMismatch {
        /// Module the error concerns.
        module: String,
        /// Class identifier.
        module_class: String,
        /// Base kind in the declaration.
        declared: String,
        /// Base kind of the class.
        expected: String,
    },

    /// A connector required by the class is not wired in the declaration.
    #[error("Module '{module}' is missing required connector '{connector}'")]
    MissingConnector {
        /// Module the error concerns.
        module: String,
        /// Connector name.
        connector: String,
    },

    /// A connector is wired that the class does not declare.
    #[error("Module '{module}' wires connector '{connector}' which class '{module_class}' does not declare")]
    UnknownConnector {
        /// Module the error concerns.
        module: String,
        /// Class identifier.
        module_class: String,
        /// Connector name.
        connector: String,
    },

    /// The connector target's class lacks the capability the connector needs.
    #[error("Connector '{connector}' of module '{module}' needs capability {capability}, which '{target}' does not provide")]
    MissingCapability {
        /// Module the error concerns.
        module: String,
        /// Connector name.
        connector: String,
        /// Module the connector points at.
        target: String,
        /// Capability the connector requires.
        capability: String,
    },

    /// A required constructor option is absent.
    #[error("Module '{module}' is missing required option '{option}'")]
    MissingOption {
        /// Module the error concerns.
        module: String,
        /// Option name.
        option: String,
    },
}

/// Errors reported by the lifecycle controller.
///
/// # Error Categories
///
/// 1. **Configuration** - `Config`, `UnknownModule`, `CyclicDependency`.
///    Nothing was started; fix the configuration.
/// 2. **Hook failures** - `Activation`, `Deactivation`. The module is now in
///    `ErrorState`; other modules are untouched. Recover with `reset`.
/// 3. **Ordering refusals** - `DependentsStillActive`, `DependencyNotActive`,
///    `InErrorState`, `InvalidState`. No state changed; retry after fixing
///    the precondition.
/// 4. **Non-fatal** - `StatusLoad` is logged, never returned from `activate`.
#[derive(Error, Debug)]
pub enum ModuleError {
    /// Configuration was rejected.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The named module is not declared.
    #[error("Unknown module '{0}'")]
    UnknownModule(String),

    /// The connector graph contains a cycle.
    #[error("Cyclic dependency: {}", cycle.join(" -> "))]
    CyclicDependency {
        /// Modules on the cycle, starting and ending with the same module.
        cycle: Vec<String>,
    },

    /// Instantiation, status loading or `on_activate` failed.
    #[error("Activation of module '{module}' failed: {source}")]
    Activation {
        /// Module the error concerns.
        module: String,
        /// Underlying cause.
        #[source]
        source: BoxedCause,
    },

    /// `on_deactivate` failed.
    #[error("Deactivation of module '{module}' failed: {source}")]
    Deactivation {
        /// Module the error concerns.
        module: String,
        /// Underlying cause.
        #[source]
        source: BoxedCause,
    },

    /// Live modules still hold connectors to the module.
    #[error("Module '{module}' is still in use by active modules: {}", dependents.join(", "))]
    DependentsStillActive {
        /// Module the error concerns.
        module: String,
        /// Modules still connected to it.
        dependents: Vec<String>,
    },

    /// A dependency is not active at the time the module tries to activate.
    #[error("Module '{module}' cannot activate: dependency '{dependency}' is not active")]
    DependencyNotActive {
        /// Module the error concerns.
        module: String,
        /// Dependency that is not Activated.
        dependency: String,
    },

    /// The module failed earlier and must be reset first.
    #[error("Module '{module}' is in error state{}; reset it before retrying", last_error.as_ref().map(|e| format!(" ({e})")).unwrap_or_default())]
    InErrorState {
        /// Module the error concerns.
        module: String,
        /// Message of the failure that caused the error state.
        last_error: Option<String>,
    },

    /// The operation is not allowed in the module's current state.
    #[error("Cannot {operation} module '{module}' while it is {state}")]
    InvalidState {
        /// Module the error concerns.
        module: String,
        /// State the module was in.
        state: ModuleState,
        /// Refused operation.
        operation: &'static str,
    },

    /// Persisted status variables could not be read.
    #[error("Failed to load status variables of module '{module}': {reason}")]
    StatusLoad {
        /// Module the error concerns.
        module: String,
        /// Why the record could not be used.
        reason: String,
    },

    /// The status store rejected a request made on behalf of the module.
    #[error("Status store failed for module '{module}': {source}")]
    StatusStore {
        /// Module the error concerns.
        module: String,
        /// Underlying cause.
        #[source]
        source: crate::modules::status::StatusStoreError,
    },

    /// Re-activation after a reload did not complete.
    #[error("Reload of module '{module}' stopped after re-activating [{}]: {source}", reactivated.join(", "))]
    ReloadFailed {
        /// Module the error concerns.
        module: String,
        /// Modules that were activated again before the failure.
        reactivated: Vec<String>,
        /// Underlying cause.
        #[source]
        source: Box<ModuleError>,
    },

    /// One or more modules failed to deactivate during shutdown.
    #[error("Shutdown failed: {}", .0.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("; "))]
    ShutdownFailed(Vec<ModuleError>),
}

impl ModuleError {
    /// Name of the module the error is about, if it concerns a single module.
    pub fn module(&self) -> Option<&str> {
        match self {
            ModuleError::UnknownModule(module)
            | ModuleError::Activation { module, .. }
            | ModuleError::Deactivation { module, .. }
            | ModuleError::DependentsStillActive { module, .. }
            | ModuleError::DependencyNotActive { module, .. }
            | ModuleError::InErrorState { module, .. }
            | ModuleError::InvalidState { module, .. }
            | ModuleError::StatusLoad { module, .. }
            | ModuleError::StatusStore { module, .. }
            | ModuleError::ReloadFailed { module, .. } => Some(module),
            ModuleError::Config(_)
            | ModuleError::CyclicDependency { .. }
            | ModuleError::ShutdownFailed(_) => None,
        }
    }

    /// Whether retrying the same request can succeed without changing the
    /// configuration.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            ModuleError::Config(_)
                | ModuleError::UnknownModule(_)
                | ModuleError::CyclicDependency { .. }
        )
    }

    pub(crate) fn activation(module: &str, source: impl Into<BoxedCause>) -> Self {
        ModuleError::Activation {
            module: module.to_string(),
            source: source.into(),
        }
    }

    pub(crate) fn deactivation(module: &str, source: impl Into<BoxedCause>) -> Self {
        ModuleError::Deactivation {
            module: module.to_string(),
            source: source.into(),
        }
    }
}
