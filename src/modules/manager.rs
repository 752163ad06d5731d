//! Lifecycle controller.
//!
//! The [`ModuleManager`] owns one [`ModuleDescriptor`] per declared module and
//! drives modules through their state machine:
//!
//! - `activate` resolves the dependency closure and activates it in order,
//!   dependencies first; a failure parks the failing module in `ErrorState`
//!   and leaves already activated dependencies running.
//! - `deactivate` refuses while live modules still use the target, unless
//!   forced, in which case dependents are deactivated first.
//! - `reload` deactivates and re-activates a module with a fresh instance,
//!   bringing cascaded dependents back afterwards.
//! - `reset` is the only way out of `ErrorState`.
//!
//! # Locking
//!
//! - Per module, a `tokio::sync::Mutex` serialises transitions. It is held
//!   across the hook, so a second request for the same module waits and then
//!   re-evaluates the state (activating twice runs `on_activate` once).
//! - Manager-wide, a short `parking_lot::Mutex` gate covers every state
//!   change. "All dependencies Activated → Activating" and "no live dependent
//!   → Deactivating" are decided under it, so a dependency can never be torn
//!   down under a module that is still starting. The gate is also what orders
//!   published events.
//! - Lock order is gate → module table → descriptor data. None of them is
//!   held across an `.await`.
//! - Each single-module transition runs on a spawned task that owns the
//!   transition lock, so a cancelled caller (`timeout`, `select!`, an aborted
//!   task) never leaves a module stuck in Activating or Deactivating.
//!
//! # Example
//!
//! ```rust,ignore
//! let manager = ModuleManager::new(modules, Arc::new(registry), store)?;
//! manager.activate("scan_logic").await?;            // laser first, then scan_logic
//! manager.deactivate("laser", false).await;          // Err(DependentsStillActive)
//! manager.deactivate("laser", true).await?;          // scan_logic, then laser
//! ```

use super::descriptor::{DescriptorData, ModuleDescriptor, ModuleInfo, ModuleState};
use super::events::{EventBus, ModuleObserver, ModuleStateChanged, ObserverId};
use super::status::StatusStore;
use super::{downcast_module, Connector, Connectors, Module, ModuleClass, ModuleRegistry, StatusVariables};
use crate::config::dependencies::DependencyResolver;
use crate::config::{ModuleConfig, ModuleSet};
use crate::error::{ConfigError, ModuleError, ModuleResult};
use anyhow::anyhow;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Outcome of a successful [`ModuleManager::reload`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReloadReport {
    /// The reloaded module.
    pub module: String,
    /// Modules activated again, in activation order; the reloaded module
    /// comes first.
    pub reactivated: Vec<String>,
}

struct ModuleTable {
    modules: ModuleSet,
    descriptors: HashMap<String, Arc<ModuleDescriptor>>,
}

struct Dependency {
    connector: String,
    target: String,
    descriptor: Arc<ModuleDescriptor>,
}

type ResolvedConnectors = BTreeMap<String, (String, Weak<dyn Module>)>;

/// Orchestrates module activation, deactivation and reload.
///
/// All state sits behind `Arc`s so a single-module transition can run on its
/// own task with a handle to the same manager.
pub struct ModuleManager {
    registry: Arc<ModuleRegistry>,
    table: Arc<RwLock<ModuleTable>>,
    store: Arc<dyn StatusStore>,
    events: Arc<EventBus>,
    gate: Arc<Mutex<()>>,
}

impl ModuleManager {
    /// Binds `modules` to `registry`.
    ///
    /// # Errors
    ///
    /// Fails if any declaration does not match its class (see
    /// [`ModuleRegistry::validate`]). Connector cycles are reported later,
    /// when a module on the cycle is resolved.
    pub fn new(
        modules: ModuleSet,
        registry: Arc<ModuleRegistry>,
        store: Arc<dyn StatusStore>,
    ) -> Result<Self, ConfigError> {
        registry.validate(&modules)?;

        let descriptors = modules
            .iter()
            .map(|config| {
                (
                    config.name.clone(),
                    Arc::new(ModuleDescriptor::new(config.clone())),
                )
            })
            .collect();

        info!(modules = modules.len(), "Module manager initialized");

        Ok(Self {
            registry,
            table: Arc::new(RwLock::new(ModuleTable {
                modules,
                descriptors,
            })),
            store,
            events: Arc::new(EventBus::default()),
            gate: Arc::new(Mutex::new(())),
        })
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    /// The class registry modules are instantiated from.
    pub fn registry(&self) -> &ModuleRegistry {
        &self.registry
    }

    /// The status variable store.
    pub fn store(&self) -> &Arc<dyn StatusStore> {
        &self.store
    }

    /// The state-change bus.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Subscribe to state-change events.
    pub fn subscribe(&self) -> broadcast::Receiver<ModuleStateChanged> {
        self.events.subscribe()
    }

    /// Registers a synchronous state-change observer.
    pub fn add_observer(&self, observer: Arc<dyn ModuleObserver>) -> ObserverId {
        self.events.add_observer(observer)
    }

    /// Unregisters an observer.
    pub fn remove_observer(&self, id: ObserverId) -> bool {
        self.events.remove_observer(id)
    }

    /// Declared module names, in declaration order.
    pub fn module_names(&self) -> Vec<String> {
        self.table.read().modules.names()
    }

    /// Declaration of `name`.
    pub fn config(&self, name: &str) -> Option<ModuleConfig> {
        self.table.read().modules.get(name).cloned()
    }

    /// Current state of `name`.
    pub fn state(&self, name: &str) -> ModuleResult<ModuleState> {
        Ok(self.descriptor(name)?.state())
    }

    /// Snapshot of one module.
    pub fn module_info(&self, name: &str) -> ModuleResult<ModuleInfo> {
        Ok(self.descriptor(name)?.snapshot())
    }

    /// Snapshots of every module, in declaration order.
    pub fn modules(&self) -> Vec<ModuleInfo> {
        let table = self.table.read();
        table
            .modules
            .iter()
            .filter_map(|config| table.descriptors.get(&config.name))
            .map(|descriptor| descriptor.snapshot())
            .collect()
    }

    /// Names of Activated modules, in declaration order.
    pub fn active_modules(&self) -> Vec<String> {
        let table = self.table.read();
        table
            .modules
            .iter()
            .filter(|config| {
                table
                    .descriptors
                    .get(&config.name)
                    .map(|d| d.state() == ModuleState::Activated)
                    .unwrap_or(false)
            })
            .map(|config| config.name.clone())
            .collect()
    }

    /// Live instance of `name`.
    pub fn instance(&self, name: &str) -> Option<Arc<dyn Module>> {
        self.descriptor(name).ok()?.instance()
    }

    /// Live instance of `name`, downcast to its concrete type.
    pub fn instance_as<T: Module>(&self, name: &str) -> Option<Arc<T>> {
        downcast_module::<T>(self.instance(name)?)
    }

    /// Activation order for `name`; see [`DependencyResolver::resolve`].
    pub fn resolve(&self, name: &str) -> ModuleResult<Vec<String>> {
        let table = self.table.read();
        DependencyResolver::new(&table.modules).resolve(name)
    }

    /// Transitive dependents of `name` in deactivation order.
    pub fn dependents(&self, name: &str) -> ModuleResult<Vec<String>> {
        let table = self.table.read();
        DependencyResolver::new(&table.modules).dependents(name)
    }

    // -------------------------------------------------------------------------
    // Configuration changes
    // -------------------------------------------------------------------------

    /// Declares a new module, or replaces a Deactivated one.
    ///
    /// The declaration is checked against the rest of the configuration and
    /// against its class before anything changes.
    pub fn add_module(&self, config: ModuleConfig, allow_overwrite: bool) -> ModuleResult<()> {
        let _gate = self.gate.lock();
        let mut table = self.table.write();

        if allow_overwrite {
            if let Some(existing) = table.descriptors.get(&config.name) {
                let state = existing.state();
                if state != ModuleState::Deactivated {
                    return Err(ModuleError::InvalidState {
                        module: config.name,
                        state,
                        operation: "overwrite",
                    });
                }
            }
        }

        let mut candidate = table.modules.clone();
        candidate.add_module(config.clone(), allow_overwrite)?;
        self.registry.validate_module(&config, &candidate)?;
        for dependent in candidate.direct_dependents(&config.name) {
            if let Some(dependent) = candidate.get(&dependent) {
                self.registry.validate_module(dependent, &candidate)?;
            }
        }

        info!(module = %config.name, class = %config.module_class, "Module declared");
        table.modules = candidate;
        table
            .descriptors
            .insert(config.name.clone(), Arc::new(ModuleDescriptor::new(config)));
        Ok(())
    }

    /// Removes a Deactivated module no other module connects to.
    pub fn remove_module(&self, name: &str) -> ModuleResult<ModuleConfig> {
        let _gate = self.gate.lock();
        let mut table = self.table.write();

        let state = table
            .descriptors
            .get(name)
            .map(|d| d.state())
            .ok_or_else(|| ModuleError::UnknownModule(name.to_string()))?;
        if state != ModuleState::Deactivated {
            return Err(ModuleError::InvalidState {
                module: name.to_string(),
                state,
                operation: "remove",
            });
        }

        let config = table.modules.remove_module(name)?;
        table.descriptors.remove(name);
        info!(module = name, "Module removed");
        Ok(config)
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Activates `name` and everything it depends on.
    ///
    /// Modules are activated strictly one after another in dependency order.
    /// Already Activated modules are skipped, so activating an active module
    /// is a no-op.
    ///
    /// # Errors
    ///
    /// - `UnknownModule` / `CyclicDependency` before anything starts
    /// - `Activation` naming the module whose instantiation or hook failed;
    ///   that module is now in `ErrorState`, earlier modules stay Activated
    /// - `InErrorState` if a module in the chain needs a `reset` first
    pub async fn activate(&self, name: &str) -> ModuleResult<()> {
        let order = self.resolve(name)?;
        debug!(module = name, order = ?order, "Resolved activation order");

        for module in &order {
            self.activate_one(module).await?;
        }
        Ok(())
    }

    /// Deactivates `name`.
    ///
    /// Without `force` this fails with `DependentsStillActive` while a live
    /// module connects to `name`. With `force`, live dependents are
    /// deactivated first, dependents before their own dependencies; the
    /// cascade stops at the first failure.
    pub async fn deactivate(&self, name: &str, force: bool) -> ModuleResult<()> {
        if force {
            for dependent in self.dependents(name)? {
                if self.state(&dependent)?.is_live() {
                    info!(module = name, dependent = %dependent, "Cascading deactivation");
                    self.deactivate_one(&dependent).await?;
                }
            }
        }
        self.deactivate_one(name).await
    }

    /// Deactivates and re-activates `name` with a fresh instance.
    ///
    /// With `force`, live dependents are deactivated first and activated again
    /// after `name`, in dependency order.
    ///
    /// # Errors
    ///
    /// Deactivation errors are returned as is. If re-activation fails part
    /// way, `ReloadFailed` lists the modules that did come back.
    pub async fn reload(&self, name: &str, force: bool) -> ModuleResult<ReloadReport> {
        let cascaded: Vec<String> = if force {
            self.dependents(name)?
                .into_iter()
                .filter(|d| self.state(d).map(ModuleState::is_live).unwrap_or(false))
                .collect()
        } else {
            Vec::new()
        };
        info!(module = name, cascaded = ?cascaded, "Reloading module");

        self.deactivate(name, force).await?;

        let mut reactivated = Vec::new();
        for module in std::iter::once(name.to_string()).chain(cascaded.into_iter().rev()) {
            if let Err(source) = self.activate(&module).await {
                return Err(ModuleError::ReloadFailed {
                    module: name.to_string(),
                    reactivated,
                    source: Box::new(source),
                });
            }
            reactivated.push(module);
        }

        Ok(ReloadReport {
            module: name.to_string(),
            reactivated,
        })
    }

    /// Brings `name` back to a clean Deactivated state.
    ///
    /// Force-deactivates the module if it is live, discards any instance,
    /// leaves `ErrorState` and erases its persisted status variables.
    pub async fn reset(&self, name: &str) -> ModuleResult<()> {
        let descriptor = self.descriptor(name)?;

        if descriptor.state().is_live() {
            if let Err(e) = self.deactivate(name, true).await {
                if descriptor.state().is_live() {
                    return Err(e);
                }
                warn!(module = name, error = %e, "Deactivation failed during reset");
            }
        }

        let _transition = descriptor.transition_lock().lock().await;
        let state = descriptor.state();
        if state.is_live() {
            return Err(ModuleError::InvalidState {
                module: name.to_string(),
                state,
                operation: "reset",
            });
        }
        if state == ModuleState::ErrorState {
            self.commit(&descriptor, ModuleState::Deactivated, |data| {
                data.release();
                data.last_error = None;
            });
        }
        self.erase_status_variables(&descriptor)?;

        info!(module = name, "Module reset");
        Ok(())
    }

    /// Erases the persisted status variables of a Deactivated module.
    pub async fn clear_status_variables(&self, name: &str) -> ModuleResult<()> {
        let descriptor = self.descriptor(name)?;
        let _transition = descriptor.transition_lock().lock().await;

        let state = descriptor.state();
        if state != ModuleState::Deactivated {
            return Err(ModuleError::InvalidState {
                module: name.to_string(),
                state,
                operation: "clear status variables of",
            });
        }
        self.erase_status_variables(&descriptor)?;

        info!(module = name, "Status variables cleared");
        Ok(())
    }

    /// Deactivates every live module, dependents first.
    ///
    /// Keeps going after failures and reports all of them at the end.
    pub async fn deactivate_all(&self) -> ModuleResult<()> {
        let mut failures = Vec::new();

        for name in self.module_names().iter().rev() {
            if !self.state(name).map(ModuleState::is_live).unwrap_or(false) {
                continue;
            }
            if let Err(e) = self.deactivate(name, true).await {
                error!(module = %name, error = %e, "Failed to deactivate module during shutdown");
                failures.push(e);
            }
        }

        if failures.is_empty() {
            info!("All modules deactivated");
            Ok(())
        } else {
            Err(ModuleError::ShutdownFailed(failures))
        }
    }

    // -------------------------------------------------------------------------
    // Single-module transitions
    // -------------------------------------------------------------------------

    /// Runs one activation to completion on its own task.
    ///
    /// Dropping the caller's future does not abandon the transition: the
    /// task still commits Activated or ErrorState and releases the lock.
    async fn activate_one(&self, name: &str) -> ModuleResult<()> {
        let manager = self.handle();
        let module = name.to_string();
        tokio::spawn(async move { manager.run_activation(&module).await })
            .await
            .map_err(|join| {
                ModuleError::activation(name, anyhow!("activation task failed: {join}"))
            })?
    }

    async fn run_activation(&self, name: &str) -> ModuleResult<()> {
        let descriptor = self.descriptor(name)?;
        let _transition = descriptor.transition_lock().lock().await;

        match descriptor.state() {
            ModuleState::Activated => return Ok(()),
            ModuleState::Deactivated => {}
            ModuleState::ErrorState => {
                return Err(ModuleError::InErrorState {
                    module: name.to_string(),
                    last_error: descriptor.last_error(),
                })
            }
            state => {
                return Err(ModuleError::InvalidState {
                    module: name.to_string(),
                    state,
                    operation: "activate",
                })
            }
        }

        let class = self.class_of(&descriptor)?;
        let dependencies = self.dependencies_of(&descriptor)?;

        {
            let _gate = self.gate.lock();
            if !self.is_current(&descriptor) {
                return Err(ModuleError::UnknownModule(name.to_string()));
            }
            if let Some(dependency) = dependencies
                .iter()
                .find(|d| d.descriptor.state() != ModuleState::Activated)
            {
                return Err(ModuleError::DependencyNotActive {
                    module: name.to_string(),
                    dependency: dependency.target.clone(),
                });
            }
            self.commit_locked(&descriptor, ModuleState::Activating, |data| {
                data.last_error = None;
            });
        }
        info!(module = name, class = class.id(), "Activating module");

        match self.start_instance(&descriptor, class, &dependencies).await {
            Ok((instance, connectors, status_vars)) => {
                self.commit(&descriptor, ModuleState::Activated, |data| {
                    data.instance = Some(instance);
                    data.connectors = connectors;
                    data.status_vars = status_vars;
                });
                info!(module = name, "Module activated");
                Ok(())
            }
            Err(cause) => {
                let message = format!("{cause:#}");
                error!(module = name, error = %message, "Module activation failed");
                self.commit(&descriptor, ModuleState::ErrorState, |data| {
                    data.release();
                    data.last_error = Some(message);
                });
                Err(ModuleError::activation(name, cause))
            }
        }
    }

    /// Instantiates, wires and starts a module that is already Activating.
    async fn start_instance(
        &self,
        descriptor: &ModuleDescriptor,
        class: &ModuleClass,
        dependencies: &[Dependency],
    ) -> anyhow::Result<(Arc<dyn Module>, ResolvedConnectors, StatusVariables)> {
        let name = descriptor.name();
        let options = class.options_for(descriptor.config());
        let instance = class
            .instantiate(&options)
            .map_err(|e| anyhow!("failed to create instance of class '{}': {e:#}", class.id()))?;

        let mut connectors = Connectors::default();
        let mut resolved = ResolvedConnectors::new();
        for dependency in dependencies {
            let target = dependency.descriptor.instance().ok_or_else(|| {
                anyhow!("dependency '{}' has no live instance", dependency.target)
            })?;
            connectors.insert(Connector::new(&dependency.connector, &dependency.target, &target));
            resolved.insert(
                dependency.connector.clone(),
                (dependency.target.clone(), Arc::downgrade(&target)),
            );
        }

        let status_vars = self.restore_status_variables(name, class, instance.as_ref());
        descriptor.data().write().instance = Some(instance.clone());

        let hook_instance = instance.clone();
        match tokio::spawn(async move { hook_instance.on_activate(connectors).await }).await {
            Ok(Ok(())) => Ok((instance, resolved, status_vars)),
            Ok(Err(e)) => Err(e),
            Err(join) => Err(anyhow!("on_activate panicked: {join}")),
        }
    }

    /// Runs one deactivation to completion on its own task.
    async fn deactivate_one(&self, name: &str) -> ModuleResult<()> {
        let manager = self.handle();
        let module = name.to_string();
        tokio::spawn(async move { manager.run_deactivation(&module).await })
            .await
            .map_err(|join| {
                ModuleError::deactivation(name, anyhow!("deactivation task failed: {join}"))
            })?
    }

    async fn run_deactivation(&self, name: &str) -> ModuleResult<()> {
        let descriptor = self.descriptor(name)?;
        let _transition = descriptor.transition_lock().lock().await;

        match descriptor.state() {
            ModuleState::Deactivated => return Ok(()),
            ModuleState::Activated => {}
            ModuleState::ErrorState => {
                return Err(ModuleError::InErrorState {
                    module: name.to_string(),
                    last_error: descriptor.last_error(),
                })
            }
            state => {
                return Err(ModuleError::InvalidState {
                    module: name.to_string(),
                    state,
                    operation: "deactivate",
                })
            }
        }

        {
            let _gate = self.gate.lock();
            let dependents = self.live_dependents(name);
            if !dependents.is_empty() {
                return Err(ModuleError::DependentsStillActive {
                    module: name.to_string(),
                    dependents,
                });
            }
            self.commit_locked(&descriptor, ModuleState::Deactivating, |_| {});
        }
        info!(module = name, "Deactivating module");

        let outcome = match descriptor.instance() {
            Some(instance) => {
                let captured = self.capture_status_variables(&descriptor, instance.as_ref());
                let outcome = tokio::spawn(async move { instance.on_deactivate().await }).await;
                if let Some(captured) = &captured {
                    if let Err(e) = self.store.save(name, captured) {
                        error!(module = name, error = %e, "Failed to persist status variables");
                    }
                }
                let outcome = match outcome {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(e),
                    Err(join) => Err(anyhow!("on_deactivate panicked: {join}")),
                };
                (outcome, captured)
            }
            None => (Ok(()), None),
        };

        match outcome {
            (Ok(()), captured) => {
                self.commit(&descriptor, ModuleState::Deactivated, |data| {
                    data.release();
                    if let Some(captured) = captured {
                        data.status_vars = captured;
                    }
                });
                info!(module = name, "Module deactivated");
                Ok(())
            }
            (Err(cause), captured) => {
                let message = format!("{cause:#}");
                error!(module = name, error = %message, "Module deactivation failed");
                self.commit(&descriptor, ModuleState::ErrorState, |data| {
                    data.release();
                    data.last_error = Some(message);
                    if let Some(captured) = captured {
                        data.status_vars = captured;
                    }
                });
                Err(ModuleError::deactivation(name, cause))
            }
        }
    }

    // -------------------------------------------------------------------------
    // Status variables
    // -------------------------------------------------------------------------

    /// Applies persisted values (or declared defaults) to a new instance.
    fn restore_status_variables(
        &self,
        name: &str,
        class: &ModuleClass,
        instance: &dyn Module,
    ) -> StatusVariables {
        let defaults = class.default_status_variables();
        if defaults.is_empty() {
            return defaults;
        }

        let persisted = match self.store.load(name) {
            Ok(persisted) => persisted,
            Err(e) => {
                let err = ModuleError::StatusLoad {
                    module: name.to_string(),
                    reason: e.to_string(),
                };
                warn!(module = name, error = %err, "Using default status variables");
                StatusVariables::new()
            }
        };

        let mut restored = StatusVariables::new();
        for (variable, default) in defaults {
            let value = persisted.get(&variable).cloned().unwrap_or_else(|| default.clone());
            let value = match instance.set_status_variable(&variable, value.clone()) {
                Ok(()) => value,
                Err(e) if value != default => {
                    warn!(
                        module = name,
                        variable = %variable,
                        error = %e,
                        "Persisted status variable rejected, keeping default"
                    );
                    if let Err(e) = instance.set_status_variable(&variable, default.clone()) {
                        warn!(module = name, variable = %variable, error = %e, "Default status variable rejected");
                    }
                    default
                }
                Err(e) => {
                    warn!(module = name, variable = %variable, error = %e, "Default status variable rejected");
                    default
                }
            };
            restored.insert(variable, value);
        }

        for stale in persisted.keys().filter(|k| !restored.contains_key(*k)) {
            debug!(module = name, variable = %stale, "Ignoring undeclared persisted status variable");
        }
        restored
    }

    /// Reads the declared status variables from a live instance.
    ///
    /// `None` when the class declares none, so nothing is written to the
    /// store.
    fn capture_status_variables(
        &self,
        descriptor: &ModuleDescriptor,
        instance: &dyn Module,
    ) -> Option<StatusVariables> {
        let class = self.registry.get(&descriptor.config().module_class)?;
        if class.status_variables().is_empty() {
            return None;
        }

        let previous = descriptor.status_variables();
        Some(
            class
                .status_variables()
                .iter()
                .map(|spec| {
                    let value = instance
                        .get_status_variable(&spec.name)
                        .or_else(|| previous.get(&spec.name).cloned())
                        .unwrap_or_else(|| spec.default.clone());
                    (spec.name.clone(), value)
                })
                .collect(),
        )
    }

    fn erase_status_variables(&self, descriptor: &ModuleDescriptor) -> ModuleResult<()> {
        self.store
            .clear(descriptor.name())
            .map_err(|source| ModuleError::StatusStore {
                module: descriptor.name().to_string(),
                source,
            })?;
        descriptor.data().write().status_vars.clear();
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Helpers
    // -------------------------------------------------------------------------

    /// Second handle onto the same modules, store and event bus.
    fn handle(&self) -> ModuleManager {
        ModuleManager {
            registry: self.registry.clone(),
            table: self.table.clone(),
            store: self.store.clone(),
            events: self.events.clone(),
            gate: self.gate.clone(),
        }
    }

    fn descriptor(&self, name: &str) -> ModuleResult<Arc<ModuleDescriptor>> {
        self.table
            .read()
            .descriptors
            .get(name)
            .cloned()
            .ok_or_else(|| ModuleError::UnknownModule(name.to_string()))
    }

    /// Whether `descriptor` is still the one registered under its name.
    fn is_current(&self, descriptor: &Arc<ModuleDescriptor>) -> bool {
        self.table
            .read()
            .descriptors
            .get(descriptor.name())
            .map(|current| Arc::ptr_eq(current, descriptor))
            .unwrap_or(false)
    }

    fn class_of(&self, descriptor: &ModuleDescriptor) -> ModuleResult<&ModuleClass> {
        let config = descriptor.config();
        self.registry.get(&config.module_class).ok_or_else(|| {
            ModuleError::Config(ConfigError::UnknownModuleClass {
                module: config.name.clone(),
                module_class: config.module_class.clone(),
            })
        })
    }

    fn dependencies_of(&self, descriptor: &ModuleDescriptor) -> ModuleResult<Vec<Dependency>> {
        descriptor
            .config()
            .connectors
            .iter()
            .map(|(connector, target)| {
                Ok(Dependency {
                    connector: connector.clone(),
                    target: target.clone(),
                    descriptor: self.descriptor(target)?,
                })
            })
            .collect()
    }

    /// Direct dependents that currently hold an instance.
    fn live_dependents(&self, name: &str) -> Vec<String> {
        let table = self.table.read();
        table
            .modules
            .direct_dependents(name)
            .into_iter()
            .filter(|dependent| {
                table
                    .descriptors
                    .get(dependent)
                    .map(|d| d.state().is_live())
                    .unwrap_or(false)
            })
            .collect()
    }

    /// Applies a state change and publishes it. Caller holds the gate.
    fn commit_locked<F>(&self, descriptor: &ModuleDescriptor, new_state: ModuleState, update: F)
    where
        F: FnOnce(&mut DescriptorData),
    {
        let old_state = {
            let mut data = descriptor.data().write();
            let old_state = data.state;
            update(&mut data);
            data.state = new_state;
            old_state
        };
        debug!(
            module = descriptor.name(),
            from = %old_state,
            to = %new_state,
            "Module state changed"
        );
        self.events.publish(descriptor.name(), old_state, new_state);
    }

    fn commit<F>(&self, descriptor: &ModuleDescriptor, new_state: ModuleState, update: F)
    where
        F: FnOnce(&mut DescriptorData),
    {
        let _gate = self.gate.lock();
        self.commit_locked(descriptor, new_state, update);
    }
}

impl std::fmt::Debug for ModuleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleManager")
            .field("modules", &self.module_names())
            .field("active", &self.active_modules())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModuleBase;
    use crate::modules::status::MemoryStatusStore;
    use crate::modules::{Module, ModuleClass};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counter {
        activations: AtomicUsize,
        fail: AtomicBool,
        value: parking_lot::Mutex<i64>,
    }

    #[async_trait]
    impl Module for Counter {
        async fn on_activate(&self, _connectors: Connectors) -> anyhow::Result<()> {
            self.activations.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                anyhow::bail!("hardware missing");
            }
            Ok(())
        }

        async fn on_deactivate(&self) -> anyhow::Result<()> {
            Ok(())
        }

        fn get_status_variable(&self, name: &str) -> Option<serde_json::Value> {
            (name == "value").then(|| json!(*self.value.lock()))
        }

        fn set_status_variable(&self, name: &str, value: serde_json::Value) -> anyhow::Result<()> {
            match (name, value.as_i64()) {
                ("value", Some(v)) => {
                    *self.value.lock() = v;
                    Ok(())
                }
                _ => anyhow::bail!("bad status variable {name}={value}"),
            }
        }
    }

    fn manager(modules: Vec<ModuleConfig>) -> ModuleManager {
        let mut registry = ModuleRegistry::new();
        registry.register(
            ModuleClass::new("test.counter", ModuleBase::Hardware, |options| {
                let counter = Counter::default();
                let fail = options.get("fail").and_then(|v| v.as_bool()).unwrap_or(false);
                counter.fail.store(fail, Ordering::SeqCst);
                Ok(Arc::new(counter) as Arc<dyn Module>)
            })
            .with_optional_connector("upstream", None)
            .with_status_variable("value", json!(0)),
        );
        ModuleManager::new(
            ModuleSet::new(modules).unwrap(),
            Arc::new(registry),
            Arc::new(MemoryStatusStore::new()),
        )
        .unwrap()
    }

    fn counter(name: &str) -> ModuleConfig {
        ModuleConfig::new(name, ModuleBase::Hardware, "test.counter")
    }

    #[tokio::test]
    async fn test_activate_is_idempotent() {
        let manager = manager(vec![counter("a")]);
        manager.activate("a").await.unwrap();
        manager.activate("a").await.unwrap();

        let instance = manager.instance_as::<Counter>("a").unwrap();
        assert_eq!(instance.activations.load(Ordering::SeqCst), 1);
        assert_eq!(manager.active_modules(), vec!["a"]);
    }

    #[tokio::test]
    async fn test_status_variable_survives_cycle() {
        let manager = manager(vec![counter("a")]);
        manager.activate("a").await.unwrap();
        *manager.instance_as::<Counter>("a").unwrap().value.lock() = 42;
        manager.deactivate("a", false).await.unwrap();

        assert_eq!(manager.module_info("a").unwrap().status_variables["value"], json!(42));
        manager.activate("a").await.unwrap();
        assert_eq!(*manager.instance_as::<Counter>("a").unwrap().value.lock(), 42);
    }

    #[tokio::test]
    async fn test_failed_activation_requires_reset() {
        let manager = manager(vec![counter("a").with_option("fail", json!(true))]);

        let err = manager.activate("a").await.unwrap_err();
        assert!(matches!(err, ModuleError::Activation { ref module, .. } if module == "a"));
        assert_eq!(manager.state("a").unwrap(), ModuleState::ErrorState);
        assert!(manager.instance("a").is_none());
        assert!(manager
            .module_info("a")
            .unwrap()
            .last_error
            .unwrap()
            .contains("hardware missing"));

        assert!(matches!(
            manager.activate("a").await,
            Err(ModuleError::InErrorState { .. })
        ));

        manager.reset("a").await.unwrap();
        assert_eq!(manager.state("a").unwrap(), ModuleState::Deactivated);
        assert!(manager.module_info("a").unwrap().last_error.is_none());
    }

    #[tokio::test]
    async fn test_clear_status_requires_deactivated() {
        let manager = manager(vec![counter("a")]);
        manager.activate("a").await.unwrap();
        assert!(matches!(
            manager.clear_status_variables("a").await,
            Err(ModuleError::InvalidState { state: ModuleState::Activated, .. })
        ));
        manager.deactivate("a", false).await.unwrap();
        manager.clear_status_variables("a").await.unwrap();
        assert!(manager.store().load("a").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_add_and_remove_module() {
        let manager = manager(vec![counter("a")]);
        manager
            .add_module(counter("b").with_connector("upstream", "a"), false)
            .unwrap();
        assert_eq!(manager.resolve("b").unwrap(), vec!["a", "b"]);

        assert!(matches!(
            manager.add_module(counter("b"), false),
            Err(ModuleError::Config(ConfigError::DuplicateModule(_)))
        ));
        assert!(matches!(
            manager.remove_module("a"),
            Err(ModuleError::Config(ConfigError::StillReferenced { .. }))
        ));

        manager.activate("b").await.unwrap();
        assert!(matches!(
            manager.add_module(counter("b"), true),
            Err(ModuleError::InvalidState { .. })
        ));
        assert!(matches!(
            manager.remove_module("b"),
            Err(ModuleError::InvalidState { .. })
        ));

        manager.deactivate("b", false).await.unwrap();
        manager.remove_module("b").unwrap();
        assert_eq!(manager.module_names(), vec!["a"]);
    }
}
