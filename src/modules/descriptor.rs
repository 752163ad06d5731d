//! Runtime record of one declared module.
//!
//! A [`ModuleDescriptor`] pairs the static declaration with the mutable
//! lifecycle data: state, live instance, resolved connectors, last known
//! status variables and the last hook failure.
//!
//! Two locks guard it:
//! - the *transition lock* (`tokio::sync::Mutex`) is held by the manager for
//!   the whole of an activation or deactivation, hook included, so at most one
//!   transition per module is in flight and a second request waits for the
//!   first to finish;
//! - the *data lock* (`parking_lot::RwLock`) is only held for short critical
//!   sections, so readers never block on a running hook and never observe a
//!   half-updated descriptor.

use super::{Module, StatusVariables};
use crate::config::{ModuleBase, ModuleConfig};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Weak};

/// Lifecycle state of a module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleState {
    /// No instance exists.
    Deactivated,
    /// `on_activate` is running.
    Activating,
    /// The instance is live and usable.
    Activated,
    /// `on_deactivate` is running.
    Deactivating,
    /// A hook failed; only `reset` leaves this state.
    ErrorState,
}

impl ModuleState {
    /// States in which an instance exists.
    pub fn is_live(self) -> bool {
        matches!(
            self,
            ModuleState::Activating | ModuleState::Activated | ModuleState::Deactivating
        )
    }

    /// Stable identifier used in logs and CLI output.
    pub fn as_str(self) -> &'static str {
        match self {
            ModuleState::Deactivated => "deactivated",
            ModuleState::Activating => "activating",
            ModuleState::Activated => "activated",
            ModuleState::Deactivating => "deactivating",
            ModuleState::ErrorState => "error",
        }
    }
}

impl fmt::Display for ModuleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mutable part of a descriptor.
pub(crate) struct DescriptorData {
    pub(crate) state: ModuleState,
    pub(crate) instance: Option<Arc<dyn Module>>,
    pub(crate) connectors: BTreeMap<String, (String, Weak<dyn Module>)>,
    pub(crate) status_vars: StatusVariables,
    pub(crate) last_error: Option<String>,
}

impl DescriptorData {
    /// Drops the instance and connectors.
    pub(crate) fn release(&mut self) {
        self.instance = None;
        self.connectors.clear();
    }
}

/// Runtime record of one declared module.
pub struct ModuleDescriptor {
    config: ModuleConfig,
    transition: tokio::sync::Mutex<()>,
    data: parking_lot::RwLock<DescriptorData>,
}

impl ModuleDescriptor {
    /// Creates a Deactivated descriptor for `config`.
    pub fn new(config: ModuleConfig) -> Self {
        Self {
            config,
            transition: tokio::sync::Mutex::new(()),
            data: parking_lot::RwLock::new(DescriptorData {
                state: ModuleState::Deactivated,
                instance: None,
                connectors: BTreeMap::new(),
                status_vars: StatusVariables::new(),
                last_error: None,
            }),
        }
    }

    /// Module name.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Static declaration.
    pub fn config(&self) -> &ModuleConfig {
        &self.config
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ModuleState {
        self.data.read().state
    }

    /// Live instance, present only while the module is live.
    pub fn instance(&self) -> Option<Arc<dyn Module>> {
        self.data.read().instance.clone()
    }

    /// Status variables as of the last load or capture.
    pub fn status_variables(&self) -> StatusVariables {
        self.data.read().status_vars.clone()
    }

    /// Message of the hook failure that caused `ErrorState`.
    pub fn last_error(&self) -> Option<String> {
        self.data.read().last_error.clone()
    }

    /// Consistent snapshot of the whole descriptor.
    pub fn snapshot(&self) -> ModuleInfo {
        let data = self.data.read();
        ModuleInfo {
            name: self.config.name.clone(),
            base: self.config.base,
            module_class: self.config.module_class.clone(),
            state: data.state,
            connectors: data
                .connectors
                .iter()
                .map(|(connector, (target, instance))| {
                    (
                        connector.clone(),
                        ConnectorInfo {
                            target: target.clone(),
                            connected: instance.strong_count() > 0,
                        },
                    )
                })
                .collect(),
            status_variables: data.status_vars.clone(),
            last_error: data.last_error.clone(),
        }
    }

    pub(crate) fn transition_lock(&self) -> &tokio::sync::Mutex<()> {
        &self.transition
    }

    pub(crate) fn data(&self) -> &parking_lot::RwLock<DescriptorData> {
        &self.data
    }
}

impl fmt::Debug for ModuleDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleDescriptor")
            .field("name", &self.config.name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Resolved connector as seen from outside the manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectorInfo {
    /// Target module.
    pub target: String,
    /// Whether the target instance is alive.
    pub connected: bool,
}

/// Point-in-time view of a descriptor, for status displays.
#[derive(Debug, Clone, Serialize)]
pub struct ModuleInfo {
    /// Module name.
    pub name: String,
    /// Base kind.
    pub base: ModuleBase,
    /// Implementing class.
    pub module_class: String,
    /// Lifecycle state.
    pub state: ModuleState,
    /// Resolved connectors; empty unless the module is live.
    pub connectors: BTreeMap<String, ConnectorInfo>,
    /// Status variables as of the last load or capture.
    pub status_variables: StatusVariables,
    /// Last hook failure.
    pub last_error: Option<String>,
}
