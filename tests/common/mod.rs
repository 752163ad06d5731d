//! Shared fixtures for the integration tests.
//!
//! `Probe` is a module class that records every hook call in a [`Journal`]
//! and can be told through its options to fail, panic or stall.

#![allow(dead_code)]

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use labctl::modules::{
    Connectors, MemoryStatusStore, Module, ModuleClass, ModuleManager, ModuleRegistry,
    StatusStore, StatusStoreError, StatusVariables,
};
use labctl::{ModuleBase, ModuleConfig, ModuleSet};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Ordered record of hook calls, shared by every probe of a registry.
#[derive(Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    pub fn count(&self, entry: &str) -> usize {
        self.0.lock().iter().filter(|e| *e == entry).count()
    }

    pub fn position(&self, entry: &str) -> Option<usize> {
        self.0.lock().iter().position(|e| e == entry)
    }

    pub fn clear(&self) {
        self.0.lock().clear();
    }
}

pub struct Probe {
    label: String,
    journal: Journal,
    fail_activate: bool,
    fail_deactivate: bool,
    panic_activate: bool,
    delay: Duration,
    deactivate_delay: Duration,
    gain: Mutex<f64>,
    connectors: Mutex<Option<Connectors>>,
}

impl Probe {
    fn from_options(options: &labctl::config::ModuleOptions, journal: Journal) -> Result<Self> {
        let flag = |key: &str| options.get(key).and_then(Value::as_bool).unwrap_or(false);
        if flag("fail_create") {
            bail!("probe refused to be created");
        }
        Ok(Self {
            label: options
                .get("label")
                .and_then(Value::as_str)
                .ok_or_else(|| anyhow!("probe needs a label"))?
                .to_string(),
            journal,
            fail_activate: flag("fail_activate"),
            fail_deactivate: flag("fail_deactivate"),
            panic_activate: flag("panic_activate"),
            delay: Duration::from_millis(
                options.get("delay_ms").and_then(Value::as_u64).unwrap_or(0),
            ),
            deactivate_delay: Duration::from_millis(
                options
                    .get("deactivate_delay_ms")
                    .and_then(Value::as_u64)
                    .unwrap_or(0),
            ),
            gain: Mutex::new(1.0),
            connectors: Mutex::new(None),
        })
    }

    pub fn gain(&self) -> f64 {
        *self.gain.lock()
    }

    pub fn set_gain(&self, gain: f64) {
        *self.gain.lock() = gain;
    }

    /// Whether every connector handed to `on_activate` still resolves.
    pub fn connectors_alive(&self) -> bool {
        self.connectors
            .lock()
            .as_ref()
            .map(|c| c.names().all(|name| c.get(name).is_some_and(|link| link.is_connected())))
            .unwrap_or(false)
    }
}

#[async_trait]
impl Module for Probe {
    async fn on_activate(&self, connectors: Connectors) -> Result<()> {
        self.journal.push(format!("activate {}", self.label));
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.panic_activate {
            panic!("probe {} exploded", self.label);
        }
        if self.fail_activate {
            bail!("probe {} could not open its device", self.label);
        }
        for name in connectors.names() {
            let connector = connectors.require(name)?;
            if !connector.is_connected() {
                bail!("connector {name} is dangling");
            }
        }
        *self.connectors.lock() = Some(connectors);
        Ok(())
    }

    async fn on_deactivate(&self) -> Result<()> {
        self.journal.push(format!("deactivate {}", self.label));
        if !self.deactivate_delay.is_zero() {
            tokio::time::sleep(self.deactivate_delay).await;
        }
        self.connectors.lock().take();
        if self.fail_deactivate {
            bail!("probe {} could not close its device", self.label);
        }
        Ok(())
    }

    fn get_status_variable(&self, name: &str) -> Option<Value> {
        (name == "gain").then(|| json!(self.gain()))
    }

    fn set_status_variable(&self, name: &str, value: Value) -> Result<()> {
        match (name, value.as_f64()) {
            ("gain", Some(gain)) if gain > 0.0 => {
                self.set_gain(gain);
                Ok(())
            }
            _ => bail!("invalid status variable {name}={value}"),
        }
    }
}

fn probe_class(id: &str, base: ModuleBase, journal: &Journal) -> ModuleClass {
    let journal = journal.clone();
    ModuleClass::new(id, base, move |options| {
        Ok(Arc::new(Probe::from_options(options, journal.clone())?) as Arc<dyn Module>)
    })
    .with_description("Recording test module")
    .with_status_variable("gain", json!(1.0))
}

/// Registry with `test.hardware`, `test.logic` and `test.gui` probe classes.
pub fn probe_registry(journal: &Journal) -> ModuleRegistry {
    let mut registry = ModuleRegistry::new();
    registry.register(
        probe_class("test.hardware", ModuleBase::Hardware, journal)
            .with_optional_connector("upstream", None),
    );
    registry.register(
        probe_class("test.logic", ModuleBase::Logic, journal)
            .with_optional_connector("hardware", None)
            .with_optional_connector("auxiliary", None)
            .with_optional_connector("logic", None),
    );
    registry.register(
        probe_class("test.gui", ModuleBase::Gui, journal).with_optional_connector("logic", None),
    );
    registry
}

pub fn hardware(name: &str) -> ModuleConfig {
    ModuleConfig::new(name, ModuleBase::Hardware, "test.hardware").with_option("label", json!(name))
}

pub fn logic(name: &str) -> ModuleConfig {
    ModuleConfig::new(name, ModuleBase::Logic, "test.logic").with_option("label", json!(name))
}

pub fn gui(name: &str) -> ModuleConfig {
    ModuleConfig::new(name, ModuleBase::Gui, "test.gui").with_option("label", json!(name))
}

/// Manager over probe modules with an in-memory store.
pub fn probe_manager(modules: Vec<ModuleConfig>, journal: &Journal) -> ModuleManager {
    probe_manager_with_store(modules, journal, Arc::new(MemoryStatusStore::new()))
}

pub fn probe_manager_with_store(
    modules: Vec<ModuleConfig>,
    journal: &Journal,
    store: Arc<dyn StatusStore>,
) -> ModuleManager {
    ModuleManager::new(
        ModuleSet::new(modules).unwrap(),
        Arc::new(probe_registry(journal)),
        store,
    )
    .unwrap()
}

/// Probe of a live module.
pub fn probe(manager: &ModuleManager, name: &str) -> Arc<Probe> {
    manager.instance_as::<Probe>(name).unwrap()
}

/// Store whose every operation fails.
#[derive(Default)]
pub struct BrokenStore;

impl StatusStore for BrokenStore {
    fn save(&self, _module: &str, _variables: &StatusVariables) -> Result<(), StatusStoreError> {
        Err(StatusStoreError::Io {
            path: PathBuf::from("/dev/full"),
            source: std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
        })
    }

    fn load(&self, module: &str) -> Result<StatusVariables, StatusStoreError> {
        Err(StatusStoreError::Corrupt {
            path: PathBuf::from(format!("{module}.status.json")),
            reason: "unreadable".to_string(),
        })
    }

    fn clear(&self, _module: &str) -> Result<(), StatusStoreError> {
        Err(StatusStoreError::Io {
            path: PathBuf::from("/dev/full"),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only"),
        })
    }
}
