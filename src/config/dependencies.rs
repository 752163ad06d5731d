//! Dependency resolution over module connectors.
//!
//! Connectors form a directed graph: an edge `scan_logic -> laser` means
//! `scan_logic` needs `laser` to be active first. The graph is never stored;
//! it is derived from the current [`ModuleSet`] every time it is consulted, so
//! `add_module` / `remove_module` are picked up immediately.
//!
//! This is critical for:
//! - Activating a module's dependencies before the module itself
//! - Deactivating dependents before the module they use
//! - Reporting connector cycles with every module on the cycle
//!
//! # Example
//!
//! ```rust
//! use labctl::config::{ModuleBase, ModuleConfig, ModuleSet};
//! use labctl::config::dependencies::DependencyResolver;
//!
//! let set = ModuleSet::new(vec![
//!     ModuleConfig::new("laser", ModuleBase::Hardware, "mock.laser"),
//!     ModuleConfig::new("scan_logic", ModuleBase::Logic, "logic.odmr_scan")
//!         .with_connector("laser", "laser"),
//! ])
//! .unwrap();
//!
//! let resolver = DependencyResolver::new(&set);
//! assert_eq!(resolver.resolve("scan_logic").unwrap(), vec!["laser", "scan_logic"]);
//! assert_eq!(resolver.dependents("laser").unwrap(), vec!["scan_logic"]);
//! ```

use super::ModuleSet;
use crate::error::{ModuleError, ModuleResult};
use std::collections::HashMap;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

#[derive(Clone, Copy)]
enum Direction {
    /// Follow connectors towards required modules.
    Requires,
    /// Follow connectors backwards towards dependents.
    RequiredBy,
}

/// Read-only view of the connector graph of a [`ModuleSet`].
pub struct DependencyResolver<'a> {
    modules: &'a ModuleSet,
}

impl<'a> DependencyResolver<'a> {
    /// Creates a resolver over the given declarations.
    pub fn new(modules: &'a ModuleSet) -> Self {
        Self { modules }
    }

    /// Returns the activation order for `name`.
    ///
    /// Every required module appears exactly once and before the modules
    /// that need it; `name` itself is last. Modules without a mutual ordering
    /// constraint keep their declaration order.
    ///
    /// # Errors
    ///
    /// - `UnknownModule` if `name` is not declared
    /// - `CyclicDependency` if the closure of `name` contains a cycle
    pub fn resolve(&self, name: &str) -> ModuleResult<Vec<String>> {
        self.walk(name, Direction::Requires)
    }

    /// Returns every module that transitively depends on `name`, in
    /// deactivation order: each dependent precedes the modules it depends on.
    /// `name` itself is not included.
    pub fn dependents(&self, name: &str) -> ModuleResult<Vec<String>> {
        let mut order = self.walk(name, Direction::RequiredBy)?;
        // The walk emits `name` last; everything before it depends on it.
        order.pop();
        Ok(order)
    }

    /// Modules holding a connector directly to `name`.
    pub fn direct_dependents(&self, name: &str) -> Vec<String> {
        self.modules.direct_dependents(name)
    }

    /// Verifies that no declared module is part of a connector cycle.
    pub fn check_acyclic(&self) -> ModuleResult<()> {
        for module in self.modules.iter() {
            self.resolve(&module.name)?;
        }
        Ok(())
    }

    fn neighbours(&self, name: &str, direction: Direction) -> Vec<&'a str> {
        match direction {
            Direction::Requires => {
                let Some(module) = self.modules.get(name) else {
                    return Vec::new();
                };
                let mut targets: Vec<(usize, &str)> = module
                    .connectors
                    .values()
                    .filter_map(|target| {
                        self.modules
                            .get(target)
                            .map(|m| (self.modules.position(target).unwrap_or(usize::MAX), m.name.as_str()))
                    })
                    .collect();
                targets.sort_by_key(|(position, _)| *position);
                targets.dedup_by_key(|(_, target)| *target);
                targets.into_iter().map(|(_, target)| target).collect()
            }
            Direction::RequiredBy => self
                .modules
                .iter()
                .filter(|m| m.connectors.values().any(|target| target == name))
                .map(|m| m.name.as_str())
                .collect(),
        }
    }

    fn walk(&self, name: &str, direction: Direction) -> ModuleResult<Vec<String>> {
        let start = self
            .modules
            .get(name)
            .map(|m| m.name.as_str())
            .ok_or_else(|| ModuleError::UnknownModule(name.to_string()))?;

        let mut marks: HashMap<&'a str, Mark> = HashMap::new();
        let mut stack: Vec<&'a str> = Vec::new();
        let mut order = Vec::new();
        self.visit(start, direction, &mut marks, &mut stack, &mut order)?;
        Ok(order)
    }

    fn visit(
        &self,
        name: &'a str,
        direction: Direction,
        marks: &mut HashMap<&'a str, Mark>,
        stack: &mut Vec<&'a str>,
        order: &mut Vec<String>,
    ) -> ModuleResult<()> {
        marks.insert(name, Mark::Visiting);
        stack.push(name);

        for next in self.neighbours(name, direction) {
            match marks.get(next) {
                Some(Mark::Done) => {}
                Some(Mark::Visiting) => {
                    let start = stack.iter().position(|m| *m == next).unwrap_or(0);
                    let mut cycle: Vec<String> =
                        stack[start..].iter().map(|m| m.to_string()).collect();
                    cycle.push(next.to_string());
                    if matches!(direction, Direction::RequiredBy) {
                        cycle.reverse();
                    }
                    return Err(ModuleError::CyclicDependency { cycle });
                }
                None => self.visit(next, direction, marks, stack, order)?,
            }
        }

        stack.pop();
        marks.insert(name, Mark::Done);
        order.push(name.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ModuleBase, ModuleConfig};

    fn hw(name: &str) -> ModuleConfig {
        ModuleConfig::new(name, ModuleBase::Hardware, "mock.laser")
    }

    fn logic(name: &str) -> ModuleConfig {
        ModuleConfig::new(name, ModuleBase::Logic, "logic.odmr_scan")
    }

    fn odmr_setup() -> ModuleSet {
        ModuleSet::new(vec![
            hw("laser"),
            hw("microwave"),
            hw("counter"),
            logic("odmr_logic")
                .with_connector("microwave", "microwave")
                .with_connector("counter", "counter")
                .with_connector("laser", "laser"),
            ModuleConfig::new("odmr_gui", ModuleBase::Gui, "gui.odmr")
                .with_connector("logic", "odmr_logic"),
        ])
        .unwrap()
    }

    #[test]
    fn resolve_orders_dependencies_first() {
        let set = odmr_setup();
        let resolver = DependencyResolver::new(&set);
        assert_eq!(
            resolver.resolve("odmr_gui").unwrap(),
            vec!["laser", "microwave", "counter", "odmr_logic", "odmr_gui"]
        );
        assert_eq!(resolver.resolve("laser").unwrap(), vec!["laser"]);
    }

    #[test]
    fn shared_dependency_appears_once() {
        let set = ModuleSet::new(vec![
            hw("laser"),
            logic("power_logic").with_connector("laser", "laser"),
            logic("scan_logic")
                .with_connector("power", "power_logic")
                .with_connector("laser", "laser"),
        ])
        .unwrap();
        let order = DependencyResolver::new(&set).resolve("scan_logic").unwrap();
        assert_eq!(order, vec!["laser", "power_logic", "scan_logic"]);
    }

    #[test]
    fn dependents_come_before_their_dependencies() {
        let set = odmr_setup();
        let resolver = DependencyResolver::new(&set);
        assert_eq!(resolver.dependents("laser").unwrap(), vec!["odmr_gui", "odmr_logic"]);
        assert!(resolver.dependents("odmr_gui").unwrap().is_empty());
        assert_eq!(resolver.direct_dependents("laser"), vec!["odmr_logic"]);
    }

    #[test]
    fn cycle_names_every_member() {
        let set = ModuleSet::new(vec![
            hw("a").with_connector("next", "b"),
            hw("b").with_connector("next", "c"),
            hw("c").with_connector("next", "a"),
            hw("d").with_connector("cycle", "a"),
        ])
        .unwrap();
        let resolver = DependencyResolver::new(&set);

        match resolver.resolve("d") {
            Err(ModuleError::CyclicDependency { cycle }) => {
                assert_eq!(cycle, vec!["a", "b", "c", "a"]);
            }
            other => panic!("expected cycle, got {other:?}"),
        }
        assert!(resolver.check_acyclic().is_err());

        match resolver.dependents("a") {
            Err(ModuleError::CyclicDependency { cycle }) => {
                for member in ["a", "b", "c"] {
                    assert!(cycle.iter().any(|m| m == member));
                }
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn unknown_module_is_reported() {
        let set = odmr_setup();
        assert!(matches!(
            DependencyResolver::new(&set).resolve("ghost"),
            Err(ModuleError::UnknownModule(name)) if name == "ghost"
        ));
    }
}
