//! Logic modules
//!
//! Measurement logic built on top of hardware modules through connectors.

pub mod odmr;

pub use odmr::{OdmrScanLogic, SweepSettings};

use crate::modules::ModuleRegistry;

/// Registers every built-in logic class.
pub fn register_builtin(registry: &mut ModuleRegistry) {
    registry.register(OdmrScanLogic::class());
}
