//! Hardware modules
//!
//! Capability traits plus the simulated instruments shipped with labctl.

pub mod capabilities;
pub mod mock;

pub use capabilities::{Capability, LaserControl, MicrowaveSource};
pub use mock::{MockLaser, MockMicrowave};

use crate::modules::ModuleRegistry;

/// Registers every built-in hardware class.
pub fn register_builtin(registry: &mut ModuleRegistry) {
    mock::register(registry);
}
