//! Hardware capabilities
//!
//! Fine-grained capability traits that hardware modules implement. A connector
//! does not ask for "the laser driver of vendor X"; it asks for a module that
//! provides a capability:
//!
//! - A diode laser implements: `LaserControl`
//! - A signal generator implements: `MicrowaveSource`
//!
//! Module classes declare the capabilities they provide (see
//! [`ModuleClass::with_capability`](crate::modules::ModuleClass::with_capability))
//! and connectors declare the capability they need. The pairing is checked
//! when the configuration is registered, long before any hook runs.
//!
//! Each capability trait:
//! - Is async (uses #[async_trait])
//! - Is thread-safe (requires Send + Sync)
//! - Uses anyhow::Result for errors
//!
//! # Example
//!
//! ```rust,ignore
//! let microwave = connectors.require("microwave")?.get()?;
//! let source = microwave
//!     .as_microwave()
//!     .ok_or_else(|| anyhow!("connector 'microwave' is not a microwave source"))?;
//! source.set_cw(2.87e9, -20.0).await?;
//! ```

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Capability identifiers used in module class declarations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// See [`LaserControl`].
    LaserControl,
    /// See [`MicrowaveSource`].
    MicrowaveSource,
}

impl Capability {
    /// Stable identifier used in logs and error messages.
    pub fn as_str(self) -> &'static str {
        match self {
            Capability::LaserControl => "laser_control",
            Capability::MicrowaveSource => "microwave_source",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Capability: Laser Control
///
/// Lasers with a settable output power and an emission switch.
///
/// # Contract
/// - Power is in watts
/// - `set_power` rejects values outside `0..=max_power()`
/// - Turning emission off does not forget the power setpoint
#[async_trait]
pub trait LaserControl: Send + Sync {
    /// Set the output power setpoint in watts.
    async fn set_power(&self, watts: f64) -> Result<()>;

    /// Current power setpoint in watts.
    async fn power(&self) -> Result<f64>;

    /// Largest accepted setpoint in watts.
    fn max_power(&self) -> f64;

    /// Switch emission on or off.
    async fn set_emission(&self, enabled: bool) -> Result<()>;

    /// Whether the laser is emitting.
    async fn is_emitting(&self) -> Result<bool>;
}

/// Capability: Microwave Source
///
/// Signal generators driven in continuous-wave mode.
///
/// # Contract
/// - Frequency is in Hz, power in dBm
/// - `set_cw` configures but does not switch the output on
/// - `cw_on` fails while the device is not connected
/// - CW parameters cannot change while the output is on
#[async_trait]
pub trait MicrowaveSource: Send + Sync {
    /// Configure continuous-wave output.
    ///
    /// # Returns
    /// The `(frequency_hz, power_dbm)` actually applied by the device, which
    /// may be rounded to its resolution.
    async fn set_cw(&self, frequency_hz: f64, power_dbm: f64) -> Result<(f64, f64)>;

    /// Switch CW output on.
    async fn cw_on(&self) -> Result<()>;

    /// Switch output off.
    async fn off(&self) -> Result<()>;

    /// Whether the output is on.
    async fn is_running(&self) -> Result<bool>;

    /// Frequency range supported by the device in Hz.
    fn frequency_limits(&self) -> (f64, f64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_names_are_snake_case() {
        assert_eq!(Capability::LaserControl.to_string(), "laser_control");
        assert_eq!(
            serde_json::to_string(&Capability::MicrowaveSource).unwrap(),
            "\"microwave_source\""
        );
    }
}
