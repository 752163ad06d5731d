//! Mock Hardware Implementations
//!
//! Simulated instruments for running the module manager without physical
//! hardware. All mock devices use async-safe operations
//! (`tokio::time::sleep`, not `std::thread::sleep`).
//!
//! # Available Mocks
//!
//! - `MockLaser` (`mock.laser`) - laser with power setpoint and emission switch
//! - `MockMicrowave` (`mock.microwave`) - CW microwave source
//!
//! # Options
//!
//! Both classes accept:
//! - `interface`: VISA-style resource string (warns when missing)
//! - `connect_delay_ms`: simulated connection time in `on_activate`
//! - `fail_on_activate`: make `on_activate` fail, for exercising error paths

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tracing::{debug, info};

use crate::config::{ModuleBase, ModuleOptions, OptionsExt};
use crate::hardware::capabilities::{Capability, LaserControl, MicrowaveSource};
use crate::modules::{Connectors, MissingPolicy, Module, ModuleClass, ModuleRegistry};

/// Class identifier of [`MockLaser`].
pub const MOCK_LASER_CLASS: &str = "mock.laser";
/// Class identifier of [`MockMicrowave`].
pub const MOCK_MICROWAVE_CLASS: &str = "mock.microwave";

/// Registers the mock classes.
pub fn register(registry: &mut ModuleRegistry) {
    registry.register(MockLaser::class());
    registry.register(MockMicrowave::class());
}

/// Settings shared by every mock device.
#[derive(Debug, Clone)]
struct Connection {
    interface: String,
    delay: Duration,
    fail: bool,
}

impl Connection {
    fn from_options(options: &ModuleOptions, default_interface: &str) -> Result<Self> {
        Ok(Self {
            interface: options
                .get_str("interface")?
                .unwrap_or(default_interface)
                .to_string(),
            delay: Duration::from_millis(options.get_u64("connect_delay_ms")?.unwrap_or(0)),
            fail: options.get_bool("fail_on_activate")?.unwrap_or(false),
        })
    }

    async fn open(&self, device: &str) -> Result<()> {
        if !self.delay.is_zero() {
            sleep(self.delay).await;
        }
        if self.fail {
            bail!("{device} on {} did not respond", self.interface);
        }
        debug!(interface = %self.interface, "{device} connected");
        Ok(())
    }
}

fn with_connection_options(class: ModuleClass, default_interface: &str) -> ModuleClass {
    class
        .with_option("interface", Some(json!(default_interface)), MissingPolicy::Warn)
        .with_option("connect_delay_ms", Some(json!(0)), MissingPolicy::Silent)
        .with_option("fail_on_activate", Some(json!(false)), MissingPolicy::Silent)
}

// =============================================================================
// MockLaser - Simulated Laser
// =============================================================================

#[derive(Debug, Default)]
struct LaserState {
    connected: bool,
    power_w: f64,
    emitting: bool,
}

/// Mock laser with a power setpoint and an emission switch.
///
/// Persists its power setpoint as the `power_setpoint_w` status variable.
///
/// # Example
///
/// ```rust,ignore
/// let laser = manager.instance("laser").unwrap();
/// let laser = laser.as_laser().unwrap();
/// laser.set_power(0.25).await?;
/// laser.set_emission(true).await?;
/// ```
pub struct MockLaser {
    connection: Connection,
    max_power_w: f64,
    state: RwLock<LaserState>,
}

impl MockLaser {
    /// Class declaration of `mock.laser`.
    pub fn class() -> ModuleClass {
        with_connection_options(
            ModuleClass::new(MOCK_LASER_CLASS, ModuleBase::Hardware, |options| {
                Ok(Arc::new(MockLaser::from_options(options)?) as Arc<dyn Module>)
            }),
            "ASRL1::INSTR",
        )
        .with_description("Simulated laser")
        .with_capability(Capability::LaserControl)
        .with_option("max_power_w", Some(json!(1.0)), MissingPolicy::Info)
        .with_status_variable("power_setpoint_w", json!(0.0))
    }

    /// Builds an instance from resolved options.
    pub fn from_options(options: &ModuleOptions) -> Result<Self> {
        let max_power_w = options.get_f64("max_power_w")?.unwrap_or(1.0);
        if max_power_w <= 0.0 {
            bail!("max_power_w must be positive, got {max_power_w}");
        }
        Ok(Self {
            connection: Connection::from_options(options, "ASRL1::INSTR")?,
            max_power_w,
            state: RwLock::new(LaserState::default()),
        })
    }

    /// Whether `on_activate` has completed.
    pub fn is_connected(&self) -> bool {
        self.state.read().connected
    }

    fn check_power(&self, watts: f64) -> Result<()> {
        if !(0.0..=self.max_power_w).contains(&watts) {
            bail!("power {watts} W outside 0..={} W", self.max_power_w);
        }
        Ok(())
    }
}

#[async_trait]
impl Module for MockLaser {
    async fn on_activate(&self, _connectors: Connectors) -> Result<()> {
        self.connection.open("laser").await?;
        let mut state = self.state.write();
        state.connected = true;
        info!(
            interface = %self.connection.interface,
            power_w = state.power_w,
            "Mock laser ready"
        );
        Ok(())
    }

    async fn on_deactivate(&self) -> Result<()> {
        let mut state = self.state.write();
        state.emitting = false;
        state.connected = false;
        Ok(())
    }

    fn get_status_variable(&self, name: &str) -> Option<Value> {
        match name {
            "power_setpoint_w" => Some(json!(self.state.read().power_w)),
            _ => None,
        }
    }

    fn set_status_variable(&self, name: &str, value: Value) -> Result<()> {
        match name {
            "power_setpoint_w" => {
                let watts = value
                    .as_f64()
                    .ok_or_else(|| anyhow!("power_setpoint_w must be a number, got {value}"))?;
                self.check_power(watts)?;
                self.state.write().power_w = watts;
                Ok(())
            }
            _ => bail!("mock laser has no status variable '{name}'"),
        }
    }

    fn as_laser(&self) -> Option<&dyn LaserControl> {
        Some(self)
    }
}

#[async_trait]
impl LaserControl for MockLaser {
    async fn set_power(&self, watts: f64) -> Result<()> {
        self.check_power(watts)?;
        let mut state = self.state.write();
        if !state.connected {
            bail!("laser is not connected");
        }
        state.power_w = watts;
        Ok(())
    }

    async fn power(&self) -> Result<f64> {
        Ok(self.state.read().power_w)
    }

    fn max_power(&self) -> f64 {
        self.max_power_w
    }

    async fn set_emission(&self, enabled: bool) -> Result<()> {
        let mut state = self.state.write();
        if !state.connected {
            bail!("laser is not connected");
        }
        state.emitting = enabled;
        Ok(())
    }

    async fn is_emitting(&self) -> Result<bool> {
        Ok(self.state.read().emitting)
    }
}

// =============================================================================
// MockMicrowave - Simulated Microwave Source
// =============================================================================

#[derive(Debug)]
struct MicrowaveState {
    connected: bool,
    frequency_hz: f64,
    power_dbm: f64,
    running: bool,
}

/// Mock CW microwave source.
///
/// Frequencies are rounded to 1 Hz and powers to 0.01 dBm, like a real
/// generator's resolution. Persists the last CW settings as `cw_frequency_hz`
/// and `cw_power_dbm`.
pub struct MockMicrowave {
    connection: Connection,
    frequency_limits: (f64, f64),
    state: RwLock<MicrowaveState>,
}

impl MockMicrowave {
    /// Class declaration of `mock.microwave`.
    pub fn class() -> ModuleClass {
        with_connection_options(
            ModuleClass::new(MOCK_MICROWAVE_CLASS, ModuleBase::Hardware, |options| {
                Ok(Arc::new(MockMicrowave::from_options(options)?) as Arc<dyn Module>)
            }),
            "GPIB0::19::INSTR",
        )
        .with_description("Simulated CW microwave source")
        .with_capability(Capability::MicrowaveSource)
        .with_option("frequency_min_hz", Some(json!(1.0e6)), MissingPolicy::Silent)
        .with_option("frequency_max_hz", Some(json!(6.0e9)), MissingPolicy::Silent)
        .with_status_variable("cw_frequency_hz", json!(2.87e9))
        .with_status_variable("cw_power_dbm", json!(-30.0))
    }

    /// Builds an instance from resolved options.
    pub fn from_options(options: &ModuleOptions) -> Result<Self> {
        let min = options.get_f64("frequency_min_hz")?.unwrap_or(1.0e6);
        let max = options.get_f64("frequency_max_hz")?.unwrap_or(6.0e9);
        if min >= max {
            bail!("frequency_min_hz ({min}) must be below frequency_max_hz ({max})");
        }
        Ok(Self {
            connection: Connection::from_options(options, "GPIB0::19::INSTR")?,
            frequency_limits: (min, max),
            state: RwLock::new(MicrowaveState {
                connected: false,
                frequency_hz: 2.87e9,
                power_dbm: -30.0,
                running: false,
            }),
        })
    }

    fn check_frequency(&self, frequency_hz: f64) -> Result<f64> {
        let (min, max) = self.frequency_limits;
        if !(min..=max).contains(&frequency_hz) {
            bail!("frequency {frequency_hz} Hz outside {min}..={max} Hz");
        }
        Ok(frequency_hz.round())
    }
}

#[async_trait]
impl Module for MockMicrowave {
    async fn on_activate(&self, _connectors: Connectors) -> Result<()> {
        self.connection.open("microwave source").await?;
        let mut state = self.state.write();
        state.connected = true;
        state.running = false;
        info!(
            interface = %self.connection.interface,
            frequency_hz = state.frequency_hz,
            power_dbm = state.power_dbm,
            "Mock microwave source ready"
        );
        Ok(())
    }

    async fn on_deactivate(&self) -> Result<()> {
        let mut state = self.state.write();
        state.running = false;
        state.connected = false;
        Ok(())
    }

    fn get_status_variable(&self, name: &str) -> Option<Value> {
        let state = self.state.read();
        match name {
            "cw_frequency_hz" => Some(json!(state.frequency_hz)),
            "cw_power_dbm" => Some(json!(state.power_dbm)),
            _ => None,
        }
    }

    fn set_status_variable(&self, name: &str, value: Value) -> Result<()> {
        let number = value
            .as_f64()
            .ok_or_else(|| anyhow!("{name} must be a number, got {value}"))?;
        match name {
            "cw_frequency_hz" => {
                let frequency_hz = self.check_frequency(number)?;
                self.state.write().frequency_hz = frequency_hz;
            }
            "cw_power_dbm" => self.state.write().power_dbm = number,
            _ => bail!("mock microwave has no status variable '{name}'"),
        }
        Ok(())
    }

    fn as_microwave(&self) -> Option<&dyn MicrowaveSource> {
        Some(self)
    }
}

#[async_trait]
impl MicrowaveSource for MockMicrowave {
    async fn set_cw(&self, frequency_hz: f64, power_dbm: f64) -> Result<(f64, f64)> {
        let frequency_hz = self.check_frequency(frequency_hz)?;
        let power_dbm = (power_dbm * 100.0).round() / 100.0;
        let mut state = self.state.write();
        if state.running {
            bail!("cannot change CW parameters while the output is on");
        }
        state.frequency_hz = frequency_hz;
        state.power_dbm = power_dbm;
        Ok((frequency_hz, power_dbm))
    }

    async fn cw_on(&self) -> Result<()> {
        let mut state = self.state.write();
        if !state.connected {
            bail!("microwave source is not connected");
        }
        state.running = true;
        Ok(())
    }

    async fn off(&self) -> Result<()> {
        self.state.write().running = false;
        Ok(())
    }

    async fn is_running(&self) -> Result<bool> {
        Ok(self.state.read().running)
    }

    fn frequency_limits(&self) -> (f64, f64) {
        self.frequency_limits
    }
}
