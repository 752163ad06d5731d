//! OdmrScanLogic - CW ODMR frequency sweep
//!
//! Steps a microwave source through a frequency range, optionally gating a
//! laser around the sweep. The sweep range and microwave power are status
//! variables, so the last used settings come back after a restart.
//!
//! # Connectors
//!
//! - `microwave` (required): a module providing `MicrowaveSource`
//! - `laser` (optional): a module providing `LaserControl`
//!
//! # Example
//!
//! ```rust,ignore
//! manager.activate("odmr_logic").await?;
//! let odmr = manager.instance_as::<OdmrScanLogic>("odmr_logic").unwrap();
//! odmr.set_sweep(SweepSettings { start_hz: 2.8e9, stop_hz: 2.95e9, points: 151, power_dbm: -20.0 })?;
//! let applied = odmr.run_sweep().await?;
//! ```

use crate::config::{ModuleBase, ModuleOptions, OptionsExt};
use crate::hardware::capabilities::Capability;
use crate::modules::{Connector, Connectors, MissingPolicy, Module, ModuleClass};
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info};

/// Class identifier of [`OdmrScanLogic`].
pub const ODMR_SCAN_CLASS: &str = "logic.odmr_scan";

/// Frequency sweep parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SweepSettings {
    /// First frequency in Hz.
    pub start_hz: f64,
    /// Last frequency in Hz.
    pub stop_hz: f64,
    /// Number of frequencies, endpoints included.
    pub points: u64,
    /// Microwave power in dBm.
    pub power_dbm: f64,
}

impl Default for SweepSettings {
    fn default() -> Self {
        Self {
            start_hz: 2.82e9,
            stop_hz: 2.92e9,
            points: 101,
            power_dbm: -30.0,
        }
    }
}

impl SweepSettings {
    /// Equally spaced frequencies from `start_hz` to `stop_hz`.
    pub fn frequencies(&self) -> Vec<f64> {
        match self.points {
            0 => Vec::new(),
            1 => vec![self.start_hz],
            n => {
                let step = (self.stop_hz - self.start_hz) / (n - 1) as f64;
                (0..n).map(|i| self.start_hz + step * i as f64).collect()
            }
        }
    }
}

#[derive(Default)]
struct ScanState {
    settings: SweepSettings,
    microwave: Option<Connector>,
    laser: Option<Connector>,
    last_sweep: Vec<f64>,
}

/// ODMR frequency sweep logic.
pub struct OdmrScanLogic {
    max_points: u64,
    state: RwLock<ScanState>,
}

impl OdmrScanLogic {
    /// Class declaration of `logic.odmr_scan`.
    pub fn class() -> ModuleClass {
        let defaults = SweepSettings::default();
        ModuleClass::new(ODMR_SCAN_CLASS, ModuleBase::Logic, |options| {
            Ok(Arc::new(OdmrScanLogic::from_options(options)?) as Arc<dyn Module>)
        })
        .with_description("CW ODMR frequency sweep")
        .with_connector("microwave", Some(Capability::MicrowaveSource))
        .with_optional_connector("laser", Some(Capability::LaserControl))
        .with_option("max_points", Some(json!(10_000)), MissingPolicy::Silent)
        .with_status_variable("frequency_start_hz", json!(defaults.start_hz))
        .with_status_variable("frequency_stop_hz", json!(defaults.stop_hz))
        .with_status_variable("frequency_points", json!(defaults.points))
        .with_status_variable("microwave_power_dbm", json!(defaults.power_dbm))
    }

    /// Builds an instance from resolved options.
    pub fn from_options(options: &ModuleOptions) -> Result<Self> {
        let max_points = options.get_u64("max_points")?.unwrap_or(10_000);
        if max_points < 2 {
            bail!("max_points must be at least 2, got {max_points}");
        }
        Ok(Self {
            max_points,
            state: RwLock::new(ScanState::default()),
        })
    }

    /// Current sweep settings.
    pub fn settings(&self) -> SweepSettings {
        self.state.read().settings
    }

    /// Replaces the sweep settings.
    pub fn set_sweep(&self, settings: SweepSettings) -> Result<()> {
        self.validate(&settings)?;
        self.state.write().settings = settings;
        Ok(())
    }

    /// Frequencies applied by the last completed sweep.
    pub fn last_sweep(&self) -> Vec<f64> {
        self.state.read().last_sweep.clone()
    }

    /// Steps the microwave source through the sweep.
    ///
    /// Returns the frequencies the source actually applied.
    pub async fn run_sweep(&self) -> Result<Vec<f64>> {
        let (settings, microwave, laser) = {
            let state = self.state.read();
            (state.settings, state.microwave.clone(), state.laser.clone())
        };
        let microwave = microwave
            .ok_or_else(|| anyhow!("ODMR logic is not active"))?
            .get()?;
        let source = microwave
            .as_microwave()
            .ok_or_else(|| anyhow!("connector 'microwave' is not a microwave source"))?;
        let laser = laser.map(|connector| connector.get()).transpose()?;

        if let Some(laser) = laser.as_ref().and_then(|l| l.as_laser()) {
            laser.set_emission(true).await?;
        }

        let frequencies = settings.frequencies();
        info!(
            points = frequencies.len(),
            start_hz = settings.start_hz,
            stop_hz = settings.stop_hz,
            "Starting ODMR sweep"
        );

        let mut applied = Vec::with_capacity(frequencies.len());
        let result = async {
            for frequency in frequencies {
                let (frequency, _) = source.set_cw(frequency, settings.power_dbm).await?;
                source.cw_on().await?;
                source.off().await?;
                applied.push(frequency);
            }
            Ok::<_, anyhow::Error>(())
        }
        .await;

        source.off().await?;
        if let Some(laser) = laser.as_ref().and_then(|l| l.as_laser()) {
            laser.set_emission(false).await?;
        }
        result?;

        debug!(points = applied.len(), "ODMR sweep finished");
        self.state.write().last_sweep = applied.clone();
        Ok(applied)
    }

    fn validate(&self, settings: &SweepSettings) -> Result<()> {
        if settings.points < 2 || settings.points > self.max_points {
            bail!(
                "frequency_points must be within 2..={}, got {}",
                self.max_points,
                settings.points
            );
        }
        if settings.stop_hz <= settings.start_hz {
            bail!(
                "frequency_stop_hz ({}) must be above frequency_start_hz ({})",
                settings.stop_hz,
                settings.start_hz
            );
        }
        Ok(())
    }
}

#[async_trait]
impl Module for OdmrScanLogic {
    async fn on_activate(&self, connectors: Connectors) -> Result<()> {
        let microwave = connectors.require("microwave")?.clone();
        let (min, max) = microwave
            .get()?
            .as_microwave()
            .map(|source| source.frequency_limits())
            .ok_or_else(|| anyhow!("module '{}' is not a microwave source", microwave.target()))?;

        let mut state = self.state.write();
        self.validate(&state.settings)?;
        if state.settings.start_hz < min || state.settings.stop_hz > max {
            bail!(
                "sweep {}..{} Hz exceeds microwave range {min}..{max} Hz",
                state.settings.start_hz,
                state.settings.stop_hz
            );
        }
        state.microwave = Some(microwave);
        state.laser = connectors.get("laser").cloned();
        Ok(())
    }

    async fn on_deactivate(&self) -> Result<()> {
        let mut state = self.state.write();
        state.microwave = None;
        state.laser = None;
        Ok(())
    }

    fn get_status_variable(&self, name: &str) -> Option<Value> {
        let settings = self.settings();
        match name {
            "frequency_start_hz" => Some(json!(settings.start_hz)),
            "frequency_stop_hz" => Some(json!(settings.stop_hz)),
            "frequency_points" => Some(json!(settings.points)),
            "microwave_power_dbm" => Some(json!(settings.power_dbm)),
            _ => None,
        }
    }

    fn set_status_variable(&self, name: &str, value: Value) -> Result<()> {
        let mut settings = self.settings();
        match name {
            "frequency_points" => {
                settings.points = value
                    .as_u64()
                    .ok_or_else(|| anyhow!("frequency_points must be an integer, got {value}"))?;
            }
            "frequency_start_hz" | "frequency_stop_hz" | "microwave_power_dbm" => {
                let number = value
                    .as_f64()
                    .ok_or_else(|| anyhow!("{name} must be a number, got {value}"))?;
                match name {
                    "frequency_start_hz" => settings.start_hz = number,
                    "frequency_stop_hz" => settings.stop_hz = number,
                    _ => settings.power_dbm = number,
                }
            }
            _ => bail!("ODMR logic has no status variable '{name}'"),
        }
        // Start and stop arrive one at a time; their ordering is checked in on_activate.
        if name == "frequency_points" && (settings.points < 2 || settings.points > self.max_points) {
            bail!("frequency_points must be within 2..={}", self.max_points);
        }
        self.state.write().settings = settings;
        Ok(())
    }
}
