//! Fluidic actuation message and pump calibration
//!
//! A command has one slot per pump: influx pumps for vials 0..16, efflux
//! pumps at 16..32 and selection-chemical pumps at 32..48.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::ConfigError;
use crate::{VialId, FLUIDIC_SLOTS, NOOP_SLOT, NUM_VIALS};

/// Pump bank addressed by a command slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PumpBank {
    /// Media in
    Influx,
    /// Waste out
    Efflux,
    /// Selection-chemical stock in
    Chemical,
}

impl PumpBank {
    /// Slot index of this bank's pump for `vial`
    pub fn slot(&self, vial: VialId) -> usize {
        let offset = match self {
            PumpBank::Influx => 0,
            PumpBank::Efflux => NUM_VIALS,
            PumpBank::Chemical => NUM_VIALS * 2,
        };
        offset + vial
    }
}

/// 48-slot pump command sent once per tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FluidicCommand {
    /// Pump on-time in seconds, `None` leaves the pump alone
    slots: Vec<Option<f64>>,
}

impl Default for FluidicCommand {
    fn default() -> Self {
        Self::noop()
    }
}

impl FluidicCommand {
    /// Command that changes nothing
    pub fn noop() -> Self {
        Self {
            slots: vec![None; FLUIDIC_SLOTS],
        }
    }

    /// Set a pump duration, returning the value it replaced
    pub fn set(&mut self, bank: PumpBank, vial: VialId, seconds: f64) -> Option<f64> {
        let slot = bank.slot(vial);
        self.slots[slot].replace(seconds)
    }

    pub fn get(&self, bank: PumpBank, vial: VialId) -> Option<f64> {
        self.slots.get(bank.slot(vial)).copied().flatten()
    }

    pub fn is_noop(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }

    /// Number of pumps this command switches on
    pub fn active_slots(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Wire form: one string per slot, durations or the no-op sentinel
    pub fn encode(&self) -> Vec<String> {
        self.slots
            .iter()
            .map(|slot| match slot {
                Some(seconds) => seconds.to_string(),
                None => NOOP_SLOT.to_string(),
            })
            .collect()
    }
}

impl fmt::Display for FluidicCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.encode().join(","))
    }
}

/// Pump flow rates from calibration (mL per second), one per command slot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<f64>", into = "Vec<f64>")]
pub struct FlowCalibration {
    rates: Vec<f64>,
}

impl FlowCalibration {
    pub fn new(rates: Vec<f64>) -> Result<Self, ConfigError> {
        if rates.len() != FLUIDIC_SLOTS {
            return Err(ConfigError::InvalidSetting {
                name: "flow_rate",
                reason: format!("expected {} pump rates, got {}", FLUIDIC_SLOTS, rates.len()),
            });
        }
        Ok(Self { rates })
    }

    /// Same rate for every pump
    pub fn uniform(rate: f64) -> Self {
        Self {
            rates: vec![rate; FLUIDIC_SLOTS],
        }
    }

    pub fn rate(&self, bank: PumpBank, vial: VialId) -> f64 {
        self.rates[bank.slot(vial)]
    }

    /// Rate of the influx pump, used for dilution timing
    pub fn influx(&self, vial: VialId) -> f64 {
        self.rate(PumpBank::Influx, vial)
    }

    /// Rate of the selection-chemical pump, used for bolus timing
    pub fn chemical(&self, vial: VialId) -> f64 {
        self.rate(PumpBank::Chemical, vial)
    }
}

impl TryFrom<Vec<f64>> for FlowCalibration {
    type Error = ConfigError;

    fn try_from(rates: Vec<f64>) -> Result<Self, Self::Error> {
        Self::new(rates)
    }
}

impl From<FlowCalibration> for Vec<f64> {
    fn from(calibration: FlowCalibration) -> Self {
        calibration.rates
    }
}
