//! # Vialstat Common
//!
//! Shared types, errors, and numeric helpers for the vialstat culture controller.
//!
//! ## Core Types
//!
//! - [`OdReading`], [`OdSetRecord`], [`PumpEvent`], [`GrowthRateRecord`],
//!   [`SelectionStateRecord`]: the per-vial append-only log records
//! - [`OdThresholds`], [`SelectionParams`], [`SelectionLadder`], [`VialConfig`]:
//!   validated static vial configuration
//! - [`FluidicCommand`]: the 48-slot pump actuation message
//!
//! ## Statistics
//!
//! - [`stats::median`]: outlier-tolerant summary used for every OD window

pub mod error;
pub mod stats;
pub mod types;

// Re-export commonly used types at crate root
pub use error::{ConfigError, Result, StoreError, VialstatError};
pub use types::{
    fluidic::{FlowCalibration, FluidicCommand, PumpBank},
    records::{
        GrowthRateRecord, LogKind, OdReading, OdSetRecord, PumpEvent, Record,
        SelectionStateRecord, SlowPumpEvent,
    },
    vial::{OdThresholds, SelectionConfig, SelectionLadder, SelectionParams, VialConfig},
};

/// Vialstat version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Index of a vial in the device array
pub type VialId = usize;

/// Number of vial slots on the device
pub const NUM_VIALS: usize = 16;

/// Number of pump slots in a fluidic command (influx, efflux, chemical)
pub const FLUIDIC_SLOTS: usize = NUM_VIALS * 3;

/// Sentinel sent for pumps that should not change this tick
pub const NOOP_SLOT: &str = "--";

/// Tolerance used when matching log timestamps across files
pub const TIME_EPSILON: f64 = 1e-9;

/// Round to two decimals, the resolution of pump durations
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Round to five decimals, the resolution of logged concentrations
pub fn round5(value: f64) -> f64 {
    (value * 100_000.0).round() / 100_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round2() {
        assert_eq!(round2(3.14159), 3.14);
        assert_eq!(round2(20.0), 20.0);
        assert!(round2(f64::NAN).is_nan());
    }

    #[test]
    fn test_slot_layout() {
        assert_eq!(FLUIDIC_SLOTS, 48);
    }
}
