//! # Vialstat Control
//!
//! Per-tick closed-loop controller for a 16-vial continuous-culture device.
//!
//! ## Key Concepts
//!
//! - **Turbidostat**: hysteresis between a lower and an upper OD threshold;
//!   each crossing of the upper threshold closes a growth curve and triggers a
//!   dilution back down to the lower threshold
//! - **Selection ladder**: a per-vial sequence of chemical concentrations,
//!   climbed when the culture grows fast and descended when it stalls
//! - **Rescue dilution**: an extra dilution on descent that washes chemical out
//! - **Bolus dosing**: stock solution pumped to bring the vial up to its step
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────┐
//! │                      Controller                       │
//! │   ingest_frame ──► OD logs        tick ──► TickReport │
//! │                                                       │
//! │  ┌─────────────┐  ┌───────────────────────────────┐   │
//! │  │ Turbidostat │  │     SelectionController       │   │
//! │  │ (all vials) │  │ ladder → rescue → dosing      │   │
//! │  └──────┬──────┘  └──────────────┬────────────────┘   │
//! │         │                        │                    │
//! │  ┌──────┴────────────────────────┴────────────────┐   │
//! │  │     CommandAggregator (48 slots, last wins)    │   │
//! │  └──────────────────────┬─────────────────────────┘   │
//! │                         ▼                             │
//! │                     Actuator                          │
//! └───────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod fluidics;
pub mod growth;
pub mod selection;
pub mod tick;
pub mod turbidostat;

// Re-export core types
pub use config::{ControllerConfig, VialstatConfig};
pub use fluidics::{Actuator, CommandAggregator, JsonLineActuator, PumpSource, SlotOverride};
pub use growth::{GrowthRateTracker, LogLinearGrowthTracker};
pub use selection::{SelectionController, SelectionOutcome, SelectionReport};
pub use tick::{Controller, SensorFrame, TickContext, TickReport, VialFailure, VialReport};
pub use turbidostat::{Turbidostat, TurbidostatAction, TurbidostatOutcome};

/// Controller version
pub const CONTROLLER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Culture volume (mL) of the standard vial setup
pub const DEFAULT_VOLUME_ML: f64 = 25.0;
