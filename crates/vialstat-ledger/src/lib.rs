//! # Vialstat Ledger
//!
//! Append-only, per-vial, time-ordered logs that hold all durable controller
//! state. Nothing is carried in memory between ticks: each tick reloads the
//! newest records it needs.
//!
//! ## Backends
//!
//! - [`CsvVialStore`]: comma-separated files in the experiment directory
//! - [`InMemoryVialStore`]: DashMap-backed rows for tests and simulation
//!
//! Both encode rows with the same [`codec`], so a record reads back the same
//! way from either backend.

pub mod codec;
pub mod csv_store;
pub mod memory;
pub mod store;

pub use csv_store::CsvVialStore;
pub use memory::InMemoryVialStore;
pub use store::VialStore;

/// Directory holding the labeled selection-control records
pub const SELECTION_CONTROL_DIR: &str = "selection-control";

/// Directory holding the selection step sequences
pub const SELECTION_STEPS_DIR: &str = "selection-steps";
