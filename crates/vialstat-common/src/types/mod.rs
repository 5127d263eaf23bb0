//! Core data types for vialstat

pub mod fluidic;
pub mod records;
pub mod vial;
