//! Error types for the vialstat controller
//!
//! Storage and actuator failures are fatal for a tick; everything else is
//! isolated to the vial that raised it.

use thiserror::Error;

use crate::VialId;

/// Result type alias using VialstatError
pub type Result<T> = std::result::Result<T, VialstatError>;

/// Unified error type for vialstat operations
#[derive(Debug, Error)]
pub enum VialstatError {
    // Durable state errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    // Actuator dispatch errors
    #[error("Actuator error: {0}")]
    Actuator(String),

    // Too few samples to evaluate a vial
    #[error("Insufficient data for vial {vial}: {detail}")]
    InsufficientData { vial: VialId, detail: String },

    // Unexpected failure while evaluating one vial
    #[error("Vial {vial} processing failed during {stage}: {reason}")]
    VialProcessing {
        vial: VialId,
        stage: &'static str,
        reason: String,
    },

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl VialstatError {
    /// Whether the error must abort the tick instead of skipping one vial
    pub fn is_fatal(&self) -> bool {
        matches!(self, VialstatError::Store(_) | VialstatError::Actuator(_))
    }
}

/// Durable vial log errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O failure on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed {log} record for vial {vial}: {reason}")]
    Malformed {
        log: &'static str,
        vial: VialId,
        reason: String,
    },

    #[error("Out-of-order {log} append for vial {vial}: {time} precedes {last}")]
    OutOfOrder {
        log: &'static str,
        vial: VialId,
        last: f64,
        time: f64,
    },

    #[error("Vial index {0} outside the device array")]
    UnknownVial(VialId),

    #[error("Encoding failure: {0}")]
    Encoding(String),
}

/// Configuration validation errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Vial {0} is not in the device array")]
    UnknownVial(VialId),

    #[error("Vial {vial}: lower threshold {lower} exceeds upper threshold {upper}")]
    InvertedThresholds { vial: VialId, lower: f64, upper: f64 },

    #[error("Vial {vial}: selection steps must be non-empty and strictly ascending")]
    UnorderedSteps { vial: VialId },

    #[error("Vial {vial}: invalid selection parameter {name} = {value}")]
    InvalidParameter {
        vial: VialId,
        name: &'static str,
        value: f64,
    },

    #[error("Threshold override lists {actual} vials, expected {expected}")]
    OverrideLength { expected: usize, actual: usize },

    #[error("Invalid controller setting {name}: {reason}")]
    InvalidSetting { name: &'static str, reason: String },

    #[error("Failed to load configuration: {0}")]
    Load(String),
}

impl From<serde_json::Error> for VialstatError {
    fn from(err: serde_json::Error) -> Self {
        VialstatError::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for VialstatError {
    fn from(err: anyhow::Error) -> Self {
        VialstatError::Internal(err.to_string())
    }
}
