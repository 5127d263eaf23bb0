//! Per-vial log records
//!
//! Every log is append-only and time-ordered; the newest record is last. Times
//! are elapsed experiment hours.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fmt;

/// The per-vial logs kept by the state store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogKind {
    /// Transformed OD readings
    Od,
    /// Hysteresis threshold crossings
    OdSet,
    /// Main dilution pump events
    PumpLog,
    /// Slow selection-chemical pump events
    SlowPumpLog,
    /// Growth-rate samples, one per completed curve
    GrowthRate,
    /// Selection state snapshots
    StepLog,
}

impl LogKind {
    /// All log kinds, in the order the device layout creates them
    pub const ALL: [LogKind; 6] = [
        LogKind::Od,
        LogKind::OdSet,
        LogKind::PumpLog,
        LogKind::SlowPumpLog,
        LogKind::GrowthRate,
        LogKind::StepLog,
    ];

    /// Directory holding this log under the experiment directory
    pub fn dir(&self) -> &'static str {
        match self {
            LogKind::Od => "OD",
            LogKind::OdSet => "ODset",
            LogKind::PumpLog => "pump_log",
            LogKind::SlowPumpLog => "slow_pump_log",
            LogKind::GrowthRate => "growthrate",
            LogKind::StepLog => "step_log",
        }
    }

    /// File name suffix after `vial<N>_`
    pub fn suffix(&self) -> &'static str {
        match self {
            LogKind::Od => "OD",
            LogKind::OdSet => "ODset",
            LogKind::PumpLog => "pump_log",
            LogKind::SlowPumpLog => "slow_pump_log",
            LogKind::GrowthRate => "gr",
            LogKind::StepLog => "step_log",
        }
    }

    /// Header line written when a log file is created
    pub fn header(&self) -> &'static str {
        match self {
            LogKind::Od => "time,od",
            LogKind::OdSet => "time,target",
            LogKind::PumpLog | LogKind::SlowPumpLog => "time,duration",
            LogKind::GrowthRate => "time,rate",
            LogKind::StepLog => {
                "time,step_changed_time,current_step,current_concentration,status_message"
            }
        }
    }
}

impl fmt::Display for LogKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.suffix())
    }
}

/// A record that lives in one of the per-vial logs
pub trait Record: Serialize + DeserializeOwned + Clone + fmt::Debug + Send + Sync + 'static {
    /// Log this record type is stored in
    const KIND: LogKind;

    /// Elapsed experiment time of the record (hours)
    fn time(&self) -> f64;
}

/// One transformed OD reading
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OdReading {
    /// Elapsed time (hours)
    pub time: f64,
    /// Optical density
    pub od: f64,
}

impl OdReading {
    pub fn new(time: f64, od: f64) -> Self {
        Self { time, od }
    }
}

impl Record for OdReading {
    const KIND: LogKind = LogKind::Od;

    fn time(&self) -> f64 {
        self.time
    }
}

/// A hysteresis flip of the active OD target
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OdSetRecord {
    /// Elapsed time of the flip (hours)
    pub time: f64,
    /// Target that became active
    pub target: f64,
}

impl OdSetRecord {
    /// Target reported before the first flip has ever been logged
    pub const NEVER_DILUTED: f64 = 0.0;

    pub fn new(time: f64, target: f64) -> Self {
        Self { time, target }
    }
}

impl Record for OdSetRecord {
    const KIND: LogKind = LogKind::OdSet;

    fn time(&self) -> f64 {
        self.time
    }
}

/// A main dilution pump event
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PumpEvent {
    /// Elapsed time of the event (hours)
    pub time: f64,
    /// Influx pump on-time (seconds)
    pub duration: f64,
}

impl PumpEvent {
    pub fn new(time: f64, duration: f64) -> Self {
        Self { time, duration }
    }
}

impl Record for PumpEvent {
    const KIND: LogKind = LogKind::PumpLog;

    fn time(&self) -> f64 {
        self.time
    }
}

/// A slow (selection-chemical) pump event
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SlowPumpEvent {
    /// Elapsed time of the event (hours)
    pub time: f64,
    /// Chemical pump on-time (seconds)
    pub duration: f64,
}

impl SlowPumpEvent {
    pub fn new(time: f64, duration: f64) -> Self {
        Self { time, duration }
    }
}

impl Record for SlowPumpEvent {
    const KIND: LogKind = LogKind::SlowPumpLog;

    fn time(&self) -> f64 {
        self.time
    }
}

/// Growth rate measured over one completed growth curve
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GrowthRateRecord {
    /// End of the growth curve (hours)
    pub time: f64,
    /// Specific growth rate (per hour)
    pub rate: f64,
}

impl GrowthRateRecord {
    pub fn new(time: f64, rate: f64) -> Self {
        Self { time, rate }
    }
}

impl Record for GrowthRateRecord {
    const KIND: LogKind = LogKind::GrowthRate;

    fn time(&self) -> f64 {
        self.time
    }
}

/// Snapshot of a vial's selection state
///
/// The newest record is the authoritative state of the selection ladder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionStateRecord {
    /// Time the snapshot was written (hours)
    pub time: f64,
    /// Time the selection target last changed (hours)
    pub step_changed_time: f64,
    /// Selection target concentration
    pub current_step: f64,
    /// Estimated chemical concentration in the vial
    pub current_concentration: f64,
    /// What happened on the tick that wrote this snapshot
    pub status_message: String,
}

impl SelectionStateRecord {
    /// State of a vial whose selection has never run
    pub fn initial() -> Self {
        Self {
            time: 0.0,
            step_changed_time: 0.0,
            current_step: 0.0,
            current_concentration: 0.0,
            status_message: String::new(),
        }
    }
}

impl Record for SelectionStateRecord {
    const KIND: LogKind = LogKind::StepLog;

    fn time(&self) -> f64 {
        self.time
    }
}
