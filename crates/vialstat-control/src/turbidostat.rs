//! Turbidostat: hysteresis threshold control of culture density
//!
//! Each vial alternates between two targets. While growing, the target is the
//! upper threshold; once OD crosses it the target drops to the lower threshold
//! and the vial is diluted until OD falls back inside the bottom third of the
//! band, where the next growth curve starts.

use serde::Serialize;
use tracing::{debug, info, warn};

use vialstat_common::{
    round2, stats, GrowthRateRecord, OdReading, OdSetRecord, OdThresholds, PumpEvent, Result,
    VialId,
};
use vialstat_ledger::VialStore;

use crate::config::ControllerConfig;
use crate::fluidics::{CommandAggregator, PumpSource};
use crate::growth::GrowthRateTracker;

/// Allowance above `stop_after_n_curves` before dilutions stop
pub const CURVE_LIMIT_SLACK: f64 = 2.0;

/// Direction of a hysteresis flip
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetFlip {
    /// Growth curve ended, dilute down to the lower threshold
    ToLower,
    /// Dilution finished, grow up to the upper threshold
    ToUpper,
}

/// What the turbidostat did for a vial this tick
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum TurbidostatAction {
    /// No OD readings yet
    InsufficientData,
    /// OD at or below the active target
    Hold,
    /// Curve limit reached, no more dilutions
    CurveLimitReached { curves: f64 },
    /// Dilution due but the previous one was too recent
    PumpWait { minutes_since_last: f64 },
    /// Dilution cancelled because the pump time was not a usable number
    NumericInstability { time_in: f64 },
    /// Influx and efflux requested
    Diluted { time_in: f64, time_out: f64 },
}

/// Result of one vial's turbidostat evaluation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TurbidostatOutcome {
    /// Median of the recent OD window
    pub average_od: Option<f64>,
    /// Target in force after any flip
    pub target: f64,
    pub flip: Option<TargetFlip>,
    /// Growth-rate sample recorded when a curve closed
    pub growth_sample: Option<GrowthRateRecord>,
    pub action: TurbidostatAction,
}

impl TurbidostatOutcome {
    fn insufficient_data() -> Self {
        Self {
            average_od: None,
            target: OdSetRecord::NEVER_DILUTED,
            flip: None,
            growth_sample: None,
            action: TurbidostatAction::InsufficientData,
        }
    }
}

/// Hysteresis controller over a vial store
#[derive(Debug, Clone, Copy)]
pub struct Turbidostat<'a> {
    config: &'a ControllerConfig,
}

impl<'a> Turbidostat<'a> {
    pub fn new(config: &'a ControllerConfig) -> Self {
        Self { config }
    }

    /// Influx time (s) to dilute from `average_od` down to `lower`.
    ///
    /// Clamped to the maximum dilution time and rounded to the pump's
    /// resolution. NaN inputs stay NaN.
    pub fn dilution_time(&self, lower: f64, average_od: f64, flow_rate: f64) -> f64 {
        let mut time_in = -((lower / average_od).ln() * self.config.volume_ml) / flow_rate;
        if time_in > self.config.max_dilution_secs {
            time_in = self.config.max_dilution_secs;
        }
        round2(time_in)
    }

    /// Run hysteresis and dilution for one vial
    #[allow(clippy::too_many_arguments)]
    pub fn evaluate<S: VialStore, G: GrowthRateTracker>(
        &self,
        store: &S,
        tracker: &G,
        vial: VialId,
        thresholds: OdThresholds,
        flow_rate: f64,
        elapsed: f64,
        aggregator: &mut CommandAggregator,
    ) -> Result<TurbidostatOutcome> {
        let od_window = store.read_last::<OdReading>(vial, self.config.od_values_to_average)?;
        let values: Vec<f64> = od_window.iter().map(|r| r.od).collect();
        let Some(average_od) = stats::median(&values) else {
            debug!(vial, "Not enough OD measurements");
            return Ok(TurbidostatOutcome::insufficient_data());
        };

        let last_set = store.last::<OdSetRecord>(vial)?;
        let num_curves = store.count::<OdSetRecord>(vial)? as f64 / 2.0;
        let (mut target, set_time) = match last_set {
            Some(record) => (record.target, record.time),
            None => (OdSetRecord::NEVER_DILUTED, 0.0),
        };

        let mut flip = None;
        let mut growth_sample = None;
        if average_od > thresholds.upper && target != thresholds.lower {
            // Curve ended: dilute down and measure the curve just closed
            store.append(vial, &OdSetRecord::new(elapsed, thresholds.lower))?;
            target = thresholds.lower;
            flip = Some(TargetFlip::ToLower);
            growth_sample = tracker.close_curve(store, vial, set_time, elapsed)?;
            debug!(vial, average_od, target, "Upper threshold crossed");
        } else if average_od < thresholds.band_floor() && target != thresholds.upper {
            store.append(vial, &OdSetRecord::new(elapsed, thresholds.upper))?;
            target = thresholds.upper;
            flip = Some(TargetFlip::ToUpper);
            debug!(vial, average_od, target, "Growth curve started");
        }

        let action = if average_od <= target {
            TurbidostatAction::Hold
        } else if !self.collecting_more_curves(num_curves) {
            debug!(vial, curves = num_curves, "Curve limit reached");
            TurbidostatAction::CurveLimitReached { curves: num_curves }
        } else {
            self.dilute(store, vial, thresholds, average_od, flow_rate, elapsed, aggregator)?
        };

        Ok(TurbidostatOutcome {
            average_od: Some(average_od),
            target,
            flip,
            growth_sample,
            action,
        })
    }

    fn collecting_more_curves(&self, num_curves: f64) -> bool {
        match self.config.stop_after_n_curves {
            Some(limit) => num_curves <= limit as f64 + CURVE_LIMIT_SLACK,
            None => true,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn dilute<S: VialStore>(
        &self,
        store: &S,
        vial: VialId,
        thresholds: OdThresholds,
        average_od: f64,
        flow_rate: f64,
        elapsed: f64,
        aggregator: &mut CommandAggregator,
    ) -> Result<TurbidostatAction> {
        let time_in = self.dilution_time(thresholds.lower, average_od, flow_rate);

        let last_pump = store.last::<PumpEvent>(vial)?;
        if let Some(minutes) = minutes_since(last_pump.as_ref(), elapsed) {
            if minutes < self.config.pump_wait_minutes {
                debug!(vial, minutes_since_last = minutes, "Waiting for pump spacing");
                return Ok(TurbidostatAction::PumpWait {
                    minutes_since_last: minutes,
                });
            }
        }

        if time_in.is_nan() || time_in <= 0.0 {
            warn!(vial, time_in, "time_in is not usable, cancelling turbidostat dilution");
            return Ok(TurbidostatAction::NumericInstability { time_in });
        }

        let time_out = round2(time_in + self.config.time_out_secs);
        aggregator.request_dilution(PumpSource::Turbidostat, vial, time_in, time_out);
        store.append(vial, &PumpEvent::new(elapsed, time_in))?;
        info!(vial, average_od, time_in, "Turbidostat dilution");

        Ok(TurbidostatAction::Diluted { time_in, time_out })
    }
}

/// Minutes between the last pump event and `elapsed` (hours)
pub(crate) fn minutes_since(last: Option<&PumpEvent>, elapsed: f64) -> Option<f64> {
    last.map(|event| (elapsed - event.time) * 60.0)
}
