//! Rescue dilutions
//!
//! When the ladder retreats, the vial still holds chemical at the old level.
//! A rescue dilution washes it down towards the new target so the population
//! can recover, bounded by `rescue_dilutions` per INCREASE.

use serde::Serialize;
use tracing::{error, info, warn};

use vialstat_common::{
    round2, PumpEvent, Result, SelectionParams, SelectionStateRecord, VialId, TIME_EPSILON,
};
use vialstat_ledger::VialStore;

use crate::config::ControllerConfig;
use crate::fluidics::{CommandAggregator, PumpSource};
use crate::turbidostat::minutes_since;

/// Status tag marking a rescue dilution in the step log
pub const RESCUE_TAG: &str = "RESCUE DILUTION";

/// Status tag marking a ladder increase in the step log
pub const INCREASE_TAG: &str = "INCREASE:";

/// What the rescue policy did on a DECREASE
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "rescue", rename_all = "snake_case")]
pub enum RescueOutcome {
    /// `rescue_dilutions` is zero
    Disabled,
    /// Cap on rescues since the last INCREASE already reached
    CapReached { count: usize, cap: u32 },
    /// Culture too thin to dilute further
    OdTooLow { median_od: f64, floor: f64 },
    /// A dilution from an earlier tick is too recent
    PumpWait { minutes_since_last: f64 },
    /// Pump time was not a usable number
    NumericInstability { time_in: f64 },
    /// Influx and efflux requested
    Diluted {
        time_in: f64,
        time_out: f64,
        /// Dilution factor actually delivered
        dilution_factor: f64,
        /// Whether the pump time hit the dilution ceiling
        clamped: bool,
    },
}

/// Inputs of one rescue decision
#[derive(Debug, Clone, Copy)]
pub struct RescueRequest<'a> {
    pub params: &'a SelectionParams,
    pub lower_threshold: f64,
    /// Median OD over the trailing dilution window
    pub median_od: f64,
    /// Step in force before this tick's DECREASE
    pub last_step: f64,
    /// Concentration in the vial before this tick
    pub last_concentration: f64,
    /// Step chosen by the DECREASE
    pub new_step: f64,
}

impl RescueRequest<'_> {
    /// Dilution factor that would bring the vial to the new step
    pub fn raw_factor(&self) -> f64 {
        if self.last_step == 0.0 {
            self.params.rescue_threshold
        } else {
            self.new_step / self.last_concentration
        }
    }

    /// Factor to dilute by, never below `rescue_threshold`
    pub fn requested_factor(&self) -> f64 {
        let factor = self.raw_factor();
        // NaN falls through unchanged and is caught on the pump time
        if factor < self.params.rescue_threshold {
            self.params.rescue_threshold
        } else {
            factor
        }
    }
}

/// Count rescue dilutions logged since the newest INCREASE
pub fn count_rescues<S: VialStore>(store: &S, vial: VialId) -> Result<usize> {
    let history = store.read_all::<SelectionStateRecord>(vial)?;
    let mut count = 0;
    for record in history.iter().rev() {
        if record.status_message.contains(INCREASE_TAG) {
            break;
        }
        if record.status_message.contains(RESCUE_TAG) {
            count += 1;
        }
    }
    Ok(count)
}

/// Rescue-dilution policy
#[derive(Debug, Clone, Copy)]
pub struct RescuePolicy<'a> {
    config: &'a ControllerConfig,
}

impl<'a> RescuePolicy<'a> {
    pub fn new(config: &'a ControllerConfig) -> Self {
        Self { config }
    }

    /// Pump time (s) and delivered factor for a requested dilution factor.
    ///
    /// Returns `(time_in, factor, clamped)`; `time_in` is unrounded and may be
    /// NaN or non-positive.
    pub fn pump_time(&self, factor: f64, flow_rate: f64) -> (f64, f64, bool) {
        let volume = self.config.volume_ml;
        let time_in = -(factor.ln() * volume) / flow_rate;
        if time_in > self.config.max_dilution_secs {
            let time_in = self.config.max_dilution_secs;
            let achieved = ((time_in * flow_rate) / -volume).exp();
            (time_in, achieved, true)
        } else {
            (time_in, factor, false)
        }
    }

    /// Apply the rescue policy after a DECREASE
    #[allow(clippy::too_many_arguments)]
    pub fn evaluate<S: VialStore>(
        &self,
        store: &S,
        vial: VialId,
        request: &RescueRequest<'_>,
        rescue_count: usize,
        flow_rate: f64,
        elapsed: f64,
        aggregator: &mut CommandAggregator,
    ) -> Result<RescueOutcome> {
        let params = request.params;
        if params.rescue_dilutions == 0 {
            return Ok(RescueOutcome::Disabled);
        }
        if rescue_count >= params.rescue_dilutions as usize {
            warn!(
                vial,
                rescue_count,
                cap = params.rescue_dilutions,
                "Skipping rescue dilution, cap reached since last increase"
            );
            return Ok(RescueOutcome::CapReached {
                count: rescue_count,
                cap: params.rescue_dilutions,
            });
        }

        let floor = request.lower_threshold * params.rescue_threshold;
        if !(request.median_od > floor) {
            info!(vial, median_od = request.median_od, floor, "OD too low for rescue dilution");
            return Ok(RescueOutcome::OdTooLow {
                median_od: request.median_od,
                floor,
            });
        }

        // Same-tick turbidostat dilutions do not count against the spacing
        let earlier = store
            .read_last::<PumpEvent>(vial, 2)?
            .into_iter()
            .rev()
            .find(|event| event.time < elapsed - TIME_EPSILON);
        if let Some(minutes) = minutes_since(earlier.as_ref(), elapsed) {
            if minutes < self.config.pump_wait_minutes {
                info!(
                    vial,
                    minutes_since_last = minutes,
                    "Rescue dilution deferred by pump spacing"
                );
                return Ok(RescueOutcome::PumpWait {
                    minutes_since_last: minutes,
                });
            }
        }

        let raw = request.raw_factor();
        if raw < params.rescue_threshold {
            warn!(
                vial,
                dilution_factor = raw,
                rescue_threshold = params.rescue_threshold,
                last_step = request.last_step,
                new_step = request.new_step,
                units = %params.selection_units,
                "Rescue dilution factor raised to the rescue threshold"
            );
        }

        let (time_in, dilution_factor, clamped) =
            self.pump_time(request.requested_factor(), flow_rate);
        if time_in.is_nan() || time_in <= 0.0 {
            error!(vial, time_in, "Skipping rescue dilution, time_in is not usable");
            return Ok(RescueOutcome::NumericInstability { time_in });
        }
        if clamped {
            info!(
                vial,
                target = request.new_step,
                dilution_factor,
                "Rescue dilution limited by maximum pump time"
            );
        } else {
            info!(vial, dilution_factor, "Rescue dilution");
        }

        let time_in = round2(time_in);
        let time_out = round2(time_in + self.config.time_out_secs);
        aggregator.request_dilution(PumpSource::Rescue, vial, time_in, time_out);
        store.append(vial, &PumpEvent::new(elapsed, time_in))?;

        Ok(RescueOutcome::Diluted {
            time_in,
            time_out,
            dilution_factor,
            clamped,
        })
    }
}
