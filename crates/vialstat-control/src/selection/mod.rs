//! Selection controller
//!
//! Per vial, a step ladder of chemical concentrations. The controller reads
//! the newest step-log snapshot, decides whether to move one rung, rescues the
//! culture on a retreat, tracks the concentration left after dilutions and
//! tops it back up with a bolus. One snapshot is appended when anything changed.
//!
//! Evaluation is split into a logic stage and a fluidics stage so the tick can
//! isolate failures of each.

pub mod dosing;
pub mod ladder;
pub mod rescue;

use serde::Serialize;
use std::fmt;
use tracing::{debug, info, warn};

use vialstat_common::{
    round5, stats, GrowthRateRecord, OdReading, OdThresholds, PumpEvent, Result,
    SelectionConfig, SelectionStateRecord, VialId, VialstatError,
};
use vialstat_ledger::VialStore;

use crate::config::ControllerConfig;
use crate::fluidics::CommandAggregator;

pub use dosing::{BolusOutcome, DosingPolicy};
pub use ladder::{ChangeReason, Decision, GrowthWindow, LadderEdge, LadderMove};
pub use rescue::{RescueOutcome, RescuePolicy, RescueRequest};

/// Failure boundary within a selection evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStage {
    Logic,
    Fluidics,
}

impl SelectionStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            SelectionStage::Logic => "selection logic",
            SelectionStage::Fluidics => "selection fluidics",
        }
    }
}

/// One entry of a step-log status message
#[derive(Debug, Clone, PartialEq)]
pub enum StatusEvent {
    Change(Decision),
    RescueDilution { dilution_factor: f64 },
    Dilution { dilution_factor: f64 },
    ChemicalAdded { volume_ml: f64 },
    SkippedLowOd { median_od: f64 },
}

impl fmt::Display for StatusEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusEvent::Change(decision) => {
                let label = decision.label().unwrap_or("STAY");
                let reasons: Vec<String> =
                    decision.reasons().iter().map(ToString::to_string).collect();
                write!(f, "{label}: {} | ", reasons.join(" "))
            }
            StatusEvent::RescueDilution { dilution_factor } => {
                write!(f, "{} {dilution_factor:.3}X | ", rescue::RESCUE_TAG)
            }
            StatusEvent::Dilution { dilution_factor } => {
                write!(f, "DILUTION {dilution_factor:.3}X | ")
            }
            StatusEvent::ChemicalAdded { volume_ml } => {
                write!(f, "SELECTION CHEMICAL ADDED {volume_ml:.3}mL | ")
            }
            StatusEvent::SkippedLowOd { median_od } => {
                write!(f, "SKIPPED SELECTION CHEMICAL - LOW OD {median_od:.2} | ")
            }
        }
    }
}

/// Render status events as a step-log message
pub fn status_message(events: &[StatusEvent]) -> String {
    events.iter().map(ToString::to_string).collect()
}

/// Inputs read once per tick for an active vial
#[derive(Debug, Clone)]
pub struct SelectionContext {
    pub growth: Vec<GrowthRateRecord>,
    /// The newest `2 * dilution_window` OD readings
    pub od_window: Vec<OdReading>,
    pub median_od: f64,
    /// Newest step-log snapshot, or the initial state
    pub previous: SelectionStateRecord,
}

/// Whether selection has started for a vial
#[derive(Debug, Clone)]
pub enum Readiness {
    NotStarted { curves: usize, od_samples: usize },
    Active(SelectionContext),
}

/// Result of the logic stage
#[derive(Debug, Clone, PartialEq)]
pub struct LadderOutcome {
    pub window: Option<GrowthWindow>,
    pub decision: Decision,
    pub ladder_move: Option<LadderMove>,
    pub rescue: Option<RescueOutcome>,
    /// Step in force after this tick
    pub step: f64,
    pub step_changed_time: f64,
    pub status: Vec<StatusEvent>,
}

/// Full selection evaluation of an active vial
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SelectionReport {
    pub window: Option<GrowthWindow>,
    pub decision: Decision,
    pub ladder_move: Option<LadderMove>,
    pub rescue: Option<RescueOutcome>,
    /// Washout measured across the newest dilution
    pub measured_dilution: Option<f64>,
    pub bolus: BolusOutcome,
    /// Snapshot after this tick
    pub state: SelectionStateRecord,
    /// Whether the snapshot was appended to the step log
    pub logged: bool,
}

/// Selection result of one vial in a tick
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum SelectionOutcome {
    /// Vial has no selection configuration
    Disabled,
    /// Waiting for enough growth curves or OD samples
    NotStarted { curves: usize, od_samples: usize },
    Active(Box<SelectionReport>),
    /// A stage failed; see the vial's failures
    Skipped,
}

/// Step-ladder selection over a vial store
#[derive(Debug, Clone, Copy)]
pub struct SelectionController<'a> {
    config: &'a ControllerConfig,
}

impl<'a> SelectionController<'a> {
    pub fn new(config: &'a ControllerConfig) -> Self {
        Self { config }
    }

    /// Read the inputs and decide whether selection is active
    pub fn prepare<S: VialStore>(
        &self,
        store: &S,
        vial: VialId,
        selection: &SelectionConfig,
    ) -> Result<Readiness> {
        let window = 2 * self.config.dilution_window;
        let growth = store.read_all::<GrowthRateRecord>(vial)?;
        let od_window = store.read_last::<OdReading>(vial, window)?;

        // A growth rate is needed to judge the ladder even when curves_to_start is 0
        let curves_needed = (selection.params.curves_to_start as usize).max(1);
        if growth.len() < curves_needed || od_window.len() < window {
            debug!(
                vial,
                curves = growth.len(),
                od_samples = od_window.len(),
                "Selection not started"
            );
            return Ok(Readiness::NotStarted {
                curves: growth.len(),
                od_samples: od_window.len(),
            });
        }

        let values: Vec<f64> = od_window.iter().map(|r| r.od).collect();
        let median_od = stats::median(&values).ok_or_else(|| VialstatError::InsufficientData {
            vial,
            detail: "empty OD window".to_string(),
        })?;
        let previous = store
            .last::<SelectionStateRecord>(vial)?
            .unwrap_or_else(SelectionStateRecord::initial);

        Ok(Readiness::Active(SelectionContext {
            growth,
            od_window,
            median_od,
            previous,
        }))
    }

    /// Decide the ladder move and apply any rescue dilution
    #[allow(clippy::too_many_arguments)]
    pub fn run_logic<S: VialStore>(
        &self,
        store: &S,
        vial: VialId,
        thresholds: OdThresholds,
        selection: &SelectionConfig,
        ctx: &SelectionContext,
        influx_flow: f64,
        elapsed: f64,
        aggregator: &mut CommandAggregator,
    ) -> Result<LadderOutcome> {
        let params = &selection.params;
        let previous = &ctx.previous;
        let mut outcome = LadderOutcome {
            window: None,
            decision: Decision::Stay,
            ladder_move: None,
            rescue: None,
            step: previous.current_step,
            step_changed_time: previous.step_changed_time,
            status: Vec::new(),
        };

        let step_time = elapsed - previous.step_changed_time;
        if step_time < params.min_step_time {
            debug!(vial, step_time, "Minimum step time not reached");
            return Ok(outcome);
        }

        let window = GrowthWindow::from_records(
            &ctx.growth,
            params.min_curves_per_step,
            previous.step_changed_time,
        )
        .ok_or_else(|| VialstatError::InsufficientData {
            vial,
            detail: "no growth-rate records".to_string(),
        })?;
        outcome.window = Some(window);
        outcome.decision = ladder::decide(params, &window, elapsed);

        let units = params.selection_units.as_str();
        match &outcome.decision {
            Decision::Stay => {}
            Decision::Decrease(_) => {
                let mv = ladder::step_down(&selection.ladder, previous.current_step);
                match mv.edge {
                    Some(LadderEdge::ClampedToZero) => warn!(
                        vial,
                        from = mv.from,
                        units,
                        "Decreasing selection to 0 on the first step; change step range or growth rate requirements"
                    ),
                    Some(LadderEdge::ReachedFirst) => warn!(
                        vial,
                        to = mv.to,
                        units,
                        "Decreasing selection to the first step; change step range or growth rate requirements"
                    ),
                    _ => info!(vial, from = mv.from, to = mv.to, units, "Decreasing selection"),
                }
                outcome.status.push(StatusEvent::Change(outcome.decision.clone()));
                outcome.step = mv.to;
                outcome.step_changed_time = elapsed;
                outcome.ladder_move = Some(mv);

                let request = RescueRequest {
                    params,
                    lower_threshold: thresholds.lower,
                    median_od: ctx.median_od,
                    last_step: previous.current_step,
                    last_concentration: previous.current_concentration,
                    new_step: mv.to,
                };
                let rescue_count = rescue::count_rescues(store, vial)?;
                let rescue = RescuePolicy::new(self.config).evaluate(
                    store,
                    vial,
                    &request,
                    rescue_count,
                    influx_flow,
                    elapsed,
                    aggregator,
                )?;
                if let RescueOutcome::Diluted {
                    dilution_factor, ..
                } = rescue
                {
                    outcome
                        .status
                        .push(StatusEvent::RescueDilution { dilution_factor });
                }
                outcome.rescue = Some(rescue);
            }
            Decision::Increase(_) => {
                let mv = ladder::step_up(&selection.ladder, previous.current_step);
                match mv.edge {
                    Some(LadderEdge::SecondToLast) => {
                        warn!(vial, to = mv.to, units, "Reached second to last selection step")
                    }
                    Some(LadderEdge::Maximum) => {
                        warn!(vial, to = mv.to, units, "Reached maximum selection step")
                    }
                    _ => {}
                }
                if mv.changed() {
                    info!(
                        vial,
                        growth_rate = window.trailing_rate,
                        from = mv.from,
                        to = mv.to,
                        units,
                        "Increasing selection"
                    );
                    outcome.step_changed_time = elapsed;
                }
                outcome.status.push(StatusEvent::Change(outcome.decision.clone()));
                outcome.step = mv.to;
                outcome.ladder_move = Some(mv);
            }
        }

        Ok(outcome)
    }

    /// Track concentration, dose chemical and log the new snapshot
    #[allow(clippy::too_many_arguments)]
    pub fn run_fluidics<S: VialStore>(
        &self,
        store: &S,
        vial: VialId,
        thresholds: OdThresholds,
        selection: &SelectionConfig,
        ctx: &SelectionContext,
        logic: LadderOutcome,
        chemical_flow: f64,
        elapsed: f64,
        aggregator: &mut CommandAggregator,
    ) -> Result<SelectionReport> {
        let previous = &ctx.previous;
        let mut status = logic.status;
        let mut concentration = previous.current_concentration;

        let mut measured = None;
        if previous.current_concentration != 0.0 {
            let last_pump = store.last::<PumpEvent>(vial)?;
            measured = dosing::measured_dilution(
                last_pump.as_ref(),
                &ctx.od_window,
                self.config.dilution_window,
            );
        }
        match measured {
            Some(factor) if factor.is_finite() => {
                let applied = factor.clamp(0.0, 1.0);
                if applied != factor {
                    warn!(
                        vial,
                        dilution_factor = factor,
                        applied,
                        "Measured dilution factor clamped to [0, 1]"
                    );
                }
                concentration *= applied;
                debug!(vial, dilution_factor = applied, concentration, "Dilution measured");
                status.push(StatusEvent::Dilution {
                    dilution_factor: applied,
                });
            }
            Some(factor) => {
                warn!(vial, dilution_factor = factor, "Measured dilution is not usable");
                measured = None;
            }
            None => {}
        }

        let (bolus, concentration) = DosingPolicy::new(self.config).evaluate(
            store,
            vial,
            selection.params.stock_concentration,
            logic.step,
            concentration,
            ctx.median_od,
            thresholds.lower,
            chemical_flow,
            elapsed,
            aggregator,
        )?;
        match bolus {
            BolusOutcome::Dosed { volume_ml, .. } => {
                status.push(StatusEvent::ChemicalAdded { volume_ml })
            }
            BolusOutcome::SkippedLowOd { median_od } => {
                status.push(StatusEvent::SkippedLowOd { median_od })
            }
            _ => {}
        }

        let state = SelectionStateRecord {
            time: elapsed,
            step_changed_time: logic.step_changed_time,
            current_step: logic.step,
            current_concentration: round5(concentration),
            status_message: status_message(&status),
        };
        let logged = state.step_changed_time != previous.step_changed_time
            || state.current_step != previous.current_step
            || concentration != previous.current_concentration
            || !state.status_message.is_empty();
        if logged {
            store.append(vial, &state)?;
            info!(
                vial,
                step = state.current_step,
                concentration = state.current_concentration,
                status = %state.status_message,
                "Selection state logged"
            );
        }

        Ok(SelectionReport {
            window: logic.window,
            decision: logic.decision,
            ladder_move: logic.ladder_move,
            rescue: logic.rescue,
            measured_dilution: measured,
            bolus,
            state,
            logged,
        })
    }
}
