//! Tick orchestration
//!
//! One tick reads the newest state of every vial, runs the turbidostat over
//! all vials, then the selection controller, and dispatches the aggregated
//! fluidic command once. Storage and actuator failures abort the tick; any
//! other failure is confined to the vial and stage that raised it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use vialstat_common::{
    ConfigError, FlowCalibration, OdReading, OdThresholds, Result, SelectionConfig, StoreError,
    VialConfig, VialId, VialstatError, NUM_VIALS,
};
use vialstat_ledger::VialStore;

use crate::config::ControllerConfig;
use crate::fluidics::{Actuator, CommandAggregator};
use crate::growth::{GrowthRateTracker, LogLinearGrowthTracker};
use crate::selection::{Readiness, SelectionController, SelectionOutcome, SelectionStage};
use crate::turbidostat::{Turbidostat, TurbidostatOutcome};

/// One batch of OD readings from the device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorFrame {
    /// Elapsed experiment time (hours)
    pub elapsed_hours: f64,
    /// Transformed OD per vial; `null` when the sensor gave no value
    pub od: BTreeMap<VialId, Option<f64>>,
}

/// Inputs of one tick
#[derive(Debug, Clone, Copy)]
pub struct TickContext<'a> {
    pub flow: &'a FlowCalibration,
    pub elapsed_hours: f64,
    pub vials: &'a [VialId],
}

/// A stage that failed for one vial
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VialFailure {
    pub stage: &'static str,
    pub error: String,
}

/// Everything the controller did for one vial
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VialReport {
    pub vial: VialId,
    /// Band in force, `None` when the vial was rejected
    pub thresholds: Option<OdThresholds>,
    pub turbidostat: Option<TurbidostatOutcome>,
    pub selection: SelectionOutcome,
    pub failures: Vec<VialFailure>,
}

impl VialReport {
    fn new(vial: VialId) -> Self {
        Self {
            vial,
            thresholds: None,
            turbidostat: None,
            selection: SelectionOutcome::Disabled,
            failures: Vec::new(),
        }
    }
}

/// Summary of one tick
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TickReport {
    pub tick_id: Uuid,
    pub generated_at: DateTime<Utc>,
    pub elapsed_hours: f64,
    pub vials: Vec<VialReport>,
    /// Encoded command if one was dispatched
    pub command: Option<Vec<String>>,
}

impl TickReport {
    pub fn dispatched(&self) -> bool {
        self.command.is_some()
    }

    pub fn vial(&self, vial: VialId) -> Option<&VialReport> {
        self.vials.iter().find(|r| r.vial == vial)
    }

    pub fn failure_count(&self) -> usize {
        self.vials.iter().map(|r| r.failures.len()).sum()
    }
}

enum VialSetup {
    Ready {
        config: VialConfig,
        selection_error: Option<ConfigError>,
    },
    Rejected(ConfigError),
}

/// The per-tick controller over a vial store
pub struct Controller<S, G = LogLinearGrowthTracker> {
    config: ControllerConfig,
    store: S,
    tracker: G,
}

impl<S: VialStore> Controller<S> {
    /// Controller with the log-linear growth tracker
    pub fn new(config: ControllerConfig, store: S) -> Result<Self> {
        Self::with_tracker(config, store, LogLinearGrowthTracker::default())
    }
}

impl<S: VialStore, G: GrowthRateTracker> Controller<S, G> {
    pub fn with_tracker(config: ControllerConfig, store: S, tracker: G) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            store,
            tracker,
        })
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Append a sensor frame to the OD logs; returns the readings written
    #[instrument(skip_all, fields(elapsed = frame.elapsed_hours))]
    pub fn ingest_frame(&self, frame: &SensorFrame) -> Result<usize> {
        let mut written = 0;
        for (&vial, &od) in &frame.od {
            if vial >= NUM_VIALS {
                warn!(vial, "Reading for unknown vial dropped");
                continue;
            }
            let Some(od) = od.filter(|v| v.is_finite()) else {
                warn!(vial, ?od, "Non-numeric OD reading dropped");
                continue;
            };
            self.store
                .append(vial, &OdReading::new(frame.elapsed_hours, od))?;
            written += 1;
        }
        debug!(written, "Sensor frame ingested");
        Ok(written)
    }

    /// Run one control tick and dispatch the resulting command
    #[instrument(skip_all, fields(elapsed = ctx.elapsed_hours, vials = ctx.vials.len()))]
    pub fn tick<A: Actuator>(
        &self,
        ctx: &TickContext<'_>,
        actuator: &mut A,
    ) -> Result<TickReport> {
        let elapsed = ctx.elapsed_hours;
        let mut aggregator = CommandAggregator::new();
        let mut reports = Vec::with_capacity(ctx.vials.len());
        let mut setups = Vec::with_capacity(ctx.vials.len());

        for &vial in ctx.vials {
            let mut report = VialReport::new(vial);
            match self.setup_vial(vial, elapsed)? {
                VialSetup::Ready {
                    config,
                    selection_error,
                } => {
                    if let Some(e) = selection_error {
                        warn!(
                            vial,
                            error = %e,
                            "Selection configuration rejected, turbidostat only"
                        );
                        report.failures.push(VialFailure {
                            stage: "configuration",
                            error: e.to_string(),
                        });
                    }
                    report.thresholds = Some(config.thresholds);
                    setups.push(Some(config));
                }
                VialSetup::Rejected(e) => {
                    warn!(vial, error = %e, "Vial configuration rejected, vial skipped");
                    report.failures.push(VialFailure {
                        stage: "configuration",
                        error: e.to_string(),
                    });
                    setups.push(None);
                }
            }
            reports.push(report);
        }

        let turbidostat = Turbidostat::new(&self.config);
        for (report, setup) in reports.iter_mut().zip(&setups) {
            let Some(config) = setup else { continue };
            let result = turbidostat.evaluate(
                &self.store,
                &self.tracker,
                config.vial,
                config.thresholds,
                ctx.flow.influx(config.vial),
                elapsed,
                &mut aggregator,
            );
            report.turbidostat =
                isolate(config.vial, "turbidostat", result, &mut report.failures)?;
        }

        let selection = SelectionController::new(&self.config);
        for (report, setup) in reports.iter_mut().zip(&setups) {
            let Some(config) = setup else { continue };
            let Some(sel) = &config.selection else { continue };
            report.selection = self.select(
                &selection,
                config,
                sel,
                ctx,
                &mut aggregator,
                &mut report.failures,
            )?;
        }

        let command = aggregator.dispatch(actuator)?;
        let report = TickReport {
            tick_id: Uuid::now_v7(),
            generated_at: Utc::now(),
            elapsed_hours: elapsed,
            vials: reports,
            command: command.map(|c| c.encode()),
        };
        info!(
            tick_id = %report.tick_id,
            dispatched = report.dispatched(),
            failures = report.failure_count(),
            "Tick complete"
        );
        Ok(report)
    }

    fn select(
        &self,
        controller: &SelectionController<'_>,
        config: &VialConfig,
        selection: &SelectionConfig,
        ctx: &TickContext<'_>,
        aggregator: &mut CommandAggregator,
        failures: &mut Vec<VialFailure>,
    ) -> Result<SelectionOutcome> {
        let vial = config.vial;
        let logic_stage = SelectionStage::Logic.as_str();
        let fluidics_stage = SelectionStage::Fluidics.as_str();

        let prepared = controller.prepare(&self.store, vial, selection);
        let sel_ctx = match isolate(vial, logic_stage, prepared, failures)? {
            None => return Ok(SelectionOutcome::Skipped),
            Some(Readiness::NotStarted { curves, od_samples }) => {
                return Ok(SelectionOutcome::NotStarted { curves, od_samples })
            }
            Some(Readiness::Active(sel_ctx)) => sel_ctx,
        };

        let logic = controller.run_logic(
            &self.store,
            vial,
            config.thresholds,
            selection,
            &sel_ctx,
            ctx.flow.influx(vial),
            ctx.elapsed_hours,
            aggregator,
        );
        let Some(logic) = isolate(vial, logic_stage, logic, failures)? else {
            return Ok(SelectionOutcome::Skipped);
        };

        let fluidics = controller.run_fluidics(
            &self.store,
            vial,
            config.thresholds,
            selection,
            &sel_ctx,
            logic,
            ctx.flow.chemical(vial),
            ctx.elapsed_hours,
            aggregator,
        );
        match isolate(vial, fluidics_stage, fluidics, failures)? {
            Some(report) => Ok(SelectionOutcome::Active(Box::new(report))),
            None => Ok(SelectionOutcome::Skipped),
        }
    }

    /// Build the validated configuration of a vial for this tick
    fn setup_vial(&self, vial: VialId, elapsed: f64) -> Result<VialSetup> {
        if vial >= NUM_VIALS {
            return Ok(VialSetup::Rejected(ConfigError::UnknownVial(vial)));
        }
        let thresholds = self.config.thresholds_for(vial, elapsed);
        let (selection, selection_error) = match self.load_selection(vial)? {
            Ok(selection) => (selection, None),
            Err(e) => (None, Some(e)),
        };
        Ok(match VialConfig::new(vial, thresholds, selection) {
            Ok(config) => VialSetup::Ready {
                config,
                selection_error,
            },
            Err(e) => VialSetup::Rejected(e),
        })
    }

    fn load_selection(
        &self,
        vial: VialId,
    ) -> Result<std::result::Result<Option<SelectionConfig>, ConfigError>> {
        let params = match self.store.selection_params(vial) {
            Ok(params) => params,
            Err(e @ StoreError::Malformed { .. }) => {
                return Ok(Err(ConfigError::Load(e.to_string())))
            }
            Err(e) => return Err(e.into()),
        };
        let steps = match self.store.selection_steps(vial) {
            Ok(steps) => steps,
            Err(e @ StoreError::Malformed { .. }) => {
                return Ok(Err(ConfigError::Load(e.to_string())))
            }
            Err(e) => return Err(e.into()),
        };

        Ok(match (params, steps) {
            (None, None) => Ok(None),
            (Some(params), Some(steps)) => SelectionConfig::new(vial, params, steps).map(Some),
            (Some(_), None) => Err(ConfigError::InvalidSetting {
                name: "selection_steps",
                reason: format!("vial {vial} has selection parameters but no steps"),
            }),
            (None, Some(_)) => Err(ConfigError::InvalidSetting {
                name: "selection_params",
                reason: format!("vial {vial} has selection steps but no parameters"),
            }),
        })
    }
}

/// Confine a non-fatal failure to one vial stage
fn isolate<T>(
    vial: VialId,
    stage: &'static str,
    result: Result<T>,
    failures: &mut Vec<VialFailure>,
) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.is_fatal() => Err(e),
        Err(e) => {
            let failure = VialstatError::VialProcessing {
                vial,
                stage,
                reason: e.to_string(),
            };
            error!(vial, stage, error = %e, "Vial evaluation failed, skipping for this tick");
            failures.push(VialFailure {
                stage,
                error: failure.to_string(),
            });
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fluidics::MockActuator;
    use vialstat_common::{PumpBank, PumpEvent, SelectionParams};
    use vialstat_ledger::InMemoryVialStore;

    fn params() -> SelectionParams {
        SelectionParams {
            stock_concentration: 100.0,
            curves_to_start: 2,
            min_curves_per_step: 3,
            min_step_time: 0.0,
            growth_stalled_time: 8.0,
            min_growthrate: 0.1,
            max_growthrate: 0.3,
            rescue_dilutions: 2,
            rescue_threshold: 0.5,
            selection_units: "ug/mL".to_string(),
        }
    }

    fn frame(elapsed: f64, readings: &[(VialId, Option<f64>)]) -> SensorFrame {
        SensorFrame {
            elapsed_hours: elapsed,
            od: readings.iter().copied().collect(),
        }
    }

    #[test]
    fn test_ingest_drops_missing_readings() {
        let controller =
            Controller::new(ControllerConfig::default(), InMemoryVialStore::new()).unwrap();
        let written = controller
            .ingest_frame(&frame(
                1.0,
                &[(0, Some(0.4)), (1, None), (2, Some(f64::NAN)), (40, Some(0.3))],
            ))
            .unwrap();
        assert_eq!(written, 1);
        assert_eq!(controller.store().count::<OdReading>(0).unwrap(), 1);
        assert_eq!(controller.store().count::<OdReading>(2).unwrap(), 0);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = ControllerConfig {
            dilution_window: 0,
            ..Default::default()
        };
        assert!(Controller::new(config, InMemoryVialStore::new()).is_err());
    }

    #[test]
    fn test_idle_tick_does_not_dispatch() {
        let controller =
            Controller::new(ControllerConfig::default(), InMemoryVialStore::new()).unwrap();
        controller
            .ingest_frame(&frame(1.0, &[(0, Some(0.4)), (1, Some(0.5))]))
            .unwrap();

        let mut actuator = MockActuator::new();
        actuator.expect_dispatch().times(0);
        let flow = FlowCalibration::uniform(1.0);
        let ctx = TickContext {
            flow: &flow,
            elapsed_hours: 1.0,
            vials: &[0, 1],
        };
        let report = controller.tick(&ctx, &mut actuator).unwrap();
        assert!(!report.dispatched());
        assert_eq!(report.vials.len(), 2);
        assert_eq!(report.failure_count(), 0);
    }

    #[test]
    fn test_partial_selection_config_keeps_turbidostat() {
        let store = InMemoryVialStore::new();
        store.set_selection(0, params(), vec![]);
        let controller = Controller::new(ControllerConfig::default(), store).unwrap();
        controller
            .ingest_frame(&frame(1.0, &[(0, Some(2.2))]))
            .unwrap();

        let mut actuator = MockActuator::new();
        actuator
            .expect_dispatch()
            .withf(|cmd| cmd.get(PumpBank::Influx, 0).is_some())
            .times(1)
            .returning(|_| Ok(()));
        let flow = FlowCalibration::uniform(1.0);
        let ctx = TickContext {
            flow: &flow,
            elapsed_hours: 1.0,
            vials: &[0],
        };
        let report = controller.tick(&ctx, &mut actuator).unwrap();
        let vial = report.vial(0).unwrap();
        assert_eq!(vial.selection, SelectionOutcome::Disabled);
        assert_eq!(vial.failures.len(), 1);
        assert_eq!(vial.failures[0].stage, "configuration");
        assert_eq!(controller.store().count::<PumpEvent>(0).unwrap(), 1);
    }

    #[test]
    fn test_unknown_vial_rejected_others_run() {
        let controller =
            Controller::new(ControllerConfig::default(), InMemoryVialStore::new()).unwrap();
        controller
            .ingest_frame(&frame(1.0, &[(0, Some(2.2))]))
            .unwrap();

        let mut actuator = MockActuator::new();
        actuator
            .expect_dispatch()
            .withf(|cmd| cmd.get(PumpBank::Influx, 0).is_some())
            .times(1)
            .returning(|_| Ok(()));
        let flow = FlowCalibration::uniform(1.0);
        let ctx = TickContext {
            flow: &flow,
            elapsed_hours: 1.0,
            vials: &[NUM_VIALS, 0],
        };
        let report = controller.tick(&ctx, &mut actuator).unwrap();

        let unknown = report.vial(NUM_VIALS).unwrap();
        assert!(unknown.thresholds.is_none());
        assert!(unknown.turbidostat.is_none());
        assert_eq!(unknown.failures[0].stage, "configuration");
        assert!(report.vial(0).unwrap().failures.is_empty());
        assert_eq!(controller.store().count::<PumpEvent>(0).unwrap(), 1);
    }

    #[test]
    fn test_actuator_failure_is_fatal() {
        let controller =
            Controller::new(ControllerConfig::default(), InMemoryVialStore::new()).unwrap();
        controller
            .ingest_frame(&frame(1.0, &[(0, Some(2.2))]))
            .unwrap();

        let mut actuator = MockActuator::new();
        actuator
            .expect_dispatch()
            .times(1)
            .returning(|_| Err(VialstatError::Actuator("port closed".to_string())));
        let flow = FlowCalibration::uniform(1.0);
        let ctx = TickContext {
            flow: &flow,
            elapsed_hours: 1.0,
            vials: &[0],
        };
        let err = controller.tick(&ctx, &mut actuator).unwrap_err();
        assert!(err.is_fatal());
    }
}
