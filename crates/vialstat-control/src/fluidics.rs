//! Command aggregation and actuator dispatch
//!
//! Every policy that wants a pump on writes into one [`CommandAggregator`] per
//! tick. Slot writes are last-write-wins: a rescue dilution evaluated after a
//! turbidostat dilution of the same vial replaces its influx and efflux
//! durations outright. The aggregator records which policy owns each slot.

use serde::Serialize;
use std::collections::HashMap;
use std::io::Write;
use tracing::{debug, info, warn};

use vialstat_common::{FluidicCommand, PumpBank, Result, VialId, VialstatError};

/// Policy that requested a pump
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PumpSource {
    Turbidostat,
    Rescue,
    Bolus,
}

/// Delivers a fluidic command to the device
#[cfg_attr(test, mockall::automock)]
pub trait Actuator {
    fn dispatch(&mut self, command: &FluidicCommand) -> Result<()>;
}

/// A slot one policy requested and a later policy replaced
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SlotOverride {
    pub slot: usize,
    pub replaced: PumpSource,
    pub by: PumpSource,
    pub replaced_secs: f64,
}

/// Collects pump requests into the tick's single command
#[derive(Debug, Default)]
pub struct CommandAggregator {
    command: FluidicCommand,
    owners: HashMap<usize, PumpSource>,
    overrides: Vec<SlotOverride>,
}

impl CommandAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request an influx/efflux pair for `vial`, replacing any earlier pair
    pub fn request_dilution(
        &mut self,
        source: PumpSource,
        vial: VialId,
        influx_secs: f64,
        efflux_secs: f64,
    ) {
        self.write(source, PumpBank::Influx, vial, influx_secs);
        self.write(source, PumpBank::Efflux, vial, efflux_secs);
    }

    /// Request the selection-chemical pump for `vial`
    pub fn request_chemical(&mut self, vial: VialId, secs: f64) {
        self.write(PumpSource::Bolus, PumpBank::Chemical, vial, secs);
    }

    fn write(&mut self, source: PumpSource, bank: PumpBank, vial: VialId, secs: f64) {
        if let Some(previous) = self.command.set(bank, vial, secs) {
            match self.owners.get(&bank.slot(vial)) {
                Some(&owner) if owner != source => {
                    warn!(
                        vial,
                        ?bank,
                        ?source,
                        replaced = previous,
                        replaced_owner = ?owner,
                        secs,
                        "Pump slot overwritten by another policy"
                    );
                    self.overrides.push(SlotOverride {
                        slot: bank.slot(vial),
                        replaced: owner,
                        by: source,
                        replaced_secs: previous,
                    });
                }
                owner => debug!(
                    vial,
                    ?bank,
                    ?source,
                    replaced = previous,
                    replaced_owner = ?owner,
                    secs,
                    "Pump slot overwritten"
                ),
            }
        }
        self.owners.insert(bank.slot(vial), source);
    }

    /// Policy owning a slot, if any requested it this tick
    pub fn owner(&self, bank: PumpBank, vial: VialId) -> Option<PumpSource> {
        self.owners.get(&bank.slot(vial)).copied()
    }

    /// Slots replaced by a different policy this tick
    pub fn overrides(&self) -> &[SlotOverride] {
        &self.overrides
    }

    pub fn command(&self) -> &FluidicCommand {
        &self.command
    }

    /// Send the command if any pump is switched on
    pub fn dispatch<A: Actuator>(self, actuator: &mut A) -> Result<Option<FluidicCommand>> {
        if self.command.is_noop() {
            debug!("No pumps requested this tick");
            return Ok(None);
        }

        actuator.dispatch(&self.command)?;
        info!(
            active = self.command.active_slots(),
            message = %self.command,
            "Fluidic command dispatched"
        );
        Ok(Some(self.command))
    }
}

/// Writes each command as one JSON line, `{"fluid_command": [...]}`
pub struct JsonLineActuator<W: Write> {
    out: W,
}

impl<W: Write> JsonLineActuator<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

#[derive(Serialize)]
struct WireCommand {
    fluid_command: Vec<String>,
}

impl<W: Write> Actuator for JsonLineActuator<W> {
    fn dispatch(&mut self, command: &FluidicCommand) -> Result<()> {
        let wire = WireCommand {
            fluid_command: command.encode(),
        };
        let line = serde_json::to_string(&wire)?;
        writeln!(self.out, "{line}").map_err(|e| VialstatError::Actuator(e.to_string()))?;
        self.out
            .flush()
            .map_err(|e| VialstatError::Actuator(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_noop_not_dispatched() {
        let mut actuator = MockActuator::new();
        actuator.expect_dispatch().times(0);

        let aggregator = CommandAggregator::new();
        assert_eq!(aggregator.dispatch(&mut actuator).unwrap(), None);
    }

    #[test]
    fn test_dispatch_once_when_active() {
        let mut actuator = MockActuator::new();
        actuator
            .expect_dispatch()
            .withf(|cmd| cmd.get(PumpBank::Chemical, 4) == Some(1.5))
            .times(1)
            .returning(|_| Ok(()));

        let mut aggregator = CommandAggregator::new();
        aggregator.request_chemical(4, 1.5);
        let sent = aggregator.dispatch(&mut actuator).unwrap().unwrap();
        assert_eq!(sent.active_slots(), 1);
    }

    #[test]
    fn test_last_write_wins() {
        let mut aggregator = CommandAggregator::new();
        aggregator.request_dilution(PumpSource::Turbidostat, 3, 4.2, 9.2);
        aggregator.request_dilution(PumpSource::Rescue, 3, 12.5, 17.5);

        let cmd = aggregator.command();
        assert_eq!(cmd.get(PumpBank::Influx, 3), Some(12.5));
        assert_eq!(cmd.get(PumpBank::Efflux, 3), Some(17.5));
        assert_eq!(
            aggregator.owner(PumpBank::Influx, 3),
            Some(PumpSource::Rescue)
        );
        assert_eq!(aggregator.overrides().len(), 2);
        assert_eq!(
            aggregator.overrides()[0],
            SlotOverride {
                slot: 3,
                replaced: PumpSource::Turbidostat,
                by: PumpSource::Rescue,
                replaced_secs: 4.2,
            }
        );
    }

    #[test]
    fn test_same_policy_rewrite_is_not_an_override() {
        let mut aggregator = CommandAggregator::new();
        aggregator.request_chemical(5, 1.0);
        aggregator.request_chemical(5, 2.0);

        assert_eq!(aggregator.command().get(PumpBank::Chemical, 5), Some(2.0));
        assert!(aggregator.overrides().is_empty());
    }

    #[test]
    fn test_actuator_failure_propagates() {
        let mut actuator = MockActuator::new();
        actuator
            .expect_dispatch()
            .returning(|_| Err(VialstatError::Actuator("link down".to_string())));

        let mut aggregator = CommandAggregator::new();
        aggregator.request_dilution(PumpSource::Turbidostat, 0, 1.0, 6.0);
        let err = aggregator.dispatch(&mut actuator).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_json_line_actuator() {
        let mut actuator = JsonLineActuator::new(Vec::new());
        let mut cmd = FluidicCommand::noop();
        cmd.set(PumpBank::Influx, 0, 2.5);
        actuator.dispatch(&cmd).unwrap();

        let out = String::from_utf8(actuator.into_inner()).unwrap();
        assert!(out.starts_with(r#"{"fluid_command":["2.5","--""#));
        assert!(out.ends_with("]}\n"));
    }
}
