//! Vialstat controller binary
//!
//! Runs one control tick: reads a sensor frame as JSON from stdin, appends it
//! to the experiment logs, evaluates every vial and writes the fluidic command
//! (if any) as a JSON line on stdout.

use std::io::{self, Read};
use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use vialstat_common::FlowCalibration;
use vialstat_control::{
    Controller, JsonLineActuator, SensorFrame, TickContext, VialstatConfig, CONTROLLER_VERSION,
};
use vialstat_ledger::{csv_store::vials_with_data, CsvVialStore};

fn main() -> Result<()> {
    // Logs go to stderr; stdout carries the fluidic command
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    info!("Starting vialstat controller v{}", CONTROLLER_VERSION);

    // Load configuration
    let config_path = std::env::var_os("VIALSTAT_CONFIG").map(PathBuf::from);
    let config = VialstatConfig::load(config_path.as_deref())?;
    info!("Loaded configuration: {:?}", config);

    let calibration = std::fs::read_to_string(&config.calibration_path).with_context(|| {
        format!(
            "reading flow calibration {}",
            config.calibration_path.display()
        )
    })?;
    let flow: FlowCalibration =
        serde_json::from_str(&calibration).context("parsing flow calibration")?;

    let mut input = String::new();
    io::stdin()
        .read_to_string(&mut input)
        .context("reading sensor frame from stdin")?;
    let frame: SensorFrame = serde_json::from_str(&input).context("parsing sensor frame")?;

    let store = CsvVialStore::open(config.experiment_dir.clone())?;
    let controller = Controller::new(config.controller.clone(), store)?;
    controller.ingest_frame(&frame)?;

    let vials = match &config.vials {
        Some(vials) => vials.clone(),
        None => vials_with_data(controller.store()),
    };
    let ctx = TickContext {
        flow: &flow,
        elapsed_hours: frame.elapsed_hours,
        vials: &vials,
    };

    let mut actuator = JsonLineActuator::new(io::stdout().lock());
    let report = controller.tick(&ctx, &mut actuator)?;

    info!(
        "Tick {} finished: {} vials, dispatched={}, failures={}",
        report.tick_id,
        report.vials.len(),
        report.dispatched(),
        report.failure_count()
    );
    Ok(())
}
