//! Growth-rate tracking
//!
//! The turbidostat closes a growth curve each time a vial crosses its upper
//! threshold. A tracker turns the curve into one growth-rate record.

use tracing::{debug, info};

use vialstat_common::{stats, GrowthRateRecord, OdReading, Result, VialId};
use vialstat_ledger::VialStore;

/// Records one growth-rate sample per completed growth curve
pub trait GrowthRateTracker {
    /// Close the curve that ran from `curve_start` to `curve_end` (hours).
    ///
    /// Returns the appended record, or `None` if the curve could not be fit.
    fn close_curve<S: VialStore>(
        &self,
        store: &S,
        vial: VialId,
        curve_start: f64,
        curve_end: f64,
    ) -> Result<Option<GrowthRateRecord>>;
}

/// Exponential fit: slope of ln(OD) against time over the curve
#[derive(Debug, Clone)]
pub struct LogLinearGrowthTracker {
    /// Fewest positive readings needed for a fit
    pub min_points: usize,
}

impl Default for LogLinearGrowthTracker {
    fn default() -> Self {
        Self { min_points: 3 }
    }
}

impl GrowthRateTracker for LogLinearGrowthTracker {
    fn close_curve<S: VialStore>(
        &self,
        store: &S,
        vial: VialId,
        curve_start: f64,
        curve_end: f64,
    ) -> Result<Option<GrowthRateRecord>> {
        let readings: Vec<OdReading> = store
            .read_all::<OdReading>(vial)?
            .into_iter()
            .filter(|r| r.time >= curve_start && r.time <= curve_end && r.od > 0.0)
            .collect();

        if readings.len() < self.min_points {
            debug!(
                vial,
                points = readings.len(),
                "Too few OD readings to fit growth curve"
            );
            return Ok(None);
        }

        let times: Vec<f64> = readings.iter().map(|r| r.time).collect();
        let log_od: Vec<f64> = readings.iter().map(|r| r.od.ln()).collect();

        let Some(rate) = stats::slope(&times, &log_od) else {
            debug!(vial, "Degenerate growth curve, no rate recorded");
            return Ok(None);
        };

        let record = GrowthRateRecord::new(curve_end, rate);
        store.append(vial, &record)?;
        info!(vial, rate, curve_start, curve_end, "Growth rate recorded");
        Ok(Some(record))
    }
}
