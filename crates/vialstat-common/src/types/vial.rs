//! Static per-vial configuration
//!
//! Raw thresholds, labeled selection parameters and step sequences are
//! validated here once per tick, before any control logic reads them.

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::ConfigError;
use crate::VialId;

/// Hysteresis band of a turbidostat vial (OD units)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OdThresholds {
    /// OD the vial is diluted down to
    pub lower: f64,
    /// OD that ends a growth curve
    pub upper: f64,
}

impl OdThresholds {
    pub fn new(lower: f64, upper: f64) -> Self {
        Self { lower, upper }
    }

    /// Same band for every vial
    pub fn uniform(lower: f64, upper: f64) -> Vec<Self> {
        vec![Self::new(lower, upper); crate::NUM_VIALS]
    }

    /// OD below which a new growth curve starts.
    ///
    /// One third of the band above the lower threshold, so targets do not
    /// oscillate right after a dilution.
    pub fn band_floor(&self) -> f64 {
        self.lower + (self.upper - self.lower) / 3.0
    }

    pub fn validate(&self, vial: VialId) -> Result<(), ConfigError> {
        if self.lower.is_nan() || self.upper.is_nan() || self.lower > self.upper {
            return Err(ConfigError::InvertedThresholds {
                vial,
                lower: self.lower,
                upper: self.upper,
            });
        }
        Ok(())
    }
}

/// Labeled selection-control parameters of one vial
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionParams {
    /// Concentration of the chemical stock fed by the slow pump
    pub stock_concentration: f64,
    /// Growth curves to complete before selection starts
    #[serde(deserialize_with = "count_from_number")]
    pub curves_to_start: u32,
    /// Growth curves required on a step before it may change
    #[serde(deserialize_with = "count_from_number")]
    pub min_curves_per_step: u32,
    /// Minimum hours on a step before it may change
    pub min_step_time: f64,
    /// Hours without a growth-rate sample that count as a stall
    pub growth_stalled_time: f64,
    /// Growth rate below which selection is relaxed
    pub min_growthrate: f64,
    /// Growth rate above which selection is raised
    pub max_growthrate: f64,
    /// Rescue dilutions allowed between increases (0 disables)
    #[serde(deserialize_with = "count_from_number")]
    pub rescue_dilutions: u32,
    /// Floor on the rescue dilution factor (fraction)
    pub rescue_threshold: f64,
    /// Concentration label used in log messages
    pub selection_units: String,
}

impl SelectionParams {
    pub fn validate(&self, vial: VialId) -> Result<(), ConfigError> {
        let non_negative = [
            ("stock_concentration", self.stock_concentration),
            ("min_step_time", self.min_step_time),
            ("growth_stalled_time", self.growth_stalled_time),
        ];
        for (name, value) in non_negative {
            if !(value >= 0.0) {
                return Err(ConfigError::InvalidParameter { vial, name, value });
            }
        }

        if self.min_growthrate.is_nan() || self.max_growthrate.is_nan() {
            return Err(ConfigError::InvalidParameter {
                vial,
                name: "min_growthrate",
                value: self.min_growthrate,
            });
        }

        if self.min_curves_per_step == 0 {
            return Err(ConfigError::InvalidParameter {
                vial,
                name: "min_curves_per_step",
                value: 0.0,
            });
        }

        if !(self.rescue_threshold > 0.0 && self.rescue_threshold <= 1.0) {
            return Err(ConfigError::InvalidParameter {
                vial,
                name: "rescue_threshold",
                value: self.rescue_threshold,
            });
        }

        Ok(())
    }
}

/// Counts are sometimes written as floats ("3.0") by spreadsheet exports
fn count_from_number<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    let value = f64::deserialize(deserializer)?;
    if value >= 0.0 && value.fract() == 0.0 && value <= u32::MAX as f64 {
        Ok(value as u32)
    } else {
        Err(serde::de::Error::custom(format!(
            "expected a non-negative whole number, got {value}"
        )))
    }
}

/// Strictly ascending sequence of selection targets
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SelectionLadder {
    steps: Vec<f64>,
}

impl SelectionLadder {
    pub fn new(vial: VialId, steps: Vec<f64>) -> Result<Self, ConfigError> {
        let ascending = steps.windows(2).all(|w| w[0] < w[1]);
        if steps.is_empty() || !ascending || steps.iter().any(|s| s.is_nan()) {
            return Err(ConfigError::UnorderedSteps { vial });
        }
        Ok(Self { steps })
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Target at `index`, clamped to the ladder
    pub fn step(&self, index: usize) -> f64 {
        self.steps[index.min(self.last_index())]
    }

    pub fn first(&self) -> f64 {
        self.steps[0]
    }

    pub fn last_index(&self) -> usize {
        self.steps.len() - 1
    }

    pub fn steps(&self) -> &[f64] {
        &self.steps
    }

    /// Index of the rung nearest `target` (first on ties).
    ///
    /// The current target may sit off the ladder after a clamp to zero.
    pub fn closest_index(&self, target: f64) -> usize {
        let mut best = 0;
        let mut best_distance = f64::INFINITY;
        for (i, step) in self.steps.iter().enumerate() {
            let distance = (step - target).abs();
            if distance < best_distance {
                best = i;
                best_distance = distance;
            }
        }
        best
    }
}

/// Selection parameters paired with their ladder
#[derive(Debug, Clone, PartialEq)]
pub struct SelectionConfig {
    pub params: SelectionParams,
    pub ladder: SelectionLadder,
}

impl SelectionConfig {
    pub fn new(
        vial: VialId,
        params: SelectionParams,
        steps: Vec<f64>,
    ) -> Result<Self, ConfigError> {
        params.validate(vial)?;
        let ladder = SelectionLadder::new(vial, steps)?;
        Ok(Self { params, ladder })
    }
}

/// Validated configuration of one vial for the current tick
#[derive(Debug, Clone, PartialEq)]
pub struct VialConfig {
    pub vial: VialId,
    pub thresholds: OdThresholds,
    /// `None` when the vial runs turbidostat only
    pub selection: Option<SelectionConfig>,
}

impl VialConfig {
    pub fn new(
        vial: VialId,
        thresholds: OdThresholds,
        selection: Option<SelectionConfig>,
    ) -> Result<Self, ConfigError> {
        thresholds.validate(vial)?;
        Ok(Self {
            vial,
            thresholds,
            selection,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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

    #[test]
    fn test_band_floor() {
        let t = OdThresholds::new(1.6, 2.2);
        assert!((t.band_floor() - 1.8).abs() < 1e-12);
    }

    #[test]
    fn test_inverted_thresholds_rejected() {
        assert!(OdThresholds::new(2.0, 1.6).validate(0).is_err());
        assert!(OdThresholds::new(1.6, 1.6).validate(0).is_ok());
    }

    #[test]
    fn test_ladder_must_ascend() {
        assert!(SelectionLadder::new(0, vec![1.0, 2.0, 4.0]).is_ok());
        assert!(SelectionLadder::new(0, vec![1.0, 1.0]).is_err());
        assert!(SelectionLadder::new(0, vec![]).is_err());
    }

    #[test]
    fn test_closest_index_off_ladder() {
        let ladder = SelectionLadder::new(0, vec![5.0, 10.0, 20.0]).unwrap();
        assert_eq!(ladder.closest_index(0.0), 0);
        assert_eq!(ladder.closest_index(14.0), 1);
        assert_eq!(ladder.closest_index(100.0), 2);
    }

    #[test]
    fn test_params_validation() {
        assert!(params().validate(1).is_ok());

        let mut bad = params();
        bad.rescue_threshold = 0.0;
        assert!(bad.validate(1).is_err());

        let mut bad = params();
        bad.min_curves_per_step = 0;
        assert!(bad.validate(1).is_err());
    }

    #[test]
    fn test_counts_accept_float_text() {
        let json = r#"{"stock_concentration":100,"curves_to_start":"2","min_curves_per_step":3.0,
            "min_step_time":0,"growth_stalled_time":8,"min_growthrate":0.1,"max_growthrate":0.3,
            "rescue_dilutions":2,"rescue_threshold":0.5,"selection_units":"ug/mL"}"#;
        // A quoted count is not a number in JSON and must be rejected
        assert!(serde_json::from_str::<SelectionParams>(json).is_err());

        let json = json.replace(r#""2""#, "2.0");
        let parsed: SelectionParams = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.curves_to_start, 2);
        assert_eq!(parsed.min_curves_per_step, 3);
    }
}
