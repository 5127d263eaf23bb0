//! Controller configuration
//!
//! Factory defaults match the standard vial hardware; any field can be
//! overridden from a config file or `VIALSTAT__`-prefixed environment.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use vialstat_common::{ConfigError, OdThresholds, VialId, NUM_VIALS};

/// Fluidics and control settings shared by every vial
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Culture volume (mL), set by the efflux straw length
    pub volume_ml: f64,
    /// Extra efflux run time beyond the influx time (seconds)
    pub time_out_secs: f64,
    /// Minimum spacing between dilutions of one vial (minutes)
    pub pump_wait_minutes: f64,
    /// Smallest chemical bolus worth pumping (mL)
    pub bolus_slow_ml: f64,
    /// Largest chemical bolus per tick (mL)
    pub max_bolus_ml: f64,
    /// Longest dilution per tick (seconds)
    pub max_dilution_secs: f64,
    /// OD samples on each side of a dilution used to measure its effect
    pub dilution_window: usize,
    /// OD samples summarized by the turbidostat each tick
    pub od_values_to_average: usize,
    /// Stop diluting after this many growth curves (`None` never stops)
    pub stop_after_n_curves: Option<u32>,
    /// Hours of unperturbed growth before turbidostat control starts
    pub growth_curve_time_hours: f64,
    /// Threshold applied to every vial before `growth_curve_time_hours`
    pub pre_start_threshold: f64,
    /// Band used when no per-vial override is given
    pub default_thresholds: OdThresholds,
    /// Per-vial bands, one entry per device slot
    pub vial_thresholds: Option<Vec<OdThresholds>>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            volume_ml: crate::DEFAULT_VOLUME_ML,
            time_out_secs: 5.0,
            pump_wait_minutes: 20.0,
            bolus_slow_ml: 0.1,
            max_bolus_ml: 5.0,
            max_dilution_secs: 20.0,
            dilution_window: 3,
            od_values_to_average: 6,
            stop_after_n_curves: None,
            growth_curve_time_hours: 0.0,
            pre_start_threshold: 999.0,
            default_thresholds: OdThresholds::new(1.6, 2.0),
            vial_thresholds: None,
        }
    }
}

impl ControllerConfig {
    /// Hysteresis band of `vial` at `elapsed_hours`
    ///
    /// A per-vial override applies from the start of the experiment; the
    /// pre-start threshold only replaces the default band.
    pub fn thresholds_for(&self, vial: VialId, elapsed_hours: f64) -> OdThresholds {
        if let Some(band) = self
            .vial_thresholds
            .as_ref()
            .and_then(|bands| bands.get(vial).copied())
        {
            return band;
        }
        if elapsed_hours < self.growth_curve_time_hours {
            return OdThresholds::new(self.pre_start_threshold, self.pre_start_threshold);
        }
        self.default_thresholds
    }

    /// Reject settings the control loop cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("volume_ml", self.volume_ml),
            ("max_dilution_secs", self.max_dilution_secs),
            ("max_bolus_ml", self.max_bolus_ml),
        ];
        for (name, value) in positive {
            if !(value > 0.0) {
                return Err(ConfigError::InvalidSetting {
                    name,
                    reason: format!("must be positive, got {value}"),
                });
            }
        }

        let non_negative = [
            ("time_out_secs", self.time_out_secs),
            ("pump_wait_minutes", self.pump_wait_minutes),
            ("bolus_slow_ml", self.bolus_slow_ml),
        ];
        for (name, value) in non_negative {
            if !(value >= 0.0) {
                return Err(ConfigError::InvalidSetting {
                    name,
                    reason: format!("must not be negative, got {value}"),
                });
            }
        }

        if self.bolus_slow_ml > self.max_bolus_ml {
            return Err(ConfigError::InvalidSetting {
                name: "bolus_slow_ml",
                reason: "exceeds max_bolus_ml".to_string(),
            });
        }
        if self.dilution_window == 0 {
            return Err(ConfigError::InvalidSetting {
                name: "dilution_window",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.od_values_to_average == 0 {
            return Err(ConfigError::InvalidSetting {
                name: "od_values_to_average",
                reason: "must be at least 1".to_string(),
            });
        }

        if let Some(bands) = &self.vial_thresholds {
            if bands.len() != NUM_VIALS {
                return Err(ConfigError::OverrideLength {
                    expected: NUM_VIALS,
                    actual: bands.len(),
                });
            }
        }

        Ok(())
    }
}

/// Settings of the `vialstat` binary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VialstatConfig {
    /// Experiment directory holding the vial logs
    pub experiment_dir: PathBuf,
    /// JSON file with the 48 pump flow rates (mL/s)
    pub calibration_path: PathBuf,
    /// Vials to control; defaults to every vial with an OD log
    pub vials: Option<Vec<VialId>>,
    /// Control settings
    pub controller: ControllerConfig,
}

impl Default for VialstatConfig {
    fn default() -> Self {
        Self {
            experiment_dir: PathBuf::from("data"),
            calibration_path: PathBuf::from("calibration/flow_rate.json"),
            vials: None,
            controller: ControllerConfig::default(),
        }
    }
}

impl VialstatConfig {
    /// Load configuration from `.env`, an optional file and the environment
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        // Try to load .env file
        let _ = dotenvy::dotenv();

        let file = match path {
            Some(path) => config::File::from(path).required(true),
            None => config::File::with_name("vialstat").required(false),
        };

        let cfg: Self = config::Config::builder()
            .add_source(file)
            .add_source(
                config::Environment::with_prefix("VIALSTAT")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| ConfigError::Load(e.to_string()))?;

        cfg.controller.validate()?;
        if let Some(vials) = &cfg.vials {
            if let Some(&bad) = vials.iter().find(|&&v| v >= NUM_VIALS) {
                return Err(ConfigError::InvalidSetting {
                    name: "vials",
                    reason: format!("vial {bad} outside the device array"),
                });
            }
        }
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = ControllerConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.volume_ml, 25.0);
        assert_eq!(cfg.pump_wait_minutes, 20.0);
    }

    #[test]
    fn test_thresholds_before_growth_curve_time() {
        let cfg = ControllerConfig {
            growth_curve_time_hours: 2.0,
            ..Default::default()
        };
        assert_eq!(cfg.thresholds_for(0, 1.0), OdThresholds::new(999.0, 999.0));
        assert_eq!(cfg.thresholds_for(0, 2.0), OdThresholds::new(1.6, 2.0));
    }

    #[test]
    fn test_threshold_override() {
        let mut bands = OdThresholds::uniform(1.6, 2.0);
        bands[3] = OdThresholds::new(0.2, 0.4);
        let cfg = ControllerConfig {
            vial_thresholds: Some(bands),
            ..Default::default()
        };
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.thresholds_for(3, 5.0), OdThresholds::new(0.2, 0.4));
        assert_eq!(cfg.thresholds_for(4, 5.0), OdThresholds::new(1.6, 2.0));
    }

    #[test]
    fn test_override_applies_during_growth_curve_delay() {
        let mut bands = OdThresholds::uniform(1.6, 2.0);
        bands[3] = OdThresholds::new(0.2, 0.4);
        let cfg = ControllerConfig {
            growth_curve_time_hours: 2.0,
            vial_thresholds: Some(bands),
            ..Default::default()
        };
        assert_eq!(cfg.thresholds_for(3, 1.0), OdThresholds::new(0.2, 0.4));
        assert_eq!(cfg.thresholds_for(4, 1.0), OdThresholds::new(1.6, 2.0));
    }

    #[test]
    fn test_override_length_checked() {
        let cfg = ControllerConfig {
            vial_thresholds: Some(OdThresholds::uniform(1.6, 2.0)[..4].to_vec()),
            ..Default::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::OverrideLength { actual: 4, .. })
        ));
    }

    #[test]
    fn test_invalid_window() {
        let cfg = ControllerConfig {
            dilution_window: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vialstat.json");
        std::fs::write(
            &path,
            r#"{"experiment_dir": "/tmp/expt", "controller": {"pump_wait_minutes": 30.0}}"#,
        )
        .unwrap();

        let cfg = VialstatConfig::load(Some(&path)).unwrap();
        assert_eq!(cfg.experiment_dir, PathBuf::from("/tmp/expt"));
        assert_eq!(cfg.controller.pump_wait_minutes, 30.0);
        assert_eq!(cfg.controller.volume_ml, 25.0);
    }
}
