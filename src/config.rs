use crate::error::{IsoError, IsoResult};
use crate::specs::{DEEP_96, STANDARD_384, STANDARD_96};
use serde::{Deserialize, Serialize};

pub const CONFIG_ENV_VAR: &str = "ISOPLAN_CONFIG";

/// How MANUAL layouts treat pools occurring in several wells.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManualDuplicatePoolPolicy {
    /// Every pool may occur once.
    #[default]
    Strict,
    /// Repeated pools are accepted as long as none of their wells is at
    /// stock concentration.
    AllowBelowStock,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerConfig {
    pub floating_stock_concentration_nm: f64,
    /// Volume that must stay in a stock tube, in µL.
    pub stock_dead_volume_ul: f64,
    /// Extra dead volume per additional outgoing transfer for robots with
    /// dynamic dead volume, in µL.
    pub dynamic_dead_volume_step_ul: f64,
    pub reservoir_preference: Vec<String>,
    pub aliquot_reservoir_96: String,
    pub aliquot_reservoir_384: String,
    pub manual_duplicate_pool_policy: ManualDuplicatePoolPolicy,
    /// Assign the default OptiMem dilution factor to mock wells as well.
    pub mock_optimem_dilution: bool,
    pub reagent_mm_dilution_factor: f64,
    pub cell_dilution_factor: f64,
    pub default_optimem_dilution_factor: f64,
    pub default_iso_volume_ul: f64,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            floating_stock_concentration_nm: 50_000.0,
            stock_dead_volume_ul: 5.0,
            dynamic_dead_volume_step_ul: 1.0,
            reservoir_preference: vec![
                STANDARD_96.to_string(),
                STANDARD_384.to_string(),
                DEEP_96.to_string(),
            ],
            aliquot_reservoir_96: STANDARD_96.to_string(),
            aliquot_reservoir_384: STANDARD_384.to_string(),
            manual_duplicate_pool_policy: ManualDuplicatePoolPolicy::Strict,
            mock_optimem_dilution: false,
            reagent_mm_dilution_factor: 2.0,
            cell_dilution_factor: 7.0,
            default_optimem_dilution_factor: 3.0,
            default_iso_volume_ul: 10.0,
        }
    }
}

fn normalized_non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

impl PlannerConfig {
    pub fn load_from_path(path: &str) -> IsoResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            IsoError::resource(format!("Could not read planner config '{path}': {e}"))
        })?;
        let config: Self = serde_json::from_str(&text)
            .map_err(|e| IsoError::parse(format!("Could not parse planner config '{path}': {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_to_path(&self, path: &str) -> IsoResult<()> {
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path, text)
            .map_err(|e| IsoError::resource(format!("Could not write planner config '{path}': {e}")))
    }

    /// The explicitly configured file, else the file named by
    /// `ISOPLAN_CONFIG`, else the defaults.
    pub fn resolve(configured: Option<&str>) -> IsoResult<Self> {
        let path = configured.and_then(normalized_non_empty).or_else(|| {
            std::env::var(CONFIG_ENV_VAR)
                .ok()
                .and_then(|v| normalized_non_empty(&v))
        });
        match path {
            Some(path) => Self::load_from_path(&path),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> IsoResult<()> {
        let positive = [
            ("floating_stock_concentration_nm", self.floating_stock_concentration_nm),
            ("reagent_mm_dilution_factor", self.reagent_mm_dilution_factor),
            ("cell_dilution_factor", self.cell_dilution_factor),
            ("default_optimem_dilution_factor", self.default_optimem_dilution_factor),
            ("default_iso_volume_ul", self.default_iso_volume_ul),
        ];
        for (name, value) in positive {
            if !(value.is_finite() && value > 0.0) {
                return Err(IsoError::parse(format!("{name} must be a positive number, got {value}")));
            }
        }
        if self.stock_dead_volume_ul < 0.0 || self.dynamic_dead_volume_step_ul < 0.0 {
            return Err(IsoError::parse("Dead volumes must not be negative"));
        }
        if self.reservoir_preference.is_empty() {
            return Err(IsoError::parse("At least one preparation reservoir spec is required"));
        }
        Ok(())
    }

    /// Factor between ISO and final concentration.
    pub fn iso_to_final_factor(&self, optimem_dilution_factor: f64) -> f64 {
        optimem_dilution_factor * self.reagent_mm_dilution_factor * self.cell_dilution_factor
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = PlannerConfig::default();
        assert_eq!(config.floating_stock_concentration_nm, 50_000.0);
        assert_eq!(config.stock_dead_volume_ul, 5.0);
        assert_eq!(config.manual_duplicate_pool_policy, ManualDuplicatePoolPolicy::Strict);
        assert!(!config.mock_optimem_dilution);
        assert_eq!(config.iso_to_final_factor(3.0), 42.0);
        config.validate().unwrap();
    }

    #[test]
    fn test_save_and_load_partial_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("planner.json");
        let path = path.to_str().unwrap();
        std::fs::write(
            path,
            r#"{"floating_stock_concentration_nm": 1500, "manual_duplicate_pool_policy": "allow_below_stock"}"#,
        )
        .unwrap();
        let config = PlannerConfig::load_from_path(path).unwrap();
        assert_eq!(config.floating_stock_concentration_nm, 1500.0);
        assert_eq!(
            config.manual_duplicate_pool_policy,
            ManualDuplicatePoolPolicy::AllowBelowStock
        );
        assert_eq!(config.stock_dead_volume_ul, 5.0);

        config.save_to_path(path).unwrap();
        assert_eq!(PlannerConfig::resolve(Some(path)).unwrap(), config);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, r#"{"cell_dilution_factor": 0}"#).unwrap();
        let err = PlannerConfig::load_from_path(path.to_str().unwrap()).unwrap_err();
        assert!(err.to_string().contains("cell_dilution_factor"));
        assert!(PlannerConfig::load_from_path("/nonexistent/planner.json").is_err());
    }

    #[test]
    fn test_blank_configured_path_falls_back() {
        // only meaningful when the variable is not set in the test environment
        if std::env::var(CONFIG_ENV_VAR).is_err() {
            assert_eq!(PlannerConfig::resolve(Some("  ")).unwrap(), PlannerConfig::default());
        }
    }
}
