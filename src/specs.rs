use crate::rack::{RackShape, SHAPE_384, SHAPE_96};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const STANDARD_96: &str = "STANDARD_96";
pub const STANDARD_384: &str = "STANDARD_384";
pub const DEEP_96: &str = "DEEP_96";

pub const PIPETTING_MANUAL: &str = "manual";
pub const PIPETTING_BIOMEK: &str = "BioMek";
pub const PIPETTING_CYBIO: &str = "CyBio";

/// Plate (reservoir) properties. Volumes in µL.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReservoirSpecs {
    pub name: String,
    pub shape: RackShape,
    pub max_volume: f64,
    pub min_dead_volume: f64,
    pub max_dead_volume: f64,
}

impl ReservoirSpecs {
    pub fn new(
        name: &str,
        shape: RackShape,
        max_volume: f64,
        min_dead_volume: f64,
        max_dead_volume: f64,
    ) -> Self {
        Self {
            name: name.to_string(),
            shape,
            max_volume,
            min_dead_volume,
            max_dead_volume,
        }
    }
}

/// Robot properties. Volumes in µL.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PipettingSpecs {
    pub name: String,
    pub min_transfer_volume: f64,
    pub max_transfer_volume: f64,
    pub max_dilution_factor: f64,
    pub has_dynamic_dead_volume: bool,
    pub is_sector_bound: bool,
}

impl PipettingSpecs {
    pub fn new(
        name: &str,
        min_transfer_volume: f64,
        max_transfer_volume: f64,
        max_dilution_factor: f64,
        has_dynamic_dead_volume: bool,
        is_sector_bound: bool,
    ) -> Self {
        Self {
            name: name.to_string(),
            min_transfer_volume,
            max_transfer_volume,
            max_dilution_factor,
            has_dynamic_dead_volume,
            is_sector_bound,
        }
    }
}

#[derive(Clone, Debug)]
pub struct SpecsCatalog {
    reservoirs: HashMap<String, ReservoirSpecs>,
    pipetting: HashMap<String, PipettingSpecs>,
}

impl Default for SpecsCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl SpecsCatalog {
    pub fn new() -> Self {
        let reservoirs = [
            ReservoirSpecs::new(STANDARD_96, SHAPE_96, 250.0, 10.0, 20.0),
            ReservoirSpecs::new(STANDARD_384, SHAPE_384, 100.0, 8.0, 12.0),
            ReservoirSpecs::new(DEEP_96, SHAPE_96, 1500.0, 30.0, 40.0),
        ];
        let pipetting = [
            PipettingSpecs::new(PIPETTING_MANUAL, 1.0, 250.0, 10.0, false, false),
            PipettingSpecs::new(PIPETTING_BIOMEK, 1.0, 250.0, 20.0, true, false),
            PipettingSpecs::new(PIPETTING_CYBIO, 1.0, 50.0, 10.0, false, true),
        ];
        Self {
            reservoirs: reservoirs
                .into_iter()
                .map(|r| (r.name.clone(), r))
                .collect(),
            pipetting: pipetting
                .into_iter()
                .map(|p| (p.name.clone(), p))
                .collect(),
        }
    }

    pub fn reservoir(&self, name: &str) -> Option<&ReservoirSpecs> {
        self.reservoirs.get(name)
    }

    pub fn pipetting(&self, name: &str) -> Option<&PipettingSpecs> {
        self.pipetting.get(name)
    }

    /// Registers or replaces a reservoir spec (e.g. from configuration).
    pub fn set_reservoir(&mut self, specs: ReservoirSpecs) {
        self.reservoirs.insert(specs.name.clone(), specs);
    }

    pub fn set_pipetting(&mut self, specs: PipettingSpecs) {
        self.pipetting.insert(specs.name.clone(), specs);
    }

    pub fn reservoir_names_sorted(&self) -> Vec<String> {
        let mut names: Vec<String> = self.reservoirs.keys().cloned().collect();
        names.sort();
        names
    }
}
