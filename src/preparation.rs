use crate::error::{IsoError, IsoResult};
use crate::parameters::{DOMAIN_POOL, Parameter, Tag};
use crate::pool::{PoolAggregate, PoolReference, RawPoolValue};
use crate::rack::{RackPosition, RackShape};
use crate::rack_layout::RackLayout;
use crate::units::{get_trimmed_string, parse_positive_number};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Where a preparation well sends sample to: a position on the plate with
/// the given marker.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct TransferTarget {
    pub position: RackPosition,
    pub target_marker: String,
}

impl TransferTarget {
    pub fn new(position: RackPosition, target_marker: &str) -> Self {
        Self {
            position,
            target_marker: target_marker.to_string(),
        }
    }

    /// "A1:a#1"
    pub fn parse(text: &str) -> Option<Self> {
        let (label, marker) = text.trim().split_once(':')?;
        if marker.is_empty() {
            return None;
        }
        Some(Self::new(RackPosition::from_label(label)?, marker))
    }
}

impl fmt::Display for TransferTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.position, self.target_marker)
    }
}

/// One well of a preparation (or job preparation) plate.
#[derive(Clone, Debug, PartialEq)]
pub struct PreparationPosition {
    pub rack_position: RackPosition,
    pub pool: PoolReference,
    /// nM
    pub concentration: f64,
    /// Full volume in µL.
    pub volume: f64,
    pub transfer_targets: BTreeSet<TransferTarget>,
}

impl PreparationPosition {
    pub fn new(rack_position: RackPosition, pool: PoolReference, concentration: f64, volume: f64) -> Self {
        Self {
            rack_position,
            pool,
            concentration,
            volume,
            transfer_targets: BTreeSet::new(),
        }
    }

    pub fn transfer_targets_value(&self) -> String {
        self.transfer_targets
            .iter()
            .map(|t| t.to_string())
            .collect::<Vec<_>>()
            .join("-")
    }

    pub fn get_tag_set(&self) -> BTreeSet<Tag> {
        let mut ret = BTreeSet::new();
        if let Some(value) = self.pool.tag_value() {
            ret.insert(Tag::new(
                Parameter::MoleculeDesignPool.domain(),
                Parameter::MoleculeDesignPool.predicate(),
                value,
            ));
        }
        ret.insert(Tag::new(
            Parameter::PositionType.domain(),
            Parameter::PositionType.predicate(),
            self.pool.position_type().as_str(),
        ));
        ret.insert(Tag::new(
            Parameter::PreparationConcentration.domain(),
            Parameter::PreparationConcentration.predicate(),
            get_trimmed_string(self.concentration),
        ));
        ret.insert(Tag::new(
            Parameter::PreparationVolume.domain(),
            Parameter::PreparationVolume.predicate(),
            get_trimmed_string(self.volume),
        ));
        if !self.transfer_targets.is_empty() {
            ret.insert(Tag::new(
                Parameter::TransferTargets.domain(),
                Parameter::TransferTargets.predicate(),
                self.transfer_targets_value(),
            ));
        }
        ret
    }

    pub fn from_tag_set(
        rack_position: RackPosition,
        tags: &BTreeSet<Tag>,
        pools: &dyn PoolAggregate,
    ) -> IsoResult<Self> {
        let value_of = |parameter: Parameter| {
            tags.iter()
                .find(|t| t.domain == parameter.domain() && t.predicate == parameter.predicate())
                .map(|t| t.value.as_str())
        };
        let pool = match RawPoolValue::classify(value_of(Parameter::MoleculeDesignPool)) {
            RawPoolValue::PoolId(id) => PoolReference::Fixed(pools.get_by_id(id).ok_or_else(|| {
                IsoError::parse(format!("Unknown molecule design pool {id} at {rack_position}"))
            })?),
            RawPoolValue::Floating(placeholder) => PoolReference::Floating(placeholder),
            RawPoolValue::Library => PoolReference::Library,
            other => {
                return Err(IsoError::parse(format!(
                    "Preparation position {rack_position} has no sample pool ({other:?})"
                )));
            }
        };
        let number_of = |parameter: Parameter| {
            value_of(parameter).and_then(parse_positive_number).ok_or_else(|| {
                IsoError::parse(format!(
                    "Invalid or missing {} at {rack_position}",
                    parameter.display_name()
                ))
            })
        };
        let mut ret = Self::new(
            rack_position,
            pool,
            number_of(Parameter::PreparationConcentration)?,
            number_of(Parameter::PreparationVolume)?,
        );
        if let Some(value) = value_of(Parameter::TransferTargets) {
            for item in value.split('-').filter(|s| !s.trim().is_empty()) {
                let target = TransferTarget::parse(item).ok_or_else(|| {
                    IsoError::parse(format!("Invalid transfer target \"{item}\" at {rack_position}"))
                })?;
                ret.transfer_targets.insert(target);
            }
        }
        Ok(ret)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct PreparationLayout {
    shape: RackShape,
    positions: BTreeMap<RackPosition, PreparationPosition>,
}

impl PreparationLayout {
    pub fn new(shape: RackShape) -> Self {
        Self {
            shape,
            positions: BTreeMap::new(),
        }
    }

    pub fn shape(&self) -> RackShape {
        self.shape
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn add_position(&mut self, position: PreparationPosition) -> IsoResult<()> {
        if !self.shape.contains(&position.rack_position) {
            return Err(IsoError::programmer(format!(
                "Position {} is outside of a {} preparation layout",
                position.rack_position,
                self.shape.name()
            )));
        }
        if self.positions.contains_key(&position.rack_position) {
            return Err(IsoError::programmer(format!(
                "Preparation position {} is already occupied",
                position.rack_position
            )));
        }
        self.positions.insert(position.rack_position, position);
        Ok(())
    }

    pub fn get_working_position(&self, position: &RackPosition) -> Option<&PreparationPosition> {
        self.positions.get(position)
    }

    pub fn get_working_position_mut(&mut self, position: &RackPosition) -> Option<&mut PreparationPosition> {
        self.positions.get_mut(position)
    }

    pub fn working_positions(&self) -> impl Iterator<Item = &PreparationPosition> {
        self.positions.values()
    }

    pub fn floating_placeholders(&self) -> BTreeSet<String> {
        self.positions
            .values()
            .filter_map(|p| p.pool.placeholder().map(str::to_string))
            .collect()
    }

    pub fn create_rack_layout(&self) -> RackLayout {
        RackLayout::from_tag_sets(
            self.shape,
            self.positions
                .values()
                .map(|p| (p.rack_position, p.get_tag_set())),
        )
    }

    pub fn from_rack_layout(rack_layout: &RackLayout, pools: &dyn PoolAggregate) -> IsoResult<Self> {
        let mut ret = Self::new(rack_layout.shape);
        for position in rack_layout.positions_for_predicate(DOMAIN_POOL, Parameter::MoleculeDesignPool.predicate()) {
            let tags = rack_layout.tags_for_position(&position);
            ret.add_position(PreparationPosition::from_tag_set(position, &tags, pools)?)?;
        }
        Ok(ret)
    }
}
