use crate::error::{IsoError, IsoResult};
use crate::parameters::{DOMAIN_POOL, Parameter, Tag};
use crate::pool::{PoolAggregate, PoolKey, PoolReference, PositionType, RawPoolValue};
use crate::rack::{RackPosition, RackShape};
use crate::rack_layout::RackLayout;
use crate::units::{are_equal_values, get_trimmed_string};
use std::collections::{BTreeMap, BTreeSet};

pub const NONE_TAG_VALUE: &str = "None";

/// One well of an ISO (aliquot) layout.
#[derive(Clone, Debug, PartialEq)]
pub struct TransfectionPosition {
    pub rack_position: RackPosition,
    pub pool: PoolReference,
    pub iso_volume: Option<f64>,
    pub iso_concentration: Option<f64>,
    pub final_concentration: Option<f64>,
    pub reagent_name: Option<String>,
    pub reagent_dilution_factor: Option<f64>,
    pub supplier: Option<String>,
    pub optimem_dilution_factor: Option<f64>,
}

impl TransfectionPosition {
    pub fn new(rack_position: RackPosition, pool: PoolReference) -> Self {
        Self {
            rack_position,
            pool,
            iso_volume: None,
            iso_concentration: None,
            final_concentration: None,
            reagent_name: None,
            reagent_dilution_factor: None,
            supplier: None,
            optimem_dilution_factor: None,
        }
    }

    pub fn empty(rack_position: RackPosition) -> Self {
        Self::new(rack_position, PoolReference::Empty)
    }

    pub fn with_iso_values(mut self, volume: Option<f64>, concentration: Option<f64>) -> Self {
        self.iso_volume = volume;
        self.iso_concentration = concentration;
        self
    }

    pub fn with_transfection_values(
        mut self,
        final_concentration: Option<f64>,
        reagent_name: Option<&str>,
        reagent_dilution_factor: Option<f64>,
    ) -> Self {
        self.final_concentration = final_concentration;
        self.reagent_name = reagent_name.map(str::to_string);
        self.reagent_dilution_factor = reagent_dilution_factor;
        self
    }

    pub fn position_type(&self) -> PositionType {
        self.pool.position_type()
    }

    pub fn is_empty(&self) -> bool {
        self.position_type() == PositionType::Empty
    }

    pub fn is_fixed(&self) -> bool {
        self.position_type() == PositionType::Fixed
    }

    pub fn is_floating(&self) -> bool {
        self.position_type() == PositionType::Floating
    }

    pub fn is_mock(&self) -> bool {
        self.position_type() == PositionType::Mock
    }

    pub fn is_untreated(&self) -> bool {
        self.position_type() == PositionType::Untreated
    }

    /// Mock wells only receive an OptiMem dilution factor on explicit
    /// request; the parsing pass never sets it.
    pub fn set_optimem_dilution_factor(&mut self, factor: f64) {
        self.optimem_dilution_factor = Some(factor);
    }

    /// Structural invariants per position type.
    pub fn validate(&self) -> Result<(), String> {
        let label = self.rack_position.label();
        match self.position_type() {
            PositionType::Empty => {
                if self.iso_volume.is_some()
                    || self.iso_concentration.is_some()
                    || self.final_concentration.is_some()
                    || self.reagent_name.is_some()
                    || self.reagent_dilution_factor.is_some()
                    || self.supplier.is_some()
                    || self.optimem_dilution_factor.is_some()
                {
                    return Err(format!("Empty position {label} must not carry values"));
                }
            }
            PositionType::Untreated => {
                if self.iso_volume.is_some()
                    || self.iso_concentration.is_some()
                    || self.final_concentration.is_some()
                    || self.reagent_name.is_some()
                    || self.reagent_dilution_factor.is_some()
                    || self.optimem_dilution_factor.is_some()
                {
                    return Err(format!(
                        "Untreated position {label} must not carry volumes, concentrations or reagents"
                    ));
                }
            }
            PositionType::Mock => {
                if self.iso_concentration.is_some() || self.final_concentration.is_some() {
                    return Err(format!("Mock position {label} must not have concentrations"));
                }
            }
            PositionType::Fixed => {
                if let (Some(pool), Some(conc)) = (self.pool.pool(), self.iso_concentration) {
                    if crate::units::is_larger_than(conc, pool.stock_concentration_nm()) {
                        return Err(format!(
                            "ISO concentration at {label} exceeds the stock concentration of pool {}",
                            pool.id
                        ));
                    }
                }
            }
            PositionType::Floating | PositionType::Library => {}
        }
        if self.supplier.is_some() && !self.is_fixed() {
            return Err(format!("Supplier at {label} is only allowed for fixed positions"));
        }
        Ok(())
    }

    /// Raw value string of a parameter, `None` if unset.
    pub fn get_parameter_value(&self, parameter: Parameter) -> Option<String> {
        match parameter {
            Parameter::MoleculeDesignPool => self.pool.tag_value(),
            Parameter::PositionType => Some(self.position_type().as_str().to_string()),
            Parameter::IsoVolume => self.iso_volume.map(get_trimmed_string),
            Parameter::IsoConcentration => self.iso_concentration.map(get_trimmed_string),
            Parameter::FinalConcentration => self.final_concentration.map(get_trimmed_string),
            Parameter::ReagentDilutionFactor => {
                self.reagent_dilution_factor.map(get_trimmed_string)
            }
            Parameter::OptimemDilutionFactor => {
                self.optimem_dilution_factor.map(get_trimmed_string)
            }
            Parameter::ReagentName => self.reagent_name.clone(),
            Parameter::Supplier => self.supplier.clone(),
            _ => None,
        }
    }

    /// (domain, predicate, value) for a parameter; unset values render "None".
    pub fn get_parameter_tag(&self, parameter: Parameter) -> Tag {
        Tag::new(
            parameter.domain(),
            parameter.predicate(),
            self.get_parameter_value(parameter)
                .unwrap_or_else(|| NONE_TAG_VALUE.to_string()),
        )
    }

    pub fn get_tag_set(&self) -> BTreeSet<Tag> {
        if self.is_empty() {
            return [self.get_parameter_tag(Parameter::PositionType)]
                .into_iter()
                .collect();
        }
        Parameter::POSITION_PARAMETERS
            .into_iter()
            .filter(|p| self.get_parameter_value(*p).is_some())
            .map(|p| self.get_parameter_tag(p))
            .collect()
    }

    /// Inverse of [`Self::get_tag_set`].
    pub fn from_tag_set(
        rack_position: RackPosition,
        tags: &BTreeSet<Tag>,
        pools: &dyn PoolAggregate,
    ) -> IsoResult<Self> {
        let value_of = |parameter: Parameter| -> Option<&str> {
            tags.iter()
                .find(|t| t.domain == parameter.domain() && t.predicate == parameter.predicate())
                .map(|t| t.value.as_str())
                .filter(|v| *v != NONE_TAG_VALUE)
        };
        let number_of = |parameter: Parameter| -> IsoResult<Option<f64>> {
            match value_of(parameter) {
                None => Ok(None),
                Some(v) => v.parse::<f64>().map(Some).map_err(|_| {
                    IsoError::parse(format!(
                        "Invalid {} '{v}' at {}",
                        parameter.display_name(),
                        rack_position.label()
                    ))
                }),
            }
        };

        let pool = match RawPoolValue::classify(value_of(Parameter::MoleculeDesignPool)) {
            RawPoolValue::Empty => PoolReference::Empty,
            RawPoolValue::Floating(placeholder) => PoolReference::Floating(placeholder),
            RawPoolValue::Mock => PoolReference::Mock,
            RawPoolValue::Untreated => PoolReference::Untreated,
            RawPoolValue::Library => PoolReference::Library,
            RawPoolValue::PoolId(id) => PoolReference::Fixed(pools.get_by_id(id).ok_or_else(
                || IsoError::parse(format!("Unknown molecule design pool {id} at {rack_position}")),
            )?),
            RawPoolValue::Invalid(v) => {
                return Err(IsoError::parse(format!(
                    "Invalid molecule design pool '{v}' at {rack_position}"
                )));
            }
        };
        if let Some(declared) = value_of(Parameter::PositionType).and_then(PositionType::parse) {
            if declared != pool.position_type() {
                return Err(IsoError::parse(format!(
                    "Position type '{declared}' at {rack_position} does not match its pool"
                )));
            }
        }
        Ok(Self {
            rack_position,
            pool,
            iso_volume: number_of(Parameter::IsoVolume)?,
            iso_concentration: number_of(Parameter::IsoConcentration)?,
            final_concentration: number_of(Parameter::FinalConcentration)?,
            reagent_name: value_of(Parameter::ReagentName).map(str::to_string),
            reagent_dilution_factor: number_of(Parameter::ReagentDilutionFactor)?,
            supplier: value_of(Parameter::Supplier).map(str::to_string),
            optimem_dilution_factor: number_of(Parameter::OptimemDilutionFactor)?,
        })
    }
}

/// The rack-shape bounded collection of transfection positions.
#[derive(Clone, Debug, PartialEq)]
pub struct TransfectionLayout {
    shape: RackShape,
    positions: BTreeMap<RackPosition, TransfectionPosition>,
    closed: bool,
}

impl TransfectionLayout {
    pub fn new(shape: RackShape) -> Self {
        Self {
            shape,
            positions: BTreeMap::new(),
            closed: false,
        }
    }

    pub fn shape(&self) -> RackShape {
        self.shape
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn add_position(&mut self, position: TransfectionPosition) -> IsoResult<()> {
        if self.closed {
            return Err(IsoError::programmer(format!(
                "Cannot add position {} to a closed layout",
                position.rack_position
            )));
        }
        if !self.shape.contains(&position.rack_position) {
            return Err(IsoError::programmer(format!(
                "Position {} is outside of a {} layout",
                position.rack_position,
                self.shape.name()
            )));
        }
        self.positions.insert(position.rack_position, position);
        Ok(())
    }

    pub fn get_working_position(&self, position: &RackPosition) -> Option<&TransfectionPosition> {
        self.positions.get(position)
    }

    pub fn get_working_position_mut(
        &mut self,
        position: &RackPosition,
    ) -> IsoResult<Option<&mut TransfectionPosition>> {
        if self.closed {
            return Err(IsoError::programmer(format!(
                "Cannot modify position {position} of a closed layout"
            )));
        }
        Ok(self.positions.get_mut(position))
    }

    /// Positions in row-major order.
    pub fn working_positions(&self) -> impl Iterator<Item = &TransfectionPosition> {
        self.positions.values()
    }

    /// Drops empty positions (untreated ones stay). Idempotent.
    pub fn close(&mut self) {
        self.positions.retain(|_, p| !p.is_empty());
        self.closed = true;
    }

    pub fn closed_copy(&self) -> Self {
        let mut ret = self.clone();
        ret.close();
        ret
    }

    pub fn has_floatings(&self) -> bool {
        self.positions.values().any(|p| p.is_floating())
    }

    pub fn has_fixed(&self) -> bool {
        self.positions.values().any(|p| p.is_fixed())
    }

    /// Number of distinct fixed pools plus distinct floating placeholders.
    pub fn get_molecule_design_pool_count(&self) -> usize {
        self.positions
            .values()
            .filter_map(|p| p.pool.pool_key())
            .collect::<BTreeSet<_>>()
            .len()
    }

    pub fn floating_placeholders(&self) -> BTreeSet<String> {
        self.positions
            .values()
            .filter_map(|p| p.pool.placeholder().map(str::to_string))
            .collect()
    }

    pub fn positions_by_pool(&self) -> BTreeMap<PoolKey, Vec<RackPosition>> {
        let mut ret: BTreeMap<PoolKey, Vec<RackPosition>> = BTreeMap::new();
        for p in self.positions.values() {
            if let Some(key) = p.pool.pool_key() {
                ret.entry(key).or_default().push(p.rack_position);
            }
        }
        ret
    }

    /// Every non-empty, non-mock position has either both ISO volume and
    /// concentration or neither.
    pub fn has_consistent_volumes_and_concentrations(&self) -> bool {
        self.positions
            .values()
            .filter(|p| !p.is_empty() && !p.is_mock() && !p.is_untreated())
            .all(|p| p.iso_volume.is_some() == p.iso_concentration.is_some())
    }

    /// Distinct ISO concentrations of sample positions.
    pub fn iso_concentrations(&self, position_type: PositionType) -> Vec<f64> {
        let mut ret: Vec<f64> = vec![];
        for p in self.positions.values().filter(|p| p.position_type() == position_type) {
            if let Some(c) = p.iso_concentration {
                if !ret.iter().any(|v| are_equal_values(*v, c)) {
                    ret.push(c);
                }
            }
        }
        ret.sort_by(|a, b| a.total_cmp(b));
        ret
    }

    /// Replaces floating placeholders according to `mapping`.
    pub fn rename_floatings(&mut self, mapping: &BTreeMap<String, String>) -> IsoResult<()> {
        if self.closed {
            return Err(IsoError::programmer(
                "Cannot rename floating placeholders of a closed layout",
            ));
        }
        for p in self.positions.values_mut() {
            if let PoolReference::Floating(old) = &p.pool {
                if let Some(new) = mapping.get(old) {
                    p.pool = PoolReference::Floating(new.clone());
                }
            }
        }
        Ok(())
    }

    /// Closes a copy and groups its positions by identical tag set.
    pub fn create_rack_layout(&self) -> RackLayout {
        let closed = self.closed_copy();
        RackLayout::from_tag_sets(
            self.shape,
            closed
                .positions
                .values()
                .map(|p| (p.rack_position, p.get_tag_set())),
        )
    }

    pub fn from_rack_layout(rack_layout: &RackLayout, pools: &dyn PoolAggregate) -> IsoResult<Self> {
        let mut ret = Self::new(rack_layout.shape);
        let pool_positions = rack_layout.positions_for_predicate(
            DOMAIN_POOL,
            Parameter::MoleculeDesignPool.predicate(),
        );
        for position in pool_positions {
            let tags = rack_layout.tags_for_position(&position);
            ret.add_position(TransfectionPosition::from_tag_set(position, &tags, pools)?)?;
        }
        ret.close();
        Ok(ret)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{InMemoryPoolAggregate, MoleculeDesignPool};
    use crate::rack::{SHAPE_96, RackPosition};
    use std::sync::Arc;

    fn aggregate() -> InMemoryPoolAggregate {
        InMemoryPoolAggregate::new([MoleculeDesignPool::new(205200, "SIRNA", 5e-5)])
    }

    fn pos(label: &str) -> RackPosition {
        RackPosition::from_label(label).unwrap()
    }

    fn sample_layout(pools: &InMemoryPoolAggregate) -> TransfectionLayout {
        let pool = pools.get_by_id(205200).unwrap();
        let mut layout = TransfectionLayout::new(SHAPE_96);
        for label in ["A1", "B1"] {
            let tp = TransfectionPosition::new(pos(label), PoolReference::Fixed(pool.clone()))
                .with_iso_values(Some(10.0), Some(50.0))
                .with_transfection_values(Some(10.0), Some("mix"), Some(1400.0));
            layout.add_position(tp).unwrap();
        }
        layout
            .add_position(
                TransfectionPosition::new(pos("C1"), PoolReference::Floating("md_001".into()))
                    .with_iso_values(Some(10.0), Some(25.5)),
            )
            .unwrap();
        layout
            .add_position(TransfectionPosition::new(pos("D1"), PoolReference::Mock).with_iso_values(Some(10.0), None))
            .unwrap();
        layout
            .add_position(TransfectionPosition::new(pos("E1"), PoolReference::Untreated))
            .unwrap();
        layout.add_position(TransfectionPosition::empty(pos("F1"))).unwrap();
        layout
    }

    #[test]
    fn test_parameter_tags() {
        let pools = aggregate();
        let layout = sample_layout(&pools);
        let a1 = layout.get_working_position(&pos("A1")).unwrap();
        assert_eq!(
            a1.get_parameter_tag(Parameter::ReagentDilutionFactor),
            Tag::new("transfection", "reagent_dilution_factor", "1400")
        );
        assert_eq!(
            a1.get_parameter_tag(Parameter::Supplier).value,
            NONE_TAG_VALUE
        );
        let c1 = layout.get_working_position(&pos("C1")).unwrap();
        assert_eq!(c1.get_parameter_tag(Parameter::IsoConcentration).value, "25.5");
        let f1 = layout.get_working_position(&pos("F1")).unwrap();
        assert_eq!(
            f1.get_tag_set(),
            [Tag::new("iso", "position_type", "empty")].into_iter().collect()
        );
    }

    #[test]
    fn test_close_is_idempotent_and_keeps_untreated() {
        let pools = aggregate();
        let mut layout = sample_layout(&pools);
        layout.close();
        assert_eq!(layout.len(), 5);
        assert!(layout.get_working_position(&pos("E1")).is_some());
        let once = layout.clone();
        layout.close();
        assert_eq!(layout, once);
        assert!(layout.working_positions().all(|p| !p.is_empty()));
        assert!(layout
            .add_position(TransfectionPosition::empty(pos("G1")))
            .is_err());
    }

    #[test]
    fn test_introspection() {
        let pools = aggregate();
        let mut layout = sample_layout(&pools);
        assert!(layout.has_floatings());
        assert_eq!(layout.get_molecule_design_pool_count(), 2);
        assert!(layout.has_consistent_volumes_and_concentrations());
        layout
            .get_working_position_mut(&pos("C1"))
            .unwrap()
            .unwrap()
            .iso_concentration = None;
        assert!(!layout.has_consistent_volumes_and_concentrations());
    }

    #[test]
    fn test_rack_layout_round_trip() {
        let pools = aggregate();
        let layout = sample_layout(&pools);
        let rack_layout = layout.create_rack_layout();
        // A1 and B1 share one tag set
        assert_eq!(rack_layout.tagged_sets().len(), 4);
        let restored = TransfectionLayout::from_rack_layout(&rack_layout, &pools).unwrap();
        assert_eq!(restored, layout.closed_copy());
    }

    #[test]
    fn test_from_tag_set_unknown_pool() {
        let pools = aggregate();
        let tags: BTreeSet<Tag> = [Tag::new("molecule_design_pool", "molecule_design_pool_id", "1")]
            .into_iter()
            .collect();
        let err = TransfectionPosition::from_tag_set(pos("A1"), &tags, &pools).unwrap_err();
        assert!(err.to_string().contains("Unknown molecule design pool 1"));
    }

    #[test]
    fn test_validate_invariants() {
        let pool = Arc::new(MoleculeDesignPool::new(1, "SIRNA", 1e-6));
        let ok = TransfectionPosition::new(pos("A1"), PoolReference::Fixed(pool.clone()))
            .with_iso_values(Some(5.0), Some(1000.0));
        assert!(ok.validate().is_ok());
        let too_high = ok.clone().with_iso_values(Some(5.0), Some(1000.5));
        assert!(too_high.validate().is_err());
        let mock = TransfectionPosition::new(pos("A2"), PoolReference::Mock)
            .with_iso_values(Some(5.0), Some(10.0));
        assert!(mock.validate().is_err());
        let mut mock = TransfectionPosition::new(pos("A2"), PoolReference::Mock);
        mock.set_optimem_dilution_factor(4.0);
        assert!(mock.validate().is_ok());
        let mut untreated = TransfectionPosition::new(pos("A3"), PoolReference::Untreated);
        untreated.reagent_name = Some("mix".into());
        assert!(untreated.validate().is_err());
    }
}
