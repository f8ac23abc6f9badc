//! Quadrant (sector) analysis of 384-well layouts for sector-bound robots.

use crate::error::{IsoError, IsoResult};
use crate::pool::{FLOATING_PREFIX, PoolReference, PositionType};
use crate::rack::{NUMBER_SECTORS, QuadrantTranslator, RackPosition};
use crate::transfection::{TransfectionLayout, TransfectionPosition};
use crate::units::{are_equal_values, is_larger_than};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Result of a successful association.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RackSectorAssociation {
    pub regard_controls: bool,
    /// Groups of sectors with equal pool signatures, ordered by their
    /// lowest sector index.
    pub associated_sectors: Vec<Vec<u8>>,
    pub sector_concentrations: BTreeMap<u8, Option<f64>>,
    pub iso_concentrations: BTreeMap<u8, Option<f64>>,
    pub sector_volumes: BTreeMap<u8, Option<f64>>,
    pub parent_sectors: BTreeMap<u8, Option<u8>>,
}

impl RackSectorAssociation {
    pub fn group_of(&self, sector: u8) -> Option<usize> {
        self.associated_sectors
            .iter()
            .position(|group| group.contains(&sector))
    }

    /// Number of distinct ISO concentrations across all sectors.
    pub fn number_of_concentrations(&self) -> usize {
        let mut values: Vec<f64> = vec![];
        for c in self.iso_concentrations.values().flatten() {
            if !values.iter().any(|v| are_equal_values(*v, *c)) {
                values.push(*c);
            }
        }
        values.len()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum SignatureEntry {
    Fixed(u64),
    Floating,
}

#[derive(Default)]
struct SectorValues {
    iso_concentration: Vec<f64>,
    iso_volume: Vec<f64>,
    final_concentration: Vec<f64>,
    signature: BTreeMap<RackPosition, SignatureEntry>,
}

fn push_distinct(values: &mut Vec<f64>, value: Option<f64>) {
    if let Some(value) = value {
        if !values.iter().any(|v| are_equal_values(*v, value)) {
            values.push(value);
        }
    }
}

/// The one value of a sector; none or several is an inconsistency.
fn single(values: &[f64]) -> Result<f64, ()> {
    match values {
        [value] => Ok(*value),
        _ => Err(()),
    }
}

pub struct RackSectorAssociator<'a> {
    layout: &'a TransfectionLayout,
}

impl<'a> RackSectorAssociator<'a> {
    pub fn new(layout: &'a TransfectionLayout) -> Self {
        Self { layout }
    }

    /// `None` if the layout is not a 384-well layout with at least two
    /// floating positions; otherwise the association, trying with controls
    /// first and floatings only second.
    pub fn associate(&self) -> IsoResult<Option<RackSectorAssociation>> {
        if !self.layout.shape().is_384() {
            return Ok(None);
        }
        let floatings = self
            .layout
            .working_positions()
            .filter(|p| p.is_floating())
            .count();
        if floatings < 2 {
            return Ok(None);
        }
        let mut problems = vec![];
        for regard_controls in [true, false] {
            match self.associate_with(regard_controls) {
                Ok(association) => {
                    debug!(
                        regard_controls,
                        groups = ?association.associated_sectors,
                        "sector association found"
                    );
                    return Ok(Some(association));
                }
                Err(problem) => problems.push(problem),
            }
        }
        Err(IsoError::consistency(format!(
            "The layout is not compatible with a 4-to-1 sector pipetting scheme: {}",
            problems.into_iter().unique().join("; ")
        )))
    }

    fn regards(position: &TransfectionPosition, regard_controls: bool) -> bool {
        match position.position_type() {
            PositionType::Floating => true,
            PositionType::Fixed => regard_controls,
            _ => false,
        }
    }

    fn associate_with(&self, regard_controls: bool) -> Result<RackSectorAssociation, String> {
        let mut values: BTreeMap<u8, SectorValues> = BTreeMap::new();
        for position in self.layout.working_positions() {
            if !Self::regards(position, regard_controls) {
                continue;
            }
            let sector = QuadrantTranslator::sector_index(&position.rack_position);
            let entry = values.entry(sector).or_default();
            push_distinct(&mut entry.iso_concentration, position.iso_concentration);
            push_distinct(&mut entry.iso_volume, position.iso_volume);
            push_distinct(&mut entry.final_concentration, position.final_concentration);
            let signature = match &position.pool {
                PoolReference::Fixed(pool) => SignatureEntry::Fixed(pool.id),
                _ => SignatureEntry::Floating,
            };
            entry
                .signature
                .insert(QuadrantTranslator::to_96(&position.rack_position), signature);
        }

        let mut ret = RackSectorAssociation {
            regard_controls,
            associated_sectors: vec![],
            sector_concentrations: BTreeMap::new(),
            iso_concentrations: BTreeMap::new(),
            sector_volumes: BTreeMap::new(),
            parent_sectors: BTreeMap::new(),
        };
        let mut inconsistent = vec![];
        for (sector, v) in &values {
            match (
                single(&v.iso_concentration),
                single(&v.iso_volume),
                single(&v.final_concentration),
            ) {
                (Ok(iso), Ok(volume), Ok(fc)) => {
                    ret.iso_concentrations.insert(*sector, Some(iso));
                    ret.sector_volumes.insert(*sector, Some(volume));
                    ret.sector_concentrations.insert(*sector, Some(fc));
                }
                _ => inconsistent.push(sector.to_string()),
            }
        }
        if !inconsistent.is_empty() {
            return Err(format!(
                "the concentrations or volumes within the following sectors are inconsistent: {}",
                inconsistent.join(", ")
            ));
        }
        self.check_concentration_mapping(&ret)?;

        let mut groups: Vec<(BTreeMap<RackPosition, SignatureEntry>, Vec<u8>)> = vec![];
        for (sector, v) in &values {
            match groups.iter_mut().find(|(sig, _)| *sig == v.signature) {
                Some((_, members)) => members.push(*sector),
                None => groups.push((v.signature.clone(), vec![*sector])),
            }
        }
        for (_, members) in groups {
            for sector in &members {
                let own = ret.iso_concentrations.get(sector).copied().flatten();
                let parent = own.and_then(|own| {
                    members
                        .iter()
                        .filter_map(|other| {
                            ret.iso_concentrations
                                .get(other)
                                .copied()
                                .flatten()
                                .filter(|c| is_larger_than(*c, own))
                                .map(|c| (c, *other))
                        })
                        .min_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)))
                        .map(|(_, other)| other)
                });
                ret.parent_sectors.insert(*sector, parent);
            }
            ret.associated_sectors.push(members);
        }
        Ok(ret)
    }

    /// Every ISO concentration maps to exactly one final concentration and
    /// vice versa.
    fn check_concentration_mapping(&self, association: &RackSectorAssociation) -> Result<(), String> {
        let mut pairs: Vec<(f64, f64)> = vec![];
        for sector in 0..NUMBER_SECTORS {
            let iso = association.iso_concentrations.get(&sector).copied().flatten();
            let fc = association.sector_concentrations.get(&sector).copied().flatten();
            if let (Some(iso), Some(fc)) = (iso, fc) {
                pairs.push((iso, fc));
            }
        }
        for (i, a) in pairs.iter().enumerate() {
            for b in pairs.iter().skip(i + 1) {
                let same_iso = are_equal_values(a.0, b.0);
                let same_final = are_equal_values(a.1, b.1);
                if same_iso != same_final {
                    return Err(format!(
                        "ISO concentrations and final concentrations do not map onto each other \
                         ({} nM / {} nM vs {} nM / {} nM)",
                        a.0, a.1, b.0, b.1
                    ));
                }
            }
        }
        Ok(())
    }
}

pub fn floating_placeholder(number: usize) -> String {
    format!("{FLOATING_PREFIX}{number:03}")
}

/// Renaming map for floatings of a multi-concentration 384-well screening
/// layout: one new placeholder per (quadrant, sector group) class, quadrants
/// in row-major order.
pub fn sort_floatings_by_sector(
    layout: &TransfectionLayout,
    association: &RackSectorAssociation,
) -> IsoResult<BTreeMap<String, String>> {
    let mut by_quadrant: BTreeMap<usize, Vec<&TransfectionPosition>> = BTreeMap::new();
    for position in layout.working_positions().filter(|p| p.is_floating()) {
        by_quadrant
            .entry(QuadrantTranslator::quadrant_index(&position.rack_position))
            .or_default()
            .push(position);
    }

    let mut reference: Option<(usize, Vec<f64>)> = None;
    let mut mismatched = vec![];
    for (quadrant, positions) in &by_quadrant {
        let mut finals: Vec<f64> = vec![];
        for p in positions {
            push_distinct(&mut finals, p.final_concentration);
        }
        finals.sort_by(|a, b| a.total_cmp(b));
        match &reference {
            None => reference = Some((*quadrant, finals)),
            Some((_, expected)) => {
                let same = expected.len() == finals.len()
                    && expected.iter().zip(&finals).all(|(a, b)| are_equal_values(*a, *b));
                if !same {
                    if let Some(p) = positions.first() {
                        mismatched.push(QuadrantTranslator::to_96(&p.rack_position).label());
                    }
                }
            }
        }
    }
    if !mismatched.is_empty() {
        return Err(IsoError::consistency(format!(
            "All quadrants must present the same set of final concentrations. \
             Deviating quadrants (96-well position): {}",
            mismatched.join(", ")
        )));
    }

    let mut mapping: BTreeMap<String, String> = BTreeMap::new();
    let mut counter = 0usize;
    for positions in by_quadrant.values() {
        let mut classes: BTreeMap<usize, BTreeSet<String>> = BTreeMap::new();
        for p in positions {
            let sector = QuadrantTranslator::sector_index(&p.rack_position);
            let group = association.group_of(sector).ok_or_else(|| {
                IsoError::programmer(format!("Sector {sector} of {} is not associated", p.rack_position))
            })?;
            if let Some(placeholder) = p.pool.placeholder() {
                classes.entry(group).or_default().insert(placeholder.to_string());
            }
        }
        for placeholders in classes.values() {
            let existing = placeholders.iter().find_map(|old| mapping.get(old).cloned());
            let new = match existing {
                Some(new) => new,
                None => {
                    counter += 1;
                    floating_placeholder(counter)
                }
            };
            for old in placeholders {
                mapping.entry(old.clone()).or_insert_with(|| new.clone());
            }
        }
    }
    Ok(mapping)
}

/// Renaming map in row-major position order, one new placeholder per
/// distinct old placeholder.
pub fn sort_floatings_by_position(layout: &TransfectionLayout) -> BTreeMap<String, String> {
    let mut mapping: BTreeMap<String, String> = BTreeMap::new();
    let mut counter = 0usize;
    for position in layout.working_positions() {
        if let Some(old) = position.pool.placeholder() {
            if !mapping.contains_key(old) {
                counter += 1;
                mapping.insert(old.to_string(), floating_placeholder(counter));
            }
        }
    }
    mapping
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{InMemoryPoolAggregate, MoleculeDesignPool, PoolAggregate};
    use crate::rack::{SHAPE_384, SHAPE_96};

    fn floating(layout: &mut TransfectionLayout, pos: RackPosition, name: &str, iso: f64, fc: f64) {
        layout
            .add_position(
                TransfectionPosition::new(pos, PoolReference::Floating(name.to_string()))
                    .with_iso_values(Some(5.0), Some(iso))
                    .with_transfection_values(Some(fc), Some("mix"), Some(1400.0)),
            )
            .unwrap();
    }

    fn uniform_layout() -> TransfectionLayout {
        let mut layout = TransfectionLayout::new(SHAPE_384);
        let mut n = 0;
        for label96 in ["B3", "B4", "C2", "D1"] {
            let p96 = RackPosition::from_label(label96).unwrap();
            for sector in 0..4 {
                n += 1;
                floating(
                    &mut layout,
                    QuadrantTranslator::to_384(&p96, sector),
                    &format!("md_{n}"),
                    50.0,
                    10.0,
                );
            }
        }
        layout
    }

    fn multi_concentration_layout() -> TransfectionLayout {
        let mut layout = TransfectionLayout::new(SHAPE_384);
        let mut n = 0;
        for label96 in ["A1", "B2", "C3"] {
            let p96 = RackPosition::from_label(label96).unwrap();
            n += 1;
            for (sector, iso, fc) in [(1u8, 50.0, 10.0), (2, 100.0, 20.0), (3, 150.0, 30.0)] {
                floating(
                    &mut layout,
                    QuadrantTranslator::to_384(&p96, sector),
                    &format!("md_x{n}"),
                    iso,
                    fc,
                );
            }
        }
        layout
    }

    #[test]
    fn test_uniform_concentrations_form_one_group() {
        let layout = uniform_layout();
        let association = RackSectorAssociator::new(&layout).associate().unwrap().unwrap();
        assert_eq!(association.associated_sectors, vec![vec![0, 1, 2, 3]]);
        assert!(association.parent_sectors.values().all(Option::is_none));
        assert_eq!(association.number_of_concentrations(), 1);
    }

    #[test]
    fn test_multi_concentration_parent_chain() {
        let layout = multi_concentration_layout();
        let association = RackSectorAssociator::new(&layout).associate().unwrap().unwrap();
        assert_eq!(association.associated_sectors, vec![vec![1, 2, 3]]);
        assert_eq!(association.parent_sectors.get(&1), Some(&Some(2)));
        assert_eq!(association.parent_sectors.get(&2), Some(&Some(3)));
        assert_eq!(association.parent_sectors.get(&3), Some(&None));
        assert_eq!(association.iso_concentrations.get(&3), Some(&Some(150.0)));
    }

    #[test]
    fn test_controls_fall_back_to_floatings_only() {
        let pools = InMemoryPoolAggregate::new([MoleculeDesignPool::new(205200, "SIRNA", 5e-5)]);
        let mut layout = uniform_layout();
        let control = pools.get_by_id(205200).unwrap();
        for sector in 0..4 {
            layout
                .add_position(
                    TransfectionPosition::new(
                        QuadrantTranslator::to_384(&RackPosition::new(0, 0), sector),
                        PoolReference::Fixed(control.clone()),
                    )
                    .with_iso_values(Some(5.0), Some(200.0))
                    .with_transfection_values(Some(40.0), Some("mix"), Some(1400.0)),
                )
                .unwrap();
        }
        let association = RackSectorAssociator::new(&layout).associate().unwrap().unwrap();
        assert!(!association.regard_controls);
        assert_eq!(association.associated_sectors, vec![vec![0, 1, 2, 3]]);
    }

    #[test]
    fn test_inconsistent_sector_fails() {
        let mut layout = uniform_layout();
        floating(&mut layout, RackPosition::new(14, 0), "md_extra", 75.0, 15.0);
        let err = RackSectorAssociator::new(&layout).associate().unwrap_err();
        assert!(matches!(err, IsoError::Consistency(_)));
        assert!(err.to_string().contains("sectors are inconsistent: 0"));
    }

    #[test]
    fn test_sector_without_final_concentration_fails() {
        let mut layout = TransfectionLayout::new(SHAPE_384);
        for (n, sector) in (0..4u8).enumerate() {
            let mut position = TransfectionPosition::new(
                QuadrantTranslator::to_384(&RackPosition::new(1, 1), sector),
                PoolReference::Floating(format!("md_{n}")),
            )
            .with_iso_values(Some(5.0), Some(50.0));
            if sector != 2 {
                position = position.with_transfection_values(Some(10.0), Some("mix"), Some(1400.0));
            }
            layout.add_position(position).unwrap();
        }
        let err = RackSectorAssociator::new(&layout).associate().unwrap_err();
        assert!(err.to_string().contains("sectors are inconsistent: 2"));
    }

    #[test]
    fn test_not_applicable_for_96_wells() {
        let mut layout = TransfectionLayout::new(SHAPE_96);
        floating(&mut layout, RackPosition::new(0, 0), "md_1", 50.0, 10.0);
        floating(&mut layout, RackPosition::new(0, 1), "md_2", 50.0, 10.0);
        assert!(RackSectorAssociator::new(&layout).associate().unwrap().is_none());
    }

    #[test]
    fn test_sort_by_sector_assigns_one_id_per_quadrant_group() {
        let layout = multi_concentration_layout();
        let association = RackSectorAssociator::new(&layout).associate().unwrap().unwrap();
        let mapping = sort_floatings_by_sector(&layout, &association).unwrap();
        assert_eq!(mapping.get("md_x1").map(String::as_str), Some("md_001"));
        assert_eq!(mapping.get("md_x2").map(String::as_str), Some("md_002"));
        assert_eq!(mapping.get("md_x3").map(String::as_str), Some("md_003"));
    }

    #[test]
    fn test_sort_by_position_is_row_major() {
        let layout = uniform_layout();
        let mapping = sort_floatings_by_position(&layout);
        assert_eq!(mapping.len(), 16);
        // B3 (96) in sector 0 is the 384-well position C5, the first floating row-major
        let first = layout
            .working_positions()
            .find(|p| p.is_floating())
            .and_then(|p| p.pool.placeholder())
            .unwrap();
        assert_eq!(mapping.get(first).map(String::as_str), Some("md_001"));
    }
}
