//! Collects the layouts and planned transfers of one ISO request. Once tube
//! candidates are known it produces the ISOs and the worklist series.

use crate::error::{IsoError, IsoResult};
use crate::pool::{PoolReference, PositionType};
use crate::preparation::{PreparationLayout, PreparationPosition};
use crate::rack::RackPosition;
use crate::specs::ReservoirSpecs;
use crate::transfection::{TransfectionLayout, TransfectionPosition};
use crate::transfer::{PlannedTransfer, PlannedWorklist, TransferKind, TransferRegistry, WorklistSeries};
use crate::tube::TubeCandidate;
use itertools::Itertools;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

/// A planned transfer plus the robot that executes it and its position in
/// the dilution order (1 = taken from the stock tube).
#[derive(Clone, Debug, PartialEq)]
pub struct TransferStep {
    pub transfer: PlannedTransfer,
    pub pipetting: String,
    pub rank: u32,
}

impl TransferStep {
    pub fn new(transfer: PlannedTransfer, pipetting: &str, rank: u32) -> Self {
        Self {
            transfer,
            pipetting: pipetting.to_string(),
            rank,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct IntraplateStep {
    pub step: TransferStep,
    pub ancestor_count: u32,
}

/// Volume one pool needs from its stock tube.
#[derive(Clone, Debug, PartialEq)]
pub struct StockRequirement {
    pub pool: PoolReference,
    pub stock_marker: String,
    /// Position of the tube in the stock rack.
    pub position: RackPosition,
    /// µL per ISO (per job for job level requirements).
    pub volume: f64,
    pub stock_concentration: f64,
    pub job_level: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct IsoPlate {
    pub label: String,
    pub marker: String,
    pub reservoir: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PlannedIso {
    pub label: String,
    pub layout: TransfectionLayout,
    pub aliquot_plates: Vec<IsoPlate>,
    pub preparation_plates: Vec<IsoPlate>,
    pub preparation_layouts: BTreeMap<String, PreparationLayout>,
    /// Floating placeholder -> stock tube.
    pub floating_tubes: BTreeMap<String, TubeCandidate>,
    pub library_plate: Option<String>,
}

#[derive(Clone, Debug)]
struct PlateEntry {
    layout: PreparationLayout,
    specs: ReservoirSpecs,
}

/// Sorts "a#2" before "a#10".
fn marker_sort_key(marker: &str) -> (String, u32) {
    match marker.split_once('#') {
        Some((role, number)) => (role.to_string(), number.parse().unwrap_or(u32::MAX)),
        None => (marker.to_string(), 0),
    }
}

fn marker_label(marker: &str) -> String {
    marker.replace('#', "")
}

#[derive(Clone, Debug)]
pub struct IsoBuilder {
    ticket_number: String,
    plate_set_label: String,
    aliquot_specs: Option<ReservoirSpecs>,
    number_aliquots: u32,
    aliquot_layout: Option<TransfectionLayout>,
    preparation_layouts: BTreeMap<String, PlateEntry>,
    job_preparation_layouts: BTreeMap<String, PlateEntry>,
    dilutions: BTreeMap<String, Vec<TransferStep>>,
    intraplate: BTreeMap<String, Vec<IntraplateStep>>,
    interplate: BTreeMap<(String, String), Vec<TransferStep>>,
    stock_requirements: Vec<StockRequirement>,
    fixed_candidates: BTreeMap<u64, TubeCandidate>,
    floating_candidates: Vec<TubeCandidate>,
    library_plates: Option<Vec<String>>,
    number_of_isos: u32,
}

impl IsoBuilder {
    pub fn new(ticket_number: &str, plate_set_label: &str) -> Self {
        Self {
            ticket_number: ticket_number.to_string(),
            plate_set_label: plate_set_label.to_string(),
            aliquot_specs: None,
            number_aliquots: 1,
            aliquot_layout: None,
            preparation_layouts: BTreeMap::new(),
            job_preparation_layouts: BTreeMap::new(),
            dilutions: BTreeMap::new(),
            intraplate: BTreeMap::new(),
            interplate: BTreeMap::new(),
            stock_requirements: vec![],
            fixed_candidates: BTreeMap::new(),
            floating_candidates: vec![],
            library_plates: None,
            number_of_isos: 0,
        }
    }

    pub fn ticket_number(&self) -> &str {
        &self.ticket_number
    }

    pub fn set_aliquot_specs(&mut self, specs: ReservoirSpecs, number_aliquots: u32) {
        self.aliquot_layout = Some(TransfectionLayout::new(specs.shape));
        self.aliquot_specs = Some(specs);
        self.number_aliquots = number_aliquots.max(1);
    }

    pub fn number_aliquots(&self) -> u32 {
        self.number_aliquots
    }

    pub fn add_aliquot_position(&mut self, position: TransfectionPosition) -> IsoResult<()> {
        self.aliquot_layout
            .as_mut()
            .ok_or_else(|| IsoError::programmer("Aliquot specs must be set before adding positions"))?
            .add_position(position)
    }

    pub fn aliquot_layout(&self) -> Option<&TransfectionLayout> {
        self.aliquot_layout.as_ref()
    }

    pub fn add_preparation_layout(&mut self, marker: &str, layout: PreparationLayout, specs: ReservoirSpecs) -> IsoResult<()> {
        Self::insert_layout(&mut self.preparation_layouts, marker, layout, specs)
    }

    pub fn add_job_preparation_layout(
        &mut self,
        marker: &str,
        layout: PreparationLayout,
        specs: ReservoirSpecs,
    ) -> IsoResult<()> {
        Self::insert_layout(&mut self.job_preparation_layouts, marker, layout, specs)
    }

    fn insert_layout(
        map: &mut BTreeMap<String, PlateEntry>,
        marker: &str,
        layout: PreparationLayout,
        specs: ReservoirSpecs,
    ) -> IsoResult<()> {
        if map.contains_key(marker) {
            return Err(IsoError::programmer(format!("Plate {marker} has already been added")));
        }
        map.insert(marker.to_string(), PlateEntry { layout, specs });
        Ok(())
    }

    pub fn preparation_layout(&self, marker: &str) -> Option<&PreparationLayout> {
        self.preparation_layouts
            .get(marker)
            .or_else(|| self.job_preparation_layouts.get(marker))
            .map(|e| &e.layout)
    }

    pub fn preparation_markers(&self) -> Vec<String> {
        self.preparation_layouts
            .keys()
            .cloned()
            .sorted_by_key(|m| marker_sort_key(m))
            .collect()
    }

    pub fn job_preparation_markers(&self) -> Vec<String> {
        self.job_preparation_layouts
            .keys()
            .cloned()
            .sorted_by_key(|m| marker_sort_key(m))
            .collect()
    }

    pub fn add_dilution(&mut self, step: TransferStep, marker: &str) -> IsoResult<()> {
        if step.transfer.kind() != TransferKind::SampleDilution {
            return Err(IsoError::programmer(format!(
                "Expected a sample dilution for {marker}, got a {}",
                step.transfer.kind()
            )));
        }
        self.dilutions.entry(marker.to_string()).or_default().push(step);
        Ok(())
    }

    pub fn add_intraplate_transfer(&mut self, step: TransferStep, marker: &str, ancestor_count: u32) -> IsoResult<()> {
        if step.transfer.kind() == TransferKind::SampleDilution {
            return Err(IsoError::programmer(format!("Dilutions of plate {marker} are not transfers")));
        }
        self.intraplate
            .entry(marker.to_string())
            .or_default()
            .push(IntraplateStep { step, ancestor_count });
        Ok(())
    }

    pub fn add_interplate_transfer(&mut self, step: TransferStep, source_marker: &str, target_marker: &str) -> IsoResult<()> {
        if step.transfer.kind() == TransferKind::SampleDilution {
            return Err(IsoError::programmer(format!(
                "Dilutions cannot go from {source_marker} to {target_marker}"
            )));
        }
        self.interplate
            .entry((source_marker.to_string(), target_marker.to_string()))
            .or_default()
            .push(step);
        Ok(())
    }

    pub fn dilutions(&self, marker: &str) -> &[TransferStep] {
        self.dilutions.get(marker).map_or(&[], Vec::as_slice)
    }

    pub fn intraplate_transfers(&self, marker: &str) -> &[IntraplateStep] {
        self.intraplate.get(marker).map_or(&[], Vec::as_slice)
    }

    pub fn interplate_transfers(&self, source_marker: &str, target_marker: &str) -> &[TransferStep] {
        self.interplate
            .get(&(source_marker.to_string(), target_marker.to_string()))
            .map_or(&[], Vec::as_slice)
    }

    pub fn add_stock_requirement(&mut self, requirement: StockRequirement) {
        self.stock_requirements.push(requirement);
    }

    pub fn stock_requirements(&self) -> &[StockRequirement] {
        &self.stock_requirements
    }

    pub fn set_fixed_candidates(&mut self, candidates: BTreeMap<u64, TubeCandidate>) {
        self.fixed_candidates = candidates;
    }

    pub fn fixed_candidates(&self) -> &BTreeMap<u64, TubeCandidate> {
        &self.fixed_candidates
    }

    pub fn set_floating_candidates(&mut self, candidates: Vec<TubeCandidate>) {
        self.floating_candidates = candidates;
    }

    /// Library ISOs take their floating samples from these plates, one
    /// plate per ISO.
    pub fn set_library_plates(&mut self, barcodes: Vec<String>) {
        self.library_plates = Some(barcodes);
    }

    pub fn set_number_of_isos(&mut self, number: u32) {
        self.number_of_isos = number;
    }

    pub fn number_of_isos(&self) -> u32 {
        self.number_of_isos
    }

    /// Distinct floating placeholders over all plates, in name order.
    pub fn floating_placeholders(&self) -> BTreeSet<String> {
        let mut ret = self
            .aliquot_layout
            .as_ref()
            .map(TransfectionLayout::floating_placeholders)
            .unwrap_or_default();
        for entry in self.preparation_layouts.values() {
            ret.extend(entry.layout.floating_placeholders());
        }
        ret
    }

    pub fn is_empty(&self) -> bool {
        self.preparation_layouts.is_empty()
            && self.job_preparation_layouts.is_empty()
            && self.dilutions.is_empty()
            && self.intraplate.is_empty()
            && self.interplate.is_empty()
            && self.stock_requirements.is_empty()
    }

    pub fn job_preparation_plates(&self) -> Vec<IsoPlate> {
        self.job_preparation_markers()
            .into_iter()
            .filter_map(|marker| {
                let entry = self.job_preparation_layouts.get(&marker)?;
                Some(IsoPlate {
                    label: format!("{}_job_{}", self.plate_set_label, marker_label(&marker)),
                    reservoir: entry.specs.name.clone(),
                    marker,
                })
            })
            .collect()
    }

    fn aliquot_markers(&self) -> Vec<String> {
        (1..=self.number_aliquots).map(|n| format!("a#{n}")).collect()
    }

    /// Buffer worklists per plate (job preparation, preparation, aliquot),
    /// then transfer worklists in dilution order.
    pub fn create_worklist_series(&self) -> IsoResult<WorklistSeries> {
        let mut series = WorklistSeries::new();
        let mut registry = TransferRegistry::new();

        let mut plates = self.job_preparation_markers();
        plates.extend(self.preparation_markers());
        plates.extend(self.aliquot_markers());
        let other: Vec<String> = self
            .dilutions
            .keys()
            .filter(|m| !plates.contains(m))
            .cloned()
            .collect();
        plates.extend(other);
        for marker in &plates {
            let Some(steps) = self.dilutions.get(marker) else {
                continue;
            };
            let by_pipetting = steps
                .iter()
                .sorted_by(|a, b| a.pipetting.cmp(&b.pipetting))
                .chunk_by(|s| s.pipetting.clone());
            for (pipetting, group) in &by_pipetting {
                let label = format!(
                    "{}_{}_buffer_{}",
                    self.plate_set_label,
                    series.len() + 1,
                    marker_label(marker)
                );
                let mut worklist = PlannedWorklist::new(&label, TransferKind::SampleDilution, &pipetting, None, marker);
                for step in group {
                    registry.register(&step.transfer)?;
                    worklist.add_transfer(step.transfer.clone())?;
                }
                series.push(worklist);
            }
        }

        type Key<'a> = (u32, u32, (String, u32), (String, u32), TransferKind, &'a str, &'a str, &'a str);
        let mut groups: BTreeMap<Key, Vec<&PlannedTransfer>> = BTreeMap::new();
        for (marker, steps) in &self.intraplate {
            for s in steps {
                let key = (
                    s.step.rank,
                    s.ancestor_count,
                    marker_sort_key(marker),
                    marker_sort_key(marker),
                    s.step.transfer.kind(),
                    s.step.pipetting.as_str(),
                    marker.as_str(),
                    marker.as_str(),
                );
                groups.entry(key).or_default().push(&s.step.transfer);
            }
        }
        for ((source, target), steps) in &self.interplate {
            for s in steps {
                let key = (
                    s.rank,
                    0,
                    marker_sort_key(source),
                    marker_sort_key(target),
                    s.transfer.kind(),
                    s.pipetting.as_str(),
                    source.as_str(),
                    target.as_str(),
                );
                groups.entry(key).or_default().push(&s.transfer);
            }
        }
        for ((_, _, _, _, kind, pipetting, source, target), transfers) in groups {
            let label = format!(
                "{}_{}_{}_to_{}",
                self.plate_set_label,
                series.len() + 1,
                marker_label(source),
                marker_label(target)
            );
            let mut worklist = PlannedWorklist::new(&label, kind, pipetting, Some(source), target);
            for transfer in transfers {
                registry.register(transfer)?;
                worklist.add_transfer(transfer.clone())?;
            }
            series.push(worklist);
        }
        info!(
            worklists = series.len(),
            transfers = registry.len(),
            "worklist series created"
        );
        Ok(series)
    }

    fn plate_label(&self, iso_number: u32, marker: &str) -> String {
        format!("{}_{iso_number}_{}", self.plate_set_label, marker_label(marker))
    }

    /// Copies the planned layouts into ISOs, consuming floating candidates
    /// (or library plates) in order.
    pub fn create_isos(&self) -> IsoResult<Vec<PlannedIso>> {
        let aliquot_specs = self
            .aliquot_specs
            .as_ref()
            .ok_or_else(|| IsoError::programmer("Aliquot specs have not been set"))?;
        let aliquot_layout = self
            .aliquot_layout
            .as_ref()
            .ok_or_else(|| IsoError::programmer("The aliquot layout is missing"))?;
        let placeholders = self.floating_placeholders();
        let mut candidates = self.floating_candidates.iter();
        let mut library_plates = self.library_plates.as_ref().map(|p| p.iter());

        let mut isos = vec![];
        for index in 0..self.number_of_isos {
            let iso_number = index + 1;
            let library_plate = match library_plates.as_mut() {
                Some(plates) => match plates.next() {
                    Some(barcode) => Some(barcode.clone()),
                    None => break,
                },
                None => None,
            };

            let mut floating_tubes = BTreeMap::new();
            if library_plate.is_none() {
                let mut used = BTreeSet::new();
                for placeholder in &placeholders {
                    let Some(candidate) = candidates.next() else {
                        break;
                    };
                    if !used.insert(candidate.pool_id()) {
                        return Err(IsoError::consistency(format!(
                            "Pool {} would occur more than once in ISO {iso_number}",
                            candidate.pool_id()
                        )));
                    }
                    floating_tubes.insert(placeholder.clone(), candidate.clone());
                }
                if !placeholders.is_empty() && floating_tubes.is_empty() {
                    break;
                }
            }
            let fill = |pool: &PoolReference| -> Option<PoolReference> {
                match pool {
                    PoolReference::Floating(placeholder) => {
                        if library_plate.is_some() {
                            Some(PoolReference::Library)
                        } else {
                            floating_tubes
                                .get(placeholder)
                                .map(|t| PoolReference::Fixed(t.pool.clone()))
                        }
                    }
                    other => Some(other.clone()),
                }
            };

            let mut layout = TransfectionLayout::new(aliquot_layout.shape());
            for tp in aliquot_layout.working_positions() {
                if let Some(pool) = fill(&tp.pool) {
                    let mut copy = tp.clone();
                    copy.pool = pool;
                    layout.add_position(copy)?;
                }
            }
            layout.close();

            let mut preparation_layouts = BTreeMap::new();
            let mut preparation_plates = vec![];
            for marker in self.preparation_markers() {
                let Some(entry) = self.preparation_layouts.get(&marker) else {
                    continue;
                };
                let mut copy = PreparationLayout::new(entry.layout.shape());
                for pp in entry.layout.working_positions() {
                    if let Some(pool) = fill(&pp.pool) {
                        copy.add_position(PreparationPosition { pool, ..pp.clone() })?;
                    }
                }
                preparation_plates.push(IsoPlate {
                    label: self.plate_label(iso_number, &marker),
                    marker: marker.clone(),
                    reservoir: entry.specs.name.clone(),
                });
                preparation_layouts.insert(marker, copy);
            }

            let aliquot_plates = match &library_plate {
                Some(barcode) => vec![IsoPlate {
                    label: barcode.clone(),
                    marker: "a#1".to_string(),
                    reservoir: aliquot_specs.name.clone(),
                }],
                None => self
                    .aliquot_markers()
                    .into_iter()
                    .map(|marker| IsoPlate {
                        label: self.plate_label(iso_number, &marker),
                        marker,
                        reservoir: aliquot_specs.name.clone(),
                    })
                    .collect(),
            };
            let label = format!("{}_iso_{iso_number:02}", self.ticket_number);
            debug!(iso = %label, floatings = floating_tubes.len(), "ISO created");
            isos.push(PlannedIso {
                label,
                layout,
                aliquot_plates,
                preparation_plates,
                preparation_layouts,
                floating_tubes,
                library_plate,
            });
        }

        let produced = isos.len() as u32;
        if produced < self.number_of_isos {
            return Err(IsoError::resource(format!(
                "Only {produced} of {} ISOs could be generated.",
                self.number_of_isos
            )));
        }
        Ok(isos)
    }

    /// Positions of the aliquot layout by type.
    pub fn count_positions(&self, position_type: PositionType) -> usize {
        self.aliquot_layout
            .as_ref()
            .map_or(0, |l| l.working_positions().filter(|tp| tp.position_type() == position_type).count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SPECS;
    use crate::pool::MoleculeDesignPool;
    use crate::rack::SHAPE_96;
    use crate::specs::{PIPETTING_BIOMEK, STANDARD_96};
    use std::sync::Arc;

    fn pos(label: &str) -> RackPosition {
        RackPosition::from_label(label).unwrap()
    }

    fn floating(label: &str, placeholder: &str) -> TransfectionPosition {
        TransfectionPosition::new(pos(label), PoolReference::Floating(placeholder.to_string()))
            .with_iso_values(Some(10.0), Some(50.0))
    }

    fn candidate(barcode: &str, pool_id: u64) -> TubeCandidate {
        let pool = Arc::new(MoleculeDesignPool::new(pool_id, "SIRNA", 5e-5));
        TubeCandidate::new(barcode, pool, "R1", pos("A1"), 50.0)
    }

    fn builder(number_aliquots: u32) -> IsoBuilder {
        let mut builder = IsoBuilder::new("4711", "screen");
        builder.set_aliquot_specs(SPECS.reservoir(STANDARD_96).unwrap().clone(), number_aliquots);
        builder.add_aliquot_position(floating("A1", "md_001")).unwrap();
        builder.add_aliquot_position(floating("B1", "md_002")).unwrap();
        builder
    }

    #[test]
    fn test_create_isos_consumes_candidates_in_order() {
        let mut builder = builder(2);
        builder.set_floating_candidates(vec![candidate("t1", 1), candidate("t2", 2), candidate("t3", 3)]);
        builder.set_number_of_isos(2);
        let isos = builder.create_isos().unwrap();
        assert_eq!(isos.len(), 2);
        assert_eq!(isos[0].label, "4711_iso_01");
        assert_eq!(isos[0].floating_tubes["md_002"].tube_barcode, "t2");
        assert_eq!(
            isos[0].aliquot_plates.iter().map(|p| p.label.as_str()).collect::<Vec<_>>(),
            vec!["screen_1_a1", "screen_1_a2"]
        );
        // the last ISO gets the remaining candidate, its second well stays empty
        assert_eq!(isos[1].floating_tubes.len(), 1);
        assert_eq!(isos[1].layout.len(), 1);
        assert_eq!(
            isos[1].layout.get_working_position(&pos("A1")).unwrap().pool,
            PoolReference::Fixed(candidate("t3", 3).pool)
        );
    }

    #[test]
    fn test_create_isos_fails_when_candidates_run_out() {
        let mut builder = builder(1);
        builder.set_floating_candidates(vec![candidate("t1", 1), candidate("t2", 2)]);
        builder.set_number_of_isos(2);
        let err = builder.create_isos().unwrap_err();
        assert!(matches!(err, IsoError::Resource(_)));
    }

    #[test]
    fn test_candidate_reuse_within_iso_rejected() {
        let mut builder = builder(1);
        builder.set_floating_candidates(vec![candidate("t1", 1), candidate("t2", 1)]);
        builder.set_number_of_isos(1);
        assert!(matches!(builder.create_isos(), Err(IsoError::Consistency(_))));
    }

    #[test]
    fn test_library_plates() {
        let mut builder = builder(1);
        builder.set_library_plates(vec!["lib_01".to_string()]);
        builder.set_number_of_isos(1);
        let isos = builder.create_isos().unwrap();
        assert_eq!(isos[0].library_plate.as_deref(), Some("lib_01"));
        assert_eq!(isos[0].aliquot_plates[0].label, "lib_01");
        assert!(isos[0]
            .layout
            .working_positions()
            .all(|tp| tp.pool == PoolReference::Library));
    }

    #[test]
    fn test_worklist_series_order() {
        let mut builder = builder(1);
        let dilution = PlannedTransfer::dilution(9.0, pos("A1"), "buffer");
        builder
            .add_dilution(TransferStep::new(dilution.clone(), PIPETTING_BIOMEK, 0), "a#1")
            .unwrap();
        builder
            .add_dilution(TransferStep::new(dilution, PIPETTING_BIOMEK, 0), "p#1")
            .unwrap();
        let to_aliquot = PlannedTransfer::transfer(1.0, pos("A1"), pos("A1"));
        builder
            .add_interplate_transfer(TransferStep::new(to_aliquot.clone(), PIPETTING_BIOMEK, 2), "p#1", "a#1")
            .unwrap();
        builder
            .add_interplate_transfer(TransferStep::new(to_aliquot, PIPETTING_BIOMEK, 1), "s#1", "p#1")
            .unwrap();
        builder
            .add_intraplate_transfer(
                TransferStep::new(PlannedTransfer::transfer(1.0, pos("B1"), pos("A1")), PIPETTING_BIOMEK, 2),
                "p#1",
                1,
            )
            .unwrap();
        builder
            .add_preparation_layout("p#1", PreparationLayout::new(SHAPE_96), SPECS.reservoir(STANDARD_96).unwrap().clone())
            .unwrap();

        let series = builder.create_worklist_series().unwrap();
        let labels: Vec<&str> = series.iter().map(|(_, w)| w.label.as_str()).collect();
        assert_eq!(
            labels,
            vec![
                "screen_1_buffer_p1",
                "screen_2_buffer_a1",
                "screen_3_s1_to_p1",
                "screen_4_p1_to_a1",
                "screen_5_p1_to_p1",
            ]
        );
        assert_eq!(series.get(2).unwrap().source_marker.as_deref(), Some("s#1"));
        assert_eq!(series.get(0).unwrap().kind, TransferKind::SampleDilution);
    }

    #[test]
    fn test_dilution_kind_checked() {
        let mut builder = builder(1);
        let transfer = PlannedTransfer::transfer(1.0, pos("A1"), pos("A1"));
        assert!(builder
            .add_dilution(TransferStep::new(transfer, PIPETTING_BIOMEK, 1), "a#1")
            .is_err());
        assert!(builder.is_empty());
        assert_eq!(builder.count_positions(PositionType::Floating), 2);
    }
}
