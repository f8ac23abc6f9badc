//! Preparation route planning. Builds the dilution graph from stock tubes to
//! aliquot wells, picks a reservoir spec, places intermediates on plates and
//! emits the planned transfers into an [`IsoBuilder`].

use crate::config::PlannerConfig;
use crate::error::{IsoError, IsoResult};
use crate::iso_builder::{IsoBuilder, StockRequirement, TransferStep};
use crate::location::{
    ContainerGraph, ContainerId, ContainerLocation, CouplingKey, LocationContainer, PlanningContext,
};
use crate::plate::{RackPositionPlate, SectorPlate, assign_locations};
use crate::pool::{PoolContainer, PoolReference, PositionType};
use crate::preparation::{PreparationLayout, PreparationPosition, TransferTarget};
use crate::rack::{NUMBER_SECTORS, QuadrantTranslator, RackPosition, RackShape, SHAPE_96};
use crate::sector::RackSectorAssociation;
use crate::specs::{PIPETTING_BIOMEK, PIPETTING_CYBIO, PIPETTING_MANUAL, PipettingSpecs, ReservoirSpecs, SpecsCatalog};
use crate::transfection::TransfectionLayout;
use crate::transfer::{DEFAULT_DILUENT, PlannedTransfer};
use crate::units::{are_equal_values, is_larger_than, is_smaller_than, round_up};
use isoplan_protocol::ExperimentScenario;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

pub const ALIQUOT_ROLE: &str = "a";
pub const PREPARATION_ROLE: &str = "p";
pub const JOB_PREPARATION_ROLE: &str = "jp";
pub const STOCK_ROLE: &str = "s";

const MAX_CHAIN_LENGTH: usize = 16;

pub fn plate_marker(role: &str, number: usize) -> String {
    format!("{role}#{number}")
}

/// "a#1" .. "a#n"
pub fn aliquot_markers(count: u32) -> Vec<String> {
    (1..=count.max(1) as usize)
        .map(|n| plate_marker(ALIQUOT_ROLE, n))
        .collect()
}

/// Hands out plate markers per role: "s#1", "s#2", "p#1", ...
#[derive(Debug, Default)]
pub struct MarkerCounter {
    counts: BTreeMap<String, usize>,
}

impl MarkerCounter {
    pub fn next(&mut self, role: &str) -> String {
        let count = self.counts.entry(role.to_string()).or_insert(0);
        *count += 1;
        plate_marker(role, *count)
    }

    pub fn issued(&self, role: &str) -> usize {
        self.counts.get(role).copied().unwrap_or(0)
    }
}

pub struct PlanningRequest<'a> {
    pub layout: &'a TransfectionLayout,
    pub scenario: ExperimentScenario,
    pub association: Option<&'a RackSectorAssociation>,
    pub number_aliquots: u32,
    /// ISOs served by one job; job preparation plates are sized for all of them.
    pub isos_per_job: u32,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct PlanSummary {
    /// Chosen reservoir spec per planner ("sector" / "rack position").
    pub reservoirs: BTreeMap<String, String>,
    pub intermediates: usize,
    pub preparation_plates: usize,
    pub job_preparation_plates: usize,
    pub stock_racks: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PlannerKind {
    Sector,
    RackPosition,
}

impl PlannerKind {
    fn name(self) -> &'static str {
        match self {
            Self::Sector => "sector",
            Self::RackPosition => "rack position",
        }
    }
}

/// Requested containers that may share intermediates, plus the stock rack
/// feeding them.
#[derive(Clone, Debug)]
struct CoupledSet {
    key: CouplingKey,
    stock_concentration: f64,
    /// Pools by stock rack position. Sector sets hold one pool per
    /// 96-well position; rack sets hold exactly one.
    pools: BTreeMap<RackPosition, PoolReference>,
    stock_marker: String,
    job_level: bool,
    intermediates: Vec<ContainerId>,
}

#[derive(Clone, Debug)]
struct PlannerRun {
    kind: PlannerKind,
    pipetting: PipettingSpecs,
    graph: ContainerGraph,
    sets: Vec<CoupledSet>,
}

impl PlannerRun {
    fn new(kind: PlannerKind, pipetting: &PipettingSpecs) -> Self {
        Self {
            kind,
            pipetting: pipetting.clone(),
            graph: ContainerGraph::new(pipetting.min_transfer_volume),
            sets: vec![],
        }
    }

    fn set_for(&self, key: &CouplingKey) -> IsoResult<&CoupledSet> {
        self.sets
            .iter()
            .find(|s| &s.key == key)
            .ok_or_else(|| IsoError::programmer(format!("No coupled set for {key:?}")))
    }

    /// One dilution step from `source_concentration` into `child` is
    /// possible with the current volumes. Mutable containers can always
    /// grow, so only the dilution factor limits them.
    fn step_feasible(&self, child: ContainerId, source_concentration: f64) -> IsoResult<bool> {
        let c = self.graph.get(child)?;
        let factor = source_concentration / c.target_concentration;
        if is_smaller_than(factor, 1.0) || is_larger_than(factor, self.pipetting.max_dilution_factor) {
            return Ok(false);
        }
        if c.is_mutable() {
            return Ok(true);
        }
        let full = self.graph.full_volume(child)?;
        let transfer = full / factor;
        let buffer = full - transfer;
        let min = self.pipetting.min_transfer_volume;
        Ok(!is_smaller_than(transfer, min) && (are_equal_values(buffer, 0.0) || !is_smaller_than(buffer, min)))
    }

    /// Concentration for a new intermediate above `child`: the lowest one
    /// the stock reaches in one step, else the highest the child accepts.
    fn intermediate_concentration(&self, child: ContainerId, stock_concentration: f64) -> IsoResult<f64> {
        let c = self.graph.get(child)?;
        let target = c.target_concentration;
        let max_factor = self.pipetting.max_dilution_factor;
        let min = self.pipetting.min_transfer_volume;
        let full = self.graph.full_volume(child)?;

        let mut upper = stock_concentration.min(target * max_factor);
        let lower = if c.is_mutable() {
            target
        } else {
            upper = upper.min(full * target / min);
            if is_larger_than(full, min) {
                target * full / (full - min)
            } else {
                f64::INFINITY
            }
        };
        let wanted = lower.max(stock_concentration / max_factor);
        let concentration = if !is_larger_than(wanted, upper) {
            round_up(wanted, 1).min(upper)
        } else {
            let floored = (upper * 10.0).floor() / 10.0;
            if !is_smaller_than(floored, lower) { floored } else { upper }
        };
        let usable = is_larger_than(concentration, target)
            && !is_smaller_than(concentration, lower)
            && !is_larger_than(concentration, stock_concentration);
        if usable {
            return Ok(concentration);
        }
        // the child takes its whole volume from an intermediate of equal
        // concentration
        if !c.is_mutable() && !is_smaller_than(full, min) && is_smaller_than(target, stock_concentration) {
            return Ok(target);
        }
        Err(IsoError::planning(format!(
            "Unable to find a dilution path to {target} nM (volume {} µL) with the {} pipetting specs",
            round_up(full, 1),
            self.pipetting.name
        )))
    }

    fn link_requested(
        &mut self,
        ctx: &mut PlanningContext,
        child: ContainerId,
        set_index: usize,
        preferred_parent: Option<ContainerId>,
    ) -> IsoResult<()> {
        if let Some(parent) = preferred_parent {
            let concentration = self.graph.get(parent)?.target_concentration;
            if self.step_feasible(child, concentration)? {
                self.graph.set_parent_container(child, parent)?;
                return Ok(());
            }
        }
        self.plan_upwards(ctx, child, set_index)
    }

    /// Walks up from `child` until a container is fed by the stock or by
    /// an existing intermediate, creating intermediates as needed.
    fn plan_upwards(&mut self, ctx: &mut PlanningContext, child: ContainerId, set_index: usize) -> IsoResult<()> {
        let stock = self.sets[set_index].stock_concentration;
        let mut current = child;
        for _ in 0..MAX_CHAIN_LENGTH {
            if self.step_feasible(current, stock)? {
                self.graph.set_stock_parent(current, stock)?;
                return Ok(());
            }
            let mut candidates = vec![];
            for id in &self.sets[set_index].intermediates {
                candidates.push((self.graph.get(*id)?.target_concentration, *id));
            }
            candidates.sort_by(|a, b| a.0.total_cmp(&b.0));
            for (concentration, candidate) in candidates {
                if candidate == current || self.graph.is_ancestor(current, candidate)? {
                    continue;
                }
                if self.step_feasible(current, concentration)? {
                    self.graph.set_parent_container(current, candidate)?;
                    return Ok(());
                }
            }
            let concentration = self.intermediate_concentration(current, stock)?;
            let id = ctx.next_container_id()?;
            let preferred = match self.kind {
                PlannerKind::Sector => self.graph.get(current)?.preferred_location,
                PlannerKind::RackPosition => None,
            };
            let key = self.sets[set_index].key.clone();
            self.graph
                .insert(LocationContainer::new_preparation(id, key, concentration, stock, preferred));
            self.graph.set_parent_container(current, id)?;
            self.sets[set_index].intermediates.push(id);
            debug!(
                planner = self.kind.name(),
                container = %id,
                child = %current,
                concentration,
                "created intermediate"
            );
            current = id;
        }
        Err(IsoError::planning(format!(
            "The dilution series for container {child} needs more than {MAX_CHAIN_LENGTH} steps"
        )))
    }

    fn dead_volume(&self, reservoir: &ReservoirSpecs, outgoing: u32, step: f64) -> f64 {
        if self.pipetting.has_dynamic_dead_volume {
            let extra = outgoing.saturating_sub(1) as f64 * step;
            (reservoir.min_dead_volume + extra).min(reservoir.max_dead_volume)
        } else {
            reservoir.min_dead_volume
        }
    }

    /// Applies dead volumes for `reservoir`, grows containers to the
    /// transfer minimum and checks every step against the robot and plate
    /// limits.
    fn finalize(&mut self, reservoir: &ReservoirSpecs, aliquot: &ReservoirSpecs, config: &PlannerConfig) -> IsoResult<()> {
        for id in self.graph.intermediate_ids() {
            let outgoing = self.graph.get(id)?.outgoing_transfer_count();
            let dead = self.dead_volume(reservoir, outgoing, config.dynamic_dead_volume_step_ul);
            self.graph.get_mut(id)?.dead_volume = dead;
        }
        for id in self.graph.requested_ids() {
            let c = self.graph.get_mut(id)?;
            c.dead_volume = if c.children.is_empty() { 0.0 } else { aliquot.min_dead_volume };
        }
        self.graph.recalculate()?;
        self.graph.grow_to_transfer_minimum()?;
        self.graph.recalculate()?;
        self.validate(reservoir, aliquot)
    }

    fn check_step(&self, description: &str, volume: f64, factor: f64) -> IsoResult<()> {
        let specs = &self.pipetting;
        if is_smaller_than(factor, 1.0) || is_larger_than(factor, specs.max_dilution_factor) {
            return Err(IsoError::planning(format!(
                "Dilution factor {} of {description} is outside 1..{} ({})",
                round_up(factor, 1),
                specs.max_dilution_factor,
                specs.name
            )));
        }
        if is_smaller_than(volume, specs.min_transfer_volume) || is_larger_than(volume, specs.max_transfer_volume) {
            return Err(IsoError::planning(format!(
                "Transfer volume {} µL of {description} is outside {}..{} µL ({})",
                round_up(volume, 1),
                specs.min_transfer_volume,
                specs.max_transfer_volume,
                specs.name
            )));
        }
        Ok(())
    }

    fn validate(&self, reservoir: &ReservoirSpecs, aliquot: &ReservoirSpecs) -> IsoResult<()> {
        let min = self.pipetting.min_transfer_volume;
        for c in self.graph.containers() {
            for (child_id, edge) in &c.children {
                let child = self.graph.get(*child_id)?;
                self.check_step(
                    &format!("{} -> {child_id}", c.id),
                    edge.volume,
                    c.target_concentration / child.target_concentration,
                )?;
            }
            if c.parent.is_none() {
                self.check_step(
                    &format!("stock -> {}", c.id),
                    self.graph.stock_transfer_volume(c.id)?,
                    c.parent_concentration / c.target_concentration,
                )?;
            }
            if c.is_requested() {
                let buffer = self.graph.buffer_volume(c.id)?;
                if !are_equal_values(buffer, 0.0) && is_smaller_than(buffer, min) {
                    return Err(IsoError::planning(format!(
                        "Buffer volume {} µL for {} is below the minimum transfer volume",
                        round_up(buffer, 1),
                        c.id
                    )));
                }
                let full = self.graph.full_volume(c.id)?;
                if is_larger_than(full, aliquot.max_volume) {
                    return Err(IsoError::planning(format!(
                        "Aliquot volume {} µL exceeds the maximum volume of {} ({} µL)",
                        round_up(full, 1),
                        aliquot.name,
                        aliquot.max_volume
                    )));
                }
            }
        }
        if !self.graph.intermediate_ids().is_empty() {
            let max = self.graph.max_preparation_volume()?;
            if is_larger_than(max, reservoir.max_volume) {
                return Err(IsoError::planning(format!(
                    "Preparation volume {} µL exceeds the maximum volume of {} ({} µL)",
                    round_up(max, 1),
                    reservoir.name,
                    reservoir.max_volume
                )));
            }
        }
        Ok(())
    }

    fn is_job_container(&self, id: ContainerId) -> IsoResult<bool> {
        let key = &self.graph.get(id)?.coupling;
        Ok(self.set_for(key)?.job_level)
    }

    /// Intermediates split into (job level, ISO level), closest to the
    /// aliquots first.
    fn intermediates_by_generation(&self) -> IsoResult<(Vec<ContainerId>, Vec<ContainerId>)> {
        let mut ordered = vec![];
        for id in self.graph.intermediate_ids() {
            ordered.push((self.graph.generation(id)?, id));
        }
        ordered.sort();
        let mut job = vec![];
        let mut iso = vec![];
        for (_, id) in ordered {
            if self.is_job_container(id)? {
                job.push(id);
            } else {
                iso.push(id);
            }
        }
        Ok((job, iso))
    }

    fn plate_count(&self, reservoir: &ReservoirSpecs) -> IsoResult<usize> {
        let (job, iso) = self.intermediates_by_generation()?;
        let per_plate = match self.kind {
            PlannerKind::Sector => SectorPlate::number_locations(&reservoir.shape),
            PlannerKind::RackPosition => reservoir.shape.size(),
        };
        Ok(job.len().div_ceil(per_plate) + iso.len().div_ceil(per_plate))
    }
}

pub struct PreparationPlanner<'a> {
    config: &'a PlannerConfig,
    catalog: &'a SpecsCatalog,
}

impl<'a> PreparationPlanner<'a> {
    pub fn new(config: &'a PlannerConfig, catalog: &'a SpecsCatalog) -> Self {
        Self { config, catalog }
    }

    fn pipetting(&self, name: &str) -> IsoResult<&'a PipettingSpecs> {
        self.catalog
            .pipetting(name)
            .ok_or_else(|| IsoError::programmer(format!("Unknown pipetting specs {name}")))
    }

    pub fn aliquot_specs(&self, shape: RackShape) -> IsoResult<ReservoirSpecs> {
        let name = if shape.is_384() {
            &self.config.aliquot_reservoir_384
        } else {
            &self.config.aliquot_reservoir_96
        };
        self.catalog
            .reservoir(name)
            .cloned()
            .ok_or_else(|| IsoError::planning(format!("Unknown aliquot reservoir spec {name}")))
    }

    /// Plans all transfers of one ISO request into `builder`. The context
    /// must be inside a planning pass.
    pub fn plan(
        &self,
        ctx: &mut PlanningContext,
        request: &PlanningRequest,
        builder: &mut IsoBuilder,
    ) -> IsoResult<PlanSummary> {
        let layout = request.layout;
        let aliquot = self.aliquot_specs(layout.shape())?;
        builder.set_aliquot_specs(aliquot.clone(), request.number_aliquots);
        for tp in layout.working_positions() {
            builder.add_aliquot_position(tp.clone())?;
        }

        let mut markers = MarkerCounter::default();
        let mut summary = PlanSummary::default();
        let use_sector_planner = request.scenario == ExperimentScenario::Screening && layout.has_floatings();
        let plan_floatings = request.scenario != ExperimentScenario::Library;

        let mut runs = vec![];
        if let (true, Some(association)) = (use_sector_planner, request.association) {
            if let Some(run) = self.build_sector_run(ctx, request, association, &mut markers)? {
                runs.push(run);
            }
        }
        let floatings_by_rack = plan_floatings && !(use_sector_planner && request.association.is_some());
        if let Some(run) = self.build_rack_run(ctx, request, floatings_by_rack, &mut markers)? {
            runs.push(run);
        }

        for run in runs {
            let (run, reservoir) = self.choose_reservoir(run, &aliquot)?;
            summary
                .reservoirs
                .insert(run.kind.name().to_string(), reservoir.name.clone());
            self.place_and_emit(run, &reservoir, &aliquot, request, &mut markers, builder, &mut summary)?;
        }
        self.emit_mock_dilutions(request, builder)?;
        summary.stock_racks = markers.issued(STOCK_ROLE);
        info!(
            intermediates = summary.intermediates,
            preparation_plates = summary.preparation_plates,
            job_preparation_plates = summary.job_preparation_plates,
            stock_racks = summary.stock_racks,
            "preparation route planned"
        );
        Ok(summary)
    }

    fn build_sector_run(
        &self,
        ctx: &mut PlanningContext,
        request: &PlanningRequest,
        association: &RackSectorAssociation,
        markers: &mut MarkerCounter,
    ) -> IsoResult<Option<PlannerRun>> {
        let mut by_sector: BTreeMap<u8, BTreeMap<RackPosition, PoolReference>> = BTreeMap::new();
        for tp in request.layout.working_positions().filter(|tp| tp.is_floating()) {
            by_sector
                .entry(QuadrantTranslator::sector_index(&tp.rack_position))
                .or_default()
                .insert(QuadrantTranslator::to_96(&tp.rack_position), tp.pool.clone());
        }
        if by_sector.is_empty() {
            return Ok(None);
        }
        let mut run = PlannerRun::new(PlannerKind::Sector, self.pipetting(PIPETTING_CYBIO)?);
        let stock = self.config.floating_stock_concentration_nm;

        let mut groups: Vec<Vec<u8>> = association
            .associated_sectors
            .iter()
            .map(|group| group.iter().copied().filter(|s| by_sector.contains_key(s)).collect())
            .collect();
        let grouped: BTreeSet<u8> = groups.iter().flatten().copied().collect();
        groups.extend(by_sector.keys().filter(|s| !grouped.contains(s)).map(|s| vec![*s]));

        for group in groups {
            // sectors only share intermediates if they hold the same pools
            let coupled = group.windows(2).all(|w| by_sector.get(&w[0]) == by_sector.get(&w[1]));
            let subsets: Vec<Vec<u8>> = if coupled {
                vec![group]
            } else {
                group.into_iter().map(|s| vec![s]).collect()
            };
            for subset in subsets.into_iter().filter(|s| !s.is_empty()) {
                let key = CouplingKey::SectorSet(run.sets.len());
                let pools = by_sector.get(&subset[0]).cloned().unwrap_or_default();
                run.sets.push(CoupledSet {
                    key: key.clone(),
                    stock_concentration: stock,
                    pools,
                    stock_marker: markers.next(STOCK_ROLE),
                    job_level: false,
                    intermediates: vec![],
                });
                let set_index = run.sets.len() - 1;

                let mut requested: Vec<(f64, u8, ContainerId)> = vec![];
                for sector in &subset {
                    let concentration = association.iso_concentrations.get(sector).copied().flatten();
                    let volume = association.sector_volumes.get(sector).copied().flatten();
                    let (Some(concentration), Some(volume)) = (concentration, volume) else {
                        return Err(IsoError::consistency(format!(
                            "Sector {sector} lacks an ISO volume or concentration"
                        )));
                    };
                    let id = ctx.next_container_id()?;
                    let mut container = LocationContainer::new_requested(
                        id,
                        key.clone(),
                        ContainerLocation::Sector(*sector),
                        volume,
                        concentration,
                        stock,
                        request.number_aliquots,
                    );
                    container.plate_marker = Some(plate_marker(ALIQUOT_ROLE, 1));
                    run.graph.insert(container);
                    requested.push((concentration, *sector, id));
                }
                requested.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)));
                let ids: BTreeMap<u8, ContainerId> = requested.iter().map(|(_, s, id)| (*s, *id)).collect();
                for (_, sector, id) in &requested {
                    let parent = if coupled {
                        association
                            .parent_sectors
                            .get(sector)
                            .copied()
                            .flatten()
                            .and_then(|p| ids.get(&p).copied())
                    } else {
                        None
                    };
                    run.link_requested(ctx, *id, set_index, parent)?;
                }
            }
        }
        debug!(sets = run.sets.len(), containers = run.graph.len(), "sector planner built");
        Ok(Some(run))
    }

    fn build_rack_run(
        &self,
        ctx: &mut PlanningContext,
        request: &PlanningRequest,
        include_floatings: bool,
        markers: &mut MarkerCounter,
    ) -> IsoResult<Option<PlannerRun>> {
        let layout = request.layout;
        let positions: Vec<(&RackPosition, &PoolReference)> = layout
            .working_positions()
            .filter(|tp| tp.is_fixed() || (include_floatings && tp.is_floating()))
            .map(|tp| (&tp.rack_position, &tp.pool))
            .collect();
        let pool_containers = PoolContainer::collect(positions, self.config.floating_stock_concentration_nm);
        if pool_containers.is_empty() {
            return Ok(None);
        }
        let pipetting = if request.scenario == ExperimentScenario::Manual {
            self.pipetting(PIPETTING_MANUAL)?
        } else {
            self.pipetting(PIPETTING_BIOMEK)?
        };
        let mut run = PlannerRun::new(PlannerKind::RackPosition, pipetting);
        let has_floatings = layout.has_floatings();
        let stock_positions: Vec<RackPosition> = SHAPE_96.positions().collect();
        let mut stock_marker = String::new();

        for (index, pc) in pool_containers.into_iter().enumerate() {
            let slot = index % stock_positions.len();
            if slot == 0 {
                stock_marker = markers.next(STOCK_ROLE);
            }
            let job_level = pc.position_type == PositionType::Fixed && has_floatings;
            let copies = if job_level {
                request.number_aliquots.max(1) * request.isos_per_job.max(1)
            } else {
                request.number_aliquots
            };
            let key = CouplingKey::Pool(pc.key.clone());
            run.sets.push(CoupledSet {
                key: key.clone(),
                stock_concentration: pc.stock_concentration_nm,
                pools: [(stock_positions[slot], pc.pool.clone())].into_iter().collect(),
                stock_marker: stock_marker.clone(),
                job_level,
                intermediates: vec![],
            });
            let set_index = run.sets.len() - 1;

            let mut requested: Vec<(f64, ContainerId)> = vec![];
            for position in &pc.positions {
                let Some(tp) = layout.get_working_position(position) else {
                    continue;
                };
                let (Some(volume), Some(concentration)) = (tp.iso_volume, tp.iso_concentration) else {
                    return Err(IsoError::consistency(format!(
                        "Position {position} lacks an ISO volume or concentration"
                    )));
                };
                let id = ctx.next_container_id()?;
                let mut container = LocationContainer::new_requested(
                    id,
                    key.clone(),
                    ContainerLocation::Position(*position),
                    volume,
                    concentration,
                    pc.stock_concentration_nm,
                    copies,
                );
                container.plate_marker = Some(plate_marker(ALIQUOT_ROLE, 1));
                run.graph.insert(container);
                requested.push((concentration, id));
            }
            requested.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)));
            for (_, id) in requested {
                run.link_requested(ctx, id, set_index, None)?;
            }
        }
        debug!(sets = run.sets.len(), containers = run.graph.len(), "rack position planner built");
        Ok(Some(run))
    }

    /// Tries every reservoir spec in preference order on a copy of the
    /// graph; fewest plates wins, ties go to the earlier spec.
    fn choose_reservoir(&self, run: PlannerRun, aliquot: &ReservoirSpecs) -> IsoResult<(PlannerRun, ReservoirSpecs)> {
        let mut best: Option<(usize, PlannerRun, ReservoirSpecs)> = None;
        let mut last_error = String::new();
        for name in &self.config.reservoir_preference {
            let reservoir = self
                .catalog
                .reservoir(name)
                .ok_or_else(|| IsoError::planning(format!("Unknown reservoir spec {name}")))?;
            let mut candidate = run.clone();
            match candidate.finalize(reservoir, aliquot, self.config) {
                Ok(()) => {
                    let plates = candidate.plate_count(reservoir)?;
                    debug!(planner = run.kind.name(), reservoir = %name, plates, "reservoir spec feasible");
                    if best.as_ref().is_none_or(|(p, _, _)| plates < *p) {
                        best = Some((plates, candidate, reservoir.clone()));
                    }
                }
                Err(IsoError::Planning(message)) => {
                    debug!(planner = run.kind.name(), reservoir = %name, %message, "reservoir spec rejected");
                    last_error = message;
                }
                Err(other) => return Err(other),
            }
        }
        match best {
            Some((_, run, reservoir)) => {
                info!(planner = run.kind.name(), reservoir = %reservoir.name, "reservoir spec chosen");
                Ok((run, reservoir))
            }
            None => Err(IsoError::planning(format!(
                "None of the reservoir specs can be used for the {} preparation. {last_error}",
                run.kind.name()
            ))),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn place_and_emit(
        &self,
        mut run: PlannerRun,
        reservoir: &ReservoirSpecs,
        aliquot: &ReservoirSpecs,
        request: &PlanningRequest,
        markers: &mut MarkerCounter,
        builder: &mut IsoBuilder,
        summary: &mut PlanSummary,
    ) -> IsoResult<()> {
        let (job_ids, iso_ids) = run.intermediates_by_generation()?;
        let per_plate = match run.kind {
            PlannerKind::Sector => SectorPlate::number_locations(&reservoir.shape),
            PlannerKind::RackPosition => reservoir.shape.size(),
        };
        let mut job_markers = vec![];
        let mut iso_markers = vec![];
        for (ids, role, plate_markers) in [
            (&job_ids, JOB_PREPARATION_ROLE, &mut job_markers),
            (&iso_ids, PREPARATION_ROLE, &mut iso_markers),
        ] {
            let count = ids.len().div_ceil(per_plate);
            plate_markers.extend((0..count).map(|_| markers.next(role)));
            match run.kind {
                PlannerKind::Sector => {
                    let mut plates: Vec<SectorPlate> =
                        plate_markers.iter().map(|m| SectorPlate::new(m, reservoir)).collect();
                    assign_locations(&mut plates, &mut run.graph, ids)?;
                }
                PlannerKind::RackPosition => {
                    let mut plates: Vec<RackPositionPlate> =
                        plate_markers.iter().map(|m| RackPositionPlate::new(m, reservoir)).collect();
                    assign_locations(&mut plates, &mut run.graph, ids)?;
                }
            }
        }
        summary.intermediates += job_ids.len() + iso_ids.len();
        summary.job_preparation_plates += job_markers.len();
        summary.preparation_plates += iso_markers.len();

        let emitter = Emitter {
            run: &run,
            reservoir,
            aliquot,
            number_aliquots: request.number_aliquots,
        };
        for marker in &job_markers {
            builder.add_job_preparation_layout(marker, emitter.preparation_layout(marker)?, reservoir.clone())?;
        }
        for marker in &iso_markers {
            builder.add_preparation_layout(marker, emitter.preparation_layout(marker)?, reservoir.clone())?;
        }
        for id in run.graph.ids() {
            emitter.emit_container(id, builder)?;
        }
        for requirement in emitter.stock_requirements()? {
            builder.add_stock_requirement(requirement);
        }
        Ok(())
    }

    /// Mock wells receive buffer only.
    fn emit_mock_dilutions(&self, request: &PlanningRequest, builder: &mut IsoBuilder) -> IsoResult<()> {
        let pipetting = if request.scenario == ExperimentScenario::Manual {
            PIPETTING_MANUAL
        } else {
            PIPETTING_BIOMEK
        };
        for tp in request.layout.working_positions().filter(|tp| tp.is_mock()) {
            let Some(volume) = tp.iso_volume else {
                continue;
            };
            for marker in aliquot_markers(request.number_aliquots) {
                let transfer = PlannedTransfer::dilution(volume, tp.rack_position, DEFAULT_DILUENT);
                builder.add_dilution(TransferStep::new(transfer, pipetting, 0), &marker)?;
            }
        }
        Ok(())
    }
}

/// Turns a placed planner run into layouts and planned transfers.
struct Emitter<'r> {
    run: &'r PlannerRun,
    reservoir: &'r ReservoirSpecs,
    aliquot: &'r ReservoirSpecs,
    number_aliquots: u32,
}

impl Emitter<'_> {
    fn markers(&self, c: &LocationContainer) -> IsoResult<Vec<String>> {
        if c.is_requested() {
            return Ok(aliquot_markers(c.copies.min(self.number_aliquots.max(1))));
        }
        let marker = c
            .plate_marker
            .clone()
            .ok_or_else(|| IsoError::programmer(format!("Container {} has not been placed", c.id)))?;
        Ok(vec![marker])
    }

    fn plate_shape(&self, c: &LocationContainer) -> RackShape {
        if c.is_requested() {
            self.aliquot.shape
        } else {
            self.reservoir.shape
        }
    }

    /// The well of `c` holding the pool stored at `stock_position`.
    fn well(&self, c: &LocationContainer, stock_position: &RackPosition) -> IsoResult<RackPosition> {
        match c.location {
            Some(ContainerLocation::Position(p)) => Ok(p),
            Some(ContainerLocation::Sector(sector)) => {
                if self.plate_shape(c).is_384() {
                    Ok(QuadrantTranslator::to_384(stock_position, sector))
                } else {
                    Ok(*stock_position)
                }
            }
            None => Err(IsoError::programmer(format!("Container {} has no location", c.id))),
        }
    }

    fn sector_of(&self, c: &LocationContainer) -> u8 {
        match c.location {
            Some(ContainerLocation::Sector(sector)) if self.plate_shape(c).is_384() => sector,
            _ => 0,
        }
    }

    fn preparation_layout(&self, marker: &str) -> IsoResult<PreparationLayout> {
        let mut layout = PreparationLayout::new(self.reservoir.shape);
        for c in self.run.graph.containers() {
            if c.is_requested() || c.plate_marker.as_deref() != Some(marker) {
                continue;
            }
            let set = self.run.set_for(&c.coupling)?;
            let full = self.run.graph.full_volume(c.id)?;
            for (stock_position, pool) in &set.pools {
                let mut position = PreparationPosition::new(
                    self.well(c, stock_position)?,
                    pool.clone(),
                    c.target_concentration,
                    round_up(full, 1),
                );
                for child_id in c.children.keys() {
                    let child = self.run.graph.get(*child_id)?;
                    let well = self.well(child, stock_position)?;
                    for child_marker in self.markers(child)? {
                        position
                            .transfer_targets
                            .insert(TransferTarget::new(well, &child_marker));
                    }
                }
                layout.add_position(position)?;
            }
        }
        Ok(layout)
    }

    fn emit_container(&self, id: ContainerId, builder: &mut IsoBuilder) -> IsoResult<()> {
        let graph = &self.run.graph;
        let c = graph.get(id)?;
        let set = self.run.set_for(&c.coupling)?;
        let pipetting = self.run.pipetting.name.as_str();
        let targets = self.markers(c)?;

        let buffer = graph.buffer_volume(id)?;
        if is_larger_than(buffer, 0.0) {
            for marker in &targets {
                for stock_position in set.pools.keys() {
                    let transfer = PlannedTransfer::dilution(buffer, self.well(c, stock_position)?, DEFAULT_DILUENT);
                    builder.add_dilution(TransferStep::new(transfer, pipetting, 0), marker)?;
                }
            }
        }

        let volume = graph.incoming_transfer_volume(id)?;
        let rank = graph.depth(id)? + 1;
        let (sources, source) = match c.parent {
            Some(parent) => {
                let p = graph.get(parent)?;
                (self.markers(p)?, Some(p))
            }
            None => (vec![set.stock_marker.clone()], None),
        };
        let pairs: Vec<(String, String)> = if sources.len() == targets.len() {
            sources.into_iter().zip(targets.iter().cloned()).collect()
        } else if let [single] = sources.as_slice() {
            targets.iter().map(|t| (single.clone(), t.clone())).collect()
        } else {
            return Err(IsoError::programmer(format!(
                "Cannot pair {} source plates with {} target plates for {id}",
                sources.len(),
                targets.len()
            )));
        };

        let mut transfers = vec![];
        match self.run.kind {
            PlannerKind::Sector => {
                let source_is_384 = source.is_some_and(|p| self.plate_shape(p).is_384());
                let number_sectors = if source_is_384 || self.plate_shape(c).is_384() {
                    NUMBER_SECTORS
                } else {
                    1
                };
                let source_sector = source.map_or(0, |p| self.sector_of(p));
                transfers.push(PlannedTransfer::rack_transfer(
                    volume,
                    number_sectors,
                    source_sector,
                    self.sector_of(c),
                ));
            }
            PlannerKind::RackPosition => {
                for stock_position in set.pools.keys() {
                    let source_position = match source {
                        Some(p) => self.well(p, stock_position)?,
                        None => *stock_position,
                    };
                    transfers.push(PlannedTransfer::transfer(
                        volume,
                        source_position,
                        self.well(c, stock_position)?,
                    ));
                }
            }
        }
        let ancestor_count = graph.intraplate_ancestor_count(id)?;
        for (source_marker, target_marker) in pairs {
            for transfer in &transfers {
                let step = TransferStep::new(transfer.clone(), pipetting, rank);
                if source_marker == target_marker {
                    builder.add_intraplate_transfer(step, &target_marker, ancestor_count)?;
                } else {
                    builder.add_interplate_transfer(step, &source_marker, &target_marker)?;
                }
            }
        }
        Ok(())
    }

    /// Stock volume per pool: one requirement per stock rack position.
    fn stock_requirements(&self) -> IsoResult<Vec<StockRequirement>> {
        let graph = &self.run.graph;
        let mut volumes: BTreeMap<usize, f64> = BTreeMap::new();
        for root in graph.roots() {
            let key = &graph.get(root)?.coupling;
            let Some(index) = self.run.sets.iter().position(|s| &s.key == key) else {
                return Err(IsoError::programmer(format!("No coupled set for {key:?}")));
            };
            *volumes.entry(index).or_insert(0.0) += graph.starting_volume(root)?;
        }
        let mut ret = vec![];
        for (index, volume) in volumes {
            let set = &self.run.sets[index];
            for (position, pool) in &set.pools {
                ret.push(StockRequirement {
                    pool: pool.clone(),
                    stock_marker: set.stock_marker.clone(),
                    position: *position,
                    volume: round_up(volume, 1),
                    stock_concentration: set.stock_concentration,
                    job_level: set.job_level,
                });
            }
        }
        Ok(ret)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SPECS;
    use crate::pool::MoleculeDesignPool;
    use crate::rack::{SHAPE_384, SHAPE_96};
    use crate::specs::{DEEP_96, STANDARD_384, STANDARD_96};
    use crate::transfection::TransfectionPosition;
    use crate::transfer::TransferKind;
    use std::sync::Arc;

    fn pos(label: &str) -> RackPosition {
        RackPosition::from_label(label).unwrap()
    }

    fn fixed(label: &str, stock_molar: f64, volume: f64, concentration: f64) -> TransfectionPosition {
        let pool = Arc::new(MoleculeDesignPool::new(205200, "SIRNA", stock_molar));
        TransfectionPosition::new(pos(label), PoolReference::Fixed(pool))
            .with_iso_values(Some(volume), Some(concentration))
    }

    fn plan(layout: &TransfectionLayout, scenario: ExperimentScenario) -> (IsoBuilder, PlanSummary) {
        let config = PlannerConfig::default();
        let planner = PreparationPlanner::new(&config, &SPECS);
        let mut ctx = PlanningContext::new();
        ctx.begin_pass();
        let mut builder = IsoBuilder::new("123", "test");
        let request = PlanningRequest {
            layout,
            scenario,
            association: None,
            number_aliquots: 1,
            isos_per_job: 1,
        };
        let summary = planner.plan(&mut ctx, &request, &mut builder).unwrap();
        ctx.end_pass();
        (builder, summary)
    }

    #[test]
    fn test_direct_stock_transfer() {
        let mut layout = TransfectionLayout::new(SHAPE_96);
        layout.add_position(fixed("A1", 5e-7, 10.0, 50.0)).unwrap();
        layout.close();
        let (builder, summary) = plan(&layout, ExperimentScenario::Optimisation);
        assert_eq!(summary.intermediates, 0);
        assert_eq!(summary.preparation_plates, 0);
        let dilutions = builder.dilutions("a#1");
        assert_eq!(dilutions.len(), 1);
        assert_eq!(dilutions[0].transfer.volume(), 9.0);
        let transfers = builder.interplate_transfers("s#1", "a#1");
        assert_eq!(transfers.len(), 1);
        assert_eq!(
            transfers[0].transfer,
            PlannedTransfer::transfer(1.0, pos("A1"), pos("A1"))
        );
        assert_eq!(builder.stock_requirements()[0].volume, 1.0);
    }

    #[test]
    fn test_intermediates_for_high_stock() {
        let mut layout = TransfectionLayout::new(SHAPE_96);
        layout.add_position(fixed("A1", 5e-5, 5.0, 50.0)).unwrap();
        layout.add_position(fixed("B1", 5e-5, 5.0, 50.0)).unwrap();
        layout.close();
        let (builder, summary) = plan(&layout, ExperimentScenario::Optimisation);
        // 50000 nM -> 2500 nM -> 250 nM -> 50 nM, shared by both wells
        assert_eq!(summary.intermediates, 2);
        assert_eq!(summary.preparation_plates, 1);
        assert_eq!(summary.reservoirs.get("rack position").map(String::as_str), Some("STANDARD_96"));
        let prep = builder.preparation_layout("p#1").unwrap();
        assert_eq!(prep.len(), 2);
        let concentrations: BTreeSet<String> = prep
            .working_positions()
            .map(|p| crate::units::get_trimmed_string(p.concentration))
            .collect();
        assert_eq!(concentrations, ["250", "2500"].into_iter().map(String::from).collect());
        let into_aliquot = builder.interplate_transfers("p#1", "a#1");
        assert_eq!(into_aliquot.len(), 2);
        assert!(into_aliquot.iter().all(|s| s.transfer.volume() == 1.0 && s.rank == 3));
        assert!(!builder.intraplate_transfers("p#1").is_empty());
    }

    #[test]
    fn test_feasibility_rules() {
        let mut ctx = PlanningContext::new();
        ctx.begin_pass();
        let specs = SPECS.pipetting(PIPETTING_BIOMEK).unwrap();
        let mut run = PlannerRun::new(PlannerKind::RackPosition, specs);
        let key = CouplingKey::SectorSet(0);
        let id = ctx.next_container_id().unwrap();
        run.graph.insert(LocationContainer::new_requested(
            id,
            key.clone(),
            ContainerLocation::Position(pos("A1")),
            1.5,
            50.0,
            100.0,
            1,
        ));
        // dilution factor 2 leaves 0.75 µL per side
        assert!(!run.step_feasible(id, 100.0).unwrap());
        assert!(run.step_feasible(id, 50.0).unwrap());
        assert!(!run.step_feasible(id, 40.0).unwrap());
        assert_eq!(run.intermediate_concentration(id, 100.0).unwrap(), 50.0);

        let prep = ctx.next_container_id().unwrap();
        run.graph
            .insert(LocationContainer::new_preparation(prep, key, 500.0, 50000.0, None));
        assert!(run.step_feasible(prep, 10000.0).unwrap());
        assert!(!run.step_feasible(prep, 10001.0).unwrap());
        assert_eq!(run.intermediate_concentration(prep, 50000.0).unwrap(), 2500.0);
    }

    #[test]
    fn test_mock_and_untreated_positions() {
        let mut layout = TransfectionLayout::new(SHAPE_96);
        layout.add_position(fixed("A1", 5e-7, 10.0, 50.0)).unwrap();
        layout
            .add_position(TransfectionPosition::new(pos("B1"), PoolReference::Mock).with_iso_values(Some(10.0), None))
            .unwrap();
        layout
            .add_position(TransfectionPosition::new(pos("C1"), PoolReference::Untreated))
            .unwrap();
        layout.close();
        let (builder, _) = plan(&layout, ExperimentScenario::Optimisation);
        let dilutions = builder.dilutions("a#1");
        assert_eq!(dilutions.len(), 2);
        assert!(dilutions.iter().all(|s| s.transfer.kind() == TransferKind::SampleDilution));
        assert!(dilutions
            .iter()
            .any(|s| s.transfer == PlannedTransfer::dilution(10.0, pos("B1"), DEFAULT_DILUENT)));
    }

    #[test]
    fn test_empty_layout_plans_nothing() {
        let layout = TransfectionLayout::new(SHAPE_384).closed_copy();
        let (builder, summary) = plan(&layout, ExperimentScenario::Screening);
        assert_eq!(summary, PlanSummary::default());
        assert!(builder.is_empty());
    }

    #[test]
    fn test_marker_counter() {
        let mut markers = MarkerCounter::default();
        assert_eq!(markers.next(STOCK_ROLE), "s#1");
        assert_eq!(markers.next(PREPARATION_ROLE), "p#1");
        assert_eq!(markers.next(STOCK_ROLE), "s#2");
        assert_eq!(markers.issued(STOCK_ROLE), 2);
        assert_eq!(aliquot_markers(2), vec!["a#1", "a#2"]);
    }

    /// `pairs` intermediates at 500 nM (stock 5000 nM), each feeding one
    /// 10 µL / 50 nM aliquot well with `copies` copies.
    fn fan_out_run(ctx: &mut PlanningContext, pairs: usize, copies: u32) -> PlannerRun {
        let mut run = PlannerRun::new(PlannerKind::RackPosition, SPECS.pipetting(PIPETTING_BIOMEK).unwrap());
        let key = CouplingKey::SectorSet(0);
        run.sets.push(CoupledSet {
            key: key.clone(),
            stock_concentration: 5000.0,
            pools: BTreeMap::new(),
            stock_marker: String::new(),
            job_level: true,
            intermediates: vec![],
        });
        for position in SHAPE_384.positions().take(pairs) {
            let prep = ctx.next_container_id().unwrap();
            run.graph
                .insert(LocationContainer::new_preparation(prep, key.clone(), 500.0, 5000.0, None));
            let id = ctx.next_container_id().unwrap();
            run.graph.insert(LocationContainer::new_requested(
                id,
                key.clone(),
                ContainerLocation::Position(position),
                10.0,
                50.0,
                5000.0,
                copies,
            ));
            run.graph.set_parent_container(id, prep).unwrap();
            run.sets[0].intermediates.push(prep);
        }
        run
    }

    fn chosen_reservoir(config: &PlannerConfig, pairs: usize, copies: u32) -> String {
        let planner = PreparationPlanner::new(config, &SPECS);
        let mut ctx = PlanningContext::new();
        ctx.begin_pass();
        let run = fan_out_run(&mut ctx, pairs, copies);
        let aliquot = planner.aliquot_specs(SHAPE_96).unwrap();
        let (_, reservoir) = planner.choose_reservoir(run, &aliquot).unwrap();
        reservoir.name
    }

    #[test]
    fn test_reservoir_falls_back_to_deep_wells() {
        let config = PlannerConfig::default();
        // 1 µL per copy: 100 copies + 20 µL dead volume fit a standard well
        assert_eq!(chosen_reservoir(&config, 1, 100), STANDARD_96);
        // 300 µL exceed both standard plates
        assert_eq!(chosen_reservoir(&config, 1, 300), DEEP_96);
    }

    #[test]
    fn test_reservoir_falls_back_to_fewer_plates() {
        let config = PlannerConfig::default();
        // 97 intermediates need two 96-well plates but one 384-well plate
        assert_eq!(chosen_reservoir(&config, 96, 1), STANDARD_96);
        assert_eq!(chosen_reservoir(&config, 97, 1), STANDARD_384);
    }

    #[test]
    fn test_reservoir_tie_keeps_preference_order() {
        let mut config = PlannerConfig::default();
        assert_eq!(chosen_reservoir(&config, 1, 10), STANDARD_96);
        config.reservoir_preference = vec![DEEP_96.to_string(), STANDARD_96.to_string()];
        assert_eq!(chosen_reservoir(&config, 1, 10), DEEP_96);
        config.reservoir_preference = vec![STANDARD_384.to_string(), DEEP_96.to_string(), STANDARD_96.to_string()];
        assert_eq!(chosen_reservoir(&config, 1, 10), STANDARD_384);
    }

    #[test]
    fn test_reservoir_without_feasible_spec() {
        let config = PlannerConfig {
            reservoir_preference: vec![STANDARD_96.to_string(), STANDARD_384.to_string()],
            ..PlannerConfig::default()
        };
        let planner = PreparationPlanner::new(&config, &SPECS);
        let mut ctx = PlanningContext::new();
        ctx.begin_pass();
        let run = fan_out_run(&mut ctx, 1, 300);
        let aliquot = planner.aliquot_specs(SHAPE_96).unwrap();
        let err = planner.choose_reservoir(run, &aliquot).unwrap_err().to_string();
        assert!(err.contains("None of the reservoir specs can be used for the rack position preparation"));
        assert!(err.contains("exceeds the maximum volume of STANDARD_384"));
    }

    #[test]
    fn test_dynamic_dead_volume_grows_with_transfers() {
        let standard = SPECS.reservoir(STANDARD_96).unwrap();
        let deep = SPECS.reservoir(DEEP_96).unwrap();
        let biomek = PlannerRun::new(PlannerKind::RackPosition, SPECS.pipetting(PIPETTING_BIOMEK).unwrap());
        assert_eq!(biomek.dead_volume(standard, 0, 1.0), 10.0);
        assert_eq!(biomek.dead_volume(standard, 1, 1.0), 10.0);
        assert_eq!(biomek.dead_volume(standard, 3, 1.0), 12.0);
        assert_eq!(biomek.dead_volume(standard, 4, 2.5), 17.5);
        assert_eq!(biomek.dead_volume(standard, 20, 1.0), 20.0);
        assert_eq!(biomek.dead_volume(deep, 6, 1.0), 35.0);
        assert_eq!(biomek.dead_volume(deep, 50, 1.0), 40.0);

        let cybio = PlannerRun::new(PlannerKind::Sector, SPECS.pipetting(PIPETTING_CYBIO).unwrap());
        assert_eq!(cybio.dead_volume(standard, 20, 1.0), 10.0);
        let manual = PlannerRun::new(PlannerKind::RackPosition, SPECS.pipetting(PIPETTING_MANUAL).unwrap());
        assert_eq!(manual.dead_volume(deep, 20, 1.0), 30.0);
    }
}
