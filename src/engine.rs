//! One planning pass per ISO request: parse, plan, pick tubes, build.

use crate::config::PlannerConfig;
use crate::error::{IsoError, IsoResult};
use crate::iso_builder::{IsoBuilder, IsoPlate, PlannedIso, StockRequirement};
use crate::layout_parser::{LayoutHandler, LibraryBaseLayout, ParsedIsoLayout};
use crate::location::PlanningContext;
use crate::planner::{PlanSummary, PlanningRequest, PreparationPlanner};
use crate::pool::{PoolAggregate, PoolReference};
use crate::rack_layout::RackLayout;
use crate::request::{IsoRequestMetadata, normalize_plate_set_label};
use crate::specs::SpecsCatalog;
use crate::transfer::WorklistSeries;
use crate::tube::{StockDatabase, StockTubeContainer, TubeCandidate, TubeConfirmer};
use crate::units::round_up;
use isoplan_protocol::{DiagnosticManifest, ExperimentScenario, ParsedLayout};
use itertools::Itertools;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{info, warn};

#[derive(Clone, Debug)]
pub struct IsoRequestInput {
    pub layout: ParsedLayout,
    pub scenario: ExperimentScenario,
    pub ticket_number: String,
    /// Used when the layout metadata carries no plate set label.
    pub plate_set_label: String,
    pub requester: String,
    pub excluded_racks: Vec<String>,
    pub requested_tubes: Vec<String>,
    /// Pool id -> (tube barcode, rack barcode) picked by an earlier run.
    /// These are confirmed before any other tube is considered.
    pub scheduled_tubes: BTreeMap<u64, (String, String)>,
    /// Pool ids floating positions are filled with, in order.
    pub floating_pools: Vec<u64>,
    pub number_isos: u32,
    pub library_layout: Option<LibraryBaseLayout>,
    /// Unused library plates, in order of use.
    pub library_plates: Vec<String>,
}

impl IsoRequestInput {
    pub fn new(layout: ParsedLayout, scenario: ExperimentScenario, ticket_number: &str, plate_set_label: &str) -> Self {
        Self {
            layout,
            scenario,
            ticket_number: ticket_number.to_string(),
            plate_set_label: plate_set_label.to_string(),
            requester: String::new(),
            excluded_racks: vec![],
            requested_tubes: vec![],
            scheduled_tubes: BTreeMap::new(),
            floating_pools: vec![],
            number_isos: 1,
            library_layout: None,
            library_plates: vec![],
        }
    }
}

#[derive(Clone, Debug)]
pub struct IsoJob {
    pub label: String,
    pub requester: String,
    pub isos: Vec<PlannedIso>,
    pub job_preparation_plates: Vec<IsoPlate>,
    /// Pool id -> stock tube for the fixed positions.
    pub fixed_tubes: BTreeMap<u64, TubeCandidate>,
    pub stock_requirements: Vec<StockRequirement>,
    pub worklist_series: WorklistSeries,
}

#[derive(Clone, Debug)]
pub struct PlanningReport {
    pub job: IsoJob,
    pub rack_layout: RackLayout,
    pub metadata: IsoRequestMetadata,
    pub summary: PlanSummary,
    pub warnings: Vec<String>,
}

pub struct IsoPlanningEngine<'a> {
    config: &'a PlannerConfig,
    catalog: &'a SpecsCatalog,
    pools: &'a dyn PoolAggregate,
    stock: &'a dyn StockDatabase,
    context: PlanningContext,
}

impl<'a> IsoPlanningEngine<'a> {
    pub fn new(
        config: &'a PlannerConfig,
        catalog: &'a SpecsCatalog,
        pools: &'a dyn PoolAggregate,
        stock: &'a dyn StockDatabase,
    ) -> Self {
        Self {
            config,
            catalog,
            pools,
            stock,
            context: PlanningContext::new(),
        }
    }

    /// Plans the request. A failed pass yields no ISOs, only the manifest.
    pub fn run(&mut self, input: &IsoRequestInput) -> Result<PlanningReport, DiagnosticManifest> {
        self.context.begin_pass();
        let result = self.run_pass(input);
        self.context.end_pass();
        result.map_err(|e| {
            let manifest = e.into_manifest();
            warn!(
                ticket = %input.ticket_number,
                problems = manifest.diagnostics.len(),
                "planning pass failed"
            );
            manifest
        })
    }

    fn run_pass(&mut self, input: &IsoRequestInput) -> IsoResult<PlanningReport> {
        let mut handler = LayoutHandler::new(input.scenario, self.pools, self.config);
        if let Some(library) = &input.library_layout {
            handler = handler.with_library_layout(library);
        }
        let parsed = handler.parse(&input.layout)?;
        let mut warnings = parsed.warnings.clone();

        let single_plate = input.scenario == ExperimentScenario::OrderOnly;
        let label = parsed
            .metadata
            .plate_set_label
            .clone()
            .unwrap_or_else(|| input.plate_set_label.clone());
        let plate_set_label = normalize_plate_set_label(&label, single_plate).map_err(IsoError::parse)?;
        let number_aliquots = parsed.metadata.number_aliquots.max(1);
        let requested_isos = input.number_isos.max(1);
        let number_floatings = parsed.layout.floating_placeholders().len();

        // the job plates are sized for the requested count; shortfalls only
        // remove ISOs
        let mut builder = IsoBuilder::new(&input.ticket_number, &plate_set_label);
        let summary = if input.scenario == ExperimentScenario::OrderOnly {
            self.prepare_order(&parsed, &mut builder)?;
            PlanSummary::default()
        } else {
            let planner = PreparationPlanner::new(self.config, self.catalog);
            let request = PlanningRequest {
                layout: &parsed.layout,
                scenario: input.scenario,
                association: parsed.association.as_ref(),
                number_aliquots,
                isos_per_job: requested_isos,
            };
            planner.plan(&mut self.context, &request, &mut builder)?
        };

        let number_isos = if input.scenario == ExperimentScenario::Library {
            self.limit_by_library_plates(input, requested_isos, &mut builder, &mut warnings)?
        } else if number_floatings > 0 {
            let candidates = self.floating_candidates(input, &builder, &mut warnings)?;
            let possible = candidates.len().div_ceil(number_floatings) as u32;
            if possible == 0 {
                return Err(IsoError::resource(
                    "There are no stock tubes left for the floating positions of this ISO request.",
                ));
            }
            if possible < requested_isos {
                let message = format!(
                    "Only {possible} ISO(s) can be generated instead of {requested_isos} because there are only {} floating pool candidates left.",
                    candidates.len()
                );
                warn!(%message, "floating candidate shortfall");
                warnings.push(message);
            }
            builder.set_floating_candidates(candidates);
            possible.min(requested_isos)
        } else {
            requested_isos
        };

        let fixed_tubes = self.pick_fixed_tubes(input, &builder, number_isos, &mut warnings)?;
        builder.set_fixed_candidates(fixed_tubes.clone());
        builder.set_number_of_isos(number_isos);
        let isos = builder.create_isos()?;
        let worklist_series = builder.create_worklist_series()?;

        info!(
            ticket = %input.ticket_number,
            scenario = input.scenario.as_str(),
            isos = isos.len(),
            worklists = worklist_series.len(),
            warnings = warnings.len(),
            "planning pass finished"
        );
        let job = IsoJob {
            label: format!("{}_job_01", input.ticket_number),
            requester: input.requester.clone(),
            isos,
            job_preparation_plates: builder.job_preparation_plates(),
            fixed_tubes,
            stock_requirements: builder.stock_requirements().to_vec(),
            worklist_series,
        };
        Ok(PlanningReport {
            job,
            rack_layout: parsed.create_rack_layout(),
            metadata: parsed.metadata,
            summary,
            warnings,
        })
    }

    /// Order-only requests take every pool straight from its stock tube.
    fn prepare_order(&self, parsed: &ParsedIsoLayout, builder: &mut IsoBuilder) -> IsoResult<()> {
        let planner = PreparationPlanner::new(self.config, self.catalog);
        builder.set_aliquot_specs(planner.aliquot_specs(parsed.layout.shape())?, 1);
        for tp in parsed.layout.working_positions() {
            builder.add_aliquot_position(tp.clone())?;
            let (PoolReference::Fixed(pool), Some(volume)) = (&tp.pool, tp.iso_volume) else {
                continue;
            };
            builder.add_stock_requirement(StockRequirement {
                pool: tp.pool.clone(),
                stock_marker: "s#1".to_string(),
                position: tp.rack_position,
                volume: round_up(volume, 1),
                stock_concentration: pool.stock_concentration_nm(),
                job_level: false,
            });
        }
        Ok(())
    }

    fn limit_by_library_plates(
        &self,
        input: &IsoRequestInput,
        requested: u32,
        builder: &mut IsoBuilder,
        warnings: &mut Vec<String>,
    ) -> IsoResult<u32> {
        let available = input.library_plates.len() as u32;
        if available == 0 {
            return Err(IsoError::resource("There are no unused library plates left."));
        }
        if available < requested {
            warnings.push(format!(
                "Only {available} ISO(s) can be generated instead of {requested} because there are not enough unused library plates."
            ));
        }
        builder.set_library_plates(input.library_plates.clone());
        Ok(available.min(requested))
    }

    /// One tube per floating pool, in pool order. Pools without a usable
    /// tube are skipped.
    fn floating_candidates(
        &self,
        input: &IsoRequestInput,
        builder: &IsoBuilder,
        warnings: &mut Vec<String>,
    ) -> IsoResult<Vec<TubeCandidate>> {
        let per_iso = builder
            .stock_requirements()
            .iter()
            .filter(|r| matches!(r.pool, PoolReference::Floating(_)))
            .map(|r| r.volume)
            .fold(0.0, f64::max);
        let needed = per_iso + self.config.stock_dead_volume_ul;
        let excluded: BTreeSet<&str> = input.excluded_racks.iter().map(|r| r.trim()).collect();
        let requested: BTreeSet<&str> = input.requested_tubes.iter().map(|t| t.trim()).collect();

        let mut ret = vec![];
        let mut unknown = vec![];
        let mut without_tube = vec![];
        for pool_id in input.floating_pools.iter().unique() {
            if self.pools.get_by_id(*pool_id).is_none() {
                unknown.push(pool_id.to_string());
                continue;
            }
            let tubes: Vec<TubeCandidate> = self
                .stock
                .tubes_for_pool(*pool_id, self.config.floating_stock_concentration_nm, needed)?
                .into_iter()
                .filter(|t| !excluded.contains(t.rack_barcode.as_str()))
                .collect();
            let choice = tubes
                .iter()
                .position(|t| requested.contains(t.tube_barcode.as_str()))
                .unwrap_or(0);
            match tubes.into_iter().nth(choice) {
                Some(tube) => ret.push(tube),
                None => without_tube.push(pool_id.to_string()),
            }
        }
        if !unknown.is_empty() {
            warnings.push(format!(
                "The following floating pools are unknown and have been ignored: {}.",
                unknown.join(", ")
            ));
        }
        if !without_tube.is_empty() {
            warnings.push(format!(
                "There are no stock tubes with sufficient volume for the following floating pools: {}.",
                without_tube.join(", ")
            ));
        }
        Ok(ret)
    }

    fn pick_fixed_tubes(
        &self,
        input: &IsoRequestInput,
        builder: &IsoBuilder,
        number_isos: u32,
        warnings: &mut Vec<String>,
    ) -> IsoResult<BTreeMap<u64, TubeCandidate>> {
        let mut containers: BTreeMap<u64, StockTubeContainer> = BTreeMap::new();
        for requirement in builder.stock_requirements() {
            let PoolReference::Fixed(pool) = &requirement.pool else {
                continue;
            };
            let volume = if requirement.job_level {
                requirement.volume
            } else {
                requirement.volume * number_isos as f64
            };
            containers
                .entry(pool.id)
                .or_insert_with(|| {
                    let container = StockTubeContainer::new(pool.clone(), 0.0);
                    match input.scheduled_tubes.get(&pool.id) {
                        Some((tube, rack)) => container.scheduled(tube, rack),
                        None => container,
                    }
                })
                .required_volume += volume;
        }
        if containers.is_empty() {
            return Ok(BTreeMap::new());
        }
        let confirmer = TubeConfirmer::new(self.stock, self.config.stock_dead_volume_ul)
            .with_excluded_racks(&input.excluded_racks)
            .with_requested_tubes(&input.requested_tubes);
        warnings.extend(confirmer.run(&mut containers)?);

        let missing = containers
            .values()
            .filter(|c| c.tube_candidate.is_none())
            .map(|c| format!("{} ({} µL)", c.pool.id, round_up(c.required_volume, 1)))
            .join(", ");
        if !missing.is_empty() {
            return Err(IsoError::planning(format!(
                "Could not find stock tubes with sufficient volume for the following fixed pools: {missing}."
            )));
        }
        Ok(containers
            .into_iter()
            .filter_map(|(id, c)| Some((id, c.tube_candidate?)))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SPECS;
    use crate::pool::{InMemoryPoolAggregate, MoleculeDesignPool};
    use crate::rack::RackPosition;
    use crate::tube::InMemoryStockDatabase;
    use isoplan_protocol::{DiagnosticCategory, ParsedParameter};
    use std::sync::Arc;

    fn pools() -> InMemoryPoolAggregate {
        InMemoryPoolAggregate::new([
            MoleculeDesignPool::new(205200, "SIRNA", 5e-5),
            MoleculeDesignPool::new(1001, "SIRNA", 5e-5),
            MoleculeDesignPool::new(1002, "SIRNA", 5e-5),
            MoleculeDesignPool::new(1003, "SIRNA", 5e-5),
        ])
    }

    fn stock(pools: &InMemoryPoolAggregate) -> InMemoryStockDatabase {
        let mut db = InMemoryStockDatabase::new();
        for (n, id) in [205200u64, 1001, 1002, 1003].into_iter().enumerate() {
            let pool = pools.get_by_id(id).unwrap();
            db.add_tube(TubeCandidate::new(
                &format!("t{n}"),
                Arc::clone(&pool),
                "R1",
                RackPosition::new(0, n as u16),
                100.0,
            ));
        }
        db
    }

    fn optimisation_layout() -> ParsedLayout {
        ParsedLayout::new(8, 12)
            .with_parameter("molecule_design_pool_id", ParsedParameter::from_layout([("A1", "205200")]))
            .with_parameter("iso_volume", ParsedParameter::from_layout([("A1", "10")]))
            .with_parameter("iso_concentration", ParsedParameter::from_layout([("A1", "50")]))
            .with_parameter("final_concentration", ParsedParameter::from_layout([("A1", "10")]))
            .with_parameter("reagent_name", ParsedParameter::from_layout([("A1", "mix")]))
            .with_parameter("reagent_dilution_factor", ParsedParameter::from_layout([("A1", "1400")]))
    }

    #[test]
    fn test_run_optimisation() {
        let config = PlannerConfig::default();
        let pools = pools();
        let db = stock(&pools);
        let mut engine = IsoPlanningEngine::new(&config, &SPECS, &pools, &db);
        let input = IsoRequestInput::new(optimisation_layout(), ExperimentScenario::Optimisation, "123", "opti");
        let report = engine.run(&input).unwrap();
        assert_eq!(report.job.isos.len(), 1);
        assert_eq!(report.job.isos[0].label, "123_iso_01");
        assert_eq!(report.job.fixed_tubes[&205200].tube_barcode, "t0");
        assert!(!report.job.worklist_series.is_empty());
        assert!(report.warnings.is_empty());
    }

    #[test]
    fn test_failed_pass_returns_manifest() {
        let config = PlannerConfig::default();
        let pools = pools();
        let db = InMemoryStockDatabase::new();
        let mut engine = IsoPlanningEngine::new(&config, &SPECS, &pools, &db);
        let input = IsoRequestInput::new(optimisation_layout(), ExperimentScenario::Optimisation, "123", "opti");
        let manifest = engine.run(&input).unwrap_err();
        assert_eq!(manifest.diagnostics[0].category, DiagnosticCategory::Planning);
        assert!(manifest.diagnostics[0].detail.contains("205200"));
    }

    #[test]
    fn test_floating_shortfall_reduces_iso_count() {
        let config = PlannerConfig {
            floating_stock_concentration_nm: 50_000.0,
            ..PlannerConfig::default()
        };
        let pools = pools();
        let db = stock(&pools);
        let mut engine = IsoPlanningEngine::new(&config, &SPECS, &pools, &db);
        let layout = optimisation_layout()
            .with_parameter("molecule_design_pool_id", ParsedParameter::from_layout([
                ("A1", "205200"),
                ("B1", "md_1"),
                ("C1", "md_2"),
            ]))
            .with_parameter("iso_volume", ParsedParameter::from_layout([("A1", "10"), ("B1", "10"), ("C1", "10")]))
            .with_parameter("iso_concentration", ParsedParameter::from_layout([("A1", "50"), ("B1", "50"), ("C1", "50")]))
            .with_parameter("final_concentration", ParsedParameter::from_layout([("A1", "10"), ("B1", "10"), ("C1", "10")]))
            .with_parameter("reagent_name", ParsedParameter::from_layout([("A1", "mix"), ("B1", "mix"), ("C1", "mix")]))
            .with_parameter(
                "reagent_dilution_factor",
                ParsedParameter::from_layout([("A1", "1400"), ("B1", "1400"), ("C1", "1400")]),
            );
        let mut input = IsoRequestInput::new(layout, ExperimentScenario::Optimisation, "123", "opti");
        input.floating_pools = vec![1001, 1002, 1003];
        input.number_isos = 3;
        let report = engine.run(&input).unwrap();
        assert_eq!(report.job.isos.len(), 2);
        assert!(report.warnings.iter().any(|w| w.starts_with("Only 2 ISO(s)")));
        assert!(!report.job.job_preparation_plates.is_empty());
    }

    #[test]
    fn test_order_only_picks_tubes() {
        let config = PlannerConfig::default();
        let pools = pools();
        let db = stock(&pools);
        let mut engine = IsoPlanningEngine::new(&config, &SPECS, &pools, &db);
        let layout = ParsedLayout::new(8, 12)
            .with_parameter("molecule_design_pool_id", ParsedParameter::from_layout([("A1", "205200"), ("B1", "1001")]))
            .with_metadata("iso_volume", "5");
        let input = IsoRequestInput::new(layout, ExperimentScenario::OrderOnly, "77", "order");
        let report = engine.run(&input).unwrap();
        assert_eq!(report.job.fixed_tubes.len(), 2);
        assert!(report.job.worklist_series.is_empty());
        assert_eq!(report.summary, PlanSummary::default());
    }
}
