//! Turns the external parser's position -> value tables into a validated
//! transfection layout for one experiment scenario.

use crate::config::{ManualDuplicatePoolPolicy, PlannerConfig};
use crate::error::{ErrorBuckets, IsoError, IsoResult};
use crate::parameters::{Parameter, Tag, normalize_alias};
use crate::pool::{PoolAggregate, PoolReference, PositionType, RawPoolValue, UNTREATED_VALUES};
use crate::rack::{RackPosition, RackPositionSet, RackShape};
use crate::rack_layout::RackLayout;
use crate::request::{IsoRequestMetadata, normalize_plate_set_label, parse_delivery_date};
use crate::sector::{RackSectorAssociation, RackSectorAssociator, sort_floatings_by_position, sort_floatings_by_sector};
use crate::transfection::{TransfectionLayout, TransfectionPosition};
use crate::units::{are_equal_values, is_larger_than, parse_positive_integer, parse_positive_number};
use isoplan_protocol::{DiagnosticCategory, ExperimentScenario, ParsedLayout, ParsedParameter};
use itertools::Itertools;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

pub const ADDITIONAL_TAG_DOMAIN: &str = "additional";

const SAMPLE_TYPES: &[PositionType] = &[
    PositionType::Fixed,
    PositionType::Floating,
    PositionType::Mock,
    PositionType::Untreated,
    PositionType::Empty,
];
const FIXED_ONLY_TYPES: &[PositionType] = &[PositionType::Fixed, PositionType::Empty];

const REQUEST_METADATA: [Parameter; 4] = [
    Parameter::NumberAliquots,
    Parameter::DeliveryDate,
    Parameter::PlateSetLabel,
    Parameter::Comment,
];

/// What a scenario accepts.
#[derive(Clone, Debug)]
pub struct ScenarioRules {
    pub scenario: ExperimentScenario,
    pub supported_position_types: &'static [PositionType],
    /// Parameters that may be given per well.
    pub layout_parameters: &'static [Parameter],
    /// Parameters that may be given once for the whole request.
    pub allowed_metadata: &'static [Parameter],
    pub required_metadata: &'static [Parameter],
    pub requires_transfection_values: bool,
    pub allows_stock_concentration: bool,
}

impl ScenarioRules {
    pub fn for_scenario(scenario: ExperimentScenario) -> Self {
        use Parameter as P;
        match scenario {
            ExperimentScenario::Optimisation => Self {
                scenario,
                supported_position_types: SAMPLE_TYPES,
                layout_parameters: &[
                    P::MoleculeDesignPool,
                    P::IsoVolume,
                    P::IsoConcentration,
                    P::Supplier,
                    P::ReagentName,
                    P::ReagentDilutionFactor,
                    P::FinalConcentration,
                    P::OptimemDilutionFactor,
                ],
                allowed_metadata: &[
                    P::IsoVolume,
                    P::IsoConcentration,
                    P::Supplier,
                    P::ReagentName,
                    P::ReagentDilutionFactor,
                    P::FinalConcentration,
                    P::OptimemDilutionFactor,
                    P::NumberAliquots,
                    P::DeliveryDate,
                    P::PlateSetLabel,
                    P::Comment,
                ],
                required_metadata: &[],
                requires_transfection_values: true,
                allows_stock_concentration: false,
            },
            ExperimentScenario::Screening => Self {
                scenario,
                supported_position_types: SAMPLE_TYPES,
                layout_parameters: &[
                    P::MoleculeDesignPool,
                    P::IsoConcentration,
                    P::Supplier,
                    P::ReagentName,
                    P::ReagentDilutionFactor,
                    P::FinalConcentration,
                    P::OptimemDilutionFactor,
                ],
                allowed_metadata: &[
                    P::IsoVolume,
                    P::IsoConcentration,
                    P::Supplier,
                    P::ReagentName,
                    P::ReagentDilutionFactor,
                    P::FinalConcentration,
                    P::OptimemDilutionFactor,
                    P::NumberAliquots,
                    P::DeliveryDate,
                    P::PlateSetLabel,
                    P::Comment,
                ],
                required_metadata: &[P::IsoVolume, P::NumberAliquots],
                requires_transfection_values: true,
                allows_stock_concentration: false,
            },
            ExperimentScenario::Library => Self {
                scenario,
                supported_position_types: SAMPLE_TYPES,
                layout_parameters: &[
                    P::MoleculeDesignPool,
                    P::Supplier,
                    P::ReagentName,
                    P::ReagentDilutionFactor,
                    P::FinalConcentration,
                    P::OptimemDilutionFactor,
                ],
                allowed_metadata: &[
                    P::IsoVolume,
                    P::Supplier,
                    P::ReagentName,
                    P::ReagentDilutionFactor,
                    P::FinalConcentration,
                    P::OptimemDilutionFactor,
                    P::NumberAliquots,
                    P::DeliveryDate,
                    P::PlateSetLabel,
                    P::Comment,
                ],
                required_metadata: &[P::NumberAliquots],
                requires_transfection_values: true,
                allows_stock_concentration: false,
            },
            ExperimentScenario::Manual => Self {
                scenario,
                supported_position_types: FIXED_ONLY_TYPES,
                layout_parameters: &[P::MoleculeDesignPool, P::IsoVolume, P::IsoConcentration, P::Supplier],
                allowed_metadata: &[
                    P::IsoVolume,
                    P::IsoConcentration,
                    P::Supplier,
                    P::DeliveryDate,
                    P::PlateSetLabel,
                    P::Comment,
                ],
                required_metadata: &[],
                requires_transfection_values: false,
                allows_stock_concentration: true,
            },
            ExperimentScenario::OrderOnly => Self {
                scenario,
                supported_position_types: FIXED_ONLY_TYPES,
                layout_parameters: &[P::MoleculeDesignPool, P::IsoVolume, P::Supplier],
                allowed_metadata: &[P::IsoVolume, P::Supplier, P::DeliveryDate, P::PlateSetLabel, P::Comment],
                required_metadata: &[],
                requires_transfection_values: false,
                allows_stock_concentration: true,
            },
        }
    }

    pub fn supports(&self, position_type: PositionType) -> bool {
        self.supported_position_types.contains(&position_type)
    }

    fn allows_parameter(&self, parameter: Parameter) -> bool {
        self.layout_parameters.contains(&parameter) || self.allowed_metadata.contains(&parameter)
    }
}

/// Positions a library plate already occupies with its own samples.
#[derive(Clone, Debug, PartialEq)]
pub struct LibraryBaseLayout {
    pub shape: RackShape,
    pub positions: BTreeSet<RackPosition>,
}

impl LibraryBaseLayout {
    pub fn new(shape: RackShape, positions: impl IntoIterator<Item = RackPosition>) -> Self {
        Self {
            shape,
            positions: positions.into_iter().collect(),
        }
    }

    pub fn is_library_position(&self, position: &RackPosition) -> bool {
        self.positions.contains(position)
    }
}

/// Everything the handler derives from one parsed layout.
#[derive(Clone, Debug)]
pub struct ParsedIsoLayout {
    pub scenario: ExperimentScenario,
    pub layout: TransfectionLayout,
    pub additional_tags: Vec<(Tag, RackPositionSet)>,
    pub association: Option<RackSectorAssociation>,
    /// The request-wide ISO volume (screening).
    pub iso_volume: Option<f64>,
    pub metadata: IsoRequestMetadata,
    pub warnings: Vec<String>,
}

impl ParsedIsoLayout {
    /// The persistence form: layout tags plus the additional tags.
    pub fn create_rack_layout(&self) -> RackLayout {
        let mut ret = self.layout.create_rack_layout();
        for (tag, positions) in &self.additional_tags {
            ret.add_tagged([tag.clone()].into_iter().collect(), positions.clone());
        }
        ret
    }
}

fn is_sentinel(value: &str) -> bool {
    let lower = value.trim().to_ascii_lowercase();
    lower.is_empty() || lower == "none" || lower == "mock" || UNTREATED_VALUES.contains(&lower.as_str())
}

fn bucket_key_invalid(parameter: Parameter) -> &'static str {
    match parameter {
        Parameter::IsoVolume => "invalid_iso_volume",
        Parameter::IsoConcentration => "invalid_iso_concentration",
        Parameter::FinalConcentration => "invalid_final_concentration",
        Parameter::ReagentDilutionFactor => "invalid_reagent_dilution_factor",
        Parameter::OptimemDilutionFactor => "invalid_optimem_dilution_factor",
        _ => "invalid_value",
    }
}

fn resolve_label(shape: RackShape, label: &str, buckets: &mut ErrorBuckets) -> Option<RackPosition> {
    let position = RackPosition::from_label(label).filter(|p| shape.contains(p));
    if position.is_none() {
        buckets.add_detail(
            "invalid_rack_position",
            DiagnosticCategory::Parse,
            "The following rack positions are invalid for this layout",
            label.to_string(),
        );
    }
    position
}

fn resolve_labels(
    shape: RackShape,
    well_map: &BTreeMap<String, String>,
    buckets: &mut ErrorBuckets,
) -> BTreeMap<RackPosition, String> {
    well_map
        .iter()
        .filter_map(|(label, value)| Some((resolve_label(shape, label, buckets)?, value.clone())))
        .collect()
}

/// Raw values per parameter, already keyed by rack position.
struct ValueTable {
    layouts: BTreeMap<Parameter, BTreeMap<RackPosition, String>>,
    defaults: BTreeMap<Parameter, String>,
}

impl ValueTable {
    fn get(&self, parameter: Parameter, position: &RackPosition) -> Option<&str> {
        match self.layouts.get(&parameter) {
            Some(map) => map.get(position).map(String::as_str),
            None => self.defaults.get(&parameter).map(String::as_str),
        }
        .map(str::trim)
        .filter(|v| !v.is_empty())
    }

    fn default_value(&self, parameter: Parameter) -> Option<&str> {
        self.defaults
            .get(&parameter)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }
}

pub struct LayoutHandler<'a> {
    rules: ScenarioRules,
    pools: &'a dyn PoolAggregate,
    config: &'a PlannerConfig,
    library_layout: Option<&'a LibraryBaseLayout>,
}

impl<'a> LayoutHandler<'a> {
    pub fn new(scenario: ExperimentScenario, pools: &'a dyn PoolAggregate, config: &'a PlannerConfig) -> Self {
        Self {
            rules: ScenarioRules::for_scenario(scenario),
            pools,
            config,
            library_layout: None,
        }
    }

    pub fn with_library_layout(mut self, library_layout: &'a LibraryBaseLayout) -> Self {
        self.library_layout = Some(library_layout);
        self
    }

    pub fn rules(&self) -> &ScenarioRules {
        &self.rules
    }

    pub fn parse(&self, parsed: &ParsedLayout) -> IsoResult<ParsedIsoLayout> {
        let shape = RackShape::from_dimensions(parsed.shape.rows, parsed.shape.columns).ok_or_else(|| {
            IsoError::parse(format!(
                "Unsupported rack shape {}x{}. Only 8x12 and 16x24 layouts are supported.",
                parsed.shape.rows, parsed.shape.columns
            ))
        })?;
        let scenario = self.rules.scenario;
        info!(scenario = scenario.as_str(), shape = %shape.name(), "parsing ISO layout");

        let mut buckets = ErrorBuckets::new();
        let (table, additional_tags) = self.build_value_table(parsed, shape, &mut buckets);
        let metadata = self.check_metadata(table.as_ref(), &mut buckets);
        let mut layout = TransfectionLayout::new(shape);
        if let Some(table) = &table {
            self.construct_positions(table, &mut layout, &mut buckets)?;
        }
        let mut warnings = buckets.finish()?;

        let Some(table) = table else {
            return Err(IsoError::programmer("Value table missing after a clean parse"));
        };
        let mut buckets = ErrorBuckets::new();
        self.complete_iso_values(&mut layout, &mut buckets)?;
        self.check_validity(&layout, &mut buckets);
        warnings.extend(buckets.finish()?);

        let association = self.sort_floatings(&mut layout)?;
        layout.close();

        let iso_volume = match scenario {
            ExperimentScenario::Screening => table
                .default_value(Parameter::IsoVolume)
                .and_then(parse_positive_number),
            _ => None,
        };
        debug!(
            positions = layout.len(),
            pools = layout.get_molecule_design_pool_count(),
            floatings = layout.floating_placeholders().len(),
            "transfection layout ready"
        );
        Ok(ParsedIsoLayout {
            scenario,
            layout,
            additional_tags,
            association,
            iso_volume,
            metadata,
            warnings,
        })
    }

    /// Maps parameter names to parameters and well labels to positions.
    /// `None` if the pool layout is missing.
    fn build_value_table(
        &self,
        parsed: &ParsedLayout,
        shape: RackShape,
        buckets: &mut ErrorBuckets,
    ) -> (Option<ValueTable>, Vec<(Tag, RackPositionSet)>) {
        let mut table = ValueTable {
            layouts: BTreeMap::new(),
            defaults: BTreeMap::new(),
        };
        let mut additional: BTreeMap<Tag, BTreeSet<RackPosition>> = BTreeMap::new();
        let mut seen: BTreeMap<Parameter, String> = BTreeMap::new();
        let scenario_name = self.rules.scenario.display_name();

        for (name, parameter) in &parsed.parameters {
            let Some(known) = Parameter::from_alias(name) else {
                if parameter.has_layout {
                    for (position, value) in resolve_labels(shape, &parameter.well_map, buckets) {
                        if is_sentinel(&value) {
                            continue;
                        }
                        additional
                            .entry(Tag {
                                domain: ADDITIONAL_TAG_DOMAIN.to_string(),
                                predicate: normalize_alias(name),
                                value: value.trim().to_string(),
                            })
                            .or_default()
                            .insert(position);
                    }
                } else {
                    buckets.add_detail(
                        "unknown_parameter",
                        DiagnosticCategory::Parse,
                        "Unknown parameters",
                        name.clone(),
                    );
                }
                continue;
            };
            if let Some(previous) = seen.insert(known, name.clone()) {
                buckets.add_message(
                    DiagnosticCategory::Parse,
                    format!("Parameter {known} is specified twice (\"{previous}\" and \"{name}\")."),
                );
                continue;
            }
            if !self.rules.allows_parameter(known) {
                buckets.add_detail(
                    "parameter_not_allowed",
                    DiagnosticCategory::Parse,
                    &format!("The following parameters are not allowed for the {scenario_name} scenario"),
                    known.to_string(),
                );
                continue;
            }
            self.store_parameter(known, parameter, shape, &mut table, buckets);
        }

        for (name, value) in &parsed.metadata {
            let Some(known) = Parameter::from_alias(name) else {
                buckets.add_detail(
                    "unknown_metadata",
                    DiagnosticCategory::Parse,
                    "Unknown metadata",
                    name.clone(),
                );
                continue;
            };
            if !self.rules.allowed_metadata.contains(&known) {
                buckets.add_detail(
                    "metadata_not_allowed",
                    DiagnosticCategory::Parse,
                    &format!("The following metadata are not allowed for the {scenario_name} scenario"),
                    known.to_string(),
                );
                continue;
            }
            if table.layouts.contains_key(&known) || table.defaults.contains_key(&known) {
                continue;
            }
            if let Some(value) = value {
                table.defaults.insert(known, value.clone());
            }
        }

        for tag in &parsed.additional_tags {
            let positions: Vec<RackPosition> = tag
                .positions
                .iter()
                .filter_map(|label| resolve_label(shape, label, buckets))
                .collect();
            additional
                .entry(Tag {
                    domain: tag.domain.clone(),
                    predicate: tag.predicate.clone(),
                    value: tag.value.clone(),
                })
                .or_default()
                .extend(positions);
        }
        let additional_tags = additional
            .into_iter()
            .filter(|(_, positions)| !positions.is_empty())
            .map(|(tag, positions)| (tag, RackPositionSet::new(positions)))
            .collect();

        if !table.layouts.contains_key(&Parameter::MoleculeDesignPool) {
            buckets.add_message(
                DiagnosticCategory::Parse,
                "Could not find a molecule design pool layout.",
            );
            return (None, additional_tags);
        }
        (Some(table), additional_tags)
    }

    fn store_parameter(
        &self,
        parameter: Parameter,
        parsed: &ParsedParameter,
        shape: RackShape,
        table: &mut ValueTable,
        buckets: &mut ErrorBuckets,
    ) {
        if parsed.has_layout {
            if !self.rules.layout_parameters.contains(&parameter) {
                buckets.add_detail(
                    "layout_not_allowed",
                    DiagnosticCategory::Parse,
                    &format!(
                        "The following parameters must not be specified as layouts for the {} scenario",
                        self.rules.scenario.display_name()
                    ),
                    parameter.to_string(),
                );
                return;
            }
            table.layouts.insert(parameter, resolve_labels(shape, &parsed.well_map, buckets));
        } else if let Some(value) = &parsed.metadata_value {
            if parameter == Parameter::MoleculeDesignPool {
                buckets.add_message(
                    DiagnosticCategory::Parse,
                    "The molecule design pool must be specified as a layout.",
                );
                return;
            }
            table.defaults.insert(parameter, value.clone());
        }
    }

    fn check_metadata(&self, table: Option<&ValueTable>, buckets: &mut ErrorBuckets) -> IsoRequestMetadata {
        let mut metadata = IsoRequestMetadata::default();
        let Some(table) = table else {
            return metadata;
        };
        for required in self.rules.required_metadata {
            if table.default_value(*required).is_none() {
                buckets.add_detail(
                    "missing_metadata",
                    DiagnosticCategory::Parse,
                    "The following metadata are missing",
                    required.to_string(),
                );
            }
        }
        for parameter in REQUEST_METADATA {
            let Some(value) = table.default_value(parameter) else {
                continue;
            };
            match parameter {
                Parameter::NumberAliquots => match parse_positive_integer(value) {
                    Some(n) => metadata.number_aliquots = n,
                    None => buckets.add_detail(
                        "invalid_metadata",
                        DiagnosticCategory::Parse,
                        "The following metadata values must be positive numbers",
                        format!("{parameter} ({value})"),
                    ),
                },
                Parameter::DeliveryDate => match parse_delivery_date(Some(value)) {
                    Ok(date) => metadata.delivery_date = date,
                    Err(message) => buckets.add_message(DiagnosticCategory::Parse, message),
                },
                Parameter::PlateSetLabel => {
                    let single_plate = self.rules.scenario == ExperimentScenario::OrderOnly;
                    match normalize_plate_set_label(value, single_plate) {
                        Ok(label) => metadata.plate_set_label = Some(label),
                        Err(message) => buckets.add_message(DiagnosticCategory::Parse, message),
                    }
                }
                Parameter::Comment => metadata.comment = Some(value.to_string()),
                _ => {}
            }
        }
        metadata
    }

    fn number_at(
        &self,
        table: &ValueTable,
        parameter: Parameter,
        position: RackPosition,
        buckets: &mut ErrorBuckets,
    ) -> Option<f64> {
        let value = table.get(parameter, &position)?;
        if is_sentinel(value) {
            return None;
        }
        match parse_positive_number(value) {
            Some(number) => Some(number),
            None => {
                buckets.add_position(
                    bucket_key_invalid(parameter),
                    DiagnosticCategory::Parse,
                    &format!("Invalid {} (must be a positive number)", parameter.display_name()),
                    position,
                );
                None
            }
        }
    }

    fn construct_positions(
        &self,
        table: &ValueTable,
        layout: &mut TransfectionLayout,
        buckets: &mut ErrorBuckets,
    ) -> IsoResult<()> {
        let shape = layout.shape();
        let mut unknown_pools: BTreeMap<u64, Vec<RackPosition>> = BTreeMap::new();
        for position in shape.positions() {
            let pool = match RawPoolValue::classify(table.get(Parameter::MoleculeDesignPool, &position)) {
                RawPoolValue::Empty => PoolReference::Empty,
                RawPoolValue::Floating(placeholder) => PoolReference::Floating(placeholder),
                RawPoolValue::Mock => PoolReference::Mock,
                RawPoolValue::Untreated => PoolReference::Untreated,
                RawPoolValue::Library => PoolReference::Library,
                RawPoolValue::PoolId(id) => match self.pools.get_by_id(id) {
                    Some(pool) => PoolReference::Fixed(pool),
                    None => {
                        unknown_pools.entry(id).or_default().push(position);
                        continue;
                    }
                },
                RawPoolValue::Invalid(_) => {
                    buckets.add_position(
                        "invalid_pool",
                        DiagnosticCategory::Parse,
                        "Invalid molecule design pool values",
                        position,
                    );
                    continue;
                }
            };
            let position_type = pool.position_type();
            if !self.rules.supports(position_type) {
                buckets.add_position(
                    "invalid_position_type",
                    DiagnosticCategory::Parse,
                    &format!(
                        "The following positions have position types that are not supported by the {} scenario",
                        self.rules.scenario.display_name()
                    ),
                    position,
                );
                continue;
            }
            if position_type == PositionType::Empty {
                continue;
            }
            layout.add_position(self.construct_position(table, position, pool, buckets))?;
        }
        for (id, positions) in unknown_pools {
            buckets.add_detail(
                "unknown_pool",
                DiagnosticCategory::Parse,
                "Unable to find molecule design pools for the following IDs",
                format!("{id} ({})", positions.iter().map(RackPosition::label).join(", ")),
            );
        }
        Ok(())
    }

    fn construct_position(
        &self,
        table: &ValueTable,
        position: RackPosition,
        pool: PoolReference,
        buckets: &mut ErrorBuckets,
    ) -> TransfectionPosition {
        let position_type = pool.position_type();
        let mut tp = TransfectionPosition::new(position, pool);
        let text_at = |parameter: Parameter| {
            table
                .get(parameter, &position)
                .filter(|v| !is_sentinel(v))
                .map(str::to_string)
        };

        if position_type == PositionType::Untreated {
            let carries_values = Parameter::POSITION_PARAMETERS
                .iter()
                .filter(|p| **p != Parameter::MoleculeDesignPool && **p != Parameter::PositionType)
                .any(|p| text_at(*p).is_some());
            if carries_values {
                buckets.add_position(
                    "untreated_values",
                    DiagnosticCategory::Parse,
                    "Untreated positions must not carry volumes, concentrations or reagents",
                    position,
                );
            }
            return tp;
        }

        tp.iso_volume = self.number_at(table, Parameter::IsoVolume, position, buckets);
        if position_type == PositionType::Mock {
            let has_concentration = [Parameter::IsoConcentration, Parameter::FinalConcentration]
                .into_iter()
                .any(|p| text_at(p).is_some());
            if has_concentration {
                buckets.add_position(
                    "mock_concentration",
                    DiagnosticCategory::Parse,
                    "Mock positions must not have concentrations",
                    position,
                );
            }
        } else {
            tp.iso_concentration = self.number_at(table, Parameter::IsoConcentration, position, buckets);
            tp.final_concentration = self.number_at(table, Parameter::FinalConcentration, position, buckets);
        }
        if position_type == PositionType::Fixed {
            tp.supplier = text_at(Parameter::Supplier);
        }
        if !self.rules.requires_transfection_values {
            return tp;
        }

        tp.reagent_name = text_at(Parameter::ReagentName);
        tp.reagent_dilution_factor = self.number_at(table, Parameter::ReagentDilutionFactor, position, buckets);
        tp.optimem_dilution_factor = self.number_at(table, Parameter::OptimemDilutionFactor, position, buckets);
        if tp.reagent_name.is_none() {
            buckets.add_position(
                "missing_reagent_name",
                DiagnosticCategory::Parse,
                "The following positions lack a reagent name",
                position,
            );
        }
        if tp.reagent_dilution_factor.is_none() && table.get(Parameter::ReagentDilutionFactor, &position).is_none() {
            buckets.add_position(
                "missing_reagent_dilution_factor",
                DiagnosticCategory::Parse,
                "The following positions lack a reagent dilution factor",
                position,
            );
        }
        let is_sample = matches!(position_type, PositionType::Fixed | PositionType::Floating);
        if is_sample && tp.final_concentration.is_none() && table.get(Parameter::FinalConcentration, &position).is_none() {
            buckets.add_position(
                "missing_final_concentration",
                DiagnosticCategory::Parse,
                "The following positions lack a final concentration",
                position,
            );
        }
        if position_type == PositionType::Mock
            && self.config.mock_optimem_dilution
            && tp.optimem_dilution_factor.is_none()
        {
            tp.set_optimem_dilution_factor(self.config.default_optimem_dilution_factor);
        }
        tp
    }

    /// Derives missing ISO concentrations from final concentrations; the
    /// default ISO volume only applies to derived concentrations. An explicit
    /// ISO concentration without a volume stays incomplete and is rejected by
    /// the validity check.
    pub fn complete_iso_values(&self, layout: &mut TransfectionLayout, buckets: &mut ErrorBuckets) -> IsoResult<()> {
        let scenario = self.rules.scenario;
        let positions: Vec<RackPosition> = layout.working_positions().map(|p| p.rack_position).collect();
        for position in positions {
            let Some(tp) = layout.get_working_position_mut(&position)? else {
                continue;
            };
            match tp.position_type() {
                PositionType::Fixed | PositionType::Floating => {}
                PositionType::Mock => {
                    if tp.iso_volume.is_none() {
                        tp.iso_volume = Some(self.config.default_iso_volume_ul);
                    }
                    continue;
                }
                _ => continue,
            }
            if scenario == ExperimentScenario::OrderOnly {
                if let Some(pool) = tp.pool.pool() {
                    tp.iso_concentration = Some(pool.stock_concentration_nm());
                }
                if tp.iso_volume.is_none() {
                    tp.iso_volume = Some(self.config.default_iso_volume_ul);
                }
                continue;
            }
            if scenario == ExperimentScenario::Manual {
                if tp.iso_volume.is_none() || tp.iso_concentration.is_none() {
                    buckets.add_position(
                        "missing_iso_values",
                        DiagnosticCategory::Parse,
                        "The following positions lack an ISO volume or ISO concentration",
                        position,
                    );
                }
                continue;
            }
            if tp.optimem_dilution_factor.is_none() {
                tp.optimem_dilution_factor = Some(self.config.default_optimem_dilution_factor);
            }
            if tp.iso_concentration.is_some() {
                continue;
            }
            if let (Some(fc), Some(odf)) = (tp.final_concentration, tp.optimem_dilution_factor) {
                tp.iso_concentration = Some(fc * self.config.iso_to_final_factor(odf));
                if tp.iso_volume.is_none() {
                    tp.iso_volume = Some(self.config.default_iso_volume_ul);
                }
            }
        }
        Ok(())
    }

    fn check_validity(&self, layout: &TransfectionLayout, buckets: &mut ErrorBuckets) {
        let scenario_name = self.rules.scenario.display_name();
        if !layout.has_fixed() {
            buckets.add_message(
                DiagnosticCategory::Consistency,
                "There are no fixed positions in this ISO layout. Controls are required.",
            );
        }
        for tp in layout.working_positions() {
            let sample = matches!(tp.position_type(), PositionType::Fixed | PositionType::Floating);
            if sample && tp.iso_volume.is_some() != tp.iso_concentration.is_some() {
                buckets.add_position(
                    "partial_iso_values",
                    DiagnosticCategory::Consistency,
                    "The following positions specify only one of ISO volume and ISO concentration",
                    tp.rack_position,
                );
            }
            if sample && tp.iso_volume.is_none() && tp.iso_concentration.is_none() {
                buckets.add_position(
                    "no_iso_values",
                    DiagnosticCategory::Consistency,
                    "Unable to determine ISO volume and concentration for the following positions",
                    tp.rack_position,
                );
            }
            let Some(iso_concentration) = tp.iso_concentration else {
                continue;
            };
            match &tp.pool {
                PoolReference::Fixed(pool) => {
                    let stock = pool.stock_concentration_nm();
                    if is_larger_than(iso_concentration, stock) {
                        buckets.add_position(
                            "above_stock_concentration",
                            DiagnosticCategory::Consistency,
                            "The ISO concentration of the following positions exceeds the stock concentration of their pool",
                            tp.rack_position,
                        );
                    } else if are_equal_values(iso_concentration, stock) && !self.rules.allows_stock_concentration {
                        buckets.add_position(
                            "at_stock_concentration",
                            DiagnosticCategory::Consistency,
                            &format!(
                                "ISO concentrations equal to the stock concentration are not allowed for the {scenario_name} scenario"
                            ),
                            tp.rack_position,
                        );
                    }
                }
                PoolReference::Floating(_) => {
                    if is_larger_than(iso_concentration, self.config.floating_stock_concentration_nm) {
                        buckets.add_position(
                            "above_floating_stock_concentration",
                            DiagnosticCategory::Consistency,
                            &format!(
                                "The ISO concentration of the following floating positions exceeds the stock concentration for floating pools ({} nM)",
                                self.config.floating_stock_concentration_nm
                            ),
                            tp.rack_position,
                        );
                    }
                }
                _ => {}
            }
        }
        match self.rules.scenario {
            ExperimentScenario::Manual => self.check_manual_duplicates(layout, buckets),
            ExperimentScenario::OrderOnly => self.check_unique_pools(layout, buckets),
            ExperimentScenario::Library => self.check_library_positions(layout, buckets),
            _ => {}
        }
    }

    fn duplicate_pools(layout: &TransfectionLayout) -> Vec<(String, Vec<RackPosition>)> {
        layout
            .positions_by_pool()
            .into_iter()
            .filter(|(_, positions)| positions.len() > 1)
            .map(|(key, positions)| (key.to_string(), positions))
            .collect()
    }

    fn check_manual_duplicates(&self, layout: &TransfectionLayout, buckets: &mut ErrorBuckets) {
        for (key, positions) in Self::duplicate_pools(layout) {
            let reject = match self.config.manual_duplicate_pool_policy {
                ManualDuplicatePoolPolicy::Strict => true,
                ManualDuplicatePoolPolicy::AllowBelowStock => positions.iter().any(|p| {
                    layout.get_working_position(p).is_some_and(|tp| {
                        match (tp.pool.pool(), tp.iso_concentration) {
                            (Some(pool), Some(c)) => are_equal_values(c, pool.stock_concentration_nm()),
                            _ => false,
                        }
                    })
                }),
            };
            if reject {
                buckets.add_detail(
                    "duplicate_pool",
                    DiagnosticCategory::Consistency,
                    "Each molecule design pool may occur only once in a manual optimisation layout. \
                     The following pools occur several times",
                    format!("{key} ({})", positions.iter().map(RackPosition::label).join(", ")),
                );
            }
        }
    }

    fn check_unique_pools(&self, layout: &TransfectionLayout, buckets: &mut ErrorBuckets) {
        for (key, positions) in Self::duplicate_pools(layout) {
            buckets.add_detail(
                "duplicate_pool",
                DiagnosticCategory::Consistency,
                "Each molecule design pool may occur only once in an ISO without experiment. \
                 The following pools occur several times",
                format!("{key} ({})", positions.iter().map(RackPosition::label).join(", ")),
            );
        }
    }

    fn check_library_positions(&self, layout: &TransfectionLayout, buckets: &mut ErrorBuckets) {
        let Some(library) = self.library_layout else {
            buckets.add_message(
                DiagnosticCategory::Consistency,
                "A library screening layout requires a library base layout.",
            );
            return;
        };
        if library.shape != layout.shape() {
            buckets.add_message(
                DiagnosticCategory::Consistency,
                format!(
                    "The rack shape of the layout ({}) does not match the rack shape of the library ({}).",
                    layout.shape().name(),
                    library.shape.name()
                ),
            );
            return;
        }
        for position in layout.shape().positions() {
            let tp = layout.get_working_position(&position);
            let is_floating = tp.is_some_and(TransfectionPosition::is_floating);
            if library.is_library_position(&position) && !is_floating {
                buckets.add_position(
                    "reserved_library_position",
                    DiagnosticCategory::Consistency,
                    "The following positions are reserved for library samples",
                    position,
                );
            } else if !library.is_library_position(&position) && is_floating {
                buckets.add_position(
                    "floating_outside_library",
                    DiagnosticCategory::Consistency,
                    "The following positions must not be floating positions because they are not \
                     reserved for library samples",
                    position,
                );
            }
        }
    }

    /// Renames floating placeholders to md_001, md_002, ... and returns the
    /// sector association for screening layouts where one applies.
    fn sort_floatings(&self, layout: &mut TransfectionLayout) -> IsoResult<Option<RackSectorAssociation>> {
        if !layout.has_floatings() {
            return Ok(None);
        }
        let association = if self.rules.scenario == ExperimentScenario::Screening {
            RackSectorAssociator::new(layout).associate()?
        } else {
            None
        };
        let mapping = match &association {
            Some(association) if layout.iso_concentrations(PositionType::Floating).len() > 1 => {
                sort_floatings_by_sector(layout, association)?
            }
            _ => sort_floatings_by_position(layout),
        };
        layout.rename_floatings(&mapping)?;
        Ok(association)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{InMemoryPoolAggregate, MoleculeDesignPool};
    use crate::rack::SHAPE_96;

    fn pools() -> InMemoryPoolAggregate {
        InMemoryPoolAggregate::new([
            MoleculeDesignPool::new(205200, "SIRNA", 5e-5),
            MoleculeDesignPool::new(330001, "SIRNA", 5e-5),
        ])
    }

    fn optimisation_layout(pool_cells: &[(&str, &str)]) -> ParsedLayout {
        ParsedLayout::new(8, 12)
            .with_parameter(
                "molecule design pool",
                ParsedParameter::from_layout(pool_cells.iter().copied()),
            )
            .with_parameter("final concentration", ParsedParameter::from_metadata("10"))
            .with_parameter("reagent name", ParsedParameter::from_metadata("mix"))
            .with_parameter("reagent dilution factor", ParsedParameter::from_metadata("1400"))
    }

    fn messages(err: IsoError) -> Vec<String> {
        err.into_manifest()
            .diagnostics
            .into_iter()
            .map(|d| d.detail)
            .collect()
    }

    #[test]
    fn test_optimisation_completion() {
        let pools = pools();
        let config = PlannerConfig::default();
        let parsed = optimisation_layout(&[("A1", "205200"), ("B1", "md_7"), ("C1", "mock")]);
        let result = LayoutHandler::new(ExperimentScenario::Optimisation, &pools, &config)
            .parse(&parsed)
            .unwrap();
        let a1 = result.layout.get_working_position(&RackPosition::new(0, 0)).unwrap();
        assert_eq!(a1.iso_concentration, Some(420.0));
        assert_eq!(a1.iso_volume, Some(10.0));
        let b1 = result.layout.get_working_position(&RackPosition::new(1, 0)).unwrap();
        assert_eq!(b1.pool, PoolReference::Floating("md_001".into()));
        let c1 = result.layout.get_working_position(&RackPosition::new(2, 0)).unwrap();
        assert!(c1.is_mock());
        assert_eq!(c1.optimem_dilution_factor, None);
        assert!(result.layout.is_closed());
        assert_eq!(result.layout.shape(), SHAPE_96);
    }

    #[test]
    fn test_errors_are_batched_per_bucket() {
        let pools = pools();
        let config = PlannerConfig::default();
        let parsed = optimisation_layout(&[("A2", "205200"), ("A10", "999"), ("B2", "205200"), ("A1", "abc"), ("C3", "205200")])
            .with_parameter(
                "iso volume",
                ParsedParameter::from_layout([("A2", "-1"), ("A10", "5"), ("B2", "x"), ("C3", "10")]),
            )
            .with_parameter("iso concentration", ParsedParameter::from_metadata("50"));
        let err = LayoutHandler::new(ExperimentScenario::Optimisation, &pools, &config)
            .parse(&parsed)
            .unwrap_err();
        let details = messages(err);
        assert!(details.contains(&"Invalid iso volume (must be a positive number): A2, B2.".to_string()));
        assert!(details.contains(&"Invalid molecule design pool values: A1.".to_string()));
        assert!(details
            .iter()
            .any(|d| d.starts_with("Unable to find molecule design pools") && d.contains("999 (A10)")));
    }

    #[test]
    fn test_missing_controls() {
        let pools = pools();
        let config = PlannerConfig::default();
        let parsed = optimisation_layout(&[("A1", "md_1")]);
        let err = LayoutHandler::new(ExperimentScenario::Optimisation, &pools, &config)
            .parse(&parsed)
            .unwrap_err();
        assert!(messages(err).iter().any(|d| d.contains("Controls are required")));
    }

    #[test]
    fn test_manual_rejects_transfection_parameters_and_mock() {
        let pools = pools();
        let config = PlannerConfig::default();
        let parsed = optimisation_layout(&[("A1", "205200"), ("B1", "mock")]);
        let err = LayoutHandler::new(ExperimentScenario::Manual, &pools, &config)
            .parse(&parsed)
            .unwrap_err();
        let details = messages(err);
        assert!(details
            .iter()
            .any(|d| d.starts_with("The following parameters are not allowed") && d.contains("reagent_name")));
        assert!(details
            .iter()
            .any(|d| d.contains("not supported by the manual optimisation scenario: B1.")));
    }

    fn manual_layout(cells: &[(&str, &str, &str)]) -> ParsedLayout {
        ParsedLayout::new(8, 12)
            .with_parameter(
                "molecule design pool",
                ParsedParameter::from_layout(cells.iter().map(|(l, p, _)| (*l, *p))),
            )
            .with_parameter(
                "iso concentration",
                ParsedParameter::from_layout(cells.iter().map(|(l, _, c)| (*l, *c))),
            )
            .with_parameter("iso volume", ParsedParameter::from_metadata("5"))
    }

    #[test]
    fn test_manual_stock_concentration_uniqueness() {
        let pools = pools();
        let config = PlannerConfig::default();
        let handler = LayoutHandler::new(ExperimentScenario::Manual, &pools, &config);
        handler
            .parse(&manual_layout(&[("A1", "205200", "50000")]))
            .unwrap();
        let err = handler
            .parse(&manual_layout(&[("A1", "205200", "50000"), ("B1", "205200", "50000")]))
            .unwrap_err();
        let details = messages(err);
        assert_eq!(details.len(), 1);
        assert!(details[0].starts_with("Each molecule design pool may occur only once"));
        assert!(details[0].contains("205200 (A1, B1)"));
    }

    #[test]
    fn test_manual_duplicate_policy_flag() {
        let pools = pools();
        let config = PlannerConfig {
            manual_duplicate_pool_policy: ManualDuplicatePoolPolicy::AllowBelowStock,
            ..PlannerConfig::default()
        };
        let handler = LayoutHandler::new(ExperimentScenario::Manual, &pools, &config);
        handler
            .parse(&manual_layout(&[("A1", "205200", "500"), ("B1", "205200", "100")]))
            .unwrap();
        assert!(handler
            .parse(&manual_layout(&[("A1", "205200", "50000"), ("B1", "205200", "100")]))
            .is_err());
    }

    #[test]
    fn test_screening_requires_metadata() {
        let pools = pools();
        let config = PlannerConfig::default();
        let parsed = optimisation_layout(&[("A1", "205200")])
            .with_parameter("iso concentration", ParsedParameter::from_layout([("A1", "100")]));
        let err = LayoutHandler::new(ExperimentScenario::Screening, &pools, &config)
            .parse(&parsed)
            .unwrap_err();
        assert!(messages(err)
            .contains(&"The following metadata are missing: iso_volume, number_aliquots.".to_string()));
    }

    #[test]
    fn test_iso_volume_layout_not_allowed_for_screening() {
        let pools = pools();
        let config = PlannerConfig::default();
        let parsed = optimisation_layout(&[("A1", "205200")])
            .with_parameter("iso volume", ParsedParameter::from_layout([("A1", "5")]))
            .with_metadata("number of aliquots", "1");
        let err = LayoutHandler::new(ExperimentScenario::Screening, &pools, &config)
            .parse(&parsed)
            .unwrap_err();
        assert!(messages(err)
            .iter()
            .any(|d| d.starts_with("The following parameters must not be specified as layouts") && d.contains("iso_volume")));
    }

    #[test]
    fn test_request_metadata() {
        let pools = pools();
        let config = PlannerConfig::default();
        let parsed = optimisation_layout(&[("A1", "205200")])
            .with_metadata("delivery date", "01.02.2014")
            .with_metadata("plate set label", "my set")
            .with_metadata("number of aliquots", "2");
        let result = LayoutHandler::new(ExperimentScenario::Optimisation, &pools, &config)
            .parse(&parsed)
            .unwrap();
        assert_eq!(result.metadata.number_aliquots, 2);
        assert_eq!(result.metadata.plate_set_label.as_deref(), Some("my_set"));
        assert!(result.metadata.delivery_date.is_some());

        let bad = optimisation_layout(&[("A1", "205200")]).with_metadata("delivery date", "2014-02-01");
        assert!(LayoutHandler::new(ExperimentScenario::Optimisation, &pools, &config)
            .parse(&bad)
            .is_err());
    }

    #[test]
    fn test_unknown_layout_parameters_become_additional_tags() {
        let pools = pools();
        let config = PlannerConfig::default();
        let parsed = optimisation_layout(&[("A1", "205200"), ("B1", "205200")])
            .with_parameter("cell line", ParsedParameter::from_layout([("A1", "HeLa"), ("B1", "HeLa")]));
        let result = LayoutHandler::new(ExperimentScenario::Optimisation, &pools, &config)
            .parse(&parsed)
            .unwrap();
        assert_eq!(result.additional_tags.len(), 1);
        let (tag, positions) = &result.additional_tags[0];
        assert_eq!(tag.predicate, "cell_line");
        assert_eq!(positions.len(), 2);
        let rack_layout = result.create_rack_layout();
        assert_eq!(rack_layout.positions_for_predicate(ADDITIONAL_TAG_DOMAIN, "cell_line").len(), 2);
    }

    #[test]
    fn test_mock_optimem_dilution_flag() {
        let pools = pools();
        let config = PlannerConfig {
            mock_optimem_dilution: true,
            ..PlannerConfig::default()
        };
        let parsed = optimisation_layout(&[("A1", "205200"), ("B1", "mock")]);
        let result = LayoutHandler::new(ExperimentScenario::Optimisation, &pools, &config)
            .parse(&parsed)
            .unwrap();
        let b1 = result.layout.get_working_position(&RackPosition::new(1, 0)).unwrap();
        assert_eq!(b1.optimem_dilution_factor, Some(3.0));
    }

    #[test]
    fn test_order_only_defaults_to_stock_concentration() {
        let pools = pools();
        let config = PlannerConfig::default();
        let parsed = ParsedLayout::new(8, 12)
            .with_parameter(
                "molecule design pool",
                ParsedParameter::from_layout([("A1", "205200"), ("B1", "330001")]),
            )
            .with_parameter("iso volume", ParsedParameter::from_metadata("20"));
        let result = LayoutHandler::new(ExperimentScenario::OrderOnly, &pools, &config)
            .parse(&parsed)
            .unwrap();
        for tp in result.layout.working_positions() {
            assert_eq!(tp.iso_concentration, Some(50_000.0));
            assert_eq!(tp.iso_volume, Some(20.0));
        }
        let duplicate = ParsedLayout::new(8, 12).with_parameter(
            "molecule design pool",
            ParsedParameter::from_layout([("A1", "205200"), ("B1", "205200")]),
        );
        assert!(LayoutHandler::new(ExperimentScenario::OrderOnly, &pools, &config)
            .parse(&duplicate)
            .is_err());
    }
}
