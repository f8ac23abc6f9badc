use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

pub const DOMAIN_POOL: &str = "molecule_design_pool";
pub const DOMAIN_ISO: &str = "iso";
pub const DOMAIN_TRANSFECTION: &str = "transfection";
pub const DOMAIN_SAMPLE_TRANSFER: &str = "sample_transfer";
pub const DOMAIN_PREPARATION: &str = "preparation";

/// A (domain, predicate, value) triple as persisted per rack position set.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Tag {
    pub domain: String,
    pub predicate: String,
    pub value: String,
}

impl Tag {
    pub fn new(domain: &str, predicate: &str, value: impl Into<String>) -> Self {
        Self {
            domain: domain.to_string(),
            predicate: predicate.to_string(),
            value: value.into(),
        }
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}={}", self.domain, self.predicate, self.value)
    }
}

/// Lower-cases and maps "-", " " to "_" so alias lookups are tolerant.
pub fn normalize_alias(name: &str) -> String {
    name.trim()
        .to_lowercase()
        .chars()
        .map(|c| if c == '-' || c == ' ' { '_' } else { c })
        .collect()
}

/// Every parameter a transfection or preparation position (or the request
/// metadata) may carry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Parameter {
    MoleculeDesignPool,
    IsoVolume,
    IsoConcentration,
    Supplier,
    ReagentName,
    ReagentDilutionFactor,
    FinalConcentration,
    OptimemDilutionFactor,
    PositionType,
    TransferTargets,
    PreparationConcentration,
    PreparationVolume,
    NumberAliquots,
    DeliveryDate,
    PlateSetLabel,
    Comment,
}

impl Parameter {
    pub const POSITION_PARAMETERS: [Self; 9] = [
        Self::MoleculeDesignPool,
        Self::PositionType,
        Self::IsoVolume,
        Self::IsoConcentration,
        Self::Supplier,
        Self::ReagentName,
        Self::ReagentDilutionFactor,
        Self::FinalConcentration,
        Self::OptimemDilutionFactor,
    ];

    pub const ALL: [Self; 16] = [
        Self::MoleculeDesignPool,
        Self::IsoVolume,
        Self::IsoConcentration,
        Self::Supplier,
        Self::ReagentName,
        Self::ReagentDilutionFactor,
        Self::FinalConcentration,
        Self::OptimemDilutionFactor,
        Self::PositionType,
        Self::TransferTargets,
        Self::PreparationConcentration,
        Self::PreparationVolume,
        Self::NumberAliquots,
        Self::DeliveryDate,
        Self::PlateSetLabel,
        Self::Comment,
    ];

    pub fn predicate(self) -> &'static str {
        match self {
            Self::MoleculeDesignPool => "molecule_design_pool_id",
            Self::IsoVolume => "iso_volume",
            Self::IsoConcentration => "iso_concentration",
            Self::Supplier => "supplier",
            Self::ReagentName => "reagent_name",
            Self::ReagentDilutionFactor => "reagent_dilution_factor",
            Self::FinalConcentration => "final_concentration",
            Self::OptimemDilutionFactor => "optimem_dilution_factor",
            Self::PositionType => "position_type",
            Self::TransferTargets => "transfer_targets",
            Self::PreparationConcentration => "preparation_concentration",
            Self::PreparationVolume => "preparation_volume",
            Self::NumberAliquots => "number_aliquots",
            Self::DeliveryDate => "delivery_date",
            Self::PlateSetLabel => "plate_set_label",
            Self::Comment => "comment",
        }
    }

    pub fn domain(self) -> &'static str {
        match self {
            Self::MoleculeDesignPool => DOMAIN_POOL,
            Self::IsoVolume
            | Self::IsoConcentration
            | Self::Supplier
            | Self::PositionType
            | Self::NumberAliquots
            | Self::DeliveryDate
            | Self::PlateSetLabel
            | Self::Comment => DOMAIN_ISO,
            Self::ReagentName
            | Self::ReagentDilutionFactor
            | Self::FinalConcentration
            | Self::OptimemDilutionFactor => DOMAIN_TRANSFECTION,
            Self::TransferTargets => DOMAIN_SAMPLE_TRANSFER,
            Self::PreparationConcentration | Self::PreparationVolume => DOMAIN_PREPARATION,
        }
    }

    /// Normalized aliases including the predicate itself.
    pub fn aliases(self) -> BTreeSet<String> {
        let extra: &[&str] = match self {
            Self::MoleculeDesignPool => &[
                "molecule design set ID",
                "molecule design pool",
                "molecule design pool ID",
                "pool ID",
            ],
            Self::IsoVolume => &["ISO volume", "ISO volume (ul)"],
            Self::IsoConcentration => &["ISO concentration", "ISO concentration (nM)"],
            Self::Supplier => &["supplier"],
            Self::ReagentName => &["reagent name", "transfection reagent"],
            Self::ReagentDilutionFactor => &["reagent dilution factor", "final dilution factor"],
            Self::FinalConcentration => &["final concentration", "final concentration (nM)"],
            Self::OptimemDilutionFactor => &["optimem dilution factor", "optimem dil factor"],
            Self::PositionType => &["position type"],
            Self::TransferTargets => &["transfer targets"],
            Self::PreparationConcentration => &["preparation concentration"],
            Self::PreparationVolume => &["preparation volume", "required volume"],
            Self::NumberAliquots => &["number of aliquots", "aliquots"],
            Self::DeliveryDate => &["delivery date"],
            Self::PlateSetLabel => &["plate set label", "label"],
            Self::Comment => &["comment", "comments"],
        };
        let mut ret: BTreeSet<String> = extra.iter().map(|a| normalize_alias(a)).collect();
        ret.insert(normalize_alias(self.predicate()));
        ret
    }

    pub fn from_alias(name: &str) -> Option<Self> {
        let needle = normalize_alias(name);
        Self::ALL
            .into_iter()
            .find(|p| p.aliases().contains(&needle))
    }

    pub fn from_predicate(predicate: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.predicate() == predicate)
    }

    pub fn is_numeric(self) -> bool {
        matches!(
            self,
            Self::IsoVolume
                | Self::IsoConcentration
                | Self::ReagentDilutionFactor
                | Self::FinalConcentration
                | Self::OptimemDilutionFactor
                | Self::PreparationConcentration
                | Self::PreparationVolume
                | Self::NumberAliquots
        )
    }

    pub fn is_transfection_parameter(self) -> bool {
        self.domain() == DOMAIN_TRANSFECTION
    }

    pub fn display_name(self) -> String {
        self.predicate().replace('_', " ")
    }
}

impl fmt::Display for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.predicate())
    }
}
