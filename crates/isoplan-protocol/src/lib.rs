//! Machine-readable contracts shared between the ISO planning core and its
//! collaborators (the external layout parser on the way in, persistence and
//! reporting on the way out).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The experiment scenario an ISO request belongs to.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExperimentScenario {
    Optimisation,
    Screening,
    Library,
    Manual,
    OrderOnly,
}

impl ExperimentScenario {
    pub const ALL: [Self; 5] = [
        Self::Optimisation,
        Self::Screening,
        Self::Library,
        Self::Manual,
        Self::OrderOnly,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Optimisation => "OPTIMISATION",
            Self::Screening => "SCREENING",
            Self::Library => "LIBRARY",
            Self::Manual => "MANUAL",
            Self::OrderOnly => "ORDER_ONLY",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Self::Optimisation => "optimisation",
            Self::Screening => "screening",
            Self::Library => "library screening",
            Self::Manual => "manual optimisation",
            Self::OrderOnly => "ISO without experiment",
        }
    }

    pub fn parse(text: &str) -> Option<Self> {
        let norm = text.trim().to_ascii_uppercase().replace([' ', '-'], "_");
        Self::ALL.into_iter().find(|s| s.as_str() == norm)
    }
}

/// Rack dimensions as reported by the parser.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct RackDimensions {
    pub rows: u16,
    pub columns: u16,
}

/// One parameter as found by the external parser. `well_map` maps position
/// labels ("A1") to raw cell values and is only meaningful if `has_layout`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParsedParameter {
    pub has_layout: bool,
    pub metadata_value: Option<String>,
    pub well_map: BTreeMap<String, String>,
}

impl ParsedParameter {
    pub fn from_layout<I, K, V>(values: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            has_layout: true,
            metadata_value: None,
            well_map: values
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn from_metadata(value: &str) -> Self {
        Self {
            has_layout: false,
            metadata_value: Some(value.to_string()),
            well_map: BTreeMap::new(),
        }
    }
}

/// A tag the parser found that does not belong to a known parameter.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AdditionalTag {
    pub domain: String,
    pub predicate: String,
    pub value: String,
    pub positions: Vec<String>,
}

/// Output of the external layout parser: the only input shape the core
/// accepts for experiment designs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParsedLayout {
    pub shape: RackDimensions,
    #[serde(default)]
    pub metadata: BTreeMap<String, Option<String>>,
    #[serde(default)]
    pub parameters: BTreeMap<String, ParsedParameter>,
    #[serde(default)]
    pub additional_tags: Vec<AdditionalTag>,
}

impl ParsedLayout {
    pub fn new(rows: u16, columns: u16) -> Self {
        Self {
            shape: RackDimensions { rows, columns },
            metadata: BTreeMap::new(),
            parameters: BTreeMap::new(),
            additional_tags: vec![],
        }
    }

    pub fn with_metadata(mut self, name: &str, value: &str) -> Self {
        self.metadata
            .insert(name.to_string(), Some(value.to_string()));
        self
    }

    pub fn with_parameter(mut self, name: &str, parameter: ParsedParameter) -> Self {
        self.parameters.insert(name.to_string(), parameter);
        self
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticCategory {
    Parse,
    Consistency,
    Planning,
    Resource,
    Programmer,
}

impl DiagnosticCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Parse => "parse",
            Self::Consistency => "consistency",
            Self::Planning => "planning",
            Self::Resource => "resource",
            Self::Programmer => "programmer",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub category: DiagnosticCategory,
    pub detail: String,
}

/// What a failed (or partially successful) planning pass reports back.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiagnosticManifest {
    pub diagnostics: Vec<Diagnostic>,
    pub warnings: Vec<String>,
}

impl DiagnosticManifest {
    pub fn push(&mut self, category: DiagnosticCategory, detail: impl Into<String>) {
        self.diagnostics.push(Diagnostic {
            category,
            detail: detail.into(),
        });
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    pub fn has_errors(&self) -> bool {
        !self.diagnostics.is_empty()
    }

    pub fn details(&self, category: DiagnosticCategory) -> Vec<&str> {
        self.diagnostics
            .iter()
            .filter(|d| d.category == category)
            .map(|d| d.detail.as_str())
            .collect()
    }

    pub fn extend(&mut self, other: DiagnosticManifest) {
        self.diagnostics.extend(other.diagnostics);
        self.warnings.extend(other.warnings);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scenario_parse() {
        assert_eq!(
            ExperimentScenario::parse("order only"),
            Some(ExperimentScenario::OrderOnly)
        );
        assert_eq!(
            ExperimentScenario::parse("screening"),
            Some(ExperimentScenario::Screening)
        );
        assert_eq!(ExperimentScenario::parse("qPCR"), None);
    }

    #[test]
    fn test_parsed_layout_json() {
        let json = r#"{
            "shape": {"rows": 8, "columns": 12},
            "metadata": {"number_aliquots": "1", "comment": null},
            "parameters": {
                "molecule_design_pool_id": {"has_layout": true, "well_map": {"A1": "205200"}}
            }
        }"#;
        let layout: ParsedLayout = serde_json::from_str(json).unwrap();
        assert_eq!(layout.shape.rows, 8);
        assert_eq!(layout.metadata.get("comment"), Some(&None));
        let pools = layout.parameters.get("molecule_design_pool_id").unwrap();
        assert!(pools.has_layout);
        assert_eq!(pools.well_map.get("A1").map(String::as_str), Some("205200"));
        assert!(layout.additional_tags.is_empty());
    }

    #[test]
    fn test_manifest_categories() {
        let mut manifest = DiagnosticManifest::default();
        assert!(!manifest.has_errors());
        manifest.push(DiagnosticCategory::Parse, "Invalid ISO volume: A1");
        manifest.push(DiagnosticCategory::Planning, "No reservoir");
        manifest.warn("only 2 ISOs");
        assert!(manifest.has_errors());
        assert_eq!(
            manifest.details(DiagnosticCategory::Parse),
            vec!["Invalid ISO volume: A1"]
        );
        let text = serde_json::to_string(&manifest).unwrap();
        assert!(text.contains("\"planning\""));
    }
}
