use crate::rack::RackPosition;
use isoplan_protocol::{Diagnostic, DiagnosticCategory, DiagnosticManifest};
use itertools::Itertools;
use std::collections::BTreeSet;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IsoError {
    #[error("{0}")]
    Parse(String),
    #[error("{0}")]
    Consistency(String),
    #[error("{0}")]
    Planning(String),
    #[error("{0}")]
    Resource(String),
    #[error("internal error: {0}")]
    Programmer(String),
    #[error("{} problem(s) found: {}", .0.diagnostics.len(), .0.diagnostics.iter().map(|d| d.detail.as_str()).join(" | "))]
    Batch(DiagnosticManifest),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type IsoResult<T> = Result<T, IsoError>;

impl IsoError {
    pub fn parse(message: impl Into<String>) -> Self {
        Self::Parse(message.into())
    }

    pub fn consistency(message: impl Into<String>) -> Self {
        Self::Consistency(message.into())
    }

    pub fn planning(message: impl Into<String>) -> Self {
        Self::Planning(message.into())
    }

    pub fn resource(message: impl Into<String>) -> Self {
        Self::Resource(message.into())
    }

    pub fn programmer(message: impl Into<String>) -> Self {
        Self::Programmer(message.into())
    }

    pub fn category(&self) -> DiagnosticCategory {
        match self {
            Self::Parse(_) | Self::Serde(_) => DiagnosticCategory::Parse,
            Self::Consistency(_) => DiagnosticCategory::Consistency,
            Self::Planning(_) => DiagnosticCategory::Planning,
            Self::Resource(_) | Self::Io(_) => DiagnosticCategory::Resource,
            Self::Programmer(_) => DiagnosticCategory::Programmer,
            Self::Batch(manifest) => manifest
                .diagnostics
                .first()
                .map(|d| d.category)
                .unwrap_or(DiagnosticCategory::Programmer),
        }
    }

    /// Flattens the error into manifest form.
    pub fn into_manifest(self) -> DiagnosticManifest {
        match self {
            Self::Batch(manifest) => manifest,
            other => {
                let mut manifest = DiagnosticManifest::default();
                manifest.diagnostics.push(Diagnostic {
                    category: other.category(),
                    detail: other.to_string(),
                });
                manifest
            }
        }
    }
}

#[derive(Clone, Debug)]
struct Bucket {
    key: &'static str,
    category: DiagnosticCategory,
    message: String,
    positions: BTreeSet<RackPosition>,
    details: BTreeSet<String>,
}

/// Collects problems of one phase without aborting on the first one. Each
/// non-empty bucket renders to exactly one diagnostic.
#[derive(Clone, Debug, Default)]
pub struct ErrorBuckets {
    buckets: Vec<Bucket>,
    messages: Vec<Diagnostic>,
    warnings: Vec<String>,
}

impl ErrorBuckets {
    pub fn new() -> Self {
        Self::default()
    }

    fn bucket_mut(
        &mut self,
        key: &'static str,
        category: DiagnosticCategory,
        message: &str,
    ) -> &mut Bucket {
        let idx = match self.buckets.iter().position(|b| b.key == key) {
            Some(idx) => idx,
            None => {
                self.buckets.push(Bucket {
                    key,
                    category,
                    message: message.to_string(),
                    positions: BTreeSet::new(),
                    details: BTreeSet::new(),
                });
                self.buckets.len() - 1
            }
        };
        &mut self.buckets[idx]
    }

    pub fn add_position(
        &mut self,
        key: &'static str,
        category: DiagnosticCategory,
        message: &str,
        position: RackPosition,
    ) {
        self.bucket_mut(key, category, message)
            .positions
            .insert(position);
    }

    /// Adds a free-text item (e.g. "205200 (A1, B1)") to a bucket.
    pub fn add_detail(
        &mut self,
        key: &'static str,
        category: DiagnosticCategory,
        message: &str,
        detail: impl Into<String>,
    ) {
        self.bucket_mut(key, category, message)
            .details
            .insert(detail.into());
    }

    pub fn add_message(&mut self, category: DiagnosticCategory, detail: impl Into<String>) {
        self.messages.push(Diagnostic {
            category,
            detail: detail.into(),
        });
    }

    pub fn add_warning(&mut self, warning: impl Into<String>) {
        self.warnings.push(warning.into());
    }

    pub fn has_errors(&self) -> bool {
        !self.messages.is_empty() || !self.buckets.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.buckets.iter().any(|b| b.key == key)
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn into_manifest(self) -> DiagnosticManifest {
        let mut manifest = DiagnosticManifest::default();
        for bucket in self.buckets {
            let mut items: Vec<String> = bucket.positions.iter().map(|p| p.label()).collect();
            items.extend(bucket.details);
            manifest.push(
                bucket.category,
                format!("{}: {}.", bucket.message, items.join(", ")),
            );
        }
        manifest.diagnostics.extend(self.messages);
        manifest.warnings = self.warnings;
        manifest
    }

    /// `Ok(warnings)` if nothing went wrong, the batched report otherwise.
    pub fn finish(self) -> Result<Vec<String>, IsoError> {
        if self.has_errors() {
            Err(IsoError::Batch(self.into_manifest()))
        } else {
            Ok(self.warnings)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buckets_render_sorted_positions() {
        let mut errors = ErrorBuckets::new();
        let b2 = RackPosition::from_label("B2").unwrap();
        let a10 = RackPosition::from_label("A10").unwrap();
        let a2 = RackPosition::from_label("A2").unwrap();
        for pos in [b2, a10, a2] {
            errors.add_position(
                "invalid_volume",
                DiagnosticCategory::Parse,
                "Invalid ISO volume",
                pos,
            );
        }
        errors.add_message(DiagnosticCategory::Consistency, "No controls");
        let manifest = errors.into_manifest();
        assert_eq!(manifest.diagnostics.len(), 2);
        assert_eq!(
            manifest.diagnostics[0].detail,
            "Invalid ISO volume: A2, A10, B2."
        );
        assert_eq!(
            manifest.diagnostics[1].category,
            DiagnosticCategory::Consistency
        );
    }

    #[test]
    fn test_finish_without_errors_returns_warnings() {
        let mut errors = ErrorBuckets::new();
        errors.add_warning("supplier ignored");
        assert_eq!(errors.finish().unwrap(), vec!["supplier ignored".to_string()]);
    }

    #[test]
    fn test_error_category_and_manifest() {
        let err = IsoError::planning("no reservoir specs fit");
        assert_eq!(err.category(), DiagnosticCategory::Planning);
        let manifest = err.into_manifest();
        assert_eq!(manifest.diagnostics[0].detail, "no reservoir specs fit");
    }
}
