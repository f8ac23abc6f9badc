//! Request-level metadata: delivery date, plate set label, aliquot count.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

pub const DATE_FORMAT: &str = "%d.%m.%Y";
pub const DATE_PLACEHOLDER: &str = "dd.MM.yyyy";

/// Plate labels hold 20 characters; multi-plate requests keep one for the
/// plate suffix.
pub const MAX_PLATE_SET_LABEL_LENGTH: usize = 16;
pub const MAX_PLATE_SET_LABEL_LENGTH_SINGLE_PLATE: usize = 20;

/// `Ok(None)` for missing values and the literal placeholder.
pub fn parse_delivery_date(text: Option<&str>) -> Result<Option<NaiveDate>, String> {
    let Some(text) = text.map(str::trim).filter(|t| !t.is_empty()) else {
        return Ok(None);
    };
    if text.eq_ignore_ascii_case(DATE_PLACEHOLDER) {
        return Ok(None);
    }
    NaiveDate::parse_from_str(text, DATE_FORMAT)
        .map(Some)
        .map_err(|_| {
            format!("Invalid delivery date \"{text}\". Please use the format {DATE_PLACEHOLDER}.")
        })
}

/// Replaces spaces and enforces the length limit.
pub fn normalize_plate_set_label(label: &str, single_plate: bool) -> Result<String, String> {
    let normalized = label.trim().replace(' ', "_");
    if normalized.is_empty() {
        return Err("The plate set label must not be empty.".to_string());
    }
    let max = if single_plate {
        MAX_PLATE_SET_LABEL_LENGTH_SINGLE_PLATE
    } else {
        MAX_PLATE_SET_LABEL_LENGTH
    };
    let length = normalized.chars().count();
    if length > max {
        return Err(format!(
            "The plate set label \"{normalized}\" is too long ({length} characters, maximum {max})."
        ));
    }
    Ok(normalized)
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IsoRequestMetadata {
    pub delivery_date: Option<NaiveDate>,
    pub plate_set_label: Option<String>,
    pub number_aliquots: u32,
    pub comment: Option<String>,
}

impl Default for IsoRequestMetadata {
    fn default() -> Self {
        Self {
            delivery_date: None,
            plate_set_label: None,
            number_aliquots: 1,
            comment: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delivery_date() {
        assert_eq!(
            parse_delivery_date(Some("24.12.2013")).unwrap(),
            NaiveDate::from_ymd_opt(2013, 12, 24)
        );
        assert_eq!(parse_delivery_date(Some("DD.MM.YYYY")).unwrap(), None);
        assert_eq!(parse_delivery_date(None).unwrap(), None);
        assert_eq!(parse_delivery_date(Some("  ")).unwrap(), None);
        assert!(parse_delivery_date(Some("none")).is_err());
        assert!(parse_delivery_date(Some("2013-12-24")).is_err());
        assert!(parse_delivery_date(Some("31.02.2013")).is_err());
    }

    #[test]
    fn test_plate_set_label() {
        assert_eq!(normalize_plate_set_label("my screen", false).unwrap(), "my_screen");
        assert!(normalize_plate_set_label("a label that is way too long", false).is_err());
        assert!(normalize_plate_set_label("seventeen_chars_x", false).is_err());
        assert_eq!(
            normalize_plate_set_label("seventeen_chars_x", true).unwrap(),
            "seventeen_chars_x"
        );
        assert!(normalize_plate_set_label("  ", true).is_err());
    }
}
