// Volume and concentration helpers. Planning code works in µL and nM; the
// persistence boundary stores litres and molar.

pub const TOLERANCE: f64 = 1e-3;

pub const VOLUME_CONVERSION_FACTOR: f64 = 1e6;
pub const CONCENTRATION_CONVERSION_FACTOR: f64 = 1e9;

#[inline(always)]
pub fn are_equal_values(a: f64, b: f64) -> bool {
    (a - b).abs() < TOLERANCE
}

#[inline(always)]
pub fn is_smaller_than(a: f64, b: f64) -> bool {
    a - b < -TOLERANCE
}

#[inline(always)]
pub fn is_larger_than(a: f64, b: f64) -> bool {
    a - b > TOLERANCE
}

/// Rounds away from zero to the given number of decimal places.
pub fn round_up(value: f64, decimal_places: i32) -> f64 {
    let factor = 10f64.powi(decimal_places);
    let scaled = value * factor;
    // float noise must not push exact values one step up
    let snapped = scaled.round();
    let scaled = if (scaled - snapped).abs() < 1e-9 {
        snapped
    } else {
        scaled
    };
    if scaled >= 0.0 {
        scaled.ceil() / factor
    } else {
        scaled.floor() / factor
    }
}

pub fn round_to(value: f64, decimal_places: i32) -> f64 {
    let factor = 10f64.powi(decimal_places);
    (value * factor).round() / factor
}

/// `round(x, 1)` rendered without a trailing ".0".
pub fn get_trimmed_string(value: f64) -> String {
    let rounded = round_to(value, 1);
    let text = format!("{rounded:.1}");
    match text.strip_suffix(".0") {
        Some(stripped) => {
            if stripped == "-0" {
                "0".to_string()
            } else {
                stripped.to_string()
            }
        }
        None => text,
    }
}

pub fn litre_to_microlitre(volume_l: f64) -> f64 {
    volume_l * VOLUME_CONVERSION_FACTOR
}

pub fn microlitre_to_litre(volume_ul: f64) -> f64 {
    volume_ul / VOLUME_CONVERSION_FACTOR
}

pub fn molar_to_nanomolar(concentration_m: f64) -> f64 {
    concentration_m * CONCENTRATION_CONVERSION_FACTOR
}

pub fn nanomolar_to_molar(concentration_nm: f64) -> f64 {
    concentration_nm / CONCENTRATION_CONVERSION_FACTOR
}

/// Parses a positive number. `None` for anything else (including zero).
pub fn parse_positive_number(text: &str) -> Option<f64> {
    let value: f64 = text.trim().parse().ok()?;
    (value.is_finite() && value > 0.0).then_some(value)
}

/// Parses a positive integer; "2.0" is accepted, "2.5" is not.
pub fn parse_positive_integer(text: &str) -> Option<u32> {
    let value = parse_positive_number(text)?;
    if are_equal_values(value, value.round()) && value < u32::MAX as f64 {
        Some(value.round() as u32)
    } else {
        None
    }
}
