//! Shared numeric helpers for compass directions and physical bounds.
//!
//! - `normalize_direction`: folds any angle into [0, 360)
//! - `constrain`: clamps a value into a closed range
//! - `finite_value`: drops NaN / ±Inf readings with a warning

/// Fold a compass direction in degrees into [0, 360).
pub(crate) fn normalize_direction(direction: f64) -> f64 {
    let folded = direction % 360.0;
    (folded + 360.0) % 360.0
}

/// Restrict a value to `[min, max]`.
pub(crate) fn constrain(value: f64, min: f64, max: f64) -> f64 {
    value.max(min).min(max)
}

/// Keep a member reading only if it is a finite number.
///
/// Non-finite readings are treated as "member did not report".
pub(crate) fn finite_value(value: f64, context: &str) -> Option<f64> {
    if value.is_finite() {
        Some(value)
    } else {
        tracing::warn!("{} received non-finite value {}, ignoring it", context, value);
        None
    }
}
