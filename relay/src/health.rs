//! Health and fix-quality classification.
//!
//! Pure functions over raw numeric/categorical receiver fields. The
//! thresholds come from the receiver vendor's literal guidance and are kept
//! configurable rather than hard-coded at call sites.

/// Classification thresholds.
#[derive(Debug, Clone)]
pub struct HealthThresholds {
    /// Minimum satellites for a usable fix.
    pub min_satellites: i32,
    /// Horizontal accuracy (meters) or HDOP above which quality is POOR.
    pub poor_accuracy: f64,
    /// Horizontal accuracy (meters) or HDOP below which quality is EXCELLENT.
    pub excellent_accuracy: f64,
    /// Device battery percent below which the degraded path reports LOW_BATTERY.
    pub low_battery: i32,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            min_satellites: 4,
            poor_accuracy: 2.5,
            excellent_accuracy: 1.0,
            low_battery: 20,
        }
    }
}

fn fix_indicates_no_fix(fix_type: &str) -> bool {
    let fix = fix_type.to_ascii_uppercase();
    fix.contains("INVALID") || fix.contains("NO_FIX")
}

fn fix_is_unaugmented(fix_type: &str) -> bool {
    fix_type.to_ascii_uppercase().contains("AUTONOMOUS")
}

fn usable_accuracy(accuracy: Option<f64>) -> Option<f64> {
    accuracy.filter(|a| a.is_finite() && *a >= 0.0)
}

/// Receiver fix-quality label from fix type, satellites in view and a
/// horizontal accuracy or HDOP figure (whichever the source reports).
///
/// NO_FIX conditions are checked before POOR, POOR before EXCELLENT/GOOD.
/// Without any accuracy figure the GOOD/EXCELLENT split cannot be decided
/// and the label is UNKNOWN.
pub fn receiver_health(
    fix_type: &str,
    satellites: i32,
    accuracy: Option<f64>,
    thresholds: &HealthThresholds,
) -> &'static str {
    let accuracy = usable_accuracy(accuracy);

    if fix_indicates_no_fix(fix_type)
        || (fix_is_unaugmented(fix_type) && satellites < thresholds.min_satellites)
    {
        return "NO_FIX";
    }

    if satellites < thresholds.min_satellites
        || accuracy.is_some_and(|a| a > thresholds.poor_accuracy)
    {
        return "POOR";
    }

    match accuracy {
        Some(a) if a < thresholds.excellent_accuracy => "EXCELLENT",
        Some(_) => "GOOD",
        None => "UNKNOWN",
    }
}

/// Overall sample health from coordinates, fix type, satellites and the
/// sensor error flag. First match wins.
pub fn overall_health(
    latitude: f64,
    longitude: f64,
    fix_type: &str,
    satellites: i32,
    sensor_error: bool,
    thresholds: &HealthThresholds,
) -> &'static str {
    if (latitude == 0.0 && longitude == 0.0) || latitude.is_nan() || longitude.is_nan() {
        return "NO_COORDINATES";
    }

    if fix_is_unaugmented(fix_type) && satellites < thresholds.min_satellites {
        return "NO_FIX";
    }

    if sensor_error {
        return "ERROR";
    }

    "OK"
}

/// Degraded health rule for sources without a sensor-state channel.
/// Low battery takes precedence over fix-based labels on this path.
pub fn basic_health(battery: i32, fix_type: &str, thresholds: &HealthThresholds) -> &'static str {
    if battery < thresholds.low_battery {
        return "LOW_BATTERY";
    }

    if fix_type.eq_ignore_ascii_case("NO_FIX") {
        return "NO_SIGNAL";
    }

    "OK"
}
