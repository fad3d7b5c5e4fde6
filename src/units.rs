//! Conversions between controller steps, millimeters and inches.
//!
//! The lead screws on the stage advance 0.0050 mm per motor step. Distances
//! requested in physical units are rounded to whole steps (half away from
//! zero, [`f64::round`]) before a move is encoded, so a forward and a reverse
//! request of the same magnitude always produce mirrored step counts.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Linear travel per motor step, in millimeters.
pub const MM_PER_STEP: f64 = 0.0050;

/// Motor steps per millimeter of travel.
pub const STEPS_PER_MM: f64 = 200.0;

/// Millimeters per inch.
pub const MM_PER_INCH: f64 = 25.4;

/// Physical length unit used when reporting positions or requesting moves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Unit {
    /// Millimeters.
    #[default]
    #[serde(alias = "mm")]
    Millimeters,
    /// Inches.
    #[serde(alias = "in")]
    Inches,
}

impl Unit {
    /// Short suffix used in log lines and CLI output.
    pub fn suffix(self) -> &'static str {
        match self {
            Unit::Millimeters => "mm",
            Unit::Inches => "in",
        }
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.suffix())
    }
}

impl FromStr for Unit {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mm" | "millimeter" | "millimeters" => Ok(Unit::Millimeters),
            "in" | "inch" | "inches" => Ok(Unit::Inches),
            other => Err(format!(
                "Invalid unit '{}'. Must be one of: mm, in",
                other
            )),
        }
    }
}

/// Steps to millimeters.
pub fn steps_to_mm(steps: i64) -> f64 {
    steps as f64 * MM_PER_STEP
}

/// Millimeters to the nearest whole step, ties away from zero.
pub fn mm_to_steps(mm: f64) -> i64 {
    (mm * STEPS_PER_MM).round() as i64
}

/// Millimeters to inches.
pub fn mm_to_inches(mm: f64) -> f64 {
    mm / MM_PER_INCH
}

/// Inches to millimeters.
pub fn inches_to_mm(inches: f64) -> f64 {
    inches * MM_PER_INCH
}

/// Express a raw step count in `unit`.
pub fn steps_to(steps: i64, unit: Unit) -> f64 {
    let mm = steps_to_mm(steps);
    match unit {
        Unit::Millimeters => mm,
        Unit::Inches => mm_to_inches(mm),
    }
}

/// Convert a distance in `unit` to whole steps, ties away from zero.
pub fn to_steps(distance: f64, unit: Unit) -> i64 {
    match unit {
        Unit::Millimeters => mm_to_steps(distance),
        Unit::Inches => mm_to_steps(inches_to_mm(distance)),
    }
}
