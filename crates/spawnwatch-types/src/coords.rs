//! Raw geographic coordinates as reported by the scanner.

use serde::{Deserialize, Serialize};

/// A latitude/longitude pair in decimal degrees.
///
/// This is the unrounded position of an observation. Cache keys are derived
/// from it by rounding (see `spawnwatch_core::geo`).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    /// Latitude in decimal degrees.
    pub lat: f64,
    /// Longitude in decimal degrees.
    pub lon: f64,
}

impl Coordinate {
    /// Create a coordinate from latitude and longitude.
    pub const fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }
}

impl From<(f64, f64)> for Coordinate {
    fn from((lat, lon): (f64, f64)) -> Self {
        Self { lat, lon }
    }
}
