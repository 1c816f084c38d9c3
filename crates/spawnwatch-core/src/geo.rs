//! Coordinate rounding for cache keys.
//!
//! Rounded points are the identity of cache entries: two raw coordinates
//! that round to the same point share an altitude entry or a mystery
//! marker. Rounding is half-away-from-zero (`f64::round`) applied to
//! `value * 10^precision`, and the result is kept as integer units so that
//! equality and hashing are exact.
//!
//! Two precisions are in use:
//!
//! - [`MYSTERY_PRECISION`] (4 digits, ~11 m) for mystery point identity, fine
//!   enough to keep neighbouring spawn points apart.
//! - [`DEFAULT_ALTITUDE_PRECISION`] (3 digits, ~110 m) for altitude keys,
//!   coarse enough that nearby points share one external lookup.

use serde::{Deserialize, Serialize};
use spawnwatch_types::Coordinate;

/// Decimal digits used for mystery point identity.
pub const MYSTERY_PRECISION: u8 = 4;

/// Default decimal digits used for altitude cache keys.
pub const DEFAULT_ALTITUDE_PRECISION: u8 = 3;

/// Highest supported precision. Keeps `value * 10^precision` well inside
/// the exactly representable integer range of `f64`.
pub const MAX_PRECISION: u8 = 9;

/// A coordinate quantized to a fixed number of decimal digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RoundedPoint {
    lat_units: i64,
    lon_units: i64,
    precision: u8,
}

impl RoundedPoint {
    /// Latitude in decimal degrees.
    pub fn lat(&self) -> f64 {
        units_to_degrees(self.lat_units, self.precision)
    }

    /// Longitude in decimal degrees.
    pub fn lon(&self) -> f64 {
        units_to_degrees(self.lon_units, self.precision)
    }

    /// Number of decimal digits this point was rounded to.
    pub const fn precision(&self) -> u8 {
        self.precision
    }

    /// Convert back to a plain coordinate.
    pub fn to_coordinate(&self) -> Coordinate {
        Coordinate::new(self.lat(), self.lon())
    }
}

impl core::fmt::Display for RoundedPoint {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let digits = usize::from(self.precision);
        write!(f, "{:.digits$},{:.digits$}", self.lat(), self.lon())
    }
}

/// Quantize `point` to `precision` decimal digits.
///
/// Precisions above [`MAX_PRECISION`] are clamped.
pub fn round_coordinate(point: Coordinate, precision: u8) -> RoundedPoint {
    let precision = precision.min(MAX_PRECISION);
    RoundedPoint {
        lat_units: degrees_to_units(point.lat, precision),
        lon_units: degrees_to_units(point.lon, precision),
        precision,
    }
}

/// Default cap on the number of points a bulk altitude sweep may visit.
pub const DEFAULT_MAX_GRID_POINTS: u64 = 1_000_000;

/// Reasons a survey grid cannot be built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum GridError {
    /// A corner of the rectangle is NaN or infinite.
    #[error("grid corners must be finite")]
    NonFinite,

    /// The rectangle holds more points than allowed.
    #[error("grid of {points} points exceeds the limit of {limit}")]
    TooLarge {
        /// Points in the rectangle, saturated at `u64::MAX`.
        points: u64,
        /// Configured limit.
        limit: u64,
    },
}

/// Lazy row-major walk over the grid points of a rectangle.
#[derive(Debug, Clone)]
pub struct GridPoints {
    lat_units: i64,
    lon_units: i64,
    lon_start: i64,
    lon_end: i64,
    precision: u8,
    remaining: u64,
}

impl GridPoints {
    /// Points not yet yielded.
    pub const fn remaining(&self) -> u64 {
        self.remaining
    }
}

impl Iterator for GridPoints {
    type Item = RoundedPoint;

    fn next(&mut self) -> Option<RoundedPoint> {
        if self.remaining == 0 {
            return None;
        }
        let point = RoundedPoint {
            lat_units: self.lat_units,
            lon_units: self.lon_units,
            precision: self.precision,
        };
        self.remaining = self.remaining.saturating_sub(1);
        if self.lon_units < self.lon_end {
            self.lon_units = self.lon_units.saturating_add(1);
        } else {
            self.lon_units = self.lon_start;
            self.lat_units = self.lat_units.saturating_add(1);
        }
        Some(point)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = usize::try_from(self.remaining).unwrap_or(usize::MAX);
        (remaining, usize::try_from(self.remaining).ok())
    }
}

/// Every grid point at `precision` inside the rectangle spanned by
/// `south_west` and `north_east`, edges included, in row-major order.
///
/// An inverted rectangle yields nothing. Points are produced lazily; the
/// count is checked against `limit` up front.
///
/// # Errors
///
/// Returns [`GridError::NonFinite`] for NaN or infinite corners and
/// [`GridError::TooLarge`] when the rectangle holds more than `limit`
/// points.
pub fn grid_points(
    south_west: Coordinate,
    north_east: Coordinate,
    precision: u8,
    limit: u64,
) -> Result<GridPoints, GridError> {
    let corners = [south_west.lat, south_west.lon, north_east.lat, north_east.lon];
    if !corners.iter().all(|c| c.is_finite()) {
        return Err(GridError::NonFinite);
    }

    let sw = round_coordinate(south_west, precision);
    let ne = round_coordinate(north_east, precision);
    let points = match (
        axis_len(sw.lat_units, ne.lat_units),
        axis_len(sw.lon_units, ne.lon_units),
    ) {
        (Some(0), _) | (_, Some(0)) => 0,
        (Some(rows), Some(cols)) => rows.checked_mul(cols).unwrap_or(u64::MAX),
        _ => u64::MAX,
    };
    if points > limit {
        return Err(GridError::TooLarge { points, limit });
    }

    Ok(GridPoints {
        lat_units: sw.lat_units,
        lon_units: sw.lon_units,
        lon_start: sw.lon_units,
        lon_end: ne.lon_units,
        precision: sw.precision,
        remaining: points,
    })
}

/// Number of unit steps from `start` to `end` inclusive. `None` on overflow.
fn axis_len(start: i64, end: i64) -> Option<u64> {
    if end < start {
        return Some(0);
    }
    let span = end.checked_sub(start)?.checked_add(1)?;
    u64::try_from(span).ok()
}

fn scale(precision: u8) -> f64 {
    10_f64.powi(i32::from(precision))
}

#[allow(clippy::cast_possible_truncation)]
fn degrees_to_units(value: f64, precision: u8) -> i64 {
    // |lat|,|lon| <= 180 and precision <= 9, so the product fits in i64.
    (value * scale(precision)).round() as i64
}

#[allow(clippy::cast_precision_loss)]
fn units_to_degrees(units: i64, precision: u8) -> f64 {
    units as f64 / scale(precision)
}
