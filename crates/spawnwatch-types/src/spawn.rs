//! Hour-relative despawn offsets.
//!
//! Entities at a spawn point appear and disappear on an hourly cycle. The
//! only stable fact about a spawn point is *when within the hour* its entity
//! disappears, so that is what gets stored. Absolute times are rebuilt
//! against the current hour whenever they are needed.

use serde::{Deserialize, Serialize};

/// Number of seconds in one hourly spawn cycle.
pub const SECONDS_PER_HOUR: u16 = 3600;

/// Errors produced when constructing a [`DespawnOffset`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OffsetError {
    /// The value does not fall inside a single hour.
    #[error("despawn offset {0} is outside 0..3600")]
    OutOfRange(i64),
}

/// Seconds after the top of the hour at which a spawn point's entity
/// disappears. Always in `0..3600`.
///
/// An offset of `0` is a real top-of-hour despawn. "Unknown" is modelled by
/// the absence of an offset, never by a sentinel value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub struct DespawnOffset(u16);

impl DespawnOffset {
    /// Create an offset from seconds within the hour.
    ///
    /// # Errors
    ///
    /// Returns [`OffsetError::OutOfRange`] if `seconds >= 3600`.
    pub fn new(seconds: u16) -> Result<Self, OffsetError> {
        if seconds < SECONDS_PER_HOUR {
            Ok(Self(seconds))
        } else {
            Err(OffsetError::OutOfRange(i64::from(seconds)))
        }
    }

    /// Derive the offset from an absolute expiry timestamp (epoch seconds).
    ///
    /// Negative timestamps wrap the same way as positive ones.
    pub fn from_expiry(expires_at: i64) -> Self {
        let within_hour = expires_at.rem_euclid(i64::from(SECONDS_PER_HOUR));
        // rem_euclid keeps the value in 0..3600, which always fits in u16.
        Self(u16::try_from(within_hour).unwrap_or(0))
    }

    /// Return the offset in seconds.
    pub const fn seconds(self) -> u16 {
        self.0
    }
}

impl TryFrom<u16> for DespawnOffset {
    type Error = OffsetError;

    fn try_from(seconds: u16) -> Result<Self, Self::Error> {
        Self::new(seconds)
    }
}

impl TryFrom<i64> for DespawnOffset {
    type Error = OffsetError;

    fn try_from(seconds: i64) -> Result<Self, Self::Error> {
        u16::try_from(seconds)
            .ok()
            .and_then(|s| Self::new(s).ok())
            .ok_or(OffsetError::OutOfRange(seconds))
    }
}

impl From<DespawnOffset> for u16 {
    fn from(offset: DespawnOffset) -> Self {
        offset.0
    }
}

impl core::fmt::Display for DespawnOffset {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}s", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_is_a_valid_offset() {
        assert_eq!(DespawnOffset::new(0).map(DespawnOffset::seconds), Ok(0));
    }

    #[test]
    fn rejects_full_hour() {
        assert_eq!(DespawnOffset::new(3600), Err(OffsetError::OutOfRange(3600)));
        assert!(DespawnOffset::try_from(-1_i64).is_err());
    }

    #[test]
    fn from_expiry_takes_seconds_within_hour() {
        // 2024-01-01T10:58:20Z
        assert_eq!(DespawnOffset::from_expiry(1_704_106_700).seconds(), 3500);
        assert_eq!(DespawnOffset::from_expiry(-100).seconds(), 3500);
    }

    #[test]
    fn deserialization_enforces_range() {
        let ok: Result<DespawnOffset, _> = serde_json::from_str("59");
        assert!(ok.is_ok());
        let bad: Result<DespawnOffset, _> = serde_json::from_str("4000");
        assert!(bad.is_err());
    }
}
