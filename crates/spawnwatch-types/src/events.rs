//! Event records carried from producers to the persistence worker.
//!
//! Each record is immutable once enqueued. Ownership moves from the
//! producer into the queue and from there to the worker, which is the only
//! component that writes them to storage.

use serde::{Deserialize, Serialize};

use crate::coords::Coordinate;
use crate::ids::{EncounterId, SpawnId};
use crate::spawn::DespawnOffset;

/// How much of an observation's despawn timing is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "validity", rename_all = "snake_case")]
pub enum Validity {
    /// The server reported the exact expiry. The spawn point's offset can be
    /// learned from it.
    Resolved {
        /// Spawn point the entity appeared at.
        spawn_id: SpawnId,
        /// Absolute expiry in epoch seconds.
        expires_at: i64,
    },
    /// The entity was seen and its expiry estimated from an already-known
    /// spawn point. Persisted, but teaches nothing new about the spawn.
    Seen {
        /// Spawn point the entity appeared at.
        spawn_id: SpawnId,
        /// Estimated expiry in epoch seconds.
        expires_at: i64,
    },
    /// Despawn timing could not be determined. Recorded as a mystery point.
    Unresolved,
}

/// A sighting of a transient entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    /// Encounter identifier assigned by the game server.
    pub encounter_id: EncounterId,
    /// Species of the observed entity.
    pub species_id: u16,
    /// Where the entity was observed.
    pub position: Coordinate,
    /// When the entity was observed, in epoch seconds.
    pub seen_at: i64,
    /// What is known about the entity's despawn timing.
    #[serde(flatten)]
    pub validity: Validity,
}

impl Observation {
    /// Whether the observation carries usable despawn timing.
    pub const fn is_valid(&self) -> bool {
        !matches!(self.validity, Validity::Unresolved)
    }

    /// Spawn point of the observation, if known.
    pub const fn spawn_id(&self) -> Option<SpawnId> {
        match self.validity {
            Validity::Resolved { spawn_id, .. } | Validity::Seen { spawn_id, .. } => {
                Some(spawn_id)
            }
            Validity::Unresolved => None,
        }
    }

    /// Absolute expiry in epoch seconds, if known or estimated.
    pub const fn expires_at(&self) -> Option<i64> {
        match self.validity {
            Validity::Resolved { expires_at, .. } | Validity::Seen { expires_at, .. } => {
                Some(expires_at)
            }
            Validity::Unresolved => None,
        }
    }

    /// The spawn point and hour-relative offset this observation teaches,
    /// present only for fully resolved sightings.
    pub fn learned_offset(&self) -> Option<(SpawnId, DespawnOffset)> {
        match self.validity {
            Validity::Resolved {
                spawn_id,
                expires_at,
            } => Some((spawn_id, DespawnOffset::from_expiry(expires_at))),
            Validity::Seen { .. } | Validity::Unresolved => None,
        }
    }
}

/// A sighting of a contested structure (gym, fort).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructureSighting {
    /// Structure identifier assigned by the game server.
    pub structure_id: String,
    /// Where the structure stands.
    pub position: Coordinate,
    /// Controlling team (0 = uncontrolled).
    pub team: u8,
    /// Species guarding the structure, if any.
    pub guard_species_id: Option<u16>,
    /// Server-side last modification time, in epoch seconds.
    pub last_modified: i64,
}

/// A static point of interest (stop).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointOfInterest {
    /// Point identifier assigned by the game server.
    pub poi_id: String,
    /// Where the point is.
    pub position: Coordinate,
    /// Display name, when the scanner fetched details.
    pub name: Option<String>,
}

/// A message from a producer to the persistence worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// An entity sighting.
    Observation(Observation),
    /// A structure sighting.
    StructureSighting(StructureSighting),
    /// A point of interest.
    PointOfInterest(PointOfInterest),
    /// Stop the worker immediately, abandoning anything queued behind it.
    Shutdown,
}

impl Event {
    /// Short name of the event kind, for logging.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Observation(_) => "observation",
            Self::StructureSighting(_) => "structure_sighting",
            Self::PointOfInterest(_) => "point_of_interest",
            Self::Shutdown => "shutdown",
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn observation(validity: Validity) -> Observation {
        Observation {
            encounter_id: EncounterId(7),
            species_id: 16,
            position: Coordinate::new(40.7128, -74.0060),
            seen_at: 1_704_106_000,
            validity,
        }
    }

    #[test]
    fn resolved_observation_teaches_offset() {
        let obs = observation(Validity::Resolved {
            spawn_id: SpawnId(99),
            expires_at: 1_704_106_700,
        });
        let (spawn_id, offset) = obs.learned_offset().unwrap();
        assert_eq!(spawn_id, SpawnId(99));
        assert_eq!(offset.seconds(), 3500);
        assert!(obs.is_valid());
    }

    #[test]
    fn seen_observation_is_valid_but_teaches_nothing() {
        let obs = observation(Validity::Seen {
            spawn_id: SpawnId(99),
            expires_at: 1_704_106_700,
        });
        assert!(obs.is_valid());
        assert!(obs.learned_offset().is_none());
        assert_eq!(obs.spawn_id(), Some(SpawnId(99)));
    }

    #[test]
    fn unresolved_observation_is_invalid() {
        let obs = observation(Validity::Unresolved);
        assert!(!obs.is_valid());
        assert_eq!(obs.spawn_id(), None);
        assert_eq!(obs.expires_at(), None);
    }

    #[test]
    fn event_json_is_tagged() {
        let event = Event::Observation(observation(Validity::Unresolved));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "observation");
        assert_eq!(json["validity"], "unresolved");

        let back: Event = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
        assert_eq!(back.kind(), "observation");
    }
}
