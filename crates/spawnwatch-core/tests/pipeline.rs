//! End-to-end tests of the persistence pipeline against the in-memory store.
//!
//! Producers on several tasks feed one worker; the tests check that nothing
//! is lost on a graceful stop and that a fresh registry rebuilt from storage
//! agrees with the one the worker taught.

#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::missing_panics_doc,
    clippy::arithmetic_side_effects,
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::cast_precision_loss
)]

use std::sync::Arc;
use std::time::Duration;

use spawnwatch_core::altitude::{AltitudeSource, StaticAltitudes};
use spawnwatch_core::config::RegistryConfig;
use spawnwatch_core::{
    ExitReason, MemoryStore, PersistenceWorker, SpawnRegistry, WorkerState,
};
use spawnwatch_types::{
    Coordinate, EncounterId, Event, Observation, PointOfInterest, SpawnId, Validity,
};

/// 2024-01-01T10:00:00Z
const HOUR_START: i64 = 1_704_103_200;

const PRODUCERS: u64 = 8;
const EVENTS_PER_PRODUCER: u64 = 125;

fn altitudes() -> StaticAltitudes {
    let mut table = StaticAltitudes::new(3);
    for spawn in 0..10_u32 {
        table = table.with(spawn_position(spawn.into()), 5.0 + f64::from(spawn));
    }
    table
}

fn registry() -> Arc<SpawnRegistry> {
    Arc::new(SpawnRegistry::new(
        AltitudeSource::Static(altitudes()),
        &RegistryConfig::default(),
    ))
}

fn spawn_position(spawn: u64) -> Coordinate {
    Coordinate::new(51.5 + (spawn as f64) * 0.01, -0.12)
}

/// Event number `n` of `producer`: a mix of resolved sightings on ten spawn
/// points, mystery sightings and points of interest.
fn event(producer: u64, n: u64) -> Event {
    let encounter = producer * 10_000 + n;
    match n % 3 {
        0 => {
            let spawn = n % 10;
            Event::Observation(Observation {
                encounter_id: EncounterId(encounter),
                species_id: 16,
                position: spawn_position(spawn),
                seen_at: HOUR_START + 60,
                validity: Validity::Resolved {
                    spawn_id: SpawnId(spawn),
                    expires_at: HOUR_START + 600 + (spawn as i64) * 60,
                },
            })
        }
        1 => Event::Observation(Observation {
            encounter_id: EncounterId(encounter),
            species_id: 19,
            position: Coordinate::new(48.85, 2.35 + (n as f64) * 0.001),
            seen_at: HOUR_START,
            validity: Validity::Unresolved,
        }),
        _ => Event::PointOfInterest(PointOfInterest {
            poi_id: format!("poi-{encounter}"),
            position: Coordinate::new(40.0, -3.7),
            name: None,
        }),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn graceful_stop_accounts_for_every_event() {
    let store = MemoryStore::new();
    let registry = registry();
    let handle = PersistenceWorker::start(store.session(), Arc::clone(&registry));

    let mut producers = Vec::new();
    for producer in 0..PRODUCERS {
        let queue = handle.queue();
        producers.push(tokio::spawn(async move {
            for n in 0..EVENTS_PER_PRODUCER {
                queue.push(event(producer, n)).unwrap();
                if n % 25 == 0 {
                    tokio::task::yield_now().await;
                }
            }
        }));
    }
    for producer in producers {
        producer.await.unwrap();
    }

    handle.request_commit();
    let control = handle.control();
    let report = tokio::time::timeout(Duration::from_secs(10), handle.stop())
        .await
        .expect("worker did not stop")
        .unwrap();

    let total = PRODUCERS * EVENTS_PER_PRODUCER;
    assert_eq!(report.exit, ExitReason::Drained);
    assert_eq!(report.processed + report.failed, total);
    assert_eq!(report.failed, 0);
    assert_eq!(control.state(), WorkerState::Stopped);

    let tables = store.tables().await;
    let persisted = tables.observations.len()
        + tables.mysteries.len()
        + tables.points_of_interest.len();
    assert_eq!(persisted as u64, total);
    assert_eq!(tables.spawn_points.len(), 10);
    assert_eq!(registry.spawn_count(), 10);
}

#[tokio::test]
async fn refreshed_registry_matches_what_the_worker_learned() {
    let store = MemoryStore::new();
    let taught = registry();
    let handle = PersistenceWorker::start(store.session(), Arc::clone(&taught));
    for n in 0..30 {
        handle.enqueue(event(0, n)).unwrap();
    }
    handle.stop().await.unwrap();

    let rebuilt = registry();
    let summary = rebuilt.refresh(&store).await.unwrap();
    assert_eq!(summary.spawn_points, 10);
    assert_eq!(summary.mysteries, taught.mystery_count());

    let now = HOUR_START + 120;
    for spawn in 0..10 {
        let id = SpawnId(spawn);
        assert_eq!(rebuilt.raw_offset(id), taught.raw_offset(id));
        assert_eq!(
            rebuilt.time_until_hidden_at(id, now),
            taught.time_until_hidden_at(id, now)
        );
    }
    // Spawn 0 hides at offset 600, eight minutes after `now`.
    assert_eq!(rebuilt.time_until_hidden_at(SpawnId(0), now), Some(480));
}

#[tokio::test]
async fn shutdown_event_abandons_the_backlog() {
    let store = MemoryStore::new();
    let handle = PersistenceWorker::start(store.session(), registry());
    handle.enqueue(event(0, 1)).unwrap();
    handle.enqueue(Event::Shutdown).unwrap();
    let queue = handle.queue();

    let report = handle.join().await.unwrap();
    assert_eq!(report.exit, ExitReason::Killed);
    assert_eq!(report.processed, 1);

    // The consumer is gone once the worker has stopped.
    assert!(queue.push(event(0, 2)).is_err());
}
