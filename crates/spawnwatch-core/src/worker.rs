//! The persistence worker: a single long-lived task that drains the event
//! queue into storage.
//!
//! # Lifecycle
//!
//! ```text
//! Running --request_stop()--> Draining --queue empty--> Stopped
//!    |                                                    ^
//!    +------------------ Shutdown event ------------------+
//! ```
//!
//! `request_stop()` is graceful: every event already queued is processed
//! before the worker commits and exits. A [`Event::Shutdown`] message is
//! not: the worker stops as soon as it pops it, and anything queued behind
//! it is dropped.
//!
//! # Failure isolation
//!
//! Each event is handled on its own. A [`StorageError`] rolls back the open
//! transaction and the event is dropped (at-most-once). A failed altitude
//! lookup or a panic while handling the event is logged and the loop moves
//! on. Nothing short of a stop request or a shutdown message ends the loop.
//!
//! # Control flags
//!
//! Commit-now, clean-caches-now and stop are atomic flags on
//! [`WorkerControl`], set from any thread and acted on by the worker at its
//! next loop iteration. Callers never wait for them to take effect.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};

use futures::FutureExt as _;
use spawnwatch_types::{Coordinate, DespawnOffset, Event, Observation, SpawnId};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::altitude::LookupError;
use crate::queue::{EventQueue, EventReceiver, QueueClosed, TryPop, event_queue};
use crate::registry::SpawnRegistry;
use crate::storage::{CacheExpiry, SpawnPointRecord, StorageError, StorageSession};

/// Errors surfaced when joining the worker task.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// The worker task panicked outside event handling or was cancelled.
    #[error("persistence worker task failed: {0}")]
    Join(String),
}

/// Why handling a single event failed.
#[derive(Debug, thiserror::Error)]
enum DispatchError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Lookup(#[from] LookupError),
}

/// Lifecycle state of the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerState {
    /// Consuming events.
    Running = 0,
    /// Stop requested; finishing what is queued.
    Draining = 1,
    /// Final commit done, session closed.
    Stopped = 2,
}

impl WorkerState {
    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Running,
            1 => Self::Draining,
            _ => Self::Stopped,
        }
    }
}

/// How the worker loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// A stop was requested and the queue ran empty.
    Drained,
    /// A shutdown event was received.
    Killed,
    /// Every producer handle was dropped and the queue ran empty.
    Disconnected,
}

/// Final counters of a finished worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerReport {
    /// Events handled successfully.
    pub processed: u64,
    /// Events dropped because handling them failed.
    pub failed: u64,
    /// How the loop ended.
    pub exit: ExitReason,
}

/// Cross-thread control signals and counters of a worker.
#[derive(Debug)]
pub struct WorkerControl {
    stop_requested: AtomicBool,
    commit_requested: AtomicBool,
    cache_clean_requested: AtomicBool,
    state: AtomicU8,
    processed: AtomicU64,
    failed: AtomicU64,
    wake: Notify,
}

impl Default for WorkerControl {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerControl {
    /// Create a control block for a worker that has not started yet.
    pub const fn new() -> Self {
        Self {
            stop_requested: AtomicBool::new(false),
            commit_requested: AtomicBool::new(false),
            cache_clean_requested: AtomicBool::new(false),
            state: AtomicU8::new(WorkerState::Running as u8),
            processed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            wake: Notify::const_new(),
        }
    }

    /// Ask the worker to finish everything queued, commit, and stop.
    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::Release);
        let _ = self.state.compare_exchange(
            WorkerState::Running as u8,
            WorkerState::Draining as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        self.wake.notify_one();
    }

    /// Ask the worker to commit after the next successfully handled event.
    pub fn request_commit(&self) {
        self.commit_requested.store(true, Ordering::Release);
    }

    /// Ask the worker to run cache-expiry maintenance before its next event.
    pub fn request_cache_clean(&self) {
        self.cache_clean_requested.store(true, Ordering::Release);
    }

    /// Whether a stop has been requested.
    pub fn is_stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
    }

    /// Whether a commit request is still pending.
    pub fn is_commit_requested(&self) -> bool {
        self.commit_requested.load(Ordering::Acquire)
    }

    /// Whether a cache-clean request is still pending.
    pub fn is_cache_clean_requested(&self) -> bool {
        self.cache_clean_requested.load(Ordering::Acquire)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Events handled successfully so far.
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    /// Events dropped because handling them failed.
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    fn take_cache_clean(&self) -> bool {
        self.cache_clean_requested.swap(false, Ordering::AcqRel)
    }

    fn clear_commit(&self) {
        self.commit_requested.store(false, Ordering::Release);
    }

    fn mark_stopped(&self) {
        self.state
            .store(WorkerState::Stopped as u8, Ordering::Release);
    }

    fn count_processed(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    fn count_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }
}

enum Flow {
    Continue,
    Halt,
}

enum Next {
    Event(Event),
    Drained,
    Disconnected,
}

/// Background consumer that persists queued events.
pub struct PersistenceWorker<S> {
    session: S,
    registry: Arc<SpawnRegistry>,
    receiver: EventReceiver,
    control: Arc<WorkerControl>,
    cache_expiry: Option<Arc<dyn CacheExpiry>>,
}

impl<S: StorageSession + 'static> PersistenceWorker<S> {
    /// Create a worker that will consume `receiver` and write through
    /// `session`. The session is owned by the worker from here on.
    pub fn new(session: S, registry: Arc<SpawnRegistry>, receiver: EventReceiver) -> Self {
        Self {
            session,
            registry,
            receiver,
            control: Arc::new(WorkerControl::new()),
            cache_expiry: None,
        }
    }

    /// Create a worker with a fresh queue and start it on the tokio
    /// runtime.
    pub fn start(session: S, registry: Arc<SpawnRegistry>) -> WorkerHandle {
        let (queue, receiver) = event_queue();
        Self::new(session, registry, receiver).spawn(queue)
    }

    /// Attach the collaborator run on cache-clean requests.
    #[must_use]
    pub fn with_cache_expiry(mut self, cache_expiry: Arc<dyn CacheExpiry>) -> Self {
        self.cache_expiry = Some(cache_expiry);
        self
    }

    /// Shared control block of this worker.
    pub fn control(&self) -> Arc<WorkerControl> {
        Arc::clone(&self.control)
    }

    /// Run the worker on the tokio runtime. `queue` must be the producer
    /// half of this worker's receiver.
    pub fn spawn(self, queue: EventQueue) -> WorkerHandle {
        let control = self.control();
        let task = tokio::spawn(self.run());
        WorkerHandle {
            queue,
            control,
            task,
        }
    }

    /// Consume events until stopped, then commit and close the session.
    pub async fn run(mut self) -> WorkerReport {
        info!(
            queued = self.receiver.len(),
            "Persistence worker started"
        );

        let exit = loop {
            if self.control.take_cache_clean() {
                self.clean_caches();
            }

            let event = match self.next_event().await {
                Next::Event(event) => event,
                Next::Drained => break ExitReason::Drained,
                Next::Disconnected => break ExitReason::Disconnected,
            };

            let kind = event.kind();
            match AssertUnwindSafe(self.dispatch(event)).catch_unwind().await {
                Ok(Ok(Flow::Halt)) => {
                    info!(
                        abandoned = self.receiver.len(),
                        "Shutdown event received, stopping immediately"
                    );
                    break ExitReason::Killed;
                }
                Ok(Ok(Flow::Continue)) => {
                    self.control.count_processed();
                    debug!(kind, "Event persisted");
                    self.commit_if_requested().await;
                }
                Ok(Err(DispatchError::Storage(e))) => {
                    self.control.count_failed();
                    error!(kind, error = %e, "Storage error, rolling back");
                    self.rollback().await;
                }
                Ok(Err(e)) => {
                    self.control.count_failed();
                    error!(kind, error = %e, "Failed to persist event");
                }
                Err(panic) => {
                    self.control.count_failed();
                    error!(
                        kind,
                        panic = panic_message(&*panic),
                        "Panic while persisting event, rolling back"
                    );
                    self.rollback().await;
                }
            }
        };

        self.finish(exit).await
    }

    /// Next event to handle, or why there is none.
    ///
    /// Never blocks once a stop has been requested: the queue is drained
    /// without waiting and an empty queue ends the loop.
    async fn next_event(&mut self) -> Next {
        loop {
            match self.receiver.try_pop() {
                TryPop::Event(event) => return Next::Event(event),
                TryPop::Disconnected => return queue_exhausted(&self.control),
                TryPop::Empty => {}
            }
            if self.control.is_stop_requested() {
                return Next::Drained;
            }
            tokio::select! {
                event = self.receiver.pop() => {
                    return event.map_or_else(|| queue_exhausted(&self.control), Next::Event);
                }
                () = self.control.wake.notified() => {}
            }
        }
    }

    async fn dispatch(&mut self, event: Event) -> Result<Flow, DispatchError> {
        match event {
            Event::Observation(observation) if observation.is_valid() => {
                self.persist_sighting(&observation).await?;
            }
            Event::Observation(observation) => {
                self.persist_mystery(&observation).await?;
            }
            Event::StructureSighting(sighting) => {
                self.session.insert_structure_sighting(&sighting).await?;
            }
            Event::PointOfInterest(poi) => {
                self.session.insert_point_of_interest(&poi).await?;
            }
            Event::Shutdown => return Ok(Flow::Halt),
        }
        Ok(Flow::Continue)
    }

    async fn persist_sighting(&mut self, observation: &Observation) -> Result<(), DispatchError> {
        self.session.insert_observation(observation).await?;
        if let Some((spawn_id, offset)) = observation.learned_offset() {
            self.learn_spawn_point(spawn_id, offset, observation.position)
                .await?;
        }
        Ok(())
    }

    async fn persist_mystery(&mut self, observation: &Observation) -> Result<(), DispatchError> {
        self.session.insert_mystery(observation).await?;
        self.registry.record_mystery(observation.position);
        Ok(())
    }

    /// Write a newly learned offset to storage and the registry. Offsets the
    /// registry already holds are not written again.
    async fn learn_spawn_point(
        &mut self,
        spawn_id: SpawnId,
        despawn_offset: DespawnOffset,
        position: Coordinate,
    ) -> Result<(), DispatchError> {
        if self.registry.raw_offset(spawn_id) == Some(despawn_offset) {
            return Ok(());
        }

        let altitude = self.registry.lookup_altitude(position).await?;
        let record = SpawnPointRecord {
            spawn_id,
            position,
            despawn_offset,
            altitude,
        };
        self.session.upsert_spawn_point(&record).await?;
        self.registry.record_spawn_point(&record);

        debug!(spawn_id = %spawn_id, offset = %despawn_offset, "Spawn point learned");
        Ok(())
    }

    async fn commit_if_requested(&mut self) {
        if !self.control.is_commit_requested() {
            return;
        }
        match self.session.commit().await {
            Ok(()) => {
                // The flag stays set after a failed commit so the next event retries.
                self.control.clear_commit();
                debug!(processed = self.control.processed(), "Committed");
            }
            Err(e) => {
                error!(error = %e, "Commit failed, rolling back");
                self.rollback().await;
            }
        }
    }

    async fn rollback(&mut self) {
        if let Err(e) = self.session.rollback().await {
            error!(error = %e, "Rollback failed");
        }
    }

    fn clean_caches(&self) {
        let Some(cache_expiry) = &self.cache_expiry else {
            debug!("Cache clean requested but no cache-expiry collaborator attached");
            return;
        };
        match cache_expiry.expire_stale_entries() {
            Ok(removed) => debug!(removed, "Expired stale cache entries"),
            Err(e) => error!(error = %e, "Failed to clean cache"),
        }
    }

    async fn finish(mut self, exit: ExitReason) -> WorkerReport {
        if let Err(e) = self.session.commit().await {
            error!(error = %e, "Final commit failed");
            self.rollback().await;
        }
        if let Err(e) = self.session.close().await {
            warn!(error = %e, "Failed to close storage session");
        }
        self.control.mark_stopped();

        let report = WorkerReport {
            processed: self.control.processed(),
            failed: self.control.failed(),
            exit,
        };
        info!(
            processed = report.processed,
            failed = report.failed,
            exit = ?report.exit,
            "Persistence worker stopped"
        );
        report
    }
}

/// Every producer is gone and the queue is empty. A stop requested before
/// that still counts as a drain.
fn queue_exhausted(control: &WorkerControl) -> Next {
    if control.is_stop_requested() {
        Next::Drained
    } else {
        Next::Disconnected
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

/// Producer-side handle to a running worker.
#[derive(Debug)]
pub struct WorkerHandle {
    queue: EventQueue,
    control: Arc<WorkerControl>,
    task: JoinHandle<WorkerReport>,
}

impl WorkerHandle {
    /// Queue an event for persistence.
    ///
    /// # Errors
    ///
    /// Returns [`QueueClosed`] if the worker has already stopped.
    pub fn enqueue(&self, event: Event) -> Result<(), QueueClosed> {
        self.queue.push(event)
    }

    /// A producer handle onto the worker's queue.
    pub fn queue(&self) -> EventQueue {
        self.queue.clone()
    }

    /// The worker's control block.
    pub fn control(&self) -> Arc<WorkerControl> {
        Arc::clone(&self.control)
    }

    /// See [`WorkerControl::request_commit`].
    pub fn request_commit(&self) {
        self.control.request_commit();
    }

    /// See [`WorkerControl::request_cache_clean`].
    pub fn request_cache_clean(&self) {
        self.control.request_cache_clean();
    }

    /// See [`WorkerControl::request_stop`].
    pub fn request_stop(&self) {
        self.control.request_stop();
    }

    /// Current lifecycle state.
    pub fn state(&self) -> WorkerState {
        self.control.state()
    }

    /// Wait for the worker to finish.
    ///
    /// Drops this handle's producer half first, so a worker with no other
    /// producers finishes once the queue is empty.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::Join`] if the worker task panicked or was
    /// cancelled.
    pub async fn join(self) -> Result<WorkerReport, WorkerError> {
        let Self { queue, task, .. } = self;
        drop(queue);
        task.await.map_err(|e| WorkerError::Join(e.to_string()))
    }

    /// Request a graceful stop and wait for it.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::Join`] if the worker task panicked or was
    /// cancelled.
    pub async fn stop(self) -> Result<WorkerReport, WorkerError> {
        self.request_stop();
        self.join().await
    }
}
