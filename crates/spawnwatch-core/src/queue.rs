//! Unbounded FIFO carrying events from producers to the persistence worker.
//!
//! Built on a tokio unbounded MPSC channel. [`EventQueue`] is the cloneable
//! producer half: `push` never blocks and never waits for capacity.
//! [`EventReceiver`] is the single consumer half owned by the worker.
//!
//! Delivery order is enqueue order. There is no prioritisation and no
//! acknowledgement: once pushed, an event is the worker's problem.

use spawnwatch_types::Event;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender, error::TryRecvError};

/// The consumer has gone away; the event was not enqueued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("event queue is closed")]
pub struct QueueClosed;

/// Producer half of the event queue.
#[derive(Debug, Clone)]
pub struct EventQueue {
    sender: UnboundedSender<Event>,
}

impl EventQueue {
    /// Append an event to the queue without blocking.
    ///
    /// # Errors
    ///
    /// Returns [`QueueClosed`] if the worker has already stopped.
    pub fn push(&self, event: Event) -> Result<(), QueueClosed> {
        self.sender.send(event).map_err(|_err| QueueClosed)
    }

    /// Whether the consumer half has been dropped.
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// Consumer half of the event queue.
#[derive(Debug)]
pub struct EventReceiver {
    receiver: UnboundedReceiver<Event>,
}

/// Result of a non-blocking pop.
#[derive(Debug, PartialEq)]
pub enum TryPop {
    /// The next event.
    Event(Event),
    /// Nothing queued right now.
    Empty,
    /// Nothing queued and every producer handle is gone.
    Disconnected,
}

impl EventReceiver {
    /// Wait for the next event.
    ///
    /// Returns `None` once the queue is empty and every producer handle has
    /// been dropped.
    pub async fn pop(&mut self) -> Option<Event> {
        self.receiver.recv().await
    }

    /// Take the next event if one is queued.
    pub fn try_pop(&mut self) -> TryPop {
        match self.receiver.try_recv() {
            Ok(event) => TryPop::Event(event),
            Err(TryRecvError::Empty) => TryPop::Empty,
            Err(TryRecvError::Disconnected) => TryPop::Disconnected,
        }
    }

    /// Number of events waiting.
    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    /// Whether no events are waiting.
    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }
}

/// Create a connected producer/consumer pair.
pub fn event_queue() -> (EventQueue, EventReceiver) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (EventQueue { sender }, EventReceiver { receiver })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use spawnwatch_types::{Coordinate, PointOfInterest};

    use super::*;

    fn poi(n: u32) -> Event {
        Event::PointOfInterest(PointOfInterest {
            poi_id: format!("poi-{n}"),
            position: Coordinate::new(0.0, 0.0),
            name: None,
        })
    }

    #[tokio::test]
    async fn delivers_in_enqueue_order() {
        let (queue, mut receiver) = event_queue();
        for n in 0..5 {
            queue.push(poi(n)).unwrap();
        }
        assert_eq!(receiver.len(), 5);
        for n in 0..5 {
            assert_eq!(receiver.pop().await, Some(poi(n)));
        }
        assert!(receiver.is_empty());
    }

    #[tokio::test]
    async fn concurrent_producers_lose_nothing() {
        let (queue, mut receiver) = event_queue();
        let mut producers = Vec::new();
        for p in 0..4_u32 {
            let queue = queue.clone();
            producers.push(tokio::spawn(async move {
                for n in 0..250_u32 {
                    queue.push(poi(p * 1000 + n)).unwrap();
                }
            }));
        }
        for producer in producers {
            producer.await.unwrap();
        }
        drop(queue);

        let mut received = 0_u32;
        while receiver.pop().await.is_some() {
            received += 1;
        }
        assert_eq!(received, 1000);
    }

    #[test]
    fn try_pop_reports_disconnect() {
        let (queue, mut receiver) = event_queue();
        assert_eq!(receiver.try_pop(), TryPop::Empty);
        queue.push(Event::Shutdown).unwrap();
        drop(queue);
        assert_eq!(receiver.try_pop(), TryPop::Event(Event::Shutdown));
        assert_eq!(receiver.try_pop(), TryPop::Disconnected);
    }

    #[test]
    fn push_fails_after_consumer_drops() {
        let (queue, receiver) = event_queue();
        drop(receiver);
        assert!(queue.is_closed());
        assert_eq!(queue.push(Event::Shutdown), Err(QueueClosed));
    }
}
