//! In-memory outbox and dead-letter stores.

use boxoffice_core::dead_letter::{DeadLetter, DeadLetterError, DeadLetterSink};
use boxoffice_core::event::SerializedEvent;
use boxoffice_core::event_bus::BoxFuture;
use boxoffice_core::outbox::{Outbox, OutboxError, OutboxMessage};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct OutboxRows {
    next_id: i64,
    rows: Vec<(OutboxMessage, bool)>,
}

/// Outbox kept in a vector.
#[derive(Clone, Default)]
pub struct InMemoryOutbox {
    rows: Arc<Mutex<OutboxRows>>,
}

impl InMemoryOutbox {
    /// Create an empty outbox.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message and return its id.
    pub fn push(&self, topic: &str, routing_key: &str, event: SerializedEvent) -> i64 {
        let mut rows = lock(&self.rows);
        rows.next_id += 1;
        let id = rows.next_id;
        rows.rows.push((
            OutboxMessage {
                id,
                topic: topic.to_string(),
                routing_key: routing_key.to_string(),
                event,
            },
            false,
        ));
        id
    }

    /// Number of messages not yet published.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        lock(&self.rows).rows.iter().filter(|(_, done)| !done).count()
    }
}

impl Outbox for InMemoryOutbox {
    fn pending(&self, limit: usize) -> BoxFuture<'_, Result<Vec<OutboxMessage>, OutboxError>> {
        let pending = lock(&self.rows)
            .rows
            .iter()
            .filter(|(_, done)| !done)
            .take(limit)
            .map(|(message, _)| message.clone())
            .collect();
        Box::pin(async move { Ok(pending) })
    }

    fn mark_published(&self, ids: &[i64]) -> BoxFuture<'_, Result<(), OutboxError>> {
        let mut rows = lock(&self.rows);
        for (message, done) in &mut rows.rows {
            if ids.contains(&message.id) {
                *done = true;
            }
        }
        Box::pin(async { Ok(()) })
    }
}

/// Dead-letter sink that keeps every parked delivery.
#[derive(Clone, Default)]
pub struct InMemoryDeadLetters {
    letters: Arc<Mutex<Vec<DeadLetter>>>,
}

impl InMemoryDeadLetters {
    /// Create an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parked deliveries, oldest first.
    #[must_use]
    pub fn letters(&self) -> Vec<DeadLetter> {
        lock(&self.letters).clone()
    }
}

impl DeadLetterSink for InMemoryDeadLetters {
    fn park(&self, letter: DeadLetter) -> BoxFuture<'_, Result<(), DeadLetterError>> {
        lock(&self.letters).push(letter);
        Box::pin(async { Ok(()) })
    }
}
