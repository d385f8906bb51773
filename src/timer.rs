//! Restartable one-shot timers.
//!
//! Expiries are never invoked inline. A timer delivers a preset event
//! into the owning state machine's queue, so timer handling serializes
//! with every other event for that machine.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

/// One logical timer (a T1, a T3, ...) that can be started, restarted
/// and cancelled any number of times.
///
/// Starting bumps a generation counter and spawns a sleep task pinned to
/// that generation; a later start or cancel bumps the counter again and
/// the stale task's delivery check fails. At most one armed generation
/// can ever fire.
pub struct Timer<E: Clone + Send + 'static> {
    delay: Duration,
    generation: Arc<AtomicU64>,
    events: mpsc::Sender<E>,
    event: E,
}

impl<E: Clone + Send + 'static> Timer<E> {
    pub fn new(delay: Duration, events: mpsc::Sender<E>, event: E) -> Self {
        Self {
            delay,
            generation: Arc::new(AtomicU64::new(0)),
            events,
            event,
        }
    }

    /// Arm the timer, cancelling any generation already in flight.
    pub fn start(&self) {
        let armed = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let generation = Arc::clone(&self.generation);
        let events = self.events.clone();
        let event = self.event.clone();
        let delay = self.delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if generation.load(Ordering::SeqCst) == armed {
                // queue teardown just means nobody is listening anymore
                let _ = events.send(event).await;
            }
        });
    }

    pub fn cancel(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }
}
