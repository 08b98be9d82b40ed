//! Per-run event fan-out.
//!
//! Every agent run owns one `EventBus`. The run publishes [`RunEvent`]s and
//! any number of host components subscribe to them.
//!
//! # Example
//!
//! ```rust
//! use conduit_core::event_bus::EventBus;
//! use conduit_core::run::RunEvent;
//!
//! let bus = EventBus::new();
//! let mut rx = bus.subscribe();
//!
//! bus.emit(RunEvent::Exit(0));
//! assert_eq!(rx.try_recv().ok(), Some(RunEvent::Exit(0)));
//! ```
//!
//! Subscribers get unbounded queues: a slow consumer never makes another
//! consumer miss events, and the final `Result` of a turn is never dropped.
//! Once [`EventBus::close`] is called nothing more is delivered and every
//! receiver sees the end of its stream.

use std::sync::Mutex;

use tokio::sync::mpsc;

use crate::run::RunEvent;

/// Receiving end handed to subscribers.
pub type EventReceiver = mpsc::UnboundedReceiver<RunEvent>;

#[derive(Default)]
struct BusState {
    subscribers: Vec<mpsc::UnboundedSender<RunEvent>>,
    closed: bool,
}

/// Fan-out of [`RunEvent`]s to every subscriber.
#[derive(Default)]
pub struct EventBus {
    state: Mutex<BusState>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Emit an event to all subscribers.
    ///
    /// Returns the number of subscribers that received it. Subscribers whose
    /// receiver was dropped are pruned. After `close()` this is a no-op.
    pub fn emit(&self, event: RunEvent) -> usize {
        let Ok(mut state) = self.state.lock() else {
            log::warn!("Event bus lock poisoned, dropping event");
            return 0;
        };
        if state.closed {
            return 0;
        }
        state
            .subscribers
            .retain(|tx| tx.send(event.clone()).is_ok());
        state.subscribers.len()
    }

    /// Subscribe to all future events.
    ///
    /// Past events are not replayed. Subscribing to a closed bus yields a
    /// receiver that is already at its end.
    pub fn subscribe(&self) -> EventReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut state) = self.state.lock() {
            if !state.closed {
                state.subscribers.push(tx);
            }
        }
        rx
    }

    /// Stop delivering events and end every subscriber's stream.
    pub fn close(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.closed = true;
            state.subscribers.clear();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().map(|s| s.closed).unwrap_or(true)
    }

    pub fn subscriber_count(&self) -> usize {
        self.state.lock().map(|s| s.subscribers.len()).unwrap_or(0)
    }
}

// ============================================================================
// TESTS
// ============================================================================
