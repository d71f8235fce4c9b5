//! Ordered, non-blocking delivery of breaker and bulkhead events.
//!
//! Each breaker or bulkhead that has a callback owns one [`EventNotifier`]:
//! a bounded channel drained by a single named thread. Events therefore reach
//! the callback in the order they happened, callbacks never run while a
//! primitive holds its lock, and a slow callback can only cost dropped
//! events, never a blocked caller.

use std::fmt;
use std::sync::mpsc::{self, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::SystemTime;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::circuit_breaker::CircuitState;
use crate::error::ResilienceError;

/// Events buffered per notifier before new ones are dropped.
pub const DEFAULT_EVENT_QUEUE: usize = 64;

/// A circuit breaker moved between states.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange {
    /// Breaker name.
    pub name: String,
    /// State before the transition.
    pub from: CircuitState,
    /// State after the transition.
    pub to: CircuitState,
    /// Wall-clock time of the transition.
    pub at: SystemTime,
}

/// A bulkhead turned a caller away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    /// Bulkhead name.
    pub name: String,
    /// `BulkheadFull` or `BulkheadTimeout`.
    pub reason: ResilienceError,
}

/// Callback invoked for every breaker state change.
pub type OnStateChange = Arc<dyn Fn(&StateChange) + Send + Sync>;

/// Callback invoked for every bulkhead rejection.
pub type OnReject = Arc<dyn Fn(&Rejection) + Send + Sync>;

/// Single-consumer event pump feeding one callback.
pub struct EventNotifier<Ev: Send + 'static> {
    name: String,
    sender: Mutex<Option<SyncSender<Ev>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<Ev: Send + 'static> fmt::Debug for EventNotifier<Ev> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventNotifier")
            .field("name", &self.name)
            .field("open", &self.sender.lock().is_some())
            .finish()
    }
}

impl<Ev: Send + 'static> EventNotifier<Ev> {
    /// Start a notifier thread delivering events to `handler`.
    ///
    /// If the OS refuses to start the thread the notifier is created closed
    /// and every event is discarded.
    pub fn spawn<F>(name: &str, capacity: usize, handler: F) -> Self
    where
        F: Fn(&Ev) + Send + 'static,
    {
        let (tx, rx) = mpsc::sync_channel::<Ev>(capacity.max(1));
        let spawned = thread::Builder::new().name(format!("resilience-notify-{name}")).spawn(
            move || {
                for event in rx {
                    handler(&event);
                }
            },
        );

        match spawned {
            Ok(worker) => Self {
                name: name.to_string(),
                sender: Mutex::new(Some(tx)),
                worker: Mutex::new(Some(worker)),
            },
            Err(error) => {
                warn!(name, %error, "failed to start event notifier thread; events disabled");
                Self { name: name.to_string(), sender: Mutex::new(None), worker: Mutex::new(None) }
            }
        }
    }

    /// Queue an event without blocking.
    ///
    /// Returns `false` when the event was dropped because the queue is full
    /// or the notifier is shut down.
    pub fn notify(&self, event: Ev) -> bool {
        let guard = self.sender.lock();
        let Some(sender) = guard.as_ref() else {
            return false;
        };
        match sender.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(name = %self.name, "event queue full, dropping event");
                false
            }
            Err(TrySendError::Disconnected(_)) => {
                debug!(name = %self.name, "event notifier stopped, dropping event");
                false
            }
        }
    }

    /// Whether events are still accepted.
    pub fn is_open(&self) -> bool {
        self.sender.lock().is_some()
    }

    /// Close the queue, let the thread drain it, and join the thread.
    ///
    /// Calling this from inside the callback closes the queue without
    /// joining.
    pub fn shutdown(&self) {
        self.sender.lock().take();
        let Some(worker) = self.worker.lock().take() else {
            return;
        };
        if worker.thread().id() == thread::current().id() {
            return;
        }
        if worker.join().is_err() {
            warn!(name = %self.name, "event notifier callback panicked");
        }
    }
}

impl<Ev: Send + 'static> Drop for EventNotifier<Ev> {
    fn drop(&mut self) {
        // Closing the channel lets the thread drain and exit on its own.
        self.sender.get_mut().take();
    }
}
