//! Module state-change notifications.
//!
//! Every lifecycle transition is published as a [`ModuleStateChanged`] event,
//! both to synchronous [`ModuleObserver`]s and to `tokio::sync::broadcast`
//! subscribers. Events carry a monotonically increasing sequence number and
//! are delivered in the order the transitions happened.
//!
//! # Example
//!
//! ```rust,ignore
//! let mut rx = manager.subscribe();
//! tokio::spawn(async move {
//!     while let Ok(event) = rx.recv().await {
//!         println!("{}: {} -> {}", event.module, event.old_state, event.new_state);
//!     }
//! });
//!
//! manager.activate("scan_logic").await?;
//! ```

use super::ModuleState;
use serde::Serialize;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::error;

/// Default capacity of the broadcast channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// One lifecycle transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModuleStateChanged {
    /// Position of this event in the global transition order.
    pub sequence: u64,
    /// Module that changed state.
    pub module: String,
    /// State before the transition.
    pub old_state: ModuleState,
    /// State after the transition.
    pub new_state: ModuleState,
}

/// Synchronous receiver of state-change events.
///
/// Called on the thread performing the transition, in transition order.
/// Keep it short: no other module changes state until it returns. It must not
/// start lifecycle operations itself. A panic is caught and logged; the
/// transition and the remaining observers are unaffected.
pub trait ModuleObserver: Send + Sync {
    /// Handles one event.
    fn on_state_changed(&self, event: &ModuleStateChanged);
}

impl<F> ModuleObserver for F
where
    F: Fn(&ModuleStateChanged) + Send + Sync,
{
    fn on_state_changed(&self, event: &ModuleStateChanged) {
        self(event)
    }
}

/// Handle returned by [`EventBus::add_observer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

struct BusInner {
    next_sequence: u64,
    next_observer: u64,
    observers: Vec<(ObserverId, Arc<dyn ModuleObserver>)>,
}

/// Fan-out point for state-change events.
pub struct EventBus {
    inner: parking_lot::Mutex<BusInner>,
    sender: broadcast::Sender<ModuleStateChanged>,
}

impl EventBus {
    /// Creates a bus whose broadcast channel buffers `capacity` events.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: parking_lot::Mutex::new(BusInner {
                next_sequence: 0,
                next_observer: 0,
                observers: Vec::new(),
            }),
            sender,
        }
    }

    /// Subscribe to events published from now on.
    ///
    /// Slow subscribers see `RecvError::Lagged` once they fall more than the
    /// channel capacity behind; observers never miss events.
    pub fn subscribe(&self) -> broadcast::Receiver<ModuleStateChanged> {
        self.sender.subscribe()
    }

    /// Registers a synchronous observer.
    pub fn add_observer(&self, observer: Arc<dyn ModuleObserver>) -> ObserverId {
        let mut inner = self.inner.lock();
        let id = ObserverId(inner.next_observer);
        inner.next_observer += 1;
        inner.observers.push((id, observer));
        id
    }

    /// Unregisters an observer. Returns `false` if it was not registered.
    pub fn remove_observer(&self, id: ObserverId) -> bool {
        let mut inner = self.inner.lock();
        let before = inner.observers.len();
        inner.observers.retain(|(registered, _)| *registered != id);
        inner.observers.len() != before
    }

    /// Number of registered observers.
    pub fn observer_count(&self) -> usize {
        self.inner.lock().observers.len()
    }

    /// Number of broadcast subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Publishes one transition.
    ///
    /// Callers serialise transitions themselves; the bus only assigns the
    /// sequence number. Observers are called without the bus lock held so they
    /// may register further observers.
    pub(crate) fn publish(
        &self,
        module: &str,
        old_state: ModuleState,
        new_state: ModuleState,
    ) -> ModuleStateChanged {
        let (event, observers) = {
            let mut inner = self.inner.lock();
            let event = ModuleStateChanged {
                sequence: inner.next_sequence,
                module: module.to_string(),
                old_state,
                new_state,
            };
            inner.next_sequence += 1;
            let observers: Vec<Arc<dyn ModuleObserver>> =
                inner.observers.iter().map(|(_, o)| o.clone()).collect();
            (event, observers)
        };

        for observer in observers {
            let delivered =
                panic::catch_unwind(AssertUnwindSafe(|| observer.on_state_changed(&event)));
            if delivered.is_err() {
                error!(
                    module = %event.module,
                    sequence = event.sequence,
                    "State-change observer panicked"
                );
            }
        }
        // No subscribers is fine.
        let _ = self.sender.send(event.clone());
        event
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("observers", &self.observer_count())
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}
