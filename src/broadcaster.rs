//! Fans link events out to every interested consumer.
//!
//! Each subscriber gets its own unbounded channel, held in a registry keyed
//! by [`SubscriberId`]. Publishing walks the registry under one lock, so every
//! subscriber sees events in publish order. A subscriber that dropped its
//! [`Subscription`] is pruned the next time something is published.

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use log::{debug, trace};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use crate::frame_decoder::DecodedBatch;

/// Handle identifying one subscriber in the registry.
pub type SubscriberId = u64;

/// What the consumers get to see.
///
/// Serializes to the shapes the consumers already understand:
/// `{"type":"goertzel","data":[..]}`, `{"type":"raw","data":".."}`,
/// `{"status":".."}` and `{"error":".."}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LinkEvent {
    /// A decoded payload from the node
    Data(DecodedBatch),
    /// A link state change
    Status {
        /// Human readable description of the new state
        status: String,
    },
    /// Something went wrong with the link or a command
    Error {
        /// Human readable description of the problem
        error: String,
    },
}

/// Which of the three kinds an event is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// [`LinkEvent::Status`]
    Status,
    /// [`LinkEvent::Error`]
    Error,
    /// [`LinkEvent::Data`]
    Data,
}

impl LinkEvent {
    /// A status event.
    pub fn status(message: impl Into<String>) -> Self {
        Self::Status {
            status: message.into(),
        }
    }

    /// An error event.
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            error: message.into(),
        }
    }

    /// The kind tag of this event.
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Data(_) => EventKind::Data,
            Self::Status { .. } => EventKind::Status,
            Self::Error { .. } => EventKind::Error,
        }
    }

    /// The event as one line of JSON.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[derive(Debug, Default)]
struct Registry {
    next_id: SubscriberId,
    sinks: BTreeMap<SubscriberId, Sender<LinkEvent>>,
}

/// The fan-out point. Cloning gives another handle to the same registry.
#[derive(Debug, Clone, Default)]
pub struct Broadcaster {
    registry: Arc<Mutex<Registry>>,
}

/// The receiving end held by one subscriber. Dropping it is enough to
/// unsubscribe; the registry notices on the next publish.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriberId,
    events: Receiver<LinkEvent>,
}

impl Subscription {
    /// This subscriber's id.
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Blocks until the next event. `None` once the subscriber was removed
    /// from the registry and everything queued has been read.
    pub fn recv(&self) -> Option<LinkEvent> {
        self.events.recv().ok()
    }

    /// Blocks for at most `timeout`.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<LinkEvent> {
        match self.events.recv_timeout(timeout) {
            Ok(event) => Some(event),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Returns an event if one is already queued.
    pub fn try_recv(&self) -> Option<LinkEvent> {
        match self.events.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    /// Drains everything currently queued.
    pub fn drain(&self) -> Vec<LinkEvent> {
        self.events.try_iter().collect()
    }

    /// The underlying channel, for use with `crossbeam_channel::select!`.
    pub fn receiver(&self) -> &Receiver<LinkEvent> {
        &self.events
    }
}

impl Broadcaster {
    /// An empty broadcaster.
    pub fn new() -> Self {
        Self::default()
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a new subscriber.
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = unbounded();
        let mut registry = self.registry();
        let id = registry.next_id;
        registry.next_id += 1;
        registry.sinks.insert(id, tx);
        debug!("Subscriber {} joined ({} total)", id, registry.sinks.len());

        Subscription { id, events: rx }
    }

    /// Removes a subscriber. Returns false when it was not registered.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let removed = self.registry().sinks.remove(&id).is_some();
        if removed {
            debug!("Subscriber {} left", id);
        }
        removed
    }

    /// Delivers `event` to every subscriber and returns how many received
    /// it. Subscribers whose receiving end is gone are dropped.
    pub fn publish(&self, event: LinkEvent) -> usize {
        trace!("Publishing {:?} event", event.kind());
        let mut registry = self.registry();
        registry.sinks.retain(|id, sink| match sink.send(event.clone()) {
            Ok(()) => true,
            Err(_) => {
                debug!("Subscriber {} is gone, pruning", id);
                false
            }
        });
        registry.sinks.len()
    }

    /// Delivers `event` to one subscriber only.
    pub fn send_to(&self, id: SubscriberId, event: LinkEvent) -> bool {
        let mut registry = self.registry();
        let delivered = match registry.sinks.get(&id) {
            Some(sink) => sink.send(event).is_ok(),
            None => return false,
        };
        if !delivered {
            registry.sinks.remove(&id);
        }
        delivered
    }

    /// Number of registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.registry().sinks.len()
    }
}
