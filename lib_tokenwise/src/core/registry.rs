//! # Subscriber Registry
//!
//! Owns every connected observer. Each subscriber is an unbounded MPSC sender
//! whose receiving half is drained by that connection's task, so the connection
//! task is the only writer to its socket and a send here never blocks.
//!
//! A failed send means the receiving task is gone. `send` drops that subscriber
//! on the spot; `broadcast` delivers to everyone first and drops the failures
//! after the pass.
//!
//! When a removal empties the registry a `RegistryEvent::Drained` is emitted on
//! the lifecycle channel before the removing call returns.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::SubscriberUnreachable;

/// Process-local identity of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(Uuid);

impl SubscriberId {
    fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Serialized frame shared by every recipient of a broadcast.
pub type Frame = Arc<str>;

/// Serializes `message` into a shareable JSON text frame.
pub fn encode_frame<T: serde::Serialize>(message: &T) -> Result<Frame, serde_json::Error> {
    serde_json::to_string(message).map(Frame::from)
}

/// Membership transitions the lifecycle controller reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryEvent {
    /// The last subscriber was removed.
    Drained,
}

/// Result of one broadcast pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub dropped: Vec<SubscriberId>,
}

pub struct SubscriberRegistry {
    subscribers: Mutex<HashMap<SubscriberId, mpsc::UnboundedSender<Frame>>>,
    events: Mutex<Option<mpsc::UnboundedSender<RegistryEvent>>>,
}

impl Default for SubscriberRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            events: Mutex::new(None),
        }
    }

    /// Installs the channel that receives `RegistryEvent`s. Replaces any previous one.
    pub fn watch(&self) -> mpsc::UnboundedReceiver<RegistryEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        *lock(&self.events) = Some(tx);
        rx
    }

    fn members(&self) -> MutexGuard<'_, HashMap<SubscriberId, mpsc::UnboundedSender<Frame>>> {
        lock(&self.subscribers)
    }

    /// Registers a new subscriber and hands back the receiving half of its queue.
    pub fn connect(&self) -> (SubscriberId, mpsc::UnboundedReceiver<Frame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = SubscriberId::generate();
        let total = {
            let mut members = self.members();
            members.insert(id, tx);
            members.len()
        };
        info!(subscriber = %id, total, "Subscriber connected");
        (id, rx)
    }

    /// Removes `id` if present. Returns whether it was registered.
    pub fn disconnect(&self, id: SubscriberId) -> bool {
        let (removed, remaining) = {
            let mut members = self.members();
            let removed = members.remove(&id).is_some();
            (removed, members.len())
        };
        if removed {
            info!(subscriber = %id, remaining, "Subscriber disconnected");
            if remaining == 0 {
                self.signal(RegistryEvent::Drained);
            }
        }
        removed
    }

    /// Unicast. A closed queue disconnects the subscriber.
    pub fn send(&self, id: SubscriberId, frame: Frame) -> Result<(), SubscriberUnreachable> {
        let sender = self.members().get(&id).cloned();
        match sender {
            Some(tx) if tx.send(frame).is_ok() => Ok(()),
            Some(_) => {
                debug!(subscriber = %id, "Unicast failed, dropping subscriber");
                self.disconnect(id);
                Err(SubscriberUnreachable(id))
            }
            None => Err(SubscriberUnreachable(id)),
        }
    }

    /// Delivers `frame` to every registered subscriber, then drops the ones whose
    /// queue was closed.
    pub fn broadcast(&self, frame: Frame) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        {
            let members = self.members();
            for (id, tx) in members.iter() {
                if tx.send(Arc::clone(&frame)).is_ok() {
                    report.delivered += 1;
                } else {
                    report.dropped.push(*id);
                }
            }
        }
        for id in &report.dropped {
            debug!(subscriber = %id, "Broadcast failed, dropping subscriber");
            self.disconnect(*id);
        }
        report
    }

    pub fn len(&self) -> usize {
        self.members().len()
    }

    pub fn is_empty(&self) -> bool {
        self.members().is_empty()
    }

    pub fn contains(&self, id: SubscriberId) -> bool {
        self.members().contains_key(&id)
    }

    fn signal(&self, event: RegistryEvent) {
        if let Some(tx) = lock(&self.events).as_ref() {
            let _ = tx.send(event);
        }
    }
}

/// A panic while holding the lock cannot leave the map half-updated, so a
/// poisoned lock is still usable.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
