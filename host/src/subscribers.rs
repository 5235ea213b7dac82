//! ==============================================================================
//! subscribers.rs - connected subscribers and snapshot fan-out
//! ==============================================================================
//!
//! purpose:
//!     tracks every live push connection and hands each tick's snapshot set
//!     to all of them.
//!
//! concurrency:
//!     the map is a `DashMap`, so connect and disconnect never wait on a
//!     running broadcast. `broadcast` copies the entries out first and
//!     delivers with no shard lock held.
//!
//! relationships:
//!     - used by: scheduler.rs (broadcast), server.rs (subscribe/remove)
//!
//! ==============================================================================

use dashmap::DashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info};

use crate::domain::SnapshotSet;

/// Opaque connection identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    /// The receiving side is gone; the subscriber is removed.
    #[error("subscriber is gone")]
    Gone,
    /// The subscriber's queue is full; this snapshot set is dropped for it.
    #[error("subscriber queue is full")]
    Lagging,
}

/// Delivery capability for one subscriber. Must not block.
pub trait Deliver: Send + Sync {
    fn deliver(&self, set: &Arc<SnapshotSet>) -> Result<(), DeliveryError>;
}

impl Deliver for mpsc::Sender<Arc<SnapshotSet>> {
    fn deliver(&self, set: &Arc<SnapshotSet>) -> Result<(), DeliveryError> {
        self.try_send(Arc::clone(set)).map_err(|error| match error {
            TrySendError::Closed(_) => DeliveryError::Gone,
            TrySendError::Full(_) => DeliveryError::Lagging,
        })
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub lagging: usize,
    pub removed: usize,
}

pub struct SubscriberRegistry {
    subscribers: DashMap<SubscriberId, Arc<dyn Deliver>>,
    next_id: AtomicU64,
}

impl Default for SubscriberRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self {
            subscribers: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Allocate an identity that has never been handed out before.
    pub fn next_id(&self) -> SubscriberId {
        SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Register `deliver` under `id`, replacing any previous capability.
    pub fn add(&self, id: SubscriberId, deliver: Arc<dyn Deliver>) {
        self.subscribers.insert(id, deliver);
        debug!(subscriber = %id, total = self.subscribers.len(), "subscriber added");
    }

    /// Register a channel-backed subscriber holding up to `queue_depth` sets.
    pub fn subscribe(&self, queue_depth: usize) -> (SubscriberId, mpsc::Receiver<Arc<SnapshotSet>>) {
        let (tx, rx) = mpsc::channel(queue_depth.max(1));
        let id = self.next_id();
        self.add(id, Arc::new(tx));
        (id, rx)
    }

    /// Returns whether `id` was registered. Removing twice is a no-op.
    pub fn remove(&self, id: SubscriberId) -> bool {
        self.subscribers.remove(&id).is_some()
    }

    pub fn contains(&self, id: SubscriberId) -> bool {
        self.subscribers.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }

    pub fn broadcast(&self, set: &Arc<SnapshotSet>) -> BroadcastReport {
        let targets: Vec<(SubscriberId, Arc<dyn Deliver>)> = self
            .subscribers
            .iter()
            .map(|entry| (*entry.key(), Arc::clone(entry.value())))
            .collect();

        let mut report = BroadcastReport::default();
        for (id, deliver) in targets {
            // removed after the copy was taken
            if !self.contains(id) {
                continue;
            }
            match deliver.deliver(set) {
                Ok(()) => report.delivered += 1,
                Err(DeliveryError::Lagging) => {
                    debug!(subscriber = %id, tick = set.tick, "subscriber lagging; dropped update");
                    report.lagging += 1;
                }
                Err(DeliveryError::Gone) => {
                    if self.remove(id) {
                        info!(subscriber = %id, "subscriber gone; removed");
                        report.removed += 1;
                    }
                }
            }
        }
        report
    }
}
