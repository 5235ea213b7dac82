//! ==============================================================================
//! history.rs - bounded window of recent snapshot sets
//! ==============================================================================
//!
//! relationships:
//!     - written by: scheduler.rs (once per tick, before broadcast)
//!     - read by: server.rs (/api/snapshot, /api/history)
//!
//! ==============================================================================

use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::domain::SnapshotSet;

/// Oldest sets are evicted once `capacity` is reached; capacity 0 keeps nothing.
pub struct History {
    capacity: usize,
    sets: RwLock<VecDeque<Arc<SnapshotSet>>>,
}

impl History {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            sets: RwLock::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub async fn push(&self, set: Arc<SnapshotSet>) {
        if self.capacity == 0 {
            return;
        }
        let mut sets = self.sets.write().await;
        while sets.len() >= self.capacity {
            sets.pop_front();
        }
        sets.push_back(set);
    }

    pub async fn latest(&self) -> Option<Arc<SnapshotSet>> {
        self.sets.read().await.back().cloned()
    }

    /// Up to `limit` most recent sets, oldest first.
    pub async fn recent(&self, limit: usize) -> Vec<Arc<SnapshotSet>> {
        let sets = self.sets.read().await;
        let skip = sets.len().saturating_sub(limit);
        sets.iter().skip(skip).cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.sets.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(tick: u64) -> Arc<SnapshotSet> {
        Arc::new(SnapshotSet {
            tick,
            ..SnapshotSet::default()
        })
    }

    fn ticks(sets: &[Arc<SnapshotSet>]) -> Vec<u64> {
        sets.iter().map(|s| s.tick).collect()
    }

    #[tokio::test]
    async fn evicts_oldest_when_full() {
        let history = History::new(3);
        for tick in 1..=5 {
            history.push(set(tick)).await;
        }
        assert_eq!(history.len().await, 3);
        assert_eq!(ticks(&history.recent(10).await), vec![3, 4, 5]);
        assert_eq!(history.latest().await.map(|s| s.tick), Some(5));
    }

    #[tokio::test]
    async fn recent_returns_newest_oldest_first() {
        let history = History::new(10);
        for tick in 1..=6 {
            history.push(set(tick)).await;
        }
        assert_eq!(ticks(&history.recent(2).await), vec![5, 6]);
        assert!(history.recent(0).await.is_empty());
    }

    #[tokio::test]
    async fn zero_capacity_retains_nothing() {
        let history = History::new(0);
        history.push(set(1)).await;
        assert_eq!(history.len().await, 0);
        assert!(history.latest().await.is_none());
    }
}
