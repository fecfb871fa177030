//! Idle-expiring cache of loaded crews.

use crate::types::CrewId;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug)]
struct Entry<T> {
    value: T,
    last_used: Instant,
}

/// Crews touched within `ttl` stay resident; [`CrewCache::evict_idle`]
/// drops the rest.
#[derive(Debug)]
pub struct CrewCache<T> {
    ttl: Duration,
    entries: HashMap<CrewId, Entry<T>>,
}

impl<T: Clone> CrewCache<T> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: HashMap::new(),
        }
    }

    /// Look up and touch.
    pub fn get(&mut self, cid: &CrewId) -> Option<T> {
        let entry = self.entries.get_mut(cid)?;
        entry.last_used = Instant::now();
        Some(entry.value.clone())
    }

    pub fn insert(&mut self, cid: CrewId, value: T) {
        self.entries.insert(
            cid,
            Entry {
                value,
                last_used: Instant::now(),
            },
        );
    }

    pub fn remove(&mut self, cid: &CrewId) -> Option<T> {
        self.entries.remove(cid).map(|e| e.value)
    }

    /// Drop entries idle for longer than the ttl, except those `pinned`
    /// says must stay. Returns the evicted ids.
    pub fn evict_idle(&mut self, pinned: impl Fn(&T) -> bool) -> Vec<CrewId> {
        let now = Instant::now();
        let ttl = self.ttl;
        let expired: Vec<CrewId> = self
            .entries
            .iter()
            .filter(|(_, e)| now.duration_since(e.last_used) > ttl && !pinned(&e.value))
            .map(|(cid, _)| cid.clone())
            .collect();
        for cid in &expired {
            self.entries.remove(cid);
        }
        if !expired.is_empty() {
            tracing::debug!("Evicted {} idle crews", expired.len());
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_evicts_only_idle() {
        let mut cache = CrewCache::new(Duration::from_secs(10));
        cache.insert(CrewId::from("old"), 1);
        tokio::time::advance(Duration::from_secs(8)).await;
        cache.insert(CrewId::from("new"), 2);
        tokio::time::advance(Duration::from_secs(5)).await;

        let evicted = cache.evict_idle(|_| false);
        assert_eq!(evicted, vec![CrewId::from("old")]);
        assert_eq!(cache.get(&CrewId::from("new")), Some(2));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_touches() {
        let mut cache = CrewCache::new(Duration::from_secs(10));
        cache.insert(CrewId::from("c"), 1);
        tokio::time::advance(Duration::from_secs(8)).await;
        assert_eq!(cache.get(&CrewId::from("c")), Some(1));
        tokio::time::advance(Duration::from_secs(8)).await;
        assert!(cache.evict_idle(|_| false).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pinned_survive() {
        let mut cache = CrewCache::new(Duration::from_secs(1));
        cache.insert(CrewId::from("busy"), 7);
        cache.insert(CrewId::from("idle"), 0);
        tokio::time::advance(Duration::from_secs(5)).await;
        let evicted = cache.evict_idle(|v| *v > 0);
        assert_eq!(evicted, vec![CrewId::from("idle")]);
        assert!(cache.remove(&CrewId::from("busy")).is_some());
        assert!(cache.is_empty());
    }
}
