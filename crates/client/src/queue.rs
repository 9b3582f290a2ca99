use std::collections::VecDeque;

use assetcache_protocol::CacheKey;

/// FIFO of cache keys waiting to be requested. A key is queued at most once.
#[derive(Debug, Default)]
pub struct PendingQueue {
    items: VecDeque<CacheKey>,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `key`. Returns `false` if it was already queued.
    pub fn push(&mut self, key: CacheKey) -> bool {
        if self.contains(&key) {
            return false;
        }
        self.items.push_back(key);
        true
    }

    /// Puts `key` back at the head, ahead of newer requests.
    pub fn requeue(&mut self, key: CacheKey) {
        if !self.contains(&key) {
            self.items.push_front(key);
        }
    }

    pub fn pop(&mut self) -> Option<CacheKey> {
        self.items.pop_front()
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.items.contains(key)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Removes and returns everything, oldest first.
    pub fn drain(&mut self) -> Vec<CacheKey> {
        self.items.drain(..).collect()
    }
}
