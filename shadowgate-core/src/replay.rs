use std::collections::HashMap;
use std::sync::Mutex;

/// How long a request salt stays in the cache. Must exceed the accepted
/// timestamp skew so that any replay fresh enough to pass the timestamp
/// check is still remembered here.
pub const SALT_WINDOW_MILLIS: u64 = 60_000;

/// Time-bounded set of request salts already seen. The one piece of state
/// shared across sessions; everything goes through the mutex.
#[derive(Debug, Default)]
pub struct SaltCache {
    seen: Mutex<HashMap<Vec<u8>, u64>>,
}

impl SaltCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a salt at `now_ms`. Returns false if the salt is already
    /// present, leaving its original first-seen time in place.
    pub fn try_add(&self, salt: &[u8], now_ms: u64) -> bool {
        let mut seen = self.seen.lock().unwrap_or_else(|e| e.into_inner());
        match seen.get(salt) {
            Some(_) => false,
            None => {
                seen.insert(salt.to_vec(), now_ms);
                true
            }
        }
    }

    /// Drop every entry first seen before `cutoff_ms`.
    pub fn evict_older_than(&self, cutoff_ms: u64) {
        let mut seen = self.seen.lock().unwrap_or_else(|e| e.into_inner());
        seen.retain(|_, first_seen| *first_seen >= cutoff_ms);
    }

    pub fn len(&self) -> usize {
        self.seen.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_add_of_same_salt_is_rejected() {
        let cache = SaltCache::new();
        assert!(cache.try_add(b"salt-a", 1_000));
        assert!(!cache.try_add(b"salt-a", 2_000));
        assert!(cache.try_add(b"salt-b", 2_000));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn eviction_frees_the_salt_for_reuse() {
        let cache = SaltCache::new();
        let now = 100_000;
        assert!(cache.try_add(b"salt", now));
        // Still inside the window.
        cache.evict_older_than(now.saturating_sub(SALT_WINDOW_MILLIS));
        assert!(!cache.try_add(b"salt", now + 1));
        // Window has passed.
        let later = now + SALT_WINDOW_MILLIS + 1;
        cache.evict_older_than(later - SALT_WINDOW_MILLIS);
        assert!(cache.try_add(b"salt", later));
    }

    #[test]
    fn eviction_keeps_entries_at_the_cutoff() {
        let cache = SaltCache::new();
        assert!(cache.try_add(b"old", 1_000));
        assert!(cache.try_add(b"edge", 2_000));
        assert!(cache.try_add(b"new", 3_000));
        cache.evict_older_than(2_000);
        assert_eq!(cache.len(), 2);
        assert!(!cache.try_add(b"edge", 4_000));
        assert!(cache.try_add(b"old", 4_000));
    }
}
