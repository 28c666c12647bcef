// Copyright (c) 2026 berth contributors
// SPDX-License-Identifier: AGPL-3.0

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Key under which the full stack listing is cached.
pub const STACK_LIST_KEY: &str = "stacks";

/// Short-lived cache of status snapshots. Entries expire after `ttl`;
/// mutating operations invalidate explicitly.
pub struct RuntimeCache<T: Clone> {
    ttl: Duration,
    entries: Mutex<HashMap<String, (Instant, T)>>,
}

impl<T: Clone> RuntimeCache<T> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &str) -> Option<T> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some((stored, value)) if stored.elapsed() < self.ttl => Some(value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn put(&self, key: impl Into<String>, value: T) {
        self.entries.lock().insert(key.into(), (Instant::now(), value));
    }

    pub fn invalidate(&self, key: &str) {
        self.entries.lock().remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get_invalidate() {
        let cache = RuntimeCache::new(Duration::from_secs(60));
        cache.put(STACK_LIST_KEY, vec![1, 2]);
        assert_eq!(cache.get(STACK_LIST_KEY), Some(vec![1, 2]));
        cache.invalidate(STACK_LIST_KEY);
        assert_eq!(cache.get(STACK_LIST_KEY), None);
    }

    #[test]
    fn test_zero_ttl_never_hits() {
        let cache = RuntimeCache::new(Duration::ZERO);
        cache.put("k", 1);
        assert_eq!(cache.get("k"), None);
    }
}
