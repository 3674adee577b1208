use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// In-process cache backend with the same key/value semantics as the
/// memcached cluster: opaque bytes, per-key expiry, TTL 0 meaning
/// indefinite. Used by tests and single-instance deployments.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, StoredValue>>,
}

#[derive(Debug)]
struct StoredValue {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn new(value: &[u8], ttl_seconds: u32) -> Self {
        let expires_at = (ttl_seconds > 0)
            .then(|| Instant::now() + Duration::from_secs(u64::from(ttl_seconds)));
        Self {
            value: value.to_vec(),
            expires_at,
        }
    }

    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|instant| Instant::now() >= instant)
    }
}

impl MemoryCache {
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(stored) if stored.is_expired() => {
                entries.remove(key);
                None
            }
            Some(stored) => Some(stored.value.clone()),
            None => None,
        }
    }

    pub fn set(&self, key: &str, value: &[u8], ttl_seconds: u32) {
        self.entries
            .lock()
            .insert(key.to_owned(), StoredValue::new(value, ttl_seconds));
    }

    /// Stores only if absent; returns whether this caller won.
    pub fn add(&self, key: &str, value: &[u8], ttl_seconds: u32) -> bool {
        let mut entries = self.entries.lock();
        if entries.get(key).is_some_and(|stored| !stored.is_expired()) {
            return false;
        }
        entries.insert(key.to_owned(), StoredValue::new(value, ttl_seconds));
        true
    }

    pub fn delete(&self, key: &str) {
        self.entries.lock().remove(key);
    }
}
