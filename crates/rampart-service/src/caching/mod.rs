//! The shared cache layer.
//!
//! All durable state of rampart lives in an external cache cluster; proxy
//! instances own nothing but counters and a canonicalisation memo. Per
//! cache entry the cluster holds three independently evictable keys:
//!
//! - `rampart-<fingerprint>-data`: the exact origin response body,
//! - `rampart-<fingerprint>-meta`: the [`MetaRecord`] sidecar,
//! - `rampart-<fingerprint>-lock`: the advisory refresh lock.
//!
//! An entry is usable iff data and meta are both present; the lock exists
//! independently. Writers go data → meta → delete-lock, readers fetch all
//! three concurrently and must tolerate any subset being absent: the
//! cluster is best-effort and strictly advisory, so no error from this
//! module ever reaches a client.

use std::fmt;

mod cluster;
mod entry;
mod memcached;
mod memory;

pub use cluster::{CacheCluster, ClusterError};
pub use entry::{Decision, EntrySnapshot, MetaRecord, now_millis};
pub use memcached::MemcachedCluster;
pub use memory::MemoryCache;

/// The key triple of one cache entry.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CacheKeys {
    pub data: String,
    pub meta: String,
    pub lock: String,
}

impl CacheKeys {
    /// Derives the wire keys for a fingerprint.
    pub fn for_fingerprint(fingerprint: u64) -> Self {
        Self {
            data: format!("rampart-{fingerprint}-data"),
            meta: format!("rampart-{fingerprint}-meta"),
            lock: format!("rampart-{fingerprint}-lock"),
        }
    }
}

impl fmt::Display for CacheKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // all three share the prefix; print the stem
        let stem = self.data.trim_end_matches("-data");
        write!(f, "{stem}")
    }
}
