use crate::config::MemcachedConfig;

use super::memcached::MemcachedCluster;
use super::memory::MemoryCache;

/// Errors talking to the cache cluster.
///
/// These never propagate to a client response: the lookup path treats
/// them as absent keys, the write path logs and counts them.
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("timeout talking to cache node")]
    Timeout,
    #[error("unexpected cache response: {0}")]
    Protocol(String),
    #[error("no cache nodes configured")]
    NoNodes,
}

#[derive(Debug)]
enum Backend {
    Memcached(MemcachedCluster),
    Memory(MemoryCache),
}

/// The shared cache a proxy instance talks to.
///
/// Production deployments use the [`Memcached`](Backend::Memcached)
/// backend; the in-memory variant serves tests and single-instance
/// setups. Values are opaque bytes, `ttl_seconds` of 0 means "cache
/// default / indefinite".
#[derive(Debug)]
pub struct CacheCluster {
    backend: Backend,
}

impl CacheCluster {
    /// Creates a cluster client for a list of memcached `host:port` nodes.
    pub fn memcached(nodes: &[String], config: MemcachedConfig) -> Result<Self, ClusterError> {
        Ok(Self {
            backend: Backend::Memcached(MemcachedCluster::new(nodes, config)?),
        })
    }

    /// Creates an in-process cache.
    pub fn in_memory() -> Self {
        Self {
            backend: Backend::Memory(MemoryCache::default()),
        }
    }

    /// Best-effort fetch of one key.
    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, ClusterError> {
        match &self.backend {
            Backend::Memcached(cluster) => cluster.get(key).await,
            Backend::Memory(cache) => Ok(cache.get(key)),
        }
    }

    /// Stores a value unconditionally.
    pub async fn set(&self, key: &str, value: &[u8], ttl_seconds: u32) -> Result<(), ClusterError> {
        match &self.backend {
            Backend::Memcached(cluster) => cluster.set(key, value, ttl_seconds).await.map(|_| ()),
            Backend::Memory(cache) => {
                cache.set(key, value, ttl_seconds);
                Ok(())
            }
        }
    }

    /// Stores a value only if the key does not exist yet.
    ///
    /// Returns whether this caller won the write. The dogpile lock is
    /// acquired through this so concurrent updaters resolve at the
    /// cluster, not per instance.
    pub async fn add(&self, key: &str, value: &[u8], ttl_seconds: u32) -> Result<bool, ClusterError> {
        match &self.backend {
            Backend::Memcached(cluster) => cluster.add(key, value, ttl_seconds).await,
            Backend::Memory(cache) => Ok(cache.add(key, value, ttl_seconds)),
        }
    }

    /// Removes a key; removing an absent key is not an error.
    pub async fn delete(&self, key: &str) -> Result<(), ClusterError> {
        match &self.backend {
            Backend::Memcached(cluster) => cluster.delete(key).await,
            Backend::Memory(cache) => {
                cache.delete(key);
                Ok(())
            }
        }
    }
}
