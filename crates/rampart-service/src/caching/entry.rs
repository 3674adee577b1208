use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Current wall clock as unix milliseconds.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// The metadata sidecar stored next to a cached body.
///
/// Serialised as JSON; every instance in a cluster reads and writes this
/// one encoding. `expires_at` is written once at admission and never
/// mutated afterwards.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetaRecord {
    /// Absolute expiry instant, unix milliseconds.
    pub expires_at: u64,
    /// Original `Content-Type`, parameters included.
    pub content_type: String,
    /// Origin `Server` header.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
    /// Original `Content-Encoding`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_encoding: Option<String>,
    /// Original `ETag`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    /// The canonical URL that produced this entry. Advisory.
    pub url: String,
}

impl MetaRecord {
    /// Decodes a meta value fetched from the cluster.
    ///
    /// A record another instance wrote with an incompatible encoding is
    /// treated like an absent key.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        serde_json::from_slice(bytes).ok()
    }

    /// Encodes this record for the cluster.
    pub fn encode(&self) -> Vec<u8> {
        // a struct of scalars cannot fail to serialise
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// Whether the entry is still fresh at `now` (unix millis).
    pub fn is_fresh(&self, now: u64) -> bool {
        self.expires_at > now
    }

    /// Remaining freshness in whole seconds, rounded up.
    pub fn remaining_secs(&self, now: u64) -> u64 {
        self.expires_at.saturating_sub(now).div_ceil(1000)
    }
}

/// What the handler decided to do with a request, derived from one
/// snapshot of the key triple.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Decision {
    /// Usable entry, still fresh: synthesise from cache.
    Hit,
    /// Usable entry, expired, refresh lock held elsewhere: synthesise the
    /// stale representation.
    Stale,
    /// Usable entry, expired, nobody refreshing: acquire the lock and
    /// refresh from the origin.
    Updating,
    /// No usable entry: forward to the origin.
    Miss,
}

impl Decision {
    /// Value of the `X-Rampart` response header.
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Hit => "hit",
            Decision::Stale => "stale",
            Decision::Updating => "updating",
            Decision::Miss => "miss",
        }
    }
}

/// One parallel fetch of the key triple.
///
/// The decision is made from this snapshot alone and is not re-validated
/// afterwards; two instances may race into [`Decision::Updating`], which
/// reduces the dogpile without eliminating it.
#[derive(Clone, Debug, Default)]
pub struct EntrySnapshot {
    pub data: Option<Vec<u8>>,
    pub meta: Option<MetaRecord>,
    pub lock_held: bool,
}

impl EntrySnapshot {
    pub fn classify(&self, now: u64) -> Decision {
        match (&self.data, &self.meta) {
            (Some(_), Some(meta)) if meta.is_fresh(now) => Decision::Hit,
            (Some(_), Some(_)) if self.lock_held => Decision::Stale,
            (Some(_), Some(_)) => Decision::Updating,
            _ => Decision::Miss,
        }
    }

    /// Consumes the snapshot into its usable entry, if data and meta are
    /// both present.
    pub fn into_entry(self) -> Option<(Vec<u8>, MetaRecord)> {
        match (self.data, self.meta) {
            (Some(data), Some(meta)) => Some((data, meta)),
            _ => None,
        }
    }
}
