//! Process-wide request counters.
//!
//! The counters are the only mutable state shared across requests besides
//! the canonicaliser memo. They are monotonically non-decreasing and reset
//! only on process restart; the metrics listener serialises a [`Snapshot`]
//! of them as JSON.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::caching::Decision;

/// Why an origin response was not admitted to the cache.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RejectReason {
    /// Status code was not 200.
    Status,
    /// `Content-Type` missing or not in the cacheable set.
    MediaType,
    /// `Cache-Control` missing or parsed to a zero TTL.
    ZeroTtl,
    /// Body reached the admission size limit.
    Oversize,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::Status => "non-200",
            RejectReason::MediaType => "bad content-type",
            RejectReason::ZeroTtl => "ttl=0",
            RejectReason::Oversize => "oversize",
        }
    }
}

/// The counter registry held by one proxy instance.
#[derive(Debug, Default)]
pub struct ProxyMetrics {
    requests: AtomicU64,
    hits: AtomicU64,
    stales: AtomicU64,
    updatings: AtomicU64,
    misses: AtomicU64,
    admissions: AtomicU64,
    rejected_status: AtomicU64,
    rejected_media_type: AtomicU64,
    rejected_zero_ttl: AtomicU64,
    rejected_oversize: AtomicU64,
    cache_errors: AtomicU64,
    origin_errors: AtomicU64,
}

/// A point-in-time copy of all counters.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct Snapshot {
    pub requests: u64,
    pub hits: u64,
    pub stales: u64,
    pub updatings: u64,
    pub misses: u64,
    pub admissions: u64,
    pub rejections: Rejections,
    pub cache_errors: u64,
    pub origin_errors: u64,
}

/// Admission rejections broken down by reason.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct Rejections {
    pub status: u64,
    pub media_type: u64,
    pub zero_ttl: u64,
    pub oversize: u64,
}

impl ProxyMetrics {
    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decision(&self, decision: Decision) {
        let counter = match decision {
            Decision::Hit => &self.hits,
            Decision::Stale => &self.stales,
            Decision::Updating => &self.updatings,
            Decision::Miss => &self.misses,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_admission(&self) {
        self.admissions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejection(&self, reason: RejectReason) {
        let counter = match reason {
            RejectReason::Status => &self.rejected_status,
            RejectReason::MediaType => &self.rejected_media_type,
            RejectReason::ZeroTtl => &self.rejected_zero_ttl,
            RejectReason::Oversize => &self.rejected_oversize,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_error(&self) {
        self.cache_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_origin_error(&self) {
        self.origin_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Copies all counters for serialisation.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            requests: self.requests.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            stales: self.stales.load(Ordering::Relaxed),
            updatings: self.updatings.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            admissions: self.admissions.load(Ordering::Relaxed),
            rejections: Rejections {
                status: self.rejected_status.load(Ordering::Relaxed),
                media_type: self.rejected_media_type.load(Ordering::Relaxed),
                zero_ttl: self.rejected_zero_ttl.load(Ordering::Relaxed),
                oversize: self.rejected_oversize.load(Ordering::Relaxed),
            },
            cache_errors: self.cache_errors.load(Ordering::Relaxed),
            origin_errors: self.origin_errors.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_counts() {
        let metrics = ProxyMetrics::default();
        metrics.record_request();
        metrics.record_request();
        metrics.record_decision(Decision::Hit);
        metrics.record_decision(Decision::Miss);
        metrics.record_rejection(RejectReason::Oversize);

        let snap = metrics.snapshot();
        assert_eq!(snap.requests, 2);
        assert_eq!(snap.hits, 1);
        assert_eq!(snap.misses, 1);
        assert_eq!(snap.rejections.oversize, 1);
        assert_eq!(snap.rejections.status, 0);
    }

    #[test]
    fn test_snapshot_serialises_flat_counters() {
        let metrics = ProxyMetrics::default();
        metrics.record_admission();
        let json = serde_json::to_value(metrics.snapshot()).unwrap();
        assert_eq!(json["admissions"], 1);
        assert_eq!(json["rejections"]["zero_ttl"], 0);
    }
}
