//! Observes origin responses and writes admissible ones back to the
//! cluster.
//!
//! The admitter owns the origin body stream: every chunk is teed to the
//! client and, while the response is still admissible, into an
//! accumulation buffer. Because the task is detached, a client that
//! disconnects mid-stream does not abort the refresh: other instances
//! may be serving stale against the lock this one is expected to clear.

use std::io;
use std::sync::Arc;

use bytes::Bytes;
use futures::channel::mpsc;
use futures::{SinkExt, Stream, StreamExt};
use reqwest::header::{HeaderMap, CACHE_CONTROL, CONTENT_ENCODING, CONTENT_TYPE, ETAG, SERVER};
use reqwest::StatusCode;

use crate::cache_control;
use crate::caching::{now_millis, CacheCluster, CacheKeys, MetaRecord};
use crate::media_type;
use crate::metrics::{ProxyMetrics, RejectReason};
use crate::utils::ErrorChain;

/// Admission ceiling: only bodies strictly smaller than this are cached.
pub const MAX_CACHEABLE_BODY_BYTES: usize = 1_048_576;

/// The body stream handed back to the client connection.
pub type ClientBody = mpsc::Receiver<Result<Bytes, io::Error>>;

/// What the admitter needs to know about the request it observes.
#[derive(Debug)]
pub struct AdmissionContext {
    /// Key triple of the entry this response would refresh.
    pub keys: CacheKeys,
    /// Canonical URL, recorded in the meta sidecar.
    pub canonical_url: String,
    /// Whether this request wrote the refresh lock. Only then may an
    /// aborted refresh delete it.
    pub lock_acquired: bool,
}

/// The header-derived part of an admission, fixed before the body runs.
struct AdmitPlan {
    ttl: u32,
    content_type: String,
    server: Option<String>,
    content_encoding: Option<String>,
    etag: Option<String>,
}

/// Applies the header half of the admission predicate.
fn evaluate(status: StatusCode, headers: &HeaderMap) -> Result<AdmitPlan, RejectReason> {
    if status != StatusCode::OK {
        return Err(RejectReason::Status);
    }

    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .ok_or(RejectReason::MediaType)?;
    if !media_type::is_cacheable(content_type) {
        return Err(RejectReason::MediaType);
    }

    let ttl = headers
        .get(CACHE_CONTROL)
        .and_then(|value| value.to_str().ok())
        .map(cache_control::ttl_seconds)
        .unwrap_or(0);
    if ttl == 0 {
        return Err(RejectReason::ZeroTtl);
    }

    let header_string = |name| {
        headers
            .get(name)
            .and_then(|value: &reqwest::header::HeaderValue| value.to_str().ok())
            .map(str::to_owned)
    };

    Ok(AdmitPlan {
        ttl,
        content_type: content_type.to_owned(),
        server: header_string(SERVER),
        content_encoding: header_string(CONTENT_ENCODING),
        etag: header_string(ETAG),
    })
}

/// Spawns the detached tee task for one origin response and returns the
/// client half of the body.
///
/// `admission` is `None` for responses that can never be cached (non-GET
/// bypass); those are streamed through without bookkeeping.
pub(super) fn spawn_tee<S, E>(
    cluster: Arc<CacheCluster>,
    metrics: Arc<ProxyMetrics>,
    status: StatusCode,
    headers: HeaderMap,
    stream: S,
    admission: Option<AdmissionContext>,
) -> ClientBody
where
    S: Stream<Item = Result<Bytes, E>> + Send + Unpin + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    let (tx, rx) = mpsc::channel(8);

    // The header half of the predicate is decided before the body runs;
    // only the size gate can still flip the outcome.
    let verdict = admission.as_ref().map(|_| evaluate(status, &headers));
    if let Some(Err(reason)) = &verdict {
        metrics.record_rejection(*reason);
    }

    tokio::spawn(drive(cluster, metrics, stream, tx, admission, verdict));
    rx
}

async fn drive<S, E>(
    cluster: Arc<CacheCluster>,
    metrics: Arc<ProxyMetrics>,
    mut stream: S,
    mut tx: mpsc::Sender<Result<Bytes, io::Error>>,
    admission: Option<AdmissionContext>,
    verdict: Option<Result<AdmitPlan, RejectReason>>,
) where
    S: Stream<Item = Result<Bytes, E>> + Send + Unpin + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    let mut buffer: Option<Vec<u8>> = match &verdict {
        Some(Ok(_)) => Some(Vec::new()),
        _ => None,
    };
    let mut oversize = false;
    let mut client_gone = false;

    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(chunk) => {
                if let Some(buf) = buffer.as_mut() {
                    if buf.len() + chunk.len() >= MAX_CACHEABLE_BODY_BYTES {
                        buffer = None;
                        oversize = true;
                    } else {
                        buf.extend_from_slice(&chunk);
                    }
                }
                if !client_gone && tx.send(Ok(chunk)).await.is_err() {
                    // keep draining: the refresh must finish regardless
                    client_gone = true;
                }
            }
            Err(err) => {
                tracing::warn!(error = %ErrorChain(&err), "origin response stream failed");
                metrics.record_origin_error();
                if !client_gone {
                    tx.send(Err(io::Error::other(err))).await.ok();
                }
                if let Some(ctx) = &admission {
                    if ctx.lock_acquired {
                        release_lock(&cluster, &metrics, &ctx.keys).await;
                    }
                }
                return;
            }
        }
    }
    drop(tx);

    let Some(ctx) = admission else { return };
    match verdict {
        Some(Ok(plan)) => match buffer {
            Some(body) => write_back(&cluster, &metrics, &ctx, plan, body).await,
            None if oversize => metrics.record_rejection(RejectReason::Oversize),
            None => {}
        },
        // header-level rejections were recorded at spawn; the entry,
        // stale lock included, stays untouched
        _ => {}
    }
}

/// The ordered write-back: data, then meta, then the lock delete. Each
/// step is attempted even if an earlier one failed; mismatch windows are
/// within the documented consistency of the entry model.
async fn write_back(
    cluster: &CacheCluster,
    metrics: &ProxyMetrics,
    ctx: &AdmissionContext,
    plan: AdmitPlan,
    body: Vec<u8>,
) {
    let meta = MetaRecord {
        expires_at: now_millis() + u64::from(plan.ttl) * 1000,
        content_type: plan.content_type,
        server: plan.server,
        content_encoding: plan.content_encoding,
        etag: plan.etag,
        url: ctx.canonical_url.clone(),
    };

    metrics.record_admission();
    tracing::debug!(entry = %ctx.keys, bytes = body.len(), ttl = plan.ttl, "admitting response");

    if let Err(err) = cluster.set(&ctx.keys.data, &body, 0).await {
        tracing::warn!(key = %ctx.keys.data, error = %ErrorChain(&err), "cache write failed");
        metrics.record_cache_error();
    }
    if let Err(err) = cluster.set(&ctx.keys.meta, &meta.encode(), 0).await {
        tracing::warn!(key = %ctx.keys.meta, error = %ErrorChain(&err), "cache write failed");
        metrics.record_cache_error();
    }
    release_lock(cluster, metrics, &ctx.keys).await;
}

async fn release_lock(cluster: &CacheCluster, metrics: &ProxyMetrics, keys: &CacheKeys) {
    if let Err(err) = cluster.delete(&keys.lock).await {
        tracing::warn!(
            key = %keys.lock,
            error = %ErrorChain(&err),
            "failed to release refresh lock",
        );
        metrics.record_cache_error();
    }
}
