//! The proxying side of rampart: origin forwarding and response
//! admission, wrapped into the [`ProxyService`] handed to the HTTP
//! layer.

use std::net::IpAddr;
use std::sync::Arc;

use anyhow::Context as _;
use futures::StreamExt as _;
use reqwest::header::HeaderMap;
use reqwest::{Method, StatusCode};

use crate::canonical::{CanonicalUrl, Canonicalizer, CanonicalizeError};
use crate::caching::{CacheCluster, CacheKeys, EntrySnapshot, MetaRecord};
use crate::config::Config;
use crate::metrics::ProxyMetrics;
use crate::utils::ErrorChain;

mod admit;
mod origin;

pub use admit::{AdmissionContext, ClientBody, MAX_CACHEABLE_BODY_BYTES};
pub use origin::{OriginClient, OriginError};

/// Adapts a streaming client request body for origin forwarding, so the
/// HTTP layer does not need to name the origin client's body type.
pub fn wrap_body_stream<S>(stream: S) -> reqwest::Body
where
    S: futures::TryStream + Send + 'static,
    S::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    bytes::Bytes: From<S::Ok>,
{
    reqwest::Body::wrap_stream(stream)
}

/// Everything the HTTP layer needs to serve requests. Cheap to clone.
#[derive(Clone, Debug)]
pub struct ProxyService {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    canonicalizer: Canonicalizer,
    cluster: Arc<CacheCluster>,
    origin: OriginClient,
    metrics: Arc<ProxyMetrics>,
    lock_ttl_seconds: u32,
}

/// One request to forward upstream.
#[derive(Debug)]
pub struct ForwardRequest {
    pub method: Method,
    pub canonical: CanonicalUrl,
    pub headers: HeaderMap,
    pub client_addr: IpAddr,
    pub body: Option<reqwest::Body>,
    /// Present only when the response may be admitted (GET).
    pub admission: Option<AdmissionContext>,
}

/// An origin response on its way back to the client. The body is the
/// client half of the admitter's tee.
#[derive(Debug)]
pub struct ProxiedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: ClientBody,
}

impl ProxyService {
    /// Builds the service from the loaded config and a cluster client.
    pub fn create(config: &Config, cluster: CacheCluster) -> anyhow::Result<Self> {
        let upstream = config
            .upstream
            .as_deref()
            .context("no upstream configured")?;
        let canonicalizer = Canonicalizer::new(upstream, config.strip_params.clone())
            .context("invalid upstream URL")?;
        let origin = OriginClient::new(config.origin_timeout)
            .context("failed to create origin HTTP client")?;

        Ok(Self {
            inner: Arc::new(Inner {
                canonicalizer,
                cluster: Arc::new(cluster),
                origin,
                metrics: Arc::new(ProxyMetrics::default()),
                lock_ttl_seconds: config.lock_ttl.as_secs().try_into().unwrap_or(u32::MAX),
            }),
        })
    }

    pub fn metrics(&self) -> Arc<ProxyMetrics> {
        Arc::clone(&self.inner.metrics)
    }

    /// Direct cluster access, used by the write path and by tests.
    pub fn cluster(&self) -> &CacheCluster {
        &self.inner.cluster
    }

    pub fn canonicalize(&self, target: &str) -> Result<CanonicalUrl, CanonicalizeError> {
        self.inner.canonicalizer.canonicalize(target)
    }

    /// Fetches the key triple concurrently. Lookup errors are advisory:
    /// logged, counted and treated as an absent key.
    pub async fn lookup(&self, keys: &CacheKeys) -> EntrySnapshot {
        let cluster = &self.inner.cluster;
        let (data, meta, lock) = tokio::join!(
            cluster.get(&keys.data),
            cluster.get(&keys.meta),
            cluster.get(&keys.lock),
        );

        EntrySnapshot {
            data: self.lookup_value(data, &keys.data),
            meta: self
                .lookup_value(meta, &keys.meta)
                .as_deref()
                .and_then(MetaRecord::decode),
            lock_held: self.lookup_value(lock, &keys.lock).is_some(),
        }
    }

    fn lookup_value(
        &self,
        result: Result<Option<Vec<u8>>, crate::caching::ClusterError>,
        key: &str,
    ) -> Option<Vec<u8>> {
        match result {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!(
                    key,
                    error = %ErrorChain(&err),
                    "cache lookup failed, treating key as absent",
                );
                self.inner.metrics.record_cache_error();
                None
            }
        }
    }

    /// Best-effort acquisition of the refresh lock.
    ///
    /// Returns whether this instance wrote the lock. Losing the race (or
    /// failing to reach the cluster) does not change the updating
    /// decision (the snapshot is never re-validated), it only means an
    /// aborted refresh must not delete a lock it does not own.
    pub async fn acquire_lock(&self, keys: &CacheKeys) -> bool {
        match self
            .inner
            .cluster
            .add(&keys.lock, b"1", self.inner.lock_ttl_seconds)
            .await
        {
            Ok(acquired) => {
                if !acquired {
                    tracing::debug!(entry = %keys, "lost the refresh lock race");
                }
                acquired
            }
            Err(err) => {
                tracing::warn!(
                    entry = %keys,
                    error = %ErrorChain(&err),
                    "failed to write refresh lock",
                );
                self.inner.metrics.record_cache_error();
                false
            }
        }
    }

    /// Forwards a request to the origin and hands the response body to
    /// the admitter tee.
    ///
    /// On origin failure the caller answers 502; a refresh lock this
    /// request acquired is released so the next requester may retry.
    pub async fn forward(&self, request: ForwardRequest) -> Result<ProxiedResponse, OriginError> {
        let ForwardRequest {
            method,
            canonical,
            headers,
            client_addr,
            body,
            admission,
        } = request;

        let response = match self
            .inner
            .origin
            .fetch(method, canonical.url.clone(), &headers, client_addr, body)
            .await
        {
            Ok(response) => response,
            Err(err) => {
                tracing::warn!(
                    url = %canonical.url,
                    error = %ErrorChain(&err),
                    "origin request failed",
                );
                self.inner.metrics.record_origin_error();
                if let Some(ctx) = &admission {
                    if ctx.lock_acquired {
                        if let Err(cache_err) = self.inner.cluster.delete(&ctx.keys.lock).await {
                            tracing::warn!(
                                key = %ctx.keys.lock,
                                error = %ErrorChain(&cache_err),
                                "failed to release refresh lock",
                            );
                            self.inner.metrics.record_cache_error();
                        }
                    }
                }
                return Err(err);
            }
        };

        let status = response.status();
        let headers = response.headers().clone();
        let body = admit::spawn_tee(
            Arc::clone(&self.inner.cluster),
            self.metrics(),
            status,
            headers.clone(),
            response.bytes_stream().boxed(),
            admission,
        );

        Ok(ProxiedResponse {
            status,
            headers,
            body,
        })
    }
}
