//! The request handler: canonicalise, look up, classify, then serve from
//! cache or forward to the origin.

use std::net::SocketAddr;

use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::header::HeaderName;
use axum::http::{header, Method, StatusCode};
use axum::response::Response;
use chrono::Utc;

use rampart_service::caching::{now_millis, CacheKeys, Decision, MetaRecord};
use rampart_service::proxying::{
    wrap_body_stream, AdmissionContext, ForwardRequest, ProxyService,
};

use super::ResponseError;

/// Tagged onto every response: `hit`, `stale`, `updating` or `miss`.
const X_RAMPART: &str = "x-rampart";

/// Serves one inbound request.
///
/// Only GET interacts with the cache; every other method is forwarded
/// untouched and never admitted. The classification is made from one
/// concurrent snapshot of the data/meta/lock keys and is not
/// re-validated afterwards.
pub async fn handle_request(
    State(service): State<ProxyService>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request,
) -> Result<Response, ResponseError> {
    let (parts, body) = request.into_parts();
    let target = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let canonical = service.canonicalize(target)?;

    if parts.method != Method::GET {
        // cache bypass: stream the request through, no admission
        service.metrics().record_decision(Decision::Miss);
        let forward = ForwardRequest {
            method: parts.method,
            canonical,
            headers: parts.headers,
            client_addr: peer.ip(),
            body: Some(wrap_body_stream(body.into_data_stream())),
            admission: None,
        };
        return proxied_response(&service, Decision::Miss, forward).await;
    }

    let keys = CacheKeys::for_fingerprint(canonical.fingerprint);
    let snapshot = service.lookup(&keys).await;
    let now = now_millis();
    let decision = snapshot.classify(now);
    service.metrics().record_decision(decision);
    tracing::debug!(url = %canonical.target, entry = %keys, decision = decision.as_str());

    if matches!(decision, Decision::Hit | Decision::Stale) {
        if let Some((data, meta)) = snapshot.into_entry() {
            return Ok(cached_response(decision, data, &meta, now)?);
        }
    }

    let lock_acquired = match decision {
        Decision::Updating => service.acquire_lock(&keys).await,
        _ => false,
    };
    let forwarded_as = match decision {
        Decision::Updating => Decision::Updating,
        _ => Decision::Miss,
    };

    let forward = ForwardRequest {
        method: parts.method,
        admission: Some(AdmissionContext {
            keys,
            canonical_url: canonical.url.to_string(),
            lock_acquired,
        }),
        canonical,
        headers: parts.headers,
        client_addr: peer.ip(),
        body: None,
    };
    proxied_response(&service, forwarded_as, forward).await
}

/// Forwards to the origin and relays status, headers and the streamed
/// body back to the client.
async fn proxied_response(
    service: &ProxyService,
    decision: Decision,
    forward: ForwardRequest,
) -> Result<Response, ResponseError> {
    let proxied = service.forward(forward).await?;

    let mut builder = Response::builder().status(proxied.status);
    for (name, value) in proxied.headers.iter() {
        if !is_hop_by_hop(name) {
            builder = builder.header(name, value);
        }
    }
    let response = builder
        .header(X_RAMPART, decision.as_str())
        .header(header::CONNECTION, "keep-alive")
        .body(Body::from_stream(proxied.body))?;
    Ok(response)
}

/// Synthesises a 200 from a usable cache entry.
fn cached_response(
    decision: Decision,
    data: Vec<u8>,
    meta: &MetaRecord,
    now: u64,
) -> Result<Response, axum::http::Error> {
    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::DATE, http_date())
        .header(header::CONNECTION, "keep-alive")
        .header(header::CONTENT_TYPE, meta.content_type.as_str())
        .header(header::CONTENT_LENGTH, data.len())
        .header(X_RAMPART, decision.as_str());

    if meta.is_fresh(now) {
        builder = builder.header(
            header::CACHE_CONTROL,
            format!("max-age={}", meta.remaining_secs(now)),
        );
    }
    if let Some(server) = &meta.server {
        builder = builder.header(header::SERVER, server.as_str());
    }
    if let Some(encoding) = &meta.content_encoding {
        builder = builder.header(header::CONTENT_ENCODING, encoding.as_str());
    }
    if let Some(etag) = &meta.etag {
        builder = builder.header(header::ETAG, etag.as_str());
    }

    builder.body(Body::from(data))
}

/// Response headers owned by the connection, not the representation.
fn is_hop_by_hop(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}

fn http_date() -> String {
    Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}
