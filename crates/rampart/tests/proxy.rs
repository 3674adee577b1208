//! End-to-end scenarios against a hit-counting test origin and the
//! in-memory cache backend.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{self, OriginalUri};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{middleware, Router};

use rampart::endpoints;
use rampart_service::caching::{now_millis, CacheCluster, CacheKeys, MetaRecord};
use rampart_service::config::Config;
use rampart_service::proxying::{ProxyService, MAX_CACHEABLE_BODY_BYTES};

/// A test origin bound to a random port, counting requests per URI.
struct Origin {
    socket: SocketAddr,
    hits: Arc<Mutex<BTreeMap<String, usize>>>,
    handle: tokio::task::JoinHandle<()>,
}

impl Origin {
    async fn start() -> Self {
        let router = Router::new()
            .route(
                "/hello",
                get(|| async {
                    (
                        [
                            ("content-type", "text/plain"),
                            ("cache-control", "max-age=5"),
                            ("server", "test-origin"),
                        ],
                        "hello",
                    )
                }),
            )
            .route(
                "/fresh",
                get(|| async {
                    (
                        [
                            ("content-type", "text/plain"),
                            ("cache-control", "max-age=60"),
                        ],
                        "fresh body",
                    )
                }),
            )
            .route(
                "/image",
                get(|| async {
                    (
                        [
                            ("content-type", "image/png"),
                            ("cache-control", "max-age=60"),
                        ],
                        "\u{89}PNG",
                    )
                }),
            )
            .route(
                "/huge",
                get(|| async {
                    (
                        [
                            ("content-type", "text/plain"),
                            ("cache-control", "max-age=60"),
                        ],
                        "x".repeat(MAX_CACHEABLE_BODY_BYTES),
                    )
                }),
            )
            .route(
                "/uncacheable",
                get(|| async { ([("content-type", "text/plain")], "no cache-control") }),
            )
            .route("/echo", post(|body: String| async move { body }))
            .route(
                "/forwarded",
                get(|headers: axum::http::HeaderMap| async move {
                    let forwarded = headers
                        .get("x-forwarded-for")
                        .and_then(|value| value.to_str().ok())
                        .unwrap_or("")
                        .to_owned();
                    ([("content-type", "text/plain")], forwarded)
                }),
            );

        let hits: Arc<Mutex<BTreeMap<String, usize>>> = Arc::default();
        let hitcounter = {
            let hits = hits.clone();
            move |OriginalUri(uri): OriginalUri, req: extract::Request, next: middleware::Next| {
                let hits = hits.clone();
                async move {
                    *hits.lock().unwrap().entry(uri.path().to_owned()).or_default() += 1;
                    next.run(req).await
                }
            }
        };
        let router = router.layer(middleware::from_fn(hitcounter));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let socket = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        Self {
            socket,
            hits,
            handle,
        }
    }

    fn hits(&self, path: &str) -> usize {
        *self.hits.lock().unwrap().get(path).unwrap_or(&0)
    }
}

impl Drop for Origin {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// One proxy instance over the in-memory backend, plus direct access to
/// its service for seeding and inspecting cache state.
struct Proxy {
    service: ProxyService,
    socket: SocketAddr,
    handle: tokio::task::JoinHandle<()>,
}

impl Proxy {
    async fn start(upstream: String) -> Self {
        let config = Config {
            upstream: Some(upstream),
            ..Config::default()
        };
        let service = ProxyService::create(&config, CacheCluster::in_memory()).unwrap();

        let app = endpoints::create_app(service.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let socket = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            .unwrap();
        });

        Self {
            service,
            socket,
            handle,
        }
    }

    async fn start_with_origin(origin: &Origin) -> Self {
        Self::start(origin.socket.to_string()).await
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.socket)
    }

    fn keys(&self, target: &str) -> CacheKeys {
        let fingerprint = self.service.canonicalize(target).unwrap().fingerprint;
        CacheKeys::for_fingerprint(fingerprint)
    }

    fn cluster(&self) -> &CacheCluster {
        self.service.cluster()
    }

    /// Seeds a usable entry for `target` expiring at `expires_at`.
    async fn seed_entry(&self, target: &str, body: &[u8], expires_at: u64, lock: bool) -> CacheKeys {
        let keys = self.keys(target);
        let meta = MetaRecord {
            expires_at,
            content_type: "text/plain".into(),
            server: None,
            content_encoding: None,
            etag: None,
            url: self.service.canonicalize(target).unwrap().url.to_string(),
        };
        self.cluster().set(&keys.data, body, 0).await.unwrap();
        self.cluster().set(&keys.meta, &meta.encode(), 0).await.unwrap();
        if lock {
            self.cluster().set(&keys.lock, b"1", 0).await.unwrap();
        }
        keys
    }

    /// Waits for the detached admitter to materialise `key`.
    async fn wait_for_key(&self, key: &str) -> Vec<u8> {
        for _ in 0..400 {
            if let Ok(Some(value)) = self.cluster().get(key).await {
                return value;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("key {key} never appeared");
    }

    async fn wait_for_absence(&self, key: &str) {
        for _ in 0..400 {
            if self.cluster().get(key).await.unwrap().is_none() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("key {key} never disappeared");
    }
}

impl Drop for Proxy {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[tokio::test]
async fn test_cold_miss_admits_entry() {
    let origin = Origin::start().await;
    let proxy = Proxy::start_with_origin(&origin).await;

    let before = now_millis();
    let response = reqwest::get(proxy.url("/hello")).await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.headers()["x-rampart"], "miss");
    assert_eq!(response.text().await.unwrap(), "hello");
    assert_eq!(origin.hits("/hello"), 1);

    let keys = proxy.keys("/hello");
    assert_eq!(proxy.wait_for_key(&keys.data).await, b"hello");
    let meta = MetaRecord::decode(&proxy.wait_for_key(&keys.meta).await).unwrap();
    assert_eq!(meta.content_type, "text/plain");
    assert_eq!(meta.server.as_deref(), Some("test-origin"));
    assert!(meta.expires_at >= before + 5_000);
    assert!(meta.expires_at <= now_millis() + 5_000);
    proxy.wait_for_absence(&keys.lock).await;
}

#[tokio::test]
async fn test_fresh_hit_does_not_contact_origin() {
    let origin = Origin::start().await;
    let proxy = Proxy::start_with_origin(&origin).await;

    reqwest::get(proxy.url("/hello")).await.unwrap();
    let keys = proxy.keys("/hello");
    proxy.wait_for_key(&keys.meta).await;

    let response = reqwest::get(proxy.url("/hello")).await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.headers()["x-rampart"], "hit");
    assert_eq!(response.headers()["content-type"], "text/plain");
    let max_age: u64 = response.headers()["cache-control"]
        .to_str()
        .unwrap()
        .strip_prefix("max-age=")
        .unwrap()
        .parse()
        .unwrap();
    assert!((1..=5).contains(&max_age));
    assert_eq!(response.text().await.unwrap(), "hello");

    assert_eq!(origin.hits("/hello"), 1);
    assert_eq!(proxy.service.metrics().snapshot().hits, 1);
}

#[tokio::test]
async fn test_fresh_entry_is_hit_even_under_lock() {
    let origin = Origin::start().await;
    let proxy = Proxy::start_with_origin(&origin).await;
    proxy
        .seed_entry("/locked", b"cached body", now_millis() + 60_000, true)
        .await;

    let response = reqwest::get(proxy.url("/locked")).await.unwrap();
    assert_eq!(response.headers()["x-rampart"], "hit");
    assert_eq!(response.text().await.unwrap(), "cached body");
    assert_eq!(origin.hits("/locked"), 0);
}

#[tokio::test]
async fn test_stale_served_under_lock_without_origin_contact() {
    let origin = Origin::start().await;
    let proxy = Proxy::start_with_origin(&origin).await;
    proxy
        .seed_entry("/stale", b"yesterday's news", now_millis() - 1_000, true)
        .await;

    let response = reqwest::get(proxy.url("/stale")).await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.headers()["x-rampart"], "stale");
    assert!(response.headers().get("cache-control").is_none());
    assert_eq!(response.text().await.unwrap(), "yesterday's news");

    assert_eq!(origin.hits("/stale"), 0);
    assert_eq!(proxy.service.metrics().snapshot().stales, 1);
}

#[tokio::test]
async fn test_expired_entry_without_lock_updates_from_origin() {
    let origin = Origin::start().await;
    let proxy = Proxy::start_with_origin(&origin).await;
    let keys = proxy
        .seed_entry("/fresh", b"old body", now_millis() - 1_000, false)
        .await;

    let response = reqwest::get(proxy.url("/fresh")).await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.headers()["x-rampart"], "updating");
    assert_eq!(response.text().await.unwrap(), "fresh body");
    assert_eq!(origin.hits("/fresh"), 1);

    // the refresh replaced the entry and cleared the lock it wrote
    for _ in 0..400 {
        if proxy.cluster().get(&keys.data).await.unwrap().as_deref() == Some(b"fresh body") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(
        proxy.cluster().get(&keys.data).await.unwrap().as_deref(),
        Some(&b"fresh body"[..])
    );
    proxy.wait_for_absence(&keys.lock).await;
    assert_eq!(proxy.service.metrics().snapshot().updatings, 1);
}

#[tokio::test]
async fn test_uncacheable_media_type_passes_through_unadmitted() {
    let origin = Origin::start().await;
    let proxy = Proxy::start_with_origin(&origin).await;

    let response = reqwest::get(proxy.url("/image")).await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.headers()["x-rampart"], "miss");

    let keys = proxy.keys("/image");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(proxy.cluster().get(&keys.data).await.unwrap().is_none());
    assert_eq!(proxy.service.metrics().snapshot().rejections.media_type, 1);
}

#[tokio::test]
async fn test_missing_cache_control_is_not_admitted() {
    let origin = Origin::start().await;
    let proxy = Proxy::start_with_origin(&origin).await;

    let response = reqwest::get(proxy.url("/uncacheable")).await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.headers()["x-rampart"], "miss");

    tokio::time::sleep(Duration::from_millis(50)).await;
    let keys = proxy.keys("/uncacheable");
    assert!(proxy.cluster().get(&keys.data).await.unwrap().is_none());
    assert_eq!(proxy.service.metrics().snapshot().rejections.zero_ttl, 1);
}

#[tokio::test]
async fn test_oversize_body_passes_through_unadmitted() {
    let origin = Origin::start().await;
    let proxy = Proxy::start_with_origin(&origin).await;

    let response = reqwest::get(proxy.url("/huge")).await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(
        response.bytes().await.unwrap().len(),
        MAX_CACHEABLE_BODY_BYTES
    );

    let metrics = proxy.service.metrics();
    for _ in 0..400 {
        if metrics.snapshot().rejections.oversize == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(metrics.snapshot().rejections.oversize, 1);
    let keys = proxy.keys("/huge");
    assert!(proxy.cluster().get(&keys.data).await.unwrap().is_none());
}

#[tokio::test]
async fn test_non_get_bypasses_cache() {
    let origin = Origin::start().await;
    let proxy = Proxy::start_with_origin(&origin).await;

    let client = reqwest::Client::new();
    let response = client
        .post(proxy.url("/echo"))
        .body("ping")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.headers()["x-rampart"], "miss");
    assert_eq!(response.text().await.unwrap(), "ping");

    tokio::time::sleep(Duration::from_millis(50)).await;
    let keys = proxy.keys("/echo");
    assert!(proxy.cluster().get(&keys.data).await.unwrap().is_none());
    assert!(proxy.cluster().get(&keys.meta).await.unwrap().is_none());
}

#[tokio::test]
async fn test_client_address_forwarded() {
    let origin = Origin::start().await;
    let proxy = Proxy::start_with_origin(&origin).await;

    let response = reqwest::get(proxy.url("/forwarded")).await.unwrap();
    assert_eq!(response.text().await.unwrap(), "127.0.0.1");
}

#[tokio::test]
async fn test_equivalent_urls_share_one_entry() {
    let origin = Origin::start().await;
    let proxy = Proxy::start_with_origin(&origin).await;
    proxy
        .seed_entry("/hello?a=1&b=2", b"canonical", now_millis() + 60_000, false)
        .await;

    // reordered query parameters map onto the same fingerprint
    let response = reqwest::get(proxy.url("/hello?b=2&a=1")).await.unwrap();
    assert_eq!(response.headers()["x-rampart"], "hit");
    assert_eq!(response.text().await.unwrap(), "canonical");
    assert_eq!(origin.hits("/hello"), 0);
}

#[tokio::test]
async fn test_unreachable_origin_is_bad_gateway_and_releases_lock() {
    // nothing listens on port 1
    let proxy = Proxy::start("127.0.0.1:1".to_owned()).await;
    let keys = proxy
        .seed_entry("/down", b"old", now_millis() - 1_000, false)
        .await;

    let response = reqwest::get(proxy.url("/down")).await.unwrap();
    assert_eq!(response.status(), 502);

    // the updating lock this request acquired was released again
    proxy.wait_for_absence(&keys.lock).await;
    assert_eq!(proxy.service.metrics().snapshot().origin_errors, 1);
}

#[tokio::test]
async fn test_metrics_listener_serves_counters_on_any_path() {
    let origin = Origin::start().await;
    let proxy = Proxy::start_with_origin(&origin).await;
    reqwest::get(proxy.url("/hello")).await.unwrap();

    let app = endpoints::create_metrics_app(proxy.service.metrics());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let response = reqwest::get(format!("http://{addr}/any/path/at/all"))
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.headers()["content-type"], "application/json");
    let counters: serde_json::Value =
        serde_json::from_str(&response.text().await.unwrap()).unwrap();
    assert_eq!(counters["requests"], 1);
    assert_eq!(counters["misses"], 1);
    assert!(counters["rejections"].is_object());

    let health = reqwest::get(format!("http://{addr}/healthcheck"))
        .await
        .unwrap();
    assert_eq!(health.text().await.unwrap(), "ok");

    handle.abort();
}

#[tokio::test]
async fn test_bad_request_target_is_rejected() {
    let origin = Origin::start().await;
    let proxy = Proxy::start_with_origin(&origin).await;

    // a target that cannot be a hierarchical HTTP URL after rewriting
    let response = reqwest::get(proxy.url("/%ff%fe?\u{1}=x")).await;
    // either the client or the proxy rejects it, but the origin is never hit
    if let Ok(response) = response {
        assert_ne!(response.status(), StatusCode::OK);
    }
    assert_eq!(origin.hits("/"), 0);
}
