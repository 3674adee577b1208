//! A tower layer counting requests and timing responses.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use axum::http::{Response, StatusCode};
use tower_layer::Layer;
use tower_service::Service as TowerService;

use rampart_service::metrics::ProxyMetrics;

#[derive(Clone)]
pub struct RequestStatsLayer {
    metrics: Arc<ProxyMetrics>,
}

impl RequestStatsLayer {
    pub fn new(metrics: Arc<ProxyMetrics>) -> Self {
        Self { metrics }
    }
}

#[derive(Clone)]
pub struct RequestStatsService<S> {
    service: S,
    metrics: Arc<ProxyMetrics>,
}

pub struct RequestStatsFuture<F> {
    start: Instant,
    future: F,
}

impl<F, B, E> Future for RequestStatsFuture<F>
where
    F: Future<Output = Result<Response<B>, E>>,
{
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let start = self.start;
        // https://doc.rust-lang.org/std/pin/index.html#pinning-is-structural-for-field
        let future = unsafe { self.map_unchecked_mut(|s| &mut s.future) };
        let poll = future.poll(cx);
        if let Poll::Ready(ref res) = poll {
            let status = res
                .as_ref()
                .map(|r| r.status())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            tracing::trace!(
                status = %status,
                elapsed = ?start.elapsed(),
                "request finished",
            );
        }
        poll
    }
}

impl<S> Layer<S> for RequestStatsLayer {
    type Service = RequestStatsService<S>;

    fn layer(&self, service: S) -> Self::Service {
        Self::Service {
            service,
            metrics: Arc::clone(&self.metrics),
        }
    }
}

impl<S, Request, B> TowerService<Request> for RequestStatsService<S>
where
    S: TowerService<Request, Response = Response<B>>,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = RequestStatsFuture<S::Future>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.service.poll_ready(cx)
    }

    fn call(&mut self, request: Request) -> Self::Future {
        self.metrics.record_request();
        Self::Future {
            start: Instant::now(),
            future: self.service.call(request),
        }
    }
}
