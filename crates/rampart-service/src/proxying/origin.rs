//! The HTTP client side of the proxy.

use std::net::IpAddr;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{redirect, Body, Client, Method, Response};
use url::Url;

/// Errors reaching or talking to the origin. All of them surface to the
/// client as a 502.
#[derive(Debug, thiserror::Error)]
pub enum OriginError {
    #[error("origin request timed out")]
    Timeout,
    #[error(transparent)]
    Request(reqwest::Error),
}

impl From<reqwest::Error> for OriginError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            OriginError::Timeout
        } else {
            OriginError::Request(err)
        }
    }
}

/// Request headers that must not be forwarded hop to hop.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    // recomputed for the outgoing request
    "host",
    "content-length",
    "expect",
];

/// Forwards rewritten requests to the one configured origin.
///
/// Redirects are passed through untouched and the whole request, headers
/// and body, shares one timeout. `Host` is derived from the canonical URL
/// by the client; the peer address is appended to `X-Forwarded-For`.
#[derive(Debug)]
pub struct OriginClient {
    client: Client,
}

impl OriginClient {
    pub fn new(timeout: Duration) -> Result<Self, OriginError> {
        let client = Client::builder()
            .redirect(redirect::Policy::none())
            .timeout(timeout)
            .build()?;
        Ok(Self { client })
    }

    pub async fn fetch(
        &self,
        method: Method,
        url: Url,
        headers: &HeaderMap,
        client_addr: IpAddr,
        body: Option<Body>,
    ) -> Result<Response, OriginError> {
        let mut outgoing = HeaderMap::with_capacity(headers.len() + 1);
        for (name, value) in headers {
            if !is_hop_by_hop(name) {
                outgoing.append(name.clone(), value.clone());
            }
        }

        let forwarded_for = match headers
            .get("x-forwarded-for")
            .and_then(|value| value.to_str().ok())
        {
            Some(existing) => format!("{existing}, {client_addr}"),
            None => client_addr.to_string(),
        };
        if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
            outgoing.insert("x-forwarded-for", value);
        }

        let mut request = self.client.request(method, url).headers(outgoing);
        if let Some(body) = body {
            request = request.body(body);
        }
        Ok(request.send().await?)
    }
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(&name.as_str())
}
