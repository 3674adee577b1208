//! URL canonicalisation and fingerprinting.
//!
//! Every inbound request URL is reduced to one canonical form which is
//! used both as the upstream request target and as the input to the cache
//! fingerprint. All instances sharing a cache cluster must agree on this
//! mapping, so the rules here are deliberately boring: resolved dot
//! segments, collapsed duplicate slashes, lowercased scheme and host, no
//! default port, percent-encoding normalised to uppercase hex with
//! unreserved characters decoded, and query parameters stably sorted by
//! key with configured keys stripped.

use std::collections::BTreeSet;
use std::num::NonZeroUsize;

use lru::LruCache;
use parking_lot::Mutex;
use url::Url;
use xxhash_rust::xxh3::xxh3_64;

/// Memoisation capacity of the raw → canonical mapping.
///
/// Purely a per-instance performance aid for repeated traffic;
/// correctness never depends on it.
const MEMO_CAPACITY: usize = 1000;

/// An error canonicalising a request URL. The handler answers 400.
#[derive(Debug, thiserror::Error)]
pub enum CanonicalizeError {
    #[error("invalid url")]
    InvalidUrl(#[from] url::ParseError),
    #[error("unsupported upstream scheme `{0}`")]
    UnsupportedScheme(String),
}

/// The canonical form of one request URL.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CanonicalUrl {
    /// Absolute canonical URL, pointing at the upstream.
    pub url: Url,
    /// Canonical path plus query, the upstream request target and the
    /// fingerprint input.
    pub target: String,
    /// Stable 64-bit hash of `target`, identifying the cache entry.
    pub fingerprint: u64,
}

/// Maps raw request URLs onto [`CanonicalUrl`]s for one configured
/// upstream.
pub struct Canonicalizer {
    base: Url,
    strip_params: BTreeSet<String>,
    memo: Mutex<LruCache<String, CanonicalUrl>>,
}

impl std::fmt::Debug for Canonicalizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Canonicalizer")
            .field("base", &self.base)
            .field("strip_params", &self.strip_params)
            .field("memoised", &self.memo.lock().len())
            .finish()
    }
}

impl Canonicalizer {
    /// Creates a canonicaliser for the given upstream base
    /// (`[scheme://]host[:port][/path]`).
    pub fn new(upstream: &str, strip_params: BTreeSet<String>) -> Result<Self, CanonicalizeError> {
        let raw = if upstream.contains("://") {
            upstream.to_owned()
        } else {
            format!("http://{upstream}")
        };
        let mut base = Url::parse(&raw)?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(CanonicalizeError::UnsupportedScheme(base.scheme().into()));
        }
        base.set_query(None);
        base.set_fragment(None);

        Ok(Self {
            base,
            strip_params,
            memo: Mutex::new(LruCache::new(
                NonZeroUsize::new(MEMO_CAPACITY).expect("capacity is non-zero"),
            )),
        })
    }

    /// The upstream base URL this canonicaliser resolves against.
    pub fn upstream(&self) -> &Url {
        &self.base
    }

    /// Canonicalises an inbound request target (origin-form, e.g.
    /// `/a/b?x=1`) against the upstream base.
    pub fn canonicalize(&self, suffix: &str) -> Result<CanonicalUrl, CanonicalizeError> {
        if let Some(hit) = self.memo.lock().get(suffix) {
            return Ok(hit.clone());
        }

        let canonical = self.compute(suffix)?;
        self.memo
            .lock()
            .put(suffix.to_owned(), canonical.clone());
        Ok(canonical)
    }

    fn compute(&self, suffix: &str) -> Result<CanonicalUrl, CanonicalizeError> {
        let combined = format!("{}{}", self.base, suffix);

        // The serialised base always carries a path, so the first slash
        // after the scheme separator starts the path-and-query part.
        let authority_len = combined
            .find("://")
            .and_then(|i| combined[i + 3..].find('/').map(|j| i + 3 + j))
            .ok_or(CanonicalizeError::InvalidUrl(
                url::ParseError::RelativeUrlWithoutBase,
            ))?;
        let (authority, path_and_query) = combined.split_at(authority_len);

        let (raw_path, raw_query) = match path_and_query.split_once('?') {
            Some((p, q)) => (p, Some(q)),
            None => (path_and_query, None),
        };

        let path = canonical_path(raw_path);
        let query = raw_query.map(|q| self.canonical_query(q));

        let mut rebuilt = format!("{authority}{path}");
        if let Some(query) = query.as_deref().filter(|q| !q.is_empty()) {
            rebuilt.push('?');
            rebuilt.push_str(query);
        }

        // Parsing the rebuilt string lowercases scheme and host and drops
        // the default port.
        let url = Url::parse(&rebuilt)?;
        let mut target = url.path().to_owned();
        if let Some(query) = url.query() {
            target.push('?');
            target.push_str(query);
        }
        let fingerprint = xxh3_64(target.as_bytes());

        Ok(CanonicalUrl {
            url,
            target,
            fingerprint,
        })
    }

    /// Normalises, filters and stably sorts the query string.
    fn canonical_query(&self, raw: &str) -> String {
        let mut pairs: Vec<(String, Option<String>)> = raw
            .split('&')
            .filter(|component| !component.is_empty())
            .map(|component| match component.split_once('=') {
                Some((k, v)) => (normalize_component(k), Some(normalize_component(v))),
                None => (normalize_component(component), None),
            })
            .filter(|(key, _)| !self.strip_params.contains(key))
            .collect();

        // Stable: multi-valued parameters keep their internal order.
        pairs.sort_by(|a, b| a.0.cmp(&b.0));

        let mut out = String::with_capacity(raw.len());
        for (i, (key, value)) in pairs.iter().enumerate() {
            if i > 0 {
                out.push('&');
            }
            out.push_str(key);
            if let Some(value) = value {
                out.push('=');
                out.push_str(value);
            }
        }
        out
    }
}

/// Collapses duplicate slashes, normalises percent-encoding per segment
/// and resolves `.` / `..` segments.
fn canonical_path(raw: &str) -> String {
    let mut segments: Vec<String> = Vec::new();
    for segment in raw.split('/').filter(|s| !s.is_empty()) {
        match normalize_component(segment).as_str() {
            "." => {}
            ".." => {
                segments.pop();
            }
            normalized => segments.push(normalized.to_owned()),
        }
    }

    let mut path = String::with_capacity(raw.len());
    for segment in &segments {
        path.push('/');
        path.push_str(segment);
    }
    if path.is_empty() {
        path.push('/');
    } else if raw.ends_with('/') || raw.ends_with("/.") || raw.ends_with("/..") {
        path.push('/');
    }
    path
}

/// Normalises the percent-encoding of one path segment or query
/// component: unreserved characters are decoded, everything else keeps
/// its encoding with uppercase hex digits.
fn normalize_component(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out: Vec<u8> = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let (Some(hi), Some(lo)) = (hex_value(bytes[i + 1]), hex_value(bytes[i + 2])) {
                let decoded = hi * 16 + lo;
                if is_unreserved(decoded) {
                    out.push(decoded);
                } else {
                    out.extend_from_slice(format!("%{decoded:02X}").as_bytes());
                }
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

fn is_unreserved(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~')
}
