//! Core services of the rampart caching reverse proxy.
//!
//! Rampart absorbs bursts of duplicated GET traffic by serving cached
//! representations out of a shared memcached cluster. Several stateless
//! proxy instances cooperate through that cluster: under a spike for one
//! URL a single instance refreshes the entry from the origin while the
//! others serve the previous representation, fresh or stale.
//!
//! This crate contains everything below the HTTP surface: URL
//! canonicalisation, cache policy, the cluster client, the proxying and
//! admission services, and the metrics registry. The `rampart` binary
//! wires these into an axum application.

pub mod cache_control;
pub mod caching;
pub mod canonical;
pub mod config;
pub mod media_type;
pub mod metrics;
pub mod proxying;
pub mod utils;
