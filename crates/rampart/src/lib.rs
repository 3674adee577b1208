//! Rampart.
//!
//! Rampart is a horizontally scalable caching reverse proxy. It sits in
//! front of an origin HTTP service and absorbs bursts of duplicated GET
//! traffic by serving cached representations out of a shared memcached
//! cluster. Instances are stateless and cooperate through that cluster:
//! under a traffic spike for one URL a single instance refreshes the
//! entry from the origin while the others serve the previous
//! representation, fresh or stale.

#![warn(missing_docs, missing_debug_implementations, clippy::all)]

pub mod cli;
pub mod endpoints;
pub mod logging;
pub mod server;
