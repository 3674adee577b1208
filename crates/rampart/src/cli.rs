//! Exposes the command line application.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use rampart_service::config::Config;

use crate::logging;
use crate::server;

/// Command line interface parser.
#[derive(Debug, Parser)]
#[command(name = "rampart", version, about = "Distributed caching reverse proxy")]
struct Cli {
    /// Origin base URL; `http://` is prepended if the scheme is absent.
    #[arg(long, value_name = "HOST:PORT/PATH")]
    upstream: Option<String>,

    /// Comma separated list of memcached cluster nodes.
    #[arg(long, value_name = "H1:P1,H2:P2", value_delimiter = ',')]
    memcached: Option<Vec<String>>,

    /// Listen port of the reverse proxy.
    #[arg(long, value_name = "PORT")]
    port: Option<u16>,

    /// Start the metrics listener on this port.
    #[arg(long, value_name = "PORT")]
    metrics: Option<u16>,

    /// Strip this query parameter key during canonicalisation. Repeatable.
    #[arg(long = "strip-param", value_name = "KEY")]
    strip_params: Vec<String>,

    /// Path to your configuration file.
    #[arg(long, short = 'c', value_name = "FILE")]
    config: Option<PathBuf>,
}

/// Runs the main application.
pub fn execute() -> Result<()> {
    let cli = Cli::parse();
    let mut config = Config::get(cli.config.as_deref()).context("failed loading config")?;

    if let Some(upstream) = cli.upstream {
        config.upstream = Some(upstream);
    }
    if let Some(nodes) = cli.memcached {
        config.memcached = nodes;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(port) = cli.metrics {
        config.metrics_port = Some(port);
    }
    config.strip_params.extend(cli.strip_params);

    logging::init_logging(&config);
    server::run(config)
}
