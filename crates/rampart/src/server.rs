//! Server wiring: runtime construction, listener binding and the joined
//! proxy / metrics servers.

use std::net::{SocketAddr, TcpListener};

use anyhow::{Context, Result};
use futures::future::{try_join_all, BoxFuture};

use rampart_service::caching::CacheCluster;
use rampart_service::config::Config;
use rampart_service::proxying::ProxyService;

use crate::endpoints;

/// Starts the proxy (and optionally the metrics listener) based on the
/// loaded config, and runs until one of the servers fails.
pub fn run(config: Config) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("rampart-web")
        .enable_all()
        .build()?;

    let cluster = CacheCluster::memcached(&config.memcached, config.memcached_client)
        .context("failed to create cache cluster client")?;
    let service =
        ProxyService::create(&config, cluster).context("failed to create proxy service")?;

    let mut servers: Vec<BoxFuture<'static, std::io::Result<()>>> = vec![];

    let proxy_addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let proxy_socket =
        TcpListener::bind(proxy_addr).with_context(|| format!("failed to bind {proxy_addr}"))?;
    tracing::info!("Starting HTTP proxy on {}", proxy_socket.local_addr()?);

    let app = endpoints::create_app(service.clone());
    servers.push(Box::pin(
        axum_server::from_tcp(proxy_socket)
            .serve(app.into_make_service_with_connect_info::<SocketAddr>()),
    ));

    if let Some(port) = config.metrics_port {
        let metrics_addr = SocketAddr::from(([0, 0, 0, 0], port));
        let metrics_socket = TcpListener::bind(metrics_addr)
            .with_context(|| format!("failed to bind {metrics_addr}"))?;
        tracing::info!("Starting metrics listener on {}", metrics_socket.local_addr()?);

        let app = endpoints::create_metrics_app(service.metrics());
        servers.push(Box::pin(
            axum_server::from_tcp(metrics_socket).serve(app.into_make_service()),
        ));
    }

    runtime.block_on(try_join_all(servers))?;
    Ok(())
}
