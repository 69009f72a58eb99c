mod cli;
#[cfg(test)]
mod compliance_tests;
mod config;
mod error;
mod events;
mod http_api;
mod overlay;
mod protocol;
mod registry;
mod result_cache;
mod service;
mod stdio_server;
#[cfg(test)]
mod testutil;
mod transport;
mod upstream;

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Everything produced by initialization, ready for either serving surface.
pub struct InitializedGateway {
    pub manager: Arc<service::manager::ServiceManager>,
    pub handler: Arc<protocol::ProtocolHandler>,
    pub upstream: Option<Arc<upstream::UpstreamClient>>,
    pub config: config::Config,
    pub shutdown_notify: Arc<tokio::sync::Notify>,
}

/// Shared initialization: tracing, config, bus, overlay, manager, cache,
/// background service startup, eviction loop, upstream client.
pub async fn initialize(config_path: &std::path::Path) -> Result<InitializedGateway> {
    let config = config::Config::load(config_path)?;

    // Logs go to stderr so the stdio MCP surface stays clean.
    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    info!(
        config_path = %config_path.display(),
        services = config.services.len(),
        custom_tools = config.custom_tools.len(),
        "toolgate starting"
    );

    let bus = Arc::new(events::EventBus::new());
    let registry = registry::ToolRegistry::new();
    let overlay = overlay::CustomToolOverlay::load_from_config(
        &config.custom_tools,
        config.platforms.clone(),
    )?;
    let manager = service::manager::ServiceManager::new(registry, overlay, Arc::clone(&bus));
    manager.load_configs(&config.services);
    // Custom tools are visible before any backend connects.
    manager.refresh();

    let cache = result_cache::ResultCache::with_options(
        std::time::Duration::from_secs(300),
        Some(Arc::clone(&bus)),
    );
    let handler = protocol::ProtocolHandler::new(Arc::clone(&manager), Arc::clone(&cache), &config);

    let shutdown_notify = Arc::new(tokio::sync::Notify::new());

    // Connect all services in the background so the serving surface is
    // available immediately.
    {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move {
            manager.start_all().await;
        });
    }

    // Cache eviction ticker.
    {
        let cache = Arc::clone(&cache);
        let shutdown = Arc::clone(&shutdown_notify);
        tokio::spawn(async move {
            result_cache::run_eviction_loop(cache, shutdown).await;
        });
    }

    // Upstream endpoint bridge.
    let upstream = config.endpoint.clone().map(|endpoint| {
        let client =
            upstream::UpstreamClient::new(endpoint, Arc::clone(&handler), Arc::clone(&bus));
        client.spawn();
        client
    });

    Ok(InitializedGateway {
        manager,
        handler,
        upstream,
        config,
        shutdown_notify,
    })
}

async fn run(gateway: InitializedGateway, http: bool, listen: Option<String>) -> Result<()> {
    let serve_http = http || gateway.config.http.is_some();
    let listen = listen
        .or_else(|| gateway.config.http.as_ref().map(|h| h.listen.clone()))
        .unwrap_or_else(|| config::HttpConfig::default().listen);

    let handler = Arc::clone(&gateway.handler);
    let shutdown = Arc::clone(&gateway.shutdown_notify);

    let surface = tokio::spawn(async move {
        let result = if serve_http {
            http_api::serve(handler, &listen, shutdown).await
        } else {
            stdio_server::serve(handler, shutdown).await
        };
        if let Err(e) = result {
            warn!(error = %e, "serving surface exited with error");
        }
    });

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;

        tokio::select! {
            _ = surface => {}
            _ = sigterm.recv() => info!("received SIGTERM"),
            _ = sigint.recv() => info!("received SIGINT"),
        }
    }

    #[cfg(not(unix))]
    {
        surface.await?;
    }

    info!("shutting down");
    gateway.shutdown_notify.notify_waiters();
    if let Some(upstream) = &gateway.upstream {
        upstream.shutdown();
    }
    gateway.manager.stop_all().await;

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = cli::Cli::parse();
    let gateway = initialize(&cli.config).await?;
    run(gateway, cli.http, cli.listen).await
}
