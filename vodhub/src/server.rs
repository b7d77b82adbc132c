//! Engine lifecycle
//!
//! Builds the shared services, resolves the initial config, starts the
//! cache janitor and the local proxy, then waits for shutdown. The proxy
//! and every in-flight operation observe one cancellation token.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use vodhub_core::cache::{CacheStore, DiskTier};
use vodhub_core::config::{ConfigResolver, ConfigSource};
use vodhub_core::events::EventBus;
use vodhub_core::fetcher::{Fetcher, FetcherConfig};
use vodhub_core::orchestrator::{ExtractorBackends, HookOptions, NoopUserDataSink, Orchestrator};
use vodhub_core::script::NoScriptRuntime;
use vodhub_core::spider::SpiderManager;
use vodhub_core::Error;
use vodhub_proxy::server::ProxyServer;

use crate::Cli;

pub enum FatalError {
    Config(Error),
    Bind(Error),
}

pub async fn run(cli: Cli) -> Result<(), FatalError> {
    let shutdown = CancellationToken::new();

    let fetcher = Arc::new(
        Fetcher::new(FetcherConfig::default()).map_err(FatalError::Config)?,
    );

    let disk = DiskTier::new(&cli.cache_dir).map_err(FatalError::Config)?;
    let cache = Arc::new(CacheStore::new(Some(disk)));
    cache.spawn_janitor(shutdown.clone());

    let events = EventBus::default();
    let resolver = Arc::new(ConfigResolver::new(
        fetcher.clone(),
        cli.cache_dir.clone(),
        cli.config.clone(),
        cli.index_url.clone(),
        events.clone(),
    ));

    resolver.load(&shutdown).await.map_err(FatalError::Config)?;
    if cli.config.is_some() && resolver.source() == ConfigSource::Bundled {
        // The user pointed at a config and nothing of it survived; refusing
        // to run on the empty bundled default is friendlier than serving
        // zero sites.
        return Err(FatalError::Config(Error::Config(
            "user config could not be loaded".into(),
        )));
    }

    let manager = Arc::new(SpiderManager::new(
        fetcher.clone(),
        Arc::new(NoScriptRuntime),
    ));

    let orchestrator = Orchestrator::new(
        fetcher,
        cache,
        resolver,
        manager,
        events,
        ExtractorBackends::default(),
        HookOptions::default(),
        Arc::new(NoopUserDataSink),
    );

    let proxy = ProxyServer::start(orchestrator.clone(), cli.port, shutdown.clone())
        .await
        .map_err(FatalError::Bind)?;
    info!(base = %proxy.base, sites = orchestrator.config().doc.sites.len(), "vodhub ready");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
        () = shutdown.cancelled() => {}
    }
    shutdown.cancel();
    orchestrator.pipeline().exit_all().await;
    orchestrator.manager().destroy_all().await;
    proxy.join().await;
    info!("vodhub stopped");
    Ok(())
}
