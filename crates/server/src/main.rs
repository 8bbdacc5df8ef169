//! chordcache-mcp server entry point.
//!
//! Opens the cache, starts the periodic eviction timer, and serves the cache
//! tools over stdio. Logging goes to stderr to avoid interfering with the
//! JSON-RPC protocol on stdout.

use anyhow::Result;
use chordcache_core::{AppConfig, CacheDb};
use rmcp::service::serve_server;
use rmcp::transport::io::stdio;
use tracing_subscriber::EnvFilter;

mod handler;
mod tools;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .json()
        .init();

    let config = AppConfig::load()?;
    tracing::info!(db_path = %config.db_path.display(), "Starting chordcache-mcp server on stdio transport");

    let cache = CacheDb::open(config).await?;

    let mut cleanup_events = cache.subscribe_cleanup();
    tokio::spawn(async move {
        while let Ok(report) = cleanup_events.recv().await {
            if report.triggered {
                tracing::info!(
                    documents_removed = report.documents_removed,
                    search_removed = report.search_removed,
                    usage_after = report.usage_after,
                    "cache cleanup event"
                );
            }
        }
    });
    let cleanup_timer = cache.start_cleanup_timer();

    let handler = handler::ChordCacheServer::new(cache.clone());
    let transport = stdio();
    let server = serve_server(handler, transport).await?;

    server.waiting().await?;

    cleanup_timer.abort();
    cache.settle().await;
    tracing::info!("chordcache-mcp server stopped");

    Ok(())
}
