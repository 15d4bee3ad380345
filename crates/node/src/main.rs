use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use postrelay_events::{Connector, InMemoryBroker};
use postrelay_infra::blob::{BlobStore, FsBlobStore, InMemoryBlobStore};
use postrelay_infra::broker::RedisStreamsConnector;
use postrelay_infra::cache::{CacheStore, InMemoryCache, RedisCache};
use postrelay_infra::read_model::{
    InMemoryMediaStore, InMemorySearchStore, MediaStore, PostgresMediaStore, PostgresSearchStore,
    SearchStore,
};
use postrelay_infra::{Endpoint, RelayConfig};
use postrelay_node::{start, NodeStores};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    postrelay_observability::init();

    let config = RelayConfig::from_env().context("invalid configuration")?;

    let cache: Arc<dyn CacheStore> = match &config.cache {
        Endpoint::Memory => {
            warn!("POSTRELAY_CACHE_URL not set; using in-process cache");
            Arc::new(InMemoryCache::new())
        }
        Endpoint::Redis(url) => Arc::new(RedisCache::new(url).context("invalid cache url")?),
    };

    let search: Arc<dyn SearchStore> = match &config.database_url {
        Some(url) => Arc::new(
            PostgresSearchStore::connect(url, tokio::runtime::Handle::current())
                .await
                .context("failed to open search database")?,
        ),
        None => {
            warn!("POSTRELAY_DATABASE_URL not set; search index is in-memory");
            Arc::new(InMemorySearchStore::new())
        }
    };

    let media: Arc<dyn MediaStore> = match &config.database_url {
        Some(url) => Arc::new(
            PostgresMediaStore::connect(url, tokio::runtime::Handle::current())
                .await
                .context("failed to open media database")?,
        ),
        None => {
            if config.service.hosts_media() {
                warn!("POSTRELAY_DATABASE_URL not set; media cleanup only sees this process's assets");
            }
            Arc::new(InMemoryMediaStore::new())
        }
    };

    let blobs: Arc<dyn BlobStore> = match &config.blob_dir {
        Some(dir) => Arc::new(FsBlobStore::open(dir.clone()).context("failed to open blob directory")?),
        None => {
            if config.service.hosts_media() {
                warn!("POSTRELAY_BLOB_DIR not set; blobs are process-local");
            }
            Arc::new(InMemoryBlobStore::new())
        }
    };

    let stores = NodeStores {
        cache,
        search,
        media,
        blobs,
    };

    match config.broker.clone() {
        Endpoint::Memory => {
            warn!("POSTRELAY_BROKER_URL not set; using in-process broker");
            serve(config, InMemoryBroker::new(), stores).await
        }
        Endpoint::Redis(url) => {
            let connector = RedisStreamsConnector::new(url, config.consumer_name.clone())
                .context("invalid broker url")?;
            serve(config, connector, stores).await
        }
    }
}

async fn serve<C: Connector>(config: RelayConfig, connector: C, stores: NodeStores) -> anyhow::Result<()> {
    let node = tokio::task::spawn_blocking(move || start(&config, connector, stores))
        .await
        .context("startup task panicked")??;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown requested");

    tokio::task::spawn_blocking(move || node.shutdown())
        .await
        .context("shutdown task panicked")?;
    Ok(())
}
