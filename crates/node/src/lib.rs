//! Consumer-side relay node: hosts the search and/or media projections.

use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use postrelay_events::Connector;
use postrelay_events::topic::{POST_CREATED, POST_DELETED};
use postrelay_infra::blob::BlobStore;
use postrelay_infra::broker::BrokerAdapter;
use postrelay_infra::cache::CacheStore;
use postrelay_infra::projections::{MediaCleanupProjection, SearchIndexProjection};
use postrelay_infra::read_model::{MediaStore, SearchStore};
use postrelay_infra::workers::{ConsumerHandle, ConsumerOptions, ConsumerRuntime};
use postrelay_infra::RelayConfig;

pub const SEARCH_CREATED_QUEUE: &str = "search.post.created";
pub const SEARCH_DELETED_QUEUE: &str = "search.post.deleted";
pub const MEDIA_DELETED_QUEUE: &str = "media.post.deleted";

/// Stores the hosted projections write to.
#[derive(Clone)]
pub struct NodeStores {
    pub cache: Arc<dyn CacheStore>,
    pub search: Arc<dyn SearchStore>,
    pub media: Arc<dyn MediaStore>,
    pub blobs: Arc<dyn BlobStore>,
}

/// A running node: the shared broker channel plus its consumers.
pub struct Node<C: Connector> {
    adapter: Arc<BrokerAdapter<C>>,
    consumers: Vec<ConsumerHandle>,
}

impl<C: Connector> Node<C> {
    pub fn adapter(&self) -> Arc<BrokerAdapter<C>> {
        Arc::clone(&self.adapter)
    }

    pub fn consumers(&self) -> &[ConsumerHandle] {
        &self.consumers
    }

    /// Stop every consumer (finishing in-flight deliveries), then close the channel.
    pub fn shutdown(self) {
        for consumer in self.consumers {
            let name = consumer.name();
            consumer.shutdown();
            info!(consumer = name, "consumer joined");
        }
        self.adapter.disconnect();
    }
}

/// Connect to the broker and start the consumers for the configured role.
///
/// Blocks while connecting. Fails when the broker stays unreachable for the
/// configured number of attempts; the process must not start without it.
pub fn start<C: Connector>(config: &RelayConfig, connector: C, stores: NodeStores) -> anyhow::Result<Node<C>> {
    let adapter = Arc::new(BrokerAdapter::new(connector, config.exchange.clone(), config.backoff));
    adapter
        .connect()
        .context("broker unavailable; refusing to start")?;

    let options = ConsumerOptions {
        ack_policy: config.ack_policy,
        ..ConsumerOptions::default()
    };
    let mut consumers = Vec::new();

    if config.service.hosts_search() {
        let projection = Arc::new(SearchIndexProjection::new(
            Arc::clone(&stores.search),
            Arc::clone(&stores.cache),
        ));
        for (name, queue, topic) in [
            ("search.created", SEARCH_CREATED_QUEUE, POST_CREATED),
            ("search.deleted", SEARCH_DELETED_QUEUE, POST_DELETED),
        ] {
            let handle = ConsumerRuntime::spawn(
                name,
                Arc::clone(&adapter),
                queue,
                topic,
                Arc::clone(&projection),
                options,
            )
            .with_context(|| format!("failed to spawn consumer {name}"))?;
            consumers.push(handle);
        }
    }

    if config.service.hosts_media() {
        let handle = ConsumerRuntime::spawn(
            "media.deleted",
            Arc::clone(&adapter),
            MEDIA_DELETED_QUEUE,
            POST_DELETED,
            MediaCleanupProjection::new(Arc::clone(&stores.media), Arc::clone(&stores.blobs)),
            options,
        )
        .context("failed to spawn consumer media.deleted")?;
        consumers.push(handle);
    }

    info!(
        service = config.service.as_str(),
        exchange = %config.exchange,
        consumers = consumers.len(),
        "relay node started"
    );
    Ok(Node { adapter, consumers })
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::thread;
    use std::time::{Duration, Instant};

    use chrono::Utc;
    use postrelay_core::{MediaId, PostId, UserId};
    use postrelay_events::{publish_event, InMemoryBroker, PostCreated, PostDeleted};
    use postrelay_infra::blob::InMemoryBlobStore;
    use postrelay_infra::broker::BrokerPublisher;
    use postrelay_infra::cache::InMemoryCache;
    use postrelay_infra::read_model::{InMemoryMediaStore, InMemorySearchStore};
    use postrelay_infra::blob::{BlobStore, BlobUpload};
    use postrelay_infra::read_model::{MediaAsset, MediaStore};
    use postrelay_infra::workers::{ConsumerState, dead_letter_queue};

    fn config(service: &str) -> RelayConfig {
        config_with(service, "always")
    }

    fn config_with(service: &str, ack_policy: &str) -> RelayConfig {
        let service = service.to_string();
        let ack_policy = ack_policy.to_string();
        RelayConfig::from_lookup(move |k| match k {
            "POSTRELAY_SERVICE" => Some(service.clone()),
            "POSTRELAY_ACK_POLICY" => Some(ack_policy.clone()),
            "POSTRELAY_CONNECT_ATTEMPTS" => Some("2".into()),
            "POSTRELAY_BACKOFF_INITIAL_MS" => Some("1".into()),
            "POSTRELAY_BACKOFF_MAX_MS" => Some("2".into()),
            _ => None,
        })
        .unwrap()
    }

    fn stores(search: Arc<InMemorySearchStore>) -> NodeStores {
        NodeStores {
            cache: Arc::new(InMemoryCache::new()),
            search,
            media: Arc::new(InMemoryMediaStore::new()),
            blobs: Arc::new(InMemoryBlobStore::new()),
        }
    }

    #[test]
    fn refuses_to_start_without_a_broker() {
        let broker = InMemoryBroker::new();
        broker.refuse_connections(true);
        let err = start(&config("all"), broker, stores(Arc::new(InMemorySearchStore::new())))
            .err()
            .unwrap();
        assert!(err.to_string().contains("refusing to start"));
    }

    #[test]
    fn role_selects_consumers() {
        let search = Arc::new(InMemorySearchStore::new());
        let node = start(&config("media"), InMemoryBroker::new(), stores(search)).unwrap();
        assert_eq!(node.consumers().len(), 1);
        node.shutdown();
    }

    #[test]
    fn search_role_indexes_published_posts() {
        let broker = InMemoryBroker::new();
        let search = Arc::new(InMemorySearchStore::new());
        let node = start(&config("search"), broker.clone(), stores(Arc::clone(&search))).unwrap();
        assert_eq!(node.consumers().len(), 2);

        let deadline = Instant::now() + Duration::from_secs(5);
        while node.consumers().iter().any(|c| c.state() != ConsumerState::Subscribed) {
            assert!(Instant::now() < deadline);
            thread::sleep(Duration::from_millis(5));
        }

        let publisher = BrokerPublisher::new(node.adapter());
        publish_event(
            &publisher,
            &PostCreated {
                post_id: PostId::parse("p1").unwrap(),
                user_id: UserId::parse("u1").unwrap(),
                content: "hello node".into(),
                created_at: Utc::now(),
            },
        )
        .unwrap();

        while search.count().unwrap() == 0 {
            assert!(Instant::now() < deadline);
            thread::sleep(Duration::from_millis(5));
        }

        node.shutdown();
        assert_eq!(broker.live_connections(), 0);
    }

    #[test]
    fn exhausted_media_cleanup_is_parked_in_a_dead_letter_queue() {
        let broker = InMemoryBroker::new();
        let media = Arc::new(InMemoryMediaStore::new());
        let blobs = Arc::new(InMemoryBlobStore::new());
        let blob = blobs
            .upload(BlobUpload {
                original_name: "a.png".into(),
                mime_type: "image/png".into(),
                bytes: vec![1],
            })
            .unwrap();
        let media_id = MediaId::parse("m1").unwrap();
        media
            .insert(MediaAsset {
                media_id: media_id.clone(),
                public_id: blob.public_id,
                url: blob.url,
                original_name: "a.png".into(),
                mime_type: "image/png".into(),
                user_id: UserId::parse("u1").unwrap(),
                created_at: Utc::now(),
            })
            .unwrap();
        blobs.set_fail_deletes(true);

        let stores = NodeStores {
            cache: Arc::new(InMemoryCache::new()),
            search: Arc::new(InMemorySearchStore::new()),
            media: media.clone(),
            blobs: blobs.clone(),
        };
        let node = start(&config_with("media", "retry:2"), broker.clone(), stores).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while node.consumers()[0].state() != ConsumerState::Subscribed {
            assert!(Instant::now() < deadline);
            thread::sleep(Duration::from_millis(5));
        }

        let publisher = BrokerPublisher::new(node.adapter());
        publish_event(
            &publisher,
            &PostDeleted {
                post_id: PostId::parse("p1").unwrap(),
                user_id: UserId::parse("u1").unwrap(),
                media_id: Some(media_id.clone()),
            },
        )
        .unwrap();

        while node.consumers()[0].stats().dead_lettered == 0 {
            assert!(Instant::now() < deadline, "message never dead-lettered");
            thread::sleep(Duration::from_millis(5));
        }
        let dlq = dead_letter_queue(MEDIA_DELETED_QUEUE);
        assert_eq!(broker.ready_count(&dlq), 1);
        // The asset survives so the parked message can be replayed later.
        assert!(media.get(&media_id).unwrap().is_some());

        node.shutdown();
    }
}
