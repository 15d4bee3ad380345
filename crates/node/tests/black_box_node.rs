use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use postrelay_core::{SystemClock, UserId};
use postrelay_events::InMemoryBroker;
use postrelay_infra::blob::{BlobUpload, InMemoryBlobStore};
use postrelay_infra::broker::{BrokerAdapter, BrokerPublisher};
use postrelay_infra::cache::InMemoryCache;
use postrelay_infra::read_model::{InMemoryMediaStore, InMemoryPostRepository, InMemorySearchStore, MediaStore, SearchStore};
use postrelay_infra::services::{CacheTtls, MediaService, PostService, SearchService};
use postrelay_infra::workers::ConsumerState;
use postrelay_infra::RelayConfig;
use postrelay_node::{start, Node, NodeStores};

fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(5));
    }
}

struct Harness {
    broker: InMemoryBroker,
    node: Node<InMemoryBroker>,
    cache: Arc<InMemoryCache>,
    search: Arc<InMemorySearchStore>,
    media: Arc<InMemoryMediaStore>,
    blobs: Arc<InMemoryBlobStore>,
}

impl Harness {
    fn start() -> Self {
        let config = RelayConfig::from_lookup(|_| None).expect("default config");
        let broker = InMemoryBroker::new();
        let cache = Arc::new(InMemoryCache::new());
        let search = Arc::new(InMemorySearchStore::new());
        let media = Arc::new(InMemoryMediaStore::new());
        let blobs = Arc::new(InMemoryBlobStore::new());
        let stores = NodeStores {
            cache: cache.clone(),
            search: search.clone(),
            media: media.clone(),
            blobs: blobs.clone(),
        };
        let node = start(&config, broker.clone(), stores).expect("node starts");
        wait_until("subscriptions", || {
            node.consumers().iter().all(|c| c.state() == ConsumerState::Subscribed)
        });
        Self { broker, node, cache, search, media, blobs }
    }
}

#[test]
fn writer_and_node_converge_over_the_broker() {
    let h = Harness::start();
    assert_eq!(h.node.consumers().len(), 3);

    // The post service runs in its own process: separate channel, same broker.
    let writer = Arc::new(BrokerAdapter::new(h.broker.clone(), "postrelay_events", Default::default()));
    writer.connect().unwrap();
    let posts = PostService::new(
        Arc::new(InMemoryPostRepository::new()),
        BrokerPublisher::new(Arc::clone(&writer)),
        Arc::new(InMemoryCache::new()),
        CacheTtls::default(),
        Arc::new(SystemClock),
    );
    let user = UserId::parse("author-1").unwrap();

    let uploads = MediaService::new(h.media.clone(), h.blobs.clone(), Arc::new(SystemClock));
    let asset = uploads
        .upload(
            user.clone(),
            BlobUpload {
                original_name: "sunset.jpg".into(),
                mime_type: "image/jpeg".into(),
                bytes: vec![9; 32],
            },
        )
        .unwrap();

    let post = posts
        .create_post(user.clone(), "sunset over the harbour", Some(asset.media_id.clone()))
        .unwrap();
    wait_until("post indexed", || h.search.count().unwrap() == 1);

    let finder = SearchService::new(h.search.clone(), h.cache.clone(), Duration::from_secs(60));
    let hits = finder.search("harbour").unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].row.post_id, post.id);

    posts.delete_post(&post.id, &user).unwrap();
    wait_until("post unindexed", || h.search.count().unwrap() == 0);
    wait_until("media cleaned up", || h.media.get(&asset.media_id).unwrap().is_none());
    assert!(h.blobs.is_empty());

    // The cached result page is dropped once the delete is projected.
    wait_until("search cache invalidated", || finder.search("harbour").unwrap().is_empty());

    writer.disconnect();
    h.node.shutdown();
    assert_eq!(h.broker.live_connections(), 0);
}
