//! End-to-end tests for the relay pipeline.
//!
//! PostService → BrokerPublisher → in-memory broker → ConsumerRuntime →
//! projection handlers → service-local stores (and the cache around them).
//!
//! Verifies:
//! - creates and deletes reach every subscribed service
//! - duplicate, reordered and redelivered messages converge to one end state
//! - a connection lost while a handler runs leads to redelivery, not loss
//! - consumers survive channel loss and resubscribe
//! - writes succeed while the broker is down; cached views self-heal

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex, mpsc};
    use std::thread;
    use std::time::{Duration, Instant};

    use chrono::Utc;
    use proptest::prelude::*;

    use postrelay_core::{ManualClock, MediaId, PostId, SystemClock, UserId};
    use postrelay_events::{
        EventEnvelope, EventHandler, HandleOutcome, InMemoryBroker, PostCreated, PostDeleted, PostEvent,
    };

    use crate::blob::{BlobUpload, InMemoryBlobStore};
    use crate::broker::{BackoffPolicy, BrokerAdapter, BrokerPublisher};
    use crate::cache::keys::post_key;
    use crate::cache::{CacheStore, InMemoryCache};
    use crate::projections::{MediaCleanupProjection, SearchIndexProjection};
    use crate::read_model::{
        InMemoryMediaStore, InMemoryPostRepository, InMemorySearchStore, MediaStore, SearchStore,
    };
    use crate::services::{CacheTtls, MediaService, PostService, SearchService};
    use crate::workers::{AckPolicy, ConsumerHandle, ConsumerOptions, ConsumerRuntime, ConsumerState};

    const EXCHANGE: &str = "it_events";

    type Adapter = Arc<BrokerAdapter<InMemoryBroker>>;
    type Search = Arc<SearchIndexProjection<Arc<InMemorySearchStore>, Arc<InMemoryCache>>>;
    type Posts =
        PostService<Arc<InMemoryPostRepository>, BrokerPublisher<InMemoryBroker>, Arc<InMemoryCache>>;

    fn adapter(broker: &InMemoryBroker) -> Adapter {
        let adapter = Arc::new(BrokerAdapter::new(
            broker.clone(),
            EXCHANGE,
            BackoffPolicy {
                initial: Duration::from_millis(2),
                max: Duration::from_millis(20),
                max_attempts: 3,
            },
        ));
        adapter.connect().unwrap();
        adapter
    }

    fn options() -> ConsumerOptions {
        ConsumerOptions {
            prefetch: 8,
            poll_interval: Duration::from_millis(5),
            ack_policy: AckPolicy::Always,
        }
    }

    fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn spawn<H: EventHandler<Event = PostEvent>>(
        adapter: &Adapter,
        queue: &str,
        topic: &str,
        handler: H,
    ) -> ConsumerHandle {
        let handle =
            ConsumerRuntime::spawn("it.consumer", Arc::clone(adapter), queue, topic, handler, options())
                .unwrap();
        wait_until("subscription", || handle.state() == ConsumerState::Subscribed);
        handle
    }

    struct SearchSide {
        store: Arc<InMemorySearchStore>,
        cache: Arc<InMemoryCache>,
        created: ConsumerHandle,
        deleted: ConsumerHandle,
    }

    impl SearchSide {
        fn start(adapter: &Adapter) -> Self {
            let store = Arc::new(InMemorySearchStore::new());
            let cache = Arc::new(InMemoryCache::new());
            let projection: Search =
                Arc::new(SearchIndexProjection::new(Arc::clone(&store), Arc::clone(&cache)));
            let created = spawn(adapter, "search.post.created", "post.created", Arc::clone(&projection));
            let deleted = spawn(adapter, "search.post.deleted", "post.deleted", projection);
            Self {
                store,
                cache,
                created,
                deleted,
            }
        }

        fn stop(self) {
            self.created.shutdown();
            self.deleted.shutdown();
        }
    }

    fn post_service(adapter: &Adapter) -> (Arc<InMemoryCache>, Posts) {
        let cache = Arc::new(InMemoryCache::new());
        let svc = PostService::new(
            Arc::new(InMemoryPostRepository::new()),
            BrokerPublisher::new(Arc::clone(adapter)),
            Arc::clone(&cache),
            CacheTtls::default(),
            Arc::new(SystemClock),
        );
        (cache, svc)
    }

    fn u1() -> UserId {
        UserId::parse("u1").unwrap()
    }

    fn created(id: &str) -> PostCreated {
        PostCreated {
            post_id: PostId::parse(id).unwrap(),
            user_id: u1(),
            content: "hi".into(),
            created_at: Utc::now(),
        }
    }

    fn deleted(id: &str) -> PostDeleted {
        PostDeleted {
            post_id: PostId::parse(id).unwrap(),
            user_id: u1(),
            media_id: None,
        }
    }

    #[test]
    fn created_then_deleted_post_leaves_no_search_row() {
        let broker = InMemoryBroker::new();
        let adapter = adapter(&broker);
        let search = SearchSide::start(&adapter);
        let publisher = BrokerPublisher::new(Arc::clone(&adapter));
        let p1 = PostId::parse("p1").unwrap();

        postrelay_events::publish_event(&publisher, &created("p1")).unwrap();
        wait_until("row indexed", || search.store.get(&p1).unwrap().is_some());
        assert_eq!(search.store.count().unwrap(), 1);

        postrelay_events::publish_event(&publisher, &deleted("p1")).unwrap();
        wait_until("row removed", || search.store.get(&p1).unwrap().is_none());
        assert_eq!(search.store.count().unwrap(), 0);

        search.stop();
    }

    #[test]
    fn post_service_writes_fan_out_to_search_and_media() {
        let broker = InMemoryBroker::new();
        let adapter = adapter(&broker);
        let search = SearchSide::start(&adapter);

        let media = Arc::new(InMemoryMediaStore::new());
        let blobs = Arc::new(InMemoryBlobStore::new());
        let media_consumer = spawn(
            &adapter,
            "media.post.deleted",
            "post.deleted",
            MediaCleanupProjection::new(Arc::clone(&media), Arc::clone(&blobs)),
        );
        let uploads = MediaService::new(Arc::clone(&media), Arc::clone(&blobs), Arc::new(SystemClock));
        let asset = uploads
            .upload(
                u1(),
                BlobUpload {
                    original_name: "cat.png".into(),
                    mime_type: "image/png".into(),
                    bytes: vec![7; 16],
                },
            )
            .unwrap();

        let (post_cache, posts) = post_service(&adapter);
        let post = posts
            .create_post(u1(), "a post with a picture", Some(asset.media_id.clone()))
            .unwrap();
        wait_until("row indexed", || search.store.count().unwrap() == 1);

        posts.get_post(&post.id).unwrap();
        assert!(post_cache.get(&post_key(&post.id)).unwrap().is_some());

        posts.delete_post(&post.id, &u1()).unwrap();
        assert_eq!(post_cache.get(&post_key(&post.id)).unwrap(), None);

        wait_until("row removed", || search.store.count().unwrap() == 0);
        wait_until("media removed", || media.get(&asset.media_id).unwrap().is_none());
        assert!(!blobs.contains(&asset.public_id));

        media_consumer.shutdown();
        search.stop();
    }

    #[test]
    fn duplicate_delivery_is_applied_once() {
        let broker = InMemoryBroker::new();
        let adapter = adapter(&broker);
        let search = SearchSide::start(&adapter);

        let envelope = EventEnvelope::seal(&created("p1"), Utc::now()).unwrap();
        adapter.publish(&envelope).unwrap();
        adapter.publish(&envelope).unwrap();

        wait_until("both deliveries settled", || search.created.stats().settled() == 2);
        let stats = search.created.stats();
        assert_eq!((stats.applied, stats.skipped), (1, 1));
        assert_eq!(search.store.count().unwrap(), 1);

        search.stop();
    }

    #[test]
    fn delete_arriving_before_create_keeps_post_out_of_the_index() {
        let broker = InMemoryBroker::new();
        let adapter = adapter(&broker);
        let search = SearchSide::start(&adapter);
        let publisher = BrokerPublisher::new(Arc::clone(&adapter));

        postrelay_events::publish_event(&publisher, &deleted("p1")).unwrap();
        wait_until("delete settled", || search.deleted.stats().settled() == 1);
        postrelay_events::publish_event(&publisher, &created("p1")).unwrap();
        wait_until("create settled", || search.created.stats().settled() == 1);

        assert_eq!(search.store.count().unwrap(), 0);
        search.stop();
    }

    #[test]
    fn unacked_message_is_redelivered_after_consumer_crash() {
        let broker = InMemoryBroker::new();

        // First consumer takes the message and dies before acknowledging.
        let crashed = adapter(&broker);
        crashed.subscribe("search.post.created", "post.created").unwrap();
        let envelope = EventEnvelope::seal(&created("p1"), Utc::now()).unwrap();
        crashed.publish(&envelope).unwrap();
        let taken = crashed.fetch("search.post.created", 1).unwrap();
        assert_eq!(taken.len(), 1);
        assert_eq!(broker.unacked_count("search.post.created"), 1);
        crashed.disconnect();
        assert_eq!(broker.ready_count("search.post.created"), 1);

        let restarted = adapter(&broker);
        let search = SearchSide::start(&restarted);
        wait_until("redelivered row", || search.store.count().unwrap() == 1);
        assert_eq!(search.created.stats().applied, 1);
        assert_eq!(broker.unacked_count("search.post.created"), 0);

        search.stop();
    }

    /// Holds the first event until released; later events pass straight through.
    struct Latched {
        inner: Search,
        held: AtomicBool,
        entered: mpsc::Sender<()>,
        release: Mutex<mpsc::Receiver<()>>,
    }

    impl EventHandler for Latched {
        type Event = PostEvent;
        type Error = <Search as EventHandler>::Error;

        fn name(&self) -> &'static str {
            "search.latched"
        }

        fn handle(&self, event: PostEvent) -> Result<HandleOutcome, Self::Error> {
            if !self.held.swap(true, Ordering::SeqCst) {
                let _ = self.entered.send(());
                let _ = self.release.lock().unwrap().recv();
            }
            self.inner.handle(event)
        }
    }

    #[test]
    fn connection_lost_mid_handler_redelivers_and_applies_once() {
        let broker = InMemoryBroker::new();
        let adapter = adapter(&broker);
        let store = Arc::new(InMemorySearchStore::new());
        let projection: Search =
            Arc::new(SearchIndexProjection::new(Arc::clone(&store), Arc::new(InMemoryCache::new())));
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let handler = Latched {
            inner: projection,
            held: AtomicBool::new(false),
            entered: entered_tx,
            release: Mutex::new(release_rx),
        };
        let consumer = spawn(&adapter, "search.post.created", "post.created", handler);

        let publisher = BrokerPublisher::new(Arc::clone(&adapter));
        postrelay_events::publish_event(&publisher, &created("p1")).unwrap();
        entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(broker.unacked_count("search.post.created"), 1);

        // The handler is mid-flight; its ack will land on a dead channel.
        broker.sever_connections();
        assert_eq!(broker.ready_count("search.post.created"), 1);
        release_tx.send(()).unwrap();

        wait_until("redelivery settled", || consumer.stats().settled() == 2);
        let stats = consumer.stats();
        assert_eq!(stats.applied, 1);
        assert_eq!(stats.skipped, 1);
        assert_eq!(store.count().unwrap(), 1);
        wait_until("queue drained", || {
            broker.ready_count("search.post.created") == 0
                && broker.unacked_count("search.post.created") == 0
        });

        consumer.shutdown();
    }

    #[test]
    fn consumer_resubscribes_after_channel_loss() {
        let broker = InMemoryBroker::new();
        let adapter = adapter(&broker);
        let search = SearchSide::start(&adapter);
        let first_generation = adapter.generation();

        broker.refuse_connections(true);
        broker.sever_connections();
        wait_until("consumer noticed", || {
            search.created.state() != ConsumerState::Subscribed || !adapter.is_connected()
        });
        thread::sleep(Duration::from_millis(30));
        assert!(!adapter.is_connected());

        broker.refuse_connections(false);
        wait_until("resubscribed", || {
            adapter.generation() > first_generation
                && search.created.state() == ConsumerState::Subscribed
        });

        let publisher = BrokerPublisher::new(Arc::clone(&adapter));
        postrelay_events::publish_event(&publisher, &created("p2")).unwrap();
        wait_until("row after reconnect", || search.store.count().unwrap() == 1);

        search.stop();
    }

    #[test]
    fn writes_succeed_while_broker_is_down() {
        let broker = InMemoryBroker::new();
        let adapter = adapter(&broker);
        let search = SearchSide::start(&adapter);
        let (_cache, posts) = post_service(&adapter);

        search.stop();
        broker.refuse_connections(true);
        broker.sever_connections();

        let post = posts.create_post(u1(), "written offline", None).unwrap();
        assert_eq!(posts.get_post(&post.id).unwrap(), post);
        // The event was dropped, not buffered.
        broker.refuse_connections(false);
        wait_until("reconnected", || adapter.try_connect_once().is_ok());
        assert_eq!(broker.ready_count("search.post.created"), 0);
    }

    #[test]
    fn search_results_follow_projection_updates() {
        let broker = InMemoryBroker::new();
        let adapter = adapter(&broker);
        let search = SearchSide::start(&adapter);
        let reader = SearchService::new(
            Arc::clone(&search.store),
            Arc::clone(&search.cache),
            CacheTtls::default().list,
        );
        let publisher = BrokerPublisher::new(Arc::clone(&adapter));

        assert!(reader.search("hi").unwrap().is_empty());
        assert!(search.cache.get("search:hi:10").unwrap().is_some());

        postrelay_events::publish_event(&publisher, &created("p1")).unwrap();
        wait_until("indexed", || search.store.count().unwrap() == 1);
        assert_eq!(reader.search("hi").unwrap().len(), 1);

        search.stop();
    }

    #[test]
    fn stale_cache_entries_expire_without_invalidation() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let cache = Arc::new(InMemoryCache::with_clock(clock.clone()));
        let broker = InMemoryBroker::new();
        let adapter = adapter(&broker);
        let posts = PostService::new(
            Arc::new(InMemoryPostRepository::new()),
            BrokerPublisher::new(Arc::clone(&adapter)),
            Arc::clone(&cache),
            CacheTtls::default(),
            clock.clone(),
        );

        let post = posts.create_post(u1(), "soon stale", None).unwrap();
        posts.get_post(&post.id).unwrap();

        // Simulate a lost invalidation by planting a stale copy.
        let mut stale = post.clone();
        stale.content = "stale copy".into();
        cache
            .set(&post_key(&post.id), &serde_json::to_string(&stale).unwrap(), Duration::from_secs(3600))
            .unwrap();
        assert_eq!(posts.get_post(&post.id).unwrap().content, "stale copy");

        clock.advance(chrono::Duration::seconds(3600));
        assert_eq!(posts.get_post(&post.id).unwrap().content, "soon stale");
    }

    #[test]
    fn retry_policy_eventually_applies_after_transient_failure() {
        let broker = InMemoryBroker::new();
        let adapter = adapter(&broker);

        let media = Arc::new(InMemoryMediaStore::new());
        let blobs = Arc::new(InMemoryBlobStore::new());
        let uploads = MediaService::new(Arc::clone(&media), Arc::clone(&blobs), Arc::new(SystemClock));
        let asset = uploads
            .upload(
                u1(),
                BlobUpload {
                    original_name: "a.gif".into(),
                    mime_type: "image/gif".into(),
                    bytes: vec![1],
                },
            )
            .unwrap();
        blobs.set_fail_deletes(true);

        let handle = ConsumerRuntime::spawn(
            "it.media",
            Arc::clone(&adapter),
            "media.post.deleted",
            "post.deleted",
            MediaCleanupProjection::new(Arc::clone(&media), Arc::clone(&blobs)),
            ConsumerOptions {
                ack_policy: AckPolicy::RetryThenDeadLetter { max_deliveries: 10_000 },
                ..options()
            },
        )
        .unwrap();
        wait_until("subscription", || handle.state() == ConsumerState::Subscribed);

        let publisher = BrokerPublisher::new(Arc::clone(&adapter));
        let event = PostDeleted {
            post_id: PostId::parse("p1").unwrap(),
            user_id: u1(),
            media_id: Some(asset.media_id.clone()),
        };
        postrelay_events::publish_event(&publisher, &event).unwrap();

        wait_until("first failure", || handle.stats().failed >= 1);
        blobs.set_fail_deletes(false);
        wait_until("applied on retry", || handle.stats().applied == 1);
        assert!(media.get(&asset.media_id).unwrap().is_none());
        assert_eq!(handle.stats().dead_lettered, 0);

        handle.shutdown();
    }

    #[derive(Debug, Clone)]
    enum Step {
        Create(u8),
        Delete(u8),
    }

    fn step() -> impl Strategy<Value = Step> {
        prop_oneof![
            (0u8..4).prop_map(Step::Create),
            (0u8..4).prop_map(Step::Delete),
        ]
    }

    fn to_event(step: &Step) -> PostEvent {
        match step {
            Step::Create(i) => PostEvent::Created(created(&format!("p{i}"))),
            Step::Delete(i) => PostEvent::Deleted(PostDeleted {
                post_id: PostId::parse(format!("p{i}")).unwrap(),
                user_id: u1(),
                media_id: None::<MediaId>,
            }),
        }
    }

    fn apply_all(steps: &[Step]) -> Vec<PostId> {
        let store = Arc::new(InMemorySearchStore::new());
        let projection = SearchIndexProjection::new(Arc::clone(&store), Arc::new(InMemoryCache::new()));
        for s in steps {
            projection.handle(to_event(s)).unwrap();
        }
        let mut ids: Vec<PostId> = (0u8..4)
            .map(|i| PostId::parse(format!("p{i}")).unwrap())
            .filter(|id| store.get(id).unwrap().is_some())
            .collect();
        ids.sort();
        ids
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 128, ..ProptestConfig::default() })]

        #[test]
        fn redelivering_any_message_does_not_change_the_end_state(
            steps in prop::collection::vec(step(), 0..24),
            dup_at in prop::collection::vec(any::<prop::sample::Index>(), 0..8),
        ) {
            let mut with_dups = steps.clone();
            for idx in &dup_at {
                if !steps.is_empty() {
                    let i = idx.index(steps.len());
                    with_dups.insert(i, steps[i].clone());
                }
            }
            prop_assert_eq!(apply_all(&steps), apply_all(&with_dups));
        }

        #[test]
        fn a_post_is_indexed_iff_created_and_never_deleted(
            steps in prop::collection::vec(step(), 0..24),
        ) {
            let expected: Vec<PostId> = (0u8..4)
                .filter(|i| {
                    steps.iter().any(|s| matches!(s, Step::Create(x) if x == i))
                        && !steps.iter().any(|s| matches!(s, Step::Delete(x) if x == i))
                })
                .map(|i| PostId::parse(format!("p{i}")).unwrap())
                .collect();
            prop_assert_eq!(apply_all(&steps), expected);
        }
    }
}
