use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use postrelay_events::topic::{self, DEAD_LETTER_SUFFIX};
use postrelay_events::{
    Connector, DecodeError, DecodeEvent, Delivery, EventEnvelope, EventHandler, HandleOutcome,
    Topic,
};

use crate::broker::{BrokerAdapter, BrokerError};

/// What happens to a message whose handler failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AckPolicy {
    /// Log and acknowledge; the message is not retried.
    #[default]
    Always,
    /// Requeue until the message has been delivered `max_deliveries` times, then
    /// republish it to `<topic>.dead-letter` and acknowledge. The consumer binds
    /// `<queue>.dead-letter` to those topics so parked messages are kept.
    RetryThenDeadLetter { max_deliveries: u32 },
}

/// Queue that holds the dead letters of `queue`.
pub fn dead_letter_queue(queue: &str) -> String {
    format!("{queue}.{DEAD_LETTER_SUFFIX}")
}

impl AckPolicy {
    /// Parse `always` or `retry:<n>` (n >= 1).
    pub fn parse(raw: &str) -> Result<Self, String> {
        let raw = raw.trim();
        if raw.eq_ignore_ascii_case("always") {
            return Ok(Self::Always);
        }
        let n = raw
            .strip_prefix("retry:")
            .ok_or_else(|| format!("expected `always` or `retry:<n>`, got {raw:?}"))?;
        let max_deliveries: u32 = n
            .parse()
            .map_err(|_| format!("invalid retry count {n:?}"))?;
        if max_deliveries == 0 {
            return Err("retry count must be at least 1".to_string());
        }
        Ok(Self::RetryThenDeadLetter { max_deliveries })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Disconnected,
    Connecting,
    Subscribed,
    Handling,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumerOptions {
    /// Max deliveries fetched per round trip.
    pub prefetch: usize,
    /// Sleep between polls of an empty queue.
    pub poll_interval: Duration,
    pub ack_policy: AckPolicy,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            prefetch: 16,
            poll_interval: Duration::from_millis(50),
            ack_policy: AckPolicy::Always,
        }
    }
}

/// Point-in-time counters for one consumer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    pub applied: u64,
    pub skipped: u64,
    pub failed: u64,
    /// Undecodable messages, acknowledged and discarded.
    pub dropped: u64,
    pub dead_lettered: u64,
}

impl ConsumerStats {
    /// Messages settled one way or another.
    pub fn settled(&self) -> u64 {
        self.applied + self.skipped + self.dropped + self.dead_lettered + self.failed
    }
}

#[derive(Debug, Default)]
struct Counters {
    applied: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
    dead_lettered: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> ConsumerStats {
        ConsumerStats {
            applied: self.applied.load(Ordering::SeqCst),
            skipped: self.skipped.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            dropped: self.dropped.load(Ordering::SeqCst),
            dead_lettered: self.dead_lettered.load(Ordering::SeqCst),
        }
    }
}

/// Handle to observe, stop and join a consumer thread.
///
/// Dropping the handle without calling `shutdown` also stops the consumer.
#[derive(Debug)]
pub struct ConsumerHandle {
    name: &'static str,
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
    state: Arc<Mutex<ConsumerState>>,
    counters: Arc<Counters>,
}

impl ConsumerHandle {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn state(&self) -> ConsumerState {
        self.state
            .lock()
            .map(|s| *s)
            .unwrap_or(ConsumerState::Stopped)
    }

    pub fn stats(&self) -> ConsumerStats {
        self.counters.snapshot()
    }

    /// Request graceful shutdown and wait for the consumer to stop.
    ///
    /// A delivery being handled is finished and settled first; anything still
    /// unacked when the channel closes goes back to the queue.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }
}

/// Consumer runtime: one thread per (queue, binding, handler).
///
/// - binds `queue` to `pattern` on the shared channel and re-binds after every reconnect
/// - decodes each delivery and applies the handler
/// - acknowledges only after the handler returns (at-least-once)
/// - reconnects with the adapter's backoff policy when the channel drops
#[derive(Debug)]
pub struct ConsumerRuntime;

impl ConsumerRuntime {
    /// Spawn a consumer thread.
    ///
    /// `handler` must be idempotent: the same message may be delivered again
    /// after a crash, reconnect or requeue.
    pub fn spawn<C, H>(
        name: &'static str,
        adapter: Arc<BrokerAdapter<C>>,
        queue: impl Into<String>,
        pattern: impl Into<String>,
        handler: H,
        options: ConsumerOptions,
    ) -> std::io::Result<ConsumerHandle>
    where
        C: Connector,
        H: EventHandler,
    {
        let queue = queue.into();
        let pattern = pattern.into();
        if !H::Event::topics().iter().any(|t| topic::matches(&pattern, t)) {
            warn!(
                consumer = name,
                pattern = %pattern,
                known = ?H::Event::topics(),
                "binding matches no topic the handler decodes; every delivery will be dropped"
            );
        }

        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let state = Arc::new(Mutex::new(ConsumerState::Disconnected));
        let counters = Arc::new(Counters::default());

        let worker = Worker {
            name,
            adapter,
            queue,
            pattern,
            handler,
            options,
            state: Arc::clone(&state),
            counters: Arc::clone(&counters),
        };

        let join = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || worker.run(shutdown_rx))?;

        Ok(ConsumerHandle {
            name,
            shutdown: shutdown_tx,
            join: Some(join),
            state,
            counters,
        })
    }
}

struct Worker<C: Connector, H> {
    name: &'static str,
    adapter: Arc<BrokerAdapter<C>>,
    queue: String,
    pattern: String,
    handler: H,
    options: ConsumerOptions,
    state: Arc<Mutex<ConsumerState>>,
    counters: Arc<Counters>,
}

/// Block up to `d`; true means stop.
fn wait(shutdown_rx: &mpsc::Receiver<()>, d: Duration) -> bool {
    match shutdown_rx.recv_timeout(d) {
        Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => true,
        Err(mpsc::RecvTimeoutError::Timeout) => false,
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}

enum Failure {
    Handler(String),
    Panic(String),
}

impl core::fmt::Display for Failure {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Failure::Handler(e) => write!(f, "{e}"),
            Failure::Panic(e) => write!(f, "panic: {e}"),
        }
    }
}

impl<C, H> Worker<C, H>
where
    C: Connector,
    H: EventHandler,
{
    fn set_state(&self, next: ConsumerState) {
        if let Ok(mut s) = self.state.lock() {
            *s = next;
        }
    }

    fn run(self, shutdown_rx: mpsc::Receiver<()>) {
        let backoff = self.adapter.backoff();
        let mut bound_generation: Option<u64> = None;
        let mut attempt: u32 = 0;

        info!(consumer = self.name, queue = %self.queue, pattern = %self.pattern, "consumer starting");

        loop {
            if shutdown_rx.try_recv().is_ok() {
                break;
            }

            if !self.adapter.is_connected() {
                self.set_state(ConsumerState::Connecting);
                if let Err(e) = self.adapter.try_connect_once() {
                    attempt = attempt.saturating_add(1);
                    self.set_state(ConsumerState::Disconnected);
                    if self.adapter.is_reconnecting() {
                        debug!(consumer = self.name, "reconnect already in flight");
                    } else {
                        warn!(consumer = self.name, attempt, error = %e, "reconnect failed");
                    }
                    if wait(&shutdown_rx, backoff.delay(attempt)) {
                        break;
                    }
                    continue;
                }
                attempt = 0;
            }

            let generation = self.adapter.generation();
            if bound_generation != Some(generation) {
                match self.bind() {
                    Ok(()) => {
                        bound_generation = Some(generation);
                        self.set_state(ConsumerState::Subscribed);
                        info!(consumer = self.name, queue = %self.queue, generation, "subscribed");
                    }
                    Err(e) => {
                        warn!(consumer = self.name, error = %e, "subscribe failed");
                        if wait(&shutdown_rx, self.options.poll_interval) {
                            break;
                        }
                        continue;
                    }
                }
            }

            let deliveries = match self.adapter.fetch(&self.queue, self.options.prefetch.max(1)) {
                Ok(d) => d,
                Err(e) => {
                    warn!(consumer = self.name, error = %e, "fetch failed");
                    if !e.is_disconnect() && wait(&shutdown_rx, self.options.poll_interval) {
                        break;
                    }
                    continue;
                }
            };

            if deliveries.is_empty() {
                if wait(&shutdown_rx, self.options.poll_interval) {
                    break;
                }
                continue;
            }

            self.set_state(ConsumerState::Handling);
            let mut requeued = false;
            for delivery in deliveries {
                requeued |= self.process(delivery);
            }
            self.set_state(ConsumerState::Subscribed);

            // Pause before retrying requeued messages.
            if requeued && wait(&shutdown_rx, self.options.poll_interval) {
                break;
            }
        }

        self.set_state(ConsumerState::Stopped);
        info!(consumer = self.name, "consumer stopped");
    }

    fn bind(&self) -> Result<(), BrokerError> {
        if let AckPolicy::RetryThenDeadLetter { .. } = self.options.ack_policy {
            self.adapter.subscribe(
                &dead_letter_queue(&self.queue),
                &topic::dead_letter_pattern(&self.pattern),
            )?;
        }
        self.adapter.subscribe(&self.queue, &self.pattern)
    }

    fn decode(&self, delivery: &Delivery) -> Result<(EventEnvelope, H::Event), DecodeError> {
        let envelope = EventEnvelope::from_bytes(&delivery.body)?;
        if envelope.topic() != delivery.topic {
            return Err(DecodeError::TopicMismatch {
                envelope: envelope.topic().to_string(),
                delivery: delivery.topic.clone(),
            });
        }
        let event = H::Event::decode(envelope.clone())?;
        Ok((envelope, event))
    }

    /// Returns true when the delivery was requeued for another attempt.
    fn process(&self, delivery: Delivery) -> bool {
        let (envelope, event) = match self.decode(&delivery) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!(
                    consumer = self.name,
                    topic = %delivery.topic,
                    tag = %delivery.tag,
                    error = %e,
                    "dropping undecodable message"
                );
                self.counters.dropped.fetch_add(1, Ordering::SeqCst);
                self.settle(&delivery, Settle::Ack);
                return false;
            }
        };

        let result = panic::catch_unwind(AssertUnwindSafe(|| self.handler.handle(event)));
        let failure = match result {
            Ok(Ok(outcome)) => {
                let counter = match outcome {
                    HandleOutcome::Applied => &self.counters.applied,
                    HandleOutcome::Skipped => &self.counters.skipped,
                };
                counter.fetch_add(1, Ordering::SeqCst);
                debug!(
                    consumer = self.name,
                    handler = self.handler.name(),
                    event_id = %envelope.event_id(),
                    ?outcome,
                    "event handled"
                );
                self.settle(&delivery, Settle::Ack);
                return false;
            }
            Ok(Err(e)) => Failure::Handler(e.to_string()),
            Err(payload) => Failure::Panic(panic_message(payload)),
        };

        self.counters.failed.fetch_add(1, Ordering::SeqCst);
        match self.options.ack_policy {
            AckPolicy::Always => {
                error!(
                    consumer = self.name,
                    handler = self.handler.name(),
                    event_id = %envelope.event_id(),
                    topic = %envelope.topic(),
                    error = %failure,
                    "handler failed; acknowledging without retry"
                );
                self.settle(&delivery, Settle::Ack);
                false
            }
            AckPolicy::RetryThenDeadLetter { max_deliveries } => {
                if delivery.delivery_count < max_deliveries {
                    warn!(
                        consumer = self.name,
                        event_id = %envelope.event_id(),
                        delivery_count = delivery.delivery_count,
                        max_deliveries,
                        error = %failure,
                        "handler failed; requeueing"
                    );
                    self.settle(&delivery, Settle::Requeue);
                    true
                } else {
                    self.dead_letter(&delivery, &envelope, &failure)
                }
            }
        }
    }

    /// Returns true when the message had to be requeued instead.
    fn dead_letter(&self, delivery: &Delivery, envelope: &EventEnvelope, failure: &Failure) -> bool {
        let topic = match Topic::parse(envelope.topic()) {
            Ok(t) => t.dead_letter(),
            Err(e) => {
                // Not a routable key, so it cannot be parked; drop it.
                error!(consumer = self.name, event_id = %envelope.event_id(), error = %e, "cannot dead-letter message");
                self.counters.dropped.fetch_add(1, Ordering::SeqCst);
                self.settle(delivery, Settle::Ack);
                return false;
            }
        };
        match self.adapter.publish(&envelope.readdressed(topic.as_str())) {
            Ok(()) => {
                self.counters.dead_lettered.fetch_add(1, Ordering::SeqCst);
                error!(
                    consumer = self.name,
                    event_id = %envelope.event_id(),
                    dead_letter_topic = %topic,
                    delivery_count = delivery.delivery_count,
                    error = %failure,
                    "retries exhausted; message dead-lettered"
                );
                self.settle(delivery, Settle::Ack);
                false
            }
            Err(e) => {
                warn!(consumer = self.name, error = %e, "dead-letter publish failed; requeueing");
                self.settle(delivery, Settle::Requeue);
                true
            }
        }
    }

    fn settle(&self, delivery: &Delivery, how: Settle) {
        let result: Result<(), BrokerError> = match how {
            Settle::Ack => self.adapter.ack(delivery),
            Settle::Requeue => self.adapter.reject(delivery, true),
        };
        if let Err(e) = result {
            // Unsettled deliveries come back after the channel is re-established.
            warn!(consumer = self.name, tag = %delivery.tag, error = %e, "failed to settle delivery");
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Settle {
    Ack,
    Requeue,
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Instant;

    use chrono::Utc;
    use postrelay_core::{PostId, UserId};
    use postrelay_events::{InMemoryBroker, PostCreated, PostEvent, publish_event};

    use crate::broker::{BackoffPolicy, BrokerPublisher};

    #[derive(Debug, thiserror::Error)]
    #[error("boom")]
    struct Boom;

    /// Records post ids; fails or panics on request.
    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<PostId>>,
        fail: bool,
        panic: bool,
    }

    impl EventHandler for Recorder {
        type Event = PostEvent;
        type Error = Boom;

        fn name(&self) -> &'static str {
            "recorder"
        }

        fn handle(&self, event: PostEvent) -> Result<HandleOutcome, Boom> {
            if self.panic {
                panic!("recorder exploded");
            }
            if self.fail {
                return Err(Boom);
            }
            self.seen.lock().unwrap().push(event.post_id().clone());
            Ok(HandleOutcome::Applied)
        }
    }

    fn setup() -> (InMemoryBroker, Arc<BrokerAdapter<InMemoryBroker>>) {
        let broker = InMemoryBroker::new();
        let adapter = Arc::new(BrokerAdapter::new(
            broker.clone(),
            "test_events",
            BackoffPolicy {
                initial: Duration::from_millis(1),
                max: Duration::from_millis(10),
                max_attempts: 2,
            },
        ));
        adapter.connect().unwrap();
        (broker, adapter)
    }

    fn options(ack_policy: AckPolicy) -> ConsumerOptions {
        ConsumerOptions {
            prefetch: 4,
            poll_interval: Duration::from_millis(5),
            ack_policy,
        }
    }

    fn created() -> PostCreated {
        PostCreated {
            post_id: PostId::new(),
            user_id: UserId::parse("u1").unwrap(),
            content: "hello".into(),
            created_at: Utc::now(),
        }
    }

    fn wait_until(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn parses_ack_policies() {
        assert_eq!(AckPolicy::parse("always").unwrap(), AckPolicy::Always);
        assert_eq!(
            AckPolicy::parse("retry:3").unwrap(),
            AckPolicy::RetryThenDeadLetter { max_deliveries: 3 }
        );
        assert!(AckPolicy::parse("retry:0").is_err());
        assert!(AckPolicy::parse("sometimes").is_err());
    }

    #[test]
    fn handles_and_acks_in_order() {
        let (broker, adapter) = setup();
        let handler = Arc::new(Recorder::default());
        let handle = ConsumerRuntime::spawn(
            "test.consumer",
            Arc::clone(&adapter),
            "q.created",
            "post.created",
            Arc::clone(&handler),
            options(AckPolicy::Always),
        )
        .unwrap();
        wait_until(|| handle.state() == ConsumerState::Subscribed);

        let publisher = BrokerPublisher::new(Arc::clone(&adapter));
        let events: Vec<_> = (0..3).map(|_| created()).collect();
        for e in &events {
            publish_event(&publisher, e).unwrap();
        }

        wait_until(|| handle.stats().applied == 3);
        let seen = handler.seen.lock().unwrap().clone();
        let expected: Vec<_> = events.iter().map(|e| e.post_id.clone()).collect();
        assert_eq!(seen, expected);
        assert_eq!(broker.unacked_count("q.created"), 0);

        handle.shutdown();
    }

    #[test]
    fn malformed_messages_are_dropped_and_acked() {
        let (broker, adapter) = setup();
        let handle = ConsumerRuntime::spawn(
            "test.malformed",
            Arc::clone(&adapter),
            "q.bad",
            "post.created",
            Recorder::default(),
            options(AckPolicy::Always),
        )
        .unwrap();
        wait_until(|| handle.state() == ConsumerState::Subscribed);

        let bad = EventEnvelope::new(
            uuid::Uuid::now_v7(),
            "post.created",
            1,
            Utc::now(),
            serde_json::json!({ "postId": "p1" }),
        );
        adapter.publish(&bad).unwrap();

        wait_until(|| handle.stats().dropped == 1);
        assert_eq!(broker.ready_count("q.bad") + broker.unacked_count("q.bad"), 0);
        handle.shutdown();
    }

    #[test]
    fn panicking_handler_counts_as_failure_and_consumer_survives() {
        let (_broker, adapter) = setup();
        let handler = Recorder {
            panic: true,
            ..Recorder::default()
        };
        let handle = ConsumerRuntime::spawn(
            "test.panic",
            Arc::clone(&adapter),
            "q.panic",
            "post.created",
            handler,
            options(AckPolicy::Always),
        )
        .unwrap();
        wait_until(|| handle.state() == ConsumerState::Subscribed);

        let publisher = BrokerPublisher::new(Arc::clone(&adapter));
        publish_event(&publisher, &created()).unwrap();
        publish_event(&publisher, &created()).unwrap();

        wait_until(|| handle.stats().failed == 2);
        assert_ne!(handle.state(), ConsumerState::Stopped);
        handle.shutdown();
    }

    #[test]
    fn retry_policy_dead_letters_after_max_deliveries() {
        let (broker, adapter) = setup();

        let handler = Recorder {
            fail: true,
            ..Recorder::default()
        };
        let handle = ConsumerRuntime::spawn(
            "test.retry",
            Arc::clone(&adapter),
            "q.retry",
            "post.created",
            handler,
            options(AckPolicy::RetryThenDeadLetter { max_deliveries: 3 }),
        )
        .unwrap();
        wait_until(|| handle.state() == ConsumerState::Subscribed);

        let publisher = BrokerPublisher::new(Arc::clone(&adapter));
        publish_event(&publisher, &created()).unwrap();

        wait_until(|| handle.stats().dead_lettered == 1);
        assert_eq!(handle.stats().failed, 3);
        assert_eq!(broker.ready_count("q.retry") + broker.unacked_count("q.retry"), 0);
        handle.shutdown();

        // The parked message is held by the consumer's own dead-letter queue.
        let parked = adapter.fetch(&dead_letter_queue("q.retry"), 10).unwrap();
        assert_eq!(parked.len(), 1);
        assert_eq!(parked[0].topic, "post.created.dead-letter");
        let envelope = EventEnvelope::from_bytes(&parked[0].body).unwrap();
        assert_eq!(envelope.topic(), "post.created.dead-letter");
    }

    #[test]
    fn always_policy_binds_no_dead_letter_queue() {
        let (broker, adapter) = setup();
        let handle = ConsumerRuntime::spawn(
            "test.nodlq",
            Arc::clone(&adapter),
            "q.plain",
            "post.created",
            Recorder::default(),
            options(AckPolicy::Always),
        )
        .unwrap();
        wait_until(|| handle.state() == ConsumerState::Subscribed);
        handle.shutdown();

        let parked = EventEnvelope::new(
            uuid::Uuid::now_v7(),
            "post.created.dead-letter",
            1,
            Utc::now(),
            serde_json::json!({}),
        );
        adapter.publish(&parked).unwrap();
        assert_eq!(broker.ready_count(&dead_letter_queue("q.plain")), 0);
    }

    #[test]
    fn shutdown_reports_stopped() {
        let (_broker, adapter) = setup();
        let handle = ConsumerRuntime::spawn(
            "test.stop",
            adapter,
            "q.stop",
            "post.#",
            Recorder::default(),
            options(AckPolicy::Always),
        )
        .unwrap();
        wait_until(|| handle.state() == ConsumerState::Subscribed);
        let state = Arc::clone(&handle.state);
        handle.shutdown();
        assert_eq!(*state.lock().unwrap(), ConsumerState::Stopped);
    }
}
