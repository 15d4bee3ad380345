//! In-memory topic-exchange broker for tests/dev.
//!
//! - No IO / no async
//! - Queues outlive connections, so a restarted consumer picks up what its
//!   predecessor left unacked (at-least-once)
//! - Fault injection: sever every live connection, refuse new ones

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::topic;
use crate::transport::{Connector, Delivery, DeliveryTag, Transport, TransportError};

#[derive(Debug, Clone)]
struct Message {
    seq: u64,
    topic: String,
    body: Vec<u8>,
    delivery_count: u32,
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<Message>,
    /// tag -> (connection, message)
    unacked: HashMap<String, (u64, Message)>,
}

#[derive(Debug, Clone)]
struct Binding {
    exchange: String,
    queue: String,
    pattern: String,
}

#[derive(Debug)]
struct BrokerState {
    exchanges: HashSet<String>,
    bindings: Vec<Binding>,
    queues: HashMap<String, QueueState>,
    live: HashSet<u64>,
    next_connection: u64,
    next_seq: u64,
    next_tag: u64,
    accepting: bool,
}

impl Default for BrokerState {
    fn default() -> Self {
        Self {
            exchanges: HashSet::new(),
            bindings: Vec::new(),
            queues: HashMap::new(),
            live: HashSet::new(),
            next_connection: 1,
            next_seq: 1,
            next_tag: 1,
            accepting: true,
        }
    }
}

impl BrokerState {
    /// Return every message held by `connection` to the front of its queue.
    fn release(&mut self, connection: u64) {
        for queue in self.queues.values_mut() {
            let mut orphaned: Vec<Message> = Vec::new();
            queue.unacked.retain(|_, (owner, msg)| {
                if *owner == connection {
                    orphaned.push(msg.clone());
                    false
                } else {
                    true
                }
            });
            // Highest seq first so the oldest ends up at the front.
            orphaned.sort_by_key(|m| std::cmp::Reverse(m.seq));
            for msg in orphaned {
                queue.ready.push_front(msg);
            }
        }
    }
}

/// Shared broker; clone it to hand the same broker to several services.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, BrokerState>, TransportError> {
        lock(&self.state)
    }

    /// Drop every live connection; their unacked messages become ready again.
    pub fn sever_connections(&self) {
        if let Ok(mut state) = self.lock() {
            let live: Vec<u64> = state.live.drain().collect();
            for connection in live {
                state.release(connection);
            }
        }
    }

    /// Refuse (or accept again) new connections.
    pub fn refuse_connections(&self, refuse: bool) {
        if let Ok(mut state) = self.lock() {
            state.accepting = !refuse;
        }
    }

    /// Messages waiting to be fetched from `queue`.
    pub fn ready_count(&self, queue: &str) -> usize {
        self.lock()
            .ok()
            .and_then(|s| s.queues.get(queue).map(|q| q.ready.len()))
            .unwrap_or(0)
    }

    /// Messages fetched from `queue` but not yet acknowledged.
    pub fn unacked_count(&self, queue: &str) -> usize {
        self.lock()
            .ok()
            .and_then(|s| s.queues.get(queue).map(|q| q.unacked.len()))
            .unwrap_or(0)
    }

    pub fn live_connections(&self) -> usize {
        self.lock().map(|s| s.live.len()).unwrap_or(0)
    }
}

impl Connector for InMemoryBroker {
    type Transport = InMemoryTransport;

    fn connect(&self) -> Result<Self::Transport, TransportError> {
        let mut state = self.lock()?;
        if !state.accepting {
            return Err(TransportError::ConnectionRefused(
                "in-memory broker is refusing connections".to_string(),
            ));
        }
        let connection = state.next_connection;
        state.next_connection += 1;
        state.live.insert(connection);

        Ok(InMemoryTransport {
            state: Arc::clone(&self.state),
            connection,
        })
    }

    fn describe(&self) -> String {
        "memory://".to_string()
    }
}

/// One channel into an `InMemoryBroker`. Dropping it closes the channel.
#[derive(Debug)]
pub struct InMemoryTransport {
    state: Arc<Mutex<BrokerState>>,
    connection: u64,
}

impl InMemoryTransport {
    fn live_state(&self) -> Result<MutexGuard<'_, BrokerState>, TransportError> {
        let state = lock(&self.state)?;
        if !state.live.contains(&self.connection) {
            return Err(TransportError::ConnectionLost(format!(
                "connection {} was closed by the broker",
                self.connection
            )));
        }
        Ok(state)
    }

    fn settle(&mut self, delivery: &Delivery) -> Result<Message, TransportError> {
        let mut state = self.live_state()?;
        let queue = state
            .queues
            .get_mut(&delivery.queue)
            .ok_or_else(|| TransportError::Protocol(format!("no queue {}", delivery.queue)))?;

        match queue.unacked.remove(delivery.tag.as_str()) {
            Some((owner, msg)) if owner == self.connection => Ok(msg),
            Some(other) => {
                queue.unacked.insert(delivery.tag.as_str().to_string(), other);
                Err(TransportError::Protocol(format!(
                    "delivery {} belongs to another channel",
                    delivery.tag
                )))
            }
            None => Err(TransportError::Protocol(format!(
                "unknown delivery tag {}",
                delivery.tag
            ))),
        }
    }
}

impl Transport for InMemoryTransport {
    fn declare_exchange(&mut self, exchange: &str) -> Result<(), TransportError> {
        let mut state = self.live_state()?;
        state.exchanges.insert(exchange.to_string());
        Ok(())
    }

    fn publish(&mut self, exchange: &str, routing_key: &str, body: &[u8]) -> Result<(), TransportError> {
        let mut state = self.live_state()?;
        if !state.exchanges.contains(exchange) {
            return Err(TransportError::Protocol(format!("no exchange {exchange}")));
        }

        let targets: HashSet<String> = state
            .bindings
            .iter()
            .filter(|b| b.exchange == exchange && topic::matches(&b.pattern, routing_key))
            .map(|b| b.queue.clone())
            .collect();

        // Unroutable messages are dropped, as a topic exchange does.
        for queue in targets {
            let seq = state.next_seq;
            state.next_seq += 1;
            state.queues.entry(queue).or_default().ready.push_back(Message {
                seq,
                topic: routing_key.to_string(),
                body: body.to_vec(),
                delivery_count: 0,
            });
        }
        Ok(())
    }

    fn bind_queue(&mut self, exchange: &str, queue: &str, pattern: &str) -> Result<(), TransportError> {
        topic::validate_pattern(pattern).map_err(|e| TransportError::Protocol(e.to_string()))?;

        let mut state = self.live_state()?;
        if !state.exchanges.contains(exchange) {
            return Err(TransportError::Protocol(format!("no exchange {exchange}")));
        }
        state.queues.entry(queue.to_string()).or_default();

        let exists = state
            .bindings
            .iter()
            .any(|b| b.exchange == exchange && b.queue == queue && b.pattern == pattern);
        if !exists {
            state.bindings.push(Binding {
                exchange: exchange.to_string(),
                queue: queue.to_string(),
                pattern: pattern.to_string(),
            });
        }
        Ok(())
    }

    fn fetch(&mut self, queue: &str, max: usize) -> Result<Vec<Delivery>, TransportError> {
        let connection = self.connection;
        let mut state = self.live_state()?;
        let mut tags = Vec::with_capacity(max);
        for _ in 0..max {
            tags.push(state.next_tag);
            state.next_tag += 1;
        }

        let q = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| TransportError::Protocol(format!("no queue {queue}")))?;

        let mut out = Vec::new();
        for tag in tags {
            let Some(mut msg) = q.ready.pop_front() else {
                break;
            };
            msg.delivery_count += 1;
            let tag = tag.to_string();
            out.push(Delivery {
                tag: DeliveryTag::new(tag.clone()),
                queue: queue.to_string(),
                topic: msg.topic.clone(),
                body: msg.body.clone(),
                delivery_count: msg.delivery_count,
            });
            q.unacked.insert(tag, (connection, msg));
        }
        Ok(out)
    }

    fn ack(&mut self, delivery: &Delivery) -> Result<(), TransportError> {
        self.settle(delivery).map(|_| ())
    }

    fn reject(&mut self, delivery: &Delivery, requeue: bool) -> Result<(), TransportError> {
        let msg = self.settle(delivery)?;
        if requeue {
            let mut state = self.live_state()?;
            if let Some(q) = state.queues.get_mut(&delivery.queue) {
                q.ready.push_front(msg);
            }
        }
        Ok(())
    }
}

impl Drop for InMemoryTransport {
    fn drop(&mut self) {
        if let Ok(mut state) = lock(&self.state) {
            if state.live.remove(&self.connection) {
                state.release(self.connection);
            }
        }
    }
}

fn lock(state: &Mutex<BrokerState>) -> Result<MutexGuard<'_, BrokerState>, TransportError> {
    state
        .lock()
        .map_err(|_| TransportError::Protocol("in-memory broker state poisoned".to_string()))
}
