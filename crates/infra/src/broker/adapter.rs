//! Process-wide broker channel.
//!
//! `BrokerAdapter` is the single owner of the broker channel. Publishers and
//! consumer runtimes receive it as an `Arc` and never touch the transport
//! directly; every operation goes through one mutex, so publish, fetch and
//! acknowledgment frames are never interleaved on the channel.
//!
//! ## Lifecycle
//!
//! ```text
//! Disconnected --connect()--> Connecting --ok--> Connected
//!      ^                            |                |
//!      +---------- failure ---------+---- channel lost
//! ```
//!
//! - `connect()` is the startup dependency: it retries with backoff and
//!   returns `BrokerError::Unavailable` once attempts are exhausted, at which
//!   point the hosting service must refuse to start.
//! - At runtime a lost channel flips the adapter back to `Disconnected`.
//!   Publishing never reconnects on the caller's thread: it fails fast with
//!   `BrokerError::Disconnected` and the event is dropped. Consumer runtimes
//!   reconnect with backoff and resubscribe; writers schedule a background
//!   reconnect with `spawn_reconnect`.
//! - The transport is opened outside the channel lock and at most one
//!   reconnect runs at a time, so a slow broker never stalls other callers.
//! - Every queue binding ever requested is replayed on reconnect.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use postrelay_events::{Connector, Delivery, EventEnvelope, Transport, TransportError};

use super::backoff::BackoffPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    /// Startup could not reach the broker within the configured attempts.
    #[error("broker {target} unavailable after {attempts} attempts: {last}")]
    Unavailable {
        target: String,
        attempts: u32,
        last: TransportError,
    },

    /// No open channel right now.
    #[error("broker channel is disconnected")]
    Disconnected,

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("failed to encode message: {0}")]
    Encode(String),

    #[error("broker adapter lock poisoned")]
    Poisoned,
}

impl BrokerError {
    pub fn is_disconnect(&self) -> bool {
        match self {
            BrokerError::Disconnected | BrokerError::Unavailable { .. } => true,
            BrokerError::Transport(e) => e.is_connection_error(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct QueueBinding {
    queue: String,
    pattern: String,
}

struct Channel<T> {
    transport: Option<T>,
    state: ConnectionState,
    bindings: Vec<QueueBinding>,
    /// Bumped on every successful (re)connect.
    generation: u64,
}

pub struct BrokerAdapter<C: Connector> {
    connector: C,
    exchange: String,
    backoff: BackoffPolicy,
    channel: Mutex<Channel<C::Transport>>,
    reconnecting: AtomicBool,
}

/// Clears the reconnect flag when the attempt ends, including by panic.
struct ReconnectSlot<'a>(&'a AtomicBool);

impl<'a> ReconnectSlot<'a> {
    fn claim(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for ReconnectSlot<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl<C: Connector> core::fmt::Debug for BrokerAdapter<C> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BrokerAdapter")
            .field("target", &self.connector.describe())
            .field("exchange", &self.exchange)
            .field("state", &self.state())
            .finish()
    }
}

impl<C: Connector> BrokerAdapter<C> {
    /// Create an adapter without connecting; call `connect()` before use.
    pub fn new(connector: C, exchange: impl Into<String>, backoff: BackoffPolicy) -> Self {
        Self {
            connector,
            exchange: exchange.into(),
            backoff,
            channel: Mutex::new(Channel {
                transport: None,
                state: ConnectionState::Disconnected,
                bindings: Vec::new(),
                generation: 0,
            }),
            reconnecting: AtomicBool::new(false),
        }
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn backoff(&self) -> BackoffPolicy {
        self.backoff
    }

    pub fn state(&self) -> ConnectionState {
        self.lock()
            .map(|c| c.state)
            .unwrap_or(ConnectionState::Disconnected)
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// True while some thread is opening a new channel.
    pub fn is_reconnecting(&self) -> bool {
        self.reconnecting.load(Ordering::Acquire)
    }

    /// Connection generation; changes whenever a new channel is opened.
    pub fn generation(&self) -> u64 {
        self.lock().map(|c| c.generation).unwrap_or(0)
    }

    /// Establish the channel, retrying with backoff (startup dependency).
    #[instrument(skip(self), fields(target = %self.connector.describe(), exchange = %self.exchange))]
    pub fn connect(&self) -> Result<(), BrokerError> {
        let attempts = self.backoff.max_attempts.max(1);
        let mut last = None;

        for attempt in 1..=attempts {
            match self.try_connect_once() {
                Ok(()) => return Ok(()),
                Err(BrokerError::Transport(e)) => {
                    warn!(attempt, max_attempts = attempts, error = %e, "broker connect failed");
                    last = Some(e);
                }
                // Another thread is mid-reconnect; check again after the delay.
                Err(BrokerError::Disconnected) => {}
                Err(other) => return Err(other),
            }
            if attempt < attempts {
                thread::sleep(self.backoff.delay(attempt));
            }
        }

        Err(BrokerError::Unavailable {
            target: self.connector.describe(),
            attempts,
            last: last.unwrap_or_else(|| TransportError::ConnectionRefused("no attempt made".into())),
        })
    }

    /// One reconnect attempt without sleeping. No-op when already connected.
    ///
    /// The broker is dialed without holding the channel lock. Returns
    /// `BrokerError::Disconnected` immediately when another reconnect is
    /// already in flight.
    pub fn try_connect_once(&self) -> Result<(), BrokerError> {
        if self.is_connected() {
            return Ok(());
        }
        let Some(_slot) = ReconnectSlot::claim(&self.reconnecting) else {
            return Err(BrokerError::Disconnected);
        };

        let bindings = {
            let mut channel = self.lock()?;
            if channel.transport.is_some() {
                return Ok(());
            }
            channel.state = ConnectionState::Connecting;
            channel.bindings.clone()
        };

        let opened = self.open(&bindings);

        let mut channel = self.lock()?;
        match opened {
            Ok(mut transport) => {
                // Bindings requested while the dial was in flight.
                let late: Vec<QueueBinding> = channel
                    .bindings
                    .iter()
                    .filter(|b| !bindings.contains(b))
                    .cloned()
                    .collect();
                for b in &late {
                    if let Err(e) = transport.bind_queue(&self.exchange, &b.queue, &b.pattern) {
                        channel.state = ConnectionState::Disconnected;
                        return Err(BrokerError::Transport(e));
                    }
                }
                channel.transport = Some(transport);
                channel.state = ConnectionState::Connected;
                channel.generation += 1;
                info!(
                    target_broker = %self.connector.describe(),
                    exchange = %self.exchange,
                    generation = channel.generation,
                    bindings = channel.bindings.len(),
                    "connected to broker"
                );
                Ok(())
            }
            Err(e) => {
                channel.state = ConnectionState::Disconnected;
                Err(BrokerError::Transport(e))
            }
        }
    }

    /// Run one reconnect attempt on a background thread unless one is
    /// already running or the channel is up.
    pub fn spawn_reconnect(self: &Arc<Self>) {
        if self.is_connected() || self.is_reconnecting() {
            return;
        }
        let adapter = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name("broker-reconnect".into())
            .spawn(move || {
                if let Err(e) = adapter.try_connect_once() {
                    warn!(error = %e, "background broker reconnect failed");
                }
            });
        if let Err(e) = spawned {
            warn!(error = %e, "failed to spawn broker reconnect");
        }
    }

    fn open(&self, bindings: &[QueueBinding]) -> Result<C::Transport, TransportError> {
        let mut transport = self.connector.connect()?;
        transport.declare_exchange(&self.exchange)?;
        for b in bindings {
            transport.bind_queue(&self.exchange, &b.queue, &b.pattern)?;
        }
        Ok(transport)
    }

    /// Serialize and route an envelope by its topic. Does not wait for consumers.
    ///
    /// Never reconnects: when the channel is down (or a reconnect is still in
    /// flight) the event is not buffered and `BrokerError::Disconnected` is
    /// returned straight away.
    #[instrument(skip(self, envelope), fields(topic = %envelope.topic(), event_id = %envelope.event_id()))]
    pub fn publish(&self, envelope: &EventEnvelope<JsonValue>) -> Result<(), BrokerError> {
        let body = envelope
            .to_bytes()
            .map_err(|e| BrokerError::Encode(e.to_string()))?;
        let exchange = self.exchange.clone();
        self.with_channel(|t| t.publish(&exchange, envelope.topic(), &body))
    }

    /// Bind `queue` to `pattern`; the binding is replayed after every reconnect.
    pub fn subscribe(&self, queue: &str, pattern: &str) -> Result<(), BrokerError> {
        {
            let mut channel = self.lock()?;
            let binding = QueueBinding {
                queue: queue.to_string(),
                pattern: pattern.to_string(),
            };
            if !channel.bindings.contains(&binding) {
                channel.bindings.push(binding);
            }
        }
        let exchange = self.exchange.clone();
        self.with_channel(|t| t.bind_queue(&exchange, queue, pattern))
    }

    pub fn fetch(&self, queue: &str, max: usize) -> Result<Vec<Delivery>, BrokerError> {
        self.with_channel(|t| t.fetch(queue, max))
    }

    pub fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        self.with_channel(|t| t.ack(delivery))
    }

    pub fn reject(&self, delivery: &Delivery, requeue: bool) -> Result<(), BrokerError> {
        self.with_channel(|t| t.reject(delivery, requeue))
    }

    /// Close the channel; unacked deliveries go back to their queues.
    pub fn disconnect(&self) {
        if let Ok(mut channel) = self.lock() {
            channel.transport = None;
            channel.state = ConnectionState::Disconnected;
        }
    }

    fn with_channel<R>(
        &self,
        op: impl FnOnce(&mut C::Transport) -> Result<R, TransportError>,
    ) -> Result<R, BrokerError> {
        let mut channel = self.lock()?;
        let transport = channel.transport.as_mut().ok_or(BrokerError::Disconnected)?;

        match op(transport) {
            Ok(r) => Ok(r),
            Err(e) if e.is_connection_error() => {
                warn!(error = %e, "broker channel lost");
                channel.transport = None;
                channel.state = ConnectionState::Disconnected;
                Err(BrokerError::Transport(e))
            }
            Err(e) => {
                debug!(error = %e, "broker operation failed");
                Err(BrokerError::Transport(e))
            }
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Channel<C::Transport>>, BrokerError> {
        self.channel.lock().map_err(|_| BrokerError::Poisoned)
    }
}
