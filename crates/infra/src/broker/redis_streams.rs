//! Redis Streams transport (durable, at-least-once delivery).
//!
//! Maps the topic-exchange model onto Redis Streams:
//! - **Stream key**: `<exchange>:<topic>` (one stream per topic)
//! - **Queue**: a consumer group on every stream the queue is bound to
//! - **Consumer**: one named consumer per process inside each group
//! - **Unacked**: the group's pending entries list (PEL)
//!
//! Only exact topic bindings are supported; Redis has no server-side topic
//! routing, so wildcard patterns are rejected with `TransportError::Unsupported`.
//!
//! A rejected-with-requeue delivery is left pending and re-claimed by the next
//! fetch. Entries pending on another consumer for longer than the pending
//! timeout are claimed as well, which covers consumers that crashed mid-handle.

use std::collections::HashMap;
use std::time::Duration;

use tracing::{debug, instrument};

use postrelay_events::{topic, Connector, Delivery, DeliveryTag, Transport, TransportError};

/// Entries idle on another consumer longer than this are claimed.
const DEFAULT_PENDING_TIMEOUT: Duration = Duration::from_secs(60);

const FIELD_TOPIC: &str = "topic";
const FIELD_BODY: &str = "body";

#[derive(Debug, Clone)]
pub struct RedisStreamsConnector {
    client: redis::Client,
    url: String,
    consumer: String,
    pending_timeout: Duration,
}

impl RedisStreamsConnector {
    /// `consumer` names this process inside every consumer group it joins.
    pub fn new(url: impl Into<String>, consumer: impl Into<String>) -> Result<Self, TransportError> {
        let url = url.into();
        let client = redis::Client::open(url.as_str())
            .map_err(|e| TransportError::ConnectionRefused(e.to_string()))?;
        Ok(Self {
            client,
            url,
            consumer: consumer.into(),
            pending_timeout: DEFAULT_PENDING_TIMEOUT,
        })
    }

    pub fn with_pending_timeout(mut self, timeout: Duration) -> Self {
        self.pending_timeout = timeout;
        self
    }
}

impl Connector for RedisStreamsConnector {
    type Transport = RedisStreamsTransport;

    fn connect(&self) -> Result<Self::Transport, TransportError> {
        let mut conn = self
            .client
            .get_connection()
            .map_err(|e| TransportError::ConnectionRefused(e.to_string()))?;
        let _: String = redis::cmd("PING")
            .query(&mut conn)
            .map_err(|e| TransportError::ConnectionRefused(e.to_string()))?;

        Ok(RedisStreamsTransport {
            conn,
            consumer: self.consumer.clone(),
            pending_timeout: self.pending_timeout,
            bindings: HashMap::new(),
        })
    }

    fn describe(&self) -> String {
        self.url.clone()
    }
}

pub struct RedisStreamsTransport {
    conn: redis::Connection,
    consumer: String,
    pending_timeout: Duration,
    /// queue (consumer group) -> bound stream keys
    bindings: HashMap<String, Vec<String>>,
}

impl core::fmt::Debug for RedisStreamsTransport {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RedisStreamsTransport")
            .field("consumer", &self.consumer)
            .field("bindings", &self.bindings)
            .finish()
    }
}

/// One stream entry: id plus decoded field map.
struct StreamEntry {
    id: String,
    fields: HashMap<String, Vec<u8>>,
}

fn stream_key(exchange: &str, topic: &str) -> String {
    format!("{exchange}:{topic}")
}

fn map_err(e: redis::RedisError) -> TransportError {
    if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout() {
        TransportError::ConnectionLost(e.to_string())
    } else {
        TransportError::Protocol(e.to_string())
    }
}

fn encode_tag(stream: &str, id: &str) -> DeliveryTag {
    DeliveryTag::new(format!("{stream}|{id}"))
}

fn decode_tag(tag: &DeliveryTag) -> Result<(&str, &str), TransportError> {
    tag.as_str()
        .rsplit_once('|')
        .ok_or_else(|| TransportError::Protocol(format!("foreign delivery tag {tag}")))
}

fn bytes_of(v: &redis::Value) -> Option<Vec<u8>> {
    match v {
        redis::Value::Data(d) => Some(d.clone()),
        redis::Value::Status(s) => Some(s.as_bytes().to_vec()),
        _ => None,
    }
}

/// Parse `[[id, [k, v, ...]], ...]`. Nil entries (deleted while pending) are skipped.
fn parse_entries(value: &redis::Value) -> Vec<StreamEntry> {
    let redis::Value::Bulk(items) = value else {
        return Vec::new();
    };

    let mut out = Vec::with_capacity(items.len());
    for item in items {
        let redis::Value::Bulk(parts) = item else {
            continue;
        };
        let (Some(id), Some(redis::Value::Bulk(raw_fields))) =
            (parts.first().and_then(bytes_of), parts.get(1))
        else {
            continue;
        };

        let mut fields = HashMap::new();
        for pair in raw_fields.chunks(2) {
            if let [k, v] = pair {
                if let (Some(k), Some(v)) = (bytes_of(k), bytes_of(v)) {
                    fields.insert(String::from_utf8_lossy(&k).into_owned(), v);
                }
            }
        }
        out.push(StreamEntry {
            id: String::from_utf8_lossy(&id).into_owned(),
            fields,
        });
    }
    out
}

/// Parse an XREADGROUP reply: `[[stream, entries], ...]` or nil.
fn parse_read_reply(value: &redis::Value) -> Vec<StreamEntry> {
    let redis::Value::Bulk(streams) = value else {
        return Vec::new();
    };
    streams
        .iter()
        .filter_map(|s| match s {
            redis::Value::Bulk(parts) => parts.get(1).map(parse_entries),
            _ => None,
        })
        .flatten()
        .collect()
}

impl RedisStreamsTransport {
    fn to_delivery(&self, queue: &str, stream: &str, entry: StreamEntry, delivery_count: u32) -> Delivery {
        let topic = entry
            .fields
            .get(FIELD_TOPIC)
            .map(|t| String::from_utf8_lossy(t).into_owned())
            .unwrap_or_default();
        let body = entry.fields.get(FIELD_BODY).cloned().unwrap_or_default();
        Delivery {
            tag: encode_tag(stream, &entry.id),
            queue: queue.to_string(),
            topic,
            body,
            delivery_count,
        }
    }

    /// Pending entries for `group` worth claiming: our own (requeued or left by a
    /// previous run under the same consumer name) and anything idle past the timeout.
    fn claimable(&mut self, stream: &str, group: &str, count: usize) -> Result<Vec<(String, u32)>, TransportError> {
        let own: Vec<(String, String, u64, u64)> = redis::cmd("XPENDING")
            .arg(stream)
            .arg(group)
            .arg("-")
            .arg("+")
            .arg(count)
            .arg(&self.consumer)
            .query(&mut self.conn)
            .map_err(map_err)?;

        let idle: Vec<(String, String, u64, u64)> = redis::cmd("XPENDING")
            .arg(stream)
            .arg(group)
            .arg("IDLE")
            .arg(self.pending_timeout.as_millis() as u64)
            .arg("-")
            .arg("+")
            .arg(count)
            .query(&mut self.conn)
            .map_err(map_err)?;

        let mut ids: Vec<(String, u32)> = Vec::new();
        for (id, _, _, times) in own.into_iter().chain(idle) {
            if !ids.iter().any(|(seen, _)| *seen == id) {
                ids.push((id, times as u32));
            }
        }
        ids.sort_by(|a, b| a.0.cmp(&b.0));
        ids.truncate(count);
        Ok(ids)
    }

    fn claim(
        &mut self,
        queue: &str,
        stream: &str,
        pending: Vec<(String, u32)>,
    ) -> Result<Vec<Delivery>, TransportError> {
        if pending.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<&str> = pending.iter().map(|(id, _)| id.as_str()).collect();
        let reply: redis::Value = redis::cmd("XCLAIM")
            .arg(stream)
            .arg(queue)
            .arg(&self.consumer)
            .arg(0)
            .arg(&ids[..])
            .query(&mut self.conn)
            .map_err(map_err)?;

        let counts: HashMap<&str, u32> = pending.iter().map(|(id, n)| (id.as_str(), *n)).collect();
        let entries = parse_entries(&reply);
        Ok(entries
            .into_iter()
            .map(|entry| {
                let prior = counts.get(entry.id.as_str()).copied().unwrap_or(1);
                self.to_delivery(queue, stream, entry, prior.saturating_add(1))
            })
            .collect())
    }
}

impl Transport for RedisStreamsTransport {
    fn declare_exchange(&mut self, _exchange: &str) -> Result<(), TransportError> {
        // Streams are created on bind (MKSTREAM) or first XADD.
        Ok(())
    }

    #[instrument(skip(self, body), fields(bytes = body.len()), err)]
    fn publish(&mut self, exchange: &str, topic: &str, body: &[u8]) -> Result<(), TransportError> {
        let _: String = redis::cmd("XADD")
            .arg(stream_key(exchange, topic))
            .arg("*")
            .arg(FIELD_TOPIC)
            .arg(topic)
            .arg(FIELD_BODY)
            .arg(body)
            .query(&mut self.conn)
            .map_err(map_err)?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    fn bind_queue(&mut self, exchange: &str, queue: &str, pattern: &str) -> Result<(), TransportError> {
        topic::validate_pattern(pattern).map_err(|e| TransportError::Unsupported(e.to_string()))?;
        if !topic::is_exact(pattern) {
            return Err(TransportError::Unsupported(format!(
                "redis streams transport cannot bind wildcard pattern {pattern:?}"
            )));
        }

        let stream = stream_key(exchange, pattern);
        // "$": a new group only sees entries published after it was created.
        let created: redis::RedisResult<String> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&stream)
            .arg(queue)
            .arg("$")
            .arg("MKSTREAM")
            .query(&mut self.conn);
        match created {
            Ok(_) => debug!(stream = %stream, group = queue, "consumer group created"),
            Err(e) if e.code() == Some("BUSYGROUP") => {}
            Err(e) => return Err(map_err(e)),
        }

        let streams = self.bindings.entry(queue.to_string()).or_default();
        if !streams.contains(&stream) {
            streams.push(stream);
        }
        Ok(())
    }

    fn fetch(&mut self, queue: &str, max: usize) -> Result<Vec<Delivery>, TransportError> {
        let streams = self.bindings.get(queue).cloned().unwrap_or_default();
        let mut out = Vec::new();

        for stream in &streams {
            if out.len() >= max {
                break;
            }
            let pending = self.claimable(stream, queue, max - out.len())?;
            out.extend(self.claim(queue, stream, pending)?);
        }

        for stream in &streams {
            if out.len() >= max {
                break;
            }
            let reply: redis::Value = redis::cmd("XREADGROUP")
                .arg("GROUP")
                .arg(queue)
                .arg(&self.consumer)
                .arg("COUNT")
                .arg(max - out.len())
                .arg("STREAMS")
                .arg(stream)
                .arg(">")
                .query(&mut self.conn)
                .map_err(map_err)?;
            for entry in parse_read_reply(&reply) {
                out.push(self.to_delivery(queue, stream, entry, 1));
            }
        }

        Ok(out)
    }

    fn ack(&mut self, delivery: &Delivery) -> Result<(), TransportError> {
        let (stream, id) = decode_tag(&delivery.tag)?;
        let _: u64 = redis::cmd("XACK")
            .arg(stream)
            .arg(&delivery.queue)
            .arg(id)
            .query(&mut self.conn)
            .map_err(map_err)?;
        Ok(())
    }

    fn reject(&mut self, delivery: &Delivery, requeue: bool) -> Result<(), TransportError> {
        if requeue {
            // Stays in the PEL; the next fetch claims it again.
            decode_tag(&delivery.tag)?;
            Ok(())
        } else {
            self.ack(delivery)
        }
    }
}
