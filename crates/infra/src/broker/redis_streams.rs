//! Redis Streams-backed broker (durable, at-least-once delivery).
//!
//! Each queue is one Redis stream with one consumer group:
//! - **Publish**: `XADD <prefix><queue> NOMKSTREAM * body <bytes>`; a nil reply
//!   means the queue does not exist and the message is dropped (unroutable)
//! - **Receive**: idle pending entries of dead consumers are reclaimed first
//!   (`XPENDING` + `XCLAIM`, flagged as redelivered), then `XREADGROUP ... >`
//! - **Ack**: `XACK` + `XDEL`, so the stream only holds unfinished work
//! - **Requeue**: the body is re-appended with `redelivered 1`, then the original
//!   entry is acked
//!
//! ## Exclusive queues
//!
//! Redis has no auto-delete queues. An exclusive queue is a stream with a unique
//! generated name that its owner removes with `DEL` ([`Broker::delete_queue`]).
//!
//! ## Redelivery after consumer loss
//!
//! Entries delivered to a consumer that never acks stay pending in the group and
//! are claimed by another consumer once idle for `pending_timeout`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, instrument, warn};

use courier_core::ConsumerId;
use courier_messaging::{Broker, BrokerError, Consumer, Delivery, DeliveryTag, QueueSpec};

/// Default stream key prefix
const DEFAULT_KEY_PREFIX: &str = "courier:";

/// Default consumer group
const DEFAULT_GROUP: &str = "courier";

/// Default pending entry timeout (entries idle longer than this are redelivered)
const DEFAULT_PENDING_TIMEOUT: Duration = Duration::from_secs(30);

const BODY_FIELD: &str = "body";
const REDELIVERED_FIELD: &str = "redelivered";

#[derive(Debug, Clone)]
pub struct RedisStreamsBroker {
    client: Arc<redis::Client>,
    key_prefix: String,
    group: String,
    pending_timeout: Duration,
}

impl RedisStreamsBroker {
    /// Create a broker for the Redis server at `redis_url`
    /// (e.g. `"redis://localhost:6379"`).
    pub fn new(redis_url: impl AsRef<str>) -> Result<Self, BrokerError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        Ok(Self {
            client: Arc::new(client),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            group: DEFAULT_GROUP.to_string(),
            pending_timeout: DEFAULT_PENDING_TIMEOUT,
        })
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    pub fn with_pending_timeout(mut self, timeout: Duration) -> Self {
        self.pending_timeout = timeout;
        self
    }

    fn stream_key(&self, queue: &str) -> String {
        format!("{}{}", self.key_prefix, queue)
    }

    fn connection(&self) -> Result<redis::Connection, BrokerError> {
        self.client
            .get_connection()
            .map_err(|e| BrokerError::Connection(e.to_string()))
    }

    /// Ensure the stream and its consumer group exist (idempotent).
    fn ensure_group(&self, conn: &mut redis::Connection, key: &str) -> Result<(), BrokerError> {
        let created: redis::RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(key)
            .arg(&self.group)
            .arg("0")
            .arg("MKSTREAM")
            .query(conn);

        match created {
            Ok(()) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(map_redis_error(e, key)),
        }
    }
}

impl Broker for RedisStreamsBroker {
    fn declare_queue(&self, spec: &QueueSpec) -> Result<String, BrokerError> {
        let name = match spec {
            QueueSpec::Durable { name } => name.clone(),
            QueueSpec::Exclusive => format!("reply-{}", uuid::Uuid::new_v4().simple()),
        };

        let mut conn = self.connection()?;
        self.ensure_group(&mut conn, &self.stream_key(&name))?;
        Ok(name)
    }

    fn delete_queue(&self, queue: &str) -> Result<(), BrokerError> {
        let key = self.stream_key(queue);
        let mut conn = self.connection()?;
        let _: i64 = redis::cmd("DEL")
            .arg(&key)
            .query(&mut conn)
            .map_err(|e| map_redis_error(e, queue))?;
        Ok(())
    }

    #[instrument(skip(self, body), fields(bytes = body.len()), err)]
    fn publish(&self, queue: &str, body: Vec<u8>) -> Result<(), BrokerError> {
        let key = self.stream_key(queue);
        let mut conn = self.connection()?;

        let id: Option<String> = redis::cmd("XADD")
            .arg(&key)
            .arg("NOMKSTREAM")
            .arg("*")
            .arg(BODY_FIELD)
            .arg(body)
            .query(&mut conn)
            .map_err(|e| map_redis_error(e, queue))?;

        match id {
            Some(id) => debug!(%id, "entry appended"),
            None => debug!("unroutable publish dropped"),
        }
        Ok(())
    }

    fn consume(&self, queue: &str) -> Result<Box<dyn Consumer>, BrokerError> {
        let key = self.stream_key(queue);
        let mut conn = self.connection()?;

        let exists: i64 = redis::cmd("EXISTS")
            .arg(&key)
            .query(&mut conn)
            .map_err(|e| map_redis_error(e, queue))?;
        if exists == 0 {
            return Err(BrokerError::QueueNotFound(queue.to_string()));
        }

        Ok(Box::new(RedisStreamsConsumer {
            conn,
            queue: queue.to_string(),
            key,
            group: self.group.clone(),
            consumer: format!("consumer-{}", ConsumerId::new()),
            pending_timeout: self.pending_timeout,
            in_flight: HashMap::new(),
        }))
    }
}

/// Consumer on one stream, owning its own connection (`XREADGROUP BLOCK` ties it up).
pub struct RedisStreamsConsumer {
    conn: redis::Connection,
    queue: String,
    key: String,
    group: String,
    consumer: String,
    pending_timeout: Duration,
    in_flight: HashMap<String, Vec<u8>>,
}

impl core::fmt::Debug for RedisStreamsConsumer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RedisStreamsConsumer")
            .field("queue", &self.queue)
            .field("consumer", &self.consumer)
            .field("in_flight", &self.in_flight.len())
            .finish()
    }
}

impl RedisStreamsConsumer {
    /// Claim one entry that has been pending with another consumer for too long.
    fn claim_idle(&mut self) -> Result<Option<Delivery>, BrokerError> {
        let min_idle_ms = self.pending_timeout.as_millis().to_string();

        let pending: redis::Value = redis::cmd("XPENDING")
            .arg(&self.key)
            .arg(&self.group)
            .arg("IDLE")
            .arg(&min_idle_ms)
            .arg("-")
            .arg("+")
            .arg(1)
            .query(&mut self.conn)
            .map_err(|e| map_redis_error(e, &self.queue))?;

        let Some(id) = first_pending_id(&pending) else {
            return Ok(None);
        };

        let claimed: redis::Value = redis::cmd("XCLAIM")
            .arg(&self.key)
            .arg(&self.group)
            .arg(&self.consumer)
            .arg(&min_idle_ms)
            .arg(&id)
            .query(&mut self.conn)
            .map_err(|e| map_redis_error(e, &self.queue))?;

        let entry = match &claimed {
            redis::Value::Bulk(entries) => entries.first().and_then(parse_entry),
            _ => None,
        };

        match entry {
            Some(entry) => {
                debug!(queue = %self.queue, id = %entry.id, "claimed idle entry");
                Ok(Some(self.track(entry, true)))
            }
            None => {
                // Claimed by someone else first, or deleted while pending.
                Ok(None)
            }
        }
    }

    fn read_new(&mut self, timeout: Duration) -> Result<Option<Delivery>, BrokerError> {
        // BLOCK 0 means forever.
        let block_ms = timeout.as_millis().max(1).to_string();

        let reply: redis::Value = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.group)
            .arg(&self.consumer)
            .arg("COUNT")
            .arg(1)
            .arg("BLOCK")
            .arg(&block_ms)
            .arg("STREAMS")
            .arg(&self.key)
            .arg(">")
            .query(&mut self.conn)
            .map_err(|e| map_redis_error(e, &self.queue))?;

        Ok(parse_read_reply(&reply).map(|entry| self.track(entry, false)))
    }

    fn track(&mut self, entry: StreamEntry, claimed: bool) -> Delivery {
        self.in_flight.insert(entry.id.clone(), entry.body.clone());
        Delivery {
            tag: DeliveryTag(entry.id),
            body: entry.body,
            redelivered: claimed || entry.redelivered,
        }
    }

    fn settle(&mut self, tag: &DeliveryTag, requeue_body: Option<&[u8]>) -> Result<(), BrokerError> {
        let mut pipe = redis::pipe();
        pipe.atomic();
        if let Some(body) = requeue_body {
            pipe.cmd("XADD")
                .arg(&self.key)
                .arg("NOMKSTREAM")
                .arg("*")
                .arg(BODY_FIELD)
                .arg(body)
                .arg(REDELIVERED_FIELD)
                .arg("1")
                .ignore();
        }
        pipe.cmd("XACK").arg(&self.key).arg(&self.group).arg(&tag.0);
        pipe.cmd("XDEL").arg(&self.key).arg(&tag.0).ignore();

        let (acked,): (i64,) = pipe
            .query(&mut self.conn)
            .map_err(|e| map_redis_error(e, &self.queue))?;

        if acked == 0 {
            return Err(BrokerError::UnknownDelivery(tag.clone()));
        }
        Ok(())
    }
}

impl Consumer for RedisStreamsConsumer {
    fn queue(&self) -> &str {
        &self.queue
    }

    fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<Delivery>, BrokerError> {
        if let Some(delivery) = self.claim_idle()? {
            return Ok(Some(delivery));
        }
        self.read_new(timeout)
    }

    fn ack(&mut self, tag: &DeliveryTag) -> Result<(), BrokerError> {
        if self.in_flight.remove(&tag.0).is_none() {
            return Err(BrokerError::UnknownDelivery(tag.clone()));
        }
        self.settle(tag, None)
    }

    fn nack(&mut self, tag: &DeliveryTag, requeue: bool) -> Result<(), BrokerError> {
        let Some(body) = self.in_flight.remove(&tag.0) else {
            return Err(BrokerError::UnknownDelivery(tag.clone()));
        };
        if !requeue {
            warn!(queue = %self.queue, %tag, "discarding rejected entry");
        }
        self.settle(tag, requeue.then_some(body.as_slice()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct StreamEntry {
    id: String,
    body: Vec<u8>,
    redelivered: bool,
}

fn map_redis_error(e: redis::RedisError, queue: &str) -> BrokerError {
    if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() {
        BrokerError::Connection(e.to_string())
    } else if e.code() == Some("NOGROUP") {
        BrokerError::QueueNotFound(queue.to_string())
    } else {
        BrokerError::Command(e.to_string())
    }
}

fn as_string(value: &redis::Value) -> Option<String> {
    match value {
        redis::Value::Data(data) => Some(String::from_utf8_lossy(data).into_owned()),
        redis::Value::Status(s) => Some(s.clone()),
        _ => None,
    }
}

/// `XPENDING` extended form: `[[id, consumer, idle_ms, deliveries], ...]`.
fn first_pending_id(reply: &redis::Value) -> Option<String> {
    let redis::Value::Bulk(rows) = reply else {
        return None;
    };
    match rows.first()? {
        redis::Value::Bulk(row) => row.first().and_then(as_string),
        _ => None,
    }
}

/// `XREADGROUP` reply: `[[key, [entry, ...]]]`, or nil on timeout.
fn parse_read_reply(reply: &redis::Value) -> Option<StreamEntry> {
    let redis::Value::Bulk(streams) = reply else {
        return None;
    };
    let redis::Value::Bulk(stream) = streams.first()? else {
        return None;
    };
    let redis::Value::Bulk(entries) = stream.get(1)? else {
        return None;
    };
    entries.first().and_then(parse_entry)
}

/// Stream entry: `[id, [field, value, ...]]`.
///
/// An entry without a body field is still returned, with an empty body, so the
/// consumer rejects it as undecodable and acks it instead of leaving it pending.
fn parse_entry(entry: &redis::Value) -> Option<StreamEntry> {
    let redis::Value::Bulk(parts) = entry else {
        return None;
    };
    let id = as_string(parts.first()?)?;
    let redis::Value::Bulk(fields) = parts.get(1)? else {
        return None;
    };

    let mut body = None;
    let mut redelivered = false;
    for pair in fields.chunks(2) {
        if let [redis::Value::Data(name), redis::Value::Data(value)] = pair {
            match name.as_slice() {
                b"body" => body = Some(value.clone()),
                b"redelivered" => redelivered = value.as_slice() == b"1",
                _ => {}
            }
        }
    }

    let body = body.unwrap_or_else(|| {
        warn!(%id, "stream entry has no body field");
        Vec::new()
    });

    Some(StreamEntry {
        id,
        body,
        redelivered,
    })
}
