//! The `QueueClient` contract and its Redis-backed implementation
//!
//! A plain Redis list gives FIFO ordering but none of the pop-receipt or
//! invisibility-window semantics the poll loop needs, so this adapter
//! layers them on top of three keys per queue:
//!
//! - `queue:{name}:pending` — a list of message ids waiting to be delivered.
//! - `queue:{name}:processing` — a sorted set of ids currently checked out,
//!   scored by invisibility deadline (unix millis). An id whose score has
//!   passed is implicitly redelivered by being pushed back onto `pending`.
//! - `queue:{name}:msg:{id}` — a hash holding `payload`, `dequeue_count`,
//!   `inserted_at`, and the current `receipt`.
//!
//! Every compound operation (reclaim-then-pop, receipt-checked visibility
//! extension, receipt-checked delete) runs as a single Lua script so it is
//! atomic with respect to other listeners sharing the same queue.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};

use crate::error::{ListenerError, ListenerResult};

/// A message dequeued from the queue service.
#[derive(Debug, Clone)]
pub struct Message {
    pub id: String,
    pub payload: Vec<u8>,
    pub dequeue_count: u32,
    pub inserted_at: DateTime<Utc>,
    /// Opaque token authorizing visibility extension and deletion. Empty
    /// for messages obtained via [`QueueClient::peek`], which does not
    /// check the message out.
    pub receipt: String,
}

/// Queue-level attributes, as returned by [`QueueClient::fetch_attributes`].
#[derive(Debug, Clone, Copy)]
pub struct QueueAttributes {
    pub approximate_count: u64,
}

/// The external queue-service contract the poll loop, dispatcher, and
/// scale monitor consume. Named verbatim after the interfaces the core is
/// specified against; a host may substitute any backend that honors this
/// trait without touching the rest of the crate.
#[async_trait]
pub trait QueueClient: Send + Sync {
    /// Whether the target queue currently exists and can serve requests.
    async fn exists(&self) -> ListenerResult<bool>;

    /// Fetch up to `count` messages, each granted `visibility` invisibility
    /// from now. May return fewer than `count`, or none.
    async fn get_messages(&self, count: u32, visibility: Duration) -> ListenerResult<Vec<Message>>;

    /// Extend a checked-out message's invisibility window by `new_visibility`
    /// from now. Fails with [`ListenerError::MessageGone`] if the receipt no
    /// longer matches (message deleted, or already redelivered).
    async fn update_message_visibility(
        &self,
        msg: &Message,
        new_visibility: Duration,
    ) -> ListenerResult<()>;

    /// Permanently remove a message after successful processing.
    async fn delete_message(&self, msg: &Message) -> ListenerResult<()>;

    /// Insert a new message (used for poison routing; `poison_queue` names
    /// the sibling queue to target).
    async fn add_message(&self, poison_queue: &str, payload: &[u8]) -> ListenerResult<()>;

    /// Queue-level attributes used by the scale monitor.
    async fn fetch_attributes(&self) -> ListenerResult<QueueAttributes>;

    /// Look at the oldest pending message without checking it out. Returns
    /// `None` if the queue is empty.
    async fn peek(&self) -> ListenerResult<Option<Message>>;

    /// The name this client was constructed for.
    fn queue_name(&self) -> &str;
}

/// Redis-backed [`QueueClient`].
#[derive(Clone)]
pub struct RedisQueueClient {
    conn: ConnectionManager,
    queue_name: String,
}

fn pending_key(queue: &str) -> String {
    format!("queue:{queue}:pending")
}

fn processing_key(queue: &str) -> String {
    format!("queue:{queue}:processing")
}

fn msg_prefix(queue: &str) -> String {
    format!("queue:{queue}:msg:")
}

fn provisioned_key(queue: &str) -> String {
    format!("queue:{queue}:meta:provisioned")
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Translate a raw Redis error into the listener's behavioral
/// classification. Connection-level failures (refused, timed out, I/O) are
/// treated as transient server-side errors so the poll loop backs off and
/// retries instead of faulting the listener; anything else is wrapped
/// as-is and propagates as fatal, per the "Storage-other" error kind.
fn classify_redis_error(err: redis::RedisError) -> ListenerError {
    use redis::ErrorKind;

    if err.is_timeout() || err.is_connection_dropped() || err.is_io_error() {
        return ListenerError::server_side(err.to_string());
    }

    match err.kind() {
        ErrorKind::IoError | ErrorKind::TryAgain | ErrorKind::ClusterDown => {
            ListenerError::server_side(err.to_string())
        }
        _ => ListenerError::Redis(err),
    }
}

impl RedisQueueClient {
    pub fn new(conn: ConnectionManager, queue_name: impl Into<String>) -> Self {
        Self {
            conn,
            queue_name: queue_name.into(),
        }
    }

    /// Mark the queue as provisioned. Hosts call this once at startup
    /// (or whenever an external system declares the queue); `exists()`
    /// reflects this marker rather than inferring existence from whether
    /// the underlying Redis keys happen to have been touched yet.
    pub async fn ensure_provisioned(&self) -> ListenerResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .set(provisioned_key(&self.queue_name), "1")
            .await
            .map_err(classify_redis_error)?;
        Ok(())
    }

    /// Remove the provisioning marker, simulating the queue being deleted
    /// out from under the listener (used in tests and for operational
    /// teardown).
    pub async fn deprovision(&self) -> ListenerResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .del(provisioned_key(&self.queue_name))
            .await
            .map_err(classify_redis_error)?;
        Ok(())
    }
}

#[async_trait]
impl QueueClient for RedisQueueClient {
    async fn exists(&self) -> ListenerResult<bool> {
        let mut conn = self.conn.clone();
        let exists: bool = conn
            .exists(provisioned_key(&self.queue_name))
            .await
            .map_err(classify_redis_error)?;
        Ok(exists)
    }

    async fn get_messages(&self, count: u32, visibility: Duration) -> ListenerResult<Vec<Message>> {
        if count == 0 {
            return Ok(Vec::new());
        }

        let receipts: Vec<String> = (0..count)
            .map(|_| uuid::Uuid::new_v4().to_string())
            .collect();

        let mut invocation = Script::new(RECLAIM_AND_POP_SCRIPT)
            .prepare_invoke()
            .key(pending_key(&self.queue_name))
            .key(processing_key(&self.queue_name))
            .arg(msg_prefix(&self.queue_name))
            .arg(now_millis())
            .arg(visibility.as_millis() as i64);
        for receipt in &receipts {
            invocation = invocation.arg(receipt.as_str());
        }

        let mut conn = self.conn.clone();
        let raw: Vec<(String, Vec<u8>, i64, String, String)> = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(classify_redis_error)?;

        raw.into_iter()
            .map(|(id, payload, dequeue_count, inserted_at, receipt)| {
                let inserted_at = inserted_at
                    .parse::<i64>()
                    .ok()
                    .and_then(|ms| DateTime::<Utc>::from_timestamp_millis(ms))
                    .unwrap_or_else(Utc::now);
                Ok(Message {
                    id,
                    payload,
                    dequeue_count: dequeue_count.max(0) as u32,
                    inserted_at,
                    receipt,
                })
            })
            .collect()
    }

    async fn update_message_visibility(
        &self,
        msg: &Message,
        new_visibility: Duration,
    ) -> ListenerResult<()> {
        let invocation = Script::new(UPDATE_VISIBILITY_SCRIPT)
            .key(processing_key(&self.queue_name))
            .arg(msg_prefix(&self.queue_name))
            .arg(msg.id.as_str())
            .arg(msg.receipt.as_str())
            .arg(now_millis())
            .arg(new_visibility.as_millis() as i64);

        let mut conn = self.conn.clone();
        let ok: i64 = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(classify_redis_error)?;

        if ok == 1 {
            Ok(())
        } else {
            Err(ListenerError::message_gone(msg.id.clone()))
        }
    }

    async fn delete_message(&self, msg: &Message) -> ListenerResult<()> {
        let invocation = Script::new(DELETE_SCRIPT)
            .key(processing_key(&self.queue_name))
            .arg(msg_prefix(&self.queue_name))
            .arg(msg.id.as_str())
            .arg(msg.receipt.as_str());

        let mut conn = self.conn.clone();
        let ok: i64 = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(classify_redis_error)?;

        if ok == 1 {
            Ok(())
        } else {
            Err(ListenerError::message_gone(msg.id.clone()))
        }
    }

    async fn add_message(&self, poison_queue: &str, payload: &[u8]) -> ListenerResult<()> {
        let id = uuid::Uuid::new_v4().to_string();
        let invocation = Script::new(ADD_MESSAGE_SCRIPT)
            .key(pending_key(poison_queue))
            .arg(msg_prefix(poison_queue))
            .arg(id)
            .arg(payload)
            .arg(now_millis());

        let mut conn = self.conn.clone();
        let _: i64 = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(classify_redis_error)?;
        Ok(())
    }

    async fn fetch_attributes(&self) -> ListenerResult<QueueAttributes> {
        let mut conn = self.conn.clone();
        let pending_len: u64 = conn
            .llen(pending_key(&self.queue_name))
            .await
            .map_err(classify_redis_error)?;
        let processing_len: u64 = conn
            .zcard(processing_key(&self.queue_name))
            .await
            .map_err(classify_redis_error)?;
        Ok(QueueAttributes {
            approximate_count: pending_len + processing_len,
        })
    }

    async fn peek(&self) -> ListenerResult<Option<Message>> {
        let mut conn = self.conn.clone();
        let oldest_id: Option<String> = conn
            .lindex(pending_key(&self.queue_name), -1)
            .await
            .map_err(classify_redis_error)?;

        let Some(id) = oldest_id else {
            return Ok(None);
        };

        let hash_key = format!("{}{}", msg_prefix(&self.queue_name), id);
        let fields: Vec<Option<String>> = redis::cmd("HMGET")
            .arg(&hash_key)
            .arg("payload")
            .arg("dequeue_count")
            .arg("inserted_at")
            .query_async(&mut conn)
            .await
            .map_err(classify_redis_error)?;

        let Some(payload) = fields.first().cloned().flatten() else {
            return Ok(None);
        };
        let dequeue_count = fields
            .get(1)
            .cloned()
            .flatten()
            .and_then(|s| s.parse::<u32>().ok())
            .unwrap_or(0);
        let inserted_at = fields
            .get(2)
            .cloned()
            .flatten()
            .and_then(|s| s.parse::<i64>().ok())
            .and_then(DateTime::<Utc>::from_timestamp_millis)
            .unwrap_or_else(Utc::now);

        Ok(Some(Message {
            id,
            payload: payload.into_bytes(),
            dequeue_count,
            inserted_at,
            receipt: String::new(),
        }))
    }

    fn queue_name(&self) -> &str {
        &self.queue_name
    }
}

const RECLAIM_AND_POP_SCRIPT: &str = r#"
local pending_key = KEYS[1]
local processing_key = KEYS[2]
local msg_prefix = ARGV[1]
local now = tonumber(ARGV[2])
local visibility_ms = tonumber(ARGV[3])

local expired = redis.call('ZRANGEBYSCORE', processing_key, '-inf', now)
for _, id in ipairs(expired) do
    redis.call('ZREM', processing_key, id)
    redis.call('RPUSH', pending_key, id)
end

local results = {}
for i = 4, #ARGV do
    local id = redis.call('RPOP', pending_key)
    if not id then
        break
    end
    local hash_key = msg_prefix .. id
    if redis.call('EXISTS', hash_key) == 1 then
        local dequeue_count = redis.call('HINCRBY', hash_key, 'dequeue_count', 1)
        local receipt = ARGV[i]
        redis.call('HSET', hash_key, 'receipt', receipt)
        redis.call('ZADD', processing_key, now + visibility_ms, id)
        local payload = redis.call('HGET', hash_key, 'payload')
        local inserted_at = redis.call('HGET', hash_key, 'inserted_at')
        table.insert(results, {id, payload, dequeue_count, inserted_at, receipt})
    end
end

return results
"#;

const UPDATE_VISIBILITY_SCRIPT: &str = r#"
local hash_key = ARGV[1] .. ARGV[2]
local current_receipt = redis.call('HGET', hash_key, 'receipt')
if (not current_receipt) or current_receipt ~= ARGV[3] then
    return 0
end
redis.call('ZADD', KEYS[1], tonumber(ARGV[4]) + tonumber(ARGV[5]), ARGV[2])
return 1
"#;

const DELETE_SCRIPT: &str = r#"
local hash_key = ARGV[1] .. ARGV[2]
local current_receipt = redis.call('HGET', hash_key, 'receipt')
if (not current_receipt) or current_receipt ~= ARGV[3] then
    return 0
end
redis.call('ZREM', KEYS[1], ARGV[2])
redis.call('DEL', hash_key)
return 1
"#;

const ADD_MESSAGE_SCRIPT: &str = r#"
local hash_key = ARGV[1] .. ARGV[2]
redis.call('HSET', hash_key, 'payload', ARGV[3], 'dequeue_count', 0, 'inserted_at', ARGV[4], 'receipt', '')
redis.call('LPUSH', KEYS[1], ARGV[2])
return 1
"#;
