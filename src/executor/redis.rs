//! Redis broker and result backend.
//!
//! Lets workers run in separate processes from the request handlers that
//! dispatch to them. Every multi-key mutation is a Lua script so claims,
//! acknowledgements and forward-only status writes stay atomic.
//!
//! # Key Schema
//!
//! | Key Pattern | Type | Purpose |
//! |-------------|------|---------|
//! | `{prefix}:queue:{queue}` | Sorted Set | Ready message ids scored by publish sequence |
//! | `{prefix}:messages` | Hash | id → serialized `TaskMessage` |
//! | `{prefix}:message-queue` / `{prefix}:message-seq` | Hash | id → queue key / sequence |
//! | `{prefix}:leases` | Sorted Set | Claimed ids scored by lease expiry (ms) |
//! | `{prefix}:lease-owner` | Hash | id → worker holding the lease |
//! | `{prefix}:result:{id}` | Hash | `status` + serialized `TaskRecord` |
//! | `{prefix}:forgotten:{id}` | String | Tombstone of a forgotten id |
//! | `{prefix}:revoked:{id}` | String | Serialized `Revocation` |

use super::error::TaskError;
use super::protocol::{TaskMessage, TaskRecord};
use super::queue::{Broker, ResultBackend, Revocation};
use super::types::*;
use crate::storage::redis::masked_url;

use ::redis::Script;
use ::redis::aio::MultiplexedConnection;
use async_trait::async_trait;
use std::time::Duration;

/// KEYS[1] messages, KEYS[2] message-queue, KEYS[3] message-seq,
/// KEYS[4] sequence counter, KEYS[5] queue. ARGV[1] id, ARGV[2] message.
const LUA_PUBLISH: &str = r#"
if redis.call('HEXISTS', KEYS[1], ARGV[1]) == 1 then
    return 0
end
local seq = redis.call('INCR', KEYS[4])
redis.call('HSET', KEYS[1], ARGV[1], ARGV[2])
redis.call('HSET', KEYS[2], ARGV[1], KEYS[5])
redis.call('HSET', KEYS[3], ARGV[1], seq)
redis.call('ZADD', KEYS[5], seq, ARGV[1])
return 1
"#;

/// KEYS[1] messages, KEYS[2] message-queue, KEYS[3] message-seq,
/// KEYS[4] leases, KEYS[5] lease-owner, KEYS[6..] subscribed queues.
/// ARGV[1] now (ms), ARGV[2] lease expiry (ms), ARGV[3] worker.
/// Requeues lapsed leases, then claims the lowest sequence across queues.
const LUA_FETCH: &str = r#"
local lapsed = redis.call('ZRANGEBYSCORE', KEYS[4], '-inf', '(' .. ARGV[1])
for _, id in ipairs(lapsed) do
    redis.call('ZREM', KEYS[4], id)
    redis.call('HDEL', KEYS[5], id)
    local queue_key = redis.call('HGET', KEYS[2], id)
    local seq = redis.call('HGET', KEYS[3], id)
    if queue_key and seq then
        redis.call('ZADD', queue_key, seq, id)
    end
end

local best_id, best_seq, best_key = nil, nil, nil
for i = 6, #KEYS do
    local head = redis.call('ZRANGE', KEYS[i], 0, 0, 'WITHSCORES')
    if head[1] then
        local seq = tonumber(head[2])
        if best_seq == nil or seq < best_seq then
            best_id, best_seq, best_key = head[1], seq, KEYS[i]
        end
    end
end

if not best_id then
    return false
end
redis.call('ZREM', best_key, best_id)
redis.call('ZADD', KEYS[4], ARGV[2], best_id)
redis.call('HSET', KEYS[5], best_id, ARGV[3])
return redis.call('HGET', KEYS[1], best_id)
"#;

/// KEYS[1] lease-owner, KEYS[2] leases. ARGV[1] id, ARGV[2] worker, ARGV[3] expiry.
const LUA_RENEW: &str = r#"
if redis.call('HGET', KEYS[1], ARGV[1]) ~= ARGV[2] then
    return 0
end
redis.call('ZADD', KEYS[2], 'XX', ARGV[3], ARGV[1])
return 1
"#;

/// KEYS[1] messages, KEYS[2] message-queue, KEYS[3] message-seq,
/// KEYS[4] leases, KEYS[5] lease-owner. ARGV[1] id.
const LUA_ACK: &str = r#"
local queue_key = redis.call('HGET', KEYS[2], ARGV[1])
if queue_key then
    redis.call('ZREM', queue_key, ARGV[1])
end
redis.call('HDEL', KEYS[1], ARGV[1])
redis.call('HDEL', KEYS[2], ARGV[1])
redis.call('HDEL', KEYS[3], ARGV[1])
redis.call('ZREM', KEYS[4], ARGV[1])
redis.call('HDEL', KEYS[5], ARGV[1])
return 1
"#;

/// KEYS[1] result, KEYS[2] tombstone. ARGV[1] status, ARGV[2] record,
/// ARGV[3] ttl ms or '', ARGV[4..] statuses allowed to move to ARGV[1].
const LUA_STORE: &str = r#"
if redis.call('EXISTS', KEYS[2]) == 1 then
    return 0
end
local current = redis.call('HGET', KEYS[1], 'status')
if current then
    local allowed = false
    for i = 4, #ARGV do
        if ARGV[i] == current then
            allowed = true
        end
    end
    if not allowed then
        return 0
    end
end
redis.call('HSET', KEYS[1], 'status', ARGV[1], 'record', ARGV[2])
if ARGV[3] ~= '' then
    redis.call('PEXPIRE', KEYS[1], tonumber(ARGV[3]))
else
    redis.call('PERSIST', KEYS[1])
end
return 1
"#;

/// KEYS[1] key to delete (may be absent), KEYS[2] key to set.
/// ARGV[1] value, ARGV[2] ttl ms or ''.
const LUA_REPLACE: &str = r#"
redis.call('DEL', KEYS[1])
if ARGV[2] ~= '' then
    redis.call('SET', KEYS[2], ARGV[1], 'PX', tonumber(ARGV[2]))
else
    redis.call('SET', KEYS[2], ARGV[1])
end
return 1
"#;

const ALL_STATUSES: [TaskStatus; 5] = [
    TaskStatus::Pending,
    TaskStatus::Running,
    TaskStatus::Success,
    TaskStatus::Failed,
    TaskStatus::Revoked,
];

fn broker_error(context: &str, e: ::redis::RedisError) -> TaskError {
    TaskError::Broker(format!("{context}: {e}"))
}

fn codec_error(e: serde_json::Error) -> TaskError {
    TaskError::Broker(format!("malformed payload: {e}"))
}

pub struct RedisBroker {
    conn: MultiplexedConnection,
    url: String,
    prefix: String,
    result_expires: Option<Duration>,
}

impl RedisBroker {
    pub async fn connect(
        url: &str,
        prefix: &str,
        result_expires: Option<Duration>,
    ) -> Result<Self, TaskError> {
        let client =
            ::redis::Client::open(url).map_err(|e| broker_error("invalid Redis url", e))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| broker_error("failed to connect to Redis", e))?;

        tracing::info!("Connected to Redis broker at {}", masked_url(url));
        Ok(Self {
            conn,
            url: url.to_string(),
            prefix: prefix.to_string(),
            result_expires,
        })
    }

    fn key(&self, part: &str) -> String {
        format!("{}:{}", self.prefix, part)
    }

    fn queue_key(&self, queue: &str) -> String {
        self.key(&format!("queue:{queue}"))
    }

    fn ttl_arg(&self) -> String {
        self.result_expires
            .map(|ttl| ttl.as_millis().to_string())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn publish(&self, message: TaskMessage) -> Result<(), TaskError> {
        let body = serde_json::to_string(&message).map_err(codec_error)?;
        let _: i64 = Script::new(LUA_PUBLISH)
            .key(self.key("messages"))
            .key(self.key("message-queue"))
            .key(self.key("message-seq"))
            .key(self.key("sequence"))
            .key(self.queue_key(&message.queue))
            .arg(message.id.as_str())
            .arg(body)
            .invoke_async(&mut self.conn.clone())
            .await
            .map_err(|e| broker_error("publish failed", e))?;

        tracing::debug!("Published task {} to queue '{}'", message.id, message.queue);
        Ok(())
    }

    async fn fetch(
        &self,
        queues: &[String],
        worker: &str,
        lease: Duration,
    ) -> Result<Option<TaskMessage>, TaskError> {
        let now = now_ms();
        let script = Script::new(LUA_FETCH);
        let mut invocation = script.prepare_invoke();
        invocation
            .key(self.key("messages"))
            .key(self.key("message-queue"))
            .key(self.key("message-seq"))
            .key(self.key("leases"))
            .key(self.key("lease-owner"));
        for queue in queues {
            invocation.key(self.queue_key(queue));
        }
        invocation
            .arg(now)
            .arg(now + lease.as_millis() as u64)
            .arg(worker);

        let body: Option<String> = invocation
            .invoke_async(&mut self.conn.clone())
            .await
            .map_err(|e| broker_error("fetch failed", e))?;

        body.map(|body| serde_json::from_str(&body).map_err(codec_error))
            .transpose()
    }

    async fn renew_lease(
        &self,
        task_id: &TaskId,
        worker: &str,
        lease: Duration,
    ) -> Result<bool, TaskError> {
        let renewed: i64 = Script::new(LUA_RENEW)
            .key(self.key("lease-owner"))
            .key(self.key("leases"))
            .arg(task_id.as_str())
            .arg(worker)
            .arg(now_ms() + lease.as_millis() as u64)
            .invoke_async(&mut self.conn.clone())
            .await
            .map_err(|e| broker_error("lease renewal failed", e))?;
        Ok(renewed == 1)
    }

    async fn ack(&self, task_id: &TaskId) -> Result<(), TaskError> {
        let _: i64 = Script::new(LUA_ACK)
            .key(self.key("messages"))
            .key(self.key("message-queue"))
            .key(self.key("message-seq"))
            .key(self.key("leases"))
            .key(self.key("lease-owner"))
            .arg(task_id.as_str())
            .invoke_async(&mut self.conn.clone())
            .await
            .map_err(|e| broker_error("ack failed", e))?;
        Ok(())
    }

    async fn revoke(&self, task_id: &TaskId, terminate: bool) -> Result<(), TaskError> {
        let revocation = Revocation {
            terminate,
            revoked_at: now_ms(),
        };
        let body = serde_json::to_string(&revocation).map_err(codec_error)?;
        let revoked_key = self.key(&format!("revoked:{task_id}"));

        let _: i64 = Script::new(LUA_REPLACE)
            .key(&revoked_key)
            .key(&revoked_key)
            .arg(body)
            .arg(self.ttl_arg())
            .invoke_async(&mut self.conn.clone())
            .await
            .map_err(|e| broker_error("revoke failed", e))?;

        tracing::info!("Revoked task {} (terminate: {})", task_id, terminate);
        Ok(())
    }

    async fn revocation(&self, task_id: &TaskId) -> Result<Option<Revocation>, TaskError> {
        let body: Option<String> = ::redis::cmd("GET")
            .arg(self.key(&format!("revoked:{task_id}")))
            .query_async(&mut self.conn.clone())
            .await
            .map_err(|e| broker_error("revocation lookup failed", e))?;

        body.map(|body| serde_json::from_str(&body).map_err(codec_error))
            .transpose()
    }

    fn describe(&self) -> String {
        format!("{} (prefix '{}')", masked_url(&self.url), self.prefix)
    }
}

#[async_trait]
impl ResultBackend for RedisBroker {
    async fn store(&self, record: TaskRecord) -> Result<bool, TaskError> {
        let body = serde_json::to_string(&record).map_err(codec_error)?;
        let ttl = if record.status.is_terminal() {
            self.ttl_arg()
        } else {
            String::new()
        };

        let script = Script::new(LUA_STORE);
        let mut invocation = script.prepare_invoke();
        invocation
            .key(self.key(&format!("result:{}", record.task_id)))
            .key(self.key(&format!("forgotten:{}", record.task_id)))
            .arg(record.status.as_str())
            .arg(body)
            .arg(ttl);
        for previous in ALL_STATUSES {
            if previous.can_transition_to(record.status) {
                invocation.arg(previous.as_str());
            }
        }

        let applied: i64 = invocation
            .invoke_async(&mut self.conn.clone())
            .await
            .map_err(|e| broker_error("result store failed", e))?;
        Ok(applied == 1)
    }

    async fn load(&self, task_id: &TaskId) -> Result<Option<TaskRecord>, TaskError> {
        let body: Option<String> = ::redis::cmd("HGET")
            .arg(self.key(&format!("result:{task_id}")))
            .arg("record")
            .query_async(&mut self.conn.clone())
            .await
            .map_err(|e| broker_error("result load failed", e))?;

        body.map(|body| serde_json::from_str(&body).map_err(codec_error))
            .transpose()
    }

    async fn forget(&self, task_id: &TaskId) -> Result<(), TaskError> {
        let _: i64 = Script::new(LUA_REPLACE)
            .key(self.key(&format!("result:{task_id}")))
            .key(self.key(&format!("forgotten:{task_id}")))
            .arg("1")
            .arg(self.ttl_arg())
            .invoke_async(&mut self.conn.clone())
            .await
            .map_err(|e| broker_error("forget failed", e))?;
        Ok(())
    }
}
