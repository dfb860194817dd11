//! The server-evaluated Lua scripts.
//!
//! Every multi-structure state transition is one script, so concurrent broker
//! clients observe strictly sequenced effects on the keys each script
//! touches. Splitting any of these into multiple round trips would break the
//! parent-rebalance and concurrency-set invariants.
//!
//! Each script that mutates a child queue ZSET re-reads the child's minimum
//! score and upserts or removes the child in its parent ZSET: the parent is
//! a priority index over "oldest head score per child" and must be rebalanced
//! on every insert and remove.

use crate::strategy::{Capacity, QueueCapacities};
use redis::aio::ConnectionManager;
use redis::Script;

const ENQUEUE: &str = r#"
-- KEYS[1] child queue ZSET
-- KEYS[2] parent queue ZSET
-- KEYS[3] message body
-- ARGV[1] child queue key (the parent ZSET member)
-- ARGV[2] message id
-- ARGV[3] serialized message body
-- ARGV[4] enqueue score (ms)
redis.call('SET', KEYS[3], ARGV[3])
redis.call('ZADD', KEYS[1], ARGV[4], ARGV[2])

local earliest = redis.call('ZRANGE', KEYS[1], 0, 0, 'WITHSCORES')
if #earliest == 0 then
    redis.call('ZREM', KEYS[2], ARGV[1])
else
    redis.call('ZADD', KEYS[2], earliest[2], ARGV[1])
end
"#;

const DEQUEUE: &str = r#"
-- KEYS[1] child queue ZSET
-- KEYS[2] parent queue ZSET
-- KEYS[3] visibility timeout ZSET
-- KEYS[4] queue concurrency limit
-- KEYS[5] env concurrency limit
-- KEYS[6] org concurrency limit
-- KEYS[7] queue current concurrency SET
-- KEYS[8] env current concurrency SET
-- KEYS[9] org current concurrency SET
-- ARGV[1] child queue key (the parent ZSET member)
-- ARGV[2] visibility timeout (ms)
-- ARGV[3] now (ms)
-- ARGV[4] default queue concurrency limit
-- ARGV[5] default env concurrency limit
-- ARGV[6] default org concurrency limit
local orgCurrent = redis.call('SCARD', KEYS[9])
local orgLimit = tonumber(redis.call('GET', KEYS[6]) or ARGV[6])
if orgCurrent >= orgLimit then
    return nil
end

local envCurrent = redis.call('SCARD', KEYS[8])
local envLimit = tonumber(redis.call('GET', KEYS[5]) or ARGV[5])
if envCurrent >= envLimit then
    return nil
end

local queueCurrent = redis.call('SCARD', KEYS[7])
local queueLimit = tonumber(redis.call('GET', KEYS[4]) or ARGV[4])
if queueCurrent >= queueLimit then
    return nil
end

local messages = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[3], 'WITHSCORES', 'LIMIT', 0, 1)
if #messages == 0 then
    return nil
end
local messageId = messages[1]
local messageScore = messages[2]

redis.call('ZREM', KEYS[1], messageId)
redis.call('ZADD', KEYS[3], ARGV[3] + ARGV[2], messageId)
redis.call('SADD', KEYS[7], messageId)
redis.call('SADD', KEYS[8], messageId)
redis.call('SADD', KEYS[9], messageId)

local earliest = redis.call('ZRANGE', KEYS[1], 0, 0, 'WITHSCORES')
if #earliest == 0 then
    redis.call('ZREM', KEYS[2], ARGV[1])
else
    redis.call('ZADD', KEYS[2], earliest[2], ARGV[1])
end

return { messageId, messageScore }
"#;

const ACK: &str = r#"
-- KEYS[1] message body
-- KEYS[2] visibility timeout ZSET
-- KEYS[3] queue current concurrency SET
-- KEYS[4] env current concurrency SET
-- KEYS[5] org current concurrency SET
-- ARGV[1] message id
redis.call('DEL', KEYS[1])
redis.call('ZREM', KEYS[2], ARGV[1])
redis.call('SREM', KEYS[3], ARGV[1])
redis.call('SREM', KEYS[4], ARGV[1])
redis.call('SREM', KEYS[5], ARGV[1])
"#;

const NACK: &str = r#"
-- KEYS[1] message body (left in place; a nack keeps the message alive)
-- KEYS[2] child queue ZSET
-- KEYS[3] parent queue ZSET
-- KEYS[4] queue current concurrency SET
-- KEYS[5] env current concurrency SET
-- KEYS[6] org current concurrency SET
-- KEYS[7] visibility timeout ZSET
-- ARGV[1] child queue key (the parent ZSET member)
-- ARGV[2] message id
-- ARGV[3] new score (ms); may be in the future for retry backoff
local inFlight = redis.call('ZSCORE', KEYS[7], ARGV[2])
if not inFlight then
    return 0
end

redis.call('ZREM', KEYS[7], ARGV[2])
redis.call('SREM', KEYS[4], ARGV[2])
redis.call('SREM', KEYS[5], ARGV[2])
redis.call('SREM', KEYS[6], ARGV[2])

redis.call('ZADD', KEYS[2], ARGV[3], ARGV[2])

local earliest = redis.call('ZRANGE', KEYS[2], 0, 0, 'WITHSCORES')
if #earliest == 0 then
    redis.call('ZREM', KEYS[3], ARGV[1])
else
    redis.call('ZADD', KEYS[3], earliest[2], ARGV[1])
end
return 1
"#;

const HEARTBEAT: &str = r#"
-- KEYS[1] visibility timeout ZSET
-- ARGV[1] message id
-- ARGV[2] extension (ms)
-- ARGV[3] max deadline (ms)
local current = redis.call('ZSCORE', KEYS[1], ARGV[1])
if not current then
    return 0
end

local extended = tonumber(current) + tonumber(ARGV[2])
local maxDeadline = tonumber(ARGV[3])
if extended > maxDeadline then
    extended = maxDeadline
end
redis.call('ZADD', KEYS[1], extended, ARGV[1])
return 1
"#;

const COMPUTE_CAPACITIES: &str = r#"
-- KEYS[1] queue current concurrency SET
-- KEYS[2] env current concurrency SET
-- KEYS[3] org current concurrency SET
-- KEYS[4] queue concurrency limit
-- KEYS[5] env concurrency limit
-- KEYS[6] org concurrency limit
-- ARGV[1] default queue concurrency limit
-- ARGV[2] default env concurrency limit
-- ARGV[3] default org concurrency limit
local queueCurrent = redis.call('SCARD', KEYS[1])
local envCurrent = redis.call('SCARD', KEYS[2])
local orgCurrent = redis.call('SCARD', KEYS[3])
local queueLimit = tonumber(redis.call('GET', KEYS[4]) or ARGV[1])
local envLimit = tonumber(redis.call('GET', KEYS[5]) or ARGV[2])
local orgLimit = tonumber(redis.call('GET', KEYS[6]) or ARGV[3])
return { queueCurrent, queueLimit, envCurrent, envLimit, orgCurrent, orgLimit }
"#;

const UPDATE_GLOBAL_LIMITS: &str = r#"
-- KEYS[1] env concurrency limit
-- KEYS[2] org concurrency limit
-- ARGV[1] env limit value
-- ARGV[2] org limit value
redis.call('SET', KEYS[1], ARGV[1])
redis.call('SET', KEYS[2], ARGV[2])
"#;

/// Physical keys for the enqueue script.
pub(crate) struct EnqueueKeys {
    pub queue: String,
    pub parent: String,
    pub message: String,
}

/// Physical keys for the dequeue script.
pub(crate) struct DequeueKeys {
    pub queue: String,
    pub parent: String,
    pub visibility: String,
    pub queue_limit: String,
    pub env_limit: String,
    pub org_limit: String,
    pub queue_current: String,
    pub env_current: String,
    pub org_current: String,
}

/// Physical keys for the ack script.
pub(crate) struct AckKeys {
    pub message: String,
    pub visibility: String,
    pub queue_current: String,
    pub env_current: String,
    pub org_current: String,
}

/// Physical keys for the nack script.
pub(crate) struct NackKeys {
    pub message: String,
    pub queue: String,
    pub parent: String,
    pub queue_current: String,
    pub env_current: String,
    pub org_current: String,
    pub visibility: String,
}

/// Physical keys for the compute-capacities script.
pub(crate) struct CapacityKeys {
    pub queue_current: String,
    pub env_current: String,
    pub org_current: String,
    pub queue_limit: String,
    pub env_limit: String,
    pub org_limit: String,
}

/// Default queue/env/org limits applied when a limit key is absent.
#[derive(Debug, Clone, Copy)]
pub(crate) struct DefaultLimits {
    pub queue: u32,
    pub env: u32,
    pub org: u32,
}

/// The loaded script set. `redis::Script` evaluates by SHA and transparently
/// reloads on NOSCRIPT, so each call is one round trip in the steady state.
pub(crate) struct Scripts {
    enqueue: Script,
    dequeue: Script,
    ack: Script,
    nack: Script,
    heartbeat: Script,
    compute_capacities: Script,
    update_global_limits: Script,
}

impl Scripts {
    pub fn new() -> Self {
        Self {
            enqueue: Script::new(ENQUEUE),
            dequeue: Script::new(DEQUEUE),
            ack: Script::new(ACK),
            nack: Script::new(NACK),
            heartbeat: Script::new(HEARTBEAT),
            compute_capacities: Script::new(COMPUTE_CAPACITIES),
            update_global_limits: Script::new(UPDATE_GLOBAL_LIMITS),
        }
    }

    pub async fn enqueue(
        &self,
        conn: &mut ConnectionManager,
        keys: EnqueueKeys,
        queue_member: &str,
        message_id: &str,
        body: &str,
        score_ms: i64,
    ) -> crate::Result<()> {
        let _: () = self
            .enqueue
            .key(keys.queue)
            .key(keys.parent)
            .key(keys.message)
            .arg(queue_member)
            .arg(message_id)
            .arg(body)
            .arg(score_ms)
            .invoke_async(conn)
            .await?;
        Ok(())
    }

    /// Returns the dequeued `(message id, original enqueue score)`, or `None`
    /// when the queue is empty of due messages or a concurrency ceiling is
    /// reached.
    pub async fn dequeue(
        &self,
        conn: &mut ConnectionManager,
        keys: DequeueKeys,
        queue_member: &str,
        visibility_timeout_ms: u64,
        now_ms: i64,
        defaults: DefaultLimits,
    ) -> crate::Result<Option<(String, i64)>> {
        let reply: Option<(String, String)> = self
            .dequeue
            .key(keys.queue)
            .key(keys.parent)
            .key(keys.visibility)
            .key(keys.queue_limit)
            .key(keys.env_limit)
            .key(keys.org_limit)
            .key(keys.queue_current)
            .key(keys.env_current)
            .key(keys.org_current)
            .arg(queue_member)
            .arg(visibility_timeout_ms)
            .arg(now_ms)
            .arg(defaults.queue)
            .arg(defaults.env)
            .arg(defaults.org)
            .invoke_async(conn)
            .await?;

        reply
            .map(|(message_id, score)| {
                let score = score
                    .parse::<f64>()
                    .map_err(|_| crate::Error::Protocol("dequeue returned a non-numeric score"))?;
                Ok((message_id, score as i64))
            })
            .transpose()
    }

    pub async fn ack(
        &self,
        conn: &mut ConnectionManager,
        keys: AckKeys,
        message_id: &str,
    ) -> crate::Result<()> {
        let _: () = self
            .ack
            .key(keys.message)
            .key(keys.visibility)
            .key(keys.queue_current)
            .key(keys.env_current)
            .key(keys.org_current)
            .arg(message_id)
            .invoke_async(conn)
            .await?;
        Ok(())
    }

    /// Returns whether the message was actually requeued. `false` means the
    /// id was no longer in flight: it lost a race to an ack or earlier nack.
    pub async fn nack(
        &self,
        conn: &mut ConnectionManager,
        keys: NackKeys,
        queue_member: &str,
        message_id: &str,
        new_score_ms: i64,
    ) -> crate::Result<bool> {
        let requeued: i64 = self
            .nack
            .key(keys.message)
            .key(keys.queue)
            .key(keys.parent)
            .key(keys.queue_current)
            .key(keys.env_current)
            .key(keys.org_current)
            .key(keys.visibility)
            .arg(queue_member)
            .arg(message_id)
            .arg(new_score_ms)
            .invoke_async(conn)
            .await?;
        Ok(requeued == 1)
    }

    /// Returns whether the lease was extended. `false` means the id was not
    /// in flight.
    pub async fn heartbeat(
        &self,
        conn: &mut ConnectionManager,
        visibility_key: String,
        message_id: &str,
        extension_ms: u64,
        max_deadline_ms: i64,
    ) -> crate::Result<bool> {
        let extended: i64 = self
            .heartbeat
            .key(visibility_key)
            .arg(message_id)
            .arg(extension_ms)
            .arg(max_deadline_ms)
            .invoke_async(conn)
            .await?;
        Ok(extended == 1)
    }

    pub async fn compute_capacities(
        &self,
        conn: &mut ConnectionManager,
        keys: CapacityKeys,
        defaults: DefaultLimits,
    ) -> crate::Result<QueueCapacities> {
        let (queue_current, queue_limit, env_current, env_limit, org_current, org_limit): (
            u32,
            u32,
            u32,
            u32,
            u32,
            u32,
        ) = self
            .compute_capacities
            .key(keys.queue_current)
            .key(keys.env_current)
            .key(keys.org_current)
            .key(keys.queue_limit)
            .key(keys.env_limit)
            .key(keys.org_limit)
            .arg(defaults.queue)
            .arg(defaults.env)
            .arg(defaults.org)
            .invoke_async(conn)
            .await?;

        Ok(QueueCapacities {
            queue: Capacity {
                current: queue_current,
                limit: queue_limit,
            },
            env: Capacity {
                current: env_current,
                limit: env_limit,
            },
            org: Capacity {
                current: org_current,
                limit: org_limit,
            },
        })
    }

    pub async fn update_global_limits(
        &self,
        conn: &mut ConnectionManager,
        env_limit_key: String,
        org_limit_key: String,
        env_limit: u32,
        org_limit: u32,
    ) -> crate::Result<()> {
        let _: () = self
            .update_global_limits
            .key(env_limit_key)
            .key(org_limit_key)
            .arg(env_limit)
            .arg(org_limit)
            .invoke_async(conn)
            .await?;
        Ok(())
    }
}
