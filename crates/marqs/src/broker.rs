//! The public broker operations.
//!
//! [`Marqs`] orchestrates key building, script invocation, and tracing; it
//! holds no locks and no state beyond the shared connection, the script set,
//! and the requeue worker handles. Every operation is a span-wrapped sequence
//! of store round trips, with the atomic work done inside the scripts.

use crate::config::MarqsConfig;
use crate::keys::{DefaultKeyProducer, KeyProducer};
use crate::message::{now_ms, MessagePayload, MESSAGE_VERSION};
use crate::requeuer::Requeuer;
use crate::scripts::{
    AckKeys, CapacityKeys, DefaultLimits, DequeueKeys, EnqueueKeys, NackKeys, Scripts,
};
use crate::strategy::{QueuePriorityStrategy, QueueWithScores, SimpleWeightedChoiceStrategy};
use crate::telemetry;
use crate::tenant::TenantEnvironment;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::sync::Arc;
use tracing::{field, instrument};

/// Shared state behind both the broker operations and the requeue workers.
pub(crate) struct Inner {
    pub config: MarqsConfig,
    pub keys: Arc<dyn KeyProducer>,
    conn: ConnectionManager,
    pub scripts: Scripts,
}

impl Inner {
    /// Clones the managed connection; clones share the underlying socket.
    pub fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }

    pub fn defaults(&self) -> DefaultLimits {
        DefaultLimits {
            queue: self.config.default_queue_concurrency,
            env: self.config.default_env_concurrency,
            org: self.config.default_org_concurrency,
        }
    }

    /// Reads and parses a message body. A missing body yields `None`; a
    /// garbled body is logged with its diagnostic and also yields `None`,
    /// since callers have defined no-op semantics for both.
    pub async fn read_payload(&self, message_id: &str) -> crate::Result<Option<MessagePayload>> {
        let key = self.keys.physical(&self.keys.message_key(message_id));
        let mut conn = self.conn();
        let raw: Option<String> = conn.get(&key).await?;

        match raw {
            None => Ok(None),
            Some(raw) => match MessagePayload::deserialize(&raw) {
                Ok(payload) => Ok(Some(payload)),
                Err(error) => {
                    tracing::error!(message_id, %error, "failed to parse message payload");
                    Ok(None)
                }
            },
        }
    }

    /// Returns a message to its queue at `new_score_ms`. Shared by the nack
    /// operation and the requeue workers; `false` means the id was no longer
    /// in flight.
    pub async fn nack_message(
        &self,
        payload: &MessagePayload,
        new_score_ms: i64,
    ) -> crate::Result<bool> {
        let keys = &self.keys;
        let member = &payload.queue;
        let nack_keys = NackKeys {
            message: keys.physical(&keys.message_key(&payload.message_id)),
            queue: keys.physical(member),
            parent: keys.physical(&payload.parent_queue),
            queue_current: keys.physical(&keys.current_concurrency_key_from_queue(member)),
            env_current: keys.physical(&keys.env_current_concurrency_key_from_queue(member)),
            org_current: keys.physical(&keys.org_current_concurrency_key_from_queue(member)),
            visibility: keys.physical(&keys.visibility_timeout_key()),
        };

        let mut conn = self.conn();
        self.scripts
            .nack(&mut conn, nack_keys, member, &payload.message_id, new_score_ms)
            .await
    }

    /// Message ids whose visibility deadline is at or before `now_ms`.
    pub async fn expired_message_ids(
        &self,
        now_ms: i64,
        limit: isize,
    ) -> crate::Result<Vec<String>> {
        let key = self.keys.physical(&self.keys.visibility_timeout_key());
        let mut conn = self.conn();
        let expired: Vec<String> = conn
            .zrangebyscore_limit(&key, 0, now_ms, 0, limit)
            .await?;
        Ok(expired)
    }

    pub async fn remove_from_visibility(&self, message_id: &str) -> crate::Result<()> {
        let key = self.keys.physical(&self.keys.visibility_timeout_key());
        let mut conn = self.conn();
        let _: () = conn.zrem(&key, message_id).await?;
        Ok(())
    }
}

/// Builder for [`Marqs`]. The key producer and both priority strategies are
/// pluggable; defaults match the documented scheme.
pub struct MarqsBuilder {
    config: MarqsConfig,
    keys: Arc<dyn KeyProducer>,
    shared_strategy: Arc<dyn QueuePriorityStrategy>,
    env_strategy: Arc<dyn QueuePriorityStrategy>,
}

impl MarqsBuilder {
    pub fn new(config: MarqsConfig) -> Self {
        let selection_count = config.queue_selection_count;
        Self {
            config,
            keys: Arc::new(DefaultKeyProducer::default()),
            shared_strategy: Arc::new(SimpleWeightedChoiceStrategy::new(selection_count)),
            env_strategy: Arc::new(SimpleWeightedChoiceStrategy::new(selection_count)),
        }
    }

    pub fn key_producer(mut self, keys: Arc<dyn KeyProducer>) -> Self {
        self.keys = keys;
        self
    }

    /// Strategy used when dequeuing from the global shared parent.
    pub fn queue_priority_strategy(mut self, strategy: Arc<dyn QueuePriorityStrategy>) -> Self {
        self.shared_strategy = strategy;
        self
    }

    /// Strategy used when dequeuing from an environment's parent.
    pub fn env_queue_priority_strategy(mut self, strategy: Arc<dyn QueuePriorityStrategy>) -> Self {
        self.env_strategy = strategy;
        self
    }

    /// Connects to Redis and starts the configured requeue workers.
    pub async fn build(self) -> crate::Result<Marqs> {
        let client = redis::Client::open(self.config.redis_url().as_str())?;
        let conn = ConnectionManager::new(client).await?;

        let workers = self.config.workers;
        let inner = Arc::new(Inner {
            config: self.config,
            keys: self.keys,
            conn,
            scripts: Scripts::new(),
        });

        let requeuer = (workers > 0).then(|| Requeuer::start(inner.clone(), workers));

        Ok(Marqs {
            inner,
            shared_strategy: self.shared_strategy,
            env_strategy: self.env_strategy,
            requeuer: tokio::sync::Mutex::new(requeuer),
        })
    }
}

/// The broker. Cheap to share behind an `Arc`; all operations take `&self`.
pub struct Marqs {
    inner: Arc<Inner>,
    shared_strategy: Arc<dyn QueuePriorityStrategy>,
    env_strategy: Arc<dyn QueuePriorityStrategy>,
    requeuer: tokio::sync::Mutex<Option<Requeuer>>,
}

impl Marqs {
    pub fn builder(config: MarqsConfig) -> MarqsBuilder {
        MarqsBuilder::new(config)
    }

    /// Enqueues a message onto `(env, queue[, concurrency key])`.
    ///
    /// The current trace context is injected into `data` so the eventual
    /// consumer can continue the producer's trace.
    #[instrument(
        level = "debug",
        skip_all,
        err,
        fields(
            messaging.system = telemetry::SYSTEM_NAME,
            messaging.operation = "publish",
            messaging.message_id = %message_id,
            otel.kind = "producer",
            marqs.message_id = %message_id,
            marqs.queue = field::Empty,
            marqs.parent_queue = field::Empty,
            marqs.concurrency_key = field::Empty,
        )
    )]
    pub async fn enqueue(
        &self,
        env: &TenantEnvironment,
        queue: &str,
        message_id: &str,
        mut data: serde_json::Value,
        concurrency_key: Option<&str>,
    ) -> crate::Result<()> {
        let keys = &self.inner.keys;
        let member = keys.queue_key(env, queue, concurrency_key);
        // Development environments are polled by their own consumers; all
        // deployed environments share the global parent.
        let parent = if env.env_type.is_development() {
            keys.env_shared_queue_key(env)
        } else {
            keys.shared_queue_key()
        };

        let span = tracing::Span::current();
        span.record("marqs.queue", member.as_str());
        span.record("marqs.parent_queue", parent.as_str());
        if let Some(ck) = concurrency_key {
            span.record("marqs.concurrency_key", ck);
        }

        telemetry::inject_trace_context(&mut data);

        let timestamp = now_ms();
        let payload = MessagePayload {
            version: MESSAGE_VERSION.to_string(),
            data,
            queue: member.clone(),
            concurrency_key: concurrency_key.map(str::to_string),
            timestamp,
            message_id: message_id.to_string(),
            parent_queue: parent.clone(),
        };
        let body = payload.serialize()?;

        let enqueue_keys = EnqueueKeys {
            queue: keys.physical(&member),
            parent: keys.physical(&parent),
            message: keys.physical(&keys.message_key(message_id)),
        };

        let mut conn = self.inner.conn();
        self.inner
            .scripts
            .enqueue(&mut conn, enqueue_keys, &member, message_id, &body, timestamp)
            .await
    }

    /// Dequeues the next message from an environment's parent queue.
    #[instrument(
        level = "debug",
        skip_all,
        err,
        fields(
            messaging.system = telemetry::SYSTEM_NAME,
            messaging.operation = "receive",
            otel.kind = "consumer",
            marqs.parent_queue = field::Empty,
            marqs.queue_count = field::Empty,
            marqs.queues = field::Empty,
            marqs.queues_with_scores = field::Empty,
            marqs.next_range = field::Empty,
            marqs.queue_choice = field::Empty,
            marqs.message_id = field::Empty,
            messaging.message_id = field::Empty,
            outcome = field::Empty,
        )
    )]
    pub async fn dequeue_from_env(
        &self,
        env: &TenantEnvironment,
    ) -> crate::Result<Option<MessagePayload>> {
        let parent = self.inner.keys.env_shared_queue_key(env);
        self.dequeue_from_parent(&parent, self.env_strategy.as_ref())
            .await
    }

    /// Dequeues the next message from the global shared parent queue.
    #[instrument(
        level = "debug",
        skip_all,
        err,
        fields(
            messaging.system = telemetry::SYSTEM_NAME,
            messaging.operation = "receive",
            otel.kind = "consumer",
            marqs.parent_queue = field::Empty,
            marqs.queue_count = field::Empty,
            marqs.queues = field::Empty,
            marqs.queues_with_scores = field::Empty,
            marqs.next_range = field::Empty,
            marqs.queue_choice = field::Empty,
            marqs.message_id = field::Empty,
            messaging.message_id = field::Empty,
            outcome = field::Empty,
        )
    )]
    pub async fn dequeue_from_shared(&self) -> crate::Result<Option<MessagePayload>> {
        let parent = self.inner.keys.shared_queue_key();
        self.dequeue_from_parent(&parent, self.shared_strategy.as_ref())
            .await
    }

    async fn dequeue_from_parent(
        &self,
        parent: &str,
        strategy: &dyn QueuePriorityStrategy,
    ) -> crate::Result<Option<MessagePayload>> {
        let span = tracing::Span::current();
        span.record("marqs.parent_queue", parent);

        let Some(member) = self.get_random_queue_from_parent(parent, strategy).await? else {
            telemetry::record_idle();
            return Ok(None);
        };

        let keys = &self.inner.keys;
        let dequeue_keys = DequeueKeys {
            queue: keys.physical(&member),
            parent: keys.physical(parent),
            visibility: keys.physical(&keys.visibility_timeout_key()),
            queue_limit: keys.physical(&keys.concurrency_limit_key_from_queue(&member)),
            env_limit: keys.physical(&keys.env_concurrency_limit_key_from_queue(&member)),
            org_limit: keys.physical(&keys.org_concurrency_limit_key_from_queue(&member)),
            queue_current: keys.physical(&keys.current_concurrency_key_from_queue(&member)),
            env_current: keys.physical(&keys.env_current_concurrency_key_from_queue(&member)),
            org_current: keys.physical(&keys.org_current_concurrency_key_from_queue(&member)),
        };

        let mut conn = self.inner.conn();
        let dequeued = self
            .inner
            .scripts
            .dequeue(
                &mut conn,
                dequeue_keys,
                &member,
                self.inner.config.visibility_timeout_ms,
                now_ms(),
                self.inner.defaults(),
            )
            .await?;

        let Some((message_id, _enqueued_at)) = dequeued else {
            telemetry::record_idle();
            return Ok(None);
        };
        span.record("marqs.message_id", message_id.as_str());
        span.record("messaging.message_id", message_id.as_str());

        // A missing or garbled body is logged by the read; the caller sees an
        // empty poll either way.
        Ok(self.inner.read_payload(&message_id).await?)
    }

    /// Picks a child queue from `parent`: take the strategy's candidate
    /// window off the head of the parent ZSET, compute each candidate's
    /// capacities, and let the strategy choose.
    async fn get_random_queue_from_parent(
        &self,
        parent: &str,
        strategy: &dyn QueuePriorityStrategy,
    ) -> crate::Result<Option<String>> {
        let span = tracing::Span::current();
        let keys = &self.inner.keys;

        let selection = strategy.next_candidate_selection(parent);
        span.record(
            "marqs.next_range",
            format!(
                "[{}, {}]",
                selection.range.start(),
                selection.range.end()
            )
            .as_str(),
        );

        let mut conn = self.inner.conn();
        let candidates: Vec<(String, f64)> = conn
            .zrange_withscores(
                keys.physical(parent),
                *selection.range.start(),
                *selection.range.end(),
            )
            .await?;

        span.record("marqs.queue_count", candidates.len());
        if candidates.is_empty() {
            return Ok(None);
        }
        span.record(
            "marqs.queues",
            candidates
                .iter()
                .map(|(queue, _)| queue.as_str())
                .collect::<Vec<_>>()
                .join(",")
                .as_str(),
        );
        span.record(
            "marqs.queues_with_scores",
            telemetry::format_queues_with_scores(&candidates).as_str(),
        );

        let now = now_ms();
        let mut scored = Vec::with_capacity(candidates.len());
        for (member, head_score) in &candidates {
            let capacities = self
                .inner
                .scripts
                .compute_capacities(
                    &mut conn,
                    CapacityKeys {
                        queue_current: keys
                            .physical(&keys.current_concurrency_key_from_queue(member)),
                        env_current: keys
                            .physical(&keys.env_current_concurrency_key_from_queue(member)),
                        org_current: keys
                            .physical(&keys.org_current_concurrency_key_from_queue(member)),
                        queue_limit: keys
                            .physical(&keys.concurrency_limit_key_from_queue(member)),
                        env_limit: keys
                            .physical(&keys.env_concurrency_limit_key_from_queue(member)),
                        org_limit: keys
                            .physical(&keys.org_concurrency_limit_key_from_queue(member)),
                    },
                    self.inner.defaults(),
                )
                .await?;

            scored.push(QueueWithScores {
                queue: member.clone(),
                capacities,
                age_ms: now - *head_score as i64,
            });
        }

        let choice = strategy.choose_queue(&scored, parent, selection.selection_id);
        if let Some(queue) = &choice {
            span.record("marqs.queue_choice", queue.as_str());
        }
        Ok(choice)
    }

    /// Acknowledges a message, clearing all of its state. Unknown ids are a
    /// no-op.
    #[instrument(
        level = "debug",
        skip_all,
        err,
        fields(
            messaging.system = telemetry::SYSTEM_NAME,
            messaging.operation = "ack",
            messaging.message_id = %message_id,
            otel.kind = "consumer",
            marqs.message_id = %message_id,
            marqs.queue = field::Empty,
        )
    )]
    pub async fn acknowledge(&self, message_id: &str) -> crate::Result<()> {
        let Some(payload) = self.inner.read_payload(message_id).await? else {
            return Ok(());
        };
        tracing::Span::current().record("marqs.queue", payload.queue.as_str());

        self.ack_payload(&payload).await
    }

    async fn ack_payload(&self, payload: &MessagePayload) -> crate::Result<()> {
        let keys = &self.inner.keys;
        let member = &payload.queue;
        let ack_keys = AckKeys {
            message: keys.physical(&keys.message_key(&payload.message_id)),
            visibility: keys.physical(&keys.visibility_timeout_key()),
            queue_current: keys.physical(&keys.current_concurrency_key_from_queue(member)),
            env_current: keys.physical(&keys.env_current_concurrency_key_from_queue(member)),
            org_current: keys.physical(&keys.org_current_concurrency_key_from_queue(member)),
        };

        let mut conn = self.inner.conn();
        self.inner
            .scripts
            .ack(&mut conn, ack_keys, &payload.message_id)
            .await
    }

    /// Returns an in-flight message to its queue. `retry_at_ms` in the future
    /// delays redelivery until that time; `None` requeues immediately.
    /// Unknown ids, and ids already acked or nacked, are no-ops.
    #[instrument(
        level = "debug",
        skip_all,
        err,
        fields(
            messaging.system = telemetry::SYSTEM_NAME,
            messaging.operation = "nack",
            messaging.message_id = %message_id,
            otel.kind = "consumer",
            marqs.message_id = %message_id,
            marqs.queue = field::Empty,
        )
    )]
    pub async fn nack(&self, message_id: &str, retry_at_ms: Option<i64>) -> crate::Result<()> {
        let Some(payload) = self.inner.read_payload(message_id).await? else {
            return Ok(());
        };
        tracing::Span::current().record("marqs.queue", payload.queue.as_str());

        let new_score = retry_at_ms.unwrap_or_else(now_ms);
        self.inner.nack_message(&payload, new_score).await?;
        Ok(())
    }

    /// Replaces a message's data in place: semantically an ack followed by an
    /// enqueue with the same id, queue, and parent. The two steps are
    /// separate scripts, so observers may transiently see neither.
    #[instrument(
        level = "debug",
        skip_all,
        err,
        fields(
            messaging.system = telemetry::SYSTEM_NAME,
            messaging.operation = "replace",
            messaging.message_id = %message_id,
            otel.kind = "consumer",
            marqs.message_id = %message_id,
            marqs.queue = field::Empty,
        )
    )]
    pub async fn replace(
        &self,
        message_id: &str,
        mut data: serde_json::Value,
        timestamp_ms: Option<i64>,
    ) -> crate::Result<()> {
        let Some(payload) = self.inner.read_payload(message_id).await? else {
            return Ok(());
        };
        tracing::Span::current().record("marqs.queue", payload.queue.as_str());

        self.ack_payload(&payload).await?;

        telemetry::inject_trace_context(&mut data);
        let timestamp = timestamp_ms.unwrap_or_else(now_ms);
        let replacement = MessagePayload {
            version: MESSAGE_VERSION.to_string(),
            data,
            queue: payload.queue.clone(),
            concurrency_key: payload.concurrency_key.clone(),
            timestamp,
            message_id: payload.message_id.clone(),
            parent_queue: payload.parent_queue.clone(),
        };
        let body = replacement.serialize()?;

        let keys = &self.inner.keys;
        let enqueue_keys = EnqueueKeys {
            queue: keys.physical(&payload.queue),
            parent: keys.physical(&payload.parent_queue),
            message: keys.physical(&keys.message_key(&payload.message_id)),
        };

        let mut conn = self.inner.conn();
        self.inner
            .scripts
            .enqueue(
                &mut conn,
                enqueue_keys,
                &payload.queue,
                &payload.message_id,
                &body,
                timestamp,
            )
            .await
    }

    /// Extends an in-flight message's lease by `seconds`, clamped to at most
    /// `visibility_timeout_ms` past the current time. Unknown ids are a
    /// no-op.
    #[instrument(
        level = "debug",
        skip_all,
        err,
        fields(
            messaging.system = telemetry::SYSTEM_NAME,
            messaging.operation = "heartbeat",
            messaging.message_id = %message_id,
            otel.kind = "consumer",
            marqs.message_id = %message_id,
        )
    )]
    pub async fn heartbeat(&self, message_id: &str, seconds: u64) -> crate::Result<()> {
        let keys = &self.inner.keys;
        // The clamp is relative to this call, not the original lease, so a
        // live consumer can keep its lease indefinitely.
        let max_deadline = now_ms() + self.inner.config.visibility_timeout_ms as i64;

        let mut conn = self.inner.conn();
        self.inner
            .scripts
            .heartbeat(
                &mut conn,
                keys.physical(&keys.visibility_timeout_key()),
                message_id,
                seconds * 1000,
                max_deadline,
            )
            .await?;
        Ok(())
    }

    /// Sets the concurrency limit of one queue. Concurrency-keyed subqueues
    /// share this limit.
    pub async fn update_queue_concurrency_limit(
        &self,
        env: &TenantEnvironment,
        queue: &str,
        limit: u32,
    ) -> crate::Result<()> {
        let keys = &self.inner.keys;
        let key = keys.physical(&keys.concurrency_limit_key(env, queue));
        let mut conn = self.inner.conn();
        let _: () = conn.set(&key, limit).await?;
        Ok(())
    }

    /// Sets the environment and organization concurrency limits from the
    /// tenant's metadata.
    pub async fn update_env_concurrency_limits(
        &self,
        env: &TenantEnvironment,
    ) -> crate::Result<()> {
        let keys = &self.inner.keys;
        let mut conn = self.inner.conn();
        self.inner
            .scripts
            .update_global_limits(
                &mut conn,
                keys.physical(&keys.env_concurrency_limit_key(env)),
                keys.physical(&keys.org_concurrency_limit_key(env)),
                env.concurrency_limit,
                env.organization_concurrency_limit,
            )
            .await
    }

    /// Number of messages waiting in one child queue.
    pub async fn length_of_queue(
        &self,
        env: &TenantEnvironment,
        queue: &str,
        concurrency_key: Option<&str>,
    ) -> crate::Result<u64> {
        let keys = &self.inner.keys;
        let key = keys.physical(&keys.queue_key(env, queue, concurrency_key));
        let mut conn = self.inner.conn();
        let length: u64 = conn.zcard(&key).await?;
        Ok(length)
    }

    /// Age in ms of the oldest message waiting in one child queue, or `None`
    /// when the queue is empty.
    pub async fn oldest_message_age(
        &self,
        env: &TenantEnvironment,
        queue: &str,
        concurrency_key: Option<&str>,
    ) -> crate::Result<Option<i64>> {
        let keys = &self.inner.keys;
        let key = keys.physical(&keys.queue_key(env, queue, concurrency_key));
        let mut conn = self.inner.conn();
        let head: Vec<(String, f64)> = conn.zrange_withscores(&key, 0, 0).await?;
        Ok(head
            .first()
            .map(|(_, score)| now_ms() - *score as i64))
    }

    /// In-flight message count for one child queue.
    pub async fn current_concurrency_of_queue(
        &self,
        env: &TenantEnvironment,
        queue: &str,
        concurrency_key: Option<&str>,
    ) -> crate::Result<u64> {
        let keys = &self.inner.keys;
        let key = keys.physical(&keys.current_concurrency_key(env, queue, concurrency_key));
        let mut conn = self.inner.conn();
        let current: u64 = conn.scard(&key).await?;
        Ok(current)
    }

    /// In-flight message count for an environment.
    pub async fn current_concurrency_of_env(
        &self,
        env: &TenantEnvironment,
    ) -> crate::Result<u64> {
        let keys = &self.inner.keys;
        let key = keys.physical(&keys.env_current_concurrency_key(env));
        let mut conn = self.inner.conn();
        let current: u64 = conn.scard(&key).await?;
        Ok(current)
    }

    /// In-flight message count for an organization.
    pub async fn current_concurrency_of_org(
        &self,
        env: &TenantEnvironment,
    ) -> crate::Result<u64> {
        let keys = &self.inner.keys;
        let key = keys.physical(&keys.org_current_concurrency_key(env));
        let mut conn = self.inner.conn();
        let current: u64 = conn.scard(&key).await?;
        Ok(current)
    }

    /// Stops the requeue workers. Idempotent; the broker remains usable for
    /// direct operations afterwards.
    pub async fn shutdown(&self) {
        if let Some(requeuer) = self.requeuer.lock().await.take() {
            requeuer.shutdown().await;
        }
    }
}
